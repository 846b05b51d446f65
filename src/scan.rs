//! Primer occurrence scanning.
//!
//! Tiles every read with packed candidate primer cores and tests them
//! against the expanded core sets, confirming hits with the adjacent head
//! and an overall mismatch bound. Reads are tagged by the primer role they
//! carry and trimmed to the primer edge, so everything downstream sees
//! primer-aligned sequence.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Mutex;

use crate::bases::{reverse_complement, Read};
use crate::config::Params;
use crate::kmer::pack;
use crate::primer::{PrimerPanel, RoleVariants};

/// Which primer a read carries, and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimerRole {
    /// Forward primer at the start (an FP read; extension seed).
    ForwardStart,
    /// Reverse primer at the start (an RP read; opposite-direction seed).
    ReverseStart,
    /// RC of the forward primer at the end (an FP' read).
    ForwardEnd,
    /// RC of the reverse primer at the end (an RP' read).
    ReverseEnd,
}

impl PrimerRole {
    pub const ALL: [Self; 4] = [
        Self::ForwardStart,
        Self::ReverseStart,
        Self::ForwardEnd,
        Self::ReverseEnd,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::ForwardStart => 0,
            Self::ReverseStart => 1,
            Self::ForwardEnd => 2,
            Self::ReverseEnd => 3,
        }
    }

    /// Starting roles match at the 5' edge of the read.
    #[must_use]
    pub fn at_start(self) -> bool {
        matches!(self, Self::ForwardStart | Self::ReverseStart)
    }
}

/// One confirmed primer hit.
#[derive(Debug, Clone, Copy)]
pub struct PrimerHit {
    pub role: PrimerRole,
    /// Position of this read within its role's list.
    pub list_offset: usize,
}

/// Everything the scanner learned about one file-of-pair.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Read index -> confirmed hit.
    pub hits: FxHashMap<usize, PrimerHit>,
    /// Read indexes per role, in scan order.
    pub by_role: [Vec<usize>; 4],
    /// Matched primer forms (primer orientation) with occurrence counts.
    pub observed: FxHashMap<Vec<u8>, u64>,
}

impl ScanResult {
    #[must_use]
    pub fn role_reads(&self, role: PrimerRole) -> &[usize] {
        &self.by_role[role.index()]
    }

    #[must_use]
    pub fn total_hits(&self) -> usize {
        self.hits.len()
    }
}

struct LocalHit {
    read_idx: usize,
    role: PrimerRole,
    observed: Vec<u8>,
}

/// Scans one file-of-pair, trimming tagged reads to their primer edge.
///
/// Parallel over read partitions; each worker accumulates hits locally and
/// merges them under a single lock, adjusting list offsets as roles grow.
pub fn scan_reads(
    reads: &mut [Option<Read>],
    panel: &PrimerPanel,
    params: &Params,
) -> ScanResult {
    let scan_start = panel.min_head_len();
    let chunk = params.reads_in_batch.max(1);
    let merged: Mutex<Vec<LocalHit>> = Mutex::new(Vec::new());

    let base_indexes: Vec<usize> = (0..reads.len()).collect();
    reads
        .par_chunks_mut(chunk)
        .zip(base_indexes.par_chunks(chunk))
        .for_each(|(slice, indexes)| {
            let mut local = Vec::new();
            for (read, &read_idx) in slice.iter_mut().zip(indexes) {
                let Some(read) = read.as_mut() else { continue };
                if let Some(hit) = scan_one(read, panel, params, scan_start) {
                    local.push(LocalHit {
                        read_idx,
                        role: hit.0,
                        observed: hit.1,
                    });
                }
            }
            if !local.is_empty() {
                let mut guard = merged.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                guard.append(&mut local);
            }
        });

    let mut hits = merged.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
    hits.sort_by_key(|hit| hit.read_idx);

    let mut result = ScanResult::default();
    for hit in hits {
        let list = &mut result.by_role[hit.role.index()];
        result.hits.insert(
            hit.read_idx,
            PrimerHit {
                role: hit.role,
                list_offset: list.len(),
            },
        );
        list.push(hit.read_idx);
        *result.observed.entry(hit.observed).or_insert(0) += 1;
    }
    result
}

/// Scans one read; on a confirmed hit, trims it and reports the role and
/// the matched primer form in primer orientation.
fn scan_one(
    read: &mut Read,
    panel: &PrimerPanel,
    params: &Params,
    scan_start: usize,
) -> Option<(PrimerRole, Vec<u8>)> {
    let len = read.len();

    for i in scan_start..len {
        // Start roles: head precedes the core.
        if let Some(observed) = try_start_role(read, &panel.fwd, &panel.forward, params.mismatches_fwd, i)
        {
            read.trim(i - panel.fwd.head_len, len);
            return Some((PrimerRole::ForwardStart, observed));
        }
        if let Some(observed) = try_start_role(read, &panel.rvs, &panel.reverse, params.mismatches_rvs, i)
        {
            read.trim(i - panel.rvs.head_len, len);
            return Some((PrimerRole::ReverseStart, observed));
        }
        // End roles: RC layout, head follows the core.
        if let Some(observed) = try_end_role(read, &panel.fwd_rc, &panel.forward, params.mismatches_fwd, i)
        {
            read.trim(0, i + panel.fwd_rc.core_len + panel.fwd_rc.head_len);
            return Some((PrimerRole::ForwardEnd, observed));
        }
        if let Some(observed) = try_end_role(read, &panel.rvs_rc, &panel.reverse, params.mismatches_rvs, i)
        {
            read.trim(0, i + panel.rvs_rc.core_len + panel.rvs_rc.head_len);
            return Some((PrimerRole::ReverseEnd, observed));
        }
    }
    None
}

fn try_start_role(
    read: &Read,
    role: &RoleVariants,
    primer: &crate::primer::Primer,
    mismatches: usize,
    core_at: usize,
) -> Option<Vec<u8>> {
    if core_at < role.head_len || core_at + role.core_len > read.len() {
        return None;
    }
    let (core, ok) = pack(&read.seq, core_at, role.core_len);
    if !ok || !role.cores.contains(&core) {
        return None;
    }
    if role.head_len > 0 {
        let (head, ok) = pack(&read.seq, core_at - role.head_len, role.head_len);
        if !ok || !role.has_head(head) {
            return None;
        }
    }
    let candidate = &read.seq[core_at - role.head_len..core_at + role.core_len];
    (primer.mismatch_count(candidate) <= mismatches).then(|| candidate.to_vec())
}

fn try_end_role(
    read: &Read,
    role: &RoleVariants,
    primer: &crate::primer::Primer,
    mismatches: usize,
    core_at: usize,
) -> Option<Vec<u8>> {
    let end = core_at + role.core_len + role.head_len;
    if end > read.len() {
        return None;
    }
    let (core, ok) = pack(&read.seq, core_at, role.core_len);
    if !ok || !role.cores.contains(&core) {
        return None;
    }
    if role.head_len > 0 {
        let (head, ok) = pack(&read.seq, core_at + role.core_len, role.head_len);
        if !ok || !role.has_head(head) {
            return None;
        }
    }
    // Compare in primer orientation.
    let candidate = reverse_complement(&read.seq[core_at..end]);
    (primer.mismatch_count(&candidate) <= mismatches).then_some(candidate)
}
