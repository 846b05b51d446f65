//! Per-length context frequency tables.
//!
//! For every quantized context length the table maps context fingerprints to
//! how often that context was seen across the selected reads, both strands.
//! The extender consults these to ask "has this neighbourhood been read
//! before, and how often?" at several scales. Windows crossing a k-mer the
//! denoiser zeroed are not counted.

use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::hash::BuildHasherDefault;

use crate::bases::reverse_complement;
use crate::config::Params;
use crate::counts::{DashFx, KmerCountTable};
use crate::kmer::generate_from_read;
use crate::region::quantized_lengths;
use crate::select::SelectedRead;

/// Keep a length's table only while it holds at least this share of the most
/// populous table.
const MIN_POPULATION_PERCENT: usize = 70;

/// Frozen context tables, one per retained length.
#[derive(Debug, Default)]
pub struct ContextTables {
    lengths: Vec<usize>,
    tables: Vec<FxHashMap<u64, u32>>,
}

impl ContextTables {
    /// Tiles every selected read (and its reverse complement) at every
    /// quantized length, then drops the sparse longest tables.
    #[must_use]
    pub fn build(selected: &[SelectedRead], table: &KmerCountTable, params: &Params) -> Self {
        let longest = selected.iter().map(|r| r.seq.len()).max().unwrap_or(0);
        let lengths = quantized_lengths(
            params.shortest_context_size,
            params.context_stride,
            longest,
        );
        if lengths.is_empty() {
            return Self::default();
        }

        let tallies: Vec<DashFx<u32>> = lengths
            .iter()
            .map(|_| DashMap::with_hasher(BuildHasherDefault::default()))
            .collect();

        selected.par_iter().for_each(|read| {
            tile_read(&read.seq, &lengths, params, table, &tallies);
            tile_read(
                &reverse_complement(&read.seq),
                &lengths,
                params,
                table,
                &tallies,
            );
        });

        let mut tables: Vec<FxHashMap<u64, u32>> = tallies
            .into_iter()
            .map(|tally| tally.into_iter().collect())
            .collect();

        // Drop the longest tables that never filled out.
        let richest = tables.iter().map(FxHashMap::len).max().unwrap_or(0);
        let mut keep = tables.len();
        while keep > 1 && tables[keep - 1].len() * 100 < richest * MIN_POPULATION_PERCENT {
            keep -= 1;
        }
        tables.truncate(keep);
        let lengths = lengths[..keep].to_vec();

        Self { lengths, tables }
    }

    /// The retained context lengths, ascending.
    #[must_use]
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Count for a fingerprint at the given length slot.
    #[inline]
    #[must_use]
    pub fn count(&self, slot: usize, fingerprint: u64) -> u32 {
        self.tables
            .get(slot)
            .and_then(|table| table.get(&fingerprint))
            .copied()
            .unwrap_or(0)
    }

    /// Index of the longest retained length that fits `available` bases.
    #[must_use]
    pub fn longest_fitting(&self, available: usize) -> Option<usize> {
        self.lengths.iter().rposition(|&l| l <= available)
    }

    /// Adjusts fingerprint counts after a single-base substitution at `pos`:
    /// windows over the old sequence are decremented, the same windows over
    /// the new sequence incremented. Keeps the tables aligned with reads the
    /// cleaner corrected.
    pub fn apply_substitution(&mut self, before: &[u8], after: &[u8], pos: usize, k: usize) {
        for (slot, &len) in self.lengths.clone().iter().enumerate() {
            let starts = pos.saturating_sub(len - 1)..=pos.min(before.len().saturating_sub(len));
            for start in starts {
                if start + len > before.len() {
                    continue;
                }
                if let Some(fp) = crate::context::hash_context(before, start, len, k) {
                    if let Some(count) = self.tables[slot].get_mut(&fp) {
                        *count = count.saturating_sub(1);
                    }
                }
                if let Some(fp) = crate::context::hash_context(after, start, len, k) {
                    *self.tables[slot].entry(fp).or_insert(0) += 1;
                }
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// One read's windows at every length, via an incremental prefix hash per
/// start offset.
fn tile_read(
    seq: &[u8],
    lengths: &[usize],
    params: &Params,
    table: &KmerCountTable,
    tallies: &[DashFx<u32>],
) {
    let k = params.kmer_len;
    let array = generate_from_read(seq, k);
    if array.is_empty() {
        return;
    }
    let shortest = lengths[0];
    let stride = params.context_stride.max(1);

    // live[i]: the k-mer starting at i is valid and survived denoising.
    let live: Vec<bool> = array
        .kmers
        .iter()
        .zip(&array.valid)
        .map(|(&kmer, &ok)| ok && table.depth(kmer) > 0)
        .collect();
    // dead_before[i]: count of dead k-mer starts in [0, i).
    let mut dead_before = vec![0u32; live.len() + 1];
    for (i, &ok) in live.iter().enumerate() {
        dead_before[i + 1] = dead_before[i] + u32::from(!ok);
    }

    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    for start in 0..seq.len() {
        if seq.len() - start < shortest {
            break;
        }
        let mut hash = FNV_OFFSET;
        for (i, &base) in seq[start..].iter().enumerate() {
            hash ^= u64::from(base);
            hash = hash.wrapping_mul(FNV_PRIME);
            let len = i + 2;
            if start + len > seq.len() {
                break;
            }
            if len < shortest || (len - shortest) % stride != 0 {
                continue;
            }
            let slot = (len - shortest) / stride;
            if slot >= tallies.len() {
                break;
            }
            // Every k-mer window inside the context must be live.
            let last_at = start + len - k;
            if dead_before[last_at + 1] - dead_before[start] > 0 {
                continue;
            }
            let folded = (hash ^ hash >> 32) as u32;
            let fp = u64::from(folded) << 32 | array.kmers[last_at] & 0xFFFF_FFFF;
            *tallies[slot].entry(fp).or_insert(0) += 1;
        }
    }
}
