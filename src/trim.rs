//! Final trimming, length filtering, and dereplication.
//!
//! Extended sequences still carry the half-primer stub at the front and, when
//! extension succeeded, a terminating primer at the back. Both are stripped
//! here; survivors are length-filtered and optionally collapsed into
//! dereplicated clusters, and everything that fell short is routed to the
//! discards set rather than silently dropped.

use rustc_hash::FxHashMap;

use crate::config::Params;
use crate::extend::Extension;
use crate::kmer::pack;
use crate::primer::PrimerPanel;

/// One record bound for the output FASTA.
#[derive(Debug, Clone)]
pub struct FinalRead {
    pub seq: Vec<u8>,
    /// The terminating primer bases stripped from the 3' end, when found.
    pub tp_seq: Option<Vec<u8>>,
    /// Identical sequences collapsed into this record (1 without derep).
    pub size: usize,
}

impl FinalRead {
    #[must_use]
    pub fn tp_found(&self) -> bool {
        self.tp_seq.is_some()
    }
}

/// Why a sequence was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Never reached a terminating primer and no minimum length was met.
    NoTerminatingPrimer,
    /// Shorter than the configured minimum.
    TooShort,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TrimStats {
    pub kept: usize,
    pub discarded: usize,
    pub tp_found: usize,
    pub truncated: usize,
}

/// The trimmed output split into keepers and discards.
#[derive(Debug, Default)]
pub struct TrimOutcome {
    pub kept: Vec<FinalRead>,
    pub discards: Vec<(FinalRead, DiscardReason)>,
    pub stats: TrimStats,
}

/// Strips stubs and terminators, applies the length bounds, dereplicates.
#[must_use]
pub fn trim_extensions(
    extensions: &[Extension],
    panel: &PrimerPanel,
    params: &Params,
) -> TrimOutcome {
    let stub_len = panel.forward.len() - panel.forward.len() / 2;
    let mut outcome = TrimOutcome::default();

    let mut keepers: Vec<FinalRead> = Vec::new();
    let mut discards: Vec<(FinalRead, DiscardReason)> = Vec::new();

    for extension in extensions {
        let mut seq = extension.seq.clone();
        if seq.len() <= stub_len {
            continue;
        }
        seq.drain(..stub_len);

        let tp_seq = strip_terminator(&mut seq, panel);
        if tp_seq.is_some() {
            outcome.stats.tp_found += 1;
        }

        // An explicitly bounded run truncates overlong survivors instead of
        // discarding them.
        if let (Some(_), Some(max)) = (params.min_length, params.max_length) {
            if seq.len() > max {
                seq.truncate(max);
                outcome.stats.truncated += 1;
            }
        }

        let keep = tp_seq.is_some() || params.min_length.is_some_and(|min| seq.len() >= min);
        let record = FinalRead {
            seq,
            tp_seq,
            size: 1,
        };
        if keep {
            keepers.push(record);
        } else {
            let reason = if params.min_length.is_some() {
                DiscardReason::TooShort
            } else {
                DiscardReason::NoTerminatingPrimer
            };
            discards.push((record, reason));
        }
    }

    outcome.kept = if params.derep {
        dereplicate(keepers)
    } else {
        keepers
    };
    outcome.discards = if params.derep {
        let reasons: FxHashMap<Vec<u8>, DiscardReason> = discards
            .iter()
            .map(|(read, reason)| (read.seq.clone(), *reason))
            .collect();
        dereplicate(discards.into_iter().map(|(read, _)| read).collect())
            .into_iter()
            .map(|read| {
                let reason = reasons
                    .get(&read.seq)
                    .copied()
                    .unwrap_or(DiscardReason::NoTerminatingPrimer);
                (read, reason)
            })
            .collect()
    } else {
        discards
    };

    outcome.stats.kept = outcome.kept.len();
    outcome.stats.discarded = outcome.discards.len();
    outcome
}

/// Strips the trailing terminating primer when both its core and head match
/// their variant sets. Returns the stripped bases.
fn strip_terminator(seq: &mut Vec<u8>, panel: &PrimerPanel) -> Option<Vec<u8>> {
    let role = &panel.rvs_rc;
    let tp_len = role.core_len + role.head_len;
    if seq.len() < tp_len {
        return None;
    }
    let at = seq.len() - tp_len;
    let (core, core_ok) = pack(seq, at, role.core_len);
    if !core_ok || !role.cores.contains(&core) {
        return None;
    }
    if role.head_len > 0 {
        let (head, head_ok) = pack(seq, at + role.core_len, role.head_len);
        if !head_ok || !role.has_head(head) {
            return None;
        }
    }
    let stripped = seq.split_off(at);
    Some(stripped)
}

/// Collapses identical sequences, summing their sizes; order by descending
/// abundance, then sequence, for stable output.
fn dereplicate(reads: Vec<FinalRead>) -> Vec<FinalRead> {
    let mut clusters: FxHashMap<Vec<u8>, FinalRead> = FxHashMap::default();
    for read in reads {
        clusters
            .entry(read.seq.clone())
            .and_modify(|cluster| cluster.size += read.size)
            .or_insert(read);
    }
    let mut collapsed: Vec<FinalRead> = clusters.into_values().collect();
    collapsed.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.seq.cmp(&b.seq)));
    collapsed
}
