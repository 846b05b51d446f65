//! Degenerate primer expansion.
//!
//! A primer is split into a 5' *head* and a 3' *core*. Each role (forward,
//! reverse, and their reverse complements) is expanded into the full set of
//! head and core variants: every combination of its IUPAC ambiguity codes,
//! plus every substitution of up to the allowed number of mismatched bases.
//! The packed core sets drive the read scanner's tiling membership test; the
//! head sets confirm a candidate hit.

use rustc_hash::FxHashSet;

use crate::bases::{expand_ambiguity, is_acgt, reverse_complement};
use crate::error::AmplicoraError;
use crate::kmer::pack;

/// Shortest core the head/core split will produce when the primer allows it.
pub const SHORTEST_CORE_LEN: usize = 15;

/// Number of 3' core bases pinned when a primer is heavily degenerate.
pub const DEGENERATE_CORE_TAIL: usize = 2;

/// A primer with its head/core split.
#[derive(Debug, Clone)]
pub struct Primer {
    pub seq: Vec<u8>,
    pub head_len: usize,
    pub core_len: usize,
    /// Under 80% plain ACGT bases; pins the last core bases during expansion.
    pub degenerate: bool,
}

impl Primer {
    /// Splits a primer string into head and core.
    ///
    /// The head takes up to a quarter of the primer; the core keeps at least
    /// [`SHORTEST_CORE_LEN`] bases whenever the primer is long enough.
    pub fn new(seq: &[u8]) -> Result<Self, AmplicoraError> {
        if seq.is_empty() || seq.len() > 32 {
            return Err(AmplicoraError::InvalidPrimer {
                primer: String::from_utf8_lossy(seq).into_owned(),
                details: format!("primer length {} is outside 1..=32", seq.len()),
            });
        }
        if seq.iter().any(|&b| expand_ambiguity(b).is_empty()) {
            return Err(AmplicoraError::InvalidPrimer {
                primer: String::from_utf8_lossy(seq).into_owned(),
                details: "primer contains a character outside the IUPAC alphabet".into(),
            });
        }

        let seq: Vec<u8> = seq.iter().map(u8::to_ascii_uppercase).collect();
        let head_len = (seq.len() / 4).min(seq.len().saturating_sub(SHORTEST_CORE_LEN));
        let plain = seq.iter().filter(|&&b| is_acgt(b)).count();
        let degenerate = plain * 5 < seq.len() * 4;

        Ok(Self {
            head_len,
            core_len: seq.len() - head_len,
            degenerate,
            seq,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    #[must_use]
    pub fn head(&self) -> &[u8] {
        &self.seq[..self.head_len]
    }

    #[must_use]
    pub fn core(&self) -> &[u8] {
        &self.seq[self.head_len..]
    }

    /// Minimum Hamming distance from `candidate` to any degenerate expansion
    /// of this primer. `usize::MAX` on length mismatch.
    #[must_use]
    pub fn mismatch_count(&self, candidate: &[u8]) -> usize {
        if candidate.len() != self.seq.len() {
            return usize::MAX;
        }
        candidate
            .iter()
            .zip(&self.seq)
            .filter(|(&cand, &prim)| !expand_ambiguity(prim).contains(&cand))
            .count()
    }
}

/// Enumerates every combination of a degenerate sequence's ambiguity codes.
#[must_use]
pub fn expand_degenerate(seq: &[u8]) -> Vec<Vec<u8>> {
    let mut variants: Vec<Vec<u8>> = vec![Vec::with_capacity(seq.len())];
    for &code in seq {
        let bases = expand_ambiguity(code);
        let mut next = Vec::with_capacity(variants.len() * bases.len());
        for variant in &variants {
            for &base in bases {
                let mut extended = variant.clone();
                extended.push(base);
                next.push(extended);
            }
        }
        variants = next;
    }
    variants
}

/// Adds every variant reachable with up to `mismatches` substitutions.
///
/// Positions in the final `fixed_tail` bases are never substituted; a
/// degenerate primer keeps its 3' anchor intact.
#[must_use]
pub fn expand_with_mismatches(
    exact: &[Vec<u8>],
    mismatches: usize,
    fixed_tail: usize,
) -> FxHashSet<Vec<u8>> {
    let mut variants: FxHashSet<Vec<u8>> = exact.iter().cloned().collect();
    for _ in 0..mismatches {
        let mut round: Vec<Vec<u8>> = Vec::new();
        for variant in &variants {
            let substitutable = variant.len().saturating_sub(fixed_tail);
            for pos in 0..substitutable {
                for &base in b"ACGT" {
                    if variant[pos] != base {
                        let mut substituted = variant.clone();
                        substituted[pos] = base;
                        round.push(substituted);
                    }
                }
            }
        }
        variants.extend(round);
    }
    variants
}

/// The expanded head and core sets of one primer role, packed for tiling.
#[derive(Debug, Clone)]
pub struct RoleVariants {
    pub head_len: usize,
    pub core_len: usize,
    /// Packed head variants; empty set when the head has zero length.
    pub heads: FxHashSet<u64>,
    /// Packed core variants.
    pub cores: FxHashSet<u64>,
}

impl RoleVariants {
    fn from_strings(
        heads: &FxHashSet<Vec<u8>>,
        cores: &FxHashSet<Vec<u8>>,
        head_len: usize,
        core_len: usize,
    ) -> Self {
        Self {
            head_len,
            core_len,
            heads: heads.iter().filter_map(|h| pack_exact(h)).collect(),
            cores: cores.iter().filter_map(|c| pack_exact(c)).collect(),
        }
    }

    /// Membership test for a packed head of this role's head length.
    #[must_use]
    pub fn has_head(&self, packed_head: u64) -> bool {
        self.head_len == 0 || self.heads.contains(&packed_head)
    }
}

fn pack_exact(seq: &[u8]) -> Option<u64> {
    if seq.is_empty() {
        return None;
    }
    let (packed, ok) = pack(seq, 0, seq.len());
    ok.then_some(packed)
}

/// All eight expansions of a primer pair: head and core sets for F, R, and
/// their reverse complements, plus the terminating-primer sets the extender
/// and trimmer consult.
#[derive(Debug, Clone)]
pub struct PrimerPanel {
    pub forward: Primer,
    pub reverse: Primer,
    /// F as it appears at the start of a read.
    pub fwd: RoleVariants,
    /// R as it appears at the start of a read.
    pub rvs: RoleVariants,
    /// RC(F) as it appears at the end of a read: RC(core) then RC(head).
    pub fwd_rc: RoleVariants,
    /// RC(R) as it appears at the end of a read.
    pub rvs_rc: RoleVariants,
    /// Full RC(R) variants packed at full primer length; hitting one of
    /// these at the growing 3' end terminates an extension.
    pub terminating: FxHashSet<u64>,
}

impl PrimerPanel {
    /// Expands a primer pair with the given per-role mismatch allowances.
    pub fn build(
        forward: &[u8],
        reverse: &[u8],
        mismatches_fwd: usize,
        mismatches_rvs: usize,
    ) -> Result<Self, AmplicoraError> {
        let forward = Primer::new(forward)?;
        let reverse = Primer::new(reverse)?;

        let fwd_sets = expand_role(&forward, mismatches_fwd);
        let rvs_sets = expand_role(&reverse, mismatches_rvs);

        let fwd = RoleVariants::from_strings(
            &fwd_sets.heads,
            &fwd_sets.cores,
            forward.head_len,
            forward.core_len,
        );
        let rvs = RoleVariants::from_strings(
            &rvs_sets.heads,
            &rvs_sets.cores,
            reverse.head_len,
            reverse.core_len,
        );
        let fwd_rc = rc_role(&fwd_sets, forward.head_len, forward.core_len);
        let rvs_rc = rc_role(&rvs_sets, reverse.head_len, reverse.core_len);

        let terminating = rvs_sets
            .full
            .iter()
            .map(|variant| reverse_complement(variant))
            .filter_map(|rc| pack_exact(&rc))
            .collect();

        Ok(Self {
            forward,
            reverse,
            fwd,
            rvs,
            fwd_rc,
            rvs_rc,
            terminating,
        })
    }

    /// Shortest head across both start roles; scanning begins at this index.
    #[must_use]
    pub fn min_head_len(&self) -> usize {
        self.fwd.head_len.min(self.rvs.head_len)
    }
}

struct RoleSets {
    heads: FxHashSet<Vec<u8>>,
    cores: FxHashSet<Vec<u8>>,
    full: FxHashSet<Vec<u8>>,
}

fn expand_role(primer: &Primer, mismatches: usize) -> RoleSets {
    let fixed_tail = if primer.degenerate {
        DEGENERATE_CORE_TAIL
    } else {
        0
    };
    let heads = expand_with_mismatches(&expand_degenerate(primer.head()), mismatches, 0);
    let cores = expand_with_mismatches(&expand_degenerate(primer.core()), mismatches, fixed_tail);
    let full = expand_with_mismatches(&expand_degenerate(&primer.seq), mismatches, fixed_tail);
    RoleSets { heads, cores, full }
}

/// RC role sets: RC(head+core) reads as RC(core) followed by RC(head), so
/// the role's "core" set holds reverse-complemented cores and its "head" set
/// reverse-complemented heads, to be matched after the core.
fn rc_role(sets: &RoleSets, head_len: usize, core_len: usize) -> RoleVariants {
    let heads: FxHashSet<Vec<u8>> = sets.heads.iter().map(|h| reverse_complement(h)).collect();
    let cores: FxHashSet<Vec<u8>> = sets.cores.iter().map(|c| reverse_complement(c)).collect();
    RoleVariants::from_strings(&heads, &cores, head_len, core_len)
}
