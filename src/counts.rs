//! Canonical k-mer depth table.
//!
//! Built once over the selected reads by tallying both strand orientations
//! into a shared [`DashMap`], then frozen into a plain map for the read-only
//! consumers. The denoiser zeroes entries in place rather than removing
//! them, so a culled k-mer still answers lookups with depth 0.

use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::hash::BuildHasherDefault;

use crate::config::Params;
use crate::kmer::{canonical, generate_from_read};
use crate::select::SelectedRead;

/// A [`DashMap`] keyed by packed k-mers with [`FxHasher`].
pub type DashFx<V> = DashMap<u64, V, BuildHasherDefault<FxHasher>>;

/// Canonical k-mer -> depth over the selected reads.
#[derive(Debug, Default)]
pub struct KmerCountTable {
    k: usize,
    counts: FxHashMap<u64, u32>,
    /// Canonical k-mers seen in only one strand orientation; a weak error
    /// signal the denoiser folds into its cull decisions.
    unbalanced: FxHashSet<u64>,
}

impl KmerCountTable {
    /// Tallies every selected read in its as-read orientation.
    #[must_use]
    pub fn build(selected: &[SelectedRead], params: &Params) -> Self {
        let k = params.kmer_len;
        let tally: DashFx<(u32, u32)> = DashMap::with_hasher(BuildHasherDefault::default());

        selected.par_iter().for_each(|read| {
            let array = generate_from_read(&read.seq, k);
            for (&kmer, &ok) in array.kmers.iter().zip(&array.valid) {
                if !ok {
                    continue;
                }
                let canon = canonical(kmer, k);
                let mut entry = tally.entry(canon).or_insert((0, 0));
                if kmer == canon {
                    entry.0 = entry.0.saturating_add(1);
                } else {
                    entry.1 = entry.1.saturating_add(1);
                }
            }
        });

        let mut counts = FxHashMap::default();
        let mut unbalanced = FxHashSet::default();
        for (canon, (as_canonical, as_rc)) in tally {
            counts.insert(canon, as_canonical + as_rc);
            if as_canonical.min(as_rc) == 0 {
                unbalanced.insert(canon);
            }
        }

        Self {
            k,
            counts,
            unbalanced,
        }
    }

    /// Depth of a k-mer in either orientation.
    #[inline]
    #[must_use]
    pub fn depth(&self, kmer: u64) -> u32 {
        self.counts
            .get(&canonical(kmer, self.k))
            .copied()
            .unwrap_or(0)
    }

    /// `true` when the k-mer was only ever seen in one strand orientation.
    #[inline]
    #[must_use]
    pub fn is_unbalanced(&self, kmer: u64) -> bool {
        self.unbalanced.contains(&canonical(kmer, self.k))
    }

    /// Zeroes a k-mer's depth without removing the entry.
    pub fn zero(&mut self, kmer: u64) {
        if let Some(count) = self.counts.get_mut(&canonical(kmer, self.k)) {
            *count = 0;
        }
    }

    /// Bumps a k-mer's depth; the starting-read cleaner uses this to keep
    /// the table aligned with corrected bases.
    pub fn bump(&mut self, kmer: u64, delta: i32) {
        let canon = canonical(kmer, self.k);
        let entry = self.counts.entry(canon).or_insert(0);
        *entry = entry.saturating_add_signed(delta);
    }

    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of k-mers with a non-zero depth.
    #[must_use]
    pub fn live_kmers(&self) -> usize {
        self.counts.values().filter(|&&count| count > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bases::reverse_complement;
    use crate::kmer::pack;

    fn soup(len: usize, salt: u64) -> Vec<u8> {
        let mut state = 0x2545_f491_4f6c_dd1du64.wrapping_mul(salt + 1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                b"ACGT"[(state % 4) as usize]
            })
            .collect()
    }

    fn selected(seqs: Vec<Vec<u8>>) -> Vec<SelectedRead> {
        seqs.into_iter()
            .enumerate()
            .map(|(i, seq)| SelectedRead {
                file: 0,
                read_idx: i,
                seq,
                role: None,
            })
            .collect()
    }

    #[test]
    fn counts_both_orientations_together() {
        let params = Params::default();
        let region = soup(100, 1);
        let reads = selected(vec![region.clone(), reverse_complement(&region)]);
        let table = KmerCountTable::build(&reads, &params);

        let (kmer, ok) = pack(&region, 10, 32);
        assert!(ok);
        assert_eq!(table.depth(kmer), 2);
        assert_eq!(table.depth(crate::kmer::reverse_complement(kmer, 32)), 2);
        assert!(!table.is_unbalanced(kmer));
    }

    #[test]
    fn one_sided_kmer_flagged_unbalanced() {
        let params = Params::default();
        let region = soup(100, 2);
        let reads = selected(vec![region.clone()]);
        let table = KmerCountTable::build(&reads, &params);

        let (kmer, ok) = pack(&region, 0, 32);
        assert!(ok);
        assert_eq!(table.depth(kmer), 1);
        assert!(table.is_unbalanced(kmer));
    }

    #[test]
    fn zero_keeps_entry() {
        let params = Params::default();
        let region = soup(100, 3);
        let reads = selected(vec![region.clone()]);
        let mut table = KmerCountTable::build(&reads, &params);

        let (kmer, _) = pack(&region, 5, 32);
        let total = table.len();
        table.zero(kmer);
        assert_eq!(table.depth(kmer), 0);
        assert_eq!(table.len(), total);
        assert_eq!(table.live_kmers(), total - 1);
    }

    #[test]
    fn bump_adjusts_depth() {
        let params = Params::default();
        let region = soup(100, 4);
        let reads = selected(vec![region.clone()]);
        let mut table = KmerCountTable::build(&reads, &params);

        let (kmer, _) = pack(&region, 7, 32);
        table.bump(kmer, 3);
        assert_eq!(table.depth(kmer), 4);
        table.bump(kmer, -4);
        assert_eq!(table.depth(kmer), 0);
    }

    #[test]
    fn ambiguous_windows_not_counted() {
        let params = Params::default();
        let mut region = soup(100, 5);
        region[50] = b'N';
        let reads = selected(vec![region]);
        let table = KmerCountTable::build(&reads, &params);
        // 69 windows total, 32 of them span the N.
        assert_eq!(table.len(), 37);
    }
}
