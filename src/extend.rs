//! Context-guided read extension.
//!
//! Each starting read grows one base at a time. The depth table proposes the
//! next base; the context tables, read coverage, and paired-read constraints
//! arbitrate when more than one base is plausible; and when everything else
//! ties, the fork is explored recursively and — as a last resort — settled
//! by a depth-weighted coin toss. Extension stops at the reverse primer's
//! reverse complement (the terminating primer), at the length cap, on a
//! loop, or when no base clears the depth floor.

use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::{FxHashSet, FxHasher};
use std::hash::BuildHasherDefault;

use crate::bases::reverse_complement;
use crate::config::Params;
use crate::contexts::ContextTables;
use crate::counts::KmerCountTable;
use crate::kmer::{generate_from_read, pack, reverse_complement as rc_kmer, shift_append};
use crate::primer::PrimerPanel;
use crate::rng::CoinToss;
use crate::select::{ReadPairIndex, SelectedRead};
use crate::starts::{ReadStartIndex, StartingRead};

/// Positions between the two k-mers XOR-combined into a loop-trap code.
const LOOP_TRAP_LENGTH: usize = 32;

/// Coverage share a TP-reaching trial must win by to avoid the coin toss.
const TP_RANK_PERCENT: usize = 90;

/// Length cap when the caller did not bound the amplicon.
const DEFAULT_MAX_EXTENSION: usize = 4000;

/// The outcome of extending one starting read.
#[derive(Debug, Clone)]
pub struct Extension {
    pub seq: Vec<u8>,
    /// The terminating primer was found at the 3' end.
    pub tp_reached: bool,
    /// A coin toss decided at least one fork on this path.
    pub coin_tossed: bool,
    /// Extension stopped early: loop trap, length cap, or a dead end.
    pub abandoned: bool,
}

#[derive(Debug, Clone)]
struct CachedExtension {
    seq: Vec<u8>,
    tp_reached: bool,
    abandoned: bool,
}

type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;

pub struct Extender<'a> {
    params: &'a Params,
    table: &'a KmerCountTable,
    contexts: &'a ContextTables,
    starts: &'a ReadStartIndex,
    selected: &'a [SelectedRead],
    pairs: &'a ReadPairIndex,
    panel: &'a PrimerPanel,
    rng: &'a CoinToss,
    longest_read: usize,
    /// Prospective sequence -> its fully extended form. Write-once; entries
    /// reached through a coin toss are never inserted.
    cached_extensions: FxDashMap<Vec<u8>, CachedExtension>,
    /// Packed k-mer -> selected reads containing it, built lazily.
    cached_reads_containing: FxDashMap<u64, Vec<u32>>,
}

struct RunningDepth {
    count: u64,
    sum: u64,
    inv_sum: f64,
    last: u32,
}

impl RunningDepth {
    fn from_seq(seq: &[u8], table: &KmerCountTable, k: usize) -> Self {
        let array = generate_from_read(seq, k);
        let mut this = Self {
            count: 0,
            sum: 0,
            inv_sum: 0.0,
            last: 0,
        };
        for (&kmer, &ok) in array.kmers.iter().zip(&array.valid) {
            if ok {
                this.push(table.depth(kmer));
            }
        }
        this
    }

    fn push(&mut self, depth: u32) {
        if depth > 0 {
            self.count += 1;
            self.sum += u64::from(depth);
            self.inv_sum += 1.0 / f64::from(depth);
        }
        self.last = depth;
    }

    /// Running harmonic mean of accepted depths.
    fn harmonic(&self) -> f64 {
        if self.count == 0 || self.inv_sum == 0.0 {
            0.0
        } else {
            self.count as f64 / self.inv_sum
        }
    }

    /// Running arithmetic mean of accepted depths.
    fn arithmetic(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

impl<'a> Extender<'a> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        params: &'a Params,
        table: &'a KmerCountTable,
        contexts: &'a ContextTables,
        starts: &'a ReadStartIndex,
        selected: &'a [SelectedRead],
        pairs: &'a ReadPairIndex,
        panel: &'a PrimerPanel,
        rng: &'a CoinToss,
    ) -> Self {
        let longest_read = selected.iter().map(|r| r.seq.len()).max().unwrap_or(0);
        Self {
            params,
            table,
            contexts,
            starts,
            selected,
            pairs,
            panel,
            rng,
            longest_read,
            cached_extensions: DashMap::with_hasher(BuildHasherDefault::default()),
            cached_reads_containing: DashMap::with_hasher(BuildHasherDefault::default()),
        }
    }

    /// Extends every starting read; each is an independent task.
    #[must_use]
    pub fn extend_all(&self, starting: &[StartingRead]) -> Vec<Extension> {
        starting
            .par_iter()
            .map(|read| self.extend_read(read.seq.clone(), 1, 0))
            .collect()
    }

    /// Recursive base-at-a-time extension.
    ///
    /// `level` is the fork-recursion depth; `bases_since_fork` relaxes the
    /// recursion cap when long unambiguous stretches separate the forks.
    fn extend_read(&self, seq: Vec<u8>, level: usize, bases_since_fork: usize) -> Extension {
        let k = self.params.kmer_len;
        if seq.len() < k {
            return Extension {
                seq,
                tp_reached: false,
                coin_tossed: false,
                abandoned: true,
            };
        }

        if let Some(cached) = self.cached_extensions.get(&seq) {
            return Extension {
                seq: cached.seq.clone(),
                tp_reached: cached.tp_reached,
                coin_tossed: false,
                abandoned: cached.abandoned,
            };
        }
        let entry_seq = seq.clone();

        let max_len = self.params.max_length.unwrap_or(DEFAULT_MAX_EXTENSION);
        let mut seq = seq;
        let mut running = RunningDepth::from_seq(&seq, self.table, k);
        let mut trap = loop_trap_of(&seq, k);
        let mut bases_since_fork = bases_since_fork;
        let mut coin_tossed = false;

        let outcome = loop {
            if self.ends_with_terminator(&seq) {
                break Extension {
                    seq,
                    tp_reached: true,
                    coin_tossed,
                    abandoned: false,
                };
            }
            if seq.len() >= max_len {
                break Extension {
                    seq,
                    tp_reached: false,
                    coin_tossed,
                    abandoned: true,
                };
            }

            let floor = self.min_depth_for_read(&running);
            let candidates = self.viable_candidates(&seq, floor);
            match candidates.len() {
                0 => {
                    break Extension {
                        seq,
                        tp_reached: false,
                        coin_tossed,
                        abandoned: true,
                    };
                }
                1 => {
                    let (base, kmer, depth) = candidates[0];
                    if !self.accept_base(&mut seq, &mut trap, base, kmer, k) {
                        break Extension {
                            seq,
                            tp_reached: false,
                            coin_tossed,
                            abandoned: true,
                        };
                    }
                    running.push(depth);
                    bases_since_fork += 1;
                }
                _ => {
                    // A fork. Cheaper arbiters first; recursion as the last
                    // resort.
                    let survivors = self.resolve_by_context(&seq, &candidates);
                    if let Resolution::Chosen(at) = survivors {
                        let (base, kmer, depth) = candidates[at];
                        if !self.accept_base(&mut seq, &mut trap, base, kmer, k) {
                            break Extension {
                                seq,
                                tp_reached: false,
                                coin_tossed,
                                abandoned: true,
                            };
                        }
                        running.push(depth);
                        bases_since_fork = 0;
                        continue;
                    }
                    let Resolution::Ambiguous(active) = survivors else {
                        unreachable!()
                    };

                    if let Some(at) = self.resolve_by_coverage(&seq, &candidates, &active) {
                        let (base, kmer, depth) = candidates[at];
                        if !self.accept_base(&mut seq, &mut trap, base, kmer, k) {
                            break Extension {
                                seq,
                                tp_reached: false,
                                coin_tossed,
                                abandoned: true,
                            };
                        }
                        running.push(depth);
                        bases_since_fork = 0;
                        continue;
                    }

                    if let Some(at) = self.resolve_by_pairs(&seq, &candidates, &active) {
                        let (base, kmer, depth) = candidates[at];
                        if !self.accept_base(&mut seq, &mut trap, base, kmer, k) {
                            break Extension {
                                seq,
                                tp_reached: false,
                                coin_tossed,
                                abandoned: true,
                            };
                        }
                        running.push(depth);
                        bases_since_fork = 0;
                        continue;
                    }

                    break self.resolve_by_recursion(
                        seq,
                        &candidates,
                        &active,
                        level,
                        bases_since_fork,
                        coin_tossed,
                    );
                }
            }
        };

        if !outcome.coin_tossed {
            self.cached_extensions
                .entry(entry_seq)
                .or_insert_with(|| CachedExtension {
                    seq: outcome.seq.clone(),
                    tp_reached: outcome.tp_reached,
                    abandoned: outcome.abandoned,
                });
        }
        outcome
    }

    /// `max(minDepth, min(harmonic/10, lastAccepted/10))`.
    fn min_depth_for_read(&self, running: &RunningDepth) -> u32 {
        let harmonic = running.harmonic() / 10.0;
        let last = f64::from(running.last) / 10.0;
        let dynamic = harmonic.min(last).floor();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let dynamic = if dynamic.is_finite() && dynamic > 0.0 {
            dynamic as u32
        } else {
            0
        };
        dynamic.max(self.params.min_depth)
    }

    /// The next-base candidates that clear the depth floor and whose
    /// shortest fitting context has been seen.
    fn viable_candidates(&self, seq: &[u8], floor: u32) -> Vec<(u8, u64, u32)> {
        let k = self.params.kmer_len;
        let (last_kmer, ok) = pack(seq, seq.len() - k, k);
        if !ok {
            return Vec::new();
        }

        let by_depth: Vec<(u8, u64, u32)> = (0..4u8)
            .filter_map(|bits| {
                let next = shift_append(last_kmer, k, bits);
                let depth = self.table.depth(next);
                (depth >= floor).then_some((bits, next, depth))
            })
            .collect();

        let context_floor = (floor / 2).max(1);
        let with_context: Vec<(u8, u64, u32)> = by_depth
            .iter()
            .copied()
            .filter(|&(_, next, _)| self.context_count(seq, next) >= context_floor)
            .collect();

        // A single depth-viable candidate stands even on thin context.
        if with_context.is_empty()
            && by_depth.len() == 1
            && self.context_count(seq, by_depth[0].1) >= 1
        {
            return by_depth;
        }
        with_context
    }

    /// Count of the shortest context that fits `seq` plus the candidate base.
    fn context_count(&self, seq: &[u8], next_kmer: u64) -> u32 {
        let Some(&shortest) = self.contexts.lengths().first() else {
            return 1;
        };
        if seq.len() + 1 < shortest {
            return 1;
        }
        let start = seq.len() + 1 - shortest;
        let fp = crate::context::hash_context_variant(seq, start, shortest, next_kmer);
        self.contexts.count(0, fp)
    }

    /// Appends the chosen base, watching the loop trap.
    fn accept_base(
        &self,
        seq: &mut Vec<u8>,
        trap: &mut FxHashSet<u64>,
        base_bits: u8,
        new_kmer: u64,
        k: usize,
    ) -> bool {
        seq.push(crate::bases::decode_base(u64::from(base_bits)));
        let len = seq.len();
        if len < k + LOOP_TRAP_LENGTH {
            return true;
        }
        let (earlier, ok) = pack(seq, len - k - LOOP_TRAP_LENGTH, k);
        if !ok {
            return true;
        }
        trap.insert(new_kmer ^ earlier)
    }

    /// Descending context lengths; a clear single survivor wins, two or more
    /// still standing falls through to the coverage arbiters.
    fn resolve_by_context(&self, seq: &[u8], candidates: &[(u8, u64, u32)]) -> Resolution {
        let Some(longest) = self.contexts.longest_fitting(seq.len() + 1) else {
            return Resolution::Ambiguous((0..candidates.len()).collect());
        };

        for slot in (0..=longest).rev() {
            let len = self.contexts.lengths()[slot];
            let start = seq.len() + 1 - len;
            let counts: Vec<u32> = candidates
                .iter()
                .map(|&(_, next, _)| {
                    let fp = crate::context::hash_context_variant(seq, start, len, next);
                    self.contexts.count(slot, fp)
                })
                .collect();

            let active: Vec<usize> = (0..candidates.len())
                .filter(|&i| counts[i] > 0)
                .collect();
            if active.len() >= 2 {
                return Resolution::Ambiguous(active);
            }
            if let [only] = active[..] {
                if counts[only] > 1 {
                    // Peek at the next shorter length: support must not fall
                    // away as the window tightens.
                    let peek = slot.checked_sub(1).map_or(counts[only], |shorter| {
                        let len = self.contexts.lengths()[shorter];
                        let start = seq.len() + 1 - len;
                        let fp = crate::context::hash_context_variant(
                            seq,
                            start,
                            len,
                            candidates[only].1,
                        );
                        self.contexts.count(shorter, fp)
                    });
                    if peek >= counts[only] {
                        return Resolution::Chosen(only);
                    }
                }
            }
        }
        Resolution::Ambiguous((0..candidates.len()).collect())
    }

    /// A variant uniquely covered end-to-end by actual reads wins.
    fn resolve_by_coverage(
        &self,
        seq: &[u8],
        candidates: &[(u8, u64, u32)],
        active: &[usize],
    ) -> Option<usize> {
        let mut fully_covered: Vec<usize> = Vec::new();
        for &at in active {
            let mut prospective = seq.to_vec();
            prospective.push(crate::bases::decode_base(u64::from(candidates[at].0)));
            if self.singly_covered(&prospective) || self.collectively_covered(&prospective) {
                fully_covered.push(at);
            }
        }
        if let [winner] = fully_covered[..] {
            Some(winner)
        } else {
            None
        }
    }

    /// One read of at most read length covers the whole trailing window.
    fn singly_covered(&self, prospective: &[u8]) -> bool {
        let window_len = prospective.len().min(self.longest_read);
        if window_len < self.params.kmer_len {
            return false;
        }
        let window = &prospective[prospective.len() - window_len..];
        self.window_in_reads(window)
    }

    /// Both halves of the trailing window appear in reads.
    fn collectively_covered(&self, prospective: &[u8]) -> bool {
        let window_len = prospective.len().min(self.longest_read);
        if window_len < 2 * self.params.kmer_len {
            return false;
        }
        let window = &prospective[prospective.len() - window_len..];
        let mid = window.len() / 2;
        self.window_in_reads(&window[..mid + self.params.kmer_len / 2])
            && self.window_in_reads(&window[mid - self.params.kmer_len / 2..])
    }

    /// Does any selected read contain this window, in either orientation?
    fn window_in_reads(&self, window: &[u8]) -> bool {
        let k = self.params.kmer_len;
        if window.len() < k {
            return false;
        }
        let (first, ok) = pack(window, 0, k);
        if !ok {
            return false;
        }
        for &idx in self.starts.reads_starting_with(first) {
            let read = &self.selected[idx as usize].seq;
            if contains_subsequence(read, window) {
                return true;
            }
            let rc = reverse_complement(read);
            if contains_subsequence(&rc, window) {
                return true;
            }
        }
        false
    }

    /// Backward paired-read check: mates of reads anchored at the far end of
    /// the prospective sequence must lay down coverage all the way back.
    fn resolve_by_pairs(
        &self,
        seq: &[u8],
        candidates: &[(u8, u64, u32)],
        active: &[usize],
    ) -> Option<usize> {
        if seq.len() <= self.longest_read.max(self.params.paired_read_kml) || self.pairs.is_empty() {
            return None;
        }
        let mut full: Vec<usize> = Vec::new();
        for &at in active {
            let mut prospective = seq.to_vec();
            prospective.push(crate::bases::decode_base(u64::from(candidates[at].0)));
            if self.paired_coverage(&prospective) == prospective.len() {
                full.push(at);
            }
        }
        if let [winner] = full[..] {
            Some(winner)
        } else {
            None
        }
    }

    /// Bases of `prospective` covered by reads containing the RC of its
    /// trailing k-mer, plus their mates slid onto the earlier sequence.
    fn paired_coverage(&self, prospective: &[u8]) -> usize {
        let k = self.params.kmer_len;
        let (tail, ok) = pack(prospective, prospective.len() - k, k);
        if !ok {
            return 0;
        }
        let target = rc_kmer(tail, k);
        let readers = self.reads_containing(target);

        let mut covered = vec![false; prospective.len()];
        for &ridx in readers.iter() {
            self.mark_alignment(&mut covered, prospective, ridx);
            if let Some(mate) = self.pairs.mate_of(ridx as usize) {
                self.mark_alignment(&mut covered, prospective, mate as u32);
            }
        }
        covered.iter().filter(|&&c| c).count()
    }

    /// Marks where a read (either orientation) lies on the prospective
    /// sequence, anchored by its first k-mer.
    fn mark_alignment(&self, covered: &mut [bool], prospective: &[u8], ridx: u32) {
        let k = self.params.kmer_len;
        let read = &self.selected[ridx as usize].seq;
        for oriented in [read.clone(), reverse_complement(read)] {
            if oriented.len() < k {
                continue;
            }
            let Some(at) = find_subsequence(prospective, &oriented[..k]) else {
                continue;
            };
            let end = (at + oriented.len()).min(prospective.len());
            if prospective[at..end] == oriented[..end - at] {
                for slot in &mut covered[at..end] {
                    *slot = true;
                }
            }
        }
    }

    /// Selected reads containing a packed k-mer, scanned once and cached.
    fn reads_containing(&self, kmer: u64) -> Vec<u32> {
        if let Some(hit) = self.cached_reads_containing.get(&kmer) {
            return hit.clone();
        }
        let k = self.params.kmer_len;
        let canon = crate::kmer::canonical(kmer, k);
        let found: Vec<u32> = self
            .selected
            .iter()
            .enumerate()
            .filter(|(_, read)| {
                let array = generate_from_read(&read.seq, k);
                array
                    .kmers
                    .iter()
                    .zip(&array.valid)
                    .any(|(&km, &ok)| ok && crate::kmer::canonical(km, k) == canon)
            })
            .map(|(idx, _)| idx as u32)
            .collect();
        self.cached_reads_containing
            .entry(kmer)
            .or_insert_with(|| found.clone());
        found
    }

    /// Recursive fork exploration: try every surviving variant to the end,
    /// then judge the finished trials.
    fn resolve_by_recursion(
        &self,
        seq: Vec<u8>,
        candidates: &[(u8, u64, u32)],
        active: &[usize],
        level: usize,
        bases_since_fork: usize,
        coin_tossed_so_far: bool,
    ) -> Extension {
        let allowed = self.params.max_recursion + bases_since_fork / self.longest_read.max(1);
        if level >= allowed {
            // Recursion exhausted: stop here rather than guess.
            return Extension {
                seq,
                tp_reached: false,
                coin_tossed: coin_tossed_so_far,
                abandoned: true,
            };
        }

        let mut trials: Vec<(usize, Extension)> = Vec::with_capacity(active.len());
        for &at in active {
            let mut branch = seq.clone();
            branch.push(crate::bases::decode_base(u64::from(candidates[at].0)));
            let result = self.extend_read(branch, level + 1, 0);
            trials.push((at, result));
        }

        let tp_reachers: Vec<usize> = (0..trials.len())
            .filter(|&i| trials[i].1.tp_reached)
            .collect();

        match tp_reachers.len() {
            0 => {
                // Nobody finished; keep the longest attempt.
                let best = trials
                    .into_iter()
                    .max_by_key(|(_, ext)| ext.seq.len())
                    .map(|(_, ext)| ext);
                match best {
                    Some(mut ext) => {
                        ext.coin_tossed |= coin_tossed_so_far;
                        ext
                    }
                    None => Extension {
                        seq,
                        tp_reached: false,
                        coin_tossed: coin_tossed_so_far,
                        abandoned: true,
                    },
                }
            }
            1 => {
                let mut ext = trials.swap_remove(tp_reachers[0]).1;
                ext.coin_tossed |= coin_tossed_so_far;
                ext
            }
            _ => {
                // Rank finished trials by how much of them paired reads can
                // vouch for.
                let coverages: Vec<usize> = tp_reachers
                    .iter()
                    .map(|&i| {
                        if self.pairs.is_empty() {
                            0
                        } else {
                            self.paired_coverage(&trials[i].1.seq)
                        }
                    })
                    .collect();
                if let Some(winner) = clear_winner(&tp_reachers, &coverages, &trials) {
                    let mut ext = trials.swap_remove(winner).1;
                    ext.coin_tossed |= coin_tossed_so_far;
                    return ext;
                }

                // Weighted coin toss over the immediate k-mer depths.
                let weights: Vec<u32> = tp_reachers
                    .iter()
                    .map(|&i| candidates[trials[i].0].2)
                    .collect();
                let pick = tp_reachers[self.rng.weighted_pick(&weights)];
                let mut ext = trials.swap_remove(pick).1;
                ext.coin_tossed = true;
                ext
            }
        }
    }

    /// The trailing full-primer-length bases match a terminating primer.
    fn ends_with_terminator(&self, seq: &[u8]) -> bool {
        let tp_len = self.panel.reverse.len();
        if seq.len() < tp_len {
            return false;
        }
        let (tail, ok) = pack(seq, seq.len() - tp_len, tp_len);
        ok && self.panel.terminating.contains(&tail)
    }
}

enum Resolution {
    Chosen(usize),
    Ambiguous(Vec<usize>),
}

/// Winner by coverage: at least [`TP_RANK_PERCENT`] percent of the best
/// coverage ahead of every rival.
fn clear_winner(
    tp_reachers: &[usize],
    coverages: &[usize],
    trials: &[(usize, Extension)],
) -> Option<usize> {
    let (best_at, &best) = coverages
        .iter()
        .enumerate()
        .max_by_key(|&(_, &coverage)| coverage)?;
    if best == 0 {
        return None;
    }
    let runner_up = coverages
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != best_at)
        .map(|(_, &c)| c)
        .max()
        .unwrap_or(0);
    let len = trials[tp_reachers[best_at]].1.seq.len();
    // The winning trial must essentially be vouched for end to end, and the
    // runner-up must not tie it.
    if best * 100 >= len * TP_RANK_PERCENT && runner_up < best {
        Some(tp_reachers[best_at])
    } else {
        None
    }
}

/// XOR loop-trap codes of an existing sequence.
fn loop_trap_of(seq: &[u8], k: usize) -> FxHashSet<u64> {
    let mut trap = FxHashSet::default();
    let array = generate_from_read(seq, k);
    let mut i = LOOP_TRAP_LENGTH;
    while i < array.len() {
        if array.valid[i] && array.valid[i - LOOP_TRAP_LENGTH] {
            trap.insert(array.kmers[i] ^ array.kmers[i - LOOP_TRAP_LENGTH]);
        }
        i += 1;
    }
    trap
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::PrimerRole;

    const FWD: &[u8] = b"GTGYCAGCMGCCGCGGTAA";
    const RVS: &[u8] = b"GGACTACNVGGGTWTCTAAT";

    fn soup(len: usize, salt: u64) -> Vec<u8> {
        let mut state = 0x853c_49e6_748f_ea9bu64.wrapping_mul(salt + 1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                b"ACGT"[(state % 4) as usize]
            })
            .collect()
    }

    /// A 300-base amplicon: forward primer, unique interior, RC of the
    /// reverse primer.
    fn amplicon() -> Vec<u8> {
        let mut seq = b"GTGTCAGCAGCCGCGGTAA".to_vec();
        seq.extend(soup(261, 21));
        seq.extend(reverse_complement(b"GGACTACAAGGGTATCTAAT"));
        seq
    }

    struct Fixture {
        params: Params,
        panel: PrimerPanel,
        selected: Vec<SelectedRead>,
        table: KmerCountTable,
        contexts: ContextTables,
        starts: ReadStartIndex,
        pairs: ReadPairIndex,
        rng: CoinToss,
    }

    fn fixture(source: &[u8]) -> Fixture {
        let params = Params::default();
        let panel = PrimerPanel::build(FWD, RVS, 1, 1).unwrap();

        // Tile reads of 100 over the source on both strands.
        let mut selected = Vec::new();
        let mut idx = 0;
        for start in (0..=source.len() - 100).step_by(2) {
            let window = source[start..start + 100].to_vec();
            let role = if start == 0 {
                Some(PrimerRole::ForwardStart)
            } else {
                None
            };
            selected.push(SelectedRead {
                file: 0,
                read_idx: idx,
                seq: window.clone(),
                role,
            });
            idx += 1;
            selected.push(SelectedRead {
                file: 0,
                read_idx: idx,
                seq: reverse_complement(&window),
                role: None,
            });
            idx += 1;
        }

        let table = KmerCountTable::build(&selected, &params);
        let contexts = ContextTables::build(&selected, &table, &params);
        let starts = ReadStartIndex::build(&selected, params.kmer_len);
        let pairs = ReadPairIndex::default();
        let rng = CoinToss::new(Some(11));

        Fixture {
            params,
            panel,
            selected,
            table,
            contexts,
            starts,
            pairs,
            rng,
        }
    }

    fn extender(fixture: &Fixture) -> Extender<'_> {
        Extender::new(
            &fixture.params,
            &fixture.table,
            &fixture.contexts,
            &fixture.starts,
            &fixture.selected,
            &fixture.pairs,
            &fixture.panel,
            &fixture.rng,
        )
    }

    #[test]
    fn clean_amplicon_extends_to_terminating_primer() {
        let source = amplicon();
        let fx = fixture(&source);
        let ext = extender(&fx);

        // Start from the first 60 bases, primer included.
        let result = ext.extend_read(source[..60].to_vec(), 1, 0);
        assert!(result.tp_reached, "extension never reached the terminator");
        assert!(!result.coin_tossed);
        assert_eq!(result.seq, source);
    }

    #[test]
    fn extension_is_deterministic_without_coin_toss() {
        let source = amplicon();
        let fx = fixture(&source);

        let first = extender(&fx).extend_read(source[..60].to_vec(), 1, 0);
        let second = extender(&fx).extend_read(source[..60].to_vec(), 1, 0);
        assert!(!first.coin_tossed && !second.coin_tossed);
        assert_eq!(first.seq, second.seq);
    }

    #[test]
    fn cache_returns_full_extension() {
        let source = amplicon();
        let fx = fixture(&source);
        let ext = extender(&fx);

        let first = ext.extend_read(source[..60].to_vec(), 1, 0);
        assert!(first.tp_reached);
        // Second call hits the write-once cache.
        let again = ext.extend_read(source[..60].to_vec(), 1, 0);
        assert_eq!(again.seq, first.seq);
        assert!(again.tp_reached);
    }

    #[test]
    fn dead_end_is_abandoned() {
        let source = amplicon();
        let fx = fixture(&source);
        let ext = extender(&fx);

        // A sequence nobody sequenced: depth dies immediately.
        let stray = soup(80, 99);
        let result = ext.extend_read(stray.clone(), 1, 0);
        assert!(result.abandoned);
        assert!(!result.tp_reached);
        assert_eq!(result.seq.len(), stray.len());
    }

    #[test]
    fn terminator_detection_is_exact() {
        let source = amplicon();
        let fx = fixture(&source);
        let ext = extender(&fx);

        assert!(ext.ends_with_terminator(&source));
        assert!(!ext.ends_with_terminator(&source[..source.len() - 1]));
    }

    #[test]
    fn running_depth_means() {
        let mut running = RunningDepth {
            count: 0,
            sum: 0,
            inv_sum: 0.0,
            last: 0,
        };
        for d in [10, 20, 40] {
            running.push(d);
        }
        assert!((running.arithmetic() - 70.0 / 3.0).abs() < 1e-9);
        let expected_harmonic = 3.0 / (0.1 + 0.05 + 0.025);
        assert!((running.harmonic() - expected_harmonic).abs() < 1e-9);
        assert_eq!(running.last, 40);
    }
}
