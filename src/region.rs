//! Iterative region filter growth.
//!
//! Starting from the primer-tagged seed reads, the filter grows a directional
//! picture of the inter-primer region: the k-mers it contains plus, per
//! context length, fingerprints of the sequence neighbourhoods those k-mers
//! sit in. Each iteration sweeps the unscanned reads for members, folds the
//! matches back into the filter, and watches an ending filter built from the
//! opposite primer's reads to know when the two growth fronts have met.

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

use crate::bases::{is_low_complexity, reverse_complement, Read};
use crate::config::Params;
use crate::kmer::{generate_from_read, reverse_complement as rc_kmer, KmerArray};
use crate::scan::{PrimerRole, ScanResult};

/// Which primer the growth front started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Growing from the forward primer toward the reverse.
    Fwd,
    /// Growing from the reverse primer toward the forward.
    Rvs,
}

impl Direction {
    pub const BOTH: [Self; 2] = [Self::Fwd, Self::Rvs];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Fwd => 0,
            Self::Rvs => 1,
        }
    }

    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Fwd => Self::Rvs,
            Self::Rvs => Self::Fwd,
        }
    }
}

/// Context lengths from `shortest` up to `longest` at the given stride.
#[must_use]
pub fn quantized_lengths(shortest: usize, stride: usize, longest: usize) -> Vec<usize> {
    if longest < shortest {
        return Vec::new();
    }
    (shortest..=longest).step_by(stride.max(1)).collect()
}

/// One direction-and-file's slice of the region filter.
#[derive(Debug, Default)]
struct DirFilter {
    kmers: FxHashSet<u64>,
    /// Per context-length index: k-mers known to anchor a context of that length.
    context_exists: Vec<FxHashSet<u64>>,
    /// Per context-length index: fingerprints of those contexts.
    context_fps: Vec<FxHashSet<u64>>,
    /// Cumulative k-mer occurrence counts feeding the admission gate.
    counts: FxHashMap<u64, u32>,
}

impl DirFilter {
    fn with_lengths(lengths: usize) -> Self {
        Self {
            context_exists: vec![FxHashSet::default(); lengths],
            context_fps: vec![FxHashSet::default(); lengths],
            ..Self::default()
        }
    }
}

/// The frozen product of region growth.
#[derive(Debug)]
pub struct RegionGrowth {
    /// Final k-mer membership set, strict-filtered and RC-closed.
    pub filter: FxHashSet<u64>,
    /// Reads accepted into the region, per file.
    pub matched: Vec<FxHashSet<usize>>,
    pub iterations: usize,
    pub ending_reads: usize,
}

/// Orientation a read matched the filter in.
#[derive(Clone, Copy)]
enum Orientation {
    AsRead,
    Rc,
}

struct Match {
    file: usize,
    read_idx: usize,
    direction: Direction,
    orientation: Orientation,
}

struct FileProgress {
    expected: usize,
    low_rate_streak: usize,
    stopped: bool,
}

pub struct IterativeRegionFilter<'a> {
    params: &'a Params,
    lengths: Vec<usize>,
    /// `[direction][file]`
    filters: [Vec<DirFilter>; 2],
    /// `[direction]`: (k, k + k/2) XOR codes of the territory this
    /// direction's growth is heading into.
    ending: [FxHashSet<u64>; 2],
    adapter_trap: FxHashSet<u64>,
    scanned: Vec<Vec<bool>>,
    matched: Vec<FxHashSet<usize>>,
    ending_read_count: usize,
    longest_read: usize,
}

impl<'a> IterativeRegionFilter<'a> {
    /// Seeds the filters from the primer-tagged reads and grows them to
    /// convergence.
    pub fn grow(
        files: &[Vec<Option<Read>>],
        scans: &[ScanResult],
        params: &'a Params,
    ) -> RegionGrowth {
        let longest_read = files
            .iter()
            .flat_map(|reads| reads.iter().flatten())
            .map(Read::len)
            .max()
            .unwrap_or(0);
        let lengths = quantized_lengths(
            params.shortest_context_length,
            params.filter_context_stride,
            longest_read.max(params.shortest_context_length),
        );

        let mut this = IterativeRegionFilter {
            params,
            filters: [
                (0..files.len())
                    .map(|_| DirFilter::with_lengths(lengths.len()))
                    .collect(),
                (0..files.len())
                    .map(|_| DirFilter::with_lengths(lengths.len()))
                    .collect(),
            ],
            lengths,
            ending: [FxHashSet::default(), FxHashSet::default()],
            adapter_trap: FxHashSet::default(),
            scanned: files.iter().map(|reads| vec![false; reads.len()]).collect(),
            matched: files.iter().map(|_| FxHashSet::default()).collect(),
            ending_read_count: 0,
            longest_read,
        };

        this.initialise(files, scans);
        let iterations = this.run(files);
        this.finish(iterations)
    }

    /// Seeds each direction with its primer-tagged reads: ending-primer
    /// reads reversed, adapter tails trimmed, k-mers and contexts tiled in,
    /// and the opposite direction's ending filter stocked.
    fn initialise(&mut self, files: &[Vec<Option<Read>>], scans: &[ScanResult]) {
        for direction in Direction::BOTH {
            let (start_role, end_role) = match direction {
                Direction::Fwd => (PrimerRole::ForwardStart, PrimerRole::ForwardEnd),
                Direction::Rvs => (PrimerRole::ReverseStart, PrimerRole::ReverseEnd),
            };

            for (file, (reads, scan)) in files.iter().zip(scans).enumerate() {
                let mut start_seeds: Vec<Vec<u8>> = Vec::new();
                let mut end_seeds: Vec<Vec<u8>> = Vec::new();
                for &idx in scan.role_reads(start_role) {
                    self.scanned[file][idx] = true;
                    self.matched[file].insert(idx);
                    if let Some(read) = &reads[idx] {
                        start_seeds.push(read.seq.clone());
                    }
                }
                for &idx in scan.role_reads(end_role) {
                    self.scanned[file][idx] = true;
                    self.matched[file].insert(idx);
                    if let Some(read) = &reads[idx] {
                        end_seeds.push(read.seq.clone());
                    }
                }

                self.trim_adapters(&mut start_seeds, &end_seeds);
                for seq in &start_seeds {
                    self.admit_read(direction, file, seq, true);
                }
                for raw in &end_seeds {
                    let seq = reverse_complement(raw);
                    self.admit_read(direction, file, &seq, true);
                }
            }
        }
    }

    /// Flags k-mers that only ever occur in one strand orientation across
    /// the raw seed set; a genuine region k-mer is read from both strands.
    /// Start-primer seeds still carry their raw 3' tail (end-primer seeds
    /// were clipped at the primer by the scanner), so only they can run into
    /// adapter. Affected seeds are clipped back to the last solid k-mer and
    /// the clipped k-mers recorded in the trap.
    fn trim_adapters(&mut self, start_seeds: &mut [Vec<u8>], end_seeds: &[Vec<u8>]) {
        let k = self.params.kmer_len;
        let mut as_read: FxHashSet<u64> = FxHashSet::default();
        for seq in start_seeds.iter().map(Vec::as_slice).chain(end_seeds.iter().map(Vec::as_slice))
        {
            let array = generate_from_read(seq, k);
            for (&kmer, &ok) in array.kmers.iter().zip(&array.valid) {
                if ok {
                    as_read.insert(kmer);
                }
            }
        }

        for seq in start_seeds.iter_mut() {
            let array = generate_from_read(seq, k);
            if array.is_empty() {
                continue;
            }
            // Walk back over the trailing run of one-sided k-mers.
            let mut solid_end = array.len();
            while solid_end > 0 {
                let kmer = array.kmers[solid_end - 1];
                let one_sided =
                    array.valid[solid_end - 1] && !as_read.contains(&rc_kmer(kmer, k));
                if !one_sided {
                    break;
                }
                solid_end -= 1;
            }
            if solid_end < array.len() {
                for &kmer in &array.kmers[solid_end..] {
                    self.adapter_trap.insert(kmer);
                }
                seq.truncate(solid_end + k - 1);
            }
        }
    }

    /// Tiles a read into a direction's filter: k-mers through the admission
    /// gate, contexts at every anchored offset, and the read's RC into the
    /// opposite ending filter.
    fn admit_read(&mut self, direction: Direction, file: usize, seq: &[u8], seed: bool) {
        let k = self.params.kmer_len;
        let filter = &mut self.filters[direction.index()][file];
        let array = generate_from_read(seq, k);

        for (&kmer, &ok) in array.kmers.iter().zip(&array.valid) {
            if !ok || self.adapter_trap.contains(&kmer) {
                continue;
            }
            let count = filter.counts.entry(kmer).or_insert(0);
            *count += 1;
            // Seeds are pre-vetted by their primer match; grown reads need
            // the depth gate before their k-mers join the filter.
            if seed || *count >= self.params.min_depth {
                filter.kmers.insert(kmer);
            }
        }

        self.tile_contexts(direction, file, seq, &array);

        let rc = reverse_complement(seq);
        let rc_array = generate_from_read(&rc, k);
        let opposite = &mut self.ending[direction.opposite().index()];
        for &code in &ending_codes(&rc_array, k) {
            opposite.insert(code);
        }
    }

    /// Records the context fingerprints of every window of every quantized
    /// length in the read. The FNV prefix hash is extended incrementally, so
    /// one pass per start offset covers all lengths.
    fn tile_contexts(&mut self, direction: Direction, file: usize, seq: &[u8], array: &KmerArray) {
        let k = self.params.kmer_len;
        let shortest = self.lengths.first().copied().unwrap_or(usize::MAX);
        let stride = self.params.filter_context_stride.max(1);
        let filter = &mut self.filters[direction.index()][file];

        for start in 0..seq.len() {
            if seq.len() - start < shortest {
                break;
            }
            let Some(&anchor_valid) = array.valid.get(start) else {
                break;
            };
            if !anchor_valid {
                continue;
            }
            let anchor = array.kmers[start];

            let mut hash = 0xcbf2_9ce4_8422_2325u64;
            const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
            for (i, &base) in seq[start..].iter().enumerate() {
                hash ^= u64::from(base);
                hash = hash.wrapping_mul(FNV_PRIME);
                let len = i + 2; // prefix of len-1 bases hashed so far
                if len < shortest || (len - shortest) % stride != 0 || start + len > seq.len() {
                    continue;
                }
                let last_at = start + len - k;
                if !array.valid.get(last_at).copied().unwrap_or(false) {
                    continue;
                }
                let folded = (hash ^ hash >> 32) as u32;
                let fp = u64::from(folded) << 32 | array.kmers[last_at] & 0xFFFF_FFFF;
                let slot = (len - shortest) / stride;
                filter.context_exists[slot].insert(anchor);
                filter.context_fps[slot].insert(fp);
            }
        }
    }

    /// One full growth pass; returns the number of iterations run.
    fn run(&mut self, files: &[Vec<Option<Read>>]) -> usize {
        let read_len = self.longest_read.max(1);
        let max_len = self.params.max_length.unwrap_or(2000);
        let max_iterations = 5usize.max(max_len / (read_len / 2).max(1));

        // One iteration should pull in roughly a read-length band of new
        // region; seed count scaled by reads-per-k gives the first estimate.
        let mut progress: Vec<FileProgress> = self
            .matched
            .iter()
            .map(|matched| FileProgress {
                expected: (matched.len() * read_len / self.params.kmer_len)
                    .max(matched.len())
                    .max(1),
                low_rate_streak: 0,
                stopped: false,
            })
            .collect();

        let mut iteration = 0;
        while progress.iter().any(|p| !p.stopped) && iteration < max_iterations {
            iteration += 1;

            let matches = self.find_matching_reads(files, &progress);
            if matches.is_empty() {
                break;
            }

            // Per-file accounting before the merge.
            let mut per_file = vec![0usize; files.len()];
            for m in &matches {
                per_file[m.file] += 1;
            }

            let mut runaway = vec![false; files.len()];
            for (file, progress) in progress.iter_mut().enumerate() {
                if progress.stopped {
                    continue;
                }
                let found = per_file[file];
                if iteration == 1 {
                    // The first sweep defines what one band of the region
                    // yields.
                    progress.expected = progress.expected.max(found);
                } else if iteration == 2 && found > progress.expected {
                    // One late revision, capped at 5x.
                    progress.expected = found.min(progress.expected * 5);
                }
                if iteration > 1 && found > 2 * progress.expected {
                    runaway[file] = true;
                    progress.stopped = true;
                }
            }

            let new_ending = self.extend_filter_set(files, &matches, &runaway);

            for (file, progress) in progress.iter_mut().enumerate() {
                if progress.stopped {
                    continue;
                }
                let adding_rate_low = per_file[file] * 100 <= progress.expected;
                if adding_rate_low {
                    progress.low_rate_streak += 1;
                } else {
                    progress.low_rate_streak = 0;
                }
                let ending_saturated =
                    new_ending * 20 <= self.ending_read_count.max(1) && self.ending_read_count > 0;
                if progress.low_rate_streak >= 2 && ending_saturated {
                    progress.stopped = true;
                }
            }
        }
        iteration
    }

    /// Sweeps the unscanned reads of every live file for region members.
    fn find_matching_reads(
        &self,
        files: &[Vec<Option<Read>>],
        progress: &[FileProgress],
    ) -> Vec<Match> {
        let merged: Mutex<Vec<Match>> = Mutex::new(Vec::new());
        let chunk = self.params.reads_in_batch.max(1);

        for (file, reads) in files.iter().enumerate() {
            if progress[file].stopped {
                continue;
            }
            let scanned = &self.scanned[file];
            reads
                .par_chunks(chunk)
                .enumerate()
                .for_each(|(chunk_no, slice)| {
                    let mut local = Vec::new();
                    for (offset, read) in slice.iter().enumerate() {
                        let read_idx = chunk_no * chunk + offset;
                        if scanned[read_idx] {
                            continue;
                        }
                        let Some(read) = read else { continue };
                        if let Some((direction, orientation)) = self.match_read(read, file) {
                            local.push(Match {
                                file,
                                read_idx,
                                direction,
                                orientation,
                            });
                        }
                    }
                    if !local.is_empty() {
                        let mut guard = merged
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        guard.append(&mut local);
                    }
                });
        }
        merged
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Tests one read against both directions, as-read then reverse
    /// complemented.
    fn match_read(&self, read: &Read, file: usize) -> Option<(Direction, Orientation)> {
        if read.len() < self.params.kmer_len {
            return None;
        }
        if !self.params.keep_low_complexity && is_low_complexity(&read.seq) {
            return None;
        }

        for direction in Direction::BOTH {
            if self.oriented_match(&read.seq, direction, file) {
                return Some((direction, Orientation::AsRead));
            }
        }
        let rc = reverse_complement(&read.seq);
        for direction in Direction::BOTH {
            if self.oriented_match(&rc, direction, file) {
                return Some((direction, Orientation::Rc));
            }
        }
        None
    }

    /// Leading k-mer membership plus a longest-first context confirmation.
    fn oriented_match(&self, seq: &[u8], direction: Direction, file: usize) -> bool {
        let k = self.params.kmer_len;
        let (leading, ok) = crate::kmer::pack(seq, 0, k);
        if !ok {
            return false;
        }
        let filter = &self.filters[direction.index()][file];
        if !filter.kmers.contains(&leading) {
            return false;
        }

        // Longest quantized context that fits in this read, tried downward.
        for (slot, &len) in self.lengths.iter().enumerate().rev() {
            if len > seq.len() {
                continue;
            }
            if !filter.context_exists[slot].contains(&leading) {
                continue;
            }
            if let Some(fp) = crate::context::hash_context(seq, 0, len, k) {
                if filter.context_fps[slot].contains(&fp) {
                    return true;
                }
            }
        }
        false
    }

    /// Folds an iteration's matches into the filters. Returns the number of
    /// new ending reads observed.
    fn extend_filter_set(
        &mut self,
        files: &[Vec<Option<Read>>],
        matches: &[Match],
        runaway: &[bool],
    ) -> usize {
        let k = self.params.kmer_len;

        // Distinct set: sort the oriented sequences; a read that is a prefix
        // of its successor is subsumed into it.
        let mut oriented: Vec<(Vec<u8>, Direction, usize, usize)> = matches
            .iter()
            .filter_map(|m| {
                let read = files[m.file][m.read_idx].as_ref()?;
                let seq = match m.orientation {
                    Orientation::AsRead => read.seq.clone(),
                    Orientation::Rc => reverse_complement(&read.seq),
                };
                Some((seq, m.direction, m.file, m.read_idx))
            })
            .collect();
        for m in matches {
            self.scanned[m.file][m.read_idx] = true;
            self.matched[m.file].insert(m.read_idx);
        }
        oriented.sort_by(|a, b| a.0.cmp(&b.0));

        let mut new_ending = 0usize;
        let mut distinct: Vec<(Vec<u8>, Direction, usize)> = Vec::with_capacity(oriented.len());
        for (seq, direction, file, _) in oriented {
            if let Some(last) = distinct.last() {
                if seq.starts_with(&last.0) || last.0.starts_with(&seq) {
                    // Subsumed; the longer form stays.
                    if seq.len() > last.0.len() {
                        let slot = distinct.len() - 1;
                        distinct[slot].0 = seq;
                    }
                    continue;
                }
            }
            distinct.push((seq, direction, file));
        }

        for (seq, direction, file) in &distinct {
            let array = generate_from_read(seq, k);
            let is_ending = self.is_ending_read(&array, *direction, k);
            if is_ending {
                new_ending += 1;
                self.ending_read_count += 1;
            }
            // A runaway iteration contributes only its ending reads.
            if runaway[*file] && !is_ending {
                continue;
            }
            self.admit_read(*direction, *file, seq, false);
        }
        new_ending
    }

    /// More than 3/4 of a read's half-k-stride XOR codes landing in the
    /// ending filter means the growth front has reached the far primer.
    fn is_ending_read(&self, array: &KmerArray, direction: Direction, k: usize) -> bool {
        let codes = ending_codes(array, k);
        if codes.is_empty() {
            return false;
        }
        let ending = &self.ending[direction.index()];
        let hits = codes.iter().filter(|code| ending.contains(code)).count();
        hits * 4 > codes.len() * 3
    }

    /// Strict-mode intersection and RC closure over the per-file k-mer sets.
    fn finish(self, iterations: usize) -> RegionGrowth {
        let k = self.params.kmer_len;
        let file_count = self.filters[0].len();

        // Union both directions per file; strict mode then demands every
        // k-mer show up (in either form) in every file of the pair.
        let by_file: Vec<FxHashSet<u64>> = (0..file_count)
            .map(|file| {
                let mut set = FxHashSet::default();
                for direction in Direction::BOTH {
                    set.extend(&self.filters[direction.index()][file].kmers);
                }
                set
            })
            .collect();

        let mut filter: FxHashSet<u64> = FxHashSet::default();
        for (file, kmers) in by_file.iter().enumerate() {
            for &kmer in kmers {
                if self.params.strict && file_count > 1 {
                    let rc = rc_kmer(kmer, k);
                    let everywhere = by_file
                        .iter()
                        .enumerate()
                        .all(|(other, set)| {
                            other == file || set.contains(&kmer) || set.contains(&rc)
                        });
                    if !everywhere {
                        continue;
                    }
                }
                filter.insert(kmer);
            }
        }

        let rcs: Vec<u64> = filter.iter().map(|&kmer| rc_kmer(kmer, k)).collect();
        filter.extend(rcs);

        RegionGrowth {
            filter,
            matched: self.matched,
            iterations,
            ending_reads: self.ending_read_count,
        }
    }
}

/// XOR of each k-mer with the k-mer half a k downstream, at half-k stride.
fn ending_codes(array: &KmerArray, k: usize) -> Vec<u64> {
    let half = k / 2;
    let mut codes = Vec::new();
    let mut i = 0;
    while i + half < array.len() {
        if array.valid[i] && array.valid[i + half] {
            codes.push(array.kmers[i] ^ array.kmers[i + half]);
        }
        i += half;
    }
    codes
}
