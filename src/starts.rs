//! Starting-read preparation.
//!
//! Extension begins from the reads that carry the forward primer. Before
//! they are handed to the extender they are normalised (FP' reads reverse
//! complemented), trimmed to a half-primer stub, rescued when their primer
//! match was partial, error-corrected against the depth and context tables,
//! and — when a read is too short to anchor contexts — stretched along a
//! deeper starting read that shares its prefix.

use rustc_hash::FxHashMap;

use crate::bases::reverse_complement;
use crate::config::Params;
use crate::context::{hash_context, hash_context_variant};
use crate::contexts::ContextTables;
use crate::counts::KmerCountTable;
use crate::denoise::read_stats;
use crate::kmer::{canonical, generate_from_read, pack, with_last_base};
use crate::primer::PrimerPanel;
use crate::rng::CoinToss;
use crate::scan::PrimerRole;
use crate::select::SelectedRead;

/// Canonical first-k-mer -> selected reads beginning with it, in either
/// orientation.
#[derive(Debug, Default)]
pub struct ReadStartIndex {
    map: FxHashMap<u64, Vec<u32>>,
    k: usize,
}

impl ReadStartIndex {
    #[must_use]
    pub fn build(selected: &[SelectedRead], k: usize) -> Self {
        let mut map: FxHashMap<u64, Vec<u32>> = FxHashMap::default();
        for (idx, read) in selected.iter().enumerate() {
            let (first, ok) = pack(&read.seq, 0, k.min(read.seq.len()));
            if ok && read.seq.len() >= k {
                map.entry(canonical(first, k)).or_default().push(idx as u32);
            }
            if read.seq.len() >= k {
                let (last, ok) = pack(&read.seq, read.seq.len() - k, k);
                if ok {
                    // The RC form starts with the RC of the last k-mer, which
                    // shares its canonical form.
                    let canon = canonical(last, k);
                    let entry = map.entry(canon).or_default();
                    if entry.last() != Some(&(idx as u32)) {
                        entry.push(idx as u32);
                    }
                }
            }
        }
        Self { map, k }
    }

    /// Selected reads that begin with this k-mer in either orientation.
    #[must_use]
    pub fn reads_starting_with(&self, kmer: u64) -> &[u32] {
        self.map
            .get(&canonical(kmer, self.k))
            .map_or(&[], Vec::as_slice)
    }
}

/// One read ready for extension, running forward-primer-stub first.
#[derive(Debug, Clone)]
pub struct StartingRead {
    pub seq: Vec<u8>,
    /// Index into the selected-read vector this read came from.
    pub source: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StartPrepStats {
    pub starting_reads: usize,
    pub rescued: usize,
    pub corrected: usize,
    pub trimmed_back: usize,
    pub dropped: usize,
    pub extended: usize,
}

/// Maximum base corrections the cleaner will apply to one read.
const MAX_CORRECTIONS: usize = 2;

/// Builds the final starting-read set.
pub fn prepare_starting_reads(
    selected: &[SelectedRead],
    panel: &PrimerPanel,
    table: &mut KmerCountTable,
    contexts: &mut ContextTables,
    rng: &CoinToss,
    params: &Params,
) -> (Vec<StartingRead>, StartPrepStats) {
    let k = params.kmer_len;
    let trim = panel.forward.len() / 2;
    let scs = params.shortest_context_size;
    let mut stats = StartPrepStats::default();

    // Normalise: every starting read runs forward-primer first.
    let mut oriented: Vec<(Vec<u8>, usize)> = Vec::new();
    for (idx, read) in selected.iter().enumerate() {
        match read.role {
            Some(PrimerRole::ForwardStart) => oriented.push((read.seq.clone(), idx)),
            Some(PrimerRole::ForwardEnd) => {
                oriented.push((reverse_complement(&read.seq), idx));
            }
            _ => {}
        }
    }

    // Partial-primer windows: offset into the untrimmed starting read, keyed
    // by the fingerprint of the window starting there.
    let mut partial_windows: FxHashMap<u64, usize> = FxHashMap::default();
    for (seq, _) in &oriented {
        for offset in 1..trim {
            if offset + scs > seq.len() {
                break;
            }
            if let Some(fp) = hash_context(seq, offset, scs, k) {
                partial_windows.entry(fp).or_insert(offset);
            }
        }
    }

    // Rescue reads whose forward primer was cut off mid-way: their leading
    // window lines up with a known intra-primer offset.
    for (idx, read) in selected.iter().enumerate() {
        if read.role.is_some() {
            continue;
        }
        for seq in [read.seq.clone(), reverse_complement(&read.seq)] {
            if seq.len() < scs {
                continue;
            }
            let Some(fp) = hash_context(&seq, 0, scs, k) else {
                continue;
            };
            if let Some(&offset) = partial_windows.get(&fp) {
                let mut rescued = seq;
                if trim > offset {
                    rescued.drain(..trim - offset);
                }
                oriented.push((rescued, idx));
                stats.rescued += 1;
                break;
            }
        }
    }

    // Stub-trim the reads that still carry the full primer (rescued reads
    // were aligned to the stub already).
    let rescued_from = oriented.len() - stats.rescued;
    for (seq, _) in &mut oriented[..rescued_from] {
        seq.drain(..trim.min(seq.len()));
    }

    // Cleaning weighs a correction against how many peer starting reads
    // agree with the corrected prefix.
    let pool: Vec<Vec<u8>> = oriented.iter().map(|(seq, _)| seq.clone()).collect();

    let mut prepared: Vec<StartingRead> = Vec::new();
    for (seq, source) in oriented {
        match clean_read(seq, &pool, table, contexts, params) {
            CleanOutcome::Kept { seq, corrections } => {
                if corrections > 0 {
                    stats.corrected += 1;
                }
                prepared.push(StartingRead { seq, source });
            }
            CleanOutcome::TrimmedBack { seq } => {
                stats.trimmed_back += 1;
                if seq.len() >= scs + k {
                    prepared.push(StartingRead { seq, source });
                } else {
                    stats.dropped += 1;
                }
            }
            CleanOutcome::Dropped => stats.dropped += 1,
        }
    }

    extend_short_reads(&mut prepared, table, rng, params, &mut stats);
    stats.starting_reads = prepared.len();
    (prepared, stats)
}

enum CleanOutcome {
    Kept { seq: Vec<u8>, corrections: usize },
    TrimmedBack { seq: Vec<u8> },
    Dropped,
}

/// Single-base correction guided by depth, context support, and agreement
/// with other read starts. At most [`MAX_CORRECTIONS`] substitutions; a bad
/// base that cannot be fixed trims the read back to the last good one.
fn clean_read(
    mut seq: Vec<u8>,
    pool: &[Vec<u8>],
    table: &mut KmerCountTable,
    contexts: &mut ContextTables,
    params: &Params,
) -> CleanOutcome {
    let k = params.kmer_len;
    if seq.len() < params.shortest_context_size + k {
        return CleanOutcome::Dropped;
    }

    let mut corrections = 0usize;
    loop {
        let stats = read_stats(&seq, Some(PrimerRole::ForwardStart), table, params);
        let array = generate_from_read(&seq, k);
        let bad_at = array
            .kmers
            .iter()
            .zip(&array.valid)
            .position(|(&kmer, &ok)| !ok || table.depth(kmer) < stats.min_depth_allowed);
        let Some(bad_at) = bad_at else {
            return CleanOutcome::Kept { seq, corrections };
        };

        if corrections >= MAX_CORRECTIONS {
            seq.truncate(bad_at + k - 1);
            return CleanOutcome::TrimmedBack { seq };
        }

        match best_substitution(&seq, pool, &array.kmers, bad_at, table, contexts, &stats, params) {
            Some((bits, new_kmer)) => {
                let pos = bad_at + k - 1;
                let before = seq.clone();
                seq[pos] = crate::bases::decode_base(u64::from(bits));
                apply_table_shift(table, &before, &seq, pos, k);
                contexts.apply_substitution(&before, &seq, pos, k);
                debug_assert_eq!(pack(&seq, bad_at, k).0, new_kmer);
                corrections += 1;
            }
            None => {
                seq.truncate(bad_at + k - 1);
                if seq.len() < params.shortest_context_size + k {
                    return CleanOutcome::Dropped;
                }
                return CleanOutcome::TrimmedBack { seq };
            }
        }
    }
}

/// The best last-base substitution for the k-mer at `bad_at`, if any clears
/// the read's depth floor and carries context support.
#[allow(clippy::too_many_arguments)]
fn best_substitution(
    seq: &[u8],
    pool: &[Vec<u8>],
    kmers: &[u64],
    bad_at: usize,
    table: &KmerCountTable,
    contexts: &ContextTables,
    stats: &crate::denoise::ReadStats,
    params: &Params,
) -> Option<(u8, u64)> {
    let k = params.kmer_len;
    let kmer = kmers[bad_at];
    let pos = bad_at + k - 1;
    let original_support = prefix_support(pool, &seq[..=pos]);

    let mut best: Option<(u8, u64, u32)> = None;
    for bits in 0..4u8 {
        let candidate = with_last_base(kmer, k, bits);
        if candidate == kmer {
            continue;
        }
        let depth = table.depth(candidate);
        if depth < stats.min_depth_allowed {
            continue;
        }
        if !context_supports(seq, pos, candidate, contexts, params) {
            continue;
        }
        let mut corrected = seq[..=pos].to_vec();
        corrected[pos] = crate::bases::decode_base(u64::from(bits));
        if prefix_support(pool, &corrected) < original_support {
            continue;
        }
        if best.map_or(true, |(_, _, d)| depth > d) {
            best = Some((bits, candidate, depth));
        }
    }
    best.map(|(bits, candidate, _)| (bits, candidate))
}

/// How many starting reads open with this prefix.
fn prefix_support(pool: &[Vec<u8>], prefix: &[u8]) -> usize {
    pool.iter().filter(|read| read.starts_with(prefix)).count()
}

/// The shortest context ending at the substituted base must have been seen.
fn context_supports(
    seq: &[u8],
    pos: usize,
    candidate: u64,
    contexts: &ContextTables,
    params: &Params,
) -> bool {
    let Some(&len) = contexts.lengths().first() else {
        return true;
    };
    if pos + 1 < len {
        // Too close to the start for any context to fit; depth has to carry
        // the decision alone.
        return true;
    }
    let start = pos + 1 - len;
    let fp = hash_context_variant(seq, start, len, candidate);
    contexts.count(0, fp) > 0
}

/// Depth bookkeeping for a substitution: windows spanning the changed base
/// lose their old form and gain the corrected one.
fn apply_table_shift(table: &mut KmerCountTable, before: &[u8], after: &[u8], pos: usize, k: usize) {
    let lo = pos.saturating_sub(k - 1);
    let hi = pos.min(before.len().saturating_sub(k));
    for start in lo..=hi {
        let (old, old_ok) = pack(before, start, k);
        let (new, new_ok) = pack(after, start, k);
        if old_ok {
            table.bump(old, -1);
        }
        if new_ok {
            table.bump(new, 1);
        }
    }
}

/// Minimum length a starting read must have to stand alone.
fn standalone_len(longest_read: usize) -> usize {
    (longest_read / 2).max(70)
}

/// Stretches short starting reads along a deeper prefix-sharing peer,
/// weighted by how often that peer's form was seen.
fn extend_short_reads(
    prepared: &mut [StartingRead],
    table: &KmerCountTable,
    rng: &CoinToss,
    params: &Params,
    stats: &mut StartPrepStats,
) {
    let longest = prepared.iter().map(|r| r.seq.len()).max().unwrap_or(0);
    let min_len = standalone_len(longest);

    // Distinct long forms with abundance.
    let mut long_forms: FxHashMap<&[u8], u32> = FxHashMap::default();
    for read in prepared.iter() {
        if read.seq.len() >= min_len {
            *long_forms.entry(read.seq.as_slice()).or_insert(0) += 1;
        }
    }
    let long_forms: Vec<(Vec<u8>, u32)> = long_forms
        .into_iter()
        .map(|(seq, count)| (seq.to_vec(), count))
        .collect();

    for read in prepared.iter_mut() {
        if read.seq.len() >= min_len {
            continue;
        }
        let candidates: Vec<&(Vec<u8>, u32)> = long_forms
            .iter()
            .filter(|(form, _)| form.starts_with(&read.seq))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        let weights: Vec<u32> = candidates.iter().map(|(_, count)| *count).collect();
        let pick = &candidates[rng.weighted_pick(&weights)].0;
        if extension_viable(&read.seq, pick, table, params) {
            read.seq = pick.clone();
            stats.extended += 1;
        }
    }
}

/// Every k-mer the extension adds must clear the global depth floor.
fn extension_viable(short: &[u8], long: &[u8], table: &KmerCountTable, params: &Params) -> bool {
    let k = params.kmer_len;
    let from = short.len().saturating_sub(k - 1);
    let array = generate_from_read(&long[from..], k);
    array
        .kmers
        .iter()
        .zip(&array.valid)
        .all(|(&kmer, &ok)| ok && table.depth(kmer) >= params.min_depth)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FWD: &[u8] = b"GTGYCAGCMGCCGCGGTAA";
    const RVS: &[u8] = b"GGACTACNVGGGTWTCTAAT";

    fn soup(len: usize, salt: u64) -> Vec<u8> {
        let mut state = 0x1234_5678_9abc_def1u64.wrapping_mul(salt + 1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                b"ACGT"[(state % 4) as usize]
            })
            .collect()
    }

    fn starting_selected(region: &[u8], copies: usize) -> Vec<SelectedRead> {
        let mut reads = Vec::new();
        for i in 0..copies {
            reads.push(SelectedRead {
                file: 0,
                read_idx: i,
                seq: region.to_vec(),
                role: Some(PrimerRole::ForwardStart),
            });
            reads.push(SelectedRead {
                file: 0,
                read_idx: copies + i,
                seq: reverse_complement(region),
                role: Some(PrimerRole::ForwardEnd),
            });
        }
        reads
    }

    fn fixture() -> (Vec<u8>, PrimerPanel, Params) {
        let mut region = b"GTGTCAGCAGCCGCGGTAA".to_vec();
        region.extend(soup(130, 5));
        let panel = PrimerPanel::build(FWD, RVS, 1, 1).unwrap();
        (region, panel, Params::default())
    }

    #[test]
    fn stub_trim_leaves_half_primer() {
        let (region, panel, params) = fixture();
        let selected = starting_selected(&region, 10);
        let mut table = KmerCountTable::build(&selected, &params);
        let mut contexts = ContextTables::build(&selected, &table, &params);
        let rng = CoinToss::new(Some(1));

        let (prepared, stats) =
            prepare_starting_reads(&selected, &panel, &mut table, &mut contexts, &rng, &params);
        assert_eq!(stats.starting_reads, 20);
        let trim = panel.forward.len() / 2;
        for read in &prepared {
            assert_eq!(read.seq, region[trim..].to_vec());
        }
    }

    #[test]
    fn partial_primer_read_rescued() {
        let (region, panel, params) = fixture();
        let mut selected = starting_selected(&region, 10);
        // A read starting 3 bases into the primer: too deep for the scanner,
        // rescued by the partial-primer window table.
        selected.push(SelectedRead {
            file: 0,
            read_idx: 99,
            seq: region[3..].to_vec(),
            role: None,
        });
        let mut table = KmerCountTable::build(&selected, &params);
        let mut contexts = ContextTables::build(&selected, &table, &params);
        let rng = CoinToss::new(Some(1));

        let (prepared, stats) =
            prepare_starting_reads(&selected, &panel, &mut table, &mut contexts, &rng, &params);
        assert_eq!(stats.rescued, 1);
        let trim = panel.forward.len() / 2;
        assert!(prepared.iter().any(|r| r.source == 20));
        for read in &prepared {
            assert_eq!(read.seq, region[trim..].to_vec());
        }
    }

    #[test]
    fn single_error_corrected() {
        let (region, panel, params) = fixture();
        let mut selected = starting_selected(&region, 30);
        // One starting read with a substitution well inside the read.
        let mut erred = region.clone();
        erred[80] = match erred[80] {
            b'A' => b'C',
            b'C' => b'G',
            b'G' => b'T',
            _ => b'A',
        };
        selected.push(SelectedRead {
            file: 0,
            read_idx: 999,
            seq: erred,
            role: Some(PrimerRole::ForwardStart),
        });
        let mut table = KmerCountTable::build(&selected, &params);
        crate::denoise::denoise(&mut table, &selected, &params);
        let mut contexts = ContextTables::build(&selected, &table, &params);
        let rng = CoinToss::new(Some(1));

        let (prepared, stats) =
            prepare_starting_reads(&selected, &panel, &mut table, &mut contexts, &rng, &params);
        assert_eq!(stats.corrected, 1);
        assert_eq!(stats.dropped, 0);
        let trim = panel.forward.len() / 2;
        for read in &prepared {
            assert_eq!(read.seq, region[trim..].to_vec());
        }
    }

    #[test]
    fn hopeless_read_trimmed_back_or_dropped() {
        let (region, panel, params) = fixture();
        let mut selected = starting_selected(&region, 10);
        // A starting read that diverges into sequence nobody else has.
        let mut chimera = region[..90].to_vec();
        chimera.extend(soup(60, 77));
        selected.push(SelectedRead {
            file: 0,
            read_idx: 999,
            seq: chimera,
            role: Some(PrimerRole::ForwardStart),
        });
        let mut table = KmerCountTable::build(&selected, &params);
        let mut contexts = ContextTables::build(&selected, &table, &params);
        let rng = CoinToss::new(Some(1));

        let (prepared, stats) =
            prepare_starting_reads(&selected, &panel, &mut table, &mut contexts, &rng, &params);
        // The chimeric tail cannot be corrected within two substitutions.
        assert!(stats.trimmed_back + stats.dropped >= 1);
        let trim = panel.forward.len() / 2;
        let clean_len = region.len() - trim;
        assert!(prepared
            .iter()
            .all(|r| r.seq.len() == clean_len || r.seq.len() < clean_len));
    }

    #[test]
    fn read_start_index_finds_both_orientations() {
        let region = soup(100, 8);
        let selected = vec![
            SelectedRead {
                file: 0,
                read_idx: 0,
                seq: region.clone(),
                role: None,
            },
            SelectedRead {
                file: 0,
                read_idx: 1,
                seq: reverse_complement(&region),
                role: None,
            },
        ];
        let index = ReadStartIndex::build(&selected, 32);

        let (first, _) = pack(&region, 0, 32);
        let hits = index.reads_starting_with(first);
        // Read 0 starts with it; read 1 (the RC) ends with its RC.
        assert!(hits.contains(&0));
        assert!(hits.contains(&1));
    }
}
