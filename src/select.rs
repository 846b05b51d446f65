//! Final read selection against the frozen region filter.
//!
//! A read joins the selected set when at least two of the three thirds of
//! its k-mer tiling touch the region filter; primer-tagged reads are in by
//! right. Selected reads from paired files are linked into a pair index,
//! leaving out *trivial* pairs whose fragments are so short the mates are
//! just each other's reverse complement.

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

use crate::bases::{reverse_complement, Read};
use crate::config::Params;
use crate::kmer::generate_from_read;
use crate::region::RegionGrowth;
use crate::scan::{PrimerRole, ScanResult};

/// One read that survived selection, in as-read orientation.
#[derive(Debug, Clone)]
pub struct SelectedRead {
    pub file: usize,
    /// Index in the file's original read vector.
    pub read_idx: usize,
    pub seq: Vec<u8>,
    pub role: Option<PrimerRole>,
}

/// Keeps reads whose k-mers sit inside the region filter.
pub fn select_final_reads(
    files: &[Vec<Option<Read>>],
    scans: &[ScanResult],
    growth: &RegionGrowth,
    params: &Params,
) -> Vec<SelectedRead> {
    let chunk = params.reads_in_batch.max(1);
    let merged: Mutex<Vec<SelectedRead>> = Mutex::new(Vec::new());

    for (file, (reads, scan)) in files.iter().zip(scans).enumerate() {
        reads
            .par_chunks(chunk)
            .enumerate()
            .for_each(|(chunk_no, slice)| {
                let mut local = Vec::new();
                for (offset, read) in slice.iter().enumerate() {
                    let read_idx = chunk_no * chunk + offset;
                    let Some(read) = read else { continue };
                    let role = scan.hits.get(&read_idx).map(|hit| hit.role);
                    if role.is_some() || two_of_three_thirds(&read.seq, &growth.filter, params)
                    {
                        local.push(SelectedRead {
                            file,
                            read_idx,
                            seq: read.seq.clone(),
                            role,
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

    let mut selected = merged
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    selected.sort_by_key(|read| (read.file, read.read_idx));
    selected
}

/// At least two of the three thirds of the read's k-mers touch the filter.
fn two_of_three_thirds(seq: &[u8], filter: &FxHashSet<u64>, params: &Params) -> bool {
    let array = generate_from_read(seq, params.kmer_len);
    if array.is_empty() || filter.is_empty() {
        return false;
    }
    let third = (array.len() + 2) / 3;
    let mut thirds_hit = 0;
    for band in array.kmers.chunks(third).zip(array.valid.chunks(third)) {
        let hit = band
            .0
            .iter()
            .zip(band.1)
            .any(|(kmer, &ok)| ok && filter.contains(kmer));
        if hit {
            thirds_hit += 1;
        }
    }
    thirds_hit >= 2
}

/// Canonical mate pairs over the selected set.
#[derive(Debug, Default)]
pub struct ReadPairIndex {
    /// (i, j) with i < j, both indexes into the selected-read vector.
    pub pairs: Vec<(u32, u32)>,
    mate: FxHashMap<u32, u32>,
    pub trivial: usize,
}

impl ReadPairIndex {
    /// Builds the pair index: mates share a read index across the two files
    /// of a pair. Pairs where one mate RC-contains the other's central core
    /// are trivial (the fragment is shorter than one read) and omitted.
    #[must_use]
    pub fn build(selected: &[SelectedRead], longest_read: usize) -> Self {
        let mut index = Self::default();
        let core_len = trivial_core_len(longest_read);

        let mut by_key: FxHashMap<(usize, usize), u32> = FxHashMap::default();
        for (sel_idx, read) in selected.iter().enumerate() {
            by_key.insert((read.file, read.read_idx), sel_idx as u32);
        }

        for (sel_idx, read) in selected.iter().enumerate() {
            if read.file != 0 {
                continue;
            }
            let Some(&mate_idx) = by_key.get(&(1, read.read_idx)) else {
                continue;
            };
            let mate = &selected[mate_idx as usize];
            if is_trivial_pair(&read.seq, &mate.seq, core_len) {
                index.trivial += 1;
                continue;
            }
            let (i, j) = if (sel_idx as u32) < mate_idx {
                (sel_idx as u32, mate_idx)
            } else {
                (mate_idx, sel_idx as u32)
            };
            index.pairs.push((i, j));
            index.mate.insert(i, j);
            index.mate.insert(j, i);
        }
        index
    }

    /// The selected-set index of a read's mate, if the pair survived.
    #[must_use]
    pub fn mate_of(&self, selected_idx: usize) -> Option<usize> {
        self.mate.get(&(selected_idx as u32)).map(|&m| m as usize)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Two thirds of the longest read; the containment core for trivial-pair
/// detection.
#[must_use]
pub fn trivial_core_len(longest_read: usize) -> usize {
    longest_read * 2 / 3
}

/// A pair is trivial when the central `core_len` bases of either mate,
/// reverse-complemented, occur inside the other mate.
fn is_trivial_pair(a: &[u8], b: &[u8], core_len: usize) -> bool {
    if core_len == 0 {
        return false;
    }
    rc_core_contained(a, b, core_len) || rc_core_contained(b, a, core_len)
}

fn rc_core_contained(inner: &[u8], outer: &[u8], core_len: usize) -> bool {
    if inner.len() < core_len || outer.len() < core_len {
        return false;
    }
    let margin = (inner.len() - core_len) / 2;
    let core = reverse_complement(&inner[margin..margin + core_len]);
    outer.windows(core_len).any(|window| window == core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::pack;

    fn soup(len: usize, salt: u64) -> Vec<u8> {
        let mut state = 0x9e37_79b9_7f4a_7c15u64.wrapping_mul(salt + 1);
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                b"ACGT"[(state % 4) as usize]
            })
            .collect()
    }

    fn filter_of(seq: &[u8]) -> FxHashSet<u64> {
        let array = generate_from_read(seq, 32);
        let mut filter: FxHashSet<u64> = array.kmers.iter().copied().collect();
        let rcs: Vec<u64> = filter
            .iter()
            .map(|&kmer| crate::kmer::reverse_complement(kmer, 32))
            .collect();
        filter.extend(rcs);
        filter
    }

    #[test]
    fn read_inside_region_selected() {
        let params = Params::default();
        let region = soup(300, 1);
        let filter = filter_of(&region);
        assert!(two_of_three_thirds(&region[40..160], &filter, &params));
    }

    #[test]
    fn read_outside_region_rejected() {
        let params = Params::default();
        let filter = filter_of(&soup(300, 1));
        assert!(!two_of_three_thirds(&soup(120, 9), &filter, &params));
    }

    #[test]
    fn one_third_overlap_not_enough() {
        let params = Params::default();
        let region = soup(300, 1);
        let filter = filter_of(&region);
        // First third inside the region, rest unrelated.
        let mut read = region[..50].to_vec();
        read.extend(soup(100, 9));
        assert!(!two_of_three_thirds(&read, &filter, &params));
    }

    #[test]
    fn rc_read_matches_closed_filter() {
        let params = Params::default();
        let region = soup(300, 1);
        let filter = filter_of(&region);
        let rc = reverse_complement(&region[40..160]);
        assert!(two_of_three_thirds(&rc, &filter, &params));
    }

    #[test]
    fn pair_index_links_mates() {
        let fragment = soup(400, 2);
        let r1 = fragment[..150].to_vec();
        let r2 = reverse_complement(&fragment[250..400]);
        let selected = vec![
            SelectedRead {
                file: 0,
                read_idx: 7,
                seq: r1,
                role: None,
            },
            SelectedRead {
                file: 1,
                read_idx: 7,
                seq: r2,
                role: None,
            },
        ];
        let index = ReadPairIndex::build(&selected, 150);
        assert_eq!(index.pairs, vec![(0, 1)]);
        assert_eq!(index.mate_of(0), Some(1));
        assert_eq!(index.mate_of(1), Some(0));
        assert_eq!(index.trivial, 0);
    }

    #[test]
    fn short_fragment_pair_is_trivial() {
        // Fragment shorter than a read: mates are near-full RC copies.
        let fragment = soup(150, 3);
        let r1 = fragment.clone();
        let r2 = reverse_complement(&fragment);
        let selected = vec![
            SelectedRead {
                file: 0,
                read_idx: 0,
                seq: r1,
                role: None,
            },
            SelectedRead {
                file: 1,
                read_idx: 0,
                seq: r2,
                role: None,
            },
        ];
        let index = ReadPairIndex::build(&selected, 150);
        assert!(index.is_empty());
        assert_eq!(index.trivial, 1);
    }

    #[test]
    fn trivial_core_length_rule() {
        assert_eq!(trivial_core_len(150), 100);
        assert_eq!(trivial_core_len(0), 0);
    }

    #[test]
    fn unpaired_mate_missing_no_pair() {
        let selected = vec![SelectedRead {
            file: 0,
            read_idx: 3,
            seq: soup(150, 4),
            role: None,
        }];
        let index = ReadPairIndex::build(&selected, 150);
        assert!(index.is_empty());
    }

    #[test]
    fn filter_lookup_uses_packed_form() {
        // Guard against orientation mixups: a filter built from one strand
        // plus closure answers for both.
        let region = soup(300, 5);
        let filter = filter_of(&region);
        let (kmer, ok) = pack(&region, 10, 32);
        assert!(ok);
        assert!(filter.contains(&kmer));
        assert!(filter.contains(&crate::kmer::reverse_complement(kmer, 32)));
    }
}
