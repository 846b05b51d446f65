//! Depth-table denoising.
//!
//! Sequencing errors leave characteristic marks in the k-mer depth table:
//! shallow k-mers a hundredfold below their neighbours, one-sided strand
//! balance, and *craters* — depressions of at most k consecutive windows
//! where a single wrong base drags every spanning k-mer down. The denoiser
//! walks each selected read, votes to cull or redeem the k-mers it crosses,
//! and then reconciles the votes globally. Culled k-mers are zeroed in the
//! table, never removed.

use dashmap::DashMap;
use rayon::prelude::*;
use std::hash::BuildHasherDefault;

use crate::bases::encode_base;
use crate::config::Params;
use crate::counts::{DashFx, KmerCountTable};
use crate::kmer::{canonical, generate_from_read, shift_append, with_last_base, KmerArray};
use crate::scan::PrimerRole;
use crate::select::SelectedRead;

/// Per-read depth statistics.
#[derive(Debug, Clone, Default)]
pub struct ReadStats {
    pub avg_depth: f64,
    pub harmonic_mean_depth: f64,
    /// The depth floor this read is held to (`minDepthForRead`).
    pub min_depth_allowed: u32,
    pub min_depth_found: u32,
    /// Depth of the first k-mer at or above the floor.
    pub initial_good_depth: u32,
}

/// Fraction of k-mers ignored at a primer-tagged edge when averaging.
const PRIMER_EDGE_FRACTION: usize = 20;

/// Computes the depth statistics of one read against the count table.
#[must_use]
pub fn read_stats(
    seq: &[u8],
    role: Option<PrimerRole>,
    table: &KmerCountTable,
    params: &Params,
) -> ReadStats {
    let array = generate_from_read(seq, params.kmer_len);
    let depths: Vec<u32> = array
        .kmers
        .iter()
        .zip(&array.valid)
        .map(|(&kmer, &ok)| if ok { table.depth(kmer) } else { 0 })
        .collect();
    if depths.is_empty() {
        return ReadStats::default();
    }

    // Primer-tagged edges are depth outliers (every starting read shares
    // them); keep them out of the averages.
    let edge = depths.len().div_ceil(PRIMER_EDGE_FRACTION);
    let (from, to) = match role {
        Some(role) if role.at_start() => (edge, depths.len()),
        Some(_) => (0, depths.len() - edge),
        None => (0, depths.len()),
    };
    let included = &depths[from..to.max(from + 1).min(depths.len())];

    let above_floor: Vec<u32> = included
        .iter()
        .copied()
        .filter(|&d| d > params.min_depth)
        .collect();
    let avg_depth = if above_floor.is_empty() {
        f64::from(params.min_depth)
    } else {
        f64::from(above_floor.iter().sum::<u32>()) / above_floor.len() as f64
    };

    let noise_floor = avg_depth / f64::from(params.error_rate);

    // The median-depth k-mer: smallest log-distance to the average, above
    // the noise floor.
    let median_at = included
        .iter()
        .enumerate()
        .filter(|&(_, &d)| f64::from(d) > noise_floor && d > 0)
        .min_by(|&(_, &a), &(_, &b)| {
            let da = (f64::from(a).log10() - avg_depth.log10()).abs();
            let db = (f64::from(b).log10() - avg_depth.log10()).abs();
            da.total_cmp(&db)
        })
        .map(|(i, _)| from + i);

    let min_depth_allowed = median_at.map_or(params.min_depth, |at| {
        let median_depth = depths[at];
        let deepest_noise = last_base_variants(&array, at, params.kmer_len)
            .into_iter()
            .map(|v| table.depth(v))
            .filter(|&d| d * 10 <= median_depth)
            .max()
            .unwrap_or(0);
        (deepest_noise + 1).max(params.min_depth)
    });

    let positive: Vec<u32> = included.iter().copied().filter(|&d| d > 0).collect();
    let harmonic_mean_depth = if positive.is_empty() {
        0.0
    } else {
        positive.len() as f64 / positive.iter().map(|&d| 1.0 / f64::from(d)).sum::<f64>()
    };

    ReadStats {
        avg_depth,
        harmonic_mean_depth,
        min_depth_allowed,
        min_depth_found: included.iter().copied().min().unwrap_or(0),
        initial_good_depth: depths
            .iter()
            .copied()
            .find(|&d| d >= min_depth_allowed)
            .unwrap_or(params.min_depth),
    }
}

/// The substitution variants considered for the k-mer at `at`: every
/// single-base substitution for the read's first k-mer, only the newest
/// (last) base elsewhere — earlier bases were vetted by earlier windows.
fn variant_kmers(array: &KmerArray, at: usize, k: usize) -> Vec<u64> {
    if at == 0 {
        all_single_substitutions(array.kmers[0], k)
    } else {
        last_base_variants(array, at, k)
    }
}

fn last_base_variants(array: &KmerArray, at: usize, k: usize) -> Vec<u64> {
    let kmer = array.kmers[at];
    let current = (kmer >> (64 - 2 * k as u32)) & 0b11;
    (0..4u8)
        .filter(|&bits| u64::from(bits) != current)
        .map(|bits| with_last_base(kmer, k, bits))
        .collect()
}

fn all_single_substitutions(kmer: u64, k: usize) -> Vec<u64> {
    let mut variants = Vec::with_capacity(3 * k);
    for pos in 0..k {
        let shift = 62 - 2 * pos as u32;
        let current = (kmer >> shift) & 0b11;
        for bits in 0..4u64 {
            if bits != current {
                variants.push(kmer & !(0b11 << shift) | bits << shift);
            }
        }
    }
    variants
}

/// Outcome summary of a denoise pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenoiseStats {
    pub kmers_culled: usize,
    pub cull_votes: usize,
    pub redeem_votes: usize,
}

/// Scans every selected read, reconciles the votes, and zeroes the losers.
pub fn denoise(
    table: &mut KmerCountTable,
    selected: &[SelectedRead],
    params: &Params,
) -> DenoiseStats {
    let cull_votes: DashFx<u32> = DashMap::with_hasher(BuildHasherDefault::default());
    let redeem_votes: DashFx<u32> = DashMap::with_hasher(BuildHasherDefault::default());

    selected.par_iter().for_each(|read| {
        scan_read(read, table, params, &cull_votes, &redeem_votes);
    });

    let mut stats = DenoiseStats {
        cull_votes: cull_votes.iter().map(|e| *e.value() as usize).sum(),
        redeem_votes: redeem_votes.iter().map(|e| *e.value() as usize).sum(),
        ..DenoiseStats::default()
    };

    // A k-mer goes only when the cull verdict is lopsided and the support
    // that remains is indistinguishable from noise.
    for entry in cull_votes.iter() {
        let canon = *entry.key();
        let culls = *entry.value();
        let redeemed = redeem_votes.get(&canon).map_or(0, |v| *v);
        if culls > 5 * redeemed && redeemed <= params.min_depth && table.depth(canon) > 0 {
            table.zero(canon);
            stats.kmers_culled += 1;
        }
    }
    stats
}

/// Walks one read voting cull/redeem per k-mer.
#[allow(clippy::too_many_lines)]
fn scan_read(
    read: &SelectedRead,
    table: &KmerCountTable,
    params: &Params,
    cull_votes: &DashFx<u32>,
    redeem_votes: &DashFx<u32>,
) {
    let k = params.kmer_len;
    let array = generate_from_read(&read.seq, k);
    if array.is_empty() {
        return;
    }
    let n = array.len();
    let depths: Vec<u32> = array
        .kmers
        .iter()
        .zip(&array.valid)
        .map(|(&kmer, &ok)| if ok { table.depth(kmer) } else { 0 })
        .collect();

    let stats = read_stats(&read.seq, read.role, table, params);
    let floor = stats.min_depth_allowed;
    let long_enough = read.seq.len() >= 2 * k;

    let mut previous_good = stats.initial_good_depth.max(params.min_depth);
    let mut max_culled_depth = 0u32;
    let mut last_cull: Option<usize> = None;
    let mut first_cull: Option<usize> = None;
    let vote_cull = |kmer: u64| {
        *cull_votes.entry(canonical(kmer, k)).or_insert(0) += 1;
    };

    let mut p = 0;
    while p < n {
        if !array.valid[p] {
            p += 1;
            continue;
        }
        let kmer = array.kmers[p];
        let d = depths[p];

        // Fast path: at least as deep as the last good k-mer, both strands
        // seen.
        if d >= previous_good && !table.is_unbalanced(kmer) {
            previous_good = d;
            if long_enough && last_cull.map_or(true, |lc| p >= lc + k / 4) {
                *redeem_votes.entry(canonical(kmer, k)).or_insert(0) += 1;
            }
            p += 1;
            continue;
        }

        let variants = variant_kmers(&array, p, k);
        let deepest = variants.iter().map(|&v| table.depth(v)).max().unwrap_or(0);
        let variant_sum: u64 = variants.iter().map(|&v| u64::from(table.depth(v))).sum();
        let crater = crater_end(&depths, p, k, previous_good);

        let cullable = u64::from(d) * u64::from(params.error_rate) <= u64::from(previous_good)
            || u64::from(d) * u64::from(params.error_rate) <= variant_sum
            || table.is_unbalanced(kmer)
            || (d <= max_culled_depth && max_culled_depth > 0)
            || crater.is_some();

        let close_to_deepest = deepest > 0 && d * 10 >= deepest;
        let redeemed_by_followers = cullable
            && !close_to_deepest
            && status_quo_followers(&array, &depths, p, floor, k)
                >= best_variant_followers(&read.seq, &variants, p, floor, k, table);

        if cullable && !close_to_deepest && !redeemed_by_followers {
            vote_cull(kmer);
            max_culled_depth = max_culled_depth.max(d);
            first_cull = first_cull.or(Some(p));
            last_cull = Some(p);

            // Propagate across the depression, at most k positions.
            let end = crater.unwrap_or((p + k).min(n));
            let ceiling = previous_good.max(1);
            let mut q = p + 1;
            while q < end.min(n) && depths[q] < ceiling {
                if array.valid[q] {
                    vote_cull(array.kmers[q]);
                    max_culled_depth = max_culled_depth.max(depths[q]);
                    last_cull = Some(q);
                }
                q += 1;
            }
            p = q;
            continue;
        }

        // Accepted despite the dip.
        if d >= floor {
            previous_good = d;
        }
        if long_enough && last_cull.map_or(true, |lc| p >= lc + k / 4) {
            *redeem_votes.entry(canonical(kmer, k)).or_insert(0) += 1;
        }
        p += 1;
    }

    // A cull right at the start throws the k-mers before it into doubt: they
    // were accepted against an initial previousGood that the cull disproved.
    if let Some(fc) = first_cull {
        if fc > 0 && fc < k {
            let dubious = depths[..fc]
                .iter()
                .all(|&d| d <= max_culled_depth.saturating_mul(2));
            if dubious {
                for q in 0..fc {
                    if array.valid[q] {
                        vote_cull(array.kmers[q]);
                    }
                }
            }
        }
    }
}

/// End of the depth depression starting at `p`, if it recovers within k
/// positions to a level that holds.
fn crater_end(depths: &[u32], p: usize, k: usize, previous_good: u32) -> Option<usize> {
    let limit = (p + k).min(depths.len() - 1);
    for q in p + 1..=limit {
        if depths[q] >= previous_good && previous_good > 0 {
            let post = &depths[q..(q + 4).min(depths.len())];
            let mean = post.iter().map(|&d| u64::from(d)).sum::<u64>() / post.len() as u64;
            if mean >= u64::from(previous_good) {
                return Some(q);
            }
        }
    }
    None
}

const FOLLOWER_CAP: u32 = 32;
const MAX_CONSECUTIVE_MISSES: u32 = 2;
const MAX_TOTAL_MISSES: u32 = 3;

/// How far the read's own continuation stays above the floor.
fn status_quo_followers(array: &KmerArray, depths: &[u32], p: usize, floor: u32, k: usize) -> u32 {
    let mut count = 0;
    let mut consecutive = 0;
    let mut misses = 0;
    for q in p + 1..array.len().min(p + 1 + k) {
        let hit = array.valid[q] && depths[q] >= floor;
        if hit {
            count += 1;
            consecutive = 0;
        } else {
            consecutive += 1;
            misses += 1;
            if consecutive > MAX_CONSECUTIVE_MISSES || misses > MAX_TOTAL_MISSES {
                break;
            }
        }
        if count >= FOLLOWER_CAP {
            break;
        }
    }
    count
}

/// The best follower chain among the variants, each followed along the
/// read's subsequent bases, branching to a substitute base when the straight
/// path dies.
fn best_variant_followers(
    seq: &[u8],
    variants: &[u64],
    p: usize,
    floor: u32,
    k: usize,
    table: &KmerCountTable,
) -> u32 {
    variants
        .iter()
        .map(|&v| variant_followers(seq, v, p, floor, k, table))
        .max()
        .unwrap_or(0)
}

fn variant_followers(
    seq: &[u8],
    variant: u64,
    p: usize,
    floor: u32,
    k: usize,
    table: &KmerCountTable,
) -> u32 {
    let mut current = variant;
    let mut count = 0;
    let mut consecutive = 0;
    let mut misses = 0;

    for next in p + k..seq.len().min(p + 2 * k) {
        let Some(bits) = encode_base(seq[next]) else {
            break;
        };
        let mut extended = shift_append(current, k, bits);
        if table.depth(extended) >= floor {
            count += 1;
            consecutive = 0;
        } else {
            // Branch: maybe the read base itself is wrong here.
            let branched = (0..4u8)
                .filter(|&b| b != bits)
                .map(|b| shift_append(current, k, b))
                .find(|&alt| table.depth(alt) >= floor);
            if let Some(alt) = branched {
                extended = alt;
                count += 1;
                consecutive = 0;
                misses += 1;
            } else {
                consecutive += 1;
                misses += 1;
            }
            if consecutive > MAX_CONSECUTIVE_MISSES || misses > MAX_TOTAL_MISSES {
                break;
            }
        }
        current = extended;
        if count >= FOLLOWER_CAP {
            break;
        }
    }
    count
}
