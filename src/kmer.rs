//! Packed k-mer codec.
//!
//! K-mers of length `k <= 32` are packed two bits per base into a `u64`,
//! left-aligned: the first base occupies the top two bits. The reverse
//! complement is computed bitwise (complement every 2-bit field, reverse the
//! field order, realign), never via the text form. The canonical form of a
//! k-mer is the numeric minimum of the k-mer and its reverse complement.

use crate::bases::{decode_base, encode_base};

/// The pipeline-wide k-mer length.
pub const KMER_LEN: usize = 32;

/// Packs `k` bases starting at `offset` into a left-aligned `u64`.
///
/// The second element is `false` when the window spans a base outside
/// A/C/G/T; the packed value is meaningless in that case.
#[inline]
#[must_use]
pub fn pack(seq: &[u8], offset: usize, k: usize) -> (u64, bool) {
    if offset + k > seq.len() {
        return (0, false);
    }
    let mut kmer = 0u64;
    for &base in &seq[offset..offset + k] {
        let Some(bits) = encode_base(base) else {
            return (0, false);
        };
        kmer = kmer << 2 | u64::from(bits);
    }
    (kmer << (64 - 2 * k as u32), true)
}

/// Reverse complement of a packed k-mer.
///
/// Complementing a 2-bit field is bitwise NOT (00 <-> 11, 01 <-> 10); the
/// field order is reversed with pair swaps and a byte swap, after which the
/// occupied fields sit at the low end and are shifted back up for k < 32.
#[inline]
#[must_use]
pub fn reverse_complement(kmer: u64, k: usize) -> u64 {
    let mut rc = !kmer;
    rc = (rc & 0x3333_3333_3333_3333) << 2 | (rc >> 2) & 0x3333_3333_3333_3333;
    rc = (rc & 0x0F0F_0F0F_0F0F_0F0F) << 4 | (rc >> 4) & 0x0F0F_0F0F_0F0F_0F0F;
    rc = rc.swap_bytes();
    rc << (64 - 2 * k as u32)
}

/// Canonical form: the numeric minimum of a k-mer and its reverse complement.
#[inline]
#[must_use]
pub fn canonical(kmer: u64, k: usize) -> u64 {
    kmer.min(reverse_complement(kmer, k))
}

/// Expands a packed k-mer back into its text form.
#[must_use]
pub fn expand(kmer: u64, k: usize) -> Vec<u8> {
    (0..k).map(|i| decode_base(kmer >> (62 - 2 * i))).collect()
}

/// Slides the window one base: drops the first base, appends `bits` (a 2-bit
/// encoded base) as the new last base.
#[inline]
#[must_use]
pub fn shift_append(kmer: u64, k: usize, bits: u8) -> u64 {
    let tail_shift = 64 - 2 * k as u32;
    (kmer << 2) & (u64::MAX << tail_shift) | u64::from(bits) << tail_shift
}

/// Replaces the last base of the window with `bits`.
#[inline]
#[must_use]
pub fn with_last_base(kmer: u64, k: usize, bits: u8) -> u64 {
    let tail_shift = 64 - 2 * k as u32;
    kmer & !(0b11 << tail_shift) | u64::from(bits) << tail_shift
}

/// The tiled k-mers of one read, with a parallel validity track.
///
/// `kmers[i]` packs `seq[i..i + k]`; `valid[i]` is `false` where the window
/// spans an ambiguous base. Reads shorter than `k` produce empty arrays.
#[derive(Debug, Clone, Default)]
pub struct KmerArray {
    pub kmers: Vec<u64>,
    pub valid: Vec<bool>,
}

impl KmerArray {
    #[must_use]
    pub fn len(&self) -> usize {
        self.kmers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kmers.is_empty()
    }
}

/// Tiles every k-mer of a read in one rolling pass.
#[must_use]
pub fn generate_from_read(seq: &[u8], k: usize) -> KmerArray {
    if seq.len() < k {
        return KmerArray::default();
    }
    let count = seq.len() - k + 1;
    let mut kmers = Vec::with_capacity(count);
    let mut valid = Vec::with_capacity(count);

    let mask = if k == 32 { u64::MAX } else { (1 << (2 * k)) - 1 };
    let mut rolling = 0u64;
    // Absolute position of the most recent non-ACGT base, if any.
    let mut last_bad: Option<usize> = None;

    for (pos, &base) in seq.iter().enumerate() {
        match encode_base(base) {
            Some(bits) => rolling = (rolling << 2 | u64::from(bits)) & mask,
            None => {
                rolling = rolling << 2 & mask;
                last_bad = Some(pos);
            }
        }
        if pos + 1 >= k {
            let start = pos + 1 - k;
            kmers.push(rolling << (64 - 2 * k as u32));
            valid.push(last_bad.map_or(true, |bad| bad < start));
        }
    }

    KmerArray { kmers, valid }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(seq: &[u8]) -> u64 {
        let (kmer, ok) = pack(seq, 0, seq.len());
        assert!(ok);
        kmer
    }

    #[test]
    fn pack_is_left_aligned() {
        // C = 01 in the top field
        assert_eq!(packed(b"C"), 0b01 << 62);
        assert_eq!(packed(b"CA"), 0b0100 << 60);
    }

    #[test]
    fn pack_rejects_ambiguity() {
        let (_, ok) = pack(b"ACGTN", 0, 5);
        assert!(!ok);
        let (_, ok) = pack(b"ACGRT", 1, 3);
        assert!(!ok);
    }

    #[test]
    fn pack_expand_roundtrip() {
        for seq in [&b"ACGT"[..], b"GATTACA", b"TTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT"] {
            assert_eq!(expand(packed(seq), seq.len()), seq);
        }
    }

    #[test]
    fn reverse_complement_matches_text_form() {
        let seq = b"GTGTCAGCAGCCGCGGTAA";
        let rc_text = crate::bases::reverse_complement(seq);
        assert_eq!(reverse_complement(packed(seq), seq.len()), packed(&rc_text));
    }

    #[test]
    fn reverse_complement_is_involution() {
        for seq in [&b"A"[..], b"ACGT", b"GATTACA", b"GTGTCAGCAGCCGCGGTAA"] {
            let kmer = packed(seq);
            let k = seq.len();
            assert_eq!(reverse_complement(reverse_complement(kmer, k), k), kmer);
        }
    }

    #[test]
    fn canonical_of_poly_a_and_poly_t_agree() {
        let a = packed(&[b'A'; 32]);
        let t = packed(&[b'T'; 32]);
        assert_eq!(canonical(a, 32), a);
        assert_eq!(canonical(t, 32), a);
    }

    #[test]
    fn canonical_is_idempotent() {
        for seq in [&b"TTTT"[..], b"GATTACA", b"CCGCGGTAA"] {
            let kmer = packed(seq);
            let k = seq.len();
            let canon = canonical(kmer, k);
            assert_eq!(canonical(canon, k), canon);
        }
    }

    #[test]
    fn generate_from_read_tiles_every_window() {
        let seq = b"ACGTACGT";
        let array = generate_from_read(seq, 4);
        assert_eq!(array.len(), 5);
        for (i, (&kmer, &ok)) in array.kmers.iter().zip(&array.valid).enumerate() {
            assert!(ok);
            let (direct, direct_ok) = pack(seq, i, 4);
            assert!(direct_ok);
            assert_eq!(kmer, direct);
        }
    }

    #[test]
    fn generate_from_read_marks_ambiguous_windows() {
        let array = generate_from_read(b"ACGTNACGT", 4);
        assert_eq!(array.len(), 6);
        assert_eq!(array.valid, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn generate_from_short_read_is_empty() {
        assert!(generate_from_read(b"ACG", 4).is_empty());
    }

    #[test]
    fn shift_append_slides_the_window() {
        let seq = b"ACGTACGTC";
        let (a, _) = pack(seq, 0, 8);
        let (b, _) = pack(seq, 1, 8);
        assert_eq!(shift_append(a, 8, 1), b); // C = 01
    }

    #[test]
    fn with_last_base_substitutes_in_place() {
        let (kmer, _) = pack(b"ACGTACGA", 0, 8);
        let (want, _) = pack(b"ACGTACGT", 0, 8);
        assert_eq!(with_last_base(kmer, 8, 3), want);
    }
}
