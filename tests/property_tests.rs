//! Property-based tests using proptest.
//!
//! These pin the algebraic laws the engine rests on: packing round-trips,
//! canonical-form idempotence, context-hash agreement between the direct and
//! variant paths, and the primer expansion mismatch bound.

use amplicora::bases;
use amplicora::context::{hash_context, hash_context_variant};
use amplicora::kmer::{
    canonical, expand, generate_from_read, pack, reverse_complement, shift_append,
};
use amplicora::primer::{expand_degenerate, expand_with_mismatches, Primer};
use proptest::prelude::*;

/// Strategy for DNA sequences over the plain alphabet.
fn dna(min_len: usize, max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(
        prop_oneof![Just(b'A'), Just(b'C'), Just(b'G'), Just(b'T')],
        min_len..=max_len,
    )
}

/// Strategy for primers with up to two ambiguity codes; more would blow up
/// the expansion sets and make these cases crawl.
fn degenerate_primer() -> impl Strategy<Value = Vec<u8>> {
    let code = prop_oneof![Just(b'R'), Just(b'Y'), Just(b'M'), Just(b'W'), Just(b'N')];
    (
        dna(16, 24),
        proptest::collection::vec((0usize..24, code), 0..=2),
    )
        .prop_map(|(mut seq, subs)| {
            for (pos, code) in subs {
                let at = pos % seq.len();
                seq[at] = code;
            }
            seq
        })
}

proptest! {
    /// Packing then expanding is the identity.
    #[test]
    fn pack_expand_roundtrip(seq in dna(1, 32)) {
        let (kmer, ok) = pack(&seq, 0, seq.len());
        prop_assert!(ok);
        prop_assert_eq!(expand(kmer, seq.len()), seq);
    }

    /// The bitwise reverse complement agrees with the text-level one.
    #[test]
    fn rc_matches_text(seq in dna(1, 32)) {
        let (kmer, _) = pack(&seq, 0, seq.len());
        let rc_text = bases::reverse_complement(&seq);
        let (rc_packed, _) = pack(&rc_text, 0, rc_text.len());
        prop_assert_eq!(reverse_complement(kmer, seq.len()), rc_packed);
    }

    /// canonical(canonical(x)) == canonical(x), and the canonical form is
    /// numerically no greater than its own RC.
    #[test]
    fn canonical_laws(seq in dna(1, 32)) {
        let k = seq.len();
        let (kmer, _) = pack(&seq, 0, k);
        let canon = canonical(kmer, k);
        prop_assert_eq!(canonical(canon, k), canon);
        prop_assert!(canon <= reverse_complement(canon, k));
    }

    /// A k-mer and its reverse complement share a canonical form.
    #[test]
    fn canonical_orientation_free(seq in dna(1, 32)) {
        let k = seq.len();
        let (kmer, _) = pack(&seq, 0, k);
        prop_assert_eq!(canonical(kmer, k), canonical(reverse_complement(kmer, k), k));
    }

    /// The variant context hash with the extracted terminal k-mer equals the
    /// direct hash.
    #[test]
    fn context_variant_agrees(seq in dna(44, 100), offset in 0usize..10) {
        let l = 44;
        prop_assume!(offset + l <= seq.len());
        let (last, ok) = pack(&seq, offset + l - 32, 32);
        prop_assert!(ok);
        prop_assert_eq!(
            hash_context(&seq, offset, l, 32),
            Some(hash_context_variant(&seq, offset, l, last))
        );
    }

    /// Sliding the packed window matches packing the slid window.
    #[test]
    fn shift_append_matches_repack(seq in dna(33, 64)) {
        let k = 32;
        let (a, _) = pack(&seq, 0, k);
        let (b, _) = pack(&seq, 1, k);
        let bits = match seq[k] {
            b'A' => 0u8,
            b'C' => 1,
            b'G' => 2,
            _ => 3,
        };
        prop_assert_eq!(shift_append(a, k, bits), b);
    }

    /// Every tiled k-mer equals the directly packed window.
    #[test]
    fn tiling_matches_direct_pack(seq in dna(32, 80)) {
        let array = generate_from_read(&seq, 32);
        for (i, (&kmer, &ok)) in array.kmers.iter().zip(&array.valid).enumerate() {
            prop_assert!(ok);
            let (direct, _) = pack(&seq, i, 32);
            prop_assert_eq!(kmer, direct);
        }
    }

    /// Every expanded primer variant stays within the configured mismatch
    /// allowance of the original degenerate primer.
    #[test]
    fn expansion_respects_mismatch_bound(primer in degenerate_primer(), mismatches in 0usize..=1) {
        let parsed = Primer::new(&primer).unwrap();
        let exact = expand_degenerate(&primer);
        let variants = expand_with_mismatches(&exact, mismatches, 0);
        for variant in variants.iter().take(500) {
            prop_assert!(parsed.mismatch_count(variant) <= mismatches);
        }
    }

    /// The literal degenerate expansions are always present at distance 0.
    #[test]
    fn exact_expansions_are_distance_zero(primer in degenerate_primer()) {
        let parsed = Primer::new(&primer).unwrap();
        for variant in expand_degenerate(&primer).iter().take(200) {
            prop_assert_eq!(parsed.mismatch_count(variant), 0);
        }
    }
}
