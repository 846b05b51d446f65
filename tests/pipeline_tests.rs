//! End-to-end assembly scenarios.
//!
//! A synthetic amplicon is shredded into noisy reads, written to a FASTA
//! file, and pushed through the whole pipeline via the public `run` entry
//! point, asserting on the files a user would see.

use std::io::Write;
use std::path::{Path, PathBuf};

use amplicora::bases::reverse_complement;
use amplicora::cli::Args;
use amplicora::error::AmplicoraError;
use amplicora::run;
use tempfile::TempDir;

const FWD: &str = "GTGYCAGCMGCCGCGGTAA";
const RVS: &str = "GGACTACNVGGGTWTCTAAT";

struct Xorshift(u64);

impl Xorshift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

/// A 300-base amplicon: forward primer, unique interior, RC of the reverse
/// primer.
fn source_sequence() -> Vec<u8> {
    let mut rng = Xorshift(0xfeed_babe_dead_beef);
    let mut seq = b"GTGTCAGCAGCCGCGGTAA".to_vec();
    while seq.len() < 280 {
        seq.push(b"ACGT"[(rng.next() % 4) as usize]);
    }
    seq.extend(reverse_complement(b"GGACTACAAGGGTATCTAAT"));
    seq
}

/// Shreds the source into reads of length 120 from cycling start positions
/// on alternating strands, with roughly 1% substitution error. Every 30th
/// read is left error-free.
fn noisy_reads(source: &[u8], count: usize) -> Vec<Vec<u8>> {
    let read_len = 120;
    let span = source.len() - read_len;
    let mut rng = Xorshift(0x0123_4567_89ab_cdef);

    (0..count)
        .map(|i| {
            let start = (i * 7) % (span + 1);
            let mut read = source[start..start + read_len].to_vec();
            if i % 2 == 1 {
                read = reverse_complement(&read);
            }
            if i % 30 != 0 {
                for base in &mut read {
                    if rng.next() % 100 == 0 {
                        *base = match *base {
                            b'A' => b'C',
                            b'C' => b'G',
                            b'G' => b'T',
                            _ => b'A',
                        };
                    }
                }
            }
            read
        })
        .collect()
}

fn write_fasta(dir: &Path, name: &str, reads: &[Vec<u8>]) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for (i, read) in reads.iter().enumerate() {
        writeln!(file, ">read{i}").unwrap();
        file.write_all(read).unwrap();
        writeln!(file).unwrap();
    }
    path
}

fn base_args(input: &Path, output: PathBuf) -> Args {
    Args {
        forward: FWD.into(),
        reverse: RVS.into(),
        reads: vec![input.to_string_lossy().into_owned()],
        output,
        threads: 2,
        paired: false,
        unpaired: true,
        mismatches: 1,
        qual_trim: 30,
        min_depth: 2,
        min_length: None,
        max_length: None,
        strict: false,
        derep: false,
        keep_low_complexity: false,
        save_primers: false,
        save_filtered: false,
        keep_partitions: false,
        temp_dir: None,
        seed: Some(17),
    }
}

/// Parses `>header\nseq` records.
fn read_fasta(path: &Path) -> Vec<(String, Vec<u8>)> {
    let text = std::fs::read_to_string(path).unwrap();
    let mut records = Vec::new();
    let mut header = String::new();
    for line in text.lines() {
        if let Some(h) = line.strip_prefix('>') {
            header = h.to_string();
        } else if !line.is_empty() {
            records.push((header.clone(), line.as_bytes().to_vec()));
        }
    }
    records
}

#[test]
fn assembles_exact_amplicon_from_noisy_reads() {
    let dir = TempDir::new().unwrap();
    let source = source_sequence();
    let reads = noisy_reads(&source, 600);
    let input = write_fasta(dir.path(), "reads.fa", &reads);
    let output = dir.path().join("amplicons.fa");

    let args = base_args(&input, output.clone());
    let summary = run::run(&args).unwrap();

    assert!(summary.primer_hits > 0);
    assert!(summary.tp_reached >= 1, "no extension reached the terminator");
    assert!(summary.kept >= 1);

    // The inter-primer region, both primers stripped.
    let forward_len = FWD.len();
    let reverse_len = RVS.len();
    let expected = &source[forward_len..source.len() - reverse_len];

    let records = read_fasta(&output);
    assert!(!records.is_empty());
    assert!(
        records.iter().any(|(_, seq)| seq == expected),
        "no record reproduced the source region exactly"
    );
    // Nothing that disagrees with the source survives to the output.
    for (header, seq) in &records {
        assert_eq!(seq, &expected.to_vec(), "divergent record {header}");
    }
    // TP-tagged records carry both primer annotations.
    assert!(records
        .iter()
        .any(|(header, _)| header.contains(";FP=") && header.contains(";TP=")));
}

#[test]
fn derep_mode_collapses_identical_amplicons() {
    let dir = TempDir::new().unwrap();
    let source = source_sequence();
    let reads = noisy_reads(&source, 600);
    let input = write_fasta(dir.path(), "reads.fa", &reads);
    let output = dir.path().join("amplicons.fa");

    let mut args = base_args(&input, output.clone());
    args.derep = true;
    let summary = run::run(&args).unwrap();
    assert!(summary.kept >= 1);

    let records = read_fasta(&output);
    assert_eq!(records.len(), 1, "derep left duplicate records");
    assert!(records[0].0.contains(";size="));
}

#[test]
fn no_starting_reads_is_a_clean_error() {
    let dir = TempDir::new().unwrap();
    // Reads unrelated to either primer.
    let mut rng = Xorshift(0xabcd);
    let reads: Vec<Vec<u8>> = (0..50)
        .map(|_| {
            (0..100)
                .map(|_| b"ACGT"[(rng.next() % 4) as usize])
                .collect()
        })
        .collect();
    let input = write_fasta(dir.path(), "reads.fa", &reads);
    let output = dir.path().join("amplicons.fa");

    let err = run::run(&base_args(&input, output)).unwrap_err();
    assert!(matches!(err, AmplicoraError::NoStartingReads));
}

#[test]
fn unmatched_glob_is_reported() {
    let dir = TempDir::new().unwrap();
    let mut args = base_args(&dir.path().join("nothing.fa"), dir.path().join("out.fa"));
    args.reads = vec![dir.path().join("*.fastq").to_string_lossy().into_owned()];
    let err = run::run(&args).unwrap_err();
    assert!(matches!(err, AmplicoraError::UnmatchedGlob { .. }));
}

#[test]
fn kept_partitions_leave_a_manifest() {
    let dir = TempDir::new().unwrap();
    let source = source_sequence();
    let reads = noisy_reads(&source, 240);
    let input = write_fasta(dir.path(), "reads.fa", &reads);
    let output = dir.path().join("amplicons.fa");
    let partition_dir = dir.path().join("parts");

    let mut args = base_args(&input, output);
    args.keep_partitions = true;
    args.temp_dir = Some(partition_dir.clone());
    run::run(&args).unwrap();

    let manifest = partition_dir.join("amplicora_kept_metadata.txt");
    let text = std::fs::read_to_string(manifest).unwrap();
    assert!(text.starts_with("longest\t120"));
    assert!(text.contains("amplicora_0_0.tmp\t"));
}
