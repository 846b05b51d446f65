//! Command-line interface definition.

use clap::Parser;
use std::path::PathBuf;

use crate::config::{default_threads, Params};
use crate::reader::Pairing;

/// A targeted amplicon assembler.
///
/// Give it a forward and reverse PCR primer (IUPAC ambiguity codes allowed)
/// and a set of FASTA/FASTQ read files, and it assembles the full-length
/// inter-primer sequences those reads cover.
///
/// # Examples
///
/// ```bash
/// # Extract 16S V4 amplicons from a paired shotgun dataset
/// amplicora -f GTGYCAGCMGCCGCGGTAA -r GGACTACNVGGGTWTCTAAT \
///     sample_R1.fastq sample_R2.fastq -o sample_16S.fa
///
/// # Glob inputs, dereplicated output
/// amplicora -f GTGYCAGCMGCCGCGGTAA -r GGACTACNVGGGTWTCTAAT \
///     'runs/*.fastq' -o all_16S.fa --derep
/// ```
#[derive(Parser, Debug)]
#[command(name = "amplicora")]
#[command(version, author, about, long_about = None)]
pub struct Args {
    /// Forward primer (5'-3', up to 32 bases)
    #[arg(short = 'f', long = "forward")]
    pub forward: String,

    /// Reverse primer (5'-3', up to 32 bases)
    #[arg(short = 'r', long = "reverse")]
    pub reverse: String,

    /// Read files (FASTA or FASTQ; glob patterns allowed)
    #[arg(required = true)]
    pub reads: Vec<String>,

    /// Output FASTA of assembled amplicons
    #[arg(short = 'o', long = "output", default_value = "amplicons.fa")]
    pub output: PathBuf,

    /// Worker threads
    #[arg(short = 't', long = "threads", default_value_t = default_threads())]
    pub threads: usize,

    /// Treat consecutive files as R1/R2 pairs
    #[arg(long = "paired", conflicts_with = "unpaired")]
    pub paired: bool,

    /// Treat every file as unpaired
    #[arg(long = "unpaired")]
    pub unpaired: bool,

    /// Primer mismatches allowed (both roles)
    #[arg(long = "mismatches", default_value = "1", value_parser = clap::value_parser!(u8).range(0..=2))]
    pub mismatches: u8,

    /// Sliding-window quality target for 3' trimming of FASTQ reads
    #[arg(long = "qual-trim", default_value = "30")]
    pub qual_trim: u8,

    /// Minimum k-mer depth treated as signal
    #[arg(long = "min-depth", default_value = "2")]
    pub min_depth: u32,

    /// Minimum emitted amplicon length
    #[arg(long = "min-length")]
    pub min_length: Option<usize>,

    /// Maximum emitted amplicon length
    #[arg(long = "max-length")]
    pub max_length: Option<usize>,

    /// Keep only region k-mers present in both files of a pair
    #[arg(long = "strict")]
    pub strict: bool,

    /// Collapse identical amplicons into ;size= records
    #[arg(long = "derep")]
    pub derep: bool,

    /// Keep low-complexity reads during region growth
    #[arg(long = "keep-low-complexity")]
    pub keep_low_complexity: bool,

    /// Write <output>_primers.txt with the observed primer forms
    #[arg(long = "primers")]
    pub save_primers: bool,

    /// Write the selected inter-primer reads as FASTA
    #[arg(long = "filtered")]
    pub save_filtered: bool,

    /// Retain partition temp files and write the kept-metadata manifest
    #[arg(long = "kept")]
    pub keep_partitions: bool,

    /// Partition directory (a fresh temp dir when omitted)
    #[arg(long = "tmp")]
    pub temp_dir: Option<PathBuf>,

    /// RNG seed for reproducible fork coin tosses
    #[arg(long = "seed")]
    pub seed: Option<u64>,
}

impl Args {
    /// The pairing mode the flags force, if any.
    #[must_use]
    pub fn forced_pairing(&self) -> Option<Pairing> {
        if self.paired {
            Some(Pairing::Paired)
        } else if self.unpaired {
            Some(Pairing::Unpaired)
        } else {
            None
        }
    }

    /// Lowers the parsed arguments into engine parameters.
    #[must_use]
    pub fn to_params(&self) -> Params {
        Params {
            mismatches_fwd: usize::from(self.mismatches),
            mismatches_rvs: usize::from(self.mismatches),
            qual_trim: self.qual_trim,
            min_depth: self.min_depth,
            threads: self.threads.max(1),
            strict: self.strict,
            derep: self.derep,
            keep_low_complexity: self.keep_low_complexity,
            min_length: self.min_length,
            max_length: self.max_length,
            save_primers: self.save_primers,
            save_filtered: self.save_filtered,
            keep_partitions: self.keep_partitions,
            temp_dir: self.temp_dir.clone(),
            seed: self.seed,
            ..Params::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("amplicora").chain(args.iter().copied()))
    }

    #[test]
    fn minimal_invocation_parses() {
        let args = parse(&[
            "-f",
            "GTGYCAGCMGCCGCGGTAA",
            "-r",
            "GGACTACNVGGGTWTCTAAT",
            "reads.fq",
        ]);
        assert_eq!(args.reads, vec!["reads.fq"]);
        assert_eq!(args.mismatches, 1);
        assert!(args.forced_pairing().is_none());
    }

    #[test]
    fn paired_and_unpaired_conflict() {
        let result = Args::try_parse_from([
            "amplicora",
            "-f",
            "ACGT",
            "-r",
            "ACGT",
            "--paired",
            "--unpaired",
            "r.fq",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn mismatches_bounded() {
        let result = Args::try_parse_from([
            "amplicora",
            "-f",
            "ACGT",
            "-r",
            "ACGT",
            "--mismatches",
            "5",
            "r.fq",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn params_lowering() {
        let args = parse(&[
            "-f",
            "ACGTACGTACGTACGT",
            "-r",
            "ACGTACGTACGTACGT",
            "--strict",
            "--derep",
            "--min-length",
            "200",
            "--seed",
            "7",
            "r.fq",
        ]);
        let params = args.to_params();
        assert!(params.strict);
        assert!(params.derep);
        assert_eq!(params.min_length, Some(200));
        assert_eq!(params.seed, Some(7));
        assert_eq!(params.kmer_len, 32);
    }
}
