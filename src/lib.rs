//! # Amplicora
//!
//! A targeted amplicon assembler. Given a pair of PCR primers and a set of
//! short-read sequencing files (FASTA or FASTQ, optionally paired, possibly
//! whole-genome shotgun), it assembles the full-length inter-primer
//! sequences those reads cover — for example, pulling 16S or COI marker
//! regions straight out of metagenomic data.
//!
//! The engine runs in two phases:
//!
//! 1. **Region filtering.** Primer-matching seed reads grow an iterative
//!    membership filter — k-mers plus per-length context fingerprints — that
//!    decides which reads belong to the inter-primer region.
//! 2. **Context-guided extension.** Each read that begins with the forward
//!    primer is extended one base at a time against a denoised k-mer depth
//!    table and a family of context tables, resolving forks by look-ahead,
//!    read coverage, and paired-read constraints, until the reverse primer's
//!    reverse complement terminates it.
//!
//! `amplicora` leans on [`rayon`](https://docs.rs/rayon) for parallel read
//! processing and [`dashmap`](https://docs.rs/dashmap) for the shared
//! tables.
//!
//! ```bash
//! amplicora -f GTGYCAGCMGCCGCGGTAA -r GGACTACNVGGGTWTCTAAT \
//!     sample_R1.fastq sample_R2.fastq -o sample_16S.fa
//! ```

pub mod bases;
pub mod cli;
pub mod config;
pub mod context;
pub mod contexts;
pub mod counts;
pub mod denoise;
pub mod error;
pub mod extend;
pub mod kmer;
pub mod partition;
pub mod primer;
pub mod reader;
pub mod region;
pub mod rng;
pub mod run;
pub mod scan;
pub mod select;
pub mod starts;
pub mod trim;

pub use config::Params;
pub use error::AmplicoraError;
pub use run::{run, RunSummary};
