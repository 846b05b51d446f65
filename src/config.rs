//! Run configuration and validation.
//!
//! All tunables of the assembly engine in one place, with the defaults the
//! pipeline was calibrated against. The CLI layer builds one of these and
//! validates it before any file is touched.

use std::path::PathBuf;

use crate::error::AmplicoraError;

/// Parameters of one assembly run.
#[derive(Debug, Clone)]
pub struct Params {
    /// Packed k-mer length; fixed at 32 across the engine.
    pub kmer_len: usize,
    /// Shortest context length the context tables start from.
    pub shortest_context_size: usize,
    /// Shortest context length the region filter starts from.
    pub shortest_context_length: usize,
    /// Stride between context-table lengths.
    pub context_stride: usize,
    /// Stride between region-filter context lengths.
    pub filter_context_stride: usize,
    /// Recursion cap for fork resolution during extension.
    pub max_recursion: usize,
    /// Expected sequencing error rate, expressed as a divisor (1 in N).
    pub error_rate: u32,
    /// Minimum assembled length before the paired-read backward check kicks in.
    pub paired_read_kml: usize,
    /// Reads per on-disk partition file.
    pub reads_per_partition: usize,
    /// Reads handed to a worker in one batch.
    pub reads_in_batch: usize,
    /// Depth floor below which a k-mer is never trusted.
    pub min_depth: u32,
    /// Mismatches allowed when matching the forward primer.
    pub mismatches_fwd: usize,
    /// Mismatches allowed when matching the reverse primer.
    pub mismatches_rvs: usize,
    /// Sliding-window mean quality target for 3' trimming.
    pub qual_trim: u8,
    /// Worker threads; defaults to half the logical cores.
    pub threads: usize,
    /// Keep only k-mers seen in both files of a pair.
    pub strict: bool,
    /// Collapse identical output sequences into `;size=` records.
    pub derep: bool,
    /// Drop the low-complexity read filter during region growth.
    pub keep_low_complexity: bool,
    /// Minimum emitted amplicon length, when configured.
    pub min_length: Option<usize>,
    /// Maximum emitted amplicon length, when configured.
    pub max_length: Option<usize>,
    /// Write the observed-primers report next to the output.
    pub save_primers: bool,
    /// Write the selected inter-primer reads as FASTA.
    pub save_filtered: bool,
    /// Retain partition files and write the kept-metadata manifest.
    pub keep_partitions: bool,
    /// Partition directory override; a temp dir is created when absent.
    pub temp_dir: Option<PathBuf>,
    /// RNG seed; pin for reproducible coin tosses.
    pub seed: Option<u64>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            kmer_len: 32,
            shortest_context_size: 40,
            shortest_context_length: 44,
            context_stride: 4,
            filter_context_stride: 1,
            max_recursion: 10,
            error_rate: 100,
            paired_read_kml: 100,
            reads_per_partition: 5_000_000,
            reads_in_batch: 1_000,
            min_depth: 2,
            mismatches_fwd: 1,
            mismatches_rvs: 1,
            qual_trim: 30,
            threads: default_threads(),
            strict: false,
            derep: false,
            keep_low_complexity: false,
            min_length: None,
            max_length: None,
            save_primers: false,
            save_filtered: false,
            keep_partitions: false,
            temp_dir: None,
            seed: None,
        }
    }
}

impl Params {
    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), AmplicoraError> {
        if let (Some(min), Some(max)) = (self.min_length, self.max_length) {
            if min > max {
                return Err(AmplicoraError::InvalidLengthBounds { min, max });
            }
        }
        Ok(())
    }
}

/// Half the logical cores, at least one.
#[must_use]
pub fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| (n.get() / 2).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Params::default().validate().is_ok());
    }

    #[test]
    fn crossed_length_bounds_rejected() {
        let params = Params {
            min_length: Some(400),
            max_length: Some(300),
            ..Params::default()
        };
        assert!(matches!(
            params.validate(),
            Err(AmplicoraError::InvalidLengthBounds { min: 400, max: 300 })
        ));
    }

    #[test]
    fn equal_length_bounds_allowed() {
        let params = Params {
            min_length: Some(300),
            max_length: Some(300),
            ..Params::default()
        };
        assert!(params.validate().is_ok());
    }
}
