//! Read partitions.
//!
//! The hot loops parallelise over partitions of the read store: contiguous
//! index ranges small enough to batch well, mirrored on disk as single-line
//! FASTA temp files (`<prefix>_<partition>_<fileOfPair>.tmp`). The on-disk
//! copies exist so a later run can resume from them (`--kept`) and so memory
//! pressure stays bounded for whole-genome shotgun inputs.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::bases::Read;
use crate::error::AmplicoraError;

/// Splits `total` read slots into ranges of at most `per_partition`.
#[must_use]
pub fn partition_ranges(total: usize, per_partition: usize) -> Vec<Range<usize>> {
    if total == 0 {
        return Vec::new();
    }
    (0..total)
        .step_by(per_partition.max(1))
        .map(|start| start..(start + per_partition).min(total))
        .collect()
}

/// One partition written to disk.
#[derive(Debug, Clone)]
pub struct PartitionFile {
    pub path: PathBuf,
    pub read_count: usize,
}

/// Writes one file-of-pair's reads into numbered partition files under `dir`.
///
/// Records are single-line FASTA: a `>` header line, then the whole sequence
/// on one line. Dropped slots are skipped.
pub fn write_partitions(
    dir: &Path,
    prefix: &str,
    file_of_pair: usize,
    reads: &[Option<Read>],
    per_partition: usize,
) -> Result<Vec<PartitionFile>, AmplicoraError> {
    let mut files = Vec::new();
    for (partition_no, range) in partition_ranges(reads.len(), per_partition)
        .into_iter()
        .enumerate()
    {
        let path = dir.join(format!("{prefix}_{partition_no}_{file_of_pair}.tmp"));
        let file = File::create(&path).map_err(|source| AmplicoraError::TempDir { source })?;
        let mut writer = BufWriter::new(file);

        let mut written = 0usize;
        for read in reads[range].iter().flatten() {
            writeln!(writer, ">{}", read.header)
                .and_then(|()| writer.write_all(&read.seq))
                .and_then(|()| writer.write_all(b"\n"))
                .map_err(|source| AmplicoraError::OutputWrite {
                    source,
                    path: path.clone(),
                })?;
            written += 1;
        }
        writer
            .flush()
            .map_err(|source| AmplicoraError::OutputWrite {
                source,
                path: path.clone(),
            })?;
        files.push(PartitionFile {
            path,
            read_count: written,
        });
    }
    Ok(files)
}

/// Reads a single-line FASTA partition file back.
pub fn read_partition(path: &Path) -> Result<Vec<Read>, AmplicoraError> {
    let file = File::open(path).map_err(|source| AmplicoraError::SequenceRead {
        source,
        path: path.to_path_buf(),
    })?;
    let reader = BufReader::new(file);

    let mut reads = Vec::new();
    let mut header: Option<String> = None;
    for line in reader.lines() {
        let line = line.map_err(|source| AmplicoraError::SequenceRead {
            source,
            path: path.to_path_buf(),
        })?;
        if let Some(stripped) = line.strip_prefix('>') {
            header = Some(stripped.to_string());
        } else if let Some(header) = header.take() {
            reads.push(Read::new(header, line.into_bytes()));
        }
    }
    Ok(reads)
}

/// Writes the kept-partition manifest: the longest read length, then one
/// `<filename>\t<readCount>` line per partition file.
pub fn write_kept_metadata(
    dir: &Path,
    prefix: &str,
    longest_read: usize,
    files: &[PartitionFile],
) -> Result<PathBuf, AmplicoraError> {
    let path = dir.join(format!("{prefix}_kept_metadata.txt"));
    let file = File::create(&path).map_err(|source| AmplicoraError::OutputWrite {
        source,
        path: path.clone(),
    })?;
    let mut writer = BufWriter::new(file);

    let mut write = || -> std::io::Result<()> {
        writeln!(writer, "longest\t{longest_read}")?;
        for partition in files {
            let name = partition
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            writeln!(writer, "{name}\t{}", partition.read_count)?;
        }
        writer.flush()
    };
    write().map_err(|source| AmplicoraError::OutputWrite {
        source,
        path: path.clone(),
    })?;
    Ok(path)
}
