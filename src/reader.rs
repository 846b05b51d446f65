//! Sequence file ingestion.
//!
//! Reads FASTA and FASTQ files (format detected from the extension), expands
//! glob patterns, infers R1/R2 pairing, and applies the ingest-time quality
//! steps: offset auto-detection, trailing poly-G removal, and a sliding
//! window 3' quality trim.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use bio::io::{fasta, fastq};

use crate::bases::Read;
use crate::error::AmplicoraError;

/// Input sequence file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceFormat {
    /// Detect from the file extension.
    #[default]
    Auto,
    Fasta,
    Fastq,
}

impl SequenceFormat {
    /// Detects the format from a path's extension, `.gz` stripped first.
    #[must_use]
    pub fn from_extension(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_lowercase);

        let effective = match ext.as_deref() {
            Some("gz") => path
                .file_stem()
                .and_then(|stem| Path::new(stem).extension())
                .and_then(OsStr::to_str)
                .map(str::to_lowercase),
            other => other.map(String::from),
        };

        match effective.as_deref() {
            Some("fq" | "fastq") => Self::Fastq,
            _ => Self::Fasta,
        }
    }

    /// Resolves `Auto` against a concrete path.
    #[must_use]
    pub fn resolve(self, path: &Path) -> Self {
        match self {
            Self::Auto => Self::from_extension(path),
            other => other,
        }
    }
}

/// Expands each pattern containing `*` or `?` against its parent directory;
/// plain paths pass through untouched. Matches are sorted so R1 files come
/// before their R2 partners.
pub fn expand_globs(patterns: &[String]) -> Result<Vec<PathBuf>, AmplicoraError> {
    let mut paths = Vec::new();
    for pattern in patterns {
        if !pattern.contains(['*', '?']) {
            paths.push(PathBuf::from(pattern));
            continue;
        }

        let full = Path::new(pattern);
        let dir = match full.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name_pattern = full
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or(pattern);

        let mut matched: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|source| AmplicoraError::SequenceRead {
                source,
                path: dir.clone(),
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(OsStr::to_str)
                    .is_some_and(|name| glob_match(name_pattern, name))
            })
            .collect();
        matched.sort();

        if matched.is_empty() {
            return Err(AmplicoraError::UnmatchedGlob {
                pattern: pattern.clone(),
            });
        }
        paths.extend(matched);
    }
    Ok(paths)
}

/// Shell-style match supporting `*` and `?`.
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let (mut star, mut star_n) = (None, 0);

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_n = n;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_n += 1;
            n = star_n;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// How the input files pair up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    /// Consecutive files are R1/R2 partners.
    Paired,
    /// Every file stands alone.
    Unpaired,
}

/// Infers pairing from file-count parity unless the caller forced a mode.
pub fn infer_pairing(
    file_count: usize,
    forced: Option<Pairing>,
) -> Result<Pairing, AmplicoraError> {
    match forced {
        Some(Pairing::Paired) if file_count % 2 != 0 => {
            Err(AmplicoraError::UnpairableFiles { count: file_count })
        }
        Some(mode) => Ok(mode),
        None if file_count > 0 && file_count % 2 == 0 => Ok(Pairing::Paired),
        None => Ok(Pairing::Unpaired),
    }
}

/// Loads every read of a file, applying quality-based trimming to FASTQ.
pub fn load_reads(path: &Path, qual_trim: u8) -> Result<Vec<Read>, AmplicoraError> {
    match SequenceFormat::Auto.resolve(path) {
        SequenceFormat::Fastq => load_fastq(path, qual_trim),
        _ => load_fasta(path),
    }
}

fn load_fasta(path: &Path) -> Result<Vec<Read>, AmplicoraError> {
    let reader = fasta::Reader::from_file(path).map_err(|source| AmplicoraError::SequenceRead {
        source: std::io::Error::other(source),
        path: path.to_path_buf(),
    })?;

    let mut reads = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| AmplicoraError::SequenceParse {
            details: err.to_string(),
            path: path.to_path_buf(),
        })?;
        reads.push(Read::new(record.id(), upcase(record.seq())));
    }
    Ok(reads)
}

fn load_fastq(path: &Path, qual_trim: u8) -> Result<Vec<Read>, AmplicoraError> {
    let reader = fastq::Reader::from_file(path).map_err(|source| AmplicoraError::SequenceRead {
        source: std::io::Error::other(source),
        path: path.to_path_buf(),
    })?;

    let mut raw: Vec<(String, Vec<u8>, Vec<u8>)> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| AmplicoraError::SequenceParse {
            details: err.to_string(),
            path: path.to_path_buf(),
        })?;
        raw.push((
            record.id().to_string(),
            upcase(record.seq()),
            record.qual().to_vec(),
        ));
    }

    let offset = detect_quality_offset(raw.iter().map(|(_, _, q)| q.as_slice()));
    let mut reads = Vec::with_capacity(raw.len());
    for (header, seq, qual) in raw {
        let qual: Vec<u8> = qual.iter().map(|&q| q.saturating_sub(offset)).collect();
        let mut read = Read::with_quality(header, seq, qual);
        trim_poly_g(&mut read);
        quality_trim(&mut read, qual_trim);
        reads.push(read);
    }
    Ok(reads)
}

fn upcase(seq: &[u8]) -> Vec<u8> {
    seq.iter().map(u8::to_ascii_uppercase).collect()
}

/// Distinguishes Phred+33 from Phred+64 by the smallest byte observed in a
/// sample of quality strings. Phred+64 data never dips below `@` (64).
pub fn detect_quality_offset<'a>(quals: impl Iterator<Item = &'a [u8]>) -> u8 {
    let mut min_seen = u8::MAX;
    for qual in quals.take(1000) {
        if let Some(&min) = qual.iter().min() {
            min_seen = min_seen.min(min);
        }
    }
    if min_seen < b'@' {
        33
    } else {
        64
    }
}

/// Phred score below which a trailing G is treated as instrument fill.
const POLY_G_QUAL: u8 = 15;

/// Removes the trailing run of low-quality G bases two-colour instruments
/// emit past the end of the fragment.
pub fn trim_poly_g(read: &mut Read) {
    let Some(qual) = &read.qual else { return };
    let mut keep = read.seq.len();
    while keep > 0 && read.seq[keep - 1] == b'G' && qual[keep - 1] < POLY_G_QUAL {
        keep -= 1;
    }
    if keep < read.seq.len() {
        read.trim(0, keep);
    }
}

const QUAL_WINDOW: usize = 10;

/// Trims the 3' end back until a sliding window means at least `target`.
pub fn quality_trim(read: &mut Read, target: u8) {
    let Some(qual) = &read.qual else { return };
    if qual.len() < QUAL_WINDOW {
        return;
    }

    let mut keep = qual.len();
    while keep >= QUAL_WINDOW {
        let window = &qual[keep - QUAL_WINDOW..keep];
        let mean = window.iter().map(|&q| u32::from(q)).sum::<u32>() / QUAL_WINDOW as u32;
        if mean >= u32::from(target) {
            break;
        }
        keep -= 1;
    }
    if keep < read.seq.len() {
        read.trim(0, keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn format_detection() {
        assert_eq!(
            SequenceFormat::from_extension(Path::new("reads.fq")),
            SequenceFormat::Fastq
        );
        assert_eq!(
            SequenceFormat::from_extension(Path::new("reads.fastq.gz")),
            SequenceFormat::Fastq
        );
        assert_eq!(
            SequenceFormat::from_extension(Path::new("genome.fa")),
            SequenceFormat::Fasta
        );
        assert_eq!(
            SequenceFormat::from_extension(Path::new("noext")),
            SequenceFormat::Fasta
        );
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*.fq", "sample_R1.fq"));
        assert!(glob_match("sample_R?.fq", "sample_R2.fq"));
        assert!(!glob_match("*.fa", "sample_R1.fq"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("a*b", "acb_x"));
    }

    #[test]
    fn pairing_inference() {
        assert_eq!(infer_pairing(2, None).unwrap(), Pairing::Paired);
        assert_eq!(infer_pairing(3, None).unwrap(), Pairing::Unpaired);
        assert_eq!(
            infer_pairing(3, Some(Pairing::Unpaired)).unwrap(),
            Pairing::Unpaired
        );
        assert!(infer_pairing(3, Some(Pairing::Paired)).is_err());
    }

    #[test]
    fn loads_fasta() {
        let file = temp_file(".fa", ">r1\nacgtACGT\n>r2\nGATTACA\n");
        let reads = load_reads(file.path(), 30).unwrap();
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].seq, b"ACGTACGT");
        assert_eq!(reads[1].header, "r2");
        assert!(reads[0].qual.is_none());
    }

    #[test]
    fn loads_fastq_and_strips_offset() {
        // 'I' = 73 -> Phred+33 score 40; the '#' pins offset detection.
        let file = temp_file(".fq", "@r1\nACGTACGTACGT\n+\nIII#IIIIIIII\n");
        let reads = load_reads(file.path(), 30).unwrap();
        assert_eq!(reads.len(), 1);
        let mut want = vec![40u8; 12];
        want[3] = 2;
        assert_eq!(reads[0].qual.as_deref(), Some(&want[..]));
    }

    #[test]
    fn quality_offset_detection() {
        assert_eq!(detect_quality_offset([&b"II#5"[..]].into_iter()), 33);
        assert_eq!(detect_quality_offset([&b"ffgh"[..]].into_iter()), 64);
    }

    #[test]
    fn poly_g_tail_removed() {
        let mut read = Read::with_quality(
            "r",
            *b"ACGTACGTGGGGG",
            vec![40, 40, 40, 40, 40, 40, 40, 40, 2, 2, 2, 2, 2],
        );
        trim_poly_g(&mut read);
        assert_eq!(read.seq, b"ACGTACGT");
    }

    #[test]
    fn high_quality_g_tail_kept() {
        let mut read = Read::with_quality("r", *b"ACGTGG", vec![40; 6]);
        trim_poly_g(&mut read);
        assert_eq!(read.seq, b"ACGTGG");
    }

    #[test]
    fn window_trim_cuts_low_quality_tail() {
        let mut qual = vec![40u8; 30];
        qual.extend(vec![3u8; 20]);
        let mut read = Read::with_quality("r", vec![b'A'; 50], qual);
        quality_trim(&mut read, 30);
        assert!(read.seq.len() <= 35, "kept {} bases", read.seq.len());
        assert!(read.seq.len() >= 25);
    }
}
