//! Pipeline orchestration and output.
//!
//! Wires the phases together in dependency order: load -> scan primers ->
//! grow the region filter -> select reads -> build and denoise the depth
//! table -> build contexts and starting reads -> extend -> trim. Each phase
//! logs a one-line summary; the same lines land in the run log next to the
//! output FASTA.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;

use crate::bases::Read;
use crate::cli::Args;
use crate::config::Params;
use crate::contexts::ContextTables;
use crate::counts::KmerCountTable;
use crate::denoise::denoise;
use crate::error::AmplicoraError;
use crate::extend::Extender;
use crate::partition::{write_kept_metadata, write_partitions};
use crate::primer::PrimerPanel;
use crate::reader::{expand_globs, infer_pairing, load_reads, Pairing};
use crate::region::IterativeRegionFilter;
use crate::rng::CoinToss;
use crate::scan::{scan_reads, PrimerRole, ScanResult};
use crate::select::{select_final_reads, ReadPairIndex};
use crate::starts::{prepare_starting_reads, ReadStartIndex};
use crate::trim::trim_extensions;

/// End-of-run accounting, also serialized into the log as JSON.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub files: usize,
    pub paired: bool,
    pub reads_loaded: usize,
    pub primer_hits: usize,
    pub filter_kmers: usize,
    pub filter_iterations: usize,
    pub selected_reads: usize,
    pub read_pairs: usize,
    pub kmers_counted: usize,
    pub kmers_culled: usize,
    pub starting_reads: usize,
    pub extended: usize,
    pub tp_reached: usize,
    pub coin_tosses: u64,
    pub kept: usize,
    pub discarded: usize,
    pub elapsed_secs: f64,
}

/// Runs the whole assembly.
pub fn run(args: &Args) -> Result<RunSummary, AmplicoraError> {
    let started = Instant::now();
    let params = args.to_params();
    params.validate()?;
    // A second build_global (tests, repeated calls) is harmless.
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(params.threads)
        .build_global();

    // Inputs are validated before any output file is touched.
    let paths = expand_globs(&args.reads)?;
    let pairing = infer_pairing(paths.len(), args.forced_pairing())?;
    let panel = PrimerPanel::build(
        args.forward.as_bytes(),
        args.reverse.as_bytes(),
        params.mismatches_fwd,
        params.mismatches_rvs,
    )?;

    let mut log = RunLog::create(&args.output)?;
    let mut summary = RunSummary::default();
    summary.files = paths.len();
    summary.paired = pairing == Pairing::Paired;

    // Load into file-of-pair groups: R1s into slot 0, R2s into slot 1.
    let slots = if pairing == Pairing::Paired { 2 } else { 1 };
    let mut files: Vec<Vec<Option<Read>>> = vec![Vec::new(); slots];
    for (file_no, path) in paths.iter().enumerate() {
        let reads = load_reads(path, params.qual_trim)?;
        log.line(&format!(
            "loaded {} reads from {}",
            reads.len(),
            path.display()
        ))?;
        summary.reads_loaded += reads.len();
        files[file_no % slots].extend(reads.into_iter().map(Some));
    }

    // Primer scan.
    let mut scans: Vec<ScanResult> = Vec::with_capacity(files.len());
    for reads in &mut files {
        scans.push(scan_reads(reads, &panel, &params));
    }
    summary.primer_hits = scans.iter().map(ScanResult::total_hits).sum();
    let starting_seeds: usize = scans
        .iter()
        .map(|scan| {
            scan.role_reads(PrimerRole::ForwardStart).len()
                + scan.role_reads(PrimerRole::ForwardEnd).len()
        })
        .sum();
    log.line(&format!(
        "primer scan: {} hits, {} forward seeds",
        summary.primer_hits, starting_seeds
    ))?;
    if starting_seeds == 0 {
        return Err(AmplicoraError::NoStartingReads);
    }

    // Partition mirror on disk.
    let temp_dir = TempLocation::prepare(&params)?;
    let longest_read = files
        .iter()
        .flat_map(|reads| reads.iter().flatten())
        .map(Read::len)
        .max()
        .unwrap_or(0);
    if let Some(dir) = temp_dir.path() {
        let mut all_partitions = Vec::new();
        for (file_of_pair, reads) in files.iter().enumerate() {
            let partitions = write_partitions(
                dir,
                "amplicora",
                file_of_pair,
                reads,
                params.reads_per_partition,
            )?;
            all_partitions.extend(partitions);
        }
        if params.keep_partitions {
            write_kept_metadata(dir, "amplicora", longest_read, &all_partitions)?;
        }
    }

    // Region filter growth.
    let growth = IterativeRegionFilter::grow(&files, &scans, &params);
    summary.filter_kmers = growth.filter.len();
    summary.filter_iterations = growth.iterations;
    log.line(&format!(
        "region filter: {} k-mers after {} iterations, {} ending reads",
        growth.filter.len(),
        growth.iterations,
        growth.ending_reads
    ))?;

    // Final selection.
    let selected = select_final_reads(&files, &scans, &growth, &params);
    summary.selected_reads = selected.len();
    log.line(&format!("selected {} reads", selected.len()))?;
    if params.save_filtered {
        write_filtered_reads(&args.output, &selected)?;
    }
    if params.save_primers {
        write_primer_report(&args.output, &scans)?;
    }
    drop(growth);

    let pairs = if summary.paired {
        ReadPairIndex::build(&selected, longest_read)
    } else {
        ReadPairIndex::default()
    };
    summary.read_pairs = pairs.pairs.len();

    // Depth table and denoise.
    let mut table = KmerCountTable::build(&selected, &params);
    summary.kmers_counted = table.len();
    let denoise_stats = denoise(&mut table, &selected, &params);
    summary.kmers_culled = denoise_stats.kmers_culled;
    log.line(&format!(
        "depth table: {} k-mers, {} culled",
        summary.kmers_counted, summary.kmers_culled
    ))?;

    // Contexts and starting reads.
    let mut contexts = ContextTables::build(&selected, &table, &params);
    let rng = CoinToss::new(params.seed);
    let (starting, prep_stats) =
        prepare_starting_reads(&selected, &panel, &mut table, &mut contexts, &rng, &params);
    summary.starting_reads = starting.len();
    log.line(&format!(
        "starting reads: {} ({} rescued, {} corrected, {} dropped)",
        starting.len(),
        prep_stats.rescued,
        prep_stats.corrected,
        prep_stats.dropped
    ))?;
    if starting.is_empty() {
        return Err(AmplicoraError::NoStartingReads);
    }

    // Extension.
    let starts = ReadStartIndex::build(&selected, params.kmer_len);
    let extender = Extender::new(
        &params, &table, &contexts, &starts, &selected, &pairs, &panel, &rng,
    );
    let extensions = extender.extend_all(&starting);
    summary.extended = extensions.len();
    summary.tp_reached = extensions.iter().filter(|ext| ext.tp_reached).count();
    summary.coin_tosses = rng.toss_count();
    log.line(&format!(
        "extension: {} reads, {} reached the terminating primer, {} coin tosses",
        summary.extended, summary.tp_reached, summary.coin_tosses
    ))?;

    // Trim and write.
    let outcome = trim_extensions(&extensions, &panel, &params);
    summary.kept = outcome.stats.kept;
    summary.discarded = outcome.stats.discarded;
    write_amplicons(&args.output, &outcome.kept, &panel, &params)?;
    if !outcome.discards.is_empty() {
        let discards: Vec<crate::trim::FinalRead> = outcome
            .discards
            .iter()
            .map(|(read, _)| read.clone())
            .collect();
        write_amplicons(&discards_path(&args.output), &discards, &panel, &params)?;
    }
    log.line(&format!(
        "wrote {} amplicons, {} discards",
        summary.kept, summary.discarded
    ))?;

    summary.elapsed_secs = started.elapsed().as_secs_f64();
    log.finish(&summary)?;
    Ok(summary)
}

/// `<output stem>_discards.<ext>`.
#[must_use]
pub fn discards_path(output: &Path) -> PathBuf {
    sibling(output, "_discards")
}

fn sibling(output: &Path, suffix: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "amplicora".into());
    let ext = output
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    output.with_file_name(format!("{stem}{suffix}{ext}"))
}

/// Writes the final FASTA: `>R<n>` plus primer annotations, or
/// `>R<n>;size=<count>;` in derep mode.
fn write_amplicons(
    path: &Path,
    reads: &[crate::trim::FinalRead],
    panel: &PrimerPanel,
    params: &Params,
) -> Result<(), AmplicoraError> {
    let file = File::create(path).map_err(|source| AmplicoraError::OutputWrite {
        source,
        path: path.to_path_buf(),
    })?;
    let mut writer = BufWriter::new(file);

    let mut write = || -> std::io::Result<()> {
        for (index, read) in reads.iter().enumerate() {
            if params.derep {
                writeln!(writer, ">R{index};size={};", read.size)?;
            } else {
                write!(writer, ">R{index}")?;
                if let Some(tp) = &read.tp_seq {
                    write!(
                        writer,
                        ";FP={};TP={}",
                        String::from_utf8_lossy(&panel.forward.seq),
                        String::from_utf8_lossy(tp)
                    )?;
                }
                writeln!(writer)?;
            }
            writer.write_all(&read.seq)?;
            writeln!(writer)?;
        }
        writer.flush()
    };
    write().map_err(|source| AmplicoraError::OutputWrite {
        source,
        path: path.to_path_buf(),
    })
}

/// The selected inter-primer reads, for inspection.
fn write_filtered_reads(
    output: &Path,
    selected: &[crate::select::SelectedRead],
) -> Result<(), AmplicoraError> {
    let path = sibling(output, "_filtered_reads");
    let file = File::create(&path).map_err(|source| AmplicoraError::OutputWrite {
        source,
        path: path.clone(),
    })?;
    let mut writer = BufWriter::new(file);
    let mut write = || -> std::io::Result<()> {
        for read in selected {
            writeln!(writer, ">f{}r{}", read.file, read.read_idx)?;
            writer.write_all(&read.seq)?;
            writeln!(writer)?;
        }
        writer.flush()
    };
    write().map_err(|source| AmplicoraError::OutputWrite { source, path })
}

/// Observed primer forms with counts, most common first.
fn write_primer_report(output: &Path, scans: &[ScanResult]) -> Result<(), AmplicoraError> {
    let path = {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "amplicora".into());
        output.with_file_name(format!("{stem}_primers.txt"))
    };
    let file = File::create(&path).map_err(|source| AmplicoraError::OutputWrite {
        source,
        path: path.clone(),
    })?;
    let mut writer = BufWriter::new(file);

    let mut observed: rustc_hash::FxHashMap<&[u8], u64> = rustc_hash::FxHashMap::default();
    for scan in scans {
        for (primer, count) in &scan.observed {
            *observed.entry(primer.as_slice()).or_insert(0) += count;
        }
    }
    let mut sorted: Vec<(&[u8], u64)> = observed.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut write = || -> std::io::Result<()> {
        for (primer, count) in sorted {
            writer.write_all(primer)?;
            writeln!(writer, "\t{count}")?;
        }
        writer.flush()
    };
    write().map_err(|source| AmplicoraError::OutputWrite { source, path })
}

/// The partition directory: caller-supplied and persistent, or a temp dir
/// that cleans itself up.
enum TempLocation {
    Ephemeral(tempfile::TempDir),
    Fixed(PathBuf),
}

impl TempLocation {
    fn prepare(params: &Params) -> Result<Self, AmplicoraError> {
        match &params.temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|source| AmplicoraError::TempDir { source })?;
                Ok(Self::Fixed(dir.clone()))
            }
            // Retained partitions need a directory that outlives the run.
            None if params.keep_partitions => {
                let dir = std::env::temp_dir().join(format!("amplicora_{}", std::process::id()));
                std::fs::create_dir_all(&dir)
                    .map_err(|source| AmplicoraError::TempDir { source })?;
                Ok(Self::Fixed(dir))
            }
            None => {
                let dir =
                    tempfile::tempdir().map_err(|source| AmplicoraError::TempDir { source })?;
                Ok(Self::Ephemeral(dir))
            }
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Self::Ephemeral(dir) => Some(dir.path()),
            Self::Fixed(path) => Some(path),
        }
    }
}

/// Plain-text run log next to the output file.
struct RunLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl RunLog {
    fn create(output: &Path) -> Result<Self, AmplicoraError> {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "amplicora".into());
        let path = output.with_file_name(format!("{stem}_log.txt"));
        let file = File::create(&path).map_err(|source| AmplicoraError::OutputWrite {
            source,
            path: path.clone(),
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    fn line(&mut self, message: &str) -> Result<(), AmplicoraError> {
        eprintln!("{message}");
        writeln!(self.writer, "{message}").map_err(|source| AmplicoraError::OutputWrite {
            source,
            path: self.path.clone(),
        })
    }

    fn finish(&mut self, summary: &RunSummary) -> Result<(), AmplicoraError> {
        let json = serde_json::to_string_pretty(summary)?;
        writeln!(self.writer, "{json}").map_err(|source| AmplicoraError::OutputWrite {
            source,
            path: self.path.clone(),
        })?;
        self.writer
            .flush()
            .map_err(|source| AmplicoraError::OutputWrite {
                source,
                path: self.path.clone(),
            })
    }
}
