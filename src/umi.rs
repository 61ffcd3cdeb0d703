//! Tagging reads with the unique molecular identifier read.
//!
//! The demultiplexer writes the UMI as its own read stream. Merging copies
//! the UMI sequence into the identifier of every mate,
//! `@<name>:<UMI> <suffix>`, walking all streams in lockstep.

use crate::{
    fastq::{FastqRecord, FastqStream},
    sink::{Compression, CompressionSink},
};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const RAW_DATA_DIR: &str = "raw_data";
const UMI_OUTPUT_MARKER: &str = "_UMI_";

#[derive(Debug, Error)]
pub enum UmiError {
    #[error("read names differ at record {position}: {}", names.join(" / "))]
    NameMismatch { position: u64, names: Vec<String> },
    #[error("'{}' ended at record {position} before the other inputs", path.display())]
    LengthMismatch { path: PathBuf, position: u64 },
    #[error("could not parse '{}': {message}", path.display())]
    Read { path: PathBuf, message: String },
    #[error("could not write '{}': {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("no input matching '{pattern}' in '{}'", dir.display())]
    MissingInput { dir: PathBuf, pattern: &'static str },
    #[error("i/o error on '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("could not start merge workers: {0}")]
    Pool(String),
}

/// How the demultiplexer names the read and UMI files of a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UmiLayout {
    /// bcl2fastq with an `i8y*` mask: R1 read 1, R2 the UMI, R3 read 2.
    #[default]
    Nugen,
    /// Picard basecalls: `*.1.fastq.gz`, `*.2.fastq.gz` and an `*index*` file.
    Nebnext,
}

impl UmiLayout {
    fn patterns(self) -> [&'static str; 3] {
        match self {
            Self::Nugen => [r"R1.*fastq", r"R3.*fastq", r"R2.*fastq"],
            Self::Nebnext => [r"\.1\.fastq\.gz$", r"\.2\.fastq\.gz$", r"index"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInputs {
    pub read1: PathBuf,
    pub read2: Option<PathBuf>,
    pub umi: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMerge {
    pub sample: String,
    pub records: u64,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct SampleMergeReport {
    pub sample_dir: PathBuf,
    pub result: Result<SampleMerge, UmiError>,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> UmiError + '_ {
    move |source| UmiError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn sorted_file_names(dir: &Path) -> Result<Vec<String>, UmiError> {
    let mut names = vec![];
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        if entry.file_type().map_err(io_error(dir))?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn find_input(dir: &Path, names: &[String], pattern: &'static str) -> Result<PathBuf, UmiError> {
    let re = Regex::new(pattern).map_err(|e| UmiError::Read {
        path: dir.to_path_buf(),
        message: e.to_string(),
    })?;
    names
        .iter()
        .filter(|n| !n.contains(UMI_OUTPUT_MARKER))
        .find(|n| re.is_match(n))
        .map(|n| dir.join(n))
        .ok_or_else(|| UmiError::MissingInput {
            dir: dir.to_path_buf(),
            pattern,
        })
}

pub fn locate_inputs(
    dir: &Path,
    layout: UmiLayout,
    single_end: bool,
) -> Result<SampleInputs, UmiError> {
    let names = sorted_file_names(dir)?;
    let [read1, read2, umi] = layout.patterns();
    Ok(SampleInputs {
        read1: find_input(dir, &names, read1)?,
        read2: if single_end {
            None
        } else {
            Some(find_input(dir, &names, read2)?)
        },
        umi: find_input(dir, &names, umi)?,
    })
}

/// `liver_S1_R1_001.fastq.gz` → `liver`; `my_liver_S1_R1_001.fastq.gz` →
/// `my_liver`.
pub fn sample_name_from_read1(read1: &Path) -> String {
    let file_name = read1
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tokens: Vec<&str> = file_name.split('_').collect();
    if tokens.len() == 4 {
        tokens[0].to_string()
    } else {
        tokens[..tokens.len().saturating_sub(3)].join("_")
    }
}

fn next_records(
    streams: &mut [&mut FastqStream],
    position: u64,
) -> Result<Option<Vec<FastqRecord>>, UmiError> {
    let mut records = Vec::with_capacity(streams.len());
    let mut ended: Option<PathBuf> = None;
    for stream in streams.iter_mut() {
        match stream.next_record()? {
            Some(record) => records.push(record),
            None => ended = Some(stream.path().to_path_buf()),
        }
    }
    match ended {
        None => Ok(Some(records)),
        Some(_) if records.is_empty() => Ok(None),
        Some(path) => Err(UmiError::LengthMismatch { path, position }),
    }
}

fn copy_tagged_records(
    mates: &mut [FastqStream],
    umi: &mut FastqStream,
    sinks: &mut [CompressionSink],
) -> Result<u64, UmiError> {
    let mut position = 0u64;
    loop {
        position += 1;
        let mut streams: Vec<&mut FastqStream> = mates.iter_mut().collect();
        streams.push(&mut *umi);
        let Some(mut records) = next_records(&mut streams, position)? else {
            return Ok(position - 1);
        };
        let Some(umi_record) = records.pop() else {
            return Ok(position - 1);
        };
        if records.iter().any(|r| r.name != umi_record.name) {
            let mut names: Vec<String> = records.into_iter().map(|r| r.name).collect();
            names.push(umi_record.name);
            return Err(UmiError::NameMismatch { position, names });
        }
        let tag = String::from_utf8_lossy(&umi_record.sequence);
        for (mut record, sink) in records.into_iter().zip(sinks.iter_mut()) {
            record.name = format!("{}:{}", record.name, tag);
            record.write_to(sink).map_err(|source| UmiError::Write {
                path: sink.path().to_path_buf(),
                source,
            })?;
        }
    }
}

fn merge_streams(
    mut mates: Vec<FastqStream>,
    mut umi: FastqStream,
    outputs: &[&Path],
    compression: &Compression,
) -> Result<u64, UmiError> {
    let mut sinks = Vec::with_capacity(outputs.len());
    for output in outputs {
        let sink = CompressionSink::create(output, compression).map_err(|source| {
            UmiError::Write {
                path: output.to_path_buf(),
                source,
            }
        })?;
        sinks.push(sink);
    }
    let copied = copy_tagged_records(&mut mates, &mut umi, &mut sinks);
    // Close every sink even when copying stopped early.
    let mut closed = Ok(());
    for sink in sinks.iter_mut() {
        if let Err(source) = sink.finish() {
            if closed.is_ok() {
                closed = Err(UmiError::Write {
                    path: sink.path().to_path_buf(),
                    source,
                });
            }
        }
    }
    let records = copied?;
    closed?;
    Ok(records)
}

pub fn merge_umi_paired(
    read1: &Path,
    read2: &Path,
    umi: &Path,
    out_r1: &Path,
    out_r2: &Path,
    compression: &Compression,
) -> Result<u64, UmiError> {
    let mates = vec![FastqStream::open(read1)?, FastqStream::open(read2)?];
    merge_streams(mates, FastqStream::open(umi)?, &[out_r1, out_r2], compression)
}

pub fn merge_umi_single(
    read1: &Path,
    umi: &Path,
    out_r1: &Path,
    compression: &Compression,
) -> Result<u64, UmiError> {
    let mates = vec![FastqStream::open(read1)?];
    merge_streams(mates, FastqStream::open(umi)?, &[out_r1], compression)
}

/// Merge the inputs found in `input_dir`, writing
/// `<sample>_R1_UMI_001.fastq.gz` (and `_R2_`) into `output_dir`.
pub fn merge_sample_dir(
    input_dir: &Path,
    output_dir: &Path,
    layout: UmiLayout,
    single_end: bool,
    compression: &Compression,
) -> Result<SampleMerge, UmiError> {
    let inputs = locate_inputs(input_dir, layout, single_end)?;
    let sample = sample_name_from_read1(&inputs.read1);
    let out_r1 = output_dir.join(format!("{sample}_R1_UMI_001.fastq.gz"));
    debug!(
        "Merging UMIs for '{sample}' from '{}'",
        inputs.umi.display()
    );
    let (records, outputs) = match &inputs.read2 {
        Some(read2) => {
            let out_r2 = output_dir.join(format!("{sample}_R2_UMI_001.fastq.gz"));
            let n = merge_umi_paired(
                &inputs.read1,
                read2,
                &inputs.umi,
                &out_r1,
                &out_r2,
                compression,
            )?;
            (n, vec![out_r1, out_r2])
        }
        None => (
            merge_umi_single(&inputs.read1, &inputs.umi, &out_r1, compression)?,
            vec![out_r1],
        ),
    };
    Ok(SampleMerge {
        sample,
        records,
        outputs,
    })
}

fn gz_files(dir: &Path) -> Result<Vec<PathBuf>, UmiError> {
    Ok(sorted_file_names(dir)?
        .into_iter()
        .filter(|n| n.ends_with(".gz") && !n.contains(UMI_OUTPUT_MARKER))
        .map(|n| dir.join(n))
        .collect())
}

/// Merge in place, then move the original `*.gz` files into `raw_data/`.
/// The originals stay where they are if the merge fails. Outputs of an
/// earlier merge are overwritten, never archived.
pub fn add_umi_to_sample_dir(
    dir: &Path,
    layout: UmiLayout,
    single_end: bool,
    compression: &Compression,
) -> Result<SampleMerge, UmiError> {
    let raw = gz_files(dir)?;
    let merge = merge_sample_dir(dir, dir, layout, single_end, compression)?;
    let raw_dir = dir.join(RAW_DATA_DIR);
    fs::create_dir_all(&raw_dir).map_err(io_error(&raw_dir))?;
    for path in raw {
        if let Some(name) = path.file_name() {
            let target = raw_dir.join(name);
            debug!("Moving '{}' to '{}'", path.display(), target.display());
            fs::rename(&path, &target).map_err(io_error(&path))?;
        }
    }
    info!(
        "Tagged {} records for sample '{}' in '{}'",
        merge.records,
        merge.sample,
        dir.display()
    );
    Ok(merge)
}

fn sample_dirs(project_dir: &Path) -> Result<Vec<PathBuf>, UmiError> {
    let mut dirs = vec![];
    for entry in fs::read_dir(project_dir).map_err(io_error(project_dir))? {
        let entry = entry.map_err(io_error(project_dir))?;
        if entry.file_type().map_err(io_error(project_dir))?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Merge every sample directory of a project on a pool of `workers`
/// threads. One sample failing does not stop the others.
pub fn merge_project_umis(
    project_dir: &Path,
    workers: usize,
    layout: UmiLayout,
    single_end: bool,
    compression: &Compression,
) -> Result<Vec<SampleMergeReport>, UmiError> {
    let dirs = sample_dirs(project_dir)?;
    info!(
        "Merging UMIs for {} samples in '{}' with {workers} workers",
        dirs.len(),
        project_dir.display()
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| UmiError::Pool(e.to_string()))?;
    let reports: Vec<SampleMergeReport> = pool.install(|| {
        dirs.par_iter()
            .map(|dir| SampleMergeReport {
                sample_dir: dir.clone(),
                result: add_umi_to_sample_dir(dir, layout, single_end, compression),
            })
            .collect()
    });
    for report in reports.iter() {
        if let Err(e) = &report.result {
            warn!("UMI merge failed for '{}': {e}", report.sample_dir.display());
        }
    }
    Ok(reports)
}
