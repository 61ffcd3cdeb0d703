//! Invocation of the vendor demultiplexing and metrics tools.

use crate::settings::{Settings, SettingsError};
use seqrun_protocol::ExperimentMetadata;
use std::{
    fs::File,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::info;

pub const BASE_MASK_PAIRED_UMI: &str = "y*,i8y*,y*";
pub const BASE_MASK_SINGLE_UMI: &str = "y*,i8y*";
pub const SUMMARY_FILE: &str = "SAV_summary.tsv";
pub const INDEX_SUMMARY_FILE: &str = "index_summary.csv";
pub const INDEX_METRICS_BIN: &str = "InterOp/IndexMetricsOut.bin";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("could not find executable '{executable}'")]
    NotFound { executable: String },
    #[error("{} failed (status={status:?}): {}", command.join(" "), stderr.trim())]
    Failed {
        command: Vec<String>,
        status: Option<i32>,
        stderr: String,
    },
    #[error("could not run '{}': {message}", command.join(" "))]
    Io {
        command: Vec<String>,
        message: String,
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmiMode {
    Off,
    Paired,
    SingleEnd,
}

impl UmiMode {
    pub fn from_metadata(metadata: &ExperimentMetadata) -> Self {
        match (metadata.is_umi(), metadata.is_single_end()) {
            (false, _) => Self::Off,
            (true, false) => Self::Paired,
            (true, true) => Self::SingleEnd,
        }
    }

    pub fn base_mask(self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Paired => Some(BASE_MASK_PAIRED_UMI),
            Self::SingleEnd => Some(BASE_MASK_SINGLE_UMI),
        }
    }

    pub fn is_on(self) -> bool {
        self != Self::Off
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxRequest {
    pub run_dir: PathBuf,
    pub output_dir: PathBuf,
    pub umi: UmiMode,
}

impl DemuxRequest {
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            "-R".to_string(),
            self.run_dir.display().to_string(),
            "-o".to_string(),
            self.output_dir.display().to_string(),
        ];
        for flag in ["-r", "-d", "-p"] {
            args.push(flag.to_string());
            args.push("8".to_string());
        }
        args.push("--ignore-missing-bcls".to_string());
        args.push("--no-lane-splitting".to_string());
        if let Some(mask) = self.umi.base_mask() {
            args.push("--use-bases-mask".to_string());
            args.push(mask.to_string());
            args.push("--minimum-trimmed-read-length=0".to_string());
            args.push("--mask-short-adapter-reads=0".to_string());
        }
        args
    }
}

/// The external programs a run needs. Tests substitute a fake that writes
/// fixture files instead.
pub trait ToolRunner: Send + Sync {
    fn demultiplex(&self, request: &DemuxRequest) -> Result<(), ToolError>;

    /// Write the run summary table for `run_dir` to `dest`.
    fn summarize_run(&self, run_dir: &Path, dest: &Path) -> Result<(), ToolError>;

    /// Write the per-index CSV for an `IndexMetricsOut.bin` file to `dest`.
    fn summarize_index(&self, index_bin: &Path, dest: &Path) -> Result<(), ToolError>;
}

#[derive(Debug, Clone)]
pub struct CommandToolRunner {
    bcl2fastq: Vec<String>,
    summary: Vec<String>,
    interopcsv: Vec<String>,
}

impl CommandToolRunner {
    pub fn new(bcl2fastq: Vec<String>, summary: Vec<String>, interopcsv: Vec<String>) -> Self {
        Self {
            bcl2fastq,
            summary,
            interopcsv,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ToolError> {
        Ok(Self::new(
            settings.bcl2fastq_command()?,
            settings.summary_command()?,
            settings.interopcsv_command()?,
        ))
    }
}

fn full_command(base: &[String], args: &[String]) -> Vec<String> {
    base.iter().chain(args.iter()).cloned().collect()
}

/// Run `command` to completion. With `stdout_to`, standard output is written
/// to that file instead of being discarded.
pub fn run_command(command: &[String], stdout_to: Option<&Path>) -> Result<(), ToolError> {
    let Some((program, args)) = command.split_first() else {
        return Err(ToolError::Io {
            command: vec![],
            message: "empty command".to_string(),
        });
    };
    let io_err = |message: String| ToolError::Io {
        command: command.to_vec(),
        message,
    };
    let stdout = match stdout_to {
        Some(path) => Stdio::from(
            File::create(path)
                .map_err(|e| io_err(format!("could not create '{}': {e}", path.display())))?,
        ),
        None => Stdio::null(),
    };
    info!("Running: {}", command.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ToolError::NotFound {
                    executable: program.to_string(),
                }
            } else {
                io_err(e.to_string())
            }
        })?;
    if !output.status.success() {
        return Err(ToolError::Failed {
            command: command.to_vec(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(())
}

impl ToolRunner for CommandToolRunner {
    fn demultiplex(&self, request: &DemuxRequest) -> Result<(), ToolError> {
        run_command(&full_command(&self.bcl2fastq, &request.arguments()), None)
    }

    fn summarize_run(&self, run_dir: &Path, dest: &Path) -> Result<(), ToolError> {
        let args = [run_dir.display().to_string()];
        run_command(&full_command(&self.summary, &args), Some(dest))
    }

    fn summarize_index(&self, index_bin: &Path, dest: &Path) -> Result<(), ToolError> {
        let args = [index_bin.display().to_string()];
        run_command(&full_command(&self.interopcsv, &args), Some(dest))
    }
}
