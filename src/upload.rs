//! Object storage synchronisation of an output directory.

use crate::settings::UploadSettings;
use serde::{Deserialize, Serialize};
use std::{
    path::Path,
    process::{Command, Stdio},
};
use tracing::{info, warn};

pub const MAX_UPLOAD_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTool {
    #[default]
    S3cmd,
    S4cmd,
}

impl SyncTool {
    pub fn arguments(
        self,
        s3cfg: &str,
        region: &str,
        local_dir: &Path,
        destination: &str,
    ) -> Vec<String> {
        let local = local_dir.display().to_string();
        match self {
            Self::S3cmd => vec![
                "s3cmd".to_string(),
                "-c".to_string(),
                s3cfg.to_string(),
                "sync".to_string(),
                "--limit-rate=10m".to_string(),
                format!("--region={region}"),
                "--server-side-encryption".to_string(),
                local,
                destination.to_string(),
            ],
            Self::S4cmd => {
                // s4cmd copies into the exact key prefix given, so the
                // directory name is appended to the destination folder
                let name = local_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut args: Vec<String> = [
                    "s4cmd",
                    "-p",
                    s3cfg,
                    "dsync",
                    "--ignore-empty-source",
                    "--retry",
                    "5",
                    "-c",
                    "12",
                    "-f",
                    "-r",
                    "-s",
                    "--API-ServerSideEncryption=AES256",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                args.push(local);
                args.push(format!("{destination}{name}"));
                args
            }
        }
    }
}

/// One synchronisation attempt. Returns the exit code, or `None` when the
/// process could not be started or was killed by a signal.
pub trait Uploader: Send + Sync {
    fn sync(&self, local_dir: &Path, destination: &str) -> Option<i32>;
}

#[derive(Debug, Clone)]
pub struct SyncCommandUploader {
    pub tool: SyncTool,
    pub s3cfg: String,
    pub region: String,
}

impl SyncCommandUploader {
    pub fn from_settings(settings: &UploadSettings) -> Self {
        Self {
            tool: settings.tool,
            s3cfg: settings.s3cfg.clone(),
            region: settings.region.clone(),
        }
    }
}

impl Uploader for SyncCommandUploader {
    fn sync(&self, local_dir: &Path, destination: &str) -> Option<i32> {
        let argv = self
            .tool
            .arguments(&self.s3cfg, &self.region, local_dir, destination);
        info!("Running: {}", argv.join(" "));
        let (program, args) = argv.split_first()?;
        match Command::new(program).args(args).stdin(Stdio::null()).status() {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Could not start {program}: {e}");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub attempts: u32,
    /// Exit code of the last attempt.
    pub status: Option<i32>,
}

impl UploadOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }
}

/// Retry the sync immediately until it exits 0 or `max_attempts` is used up.
pub fn upload_with_retries(
    uploader: &dyn Uploader,
    local_dir: &Path,
    destination: &str,
    max_attempts: u32,
) -> UploadOutcome {
    let mut outcome = UploadOutcome {
        attempts: 0,
        status: None,
    };
    while outcome.attempts < max_attempts.max(1) {
        outcome.attempts += 1;
        outcome.status = uploader.sync(local_dir, destination);
        if outcome.succeeded() {
            break;
        }
        warn!(
            "Upload attempt {}/{} of '{}' failed with {:?}",
            outcome.attempts,
            max_attempts,
            local_dir.display(),
            outcome.status
        );
    }
    outcome
}
