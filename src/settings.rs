use crate::{
    umi::UmiLayout,
    upload::{MAX_UPLOAD_ATTEMPTS, SyncTool},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SETTINGS_PATH: &str = "settings.json";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_UMI_WORKERS: usize = 8;
pub const DEFAULT_COMPRESSOR: &str = "gzip -c";

pub const BCL2FASTQ_ENV_BIN: &str = "SEQRUN_BCL2FASTQ_BIN";
pub const SUMMARY_ENV_BIN: &str = "SEQRUN_SUMMARY_BIN";
pub const INTEROPCSV_ENV_BIN: &str = "SEQRUN_INTEROPCSV_BIN";
pub const COMPRESSOR_ENV_BIN: &str = "SEQRUN_COMPRESSOR_BIN";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not read settings file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse settings file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("could not split command line '{0}'")]
    Command(String),
}

/// Everything the scheduler and pipeline need, loaded once at startup and
/// passed down explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory polled in daemon mode.
    pub run_directory: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_umi_workers")]
    pub umi_workers: usize,
    pub tools: ToolSettings,
    #[serde(default)]
    pub mail: MailSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub registry: Option<RegistrySettings>,
    /// Host (and optional path prefix) serving output directories over HTTP.
    #[serde(default)]
    pub web_loc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    pub bcl2fastq: String,
    pub summary: String,
    pub interopcsv: String,
    #[serde(default = "default_compressor")]
    pub compressor: String,
    #[serde(default)]
    pub umi_layout: UmiLayout,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailSettings {
    #[serde(default)]
    pub from: String,
    /// Comma-separated recipients.
    #[serde(default)]
    pub to: String,
    /// Mail submission command; the message is written to its stdin.
    #[serde(default = "default_mail_command")]
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    #[serde(default)]
    pub tool: SyncTool,
    #[serde(default)]
    pub s3cfg: String,
    #[serde(default)]
    pub s3folder: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_upload_attempts")]
    pub max_attempts: u32,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            tool: SyncTool::default(),
            s3cfg: String::new(),
            s3folder: String::new(),
            region: default_region(),
            max_attempts: default_upload_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    pub server: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_umi_workers() -> usize {
    DEFAULT_UMI_WORKERS
}

fn default_compressor() -> String {
    DEFAULT_COMPRESSOR.to_string()
}

fn default_mail_command() -> String {
    "sendmail -t".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_attempts() -> u32 {
    MAX_UPLOAD_ATTEMPTS
}

impl Settings {
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.umi_workers == 0 {
            return Err(SettingsError::Invalid(
                "umi_workers must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_UPLOAD_ATTEMPTS).contains(&self.upload.max_attempts) {
            return Err(SettingsError::Invalid(format!(
                "upload.max_attempts must be between 1 and {MAX_UPLOAD_ATTEMPTS}"
            )));
        }
        for (name, value) in [
            ("tools.bcl2fastq", &self.tools.bcl2fastq),
            ("tools.summary", &self.tools.summary),
            ("tools.interopcsv", &self.tools.interopcsv),
        ] {
            if value.trim().is_empty() {
                return Err(SettingsError::Invalid(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn bcl2fastq_command(&self) -> Result<Vec<String>, SettingsError> {
        command_argv(&resolve_tool_command(BCL2FASTQ_ENV_BIN, &self.tools.bcl2fastq))
    }

    pub fn summary_command(&self) -> Result<Vec<String>, SettingsError> {
        command_argv(&resolve_tool_command(SUMMARY_ENV_BIN, &self.tools.summary))
    }

    pub fn interopcsv_command(&self) -> Result<Vec<String>, SettingsError> {
        command_argv(&resolve_tool_command(INTEROPCSV_ENV_BIN, &self.tools.interopcsv))
    }

    pub fn compressor_command(&self) -> Result<Vec<String>, SettingsError> {
        command_argv(&resolve_tool_command(COMPRESSOR_ENV_BIN, &self.tools.compressor))
    }
}

fn normalized_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// The environment wins over the settings file so a single invocation can
/// point at a different tool build.
pub fn resolve_tool_command(env_var: &str, configured: &str) -> String {
    std::env::var(env_var)
        .ok()
        .and_then(|v| normalized_non_empty(&v))
        .unwrap_or_else(|| configured.trim().to_string())
}

/// Split a configured command line the way a shell would.
pub fn command_argv(command: &str) -> Result<Vec<String>, SettingsError> {
    match shlex::split(command) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        _ => Err(SettingsError::Command(command.to_string())),
    }
}
