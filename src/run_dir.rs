use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

/// Written by the sequencer once base calling has finished.
pub const SEQUENCER_COMPLETE: &str = "RTAComplete.txt";
/// Written by this pipeline into the source run directory when done.
pub const PIPELINE_COMPLETE: &str = "DemuxComplete.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Still sequencing (no sentinel at all).
    NotReady,
    /// Sequencer finished, pipeline has not.
    Pending,
    Done,
}

pub fn run_status(run_dir: &Path) -> RunStatus {
    if run_dir.join(PIPELINE_COMPLETE).exists() {
        RunStatus::Done
    } else if run_dir.join(SEQUENCER_COMPLETE).exists() {
        RunStatus::Pending
    } else {
        RunStatus::NotReady
    }
}

pub fn mark_pipeline_complete(run_dir: &Path) -> io::Result<()> {
    fs::File::create(run_dir.join(PIPELINE_COMPLETE)).map(|_| ())
}

pub fn run_name(run_dir: &Path) -> String {
    run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| run_dir.to_string_lossy().into_owned())
}

#[derive(Debug, Error)]
pub enum NamingError {
    #[error("experiment id '{0}' must contain exactly one '%'")]
    PercentStyle(String),
    #[error("run path '{0}' has no '_'-delimited segment to replace")]
    NoUnderscore(String),
    #[error("run path '{0}' has no parent directory")]
    NoParent(String),
}

/// Derive the output directory for a run from its experiment id.
///
/// * `prefix%suffix` ids: `<run parent>/<prefix>_<run name>_<suffix>`.
/// * otherwise: the run path with its last `_` segment dropped, joined with
///   the experiment id minus its leading (date) segment.
///
/// Storage and web links are derived from this name, so it must stay stable.
pub fn output_dir_for_run(run_dir: &Path, experiment: &str) -> Result<PathBuf, NamingError> {
    let raw = run_dir.to_string_lossy();
    let run = raw.trim_end_matches('/');
    if experiment.contains('%') {
        let mut parts = experiment.split('%');
        let (Some(prefix), Some(suffix), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(NamingError::PercentStyle(experiment.to_string()));
        };
        let run_path = Path::new(run);
        let parent = run_path
            .parent()
            .ok_or_else(|| NamingError::NoParent(run.to_string()))?;
        let name = run_name(run_path);
        return Ok(parent.join(format!("{prefix}_{name}_{suffix}")));
    }

    let Some(cut) = run.rfind('_') else {
        return Err(NamingError::NoUnderscore(run.to_string()));
    };
    let prefix = &run[..cut];
    let suffix = match experiment.split_once('_') {
        Some((_, rest)) => rest,
        None => experiment,
    };
    Ok(PathBuf::from(format!("{prefix}_{suffix}")))
}

/// Delete a previous output directory before re-demultiplexing, but only if
/// it sits strictly below the run's parent directory and is not the run
/// itself. Returns whether anything was removed.
pub fn remove_stale_output(run_dir: &Path, output_dir: &Path) -> io::Result<bool> {
    if !output_dir.is_dir() {
        return Ok(false);
    }
    let run_abs = fs::canonicalize(run_dir)?;
    let output_abs = fs::canonicalize(output_dir)?;
    let Some(parent) = run_abs.parent() else {
        warn!(
            "Refusing to remove '{}': run '{}' has no parent",
            output_abs.display(),
            run_abs.display()
        );
        return Ok(false);
    };
    if output_abs == run_abs || output_abs == parent || !output_abs.starts_with(parent) {
        warn!(
            "Refusing to remove '{}': not inside '{}'",
            output_abs.display(),
            parent.display()
        );
        return Ok(false);
    }
    info!("Removing previous output '{}'", output_abs.display());
    fs::remove_dir_all(&output_abs)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_sentinels() {
        let td = tempfile::tempdir().unwrap();
        let run = td.path();
        assert_eq!(run_status(run), RunStatus::NotReady);
        fs::write(run.join(SEQUENCER_COMPLETE), "").unwrap();
        assert_eq!(run_status(run), RunStatus::Pending);
        mark_pipeline_complete(run).unwrap();
        assert_eq!(run_status(run), RunStatus::Done);
        assert_eq!(fs::metadata(run.join(PIPELINE_COMPLETE)).unwrap().len(), 0);
    }

    #[test]
    fn default_naming_replaces_flowcell_segment() {
        let out = output_dir_for_run(
            Path::new("/data/runs/160105_M03295_0042_000000000-ABCDE"),
            "2016Jan05_UMI_panel",
        )
        .unwrap();
        assert_eq!(out, PathBuf::from("/data/runs/160105_M03295_0042_UMI_panel"));

        let out = output_dir_for_run(Path::new("/data/runs/160105_M03295_0042_X/"), "pilot")
            .unwrap();
        assert_eq!(out, PathBuf::from("/data/runs/160105_M03295_0042_pilot"));
    }

    #[test]
    fn percent_naming_keeps_run_name() {
        let out = output_dir_for_run(
            Path::new("/data/runs/160105_M03295_0042_X"),
            "Munich%liver",
        )
        .unwrap();
        assert_eq!(
            out,
            PathBuf::from("/data/runs/Munich_160105_M03295_0042_X_liver")
        );
        assert!(matches!(
            output_dir_for_run(Path::new("/data/runs/a_b"), "a%b%c"),
            Err(NamingError::PercentStyle(_))
        ));
    }

    #[test]
    fn stale_output_is_removed_only_below_run_parent() {
        let td = tempfile::tempdir().unwrap();
        let parent = td.path().join("runs");
        let run = parent.join("160105_M_0001_FC");
        let output = parent.join("160105_M_0001_exp");
        fs::create_dir_all(&run).unwrap();
        fs::create_dir_all(output.join("Proj")).unwrap();
        assert!(remove_stale_output(&run, &output).unwrap());
        assert!(!output.exists());

        let outside = td.path().join("elsewhere");
        fs::create_dir_all(&outside).unwrap();
        assert!(!remove_stale_output(&run, &outside).unwrap());
        assert!(outside.exists());

        assert!(!remove_stale_output(&run, &run).unwrap());
        assert!(!remove_stale_output(&run, &parent).unwrap());
        assert!(run.exists());
    }
}
