//! Run discovery and the polling loop.

use crate::{
    error::PipelineError,
    pipeline::{Pipeline, RunOptions, RunReport},
    run_dir::{RunStatus, run_status},
};
use std::{
    error::Error,
    fs, io,
    panic::{AssertUnwindSafe, catch_unwind},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use tracing::{error, info};

/// Immediate subdirectories of `root` the sequencer has finished and this
/// pipeline has not, sorted by path.
pub fn discover_eligible_runs(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut runs = vec![];
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && run_status(&path) == RunStatus::Pending {
            runs.push(path);
        }
    }
    runs.sort();
    Ok(runs)
}

#[derive(Debug, Default)]
pub struct IterationSummary {
    pub processed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn error_chain(err: &PipelineError) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.ends_with(&cause_text) {
            text.push_str(&format!("\ncaused by: {cause_text}"));
        }
        source = cause.source();
    }
    text
}

pub struct Scheduler {
    pipeline: Pipeline,
    options: RunOptions,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, options: RunOptions) -> Self {
        Self { pipeline, options }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Process one run directory. Failures are notified and returned.
    pub fn run_once(&self, run_dir: &Path) -> Result<RunReport, PipelineError> {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.pipeline.process_run(run_dir, &self.options)
        }))
        .unwrap_or_else(|payload| Err(PipelineError::Panic(panic_message(payload))));
        if let Err(e) = &result {
            self.report_failure(run_dir, e);
        }
        result
    }

    fn report_failure(&self, run_dir: &Path, err: &PipelineError) {
        error!("Processing '{}' failed: {err}", run_dir.display());
        // Sheet and naming problems go out under the run's path so the
        // operator knows which directory to fix.
        let subject = if err.is_configuration() {
            run_dir.display().to_string()
        } else {
            "Processing error".to_string()
        };
        let body = format!("{}\n\n{}", run_dir.display(), error_chain(err));
        self.pipeline.notify(&self.options, &subject, &body);
    }

    /// One discovery pass over the configured root; runs are processed one
    /// at a time and a failing run does not stop the others.
    pub fn run_iteration(&self) -> IterationSummary {
        let mut summary = IterationSummary::default();
        let root = &self.pipeline.settings().run_directory;
        let runs = match discover_eligible_runs(root) {
            Ok(runs) => runs,
            Err(e) => {
                error!("Could not scan '{}': {e}", root.display());
                self.pipeline.notify(
                    &self.options,
                    "Processing error",
                    &format!("Could not scan '{}': {e}", root.display()),
                );
                return summary;
            }
        };
        if !runs.is_empty() {
            info!("Processing {} runs", runs.len());
            for run in runs.iter() {
                info!("  {}", run.display());
            }
        }
        for run in runs {
            match self.run_once(&run) {
                Ok(_) => summary.processed.push(run),
                Err(e) => summary.failed.push((run, e.to_string())),
            }
        }
        summary
    }

    pub fn run_daemon(&self) -> ! {
        let interval = Duration::from_secs(self.pipeline.settings().poll_interval_secs);
        loop {
            self.run_iteration();
            info!(
                "Waiting to process runs, sleeping {} s",
                interval.as_secs()
            );
            thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        notify::RecordingNotifier,
        run_dir::{PIPELINE_COMPLETE, SEQUENCER_COMPLETE},
        settings::Settings,
        tools::{DemuxRequest, ToolError, ToolRunner},
    };

    struct PanickingTools;

    impl ToolRunner for PanickingTools {
        fn demultiplex(&self, _request: &DemuxRequest) -> Result<(), ToolError> {
            panic!("demultiplexer exploded")
        }

        fn summarize_run(&self, _run_dir: &Path, _dest: &Path) -> Result<(), ToolError> {
            Ok(())
        }

        fn summarize_index(&self, _index_bin: &Path, _dest: &Path) -> Result<(), ToolError> {
            Ok(())
        }
    }

    fn settings(root: &Path) -> Settings {
        serde_json::from_value(serde_json::json!({
            "run_directory": root,
            "tools": {"bcl2fastq": "b", "summary": "s", "interopcsv": "i"}
        }))
        .unwrap()
    }

    fn make_run(root: &Path, name: &str, sentinels: &[&str]) -> PathBuf {
        let run = root.join(name);
        fs::create_dir_all(&run).unwrap();
        for sentinel in sentinels {
            fs::write(run.join(sentinel), "").unwrap();
        }
        run
    }

    #[test]
    fn discovery_selects_only_pending_runs() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        let b = make_run(root, "160102_M_0002_FC", &[SEQUENCER_COMPLETE]);
        let a = make_run(root, "160101_M_0001_FC", &[SEQUENCER_COMPLETE]);
        make_run(root, "160103_M_0003_FC", &[SEQUENCER_COMPLETE, PIPELINE_COMPLETE]);
        make_run(root, "160104_M_0004_FC", &[]);
        fs::write(root.join(SEQUENCER_COMPLETE), "").unwrap();
        assert_eq!(discover_eligible_runs(root).unwrap(), vec![a, b]);
    }

    #[test]
    fn failing_runs_are_notified_and_stay_pending() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        let broken = make_run(root, "160101_M_0001_FC", &[SEQUENCER_COMPLETE]);
        let notifier = RecordingNotifier::new();
        let pipeline =
            Pipeline::new(settings(root), PanickingTools).with_notifier(notifier.clone());
        let scheduler = Scheduler::new(pipeline, RunOptions::default());

        let summary = scheduler.run_iteration();
        assert!(summary.processed.is_empty());
        assert_eq!(summary.failed.len(), 1);
        // no sample sheet: configuration error under the run's path
        assert_eq!(notifier.subjects(), vec![broken.display().to_string()]);
        assert_eq!(run_status(&broken), RunStatus::Pending);

        // retried on the next pass
        scheduler.run_iteration();
        assert_eq!(notifier.sent().len(), 2);
    }

    #[test]
    fn panics_are_caught_and_reported() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        let run = make_run(root, "160101_M_0001_FC", &[SEQUENCER_COMPLETE]);
        fs::write(
            run.join("SampleSheet.csv"),
            "[Header]\nExperiment Name,2016Jan01_test\n[Reads]\n75\n[Settings]\n[Data]\nSample_ID,Sample_Name\n1,a\n",
        )
        .unwrap();
        let notifier = RecordingNotifier::new();
        let pipeline =
            Pipeline::new(settings(root), PanickingTools).with_notifier(notifier.clone());
        let scheduler = Scheduler::new(pipeline, RunOptions::default());

        let err = scheduler.run_once(&run).unwrap_err();
        assert!(matches!(err, PipelineError::Panic(ref m) if m.contains("exploded")));
        assert_eq!(notifier.subjects(), vec!["Processing error".to_string()]);
    }

    #[test]
    fn unreadable_root_is_reported_without_stopping() {
        let td = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::new();
        let pipeline = Pipeline::new(settings(&td.path().join("missing")), PanickingTools)
            .with_notifier(notifier.clone());
        let summary = Scheduler::new(pipeline, RunOptions::default()).run_iteration();
        assert!(summary.processed.is_empty() && summary.failed.is_empty());
        assert_eq!(notifier.subjects(), vec!["Processing error".to_string()]);
    }
}
