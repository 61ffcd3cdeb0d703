//! End-to-end processing of one finished sequencing run.

use crate::{
    error::PipelineError,
    metrics::{add_sample_names, apply_sample_counts, summarize_metrics},
    notify::{MailCommandNotifier, Notifier},
    registry::{HttpRunRegistry, Registration, RunRegistry, register_run},
    report::format_run_report,
    run_dir::{mark_pipeline_complete, output_dir_for_run, remove_stale_output, run_name},
    sample_sheet::{SAMPLE_SHEET_NAME, read_sample_sheet, resolve_sample_sheet},
    settings::Settings,
    sink::Compression,
    tools::{
        CommandToolRunner, DemuxRequest, INDEX_METRICS_BIN, INDEX_SUMMARY_FILE, SUMMARY_FILE,
        ToolRunner, UmiMode,
    },
    umi::{SampleMergeReport, merge_project_umis},
    upload::{SyncCommandUploader, UploadOutcome, Uploader, upload_with_retries},
};
use seqrun_protocol::RunDetails;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{error, info, warn};

pub const RUN_DETAILS_FILE: &str = "run_details.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub upload: bool,
    pub nomail: bool,
    /// Skip demultiplexing and UMI merging; reuse existing output.
    pub upload_only: bool,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_dir: PathBuf,
    pub output_dir: PathBuf,
    pub umi: UmiMode,
    /// `None` when demultiplexing was skipped.
    pub demux_succeeded: Option<bool>,
    pub umi_samples: Vec<SampleMergeReport>,
    pub details: RunDetails,
    pub warnings: Vec<String>,
    pub upload: Option<UploadOutcome>,
    pub registration: Option<Registration>,
}

pub struct Pipeline {
    settings: Settings,
    tools: Box<dyn ToolRunner>,
    notifier: Box<dyn Notifier>,
    uploader: Box<dyn Uploader>,
    registry: Option<Box<dyn RunRegistry>>,
    compression: Compression,
}

impl Pipeline {
    /// Pipeline with the real tools, mail command, sync client and registry
    /// named in `settings`.
    pub fn from_settings(settings: Settings) -> Result<Self, PipelineError> {
        let tools = CommandToolRunner::from_settings(&settings)?;
        let compression = Compression::External(settings.compressor_command()?);
        let notifier = MailCommandNotifier::new(settings.mail.clone());
        let uploader = SyncCommandUploader::from_settings(&settings.upload);
        let registry = match &settings.registry {
            Some(registry) => Some(Box::new(HttpRunRegistry::new(registry)?) as Box<dyn RunRegistry>),
            None => None,
        };
        Ok(Self {
            settings,
            tools: Box::new(tools),
            notifier: Box::new(notifier),
            uploader: Box::new(uploader),
            registry,
            compression,
        })
    }

    /// Pipeline around `tools` that compresses in-process and only logs
    /// notifications; the `with_*` methods swap in other parts.
    pub fn new(settings: Settings, tools: impl ToolRunner + 'static) -> Self {
        let uploader = SyncCommandUploader::from_settings(&settings.upload);
        Self {
            settings,
            tools: Box::new(tools),
            notifier: Box::new(crate::notify::LogNotifier),
            uploader: Box::new(uploader),
            registry: None,
            compression: Compression::Inline,
        }
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn with_uploader(mut self, uploader: impl Uploader + 'static) -> Self {
        self.uploader = Box::new(uploader);
        self
    }

    pub fn with_registry(mut self, registry: impl RunRegistry + 'static) -> Self {
        self.registry = Some(Box::new(registry));
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Send a notification, or only log it under `--nomail`. A failed
    /// delivery is logged and otherwise ignored.
    pub fn notify(&self, options: &RunOptions, subject: &str, body: &str) {
        if options.nomail {
            info!("{subject}\n{body}");
            return;
        }
        if let Err(e) = self.notifier.notify(subject, body) {
            warn!("Could not send notification '{subject}': {e}");
        }
    }

    pub fn process_run(
        &self,
        run_dir: &Path,
        options: &RunOptions,
    ) -> Result<RunReport, PipelineError> {
        info!("Processing run '{}'", run_dir.display());
        let sheet = resolve_sample_sheet(run_dir)?;
        let mut metadata = read_sample_sheet(&sheet)?;
        let output_dir = output_dir_for_run(run_dir, &metadata.experiment)?;
        let umi = UmiMode::from_metadata(&metadata);
        info!(
            "Output directory is '{}' (UMI mode {:?})",
            output_dir.display(),
            umi
        );

        let mut demux_succeeded = None;
        let mut umi_samples = vec![];
        if !options.upload_only {
            demux_succeeded = Some(self.demultiplex(run_dir, &output_dir, umi, options)?);
            self.generate_metrics(run_dir)?;
            if umi.is_on() {
                let project = metadata
                    .samples
                    .first()
                    .map(|s| s.sample_project.clone())
                    .ok_or(PipelineError::NoSamples)?;
                umi_samples = self.merge_umis(run_dir, &output_dir.join(project), umi, options);
            }
        }

        let summary_path = run_dir.join(SUMMARY_FILE);
        let summary_text = fs::read_to_string(&summary_path)
            .map_err(PipelineError::io("could not read run summary", &summary_path))?;
        let index_path = run_dir.join(INDEX_SUMMARY_FILE);
        let index_text = if index_path.is_file() {
            Some(
                fs::read_to_string(&index_path)
                    .map_err(PipelineError::io("could not read index summary", &index_path))?,
            )
        } else {
            None
        };
        let mut metrics = summarize_metrics(&summary_text, index_text.as_deref())?;
        add_sample_names(&mut metrics.index_metrics, &metadata);
        apply_sample_counts(&mut metadata, &metrics.index_metrics);
        let mut warnings = metrics.warnings();
        warnings.extend(umi_samples.iter().filter_map(|r| {
            r.result
                .as_ref()
                .err()
                .map(|e| format!("UMI merge failed for '{}': {e}", r.sample_dir.display()))
        }));

        let details = RunDetails {
            experiment: metadata,
            run: run_name(&output_dir),
            read_summary: metrics.read_summary.clone(),
            lane_summary: metrics.lane_summary.clone(),
            index_metrics: metrics.index_metrics.clone(),
            overall: metrics.overall.clone(),
        };
        self.write_artifacts(run_dir, &sheet, &output_dir, &details, index_text.is_some())?;

        let (subject, body) = format_run_report(
            &run_name(run_dir),
            &metrics,
            &output_dir,
            &self.settings.web_loc,
            &warnings,
        );
        self.notify(options, &subject, &body);

        let mut report = RunReport {
            run_dir: run_dir.to_path_buf(),
            output_dir,
            umi,
            demux_succeeded,
            umi_samples,
            details,
            warnings,
            upload: None,
            registration: None,
        };
        if options.upload {
            self.upload_and_register(&mut report, options)?;
        }
        info!("Finished run '{}'", run_dir.display());
        Ok(report)
    }

    fn demultiplex(
        &self,
        run_dir: &Path,
        output_dir: &Path,
        umi: UmiMode,
        options: &RunOptions,
    ) -> Result<bool, PipelineError> {
        remove_stale_output(run_dir, output_dir).map_err(PipelineError::io(
            "could not remove previous output",
            output_dir,
        ))?;
        let request = DemuxRequest {
            run_dir: run_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            umi,
        };
        match self.tools.demultiplex(&request) {
            Ok(()) => Ok(true),
            Err(e) => {
                // Metrics can still be collected from a failed demultiplexing.
                error!("Demultiplexing '{}' failed: {e}", run_dir.display());
                self.notify(
                    options,
                    &run_dir.display().to_string(),
                    &format!("Demultiplexing failed: {e}"),
                );
                Ok(false)
            }
        }
    }

    fn generate_metrics(&self, run_dir: &Path) -> Result<(), PipelineError> {
        self.tools
            .summarize_run(run_dir, &run_dir.join(SUMMARY_FILE))?;
        let index_bin = run_dir.join(INDEX_METRICS_BIN);
        if index_bin.exists() {
            self.tools
                .summarize_index(&index_bin, &run_dir.join(INDEX_SUMMARY_FILE))?;
        } else {
            info!("No index metrics in '{}'", run_dir.display());
        }
        Ok(())
    }

    fn merge_umis(
        &self,
        run_dir: &Path,
        project_dir: &Path,
        umi: UmiMode,
        options: &RunOptions,
    ) -> Vec<SampleMergeReport> {
        let reports = match merge_project_umis(
            project_dir,
            self.settings.umi_workers,
            self.settings.tools.umi_layout,
            umi == UmiMode::SingleEnd,
            &self.compression,
        ) {
            Ok(reports) => reports,
            Err(e) => {
                error!("UMI merge for '{}' failed: {e}", project_dir.display());
                self.notify(
                    options,
                    &format!("UMI merge failure for {}", run_name(run_dir)),
                    &e.to_string(),
                );
                return vec![];
            }
        };
        let failures: Vec<String> = reports
            .iter()
            .filter_map(|r| {
                r.result
                    .as_ref()
                    .err()
                    .map(|e| format!("{}: {e}", r.sample_dir.display()))
            })
            .collect();
        if !failures.is_empty() {
            self.notify(
                options,
                &format!("UMI merge failure for {}", run_name(run_dir)),
                &failures.join("\n"),
            );
        }
        reports
    }

    fn write_artifacts(
        &self,
        run_dir: &Path,
        sheet: &Path,
        output_dir: &Path,
        details: &RunDetails,
        has_index_summary: bool,
    ) -> Result<(), PipelineError> {
        fs::create_dir_all(output_dir)
            .map_err(PipelineError::io("could not create output directory", output_dir))?;
        let details_path = output_dir.join(RUN_DETAILS_FILE);
        let json = serde_json::to_string_pretty(details)
            .map_err(|e| PipelineError::io("could not encode", &details_path)(e.into()))?;
        fs::write(&details_path, json)
            .map_err(PipelineError::io("could not write", &details_path))?;

        let mut copies = vec![
            (sheet.to_path_buf(), SAMPLE_SHEET_NAME),
            (run_dir.join(SUMMARY_FILE), SUMMARY_FILE),
        ];
        if has_index_summary {
            copies.push((run_dir.join(INDEX_SUMMARY_FILE), INDEX_SUMMARY_FILE));
        }
        for (source, name) in copies {
            fs::copy(&source, output_dir.join(name))
                .map_err(PipelineError::io("could not copy", &source))?;
        }
        mark_pipeline_complete(run_dir)
            .map_err(PipelineError::io("could not mark run complete", run_dir))?;
        Ok(())
    }

    fn upload_and_register(
        &self,
        report: &mut RunReport,
        options: &RunOptions,
    ) -> Result<(), PipelineError> {
        let upload = &self.settings.upload;
        let outcome = upload_with_retries(
            self.uploader.as_ref(),
            &report.output_dir,
            &upload.s3folder,
            upload.max_attempts,
        );
        report.upload = Some(outcome);
        let output = report.output_dir.display().to_string();
        if !outcome.succeeded() {
            error!("Upload of '{output}' failed after {} attempts", outcome.attempts);
            self.notify(
                options,
                &format!("Upload failure for {output}"),
                &format!("Failed to upload {output} after {} tries", outcome.attempts),
            );
            return Ok(());
        }

        let Some(registry) = &self.registry else {
            warn!("No run registry configured; '{}' is not registered", report.details.run);
            return Ok(());
        };
        let registration = register_run(registry.as_ref(), &report.details)?;
        let subject = if registration.already_existed {
            format!("Run {} already in db", report.details.run)
        } else {
            format!("Created {} in db", report.details.run)
        };
        let body = serde_json::to_string_pretty(&registration.record)
            .unwrap_or_else(|_| registration.record.to_string());
        self.notify(options, &subject, &body);
        report.registration = Some(registration);
        Ok(())
    }
}
