use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use seqrun::{
    Pipeline, RunOptions, Scheduler, Settings, about, logging::init_tracing,
    settings::DEFAULT_SETTINGS_PATH,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "seqrun",
    version = about::SEQRUN_VERSION,
    about = "Demultiplex finished sequencing runs, tag UMIs, upload and register them"
)]
#[command(group(ArgGroup::new("mode").required(true).args(["input_dir", "daemon"])))]
struct Args {
    /// Settings file
    #[arg(short, long, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,
    /// Upload the output to object storage and register the run
    #[arg(short, long)]
    upload: bool,
    /// Skip demultiplexing; summarize and upload existing output
    #[arg(long)]
    upload_only: bool,
    /// Log notifications instead of mailing them
    #[arg(long)]
    nomail: bool,
    /// Process a single run directory
    #[arg(short, long)]
    input_dir: Option<PathBuf>,
    /// Poll the configured run directory forever
    #[arg(short, long)]
    daemon: bool,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);
    if let Err(e) = run(args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let settings = Settings::load_from_path(&args.config)
        .with_context(|| format!("loading settings from '{}'", args.config.display()))?;
    let pipeline = Pipeline::from_settings(settings).context("setting up the pipeline")?;
    let options = RunOptions {
        upload: args.upload,
        nomail: args.nomail,
        upload_only: args.upload_only,
    };
    let scheduler = Scheduler::new(pipeline, options);
    match args.input_dir {
        Some(run_dir) => {
            let report = scheduler
                .run_once(&run_dir)
                .with_context(|| format!("processing '{}'", run_dir.display()))?;
            info!(
                "Run '{}' written to '{}'",
                report.run_dir.display(),
                report.output_dir.display()
            );
            Ok(())
        }
        None => scheduler.run_daemon(),
    }
}
