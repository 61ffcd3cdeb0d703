use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use seqrun::{
    about,
    barcodes::{
        BLEEDTHROUGH_HEADER, DEFAULT_RANK_COUNT, bleedthrough_report, count_barcodes,
        rank_barcodes,
    },
    logging::init_tracing,
    settings::{COMPRESSOR_ENV_BIN, DEFAULT_COMPRESSOR, command_argv, resolve_tool_command},
    sink::Compression,
    umi::{UmiLayout, add_umi_to_sample_dir, merge_sample_dir},
};
use std::{collections::HashMap, fs, path::PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "seqrun_tools",
    version = about::SEQRUN_VERSION,
    about = "Barcode diagnostics and standalone UMI tagging"
)]
struct Args {
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the most frequent barcodes in undetermined FASTQ files
    RankBarcodes {
        #[arg(short, long = "infiles", num_args = 1.., required = true)]
        infiles: Vec<PathBuf>,
        #[arg(short, long, default_value_t = DEFAULT_RANK_COUNT)]
        count: usize,
    },
    /// Report undetermined barcodes that look like adapter bleed-through
    Bleedthrough {
        /// Index summary CSV of the run
        #[arg(short, long)]
        summary: PathBuf,
        /// Undetermined FASTQ files
        #[arg(short, long, num_args = 1.., required = true)]
        fastq: Vec<PathBuf>,
    },
    /// Tag the reads of one sample directory with their UMIs
    AddUmi {
        #[arg(short, long)]
        input_dir: PathBuf,
        /// Write merged files here instead of tagging in place
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = LayoutArg::Nugen)]
        layout: LayoutArg,
        #[arg(long)]
        single_end: bool,
        /// Compress in-process instead of piping through the compressor
        #[arg(long)]
        inline_gzip: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    Nugen,
    Nebnext,
}

impl From<LayoutArg> for UmiLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Nugen => UmiLayout::Nugen,
            LayoutArg::Nebnext => UmiLayout::Nebnext,
        }
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);
    if let Err(e) = run(args.command) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn undetermined_counts(paths: &[PathBuf]) -> Result<HashMap<String, u64>> {
    let mut counts = HashMap::new();
    for path in paths {
        let reads = count_barcodes(path, &mut counts)
            .with_context(|| format!("counting barcodes in '{}'", path.display()))?;
        info!("Counted {reads} reads in '{}'", path.display());
    }
    Ok(counts)
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::RankBarcodes { infiles, count } => {
            let counts = undetermined_counts(&infiles)?;
            for (barcode, n) in rank_barcodes(&counts, count) {
                println!("{barcode} {n}");
            }
        }
        Commands::Bleedthrough { summary, fastq } => {
            let undetermined = undetermined_counts(&fastq)?;
            let text = fs::read_to_string(&summary)
                .with_context(|| format!("reading '{}'", summary.display()))?;
            let rows = bleedthrough_report(&text, &undetermined)?;
            info!("{} barcodes above the reporting threshold", rows.len());
            println!("{BLEEDTHROUGH_HEADER}");
            for row in rows {
                println!("{}", row.to_tsv());
            }
        }
        Commands::AddUmi {
            input_dir,
            output_dir,
            layout,
            single_end,
            inline_gzip,
        } => {
            let compression = if inline_gzip {
                Compression::Inline
            } else {
                Compression::External(command_argv(&resolve_tool_command(
                    COMPRESSOR_ENV_BIN,
                    DEFAULT_COMPRESSOR,
                ))?)
            };
            let merge = match output_dir {
                Some(output_dir) => {
                    fs::create_dir_all(&output_dir)?;
                    merge_sample_dir(
                        &input_dir,
                        &output_dir,
                        layout.into(),
                        single_end,
                        &compression,
                    )?
                }
                None => add_umi_to_sample_dir(&input_dir, layout.into(), single_end, &compression)?,
            };
            for output in &merge.outputs {
                println!("{}", output.display());
            }
            info!("Tagged {} records for '{}'", merge.records, merge.sample);
        }
    }
    Ok(())
}
