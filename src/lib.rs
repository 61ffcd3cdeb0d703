pub mod about;
pub mod barcodes;
pub mod error;
pub mod fastq;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod run_dir;
pub mod sample_sheet;
pub mod scheduler;
pub mod settings;
pub mod sink;
pub mod tools;
pub mod umi;
pub mod upload;

pub use error::PipelineError;
pub use pipeline::{Pipeline, RunOptions, RunReport};
pub use scheduler::Scheduler;
pub use settings::Settings;
