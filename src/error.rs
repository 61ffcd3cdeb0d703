use crate::{
    metrics::MetricsError, registry::RegistryError, run_dir::NamingError,
    sample_sheet::SampleSheetError, settings::SettingsError, tools::ToolError, umi::UmiError,
};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    SampleSheet(#[from] SampleSheetError),
    #[error(transparent)]
    Naming(#[from] NamingError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Umi(#[from] UmiError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("{context} '{}': {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("sample sheet lists no samples")]
    NoSamples,
    #[error("processing panicked: {0}")]
    Panic(String),
}

impl PipelineError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            context,
            path,
            source,
        }
    }

    /// Problems an operator has to fix in the run directory or sample
    /// sheet before a retry can succeed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::SampleSheet(_) | Self::Naming(_) | Self::Settings(_) | Self::NoSamples
        ) || matches!(
            self,
            Self::Metrics(
                MetricsError::MissingMarker(_)
                    | MetricsError::MissingHeader(_)
                    | MetricsError::MissingColumn(_)
                    | MetricsError::NonIndexedRows(_)
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(PipelineError::from(SampleSheetError::Missing(PathBuf::from("/r"))).is_configuration());
        assert!(PipelineError::from(MetricsError::NonIndexedRows(2)).is_configuration());
        assert!(!PipelineError::from(MetricsError::ZeroClusters).is_configuration());
        assert!(!PipelineError::Panic("boom".to_string()).is_configuration());
    }

    #[test]
    fn io_errors_carry_context() {
        let err = PipelineError::io("could not write", "/out/run_details.json")(
            std::io::Error::other("disk full"),
        );
        assert_eq!(
            err.to_string(),
            "could not write '/out/run_details.json': disk full"
        );
    }
}
