//! Crate level error taxonomy.

use crate::data::DataFrameError;
use crate::io::compress::CompressionError;
use crate::repr::ForestValidationError;
use crate::training::ParamsError;

/// Errors raised while configuring, planning or running an analysis.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// A malformed, missing or out of range specification field.
    #[error("invalid analysis specification: {0}")]
    Configuration(String),

    #[error("unsupported analysis '{0}'")]
    UnsupportedAnalysis(String),

    /// The memory estimate exceeds the limit for the allowed execution mode.
    #[error("estimated memory {required} bytes exceeds the limit of {limit} bytes")]
    ResourceExceeded { required: u64, limit: u64 },

    #[error("analysis failed: {0}")]
    Runtime(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    DataFrame(#[from] DataFrameError),

    #[error("invalid model structure: {0:?}")]
    InvalidModel(ForestValidationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// True for errors detected before any row is processed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnsupportedAnalysis(_) | Self::ResourceExceeded { .. }
        )
    }
}

impl From<ForestValidationError> for AnalysisError {
    fn from(error: ForestValidationError) -> Self {
        Self::InvalidModel(error)
    }
}

impl From<ParamsError> for AnalysisError {
    fn from(error: ParamsError) -> Self {
        Self::Configuration(error.to_string())
    }
}

pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(AnalysisError::configuration("rows").is_configuration());
        assert!(AnalysisError::UnsupportedAnalysis("foo".into()).is_configuration());
        assert!(AnalysisError::ResourceExceeded { required: 2, limit: 1 }.is_configuration());
        assert!(!AnalysisError::runtime("boom").is_configuration());
        assert!(AnalysisError::from(ParamsError::InvalidMaxTrees).is_configuration());
    }

    #[test]
    fn messages_name_the_problem() {
        let err = AnalysisError::UnsupportedAnalysis("foo".into());
        assert_eq!(err.to_string(), "unsupported analysis 'foo'");
        let err = AnalysisError::ResourceExceeded { required: 10, limit: 5 };
        assert!(err.to_string().contains("10 bytes"));
    }
}
