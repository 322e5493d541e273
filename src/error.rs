//! Error taxonomy for model loading and per-call failures

use std::path::PathBuf;
use thiserror::Error;
use tonic::{Code, Status};

/// Failures while loading the model artifact. Both are fatal at startup.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("model artifact not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("model artifact {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl ArtifactError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ArtifactError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure raised by a classifier while scoring a vector.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("expected {expected} features, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("{0}")]
    Runtime(String),
}

/// Closed set of error kinds used as the `error_kind` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EmptyFeatures,
    InvalidFeatureVector,
    InferenceFailed,
    ConfidenceOutOfRange,
    ResponseBuild,
    WorkerPanic,
    Aborted,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::EmptyFeatures,
        ErrorKind::InvalidFeatureVector,
        ErrorKind::InferenceFailed,
        ErrorKind::ConfidenceOutOfRange,
        ErrorKind::ResponseBuild,
        ErrorKind::WorkerPanic,
        ErrorKind::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EmptyFeatures => "EmptyFeatures",
            ErrorKind::InvalidFeatureVector => "InvalidFeatureVector",
            ErrorKind::InferenceFailed => "InferenceFailed",
            ErrorKind::ConfidenceOutOfRange => "ConfidenceOutOfRange",
            ErrorKind::ResponseBuild => "ResponseBuild",
            ErrorKind::WorkerPanic => "WorkerPanic",
            ErrorKind::Aborted => "Aborted",
        }
    }

    /// Caller errors map to `INVALID_ARGUMENT`, everything else to `INTERNAL`.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::EmptyFeatures | ErrorKind::InvalidFeatureVector
        )
    }

    pub fn code(&self) -> Code {
        if self.is_caller_error() {
            Code::InvalidArgument
        } else {
            Code::Internal
        }
    }
}

/// Per-call failure of a prediction service operation.
#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("Features array is empty")]
    EmptyFeatures,
    #[error("Invalid input data: {0}")]
    InvalidFeatureVector(String),
    #[error("Prediction failed: {0}")]
    InferenceFailed(String),
    #[error("Prediction failed: confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("Failed to build response: {0}")]
    ResponseBuild(String),
    #[error("Worker failed: {0}")]
    WorkerPanic(String),
}

impl PredictionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PredictionError::EmptyFeatures => ErrorKind::EmptyFeatures,
            PredictionError::InvalidFeatureVector(_) => ErrorKind::InvalidFeatureVector,
            PredictionError::InferenceFailed(_) => ErrorKind::InferenceFailed,
            PredictionError::ConfidenceOutOfRange(_) => ErrorKind::ConfidenceOutOfRange,
            PredictionError::ResponseBuild(_) => ErrorKind::ResponseBuild,
            PredictionError::WorkerPanic(_) => ErrorKind::WorkerPanic,
        }
    }

    pub fn to_status(&self) -> Status {
        Status::new(self.kind().code(), self.to_string())
    }
}

impl From<InferenceError> for PredictionError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Dimension { .. } => {
                PredictionError::InvalidFeatureVector(err.to_string())
            }
            InferenceError::Runtime(msg) => PredictionError::InferenceFailed(msg),
        }
    }
}

impl From<PredictionError> for Status {
    fn from(err: PredictionError) -> Self {
        err.to_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(PredictionError::EmptyFeatures.to_status().code(), Code::InvalidArgument);
        assert_eq!(
            PredictionError::InvalidFeatureVector("bad".into()).to_status().code(),
            Code::InvalidArgument
        );
        assert_eq!(
            PredictionError::ConfidenceOutOfRange(1.5).to_status().code(),
            Code::Internal
        );
        assert_eq!(
            PredictionError::InferenceFailed("boom".into()).to_status().code(),
            Code::Internal
        );
    }

    #[test]
    fn test_status_detail() {
        let status = PredictionError::EmptyFeatures.to_status();
        assert_eq!(status.message(), "Features array is empty");
    }

    #[test]
    fn test_dimension_error_is_caller_error() {
        let err: PredictionError = InferenceError::Dimension {
            expected: 4,
            actual: 3,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidFeatureVector);
        assert!(err.kind().is_caller_error());
    }

    #[test]
    fn test_error_kind_labels_are_unique() {
        let mut labels: Vec<&str> = ErrorKind::ALL.iter().map(|k| k.as_str()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), ErrorKind::ALL.len());
    }
}
