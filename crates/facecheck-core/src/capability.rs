//! Interfaces to the face-analysis backends the pipeline consumes.
//!
//! Implementations are loaded once at startup and shared across workers, so
//! both traits require `Send + Sync`. Calls are synchronous and may block for
//! the duration of a model inference; the aggregator runs them on blocking
//! worker threads.

use crate::config::AnalysisConfig;
use crate::types::{FaceAttributes, FailureReason, MatchScore, UploadedImage};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("comparison failed: {0}")]
    Comparison(String),
}

impl From<CapabilityError> for FailureReason {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::NoFaceDetected => FailureReason::NoFaceDetected,
            CapabilityError::Extraction(msg) => FailureReason::ExtractionError(msg),
            CapabilityError::Comparison(msg) => FailureReason::ComparisonError(msg),
        }
    }
}

/// Estimates age, gender, emotion and race for the face in one image.
pub trait AttributeExtractor: Send + Sync {
    /// Only the attributes named in `config.actions` are populated.
    fn extract(
        &self,
        image: &UploadedImage,
        config: &AnalysisConfig,
    ) -> Result<FaceAttributes, CapabilityError>;
}

/// Decides whether two images show the same person.
pub trait FaceMatcher: Send + Sync {
    /// Distance under `config.distance_metric`; `verified` when the distance
    /// is at or below `config.threshold()`.
    fn compare(
        &self,
        probe: &UploadedImage,
        reference: &UploadedImage,
        config: &AnalysisConfig,
    ) -> Result<MatchScore, CapabilityError>;
}
