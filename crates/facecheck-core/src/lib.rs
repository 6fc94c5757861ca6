//! facecheck-core — Face comparison and attribute-aggregation pipeline.
//!
//! Ingests up to ten uploaded photos, runs an attribute extractor on each and
//! a face matcher on each non-reference photo against the chosen reference,
//! and builds a deterministic report from the results. The face-analysis
//! backends are consumed through the traits in [`capability`].

pub mod aggregator;
pub mod capability;
pub mod config;
pub mod ingest;
pub mod report;
pub mod run;
pub mod search;
pub mod types;

pub use aggregator::{AggregateError, AggregateSummary, Aggregator, CancelToken};
pub use capability::{AttributeExtractor, CapabilityError, FaceMatcher};
pub use config::{
    Action, AggregatorConfig, AnalysisConfig, DetectorBackend, DistanceMetric, IngestLimits,
};
pub use ingest::{ingest, IngestBatch, IngestError, RejectedUpload, Upload};
pub use report::{build_report, CsvRenderer, JsonRenderer, RenderError, ReportDocument, ReportRenderer};
pub use run::{AnalysisRun, RunError};
pub use types::{
    AttributeResult, ComparisonResult, Embedding, FaceAttributes, FaceRegion, FailureReason,
    ImageId, MatchScore, Outcome, UploadedImage,
};
