//! Per-run analysis options, worker-pool limits and ingest limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Cosine-distance threshold for unit-normalized ArcFace embeddings.
pub const DEFAULT_COSINE_THRESHOLD: f32 = 0.68;
/// Euclidean threshold for unit-normalized ArcFace embeddings (sqrt(2 * 0.68)).
pub const DEFAULT_EUCLIDEAN_THRESHOLD: f32 = 1.17;

/// Minimum and maximum number of uploads per run.
pub const MIN_BATCH: usize = 1;
pub const MAX_BATCH: usize = 10;

/// Which face detector locates the face before extraction/matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorBackend {
    /// SCRFD anchor-free detector.
    #[default]
    Scrfd,
    /// No detection: the whole image is the face.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    pub fn default_threshold(self) -> f32 {
        match self {
            DistanceMetric::Cosine => DEFAULT_COSINE_THRESHOLD,
            DistanceMetric::Euclidean => DEFAULT_EUCLIDEAN_THRESHOLD,
        }
    }
}

/// Attribute estimations an extractor may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Age,
    Gender,
    Emotion,
    Race,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Age, Action::Gender, Action::Emotion, Action::Race];
}

/// Error for an unrecognized option name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized {kind} '{value}' (expected one of: {expected})")]
pub struct UnknownOption {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

macro_rules! impl_option_names {
    ($ty:ty, $kind:literal { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownOption;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    _ => Err(UnknownOption {
                        kind: $kind,
                        value: s.to_string(),
                        expected: concat!($($name, " "),+),
                    }),
                }
            }
        }
    };
}

impl_option_names!(DetectorBackend, "detector backend" { Scrfd => "scrfd", Skip => "skip" });
impl_option_names!(DistanceMetric, "distance metric" { Cosine => "cosine", Euclidean => "euclidean" });
impl_option_names!(Action, "action" {
    Age => "age",
    Gender => "gender",
    Emotion => "emotion",
    Race => "race",
});

/// Options passed explicitly to every extractor/matcher call of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub detector_backend: DetectorBackend,
    pub distance_metric: DistanceMetric,
    /// When false, an image with no detected face is analysed as a whole
    /// instead of failing with `NoFaceDetected`.
    pub enforce_detection: bool,
    /// Overrides the metric's default verification threshold.
    pub threshold: Option<f32>,
    /// Attribute estimations to perform.
    pub actions: Vec<Action>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            detector_backend: DetectorBackend::Scrfd,
            distance_metric: DistanceMetric::Cosine,
            enforce_detection: true,
            threshold: None,
            actions: Action::ALL.to_vec(),
        }
    }
}

impl AnalysisConfig {
    /// Verification threshold in effect: the override, else the metric default.
    pub fn threshold(&self) -> f32 {
        self.threshold
            .unwrap_or_else(|| self.distance_metric.default_threshold())
    }

    pub fn wants(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }
}

/// Worker pool and deadline for one aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregatorConfig {
    /// Maximum concurrent extractor/matcher calls.
    pub workers: usize,
    /// Deadline in seconds for the whole run.
    pub timeout_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_secs: 60,
        }
    }
}

impl AggregatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-upload validation limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestLimits {
    pub max_upload_bytes: usize,
    /// Largest accepted width or height, in pixels.
    pub max_dimension: u32,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 20 * 1024 * 1024,
            max_dimension: 8192,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threshold_follows_metric() {
        let mut config = AnalysisConfig::default();
        assert_eq!(config.threshold(), DEFAULT_COSINE_THRESHOLD);
        config.distance_metric = DistanceMetric::Euclidean;
        assert_eq!(config.threshold(), DEFAULT_EUCLIDEAN_THRESHOLD);
        config.threshold = Some(0.3);
        assert_eq!(config.threshold(), 0.3);
    }

    #[test]
    fn test_parse_option_names() {
        assert_eq!("scrfd".parse::<DetectorBackend>().unwrap(), DetectorBackend::Scrfd);
        assert_eq!(" Skip ".parse::<DetectorBackend>().unwrap(), DetectorBackend::Skip);
        assert_eq!("euclidean".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert_eq!("race".parse::<Action>().unwrap(), Action::Race);
    }

    #[test]
    fn test_parse_unknown_option() {
        let err = "mtcnn".parse::<DetectorBackend>().unwrap_err();
        assert_eq!(err.value, "mtcnn");
        assert!(err.to_string().contains("scrfd"));
    }

    #[test]
    fn test_analysis_config_from_json_partial() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"distance_metric":"euclidean","actions":["age"]}"#).unwrap();
        assert_eq!(config.distance_metric, DistanceMetric::Euclidean);
        assert!(config.enforce_detection);
        assert!(config.wants(Action::Age));
        assert!(!config.wants(Action::Race));
    }

    #[test]
    fn test_analysis_config_rejects_unknown_backend() {
        let result = serde_json::from_str::<AnalysisConfig>(r#"{"detector_backend":"opencv"}"#);
        assert!(result.is_err());
    }
}
