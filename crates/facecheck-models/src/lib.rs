//! facecheck-models — ONNX Runtime face analysis backend.
//!
//! SCRFD detection, ArcFace embeddings and three attribute estimators
//! (genderage, FER+, FairFace), combined in [`FaceAnalyzer`] which implements
//! the pipeline's extractor and matcher traits.

pub mod alignment;
pub mod analyzer;
pub mod attributes;
pub mod detector;
pub mod recognizer;

pub use analyzer::{FaceAnalyzer, LoadError};
pub use attributes::{AttributeModelError, EmotionModel, GenderAgeModel, RaceModel};
pub use detector::{DetectorError, FaceDetector};
pub use recognizer::{FaceRecognizer, RecognizerError};

use ort::session::Session;
use std::path::{Path, PathBuf};

pub(crate) fn open_session(model_path: &Path) -> Result<Session, ort::Error> {
    Ok(Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?)
}

/// `$XDG_DATA_HOME/facecheck/models`, else `~/.local/share/facecheck/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecheck/models")
}

/// Model file locations.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub gender_age: PathBuf,
    pub emotion: PathBuf,
    pub race: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join("det_10g.onnx"),
            recognizer: dir.join("w600k_r50.onnx"),
            gender_age: dir.join("genderage.onnx"),
            emotion: dir.join("emotion-ferplus-8.onnx"),
            race: dir.join("fairface.onnx"),
        }
    }

    /// (name, path) pairs in load order.
    pub fn entries(&self) -> [(&'static str, &Path); 5] {
        [
            ("detector", self.detector.as_path()),
            ("recognizer", self.recognizer.as_path()),
            ("gender_age", self.gender_age.as_path()),
            ("emotion", self.emotion.as_path()),
            ("race", self.race.as_path()),
        ]
    }
}
