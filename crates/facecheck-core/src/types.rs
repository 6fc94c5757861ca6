use crate::config::DistanceMetric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Position of an upload within its batch (zero-based).
///
/// Ids are assigned at ingest to every entry, valid or not, so id order is
/// upload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub u32);

impl ImageId {
    /// One-based position, as shown to users.
    pub fn ordinal(self) -> u32 {
        self.0 + 1
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.ordinal())
    }
}

/// A decoded, validated upload. Immutable once created.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub id: ImageId,
    pub filename: String,
    /// Original bytes as uploaded.
    pub bytes: Vec<u8>,
    /// Decoded pixels, orientation applied, normalized to RGB8.
    pub pixels: image::RgbImage,
    /// Container format detected from the bytes (e.g. "png").
    pub format: String,
    /// Hex SHA-256 of `bytes`.
    pub digest: String,
}

impl UploadedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    /// Region covering a whole `width` x `height` image, used when detection is
    /// skipped or not enforced.
    pub fn whole_image(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 0.0,
            landmarks: None,
        }
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Distance under `metric`. Lower = more similar.
    ///
    /// Cosine distance is `1 - similarity`, so it lies in [0, 2].
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => 1.0 - self.similarity(other),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Gender {
    Woman,
    Man,
}

/// FER+ emotion classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Neutral,
    Happy,
    Surprise,
    Sad,
    Angry,
    Disgust,
    Fear,
    Contempt,
}

impl Emotion {
    /// Output order of the FER+ classifier.
    pub const ALL: [Emotion; 8] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Surprise,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Contempt,
    ];
}

/// FairFace race classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Race {
    White,
    Black,
    LatinoHispanic,
    EastAsian,
    SoutheastAsian,
    Indian,
    MiddleEastern,
}

impl Race {
    /// Output order of the FairFace race head.
    pub const ALL: [Race; 7] = [
        Race::White,
        Race::Black,
        Race::LatinoHispanic,
        Race::EastAsian,
        Race::SoutheastAsian,
        Race::Indian,
        Race::MiddleEastern,
    ];
}

macro_rules! impl_label_display {
    ($ty:ty { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $(Self::$variant => $label),+
                })
            }
        }
    };
}

impl_label_display!(Gender { Woman => "woman", Man => "man" });
impl_label_display!(Emotion {
    Neutral => "neutral",
    Happy => "happy",
    Surprise => "surprise",
    Sad => "sad",
    Angry => "angry",
    Disgust => "disgust",
    Fear => "fear",
    Contempt => "contempt",
});
impl_label_display!(Race {
    White => "white",
    Black => "black",
    LatinoHispanic => "latino hispanic",
    EastAsian => "east asian",
    SoutheastAsian => "southeast asian",
    Indian => "indian",
    MiddleEastern => "middle eastern",
});

/// A class label with its confidence in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Labeled<T> {
    pub label: T,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionEstimate {
    pub dominant: Emotion,
    /// Per-emotion probability in [0, 1]; sums to 1.
    pub scores: BTreeMap<Emotion, f32>,
}

impl EmotionEstimate {
    /// Build from probabilities; the dominant emotion is the highest score,
    /// ties resolved in favour of the earlier class.
    pub fn from_scores(scores: BTreeMap<Emotion, f32>) -> Option<Self> {
        let dominant = scores
            .iter()
            .fold(None::<(Emotion, f32)>, |best, (&emotion, &score)| match best {
                Some((_, s)) if s >= score => best,
                _ => Some((emotion, score)),
            })?
            .0;
        Some(Self { dominant, scores })
    }

    pub fn confidence(&self) -> f32 {
        self.scores.get(&self.dominant).copied().unwrap_or(0.0)
    }
}

/// Attribute estimates for the face in one image, as returned by an extractor.
///
/// A `None` attribute was not requested; it is never a stand-in for a failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceAttributes {
    pub age: Option<f32>,
    pub gender: Option<Labeled<Gender>>,
    pub emotion: Option<EmotionEstimate>,
    pub race: Option<Labeled<Race>>,
    /// Face region the estimates were computed on, when known.
    pub face: Option<FaceRegion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeResult {
    pub image_id: ImageId,
    #[serde(flatten)]
    pub attributes: FaceAttributes,
}

/// Raw answer from a face matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub distance: f32,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub image_id: ImageId,
    pub reference_id: ImageId,
    pub distance: f32,
    pub verified: bool,
    pub threshold: f32,
    pub metric: DistanceMetric,
}

/// Why a per-image job produced no result.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("extraction failed: {0}")]
    ExtractionError(String),
    #[error("comparison failed: {0}")]
    ComparisonError(String),
    #[error("timed out")]
    Timeout,
}

/// Per-image result slot: either a value or the recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<T> {
    Ok(T),
    Failed(FailureReason),
}

impl<T> Outcome<T> {
    pub fn ok(&self) -> Option<&T> {
        match self {
            Outcome::Ok(v) => Some(v),
            Outcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Failed(reason) => Some(reason),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }
}
