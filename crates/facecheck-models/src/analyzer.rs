//! ONNX-backed implementation of the attribute extractor and face matcher.
//!
//! One [`FaceAnalyzer`] is loaded at startup and shared across the
//! aggregator's workers. Each ONNX session sits behind its own mutex, so
//! concurrent jobs serialize per model rather than globally.

use crate::alignment::{align_face, square_crop, ALIGNED_SIZE};
use crate::attributes::{AttributeModelError, EmotionModel, GenderAgeModel, RaceModel};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::ModelPaths;
use facecheck_core::{
    Action, AnalysisConfig, AttributeExtractor, CapabilityError, DetectorBackend, Embedding,
    FaceAttributes, FaceMatcher, FaceRegion, MatchScore, UploadedImage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("attribute model: {0}")]
    Attribute(#[from] AttributeModelError),
}

/// Failure inside a single extract/compare call, before it is mapped onto the
/// capability error of the calling job.
#[derive(Error, Debug)]
enum AnalyzeError {
    #[error("no face detected")]
    NoFace,
    #[error("SCRFD detector not loaded")]
    DetectorUnavailable,
    #[error("{0} model not loaded")]
    ModelUnavailable(Action),
    #[error("non-finite distance")]
    NonFiniteDistance,
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error(transparent)]
    Attribute(#[from] AttributeModelError),
}

impl AnalyzeError {
    fn for_extraction(self) -> CapabilityError {
        match self {
            AnalyzeError::NoFace => CapabilityError::NoFaceDetected,
            other => CapabilityError::Extraction(other.to_string()),
        }
    }

    fn for_comparison(self) -> CapabilityError {
        match self {
            AnalyzeError::NoFace => CapabilityError::NoFaceDetected,
            other => CapabilityError::Comparison(other.to_string()),
        }
    }
}

/// Embeddings depend on the image content and on how the face was located.
type EmbeddingKey = (String, DetectorBackend, bool);

/// Enough for a few full runs; the reference of a run is looked up by every
/// comparison.
const EMBEDDING_CACHE_CAPACITY: usize = 64;

/// Insertion-ordered cache; the oldest entry is evicted once full.
struct EmbeddingCache {
    entries: HashMap<EmbeddingKey, Embedding>,
    order: VecDeque<EmbeddingKey>,
    capacity: usize,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &EmbeddingKey) -> Option<&Embedding> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: EmbeddingKey, embedding: Embedding) {
        if self.entries.insert(key.clone(), embedding).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct FaceAnalyzer {
    detector: Option<Mutex<FaceDetector>>,
    recognizer: Mutex<FaceRecognizer>,
    gender_age: Option<Mutex<GenderAgeModel>>,
    emotion: Option<Mutex<EmotionModel>>,
    race: Option<Mutex<RaceModel>>,
    embeddings: Mutex<EmbeddingCache>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FaceAnalyzer {
    /// Load every model `config` needs. Fails on the first missing or
    /// unloadable model.
    pub fn load(paths: &ModelPaths, config: &AnalysisConfig) -> Result<Self, LoadError> {
        let detector = match config.detector_backend {
            DetectorBackend::Scrfd => Some(Mutex::new(FaceDetector::load(&paths.detector)?)),
            DetectorBackend::Skip => None,
        };
        let recognizer = Mutex::new(FaceRecognizer::load(&paths.recognizer)?);

        let gender_age = if config.wants(Action::Age) || config.wants(Action::Gender) {
            Some(Mutex::new(GenderAgeModel::load(&paths.gender_age)?))
        } else {
            None
        };
        let emotion = if config.wants(Action::Emotion) {
            Some(Mutex::new(EmotionModel::load(&paths.emotion)?))
        } else {
            None
        };
        let race = if config.wants(Action::Race) {
            Some(Mutex::new(RaceModel::load(&paths.race)?))
        } else {
            None
        };

        tracing::info!(
            detector = detector.is_some(),
            gender_age = gender_age.is_some(),
            emotion = emotion.is_some(),
            race = race.is_some(),
            "face analyzer ready"
        );

        Ok(Self {
            detector,
            recognizer,
            gender_age,
            emotion,
            race,
            embeddings: Mutex::new(EmbeddingCache::new(EMBEDDING_CACHE_CAPACITY)),
        })
    }

    fn locate_face(
        &self,
        image: &UploadedImage,
        config: &AnalysisConfig,
    ) -> Result<FaceRegion, AnalyzeError> {
        let (w, h) = (image.width(), image.height());
        match config.detector_backend {
            DetectorBackend::Skip => Ok(FaceRegion::whole_image(w, h)),
            DetectorBackend::Scrfd => {
                let detector = self.detector.as_ref().ok_or(AnalyzeError::DetectorUnavailable)?;
                let faces = lock(detector).detect(&image.pixels)?;
                choose_face(faces, config.enforce_detection, w, h).ok_or(AnalyzeError::NoFace)
            }
        }
    }

    fn embedding(
        &self,
        image: &UploadedImage,
        config: &AnalysisConfig,
    ) -> Result<Embedding, AnalyzeError> {
        let key: EmbeddingKey = (
            image.digest.clone(),
            config.detector_backend,
            config.enforce_detection,
        );
        if let Some(cached) = lock(&self.embeddings).get(&key) {
            tracing::debug!(image = %image.id, "embedding cache hit");
            return Ok(cached.clone());
        }

        let face = self.locate_face(image, config)?;
        let crop = match &face.landmarks {
            Some(landmarks) => align_face(&image.pixels, landmarks),
            None => square_crop(&image.pixels, &face, 1.0, ALIGNED_SIZE),
        };
        let embedding = lock(&self.recognizer).embed(&crop)?;

        lock(&self.embeddings).insert(key, embedding.clone());
        Ok(embedding)
    }

    fn attributes(
        &self,
        image: &UploadedImage,
        config: &AnalysisConfig,
    ) -> Result<FaceAttributes, AnalyzeError> {
        let face = self.locate_face(image, config)?;
        let mut attributes = FaceAttributes::default();

        let wants_age = config.wants(Action::Age);
        let wants_gender = config.wants(Action::Gender);
        if wants_age || wants_gender {
            let action = if wants_age { Action::Age } else { Action::Gender };
            let model = self.gender_age.as_ref().ok_or(AnalyzeError::ModelUnavailable(action))?;
            let (age, gender) = lock(model).estimate(&image.pixels, &face)?;
            attributes.age = wants_age.then_some(age);
            attributes.gender = wants_gender.then_some(gender);
        }
        if config.wants(Action::Emotion) {
            let model = self
                .emotion
                .as_ref()
                .ok_or(AnalyzeError::ModelUnavailable(Action::Emotion))?;
            attributes.emotion = Some(lock(model).estimate(&image.pixels, &face)?);
        }
        if config.wants(Action::Race) {
            let model = self
                .race
                .as_ref()
                .ok_or(AnalyzeError::ModelUnavailable(Action::Race))?;
            attributes.race = Some(lock(model).estimate(&image.pixels, &face)?);
        }

        attributes.face = Some(face);
        Ok(attributes)
    }
}

/// Highest-confidence detection; with detection not enforced, an image
/// without faces is analysed as a whole.
fn choose_face(
    faces: Vec<FaceRegion>,
    enforce_detection: bool,
    width: u32,
    height: u32,
) -> Option<FaceRegion> {
    let best = faces
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
    match best {
        Some(face) => Some(face),
        None if !enforce_detection => Some(FaceRegion::whole_image(width, height)),
        None => None,
    }
}

fn verify(distance: f32, threshold: f32) -> Result<MatchScore, AnalyzeError> {
    if !distance.is_finite() {
        return Err(AnalyzeError::NonFiniteDistance);
    }
    Ok(MatchScore { distance, verified: distance <= threshold })
}

impl AttributeExtractor for FaceAnalyzer {
    fn extract(
        &self,
        image: &UploadedImage,
        config: &AnalysisConfig,
    ) -> Result<FaceAttributes, CapabilityError> {
        self.attributes(image, config)
            .map_err(AnalyzeError::for_extraction)
    }
}

impl FaceMatcher for FaceAnalyzer {
    fn compare(
        &self,
        probe: &UploadedImage,
        reference: &UploadedImage,
        config: &AnalysisConfig,
    ) -> Result<MatchScore, CapabilityError> {
        let score = self.embedding(probe, config).and_then(|probe_embedding| {
            let reference_embedding = self.embedding(reference, config)?;
            let distance = probe_embedding.distance(&reference_embedding, config.distance_metric);
            verify(distance, config.threshold())
        });
        score.map_err(AnalyzeError::for_comparison)
    }
}
