//! Attribute estimators: InsightFace genderage, FER+ emotion and FairFace race.
//!
//! Each model takes a square crop around the detected face box; crop scale,
//! input size and normalization follow what each network was trained with.

use crate::alignment::square_crop;
use facecheck_core::types::{Emotion, EmotionEstimate, Gender, Labeled, Race};
use facecheck_core::FaceRegion;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const GENDERAGE_INPUT_SIZE: u32 = 96;
const GENDERAGE_CROP_SCALE: f32 = 1.5;

const FERPLUS_INPUT_SIZE: u32 = 64;
const FERPLUS_CROP_SCALE: f32 = 1.0;

const FAIRFACE_INPUT_SIZE: u32 = 224;
const FAIRFACE_CROP_SCALE: f32 = 1.25;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum AttributeModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

fn load_session(model_path: &Path, kind: &str) -> Result<Session, AttributeModelError> {
    if !model_path.exists() {
        return Err(AttributeModelError::ModelNotFound(model_path.display().to_string()));
    }
    let session = crate::open_session(model_path)?;
    tracing::info!(path = %model_path.display(), model = kind, "loaded attribute model");
    Ok(session)
}

/// Run a single-input model and return its first output, checking it has at
/// least `min_len` values.
fn run_first_output(
    session: &mut Session,
    input: &Array4<f32>,
    min_len: usize,
) -> Result<Vec<f32>, AttributeModelError> {
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
    let (_, raw) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| AttributeModelError::InferenceFailed(e.to_string()))?;
    if raw.len() < min_len {
        return Err(AttributeModelError::InferenceFailed(format!(
            "expected at least {min_len} outputs, got {}",
            raw.len()
        )));
    }
    Ok(raw.to_vec())
}

/// Numerically stable softmax.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and value of the largest element; ties go to the first.
fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

/// InsightFace genderage: outputs `[female, male, age / 100]`.
pub struct GenderAgeModel {
    session: Session,
}

impl GenderAgeModel {
    pub fn load(model_path: &Path) -> Result<Self, AttributeModelError> {
        Ok(Self { session: load_session(model_path, "genderage")? })
    }

    pub fn estimate(
        &mut self,
        image: &RgbImage,
        face: &FaceRegion,
    ) -> Result<(f32, Labeled<Gender>), AttributeModelError> {
        let crop = square_crop(image, face, GENDERAGE_CROP_SCALE, GENDERAGE_INPUT_SIZE);
        let raw = run_first_output(&mut self.session, &rgb_tensor(&crop, |v, _| v), 3)?;
        Ok(decode_gender_age(&raw))
    }
}

fn decode_gender_age(raw: &[f32]) -> (f32, Labeled<Gender>) {
    let probs = softmax(&raw[..2]);
    let gender = if probs[1] > probs[0] {
        Labeled { label: Gender::Man, confidence: probs[1] }
    } else {
        Labeled { label: Gender::Woman, confidence: probs[0] }
    };
    let age = (raw[2] * 100.0).round().max(0.0);
    (age, gender)
}

/// FER+ emotion classifier on a 64×64 grayscale crop.
pub struct EmotionModel {
    session: Session,
}

impl EmotionModel {
    pub fn load(model_path: &Path) -> Result<Self, AttributeModelError> {
        Ok(Self { session: load_session(model_path, "emotion-ferplus")? })
    }

    pub fn estimate(
        &mut self,
        image: &RgbImage,
        face: &FaceRegion,
    ) -> Result<EmotionEstimate, AttributeModelError> {
        let crop = square_crop(image, face, FERPLUS_CROP_SCALE, FERPLUS_INPUT_SIZE);
        let raw = run_first_output(&mut self.session, &gray_tensor(&crop), Emotion::ALL.len())?;
        decode_emotion(&raw)
    }
}

fn decode_emotion(raw: &[f32]) -> Result<EmotionEstimate, AttributeModelError> {
    let probs = softmax(&raw[..Emotion::ALL.len()]);
    let scores: BTreeMap<Emotion, f32> = Emotion::ALL.into_iter().zip(probs).collect();
    EmotionEstimate::from_scores(scores)
        .ok_or_else(|| AttributeModelError::InferenceFailed("empty emotion scores".into()))
}

/// FairFace classifier; the first seven logits are the race head.
pub struct RaceModel {
    session: Session,
}

impl RaceModel {
    pub fn load(model_path: &Path) -> Result<Self, AttributeModelError> {
        Ok(Self { session: load_session(model_path, "fairface")? })
    }

    pub fn estimate(
        &mut self,
        image: &RgbImage,
        face: &FaceRegion,
    ) -> Result<Labeled<Race>, AttributeModelError> {
        let crop = square_crop(image, face, FAIRFACE_CROP_SCALE, FAIRFACE_INPUT_SIZE);
        let input = rgb_tensor(&crop, |v, c| (v / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
        let raw = run_first_output(&mut self.session, &input, Race::ALL.len())?;
        decode_race(&raw)
    }
}

fn decode_race(raw: &[f32]) -> Result<Labeled<Race>, AttributeModelError> {
    let probs = softmax(&raw[..Race::ALL.len()]);
    let (idx, confidence) = argmax(&probs)
        .ok_or_else(|| AttributeModelError::InferenceFailed("empty race scores".into()))?;
    Ok(Labeled { label: Race::ALL[idx], confidence })
}

/// NCHW RGB tensor with a per-channel normalization `f(value, channel)`.
fn rgb_tensor(crop: &RgbImage, normalize: impl Fn(f32, usize) -> f32) -> Array4<f32> {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = normalize(pixel[c] as f32, c);
        }
    }
    tensor
}

/// Single-channel tensor of BT.601 luma, unnormalized 0–255.
fn gray_tensor(crop: &RgbImage) -> Array4<f32> {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 1, h, w));
    for (x, y, pixel) in crop.enumerate_pixels() {
        let [r, g, b] = pixel.0.map(f32::from);
        tensor[[0, 0, y as usize, x as usize]] = 0.299 * r + 0.587 * g + 0.114 * b;
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_softmax_large_logits_stable() {
        let p = softmax(&[1000.0, 1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_first_on_tie() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some((1, 0.4)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_decode_gender_age() {
        let (age, gender) = decode_gender_age(&[0.1, 2.0, 0.314]);
        assert_eq!(age, 31.0);
        assert_eq!(gender.label, Gender::Man);
        assert!(gender.confidence > 0.5 && gender.confidence <= 1.0);

        let (_, gender) = decode_gender_age(&[3.0, -1.0, 0.2]);
        assert_eq!(gender.label, Gender::Woman);
    }

    #[test]
    fn test_decode_gender_age_negative_age_clamped() {
        let (age, _) = decode_gender_age(&[0.0, 1.0, -0.05]);
        assert_eq!(age, 0.0);
    }

    #[test]
    fn test_decode_emotion() {
        let mut raw = vec![0.0; 8];
        raw[1] = 5.0;
        let estimate = decode_emotion(&raw).unwrap();
        assert_eq!(estimate.dominant, Emotion::Happy);
        assert_eq!(estimate.scores.len(), 8);
        assert!((estimate.scores.values().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_decode_race_ignores_extra_heads() {
        // FairFace emits race(7) + gender(2) + age(9) logits.
        let mut raw = vec![0.0; 18];
        raw[3] = 4.0;
        raw[10] = 100.0;
        let race = decode_race(&raw).unwrap();
        assert_eq!(race.label, Race::EastAsian);
        assert!(race.confidence > 0.5);
    }

    #[test]
    fn test_gray_tensor_luma() {
        let crop = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        let t = gray_tensor(&crop);
        assert_eq!(t.shape(), &[1, 1, 4, 4]);
        assert!((t[[0, 0, 2, 2]] - 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_rgb_tensor_imagenet() {
        let crop = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        let t = rgb_tensor(&crop, |v, c| (v / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
        assert!((t[[0, 0, 0, 0]] + 0.485 / 0.229).abs() < 1e-5);
    }

    #[test]
    fn test_load_missing_model() {
        let err = EmotionModel::load(Path::new("/nonexistent/emotion.onnx")).err().unwrap();
        assert!(matches!(err, AttributeModelError::ModelNotFound(_)));
    }
}
