//! Upload validation and decoding.
//!
//! Turns raw upload buffers into [`UploadedImage`]s. Batch-level violations
//! (count outside 1–10) fail the whole call; per-entry problems are returned
//! alongside the valid images so the batch can proceed without them.

use crate::config::{IngestLimits, MAX_BATCH, MIN_BATCH};
use crate::types::{ImageId, UploadedImage};
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, Limits};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use thiserror::Error;

/// Container formats accepted by the uploader.
const ACCEPTED_FORMATS: [ImageFormat; 2] = [ImageFormat::Jpeg, ImageFormat::Png];

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestError {
    #[error("too many images: {count} uploaded, at most {max} allowed")]
    TooManyImages { count: usize, max: usize },
    #[error("no images uploaded: at least {min} required")]
    EmptyBatch { min: usize },
    #[error("upload {index} ({filename}) is not a valid image: {reason}")]
    InvalidImageFormat {
        index: usize,
        filename: String,
        reason: String,
    },
    #[error("upload {index} ({filename}) is {size} bytes, limit is {limit}")]
    ImageTooLarge {
        index: usize,
        filename: String,
        size: usize,
        limit: usize,
    },
}

/// A single raw upload.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// An upload that failed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedUpload {
    pub id: ImageId,
    pub filename: String,
    pub error: IngestError,
}

/// Result of ingesting a batch: valid images and rejected entries, both in
/// upload order.
#[derive(Debug, Clone)]
pub struct IngestBatch {
    pub images: Vec<UploadedImage>,
    pub rejected: Vec<RejectedUpload>,
}

/// Validate and decode a batch of uploads.
pub fn ingest(uploads: Vec<Upload>, limits: &IngestLimits) -> Result<IngestBatch, IngestError> {
    check_batch_size(uploads.len())?;

    let mut images = Vec::with_capacity(uploads.len());
    let mut rejected = Vec::new();

    for (index, upload) in uploads.into_iter().enumerate() {
        let id = ImageId(index as u32);
        match decode_upload(index, upload, limits) {
            Ok(image) => {
                tracing::debug!(
                    id = %image.id,
                    filename = %image.filename,
                    width = image.width(),
                    height = image.height(),
                    format = %image.format,
                    "ingested upload"
                );
                images.push(image);
            }
            Err((filename, error)) => {
                tracing::warn!(%id, %filename, error = %error, "rejected upload");
                rejected.push(RejectedUpload { id, filename, error });
            }
        }
    }

    Ok(IngestBatch { images, rejected })
}

fn check_batch_size(count: usize) -> Result<(), IngestError> {
    if count < MIN_BATCH {
        return Err(IngestError::EmptyBatch { min: MIN_BATCH });
    }
    if count > MAX_BATCH {
        return Err(IngestError::TooManyImages {
            count,
            max: MAX_BATCH,
        });
    }
    Ok(())
}

/// Decode one upload. On failure hands the filename back with the error.
fn decode_upload(
    index: usize,
    upload: Upload,
    limits: &IngestLimits,
) -> Result<UploadedImage, (String, IngestError)> {
    let Upload { filename, bytes } = upload;
    let invalid = |reason: String| IngestError::InvalidImageFormat {
        index,
        filename: filename.clone(),
        reason,
    };

    if bytes.is_empty() {
        let err = invalid("empty upload".into());
        return Err((filename, err));
    }
    if bytes.len() > limits.max_upload_bytes {
        let err = IngestError::ImageTooLarge {
            index,
            filename: filename.clone(),
            size: bytes.len(),
            limit: limits.max_upload_bytes,
        };
        return Err((filename, err));
    }

    let decoded = decode_pixels(&bytes, limits).map_err(invalid);
    let (pixels, format) = match decoded {
        Ok(v) => v,
        Err(err) => return Err((filename, err)),
    };

    Ok(UploadedImage {
        id: ImageId(index as u32),
        digest: sha256_hex(&bytes),
        filename,
        bytes,
        pixels,
        format,
    })
}

/// Decode to RGB8 with EXIF orientation applied.
fn decode_pixels(bytes: &[u8], limits: &IngestLimits) -> Result<(image::RgbImage, String), String> {
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| format!("cannot read upload: {e}"))?;

    let format = reader
        .format()
        .ok_or_else(|| "unrecognized image format".to_string())?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(format!("unsupported format {format:?} (expected JPEG or PNG)"));
    }

    let mut decode_limits = Limits::default();
    decode_limits.max_image_width = Some(limits.max_dimension);
    decode_limits.max_image_height = Some(limits.max_dimension);
    reader.limits(decode_limits);

    let mut decoder = reader.into_decoder().map_err(|e| e.to_string())?;
    let orientation = decoder.orientation().map_err(|e| e.to_string())?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(|e| e.to_string())?;
    image.apply_orientation(orientation);

    let label = format
        .extensions_str()
        .first()
        .copied()
        .unwrap_or("unknown")
        .to_string();
    Ok((image.to_rgb8(), label))
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Encode a small solid-colour test image.
#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([shade, shade, shade]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploads(n: usize) -> Vec<Upload> {
        (0..n)
            .map(|i| Upload::new(format!("img{i}.png"), test_png(4, 4, i as u8 * 10)))
            .collect()
    }

    #[test]
    fn test_ingest_valid_batch_preserves_order() {
        let batch = ingest(uploads(3), &IngestLimits::default()).unwrap();
        assert_eq!(batch.images.len(), 3);
        assert!(batch.rejected.is_empty());
        let ids: Vec<_> = batch.images.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![ImageId(0), ImageId(1), ImageId(2)]);
        assert_eq!(batch.images[1].filename, "img1.png");
        assert_eq!(batch.images[0].format, "png");
        assert_eq!((batch.images[0].width(), batch.images[0].height()), (4, 4));
    }

    #[test]
    fn test_ingest_empty_batch() {
        let err = ingest(Vec::new(), &IngestLimits::default()).unwrap_err();
        assert_eq!(err, IngestError::EmptyBatch { min: 1 });
    }

    #[test]
    fn test_ingest_eleven_images() {
        let err = ingest(uploads(11), &IngestLimits::default()).unwrap_err();
        assert_eq!(err, IngestError::TooManyImages { count: 11, max: 10 });
    }

    #[test]
    fn test_ingest_ten_images_accepted() {
        let batch = ingest(uploads(10), &IngestLimits::default()).unwrap();
        assert_eq!(batch.images.len(), 10);
    }

    #[test]
    fn test_malformed_entry_does_not_abort_batch() {
        let mut batch = uploads(3);
        batch[1] = Upload::new("notes.txt", b"definitely not an image".to_vec());
        let result = ingest(batch, &IngestLimits::default()).unwrap();

        assert_eq!(result.images.len(), 2);
        assert_eq!(result.images[1].id, ImageId(2));
        assert_eq!(result.rejected.len(), 1);
        let rejected = &result.rejected[0];
        assert_eq!(rejected.id, ImageId(1));
        assert_eq!(rejected.filename, "notes.txt");
        assert!(matches!(
            &rejected.error,
            IngestError::InvalidImageFormat { index: 1, filename, .. } if filename == "notes.txt"
        ));
    }

    #[test]
    fn test_empty_upload_is_invalid() {
        let result = ingest(vec![Upload::new("empty.png", Vec::new())], &IngestLimits::default()).unwrap();
        assert!(result.images.is_empty());
        assert!(matches!(result.rejected[0].error, IngestError::InvalidImageFormat { .. }));
    }

    #[test]
    fn test_oversized_upload_rejected() {
        let limits = IngestLimits { max_upload_bytes: 16, ..IngestLimits::default() };
        let result = ingest(uploads(1), &limits).unwrap();
        assert!(matches!(result.rejected[0].error, IngestError::ImageTooLarge { limit: 16, .. }));
    }

    #[test]
    fn test_dimension_limit_rejects() {
        let limits = IngestLimits { max_dimension: 2, ..IngestLimits::default() };
        let result = ingest(uploads(1), &limits).unwrap();
        assert!(matches!(result.rejected[0].error, IngestError::InvalidImageFormat { .. }));
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Bmp).unwrap();
        let result = ingest(vec![Upload::new("a.bmp", out.into_inner())], &IngestLimits::default()).unwrap();
        match &result.rejected[0].error {
            IngestError::InvalidImageFormat { reason, .. } => assert!(reason.contains("unsupported")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn crc32(data: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &byte in data {
            crc ^= byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
            }
        }
        !crc
    }

    /// PNG with an `eXIf` chunk carrying only an Orientation tag.
    fn png_with_orientation(width: u32, height: u32, orientation: u16) -> Vec<u8> {
        let png = test_png(width, height, 90);
        // Little-endian TIFF header, one IFD entry: 0x0112 SHORT x1.
        let mut exif = b"II\x2a\x00\x08\x00\x00\x00\x01\x00\x12\x01\x03\x00\x01\x00\x00\x00".to_vec();
        exif.extend_from_slice(&(orientation as u32).to_le_bytes());
        exif.extend_from_slice(&[0, 0, 0, 0]);

        let mut chunk = Vec::new();
        chunk.extend_from_slice(&(exif.len() as u32).to_be_bytes());
        let mut body = b"eXIf".to_vec();
        body.extend_from_slice(&exif);
        chunk.extend_from_slice(&body);
        chunk.extend_from_slice(&crc32(&body).to_be_bytes());

        // Signature (8) + IHDR chunk (25); the metadata goes before IDAT.
        let mut out = png[..33].to_vec();
        out.extend_from_slice(&chunk);
        out.extend_from_slice(&png[33..]);
        out
    }

    #[test]
    fn test_exif_orientation_applied() {
        let result = ingest(
            vec![Upload::new("rotated.png", png_with_orientation(4, 2, 6))],
            &IngestLimits::default(),
        )
        .unwrap();
        assert!(result.rejected.is_empty(), "{:?}", result.rejected);
        let image = &result.images[0];
        assert_eq!((image.width(), image.height()), (2, 4));
    }

    #[test]
    fn test_jpeg_accepted() {
        let img = image::RgbImage::from_pixel(5, 3, image::Rgb([200, 120, 40]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Jpeg).unwrap();

        let result = ingest(vec![Upload::new("photo.jpg", out.into_inner())], &IngestLimits::default()).unwrap();
        assert!(result.rejected.is_empty(), "{:?}", result.rejected);
        let image = &result.images[0];
        assert_eq!(image.format, "jpg");
        assert_eq!((image.width(), image.height()), (5, 3));
    }

    #[test]
    fn test_truncated_png_rejected() {
        let png = test_png(32, 32, 50);
        let truncated = png[..png.len() / 2].to_vec();
        let result = ingest(vec![Upload::new("cut.png", truncated)], &IngestLimits::default()).unwrap();
        assert!(result.images.is_empty());
        assert!(matches!(
            &result.rejected[0].error,
            IngestError::InvalidImageFormat { filename, .. } if filename == "cut.png"
        ));
    }

    #[test]
    fn test_digest_is_content_hash() {
        let batch = ingest(
            vec![
                Upload::new("a.png", test_png(2, 2, 7)),
                Upload::new("b.png", test_png(2, 2, 7)),
            ],
            &IngestLimits::default(),
        )
        .unwrap();
        assert_eq!(batch.images[0].digest, batch.images[1].digest);
        assert_eq!(batch.images[0].digest.len(), 64);
    }
}
