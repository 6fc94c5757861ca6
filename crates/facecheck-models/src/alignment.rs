//! Face alignment and cropping.
//!
//! Aligns detected faces to the canonical ArcFace 112×112 position with a
//! 4-DOF similarity transform (scale, rotation, translation) fitted to the
//! five landmarks, and cuts square crops around a face box for the attribute
//! models.

use facecheck_core::FaceRegion;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Least-squares similarity transform mapping `src` onto `dst`.
///
/// Returns `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (msx, msy) = mean(src);
    let (mdx, mdy) = mean(dst);

    // Closed form on centered coordinates.
    let (mut num_a, mut num_b, mut denom) = (0.0f32, 0.0f32, 0.0f32);
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - msx, sy - msy);
        let (dx, dy) = (dx - mdx, dy - mdy);
        num_a += sx * dx + sy * dy;
        num_b += sx * dy - sy * dx;
        denom += sx * sx + sy * sy;
    }
    if denom < 1e-12 {
        return [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    }

    let a = num_a / denom;
    let b = num_b / denom;
    let tx = mdx - (a * msx - b * msy);
    let ty = mdy - (b * msx + a * msy);
    [a, -b, tx, b, a, ty]
}

/// Bilinear sample at a sub-pixel position; outside the image reads as black.
pub(crate) fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> [f32; 3] {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let (w, h) = (image.width() as i64, image.height() as i64);

    let pixel = |px: i64, py: i64| -> [f32; 3] {
        if px >= 0 && px < w && py >= 0 && py < h {
            let Rgb([r, g, b]) = *image.get_pixel(px as u32, py as u32);
            [r as f32, g as f32, b as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr) = (pixel(x0, y0), pixel(x0 + 1, y0));
    let (bl, br) = (pixel(x0, y0 + 1), pixel(x0 + 1, y0 + 1));
    std::array::from_fn(|c| {
        tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy
    })
}

fn to_rgb(v: [f32; 3]) -> Rgb<u8> {
    Rgb(v.map(|c| c.round().clamp(0.0, 255.0) as u8))
}

/// Warp `image` through the inverse of a similarity transform into a square
/// output of `out_size` pixels.
fn warp_similarity(image: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, b, tx, ty) = (matrix[0], matrix[3], matrix[2], matrix[5]);
    let det = a * a + b * b;
    if det < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let (ia, ib) = (a / det, b / det);

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        to_rgb(sample_bilinear(image, ia * dx + ib * dy, -ib * dx + ia * dy))
    })
}

/// Align a face to the canonical 112×112 ArcFace crop using its landmarks.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_similarity(image, &matrix, ALIGNED_SIZE)
}

/// Square crop centred on `face`, with side `scale` × the larger face side,
/// resampled to `size`×`size`.
pub fn square_crop(image: &RgbImage, face: &FaceRegion, scale: f32, size: u32) -> RgbImage {
    let side = face.width.max(face.height).max(1.0) * scale;
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let step = side / size as f32;
    let left = cx - side / 2.0;
    let top = cy - side / 2.0;

    RgbImage::from_fn(size, size, |ox, oy| {
        let sx = left + (ox as f32 + 0.5) * step - 0.5;
        let sy = top + (oy as f32 + 0.5) * step - 0.5;
        to_rgb(sample_bilinear(image, sx, sy))
    })
}
