//! Face alignment via 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the ArcFace reference layout by least
//! squares and warps the face into a square crop. Without usable landmarks the
//! face box, grown by a fixed margin, is cropped and resized instead.

use crate::config::AlignParams;
use crate::types::{FaceBox, Landmarks};
use image::{imageops, Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const REFERENCE_SIZE: f32 = 112.0;
const MIN_SPREAD: f32 = 1e-6;

/// `[x', y'] = [[a, -b], [b, a]] · [x, y] + [tx, ty]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit from `src` to `dst`. `None` when the source points coincide.
    pub fn estimate(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let n = src.len() as f32;
        let centroid = |pts: &Landmarks| {
            let (sx, sy) = pts.iter().fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (scx, scy) = centroid(src);
        let (dcx, dcy) = centroid(dst);

        let (mut spread, mut dot, mut cross) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy, dx, dy) = (sx - scx, sy - scy, dx - dcx, dy - dcy);
            spread += sx * sx + sy * sy;
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
        }
        if !spread.is_finite() || spread < MIN_SPREAD {
            return None;
        }

        let (a, b) = (dot / spread, cross / spread);
        let tx = dcx - (a * scx - b * scy);
        let ty = dcy - (b * scx + a * scy);
        if a * a + b * b < MIN_SPREAD {
            return None;
        }
        Some(Self { a, b, tx, ty })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Map an output pixel back into the source image.
    fn invert(&self, (x, y): (f32, f32)) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        ((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det)
    }
}

/// Bilinear warp of `image` into an `out_size × out_size` crop. Pixels mapping
/// outside the source are black.
fn warp(image: &RgbImage, transform: &SimilarityTransform, out_size: u32) -> RgbImage {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.get_pixel(x as u32, y as u32).0[c] as f32
        } else {
            0.0
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let (sx, sy) = transform.invert((ox as f32, oy as f32));
        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);

        let mut px = [0u8; 3];
        for (c, out) in px.iter_mut().enumerate() {
            let v = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            *out = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

#[derive(Debug, Clone, Default)]
pub struct FaceAligner {
    params: AlignParams,
}

impl FaceAligner {
    pub fn new(params: AlignParams) -> Self {
        Self { params }
    }

    pub fn output_size(&self) -> u32 {
        self.params.output_size
    }

    /// Reference landmarks scaled to the configured output size.
    pub fn reference(&self) -> Landmarks {
        let k = self.params.output_size as f32 / REFERENCE_SIZE;
        REFERENCE_LANDMARKS_112.map(|(x, y)| (x * k, y * k))
    }

    /// Produce an aligned square face crop.
    pub fn align(&self, image: &RgbImage, bbox: Option<&FaceBox>, landmarks: Option<&Landmarks>) -> RgbImage {
        let transform = landmarks.and_then(|lms| SimilarityTransform::estimate(lms, &self.reference()));
        match transform {
            Some(t) => warp(image, &t, self.params.output_size),
            None => {
                tracing::debug!(has_landmarks = landmarks.is_some(), "alignment falling back to margin crop");
                self.margin_crop(image, bbox)
            }
        }
    }

    fn margin_crop(&self, image: &RgbImage, bbox: Option<&FaceBox>) -> RgbImage {
        let (w, h) = (image.width() as f32, image.height() as f32);
        let inset = self.params.default_box_inset;
        let det = bbox
            .copied()
            .unwrap_or_else(|| FaceBox::new(w * inset, h * inset, w - w * inset, h - h * inset));

        let half = self.params.margin as f32 / 2.0;
        let x0 = (det.x1 - half).max(0.0) as u32;
        let y0 = (det.y1 - half).max(0.0) as u32;
        let x1 = (det.x2 + half).min(w) as u32;
        let y1 = (det.y2 + half).min(h) as u32;

        let size = self.params.output_size;
        if x1 <= x0 || y1 <= y0 {
            return imageops::resize(image, size, size, imageops::FilterType::Triangle);
        }
        let region = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
        imageops::resize(&region, size, size, imageops::FilterType::Triangle)
    }
}
