//! Image-to-tensor preprocessing shared by every model wrapper.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// Channel order of the tensor fed to a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Per-channel `(v - mean) * scale`, indexed in tensor channel order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub scale: [f32; 3],
}

impl Normalization {
    /// Raw 0..255 values.
    pub const RAW: Normalization = Normalization {
        mean: [0.0; 3],
        scale: [1.0; 3],
    };

    pub const fn uniform(mean: f32, scale: f32) -> Self {
        Self {
            mean: [mean; 3],
            scale: [scale; 3],
        }
    }

    fn apply(&self, channel: usize, v: u8) -> f32 {
        (v as f32 - self.mean[channel]) * self.scale[channel]
    }
}

/// Aspect-preserving resize into a `canvas` (`width, height`), anchored top-left on black.
///
/// Returns the canvas and the factor mapping original coordinates into it, so
/// `original = canvas / scale`.
pub fn letterbox(image: &RgbImage, canvas: (u32, u32)) -> (RgbImage, f32) {
    let (width, height) = image.dimensions();
    let (canvas_w, canvas_h) = canvas;

    let im_ratio = height as f32 / width as f32;
    let model_ratio = canvas_h as f32 / canvas_w as f32;
    let (new_w, new_h) = if im_ratio > model_ratio {
        let new_h = canvas_h;
        ((new_h as f32 / im_ratio) as u32, new_h)
    } else {
        let new_w = canvas_w;
        (new_w, (new_w as f32 * im_ratio) as u32)
    };
    let (new_w, new_h) = (new_w.clamp(1, canvas_w), new_h.clamp(1, canvas_h));
    let scale = new_h as f32 / height as f32;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut out = RgbImage::new(canvas_w, canvas_h);
    imageops::replace(&mut out, &resized, 0, 0);

    (out, scale)
}

pub fn resize(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// Build a `[batch, 3, H, W]` tensor. Rows past `images.len()` stay zero.
///
/// Every image must already be `width × height`; use [`resize`] first.
pub fn batch_tensor(
    images: &[RgbImage],
    batch: usize,
    (width, height): (u32, u32),
    order: ChannelOrder,
    norm: Normalization,
) -> Array4<f32> {
    let (w, h) = (width as usize, height as usize);
    let mut tensor = Array4::<f32>::zeros((batch.max(images.len()), 3, h, w));

    for (n, img) in images.iter().enumerate() {
        for (x, y, pixel) in img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= w || y >= h {
                continue;
            }
            let [r, g, b] = pixel.0;
            let channels = match order {
                ChannelOrder::Rgb => [r, g, b],
                ChannelOrder::Bgr => [b, g, r],
            };
            for (c, v) in channels.into_iter().enumerate() {
                tensor[[n, c, y, x]] = norm.apply(c, v);
            }
        }
    }

    tensor
}

pub fn image_tensor(image: &RgbImage, order: ChannelOrder, norm: Normalization) -> Array4<f32> {
    batch_tensor(std::slice::from_ref(image), 1, image.dimensions(), order, norm)
}
