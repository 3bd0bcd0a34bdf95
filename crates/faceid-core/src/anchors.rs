//! Reference anchors for the RetinaFace feature pyramid.
//!
//! Base anchors are generated once per stride from an [`AnchorConfig`] and
//! expanded into a dense per-cell grid at decode time. Every collection here is
//! ordered by stride, largest first, because detector outputs are paired with
//! anchors positionally in that order.

use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AnchorConfigError {
    #[error("no strides configured")]
    NoStrides,
    #[error("stride {stride}: {field} list is empty")]
    EmptyList { stride: usize, field: &'static str },
    #[error("stride {0}: base size must be positive")]
    ZeroBaseSize(usize),
    #[error("stride {0} configured more than once")]
    DuplicateStride(usize),
    #[error("stride must be an even number for dense anchors, got {0}")]
    OddStride(usize),
}

/// Per-stride anchor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorConfig {
    pub base_size: usize,
    pub ratios: Vec<f32>,
    pub scales: Vec<f32>,
    /// Carried for model-config compatibility; decoding keeps anchors crossing the border.
    pub allowed_border: i32,
}

/// The RetinaFace (mnet/r50) pyramid: strides 32, 16, 8 with two scales each.
pub fn retinaface_anchor_configs() -> Vec<(usize, AnchorConfig)> {
    let level = |scales: [f32; 2]| AnchorConfig {
        base_size: 16,
        ratios: vec![1.0],
        scales: scales.to_vec(),
        allowed_border: 9999,
    };
    vec![
        (32, level([32.0, 16.0])),
        (16, level([8.0, 4.0])),
        (8, level([2.0, 1.0])),
    ]
}

/// Base anchors of one pyramid level, shape `[A, 4]`.
#[derive(Debug, Clone, PartialEq)]
pub struct StrideAnchors {
    pub stride: usize,
    pub base: Array2<f32>,
}

impl StrideAnchors {
    pub fn num_anchors(&self) -> usize {
        self.base.nrows()
    }
}

/// Immutable anchor set for all pyramid levels, built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorSet {
    levels: Vec<StrideAnchors>,
}

impl AnchorSet {
    pub fn generate(configs: &[(usize, AnchorConfig)]) -> Result<Self, AnchorConfigError> {
        Self::generate_with(configs, false)
    }

    /// Generate base anchors for every stride.
    ///
    /// With `dense`, each level is followed by a copy shifted by `stride / 2`,
    /// doubling the anchor count.
    pub fn generate_with(
        configs: &[(usize, AnchorConfig)],
        dense: bool,
    ) -> Result<Self, AnchorConfigError> {
        if configs.is_empty() {
            return Err(AnchorConfigError::NoStrides);
        }

        let mut ordered: Vec<&(usize, AnchorConfig)> = configs.iter().collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0));
        if let Some(w) = ordered.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(AnchorConfigError::DuplicateStride(w[0].0));
        }

        let mut levels = Vec::with_capacity(ordered.len());
        for (stride, cfg) in ordered {
            let stride = *stride;
            if cfg.base_size == 0 {
                return Err(AnchorConfigError::ZeroBaseSize(stride));
            }
            if cfg.ratios.is_empty() {
                return Err(AnchorConfigError::EmptyList { stride, field: "ratios" });
            }
            if cfg.scales.is_empty() {
                return Err(AnchorConfigError::EmptyList { stride, field: "scales" });
            }

            let mut rows = base_anchors(cfg);
            if dense {
                if stride % 2 != 0 {
                    return Err(AnchorConfigError::OddStride(stride));
                }
                let shift = (stride / 2) as f32;
                let shifted: Vec<[f32; 4]> = rows
                    .iter()
                    .map(|a| [a[0] + shift, a[1] + shift, a[2] + shift, a[3] + shift])
                    .collect();
                rows.extend(shifted);
            }

            let base = Array2::from_shape_fn((rows.len(), 4), |(i, c)| rows[i][c]);
            tracing::debug!(stride, anchors = rows.len(), "generated base anchors");
            levels.push(StrideAnchors { stride, base });
        }

        Ok(Self { levels })
    }

    /// Levels in descending stride order.
    pub fn levels(&self) -> &[StrideAnchors] {
        &self.levels
    }

    pub fn get(&self, stride: usize) -> Option<&StrideAnchors> {
        self.levels.iter().find(|l| l.stride == stride)
    }

    pub fn strides(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.stride).collect()
    }
}

/// Base anchors for one config: ratios outermost, scales innermost.
fn base_anchors(cfg: &AnchorConfig) -> Vec<[f32; 4]> {
    let size = cfg.base_size as f32;
    let unit = [0.0, 0.0, size - 1.0, size - 1.0];
    ratio_enum(unit, &cfg.ratios)
        .into_iter()
        .flat_map(|anchor| scale_enum(anchor, &cfg.scales))
        .collect()
}

/// Width, height and centre of an anchor in the inclusive-pixel convention.
fn whctrs(anchor: [f32; 4]) -> (f32, f32, f32, f32) {
    let w = anchor[2] - anchor[0] + 1.0;
    let h = anchor[3] - anchor[1] + 1.0;
    let cx = anchor[0] + 0.5 * (w - 1.0);
    let cy = anchor[1] + 0.5 * (h - 1.0);
    (w, h, cx, cy)
}

fn mkanchor(w: f32, h: f32, cx: f32, cy: f32) -> [f32; 4] {
    let hw = 0.5 * (w - 1.0);
    let hh = 0.5 * (h - 1.0);
    [cx - hw, cy - hh, cx + hw, cy + hh]
}

/// Area-preserving aspect variants around the same centre.
fn ratio_enum(anchor: [f32; 4], ratios: &[f32]) -> Vec<[f32; 4]> {
    let (w, h, cx, cy) = whctrs(anchor);
    let area = w * h;
    ratios
        .iter()
        .map(|&r| {
            let ws = (area / r).sqrt();
            let hs = ws * r;
            mkanchor(ws, hs, cx, cy)
        })
        .collect()
}

fn scale_enum(anchor: [f32; 4], scales: &[f32]) -> Vec<[f32; 4]> {
    let (w, h, cx, cy) = whctrs(anchor);
    scales
        .iter()
        .map(|&s| mkanchor(w * s, h * s, cx, cy))
        .collect()
}

/// Shift base anchors to every cell of a `height × width` feature map.
///
/// Returns `[height, width, A, 4]`; cell `(row, col)` adds `(col·stride, row·stride)`.
pub fn anchor_grid(height: usize, width: usize, stride: usize, base: &Array2<f32>) -> Array4<f32> {
    let a = base.nrows();
    Array4::from_shape_fn((height, width, a, 4), |(row, col, k, c)| {
        let offset = if c % 2 == 0 { col * stride } else { row * stride };
        base[[k, c]] + offset as f32
    })
}
