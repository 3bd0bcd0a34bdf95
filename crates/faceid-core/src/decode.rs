//! Per-level decoding of raw RetinaFace outputs into canvas-space candidates.
//!
//! Network tensors arrive as `[1, C, H, W]`. Each step below materialises an
//! owned, channel-last copy indexed as `(row, col, anchor)` so that row `i` of
//! every intermediate matrix refers to the same anchor as row `i` of the
//! expanded anchor grid.

use crate::anchors::{anchor_grid, StrideAnchors};
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayView4, ArrayViewD, Axis, Ix4};
use thiserror::Error;

const NUM_LANDMARKS: usize = 5;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("stride {stride}: {tensor} tensor must be [1, C, H, W], got {shape:?}")]
    BadShape {
        stride: usize,
        tensor: &'static str,
        shape: Vec<usize>,
    },
    #[error("stride {stride}: {tensor} has {channels} channels, expected {expected}")]
    ChannelMismatch {
        stride: usize,
        tensor: &'static str,
        channels: usize,
        expected: String,
    },
    #[error("stride {stride}: {tensor} grid is {got:?}, bbox grid is {expected:?}")]
    GridMismatch {
        stride: usize,
        tensor: &'static str,
        got: (usize, usize),
        expected: (usize, usize),
    },
}

/// Raw output tensors of one pyramid level.
#[derive(Debug, Clone)]
pub struct LevelOutputs<'a> {
    /// `[1, 2A, H, W]` (background + face) or `[1, A, H, W]` (face only).
    pub scores: ArrayViewD<'a, f32>,
    /// `[1, 4A, H, W]`, or wider when the model regresses extra targets.
    pub bbox_deltas: ArrayViewD<'a, f32>,
    /// `[1, 10A, H, W]`.
    pub landmark_deltas: Option<ArrayViewD<'a, f32>>,
}

/// Confidence-filtered candidates of one level, in detector-canvas coordinates.
#[derive(Debug, Clone)]
pub struct LevelDetections {
    pub stride: usize,
    /// `[N, P]`; columns 0..4 are `x1, y1, x2, y2`, any further columns are raw passthrough.
    pub boxes: Array2<f32>,
    pub scores: Array1<f32>,
    /// `[N, 5, 2]`
    pub landmarks: Option<Array3<f32>>,
}

impl LevelDetections {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Stateless decoder for a fixed detector canvas.
#[derive(Debug, Clone)]
pub struct LevelDecoder {
    /// Canvas `(width, height)` the boxes are clipped to.
    pub canvas: (usize, usize),
    pub confidence_threshold: f32,
    pub bbox_stds: [f32; 4],
    pub landmark_std: f32,
}

impl LevelDecoder {
    pub fn new(canvas: (usize, usize), confidence_threshold: f32) -> Self {
        Self {
            canvas,
            confidence_threshold,
            bbox_stds: [1.0; 4],
            landmark_std: 1.0,
        }
    }

    pub fn decode(
        &self,
        level: &StrideAnchors,
        outputs: LevelOutputs<'_>,
    ) -> Result<LevelDetections, DecodeError> {
        let stride = level.stride;
        let a = level.num_anchors();

        let bbox = as_nchw(stride, "bbox", outputs.bbox_deltas)?;
        let (height, width) = (bbox.shape()[2], bbox.shape()[3]);
        let pred_len = per_anchor_channels(stride, "bbox", bbox.shape()[1], a, 4)?;

        let scores = as_nchw(stride, "score", outputs.scores)?;
        check_grid(stride, "score", &scores, (height, width))?;
        let score_offset = match scores.shape()[1] {
            c if c == 2 * a => a,
            c if c == a => 0,
            c => {
                return Err(DecodeError::ChannelMismatch {
                    stride,
                    tensor: "score",
                    channels: c,
                    expected: format!("{} or {}", a, 2 * a),
                })
            }
        };

        let grid = anchor_grid(height, width, stride, &level.base);
        let anchors = Array2::from_shape_vec((height * width * a, 4), grid.iter().copied().collect())
            .map_err(|_| DecodeError::BadShape {
                stride,
                tensor: "anchor",
                shape: grid.shape().to_vec(),
            })?;

        let all_scores = channel_last(scores, score_offset, a, 1).index_axis_move(Axis(1), 0);

        let mut deltas = channel_last(bbox, 0, a, pred_len);
        for (j, std) in self.bbox_stds.iter().enumerate() {
            deltas.column_mut(j).mapv_inplace(|d| d * std);
        }
        let proposals = clip_boxes(bbox_pred(anchors.view(), deltas.view()), self.canvas);

        let landmarks = match outputs.landmark_deltas {
            Some(raw) => {
                let raw = as_nchw(stride, "landmark", raw)?;
                check_grid(stride, "landmark", &raw, (height, width))?;
                let per = per_anchor_channels(stride, "landmark", raw.shape()[1], a, 2 * NUM_LANDMARKS)?;
                if per != 2 * NUM_LANDMARKS {
                    return Err(DecodeError::ChannelMismatch {
                        stride,
                        tensor: "landmark",
                        channels: raw.shape()[1],
                        expected: format!("{}", a * 2 * NUM_LANDMARKS),
                    });
                }
                let flat = channel_last(raw, 0, a, per).mapv(|d| d * self.landmark_std);
                let deltas = flat
                    .into_shape_with_order((height * width * a, NUM_LANDMARKS, 2))
                    .map_err(|_| DecodeError::BadShape {
                        stride,
                        tensor: "landmark",
                        shape: vec![height * width * a, per],
                    })?;
                Some(landmark_pred(anchors.view(), deltas.view()))
            }
            None => None,
        };

        let keep: Vec<usize> = all_scores
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s >= self.confidence_threshold)
            .map(|(i, _)| i)
            .collect();

        tracing::debug!(
            stride,
            grid = ?(height, width),
            anchors = all_scores.len(),
            kept = keep.len(),
            "decoded pyramid level"
        );

        Ok(LevelDetections {
            stride,
            boxes: proposals.select(Axis(0), &keep),
            scores: all_scores.select(Axis(0), &keep),
            landmarks: landmarks.map(|l| l.select(Axis(0), &keep)),
        })
    }
}

fn as_nchw<'a>(
    stride: usize,
    tensor: &'static str,
    raw: ArrayViewD<'a, f32>,
) -> Result<ArrayView4<'a, f32>, DecodeError> {
    let shape = raw.shape().to_vec();
    match raw.into_dimensionality::<Ix4>() {
        Ok(view) if view.shape()[0] == 1 => Ok(view),
        _ => Err(DecodeError::BadShape { stride, tensor, shape }),
    }
}

fn check_grid(
    stride: usize,
    tensor: &'static str,
    view: &ArrayView4<'_, f32>,
    expected: (usize, usize),
) -> Result<(), DecodeError> {
    let got = (view.shape()[2], view.shape()[3]);
    if got != expected {
        return Err(DecodeError::GridMismatch {
            stride,
            tensor,
            got,
            expected,
        });
    }
    Ok(())
}

/// Channels per anchor, requiring an exact multiple of `anchors` and at least `min`.
fn per_anchor_channels(
    stride: usize,
    tensor: &'static str,
    channels: usize,
    anchors: usize,
    min: usize,
) -> Result<usize, DecodeError> {
    if anchors == 0 || channels % anchors != 0 || channels / anchors < min {
        return Err(DecodeError::ChannelMismatch {
            stride,
            tensor,
            channels,
            expected: format!("a multiple of {anchors} with at least {min} per anchor"),
        });
    }
    Ok(channels / anchors)
}

/// Owned `[H·W·A, per]` copy of channels `offset .. offset + A·per`, rows ordered
/// `(row, col, anchor)`.
fn channel_last(t: ArrayView4<'_, f32>, offset: usize, a: usize, per: usize) -> Array2<f32> {
    let width = t.shape()[3];
    Array2::from_shape_fn((t.shape()[2] * width * a, per), |(i, j)| {
        let k = i % a;
        let cell = i / a;
        t[[0, offset + k * per + j, cell / width, cell % width]]
    })
}

/// Anchor width, height and centre in the inclusive-pixel convention.
fn anchor_geometry(anchor: ndarray::ArrayView1<'_, f32>) -> (f32, f32, f32, f32) {
    let w = anchor[2] - anchor[0] + 1.0;
    let h = anchor[3] - anchor[1] + 1.0;
    (w, h, anchor[0] + 0.5 * (w - 1.0), anchor[1] + 0.5 * (h - 1.0))
}

/// Apply centre-size box deltas to anchors. Columns past the fourth are copied as-is.
pub fn bbox_pred(anchors: ArrayView2<'_, f32>, deltas: ArrayView2<'_, f32>) -> Array2<f32> {
    let mut out = deltas.to_owned();
    for (mut row, (anchor, d)) in out
        .rows_mut()
        .into_iter()
        .zip(anchors.rows().into_iter().zip(deltas.rows()))
    {
        let (w, h, cx, cy) = anchor_geometry(anchor);
        let pcx = d[0] * w + cx;
        let pcy = d[1] * h + cy;
        let pw = d[2].exp() * w;
        let ph = d[3].exp() * h;
        row[0] = pcx - 0.5 * (pw - 1.0);
        row[1] = pcy - 0.5 * (ph - 1.0);
        row[2] = pcx + 0.5 * (pw - 1.0);
        row[3] = pcy + 0.5 * (ph - 1.0);
    }
    out
}

/// Apply landmark deltas `[N, 5, 2]`, scaled by the owning anchor's size.
pub fn landmark_pred(anchors: ArrayView2<'_, f32>, deltas: ArrayView3<'_, f32>) -> Array3<f32> {
    let mut out = Array3::zeros(deltas.raw_dim());
    for (i, anchor) in anchors.rows().into_iter().enumerate() {
        let (w, h, cx, cy) = anchor_geometry(anchor);
        for p in 0..deltas.shape()[1] {
            out[[i, p, 0]] = deltas[[i, p, 0]] * w + cx;
            out[[i, p, 1]] = deltas[[i, p, 1]] * h + cy;
        }
    }
    out
}

/// Clamp box corners to `[0, width-1] × [0, height-1]`.
///
/// Sub-pixel predictions come out of [`bbox_pred`] inverted (`x1 > x2`); they
/// collapse to zero width or height at `x1`/`y1`.
pub fn clip_boxes(mut boxes: Array2<f32>, (width, height): (usize, usize)) -> Array2<f32> {
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    for mut row in boxes.rows_mut() {
        row[0] = row[0].clamp(0.0, max_x);
        row[1] = row[1].clamp(0.0, max_y);
        row[2] = row[2].clamp(0.0, max_x).max(row[0]);
        row[3] = row[3].clamp(0.0, max_y).max(row[1]);
    }
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::{retinaface_anchor_configs, AnchorSet};
    use ndarray::{array, Array4};

    fn level(stride: usize) -> StrideAnchors {
        AnchorSet::generate(&retinaface_anchor_configs())
            .unwrap()
            .get(stride)
            .unwrap()
            .clone()
    }

    #[test]
    fn test_bbox_pred_zero_delta_returns_anchor() {
        let anchors = array![[0.0, 0.0, 15.0, 15.0], [-8.0, -8.0, 23.0, 23.0]];
        let deltas = Array2::zeros((2, 4));
        let out = bbox_pred(anchors.view(), deltas.view());
        assert_eq!(out, anchors);
    }

    #[test]
    fn test_bbox_pred_shift_and_scale() {
        let anchors = array![[0.0, 0.0, 15.0, 15.0]];
        // shift centre by half a width, double the height
        let deltas = array![[0.5, 0.0, 0.0, 2.0f32.ln()]];
        let out = bbox_pred(anchors.view(), deltas.view());
        assert!((out[[0, 0]] - 8.0).abs() < 1e-4);
        assert!((out[[0, 2]] - 23.0).abs() < 1e-4);
        // h' = 32, cy = 7.5 → [7.5 - 15.5, 7.5 + 15.5]
        assert!((out[[0, 1]] + 8.0).abs() < 1e-4);
        assert!((out[[0, 3]] - 23.0).abs() < 1e-4);
    }

    #[test]
    fn test_bbox_pred_passes_extra_columns_through() {
        let anchors = array![[0.0, 0.0, 15.0, 15.0]];
        let deltas = array![[0.0, 0.0, 0.0, 0.0, 7.0, -3.0]];
        let out = bbox_pred(anchors.view(), deltas.view());
        assert_eq!(out[[0, 4]], 7.0);
        assert_eq!(out[[0, 5]], -3.0);
    }

    #[test]
    fn test_landmark_pred_uses_anchor_geometry() {
        let anchors = array![[0.0, 0.0, 15.0, 15.0]];
        let mut deltas = Array3::zeros((1, 5, 2));
        deltas[[0, 2, 0]] = 1.0;
        deltas[[0, 2, 1]] = -0.5;
        let out = landmark_pred(anchors.view(), deltas.view());
        assert_eq!(out[[0, 0, 0]], 7.5);
        assert_eq!(out[[0, 2, 0]], 7.5 + 16.0);
        assert_eq!(out[[0, 2, 1]], 7.5 - 8.0);
    }

    #[test]
    fn test_clip_boxes_bounds() {
        let boxes = array![[-5.0, -2.0, 700.0, 30.0], [10.0, 20.0, 30.0, 900.0]];
        let out = clip_boxes(boxes, (640, 480));
        for row in out.rows() {
            assert!(0.0 <= row[0] && row[0] <= row[2] && row[2] <= 639.0);
            assert!(0.0 <= row[1] && row[1] <= row[3] && row[3] <= 479.0);
        }
        assert_eq!(out[[0, 2]], 639.0);
        assert_eq!(out[[1, 3]], 479.0);
    }

    #[test]
    fn test_clip_boxes_collapses_inverted_box() {
        let out = clip_boxes(array![[15.9, 16.2, 15.1, 15.0]], (640, 480));
        assert_eq!(out.row(0).to_vec(), vec![15.9, 16.2, 15.9, 16.2]);
    }

    #[test]
    fn test_decode_level_sub_pixel_box_is_not_inverted() {
        let lvl = level(8);
        let (scores, mut bbox, _) = synthetic(4, 4, 2, (2, 2, 0));
        bbox[[0, 2, 2, 2]] = -5.0;
        bbox[[0, 3, 2, 2]] = -5.0;
        let out = LevelDecoder::new((640, 640), 0.5)
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: None,
                },
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        let b = out.boxes.row(0);
        assert!(0.0 <= b[0] && b[0] <= b[2] && b[2] <= 639.0, "box {b:?}");
        assert!(0.0 <= b[1] && b[1] <= b[3] && b[3] <= 639.0, "box {b:?}");
        assert_eq!(b[2] - b[0], 0.0);
    }

    /// Build level tensors for a `h × w` grid with one confident anchor.
    fn synthetic(h: usize, w: usize, a: usize, hot: (usize, usize, usize)) -> (Array4<f32>, Array4<f32>, Array4<f32>) {
        let mut scores = Array4::zeros((1, 2 * a, h, w));
        scores[[0, a + hot.2, hot.0, hot.1]] = 0.95;
        let bbox = Array4::zeros((1, 4 * a, h, w));
        let lms = Array4::zeros((1, 10 * a, h, w));
        (scores, bbox, lms)
    }

    #[test]
    fn test_decode_level_keeps_confident_anchor() {
        let lvl = level(8);
        let (scores, bbox, lms) = synthetic(4, 5, 2, (2, 3, 1));
        let decoder = LevelDecoder::new((640, 640), 0.5);
        let out = decoder
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: Some(lms.view().into_dyn()),
                },
            )
            .unwrap();

        assert_eq!(out.len(), 1);
        assert!((out.scores[0] - 0.95).abs() < 1e-6);
        // anchor 1 of stride 8 is [0,0,15,15]; cell (row 2, col 3) → +(24, 16)
        assert_eq!(out.boxes.row(0).to_vec(), vec![24.0, 16.0, 39.0, 31.0]);
        let lms = out.landmarks.unwrap();
        assert_eq!(lms.shape(), &[1, 5, 2]);
        assert_eq!(lms[[0, 0, 0]], 24.0 + 7.5);
        assert_eq!(lms[[0, 0, 1]], 16.0 + 7.5);
    }

    #[test]
    fn test_decode_level_threshold_is_inclusive() {
        let lvl = level(8);
        let (mut scores, bbox, _) = synthetic(2, 2, 2, (0, 0, 0));
        scores[[0, 2, 0, 0]] = 0.5;
        let out = LevelDecoder::new((640, 640), 0.5)
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: None,
                },
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.landmarks.is_none());
    }

    #[test]
    fn test_decode_level_accepts_presliced_scores() {
        let lvl = level(16);
        let mut scores = Array4::zeros((1, 2, 3, 3));
        scores[[0, 0, 1, 1]] = 0.9;
        let bbox = Array4::zeros((1, 8, 3, 3));
        let out = LevelDecoder::new((640, 640), 0.5)
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: None,
                },
            )
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_decode_level_rejects_bbox_channel_mismatch() {
        let lvl = level(32);
        let scores = Array4::zeros((1, 4, 2, 2));
        let bbox = Array4::zeros((1, 6, 2, 2));
        let err = LevelDecoder::new((640, 640), 0.5)
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DecodeError::ChannelMismatch { tensor: "bbox", .. }));
    }

    #[test]
    fn test_decode_level_rejects_score_channel_mismatch() {
        let lvl = level(32);
        let scores = Array4::zeros((1, 3, 2, 2));
        let bbox = Array4::zeros((1, 8, 2, 2));
        let err = LevelDecoder::new((640, 640), 0.5)
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DecodeError::ChannelMismatch { tensor: "score", .. }));
    }

    #[test]
    fn test_decode_level_rejects_grid_and_landmark_mismatch() {
        let lvl = level(8);
        let scores = Array4::zeros((1, 4, 3, 2));
        let bbox = Array4::zeros((1, 8, 2, 2));
        let err = LevelDecoder::new((640, 640), 0.5)
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DecodeError::GridMismatch { .. }));

        let scores = Array4::zeros((1, 4, 2, 2));
        let lms = Array4::zeros((1, 12, 2, 2));
        let err = LevelDecoder::new((640, 640), 0.5)
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: Some(lms.view().into_dyn()),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DecodeError::ChannelMismatch { tensor: "landmark", .. }));
    }

    #[test]
    fn test_decode_level_rejects_wrong_rank() {
        let lvl = level(8);
        let scores = ndarray::Array3::<f32>::zeros((4, 2, 2));
        let bbox = Array4::zeros((1, 8, 2, 2));
        let err = LevelDecoder::new((640, 640), 0.5)
            .decode(
                &lvl,
                LevelOutputs {
                    scores: scores.view().into_dyn(),
                    bbox_deltas: bbox.view().into_dyn(),
                    landmark_deltas: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DecodeError::BadShape { tensor: "score", .. }));
    }
}
