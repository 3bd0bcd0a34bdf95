//! Primary-face selection.
//!
//! Enrollment wants the biggest face and refuses small ones. Verification
//! prefers a reasonably sized face near the horizontal centre and away from
//! the edges, relaxing those constraints step by step rather than failing.

use crate::config::SelectionParams;
use crate::types::{Detections, FaceBox, Landmarks, SelectedFace};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    Enrollment,
    Verification,
}

impl SelectionPolicy {
    pub fn for_enroll(enroll: bool) -> Self {
        if enroll {
            Self::Enrollment
        } else {
            Self::Verification
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FaceSelector {
    params: SelectionParams,
}

impl FaceSelector {
    pub fn new(params: SelectionParams) -> Self {
        Self { params }
    }

    /// Pick the primary face of an image of `(width, height)` pixels.
    ///
    /// `None` means no face satisfies the policy; it is not an error.
    pub fn select(
        &self,
        image_size: (u32, u32),
        detections: &Detections,
        policy: SelectionPolicy,
    ) -> Option<SelectedFace> {
        if detections.is_empty() || image_size.0 == 0 || image_size.1 == 0 {
            return None;
        }
        let selected = match policy {
            SelectionPolicy::Enrollment => self.select_enrollment(image_size, detections),
            SelectionPolicy::Verification => self.select_verification(image_size, detections),
        };
        tracing::debug!(?policy, faces = detections.len(), selected = ?selected.as_ref().map(|s| s.bbox), "face selection");
        selected
    }

    fn select_enrollment(&self, (width, _): (u32, u32), detections: &Detections) -> Option<SelectedFace> {
        let mut best: Option<(usize, f32)> = None;
        for (i, (bbox, _, _)) in detections.iter().enumerate() {
            let area = bbox.area();
            if area > best.map_or(0.0, |(_, a)| a) {
                best = Some((i, area));
            }
        }

        let (idx, _) = best?;
        let bbox = detections.face_box(idx);
        if bbox.width() / width as f32 > self.params.min_box_width_ratio {
            Some(SelectedFace {
                bbox,
                landmarks: detections.face_landmarks(idx),
            })
        } else {
            tracing::debug!(width = bbox.width(), image_width = width, "enrollment face too small");
            None
        }
    }

    fn select_verification(&self, (width, height): (u32, u32), detections: &Detections) -> Option<SelectedFace> {
        let (w, h) = (width as f32, height as f32);
        let margin_center_left = self.params.margin_center_left_ratio * w;
        let margin_center_right = self.params.margin_center_right_ratio * w;
        let margin_edge = self.params.max_margin_edge.min(self.params.margin_edge_ratio * w);
        let x_center = w / 2.0;

        let all: Vec<FaceBox> = detections.iter().map(|(b, _, _)| b).collect();

        let valid: Vec<FaceBox> = all
            .iter()
            .copied()
            .filter(|b| {
                let (cx, cy) = b.center();
                cx >= margin_edge
                    && cx <= w - margin_edge
                    && cy >= margin_edge
                    && cy <= h - margin_edge
                    && b.area() / (w * h) >= self.params.min_box_area_ratio
            })
            .collect();

        let central: Vec<FaceBox> = valid
            .iter()
            .copied()
            .filter(|b| {
                let offset = b.center().0 - x_center;
                -margin_center_left <= offset && offset <= margin_center_right
            })
            .collect();

        let pool = if !central.is_empty() {
            central
        } else if !valid.is_empty() {
            valid
        } else {
            all
        };

        let bbox = largest_extent(&pool)?;
        Some(SelectedFace {
            bbox,
            landmarks: match_landmarks(&bbox, detections, self.params.landmark_match_tolerance),
        })
    }
}

/// Box with the largest `width + height`; the first one wins ties.
fn largest_extent(boxes: &[FaceBox]) -> Option<FaceBox> {
    boxes.iter().copied().fold(None, |best: Option<FaceBox>, b| match best {
        Some(cur) if b.width() + b.height() <= cur.width() + cur.height() => Some(cur),
        _ => Some(b),
    })
}

/// Landmarks of the first detection whose box lies within `tolerance` pixels of
/// `bbox` on every coordinate.
pub fn match_landmarks(bbox: &FaceBox, detections: &Detections, tolerance: f32) -> Option<Landmarks> {
    detections
        .iter()
        .find(|(candidate, _, _)| bbox.approx_eq(candidate, tolerance))
        .and_then(|(_, _, lms)| lms)
}
