//! Greedy non-maximum suppression with the inclusive (+1 pixel) box convention.

use ndarray::{ArrayView1, ArrayView2};

/// Suppress overlapping boxes, returning kept row indices in descending score order.
///
/// `boxes` is `[N, 4+]` (only the first four columns are read), `scores` is `[N]`.
/// Equal scores keep their original relative order, so the lower index wins a tie.
pub fn nms(boxes: ArrayView2<f32>, scores: ArrayView1<f32>, iou_threshold: f32) -> Vec<usize> {
    let n = boxes.nrows();
    debug_assert_eq!(n, scores.len());

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let rows: Vec<[f32; 4]> = boxes
        .rows()
        .into_iter()
        .map(|r| [r[0], r[1], r[2], r[3]])
        .collect();

    let mut keep = Vec::new();
    let mut suppressed = vec![false; n];

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for &j in &order[pos + 1..] {
            if !suppressed[j] && iou(&rows[i], &rows[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Suppress over a pooled `[N, 5]` detection matrix (`x1, y1, x2, y2, score`).
pub fn nms_dets(dets: ArrayView2<f32>, iou_threshold: f32) -> Vec<usize> {
    nms(dets, dets.column(4), iou_threshold)
}

/// Intersection-over-union where a box spans `x2 - x1 + 1` pixels.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let xx1 = a[0].max(b[0]);
    let yy1 = a[1].max(b[1]);
    let xx2 = a[2].min(b[2]);
    let yy2 = a[3].min(b[3]);

    let w = (xx2 - xx1 + 1.0).max(0.0);
    let h = (yy2 - yy1 + 1.0).max(0.0);
    let inter = w * h;

    let area_a = (a[2] - a[0] + 1.0) * (a[3] - a[1] + 1.0);
    let area_b = (b[2] - b[0] + 1.0) * (b[3] - b[1] + 1.0);
    let union = area_a + area_b - inter;

    if union > 0.0 { inter / union } else { 0.0 }
}
