use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
///
/// The order is fixed; alignment pairs each point with its reference position by index.
pub type Landmarks = [(f32, f32); 5];

/// Axis-aligned face box `[x1, y1, x2, y2]` in pixel coordinates.
///
/// The box carries no frame of its own: callers track whether it lives in the
/// detector input canvas or in the original image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl FaceBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Plain `(x2-x1)·(y2-y1)` area, as used by the selection policies.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// True when every coordinate of `other` lies within `tolerance` pixels of ours.
    pub fn approx_eq(&self, other: &FaceBox, tolerance: f32) -> bool {
        (self.x1 - other.x1).abs() <= tolerance
            && (self.y1 - other.y1).abs() <= tolerance
            && (self.x2 - other.x2).abs() <= tolerance
            && (self.y2 - other.y2).abs() <= tolerance
    }
}

/// Detector output after suppression, in original-image coordinates.
///
/// Shapes are `boxes [M,4]`, `scores [M]`, `landmarks [M,5,2]`. `M == 0` is the
/// uniform "no faces" value; it is never represented by absence.
#[derive(Debug, Clone)]
pub struct Detections {
    pub boxes: Array2<f32>,
    pub scores: Array1<f32>,
    /// `None` when the detector did not regress landmarks for every face.
    pub landmarks: Option<Array3<f32>>,
}

impl Detections {
    pub fn empty() -> Self {
        Self {
            boxes: Array2::zeros((0, 4)),
            scores: Array1::zeros(0),
            landmarks: Some(Array3::zeros((0, 5, 2))),
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn face_box(&self, i: usize) -> FaceBox {
        let row = self.boxes.row(i);
        FaceBox::new(row[0], row[1], row[2], row[3])
    }

    pub fn face_landmarks(&self, i: usize) -> Option<Landmarks> {
        let lms = self.landmarks.as_ref()?;
        Some(std::array::from_fn(|p| (lms[[i, p, 0]], lms[[i, p, 1]])))
    }

    /// Build a detection set from per-face rows. Mostly useful for tests and callers
    /// that run their own detector.
    pub fn from_faces(faces: &[(FaceBox, f32, Landmarks)]) -> Self {
        let n = faces.len();
        let mut boxes = Array2::zeros((n, 4));
        let mut scores = Array1::zeros(n);
        let mut landmarks = Array3::zeros((n, 5, 2));
        for (i, (b, s, lms)) in faces.iter().enumerate() {
            boxes[[i, 0]] = b.x1;
            boxes[[i, 1]] = b.y1;
            boxes[[i, 2]] = b.x2;
            boxes[[i, 3]] = b.y2;
            scores[i] = *s;
            for (p, &(x, y)) in lms.iter().enumerate() {
                landmarks[[i, p, 0]] = x;
                landmarks[[i, p, 1]] = y;
            }
        }
        Self {
            boxes,
            scores,
            landmarks: Some(landmarks),
        }
    }

    /// Iterate faces as `(box, score, landmarks)` in detector order (score descending).
    pub fn iter(&self) -> impl Iterator<Item = (FaceBox, f32, Option<Landmarks>)> + '_ {
        (0..self.len()).map(move |i| (self.face_box(i), self.scores[i], self.face_landmarks(i)))
    }
}

/// The single face chosen by a selection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedFace {
    pub bbox: FaceBox,
    /// `None` when the selected box could not be paired back to a detector candidate.
    pub landmarks: Option<Landmarks>,
}

/// L2-normalised face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]; 0 when either vector is all zeros.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, norm_a, norm_b) = self.values.iter().zip(other.values.iter()).fold(
            (0.0f32, 0.0f32, 0.0f32),
            |(dot, na, nb), (a, b)| (dot + a * b, na + a * a, nb + b * b),
        );
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}
