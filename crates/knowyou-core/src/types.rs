use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Scale the box (and its landmarks) independently along each axis.
    pub fn scaled(&self, sx: f32, sy: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * sx, ly * sy))),
        }
    }
}

/// Face descriptor: the embedding vector the recognition model emits
/// (512-dimensional and L2-normalized for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity between two descriptors, in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A named person from the reference dataset with one descriptor per photo
/// in which a face was found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub name: String,
    pub descriptors: Vec<Descriptor>,
}

/// A face found in a frame, ready for matching.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// Outcome of matching one descriptor against the reference set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    /// Best reference name, or `None` when no reference is close enough.
    pub name: Option<String>,
    /// Distance to the best reference (mean over its descriptors).
    pub distance: f32,
}

impl FaceMatch {
    pub const UNKNOWN_LABEL: &'static str = "unknown";

    pub fn unknown(distance: f32) -> Self {
        Self { name: None, distance }
    }

    pub fn is_unknown(&self) -> bool {
        self.name.is_none()
    }

    /// The reference name, or `"unknown"`.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(Self::UNKNOWN_LABEL)
    }
}
