use serde::{Deserialize, Serialize};

/// Region of the photo a detected face occupies, in source pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// Serialized as a bare array of floats, both in the identity store and on
/// the recognizer wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector has
    /// similarity 0 with everything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Cosine distance, `1 - similarity`, in [0, 2]. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// One face found in a photo by the recognition backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub embedding: Embedding,
    #[serde(default)]
    pub region: BoundingBox,
    #[serde(default)]
    pub confidence: f32,
}

/// Pick the observation with the highest detection confidence.
///
/// Ties keep the earliest observation.
pub fn most_confident(faces: &[FaceObservation]) -> Option<&FaceObservation> {
    faces.iter().fold(None, |best, face| match best {
        Some(b) if b.confidence >= face.confidence => Some(b),
        _ => Some(face),
    })
}
