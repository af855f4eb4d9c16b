use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Dimension of an ArcFace (w600k_r50) embedding.
pub const EMBEDDING_DIM: usize = 512;

/// Number of hash bytes kept in a [`Fingerprint`] (16 hex chars).
const FINGERPRINT_BYTES: usize = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidVector {
    #[error("expected {expected}-dim embedding, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("embedding has zero norm")]
    ZeroNorm,
}

/// L2-normalized face embedding.
///
/// Only constructible through [`Embedding::normalized`] (or the byte decoder),
/// so every value of this type has unit norm and the expected dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Validate and L2-normalize a raw embedding.
    pub fn normalized(values: Vec<f32>) -> Result<Self, InvalidVector> {
        if values.len() != EMBEDDING_DIM {
            return Err(InvalidVector::Dimension {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(InvalidVector::NonFinite);
        }

        let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Err(InvalidVector::ZeroNorm);
        }

        Ok(Self {
            values: values.into_iter().map(|x| x / norm).collect(),
            model_version: None,
        })
    }

    /// Decode a little-endian FLOAT32 blob (the on-disk and index format).
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, InvalidVector> {
        if bytes.len() % 4 != 0 {
            return Err(InvalidVector::Dimension {
                expected: EMBEDDING_DIM,
                actual: bytes.len() / 4,
            });
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::normalized(values)
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Little-endian FLOAT32 bytes, as stored in the vector index.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
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
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance in [0, 2], the metric the vector index reports.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Short deterministic hash of the normalized vector, used as a dedup key.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.to_le_bytes());
        let hex = digest[..FINGERPRINT_BYTES]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        Fingerprint(hex)
    }
}

/// Dedup key derived from an embedding. Not an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Best-scoring gallery identity for a query embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMatch {
    pub identity_id: String,
    /// Cosine similarity, `1 - index distance`.
    pub similarity: f32,
}

/// Who a transaction is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Employee(String),
    Unknown,
}

impl Subject {
    pub fn identity_id(&self) -> Option<&str> {
        match self {
            Self::Employee(id) => Some(id),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Employee(id) => f.write_str(id),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// An identity seen at a camera at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub subject: Subject,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    pub fn matched(identity_id: &str, camera_id: &str) -> Self {
        Self {
            subject: Subject::Employee(identity_id.to_string()),
            camera_id: camera_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn unknown(camera_id: &str) -> Self {
        Self {
            subject: Subject::Unknown,
            camera_id: camera_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_vectors {
    use super::*;

    /// Unit vector along `axis`.
    pub fn axis(axis: usize) -> Embedding {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[axis] = 1.0;
        Embedding::normalized(v).unwrap()
    }

    /// Unit vector whose cosine similarity with `axis(a)` is exactly `sim`
    /// (up to float rounding), lying in the plane of axes `a` and `b`.
    pub fn at_similarity(a: usize, b: usize, sim: f32) -> Embedding {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[a] = sim;
        v[b] = (1.0 - sim * sim).max(0.0).sqrt();
        Embedding::normalized(v).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_vectors::*;
    use super::*;

    #[test]
    fn test_normalized_has_unit_norm() {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        raw[0] = 3.0;
        raw[1] = 4.0;
        let e = Embedding::normalized(raw).unwrap();
        let norm: f32 = e.values().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_rejected() {
        let err = Embedding::normalized(vec![0.0; EMBEDDING_DIM]).unwrap_err();
        assert_eq!(err, InvalidVector::ZeroNorm);
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let err = Embedding::normalized(vec![1.0; 128]).unwrap_err();
        assert_eq!(err, InvalidVector::Dimension { expected: 512, actual: 128 });
    }

    #[test]
    fn test_nan_rejected() {
        let mut raw = vec![1.0f32; EMBEDDING_DIM];
        raw[7] = f32::NAN;
        assert_eq!(Embedding::normalized(raw).unwrap_err(), InvalidVector::NonFinite);
    }

    #[test]
    fn test_similarity_identical_and_orthogonal() {
        assert!((axis(0).similarity(&axis(0)) - 1.0).abs() < 1e-6);
        assert!(axis(0).similarity(&axis(1)).abs() < 1e-6);
        assert!((axis(0).cosine_distance(&axis(1)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_at_similarity_helper() {
        let e = at_similarity(0, 1, 0.47);
        assert!((axis(0).similarity(&e) - 0.47).abs() < 1e-5);
    }

    #[test]
    fn test_fingerprint_is_16_hex_and_deterministic() {
        let fp = axis(3).fingerprint();
        assert_eq!(fp.as_str().len(), 16);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, axis(3).fingerprint());
        assert_ne!(fp, axis(4).fingerprint());
    }

    #[test]
    fn test_fingerprint_independent_of_input_scale() {
        let mut raw = vec![0.0f32; EMBEDDING_DIM];
        raw[9] = 5.0;
        let scaled = Embedding::normalized(raw).unwrap();
        assert_eq!(scaled.fingerprint(), axis(9).fingerprint());
    }

    #[test]
    fn test_le_bytes_decode() {
        let e = at_similarity(2, 5, 0.3);
        let decoded = Embedding::from_le_bytes(&e.to_le_bytes()).unwrap();
        assert!((decoded.similarity(&e) - 1.0).abs() < 1e-6);
        assert!(Embedding::from_le_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_le_bytes_decode_renormalizes() {
        // a stored blob that was never normalized still comes back unit-length
        let raw: Vec<u8> = (0..EMBEDDING_DIM)
            .flat_map(|i| {
                let v: f32 = if i == 3 { 7.0 } else { 0.0 };
                v.to_le_bytes()
            })
            .collect();
        let decoded = Embedding::from_le_bytes(&raw).unwrap();
        assert_eq!(decoded.values()[3], 1.0);
        assert_eq!(decoded.fingerprint(), axis(3).fingerprint());
    }

    #[test]
    fn test_subject_display() {
        assert_eq!(Subject::Unknown.to_string(), "unknown");
        assert_eq!(Subject::Employee("42".into()).to_string(), "42");
        assert_eq!(Transaction::unknown("cam1").subject.identity_id(), None);
    }
}
