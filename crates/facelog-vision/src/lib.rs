//! facelog-vision: image bytes to face embedding.
//!
//! Decodes JPEG/PNG, detects faces with SCRFD, keeps the largest one, aligns
//! it and embeds it with ArcFace. Both models run on ONNX Runtime (CPU).

pub mod alignment;
pub mod detector;
pub mod frame;
pub mod recognizer;
pub mod types;

pub use detector::{DetectorError, FaceDetector};
pub use frame::{DecodeError, Frame};
pub use recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};
pub use types::{largest_face, BoundingBox};

use facelog_core::Embedding;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

/// `$XDG_DATA_HOME/facelog/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelog")
        .join("models")
}

/// Detector and recognizer loaded together. Not `Sync`: inference takes `&mut self`.
pub struct FacePipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FacePipeline {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, PipelineError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE).to_string_lossy())?;
        let recognizer =
            FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE).to_string_lossy())?;
        Ok(Self {
            detector,
            recognizer,
        })
    }

    /// Embed the largest face in an encoded image. `Ok(None)` when no face is found.
    pub fn embed_image(&mut self, bytes: &[u8]) -> Result<Option<Embedding>, PipelineError> {
        let frame = Frame::decode(bytes)?;
        let faces = self.detector.detect(&frame)?;
        let Some(face) = largest_face(&faces) else {
            return Ok(None);
        };
        tracing::debug!(
            faces = faces.len(),
            width = face.width,
            height = face.height,
            confidence = face.confidence,
            "embedding largest face"
        );
        Ok(Some(self.recognizer.extract(&frame, face)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_models_fail_load() {
        let err = FacePipeline::load(Path::new("/nonexistent/models")).err().unwrap();
        assert!(matches!(err, PipelineError::Detector(DetectorError::ModelNotFound(_))));
    }
}
