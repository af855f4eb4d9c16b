//! Camera event wire format.
//!
//! One JSON object per detection opportunity:
//!
//! ```text
//! { "camera_id": "<string>", "image": "<base64(zlib(JPEG bytes))>" }
//! ```
//!
//! Both fields are required and must be non-empty. Unknown fields are ignored.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Upper bound on an inflated image; larger payloads are treated as malformed.
pub const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Error, Debug)]
pub enum EventError {
    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("image is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image is not valid zlib data: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("inflated image exceeds {} bytes", MAX_IMAGE_BYTES)]
    TooLarge,
    #[error("payload is not a JPEG or PNG image")]
    NotAnImage,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    camera_id: String,
    image: String,
}

/// A decoded camera event: which camera, and the raw image bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEvent {
    pub camera_id: String,
    pub image: Vec<u8>,
}

impl FaceEvent {
    /// Parse and unpack a queue message body.
    pub fn decode(body: &[u8]) -> Result<Self, EventError> {
        let wire: WireEvent = serde_json::from_slice(body)?;
        if wire.camera_id.trim().is_empty() {
            return Err(EventError::EmptyField("camera_id"));
        }
        if wire.image.is_empty() {
            return Err(EventError::EmptyField("image"));
        }

        let compressed = STANDARD.decode(wire.image.as_bytes())?;

        let mut image = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .take(MAX_IMAGE_BYTES + 1)
            .read_to_end(&mut image)?;
        if image.len() as u64 > MAX_IMAGE_BYTES {
            return Err(EventError::TooLarge);
        }
        if !image.starts_with(&JPEG_MAGIC) && !image.starts_with(&PNG_MAGIC) {
            return Err(EventError::NotAnImage);
        }

        Ok(Self {
            camera_id: wire.camera_id,
            image,
        })
    }

    /// Build a queue message body (producer side).
    pub fn encode(camera_id: &str, image: &[u8]) -> Result<Vec<u8>, EventError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(image)?;
        let compressed = encoder.finish()?;

        let wire = WireEvent {
            camera_id: camera_id.to_string(),
            image: STANDARD.encode(compressed),
        };
        Ok(serde_json::to_vec(&wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg() -> Vec<u8> {
        let mut bytes = JPEG_MAGIC.to_vec();
        bytes.extend_from_slice(&[0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F']);
        bytes
    }

    #[test]
    fn test_decode_producer_payload() {
        let body = FaceEvent::encode("cam1", &fake_jpeg()).unwrap();
        let event = FaceEvent::decode(&body).unwrap();
        assert_eq!(event.camera_id, "cam1");
        assert_eq!(event.image, fake_jpeg());
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = FaceEvent::decode(br#"{"camera_id":"cam1"}"#).unwrap_err();
        assert!(matches!(err, EventError::Json(_)));
    }

    #[test]
    fn test_empty_camera_rejected() {
        let err = FaceEvent::decode(br#"{"camera_id":" ","image":"eJw="}"#).unwrap_err();
        assert!(matches!(err, EventError::EmptyField("camera_id")));
    }

    #[test]
    fn test_bad_base64_rejected() {
        let err = FaceEvent::decode(br#"{"camera_id":"cam1","image":"!!!"}"#).unwrap_err();
        assert!(matches!(err, EventError::Base64(_)));
    }

    #[test]
    fn test_uncompressed_payload_rejected() {
        let body = serde_json::json!({
            "camera_id": "cam1",
            "image": STANDARD.encode(fake_jpeg()),
        });
        let err = FaceEvent::decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, EventError::Inflate(_)));
    }

    #[test]
    fn test_non_image_rejected() {
        let body = FaceEvent::encode("cam1", b"hello world").unwrap();
        let err = FaceEvent::decode(&body).unwrap_err();
        assert!(matches!(err, EventError::NotAnImage));
    }

    #[test]
    fn test_extra_fields_ignored() {
        let body = FaceEvent::encode("cam7", &fake_jpeg()).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        value["captured_at"] = serde_json::json!("2024-01-01T00:00:00Z");
        let event = FaceEvent::decode(value.to_string().as_bytes()).unwrap();
        assert_eq!(event.camera_id, "cam7");
    }

    #[test]
    fn test_not_json_rejected() {
        assert!(matches!(
            FaceEvent::decode(b"\xff\xd8raw jpeg"),
            Err(EventError::Json(_))
        ));
    }
}
