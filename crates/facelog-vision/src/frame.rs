//! Decoded camera image, packed RGB8.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has zero width or height")]
    Empty,
    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB triples.
    pub pixels: Vec<u8>,
}

impl Frame {
    /// Decode JPEG or PNG bytes into RGB8.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_rgb(width, height, rgb.into_raw())
    }

    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::Empty);
        }
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(DecodeError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Channel `c` at (x, y). Caller guarantees bounds.
    #[inline]
    pub(crate) fn channel(&self, x: usize, y: usize, c: usize) -> u8 {
        self.pixels[(y * self.width as usize + x) * 3 + c]
    }
}
