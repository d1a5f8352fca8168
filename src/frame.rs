use crate::error::{EngineError, Result};
use image::RgbaImage;

/// One RGBA camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbaImage,
}

impl Frame {
    /// Wraps a raw RGBA buffer. The buffer must hold exactly `width * height * 4` bytes.
    pub fn from_rgba(width: u32, height: u32, bytes: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidFrame(format!(
                "empty frame {width}x{height}"
            )));
        }
        if bytes.len() != expected {
            return Err(EngineError::InvalidFrame(format!(
                "expected {expected} bytes for {width}x{height} RGBA, got {}",
                bytes.len()
            )));
        }
        let image = RgbaImage::from_raw(width, height, bytes).ok_or_else(|| {
            EngineError::InvalidFrame(format!("buffer does not fit {width}x{height}"))
        })?;
        Ok(Self { image })
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn area(&self) -> f64 {
        self.width() as f64 * self.height() as f64
    }

    pub fn diagonal(&self) -> f64 {
        (self.width() as f64).hypot(self.height() as f64)
    }
}
