//! Downloaded camera frames.

use chrono::{DateTime, Utc};
use ndarray::Array2;
use thiserror::Error;

/// Frame construction errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame buffer holds {got} pixels, expected {expected} ({width}x{height})")]
    SizeMismatch {
        width: u16,
        height: u16,
        expected: usize,
        got: usize,
    },
    #[error("frame dimensions must be non-zero")]
    EmptyFrame,
}

/// A single image read out from the camera.
///
/// Pixels are stored row-major with `height` rows and `width` columns. A
/// frame owns its memory: it is copied out of the driver buffer on readout
/// and moved through the frame queue to the coordinator, which drops it once
/// delivery completes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Array2<u16>,
    /// Sensor temperature in degrees Celsius at readout
    pub temperature: f64,
    /// Local time at which the frame reached the host
    pub received_at: DateTime<Utc>,
}

impl Frame {
    /// Copy a raw driver buffer into a new frame.
    ///
    /// # Arguments
    /// * `width` - Columns in the readout region
    /// * `height` - Rows in the readout region
    /// * `data` - Row-major pixel values, exactly `width * height` long
    pub fn from_raw(width: u16, height: u16, data: &[u16]) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyFrame);
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                width,
                height,
                expected,
                got: data.len(),
            });
        }

        let pixels = Array2::from_shape_vec((height as usize, width as usize), data.to_vec())
            .map_err(|_| FrameError::SizeMismatch {
                width,
                height,
                expected,
                got: data.len(),
            })?;

        Ok(Self {
            pixels,
            temperature: 0.0,
            received_at: Utc::now(),
        })
    }

    /// Wrap an existing pixel array.
    pub fn from_array(pixels: Array2<u16>) -> Result<Self, FrameError> {
        let (rows, cols) = pixels.dim();
        if rows == 0 || cols == 0 {
            return Err(FrameError::EmptyFrame);
        }
        if rows > u16::MAX as usize || cols > u16::MAX as usize {
            return Err(FrameError::SizeMismatch {
                width: cols.min(u16::MAX as usize) as u16,
                height: rows.min(u16::MAX as usize) as u16,
                expected: u16::MAX as usize * u16::MAX as usize,
                got: rows * cols,
            });
        }
        Ok(Self {
            pixels,
            temperature: 0.0,
            received_at: Utc::now(),
        })
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn width(&self) -> u16 {
        self.pixels.ncols() as u16
    }

    pub fn height(&self) -> u16 {
        self.pixels.nrows() as u16
    }

    pub fn pixels(&self) -> &Array2<u16> {
        &self.pixels
    }

    pub fn into_pixels(self) -> Array2<u16> {
        self.pixels
    }
}
