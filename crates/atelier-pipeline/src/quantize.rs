//! Bucketed gray-level requantization.
//!
//! Collapses a grayscale image onto a handful of representative levels
//! so value structure (shadow / mid / light) can be read at a glance.

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::colorspace::validate;
use crate::types::{BufferError, GrayImage};

/// Number of output gray levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Levels {
    /// `[0,85) -> 0`, `[85,170) -> 127`, `[170,255] -> 255`.
    Three,
    /// `[0,64) -> 0`, `[64,128) -> 85`, `[128,192) -> 170`, `[192,255] -> 255`.
    Four,
}

impl Levels {
    /// The representative values this level count can produce.
    #[must_use]
    pub const fn values(self) -> &'static [u8] {
        match self {
            Self::Three => &[0, 127, 255],
            Self::Four => &[0, 85, 170, 255],
        }
    }

    /// Map one sample onto its bucket's representative value.
    #[must_use]
    pub const fn map(self, v: u8) -> u8 {
        match self {
            Self::Three => match v {
                0..85 => 0,
                85..170 => 127,
                _ => 255,
            },
            Self::Four => match v {
                0..64 => 0,
                64..128 => 85,
                128..192 => 170,
                _ => 255,
            },
        }
    }
}

/// Requantize `gray` onto the given number of levels.
///
/// # Errors
///
/// Returns a [`BufferError`] if `gray` is malformed.
pub fn requantize(gray: &GrayImage, levels: Levels) -> Result<GrayImage, BufferError> {
    validate(gray)?;
    Ok(GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([levels.map(gray.get_pixel(x, y).0[0])])
    }))
}
