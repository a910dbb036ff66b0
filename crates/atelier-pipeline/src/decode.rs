//! Image decoding.
//!
//! Accepts raw image bytes (PNG, JPEG, BMP, WebP) and produces the RGB
//! buffer every pipeline stage reads from. Alpha is discarded.

use crate::colorspace::validate;
use crate::types::{PipelineError, RgbImage};

/// Decode raw image bytes into an 8-bit RGB buffer.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty,
/// [`PipelineError::ImageDecode`] if the format is unrecognized or the
/// data is corrupt, and [`PipelineError::InvalidBuffer`] if the decoded
/// image has zero area.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    validate(&rgb)?;
    Ok(rgb)
}
