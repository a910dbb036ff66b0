//! Hue histogram: pixel counts per 10° hue bucket.

use crate::colorspace::{hue_degrees, validate};
use crate::types::{BufferError, HueHistogram, RgbImage};

/// Count every pixel of `image` into one of 36 hue buckets.
///
/// Achromatic pixels (grays, black, white) have hue 0 and land in the
/// first bucket, so the bucket total always equals the pixel count.
///
/// # Errors
///
/// Returns a [`BufferError`] if `image` is malformed.
pub fn hue_histogram(image: &RgbImage) -> Result<HueHistogram, BufferError> {
    validate(image)?;
    let mut histogram = HueHistogram::empty();
    for pixel in image.pixels() {
        histogram.add(hue_degrees(pixel.0));
    }
    Ok(histogram)
}
