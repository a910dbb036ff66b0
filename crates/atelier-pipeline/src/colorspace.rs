//! Color-space conversions and single-channel extraction.
//!
//! Every function here is a pure transform from one pixel buffer to a
//! new one. Inputs are validated first: an empty buffer or one whose raw
//! sample data disagrees with its dimensions yields a [`BufferError`].
//!
//! Channel conventions follow the common 8-bit encodings:
//!
//! - grayscale uses the BT.601 luma weights `0.299 R + 0.587 G + 0.114 B`
//! - LAB lightness is `L* * 255 / 100` (sRGB input, D65 white point)
//! - HLS saturation (not HSV) is scaled to `0..=255`
//! - hue is measured in degrees, `[0, 360)`

use std::sync::LazyLock;

use image::{ImageBuffer, Luma, Pixel, Rgb};
use imageproc::contrast::ThresholdType;

use crate::types::{BinaryThreshold, BufferError, Dimensions, GrayImage, RgbImage};

/// Check that a buffer is non-empty and its sample data matches its
/// dimensions exactly.
///
/// # Errors
///
/// Returns [`BufferError::Empty`] for a zero-area buffer and
/// [`BufferError::LengthMismatch`] when the raw data is longer or shorter
/// than `width * height * channels`.
pub fn validate<P: Pixel<Subpixel = u8>>(
    image: &ImageBuffer<P, Vec<u8>>,
) -> Result<(), BufferError> {
    let dims = Dimensions::of(image);
    if dims.is_empty() {
        return Err(BufferError::Empty {
            width: dims.width,
            height: dims.height,
        });
    }
    let expected = expected_len(dims, P::CHANNEL_COUNT);
    let actual = image.as_raw().len();
    if actual != expected {
        return Err(BufferError::LengthMismatch { expected, actual });
    }
    Ok(())
}

/// Fail unless two buffers share the same width and height.
///
/// # Errors
///
/// Returns [`BufferError::DimensionMismatch`] when they differ.
pub fn ensure_same_dimensions<P, Q>(
    left: &ImageBuffer<P, Vec<u8>>,
    right: &ImageBuffer<Q, Vec<u8>>,
) -> Result<(), BufferError>
where
    P: Pixel<Subpixel = u8>,
    Q: Pixel<Subpixel = u8>,
{
    let (left, right) = (Dimensions::of(left), Dimensions::of(right));
    if left == right {
        Ok(())
    } else {
        Err(BufferError::DimensionMismatch { left, right })
    }
}

/// Build an RGB buffer from interleaved `R, G, B` samples.
///
/// # Errors
///
/// Returns a [`BufferError`] if the dimensions are zero or `data` is not
/// exactly `width * height * 3` bytes long.
pub fn rgb_from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<RgbImage, BufferError> {
    let dims = Dimensions { width, height };
    if dims.is_empty() {
        return Err(BufferError::Empty { width, height });
    }
    let expected = expected_len(dims, 3);
    if data.len() != expected {
        return Err(BufferError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }
    RgbImage::from_raw(width, height, data).ok_or(BufferError::LengthMismatch {
        expected,
        actual: 0,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn expected_len(dims: Dimensions, channels: u8) -> usize {
    dims.pixel_count() as usize * usize::from(channels)
}

/// Convert to grayscale with BT.601 luma weights.
///
/// # Errors
///
/// Returns a [`BufferError`] if `image` is malformed.
#[allow(clippy::cast_possible_truncation)]
pub fn to_grayscale(image: &RgbImage) -> Result<GrayImage, BufferError> {
    validate(image)?;
    Ok(map_rgb_to_gray(image, |[r, g, b]| {
        let luma = 299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b);
        ((luma + 500) / 1000) as u8
    }))
}

/// Binary threshold: samples strictly above the preset level become 255,
/// everything else 0.
///
/// # Errors
///
/// Returns a [`BufferError`] if `gray` is malformed.
pub fn threshold(gray: &GrayImage, level: BinaryThreshold) -> Result<GrayImage, BufferError> {
    validate(gray)?;
    Ok(imageproc::contrast::threshold(
        gray,
        level.level(),
        ThresholdType::Binary,
    ))
}

/// Invert a single-channel image (`255 - v`).
///
/// # Errors
///
/// Returns a [`BufferError`] if `gray` is malformed.
pub fn invert(gray: &GrayImage) -> Result<GrayImage, BufferError> {
    validate(gray)?;
    Ok(GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([!gray.get_pixel(x, y).0[0]])
    }))
}

/// sRGB 8-bit sample to linear light, precomputed for all 256 values.
static SRGB_TO_LINEAR: LazyLock<[f32; 256]> = LazyLock::new(|| {
    std::array::from_fn(|i| {
        #[allow(clippy::cast_precision_loss)]
        let c = i as f32 / 255.0;
        if c <= 0.040_45 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    })
});

/// CIE-LAB `L*` in `[0, 100]` for one sRGB pixel.
#[must_use]
pub fn lab_lightness([r, g, b]: [u8; 3]) -> f32 {
    const EPSILON: f32 = 216.0 / 24_389.0;
    const KAPPA: f32 = 24_389.0 / 27.0;

    let lin = &*SRGB_TO_LINEAR;
    // Relative luminance Y against the D65 white (Y_n = 1).
    let y = 0.212_671_f32.mul_add(
        lin[usize::from(r)],
        0.715_160_f32.mul_add(lin[usize::from(g)], 0.072_169 * lin[usize::from(b)]),
    );
    if y > EPSILON {
        116.0_f32.mul_add(y.cbrt(), -16.0)
    } else {
        KAPPA * y
    }
}

/// Extract the CIE-LAB lightness channel scaled to `0..=255`.
///
/// # Errors
///
/// Returns a [`BufferError`] if `image` is malformed.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn to_lab_l(image: &RgbImage) -> Result<GrayImage, BufferError> {
    validate(image)?;
    Ok(map_rgb_to_gray(image, |rgb| {
        (lab_lightness(rgb) * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8
    }))
}

/// HLS saturation of one pixel, scaled to `0..=255`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn hls_saturation([r, g, b]: [u8; 3]) -> u8 {
    let max = u32::from(r.max(g).max(b));
    let min = u32::from(r.min(g).min(b));
    let diff = max - min;
    if diff == 0 {
        return 0;
    }
    // Lightness below one half divides by (max + min), above by
    // (2 - max - min); both expressed here in 0..=510 units.
    let sum = max + min;
    let denom = if sum < 255 { sum } else { 510 - sum };
    ((255 * diff + denom / 2) / denom).min(255) as u8
}

/// Extract the HLS saturation channel.
///
/// # Errors
///
/// Returns a [`BufferError`] if `image` is malformed.
pub fn to_hls_s(image: &RgbImage) -> Result<GrayImage, BufferError> {
    validate(image)?;
    Ok(map_rgb_to_gray(image, hls_saturation))
}

/// Hue of one pixel in degrees, `[0, 360)`. Achromatic pixels report `0`.
#[must_use]
pub fn hue_degrees([r, g, b]: [u8; 3]) -> f32 {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = max - min;
    if diff == 0.0 {
        return 0.0;
    }
    #[allow(clippy::float_cmp)]
    let hue = if max == r {
        60.0 * (g - b) / diff
    } else if max == g {
        60.0_f32.mul_add((b - r) / diff, 120.0)
    } else {
        60.0_f32.mul_add((r - g) / diff, 240.0)
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue };
    if hue >= 360.0 { hue - 360.0 } else { hue }
}

/// Fully saturated, full-value RGB color for a hue in degrees.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn hue_to_rgb(hue: f32) -> [u8; 3] {
    let h = hue.rem_euclid(360.0) / 60.0;
    let sector = h.floor();
    let f = h - sector;
    let rising = (f * 255.0).round() as u8;
    let falling = ((1.0 - f) * 255.0).round() as u8;
    match sector as u8 {
        0 => [255, rising, 0],
        1 => [falling, 255, 0],
        2 => [0, 255, rising],
        3 => [0, falling, 255],
        4 => [rising, 0, 255],
        _ => [255, 0, falling],
    }
}

/// Isolate hue: recombine each pixel's hue with saturation and value
/// forced to maximum, then convert back to RGB for display.
///
/// # Errors
///
/// Returns a [`BufferError`] if `image` is malformed.
pub fn hue_only(image: &RgbImage) -> Result<RgbImage, BufferError> {
    validate(image)?;
    Ok(RgbImage::from_fn(image.width(), image.height(), |x, y| {
        Rgb(hue_to_rgb(hue_degrees(image.get_pixel(x, y).0)))
    }))
}

fn map_rgb_to_gray(image: &RgbImage, f: impl Fn([u8; 3]) -> u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([f(image.get_pixel(x, y).0)])
    })
}
