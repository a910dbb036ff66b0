//! atelier-pipeline: Pure visual analysis pipeline (sans-IO).
//!
//! Turns one image into a set of study aids for a painter or
//! illustrator: a binary value sketch, 3- and 4-level value studies,
//! LAB lightness, HLS saturation (plain and inverted), isolated hue
//! with a hue histogram, and 8- and 12-color dominant palettes.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! byte slices and buffers and returns structured data. Job tracking
//! and polling live in `atelier-jobs`.

pub mod colorspace;
pub mod decode;
pub mod diagnostics;
pub mod histogram;
pub mod kmeans;
pub mod pipeline;
pub mod quantize;
pub mod types;

pub use kmeans::{ClusterCount, Segmentation};
pub use pipeline::{StageId, run, run_with_progress};
pub use quantize::Levels;
pub use types::{
    AnalysisOutput, BinaryThreshold, BufferError, Dimensions, GrayImage, HueHistogram, Palette,
    PaletteEntry, PipelineError, RgbImage,
};

/// Decode `image_bytes` and run the full analysis pipeline.
///
/// # Pipeline steps
///
/// 1. Binary threshold at the chosen preset
/// 2. Grayscale requantized to 3 and 4 levels
/// 3. CIE-LAB lightness
/// 4. HLS saturation and its inverse
/// 5. Hue-only image and 36-bucket hue histogram
/// 6. K-means at 8 and 12 clusters with dominant palettes
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `image_bytes` is empty,
/// [`PipelineError::ImageDecode`] if the format is unrecognized, and
/// [`PipelineError::Stage`] if any stage fails.
pub fn analyze(
    image_bytes: &[u8],
    threshold: BinaryThreshold,
) -> Result<AnalysisOutput, PipelineError> {
    let image = decode::decode(image_bytes)?;
    run(&image, threshold)
}

/// Run the full analysis pipeline on interleaved `R, G, B` samples.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidBuffer`] if the dimensions are zero or
/// `samples` is not exactly `width * height * 3` bytes, and
/// [`PipelineError::Stage`] if any stage fails.
pub fn analyze_raw(
    width: u32,
    height: u32,
    samples: Vec<u8>,
    threshold: BinaryThreshold,
) -> Result<AnalysisOutput, PipelineError> {
    let image = colorspace::rgb_from_raw(width, height, samples)?;
    run(&image, threshold)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Rgb;

    use super::*;
    use crate::decode::tests::encode_png;

    /// Left half dark red, right half light blue.
    fn split_png(width: u32, height: u32) -> Vec<u8> {
        encode_png(&RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([90, 10, 10])
            } else {
                Rgb([170, 200, 250])
            }
        }))
    }

    #[test]
    fn analyze_empty_input() {
        assert!(matches!(
            analyze(&[], BinaryThreshold::L140),
            Err(PipelineError::EmptyInput)
        ));
    }

    #[test]
    fn analyze_corrupt_input() {
        assert!(matches!(
            analyze(&[0xFF, 0x00], BinaryThreshold::L140),
            Err(PipelineError::ImageDecode(_))
        ));
    }

    #[test]
    fn analyze_split_image() {
        let output = analyze(&split_png(20, 10), BinaryThreshold::L140).unwrap();
        // Dark red luma is 34, light blue is 197.
        assert_eq!(output.binary.get_pixel(0, 0).0[0], 0);
        assert_eq!(output.binary.get_pixel(19, 9).0[0], 255);
        assert_eq!(output.levels_3.get_pixel(0, 0).0[0], 0);
        assert_eq!(output.levels_3.get_pixel(19, 9).0[0], 255);
        assert_eq!(output.levels_4.get_pixel(0, 0).0[0], 0);
        assert_eq!(output.levels_4.get_pixel(19, 9).0[0], 255);

        let top_two: Vec<[u8; 3]> = output.palette_8.entries()[..2]
            .iter()
            .map(|e| e.color)
            .collect();
        assert!(top_two.contains(&[90, 10, 10]));
        assert!(top_two.contains(&[170, 200, 250]));
        assert!((output.palette_8.entries()[0].ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn analyze_raw_matches_decoded_analysis() {
        let image = RgbImage::from_fn(6, 4, |x, y| Rgb([(x * 40) as u8, (y * 60) as u8, 90]));
        let from_raw = analyze_raw(6, 4, image.as_raw().clone(), BinaryThreshold::L110).unwrap();
        assert_eq!(from_raw.original, image);
        assert_eq!(from_raw.binary, run(&image, BinaryThreshold::L110).unwrap().binary);
    }

    #[test]
    fn analyze_raw_rejects_short_buffer() {
        assert!(matches!(
            analyze_raw(6, 4, vec![0; 71], BinaryThreshold::L110),
            Err(PipelineError::InvalidBuffer(BufferError::LengthMismatch {
                expected: 72,
                actual: 71
            }))
        ));
    }

    #[test]
    fn analyze_output_serde_round_trip() {
        let output = analyze(&split_png(8, 4), BinaryThreshold::L200).unwrap();
        let json = serde_json::to_string(&output).unwrap();
        let back: AnalysisOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, output);
    }
}
