//! Shared types for the atelier visual analysis pipeline.

use serde::{Deserialize, Serialize};

use crate::pipeline::StageId;

/// Re-export `GrayImage` so downstream crates can reference
/// single-channel stage outputs without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbImage` so downstream crates can reference the
/// original image and three-channel stage outputs.
pub use image::RgbImage;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of any `image` buffer.
    #[must_use]
    pub fn of<I: image::GenericImageView>(image: &I) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }

    /// Total pixel count (`width * height`).
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether either axis is zero.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The six binary threshold presets offered to the user.
///
/// The pipeline never accepts an arbitrary level: integers are only
/// converted through [`TryFrom<u32>`], which rejects anything that is not
/// one of the presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BinaryThreshold {
    /// Level 200: only the brightest highlights stay white.
    L200,
    /// Level 170.
    L170,
    /// Level 140: the default middle preset.
    #[default]
    L140,
    /// Level 110.
    L110,
    /// Level 80.
    L80,
    /// Level 50: almost everything but the deepest shadows is white.
    L50,
}

impl BinaryThreshold {
    /// All presets, brightest cut first.
    pub const ALL: [Self; 6] = [
        Self::L200,
        Self::L170,
        Self::L140,
        Self::L110,
        Self::L80,
        Self::L50,
    ];

    /// The gray level samples are compared against.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::L200 => 200,
            Self::L170 => 170,
            Self::L140 => 140,
            Self::L110 => 110,
            Self::L80 => 80,
            Self::L50 => 50,
        }
    }
}

impl TryFrom<u32> for BinaryThreshold {
    type Error = PipelineError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| u32::from(t.level()) == value)
            .ok_or(PipelineError::InvalidThreshold(value))
    }
}

impl From<BinaryThreshold> for u32 {
    fn from(threshold: BinaryThreshold) -> Self {
        Self::from(threshold.level())
    }
}

impl std::fmt::Display for BinaryThreshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// One dominant color: a cluster centroid and the share of pixels
/// assigned to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaletteEntry {
    /// Centroid color, rounded to 8-bit RGB.
    pub color: [u8; 3],
    /// Fraction of all pixels in this cluster, in `[0, 1]`.
    pub ratio: f64,
}

/// Dominant palette: cluster centroids ordered by descending population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Palette(Vec<PaletteEntry>);

impl Palette {
    /// Create a palette from entries already in rank order.
    #[must_use]
    pub const fn new(entries: Vec<PaletteEntry>) -> Self {
        Self(entries)
    }

    /// Number of entries (always the requested cluster count).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the palette has no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in rank order.
    #[must_use]
    pub fn entries(&self) -> &[PaletteEntry] {
        &self.0
    }

    /// Sum of all population ratios. Within rounding of `1.0` for any
    /// non-empty image.
    #[must_use]
    pub fn total_ratio(&self) -> f64 {
        self.0.iter().map(|e| e.ratio).sum()
    }
}

/// Number of hue histogram buckets.
pub const HUE_BUCKETS: usize = 36;

/// Width of one hue bucket in degrees.
pub const HUE_BUCKET_DEGREES: f32 = 10.0;

/// Pixel counts per 10° hue bucket, 36 buckets covering `[0, 360)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HueHistogram(Vec<u64>);

impl HueHistogram {
    /// An all-zero histogram.
    #[must_use]
    pub fn empty() -> Self {
        Self(vec![0; HUE_BUCKETS])
    }

    /// Record one sample at `hue` degrees.
    pub fn add(&mut self, hue: f32) {
        self.0[bucket_for(hue)] += 1;
    }

    /// Bucket counts, index `i` covering `[i*10°, (i+1)*10°)`.
    #[must_use]
    pub fn buckets(&self) -> &[u64] {
        &self.0
    }

    /// Sum of all bucket counts.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Index of the fullest bucket (lowest index on ties).
    #[must_use]
    pub fn peak(&self) -> usize {
        self.0
            .iter()
            .enumerate()
            .fold((0, 0), |best, (i, &count)| {
                if count > best.1 { (i, count) } else { best }
            })
            .0
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn bucket_for(hue: f32) -> usize {
    if !hue.is_finite() || hue < 0.0 {
        return 0;
    }
    ((hue / HUE_BUCKET_DEGREES) as usize).min(HUE_BUCKETS - 1)
}

/// Every stage output of one analysis run.
///
/// Built once by [`crate::pipeline::run`] after all six stages succeed
/// and never modified afterwards; a new analysis always produces a new
/// value.
///
/// Uses custom `Serialize`/`Deserialize` implementations because the
/// `image` buffers do not implement serde traits. Raster images are
/// serialized as `(width, height, raw_pixels)` tuples.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput {
    /// Threshold preset used for the binary stage.
    pub threshold: BinaryThreshold,
    /// Source image dimensions in pixels.
    pub dimensions: Dimensions,
    /// The decoded source image.
    pub original: RgbImage,
    /// Stage 1: binary threshold.
    pub binary: GrayImage,
    /// Stage 2: grayscale requantized to {0, 127, 255}.
    pub levels_3: GrayImage,
    /// Stage 2: grayscale requantized to {0, 85, 170, 255}.
    pub levels_4: GrayImage,
    /// Stage 3: CIE-LAB lightness.
    pub lab_l: GrayImage,
    /// Stage 4: HLS saturation.
    pub hls_s: GrayImage,
    /// Stage 4: inverted HLS saturation.
    pub hls_s_inverted: GrayImage,
    /// Stage 5: hue with saturation and value forced to maximum.
    pub hue: RgbImage,
    /// Stage 5: 36-bucket hue histogram.
    pub hue_histogram: HueHistogram,
    /// Stage 6: image recolored with 8 cluster centroids.
    pub clusters_8: RgbImage,
    /// Stage 6: image recolored with 12 cluster centroids.
    pub clusters_12: RgbImage,
    /// Stage 6: 8-color dominant palette.
    pub palette_8: Palette,
    /// Stage 6: 12-color dominant palette.
    pub palette_12: Palette,
}

type RasterProxy = (u32, u32, Vec<u8>);

fn raster<P: image::Pixel<Subpixel = u8>>(image: &image::ImageBuffer<P, Vec<u8>>) -> RasterProxy {
    (image.width(), image.height(), image.as_raw().clone())
}

fn gray_from<E: serde::de::Error>(proxy: RasterProxy, name: &str) -> Result<GrayImage, E> {
    GrayImage::from_raw(proxy.0, proxy.1, proxy.2)
        .ok_or_else(|| E::custom(format!("invalid {name} image dimensions")))
}

fn rgb_from<E: serde::de::Error>(proxy: RasterProxy, name: &str) -> Result<RgbImage, E> {
    RgbImage::from_raw(proxy.0, proxy.1, proxy.2)
        .ok_or_else(|| E::custom(format!("invalid {name} image dimensions")))
}

/// Serde-compatible proxy for `AnalysisOutput`.
#[derive(Serialize, Deserialize)]
struct AnalysisOutputProxy {
    threshold: BinaryThreshold,
    dimensions: Dimensions,
    original: RasterProxy,
    binary: RasterProxy,
    levels_3: RasterProxy,
    levels_4: RasterProxy,
    lab_l: RasterProxy,
    hls_s: RasterProxy,
    hls_s_inverted: RasterProxy,
    hue: RasterProxy,
    hue_histogram: HueHistogram,
    clusters_8: RasterProxy,
    clusters_12: RasterProxy,
    palette_8: Palette,
    palette_12: Palette,
}

impl Serialize for AnalysisOutput {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = AnalysisOutputProxy {
            threshold: self.threshold,
            dimensions: self.dimensions,
            original: raster(&self.original),
            binary: raster(&self.binary),
            levels_3: raster(&self.levels_3),
            levels_4: raster(&self.levels_4),
            lab_l: raster(&self.lab_l),
            hls_s: raster(&self.hls_s),
            hls_s_inverted: raster(&self.hls_s_inverted),
            hue: raster(&self.hue),
            hue_histogram: self.hue_histogram.clone(),
            clusters_8: raster(&self.clusters_8),
            clusters_12: raster(&self.clusters_12),
            palette_8: self.palette_8.clone(),
            palette_12: self.palette_12.clone(),
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AnalysisOutput {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = AnalysisOutputProxy::deserialize(deserializer)?;
        if proxy.hue_histogram.buckets().len() != HUE_BUCKETS {
            return Err(serde::de::Error::custom(format!(
                "hue histogram must have {HUE_BUCKETS} buckets"
            )));
        }
        Ok(Self {
            threshold: proxy.threshold,
            dimensions: proxy.dimensions,
            original: rgb_from(proxy.original, "original")?,
            binary: gray_from(proxy.binary, "binary")?,
            levels_3: gray_from(proxy.levels_3, "3-level")?,
            levels_4: gray_from(proxy.levels_4, "4-level")?,
            lab_l: gray_from(proxy.lab_l, "LAB lightness")?,
            hls_s: gray_from(proxy.hls_s, "HLS saturation")?,
            hls_s_inverted: gray_from(proxy.hls_s_inverted, "inverted HLS saturation")?,
            hue: rgb_from(proxy.hue, "hue")?,
            hue_histogram: proxy.hue_histogram,
            clusters_8: rgb_from(proxy.clusters_8, "8-cluster")?,
            clusters_12: rgb_from(proxy.clusters_12, "12-cluster")?,
            palette_8: proxy.palette_8,
            palette_12: proxy.palette_12,
        })
    }
}

/// Malformed pixel buffer passed to a color-space or quantization op.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BufferError {
    /// The buffer has zero width or zero height.
    #[error("pixel buffer is empty ({width}x{height})")]
    Empty {
        /// Buffer width.
        width: u32,
        /// Buffer height.
        height: u32,
    },

    /// Raw sample data does not match `width * height * channels`.
    #[error("pixel buffer has {actual} samples, expected {expected}")]
    LengthMismatch {
        /// Samples implied by the declared dimensions.
        expected: usize,
        /// Samples actually supplied.
        actual: usize,
    },

    /// Two buffers that must share dimensions do not.
    #[error(
        "pixel buffers differ in size: {}x{} vs {}x{}",
        .left.width, .left.height, .right.width, .right.height
    )]
    DimensionMismatch {
        /// Dimensions of the first buffer.
        left: Dimensions,
        /// Dimensions of the second buffer.
        right: Dimensions,
    },
}

/// Errors that can occur while running the analysis pipeline.
///
/// Uses custom `Serialize`/`Deserialize` because `image::ImageError`
/// does not implement serde traits. The `ImageDecode` variant is
/// serialized as its `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// A decode error received over the wire; the typed
    /// `image::ImageError` cannot be reconstructed.
    #[error("failed to decode image: {0}")]
    DecodeMessage(String),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// The image buffer itself is malformed.
    #[error("invalid pixel buffer: {0}")]
    InvalidBuffer(#[from] BufferError),

    /// An integer that is not one of the six threshold presets.
    #[error("threshold {0} is not one of the presets 200, 170, 140, 110, 80, 50")]
    InvalidThreshold(u32),

    /// One stage failed; no output is produced for the run.
    #[error("stage '{}' failed: {cause}", .stage.name())]
    Stage {
        /// The failing stage.
        stage: StageId,
        /// Human-readable cause, recorded verbatim on the job.
        cause: String,
    },
}

/// Serde-compatible proxy for `PipelineError`.
#[derive(Serialize, Deserialize)]
enum PipelineErrorProxy {
    ImageDecode(String),
    EmptyInput,
    InvalidBuffer(BufferError),
    InvalidThreshold(u32),
    Stage { stage: StageId, cause: String },
}

impl Serialize for PipelineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::ImageDecode(e) => PipelineErrorProxy::ImageDecode(e.to_string()),
            Self::DecodeMessage(msg) => PipelineErrorProxy::ImageDecode(msg.clone()),
            Self::EmptyInput => PipelineErrorProxy::EmptyInput,
            Self::InvalidBuffer(e) => PipelineErrorProxy::InvalidBuffer(e.clone()),
            Self::InvalidThreshold(v) => PipelineErrorProxy::InvalidThreshold(*v),
            Self::Stage { stage, cause } => PipelineErrorProxy::Stage {
                stage: *stage,
                cause: cause.clone(),
            },
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = PipelineErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            PipelineErrorProxy::ImageDecode(msg) => Self::DecodeMessage(msg),
            PipelineErrorProxy::EmptyInput => Self::EmptyInput,
            PipelineErrorProxy::InvalidBuffer(e) => Self::InvalidBuffer(e),
            PipelineErrorProxy::InvalidThreshold(v) => Self::InvalidThreshold(v),
            PipelineErrorProxy::Stage { stage, cause } => Self::Stage { stage, cause },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // --- BinaryThreshold ---

    #[test]
    fn threshold_accepts_every_preset() {
        for preset in BinaryThreshold::ALL {
            let parsed = BinaryThreshold::try_from(u32::from(preset.level())).unwrap();
            assert_eq!(parsed, preset);
        }
    }

    #[test]
    fn threshold_rejects_values_between_presets() {
        for value in [0, 49, 51, 100, 139, 141, 201, 255, 1000] {
            assert!(
                matches!(
                    BinaryThreshold::try_from(value),
                    Err(PipelineError::InvalidThreshold(v)) if v == value
                ),
                "{value} should be rejected",
            );
        }
    }

    #[test]
    fn threshold_serializes_as_its_level() {
        let json = serde_json::to_string(&BinaryThreshold::L110).unwrap();
        assert_eq!(json, "110");
        let back: BinaryThreshold = serde_json::from_str("80").unwrap();
        assert_eq!(back, BinaryThreshold::L80);
        assert!(serde_json::from_str::<BinaryThreshold>("90").is_err());
    }

    #[test]
    fn threshold_default_is_140() {
        assert_eq!(BinaryThreshold::default().level(), 140);
    }

    // --- HueHistogram ---

    #[test]
    fn histogram_has_36_buckets() {
        assert_eq!(HueHistogram::empty().buckets().len(), HUE_BUCKETS);
    }

    #[test]
    fn histogram_bucket_edges() {
        let mut h = HueHistogram::empty();
        h.add(0.0);
        h.add(9.999);
        h.add(10.0);
        h.add(359.9);
        h.add(360.0);
        assert_eq!(h.buckets()[0], 2);
        assert_eq!(h.buckets()[1], 1);
        assert_eq!(h.buckets()[35], 2);
        assert_eq!(h.total(), 5);
    }

    #[test]
    fn histogram_non_finite_goes_to_first_bucket() {
        let mut h = HueHistogram::empty();
        h.add(f32::NAN);
        h.add(-5.0);
        assert_eq!(h.buckets()[0], 2);
    }

    #[test]
    fn histogram_peak_prefers_lowest_index_on_tie() {
        let mut h = HueHistogram::empty();
        h.add(125.0);
        h.add(45.0);
        assert_eq!(h.peak(), 4);
    }

    // --- Palette ---

    #[test]
    fn palette_total_ratio() {
        let palette = Palette::new(vec![
            PaletteEntry {
                color: [1, 2, 3],
                ratio: 0.75,
            },
            PaletteEntry {
                color: [4, 5, 6],
                ratio: 0.25,
            },
        ]);
        assert_eq!(palette.len(), 2);
        assert!((palette.total_ratio() - 1.0).abs() < 1e-12);
    }

    // --- Errors ---

    #[test]
    fn stage_error_message_names_stage() {
        let err = PipelineError::Stage {
            stage: StageId::Clusters,
            cause: "boom".into(),
        };
        assert_eq!(err.to_string(), "stage 'clusters' failed: boom");
    }

    #[test]
    fn pipeline_error_serde_preserves_stage() {
        let err = PipelineError::Stage {
            stage: StageId::Hue,
            cause: "bad".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: PipelineError = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            PipelineError::Stage { stage: StageId::Hue, ref cause } if cause == "bad"
        ));
    }

    #[test]
    fn decode_error_deserializes_as_message() {
        let err = PipelineError::DecodeMessage("bad header".into());
        let json = serde_json::to_string(&err).unwrap();
        let back: PipelineError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), "failed to decode image: bad header");
    }

    #[test]
    fn dimensions_pixel_count() {
        let d = Dimensions {
            width: 70_000,
            height: 70_000,
        };
        assert_eq!(d.pixel_count(), 4_900_000_000);
        assert!(!d.is_empty());
        assert!(
            Dimensions {
                width: 0,
                height: 3
            }
            .is_empty()
        );
    }
}
