//! The fixed six-stage analysis pipeline.
//!
//! Every stage reads only the original image, so all six run at once on
//! scoped worker threads and are joined before the [`AnalysisOutput`] is
//! assembled:
//!
//! | # | Stage | Output |
//! |---|-------|--------|
//! | 1 | [`StageId::Binary`] | binary threshold image |
//! | 2 | [`StageId::Levels`] | grayscale at 3 and 4 levels |
//! | 3 | [`StageId::LabLightness`] | CIE-LAB `L*` |
//! | 4 | [`StageId::HlsSaturation`] | HLS `S` and its inverse |
//! | 5 | [`StageId::Hue`] | hue-only image and 36-bucket histogram |
//! | 6 | [`StageId::Clusters`] | k-means at 8 and 12 clusters with palettes |
//!
//! The run is all-or-nothing: if any stage fails the caller gets a
//! [`PipelineError::Stage`] naming the first failing stage (in stage
//! order) and none of the other stages' outputs. A stage whose images do
//! not match the source dimensions counts as failed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kmeans::{ClusterCount, Segmentation};
use crate::quantize::Levels;
use crate::types::{
    AnalysisOutput, BinaryThreshold, BufferError, Dimensions, GrayImage, HueHistogram,
    PipelineError, RgbImage,
};

/// Identifier for one of the six pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Stage 1: binary threshold.
    Binary,
    /// Stage 2: grayscale requantized to 3 and 4 levels.
    Levels,
    /// Stage 3: LAB lightness.
    LabLightness,
    /// Stage 4: HLS saturation and its inverse.
    HlsSaturation,
    /// Stage 5: hue-only image and hue histogram.
    Hue,
    /// Stage 6: k-means clustering at 8 and 12 clusters.
    Clusters,
}

/// Number of pipeline stages.
pub const STAGE_COUNT: usize = StageId::ALL.len();

impl StageId {
    /// All stages in pipeline order.
    pub const ALL: [Self; 6] = [
        Self::Binary,
        Self::Levels,
        Self::LabLightness,
        Self::HlsSaturation,
        Self::Hue,
        Self::Clusters,
    ];

    /// Zero-based position in [`Self::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Binary => 0,
            Self::Levels => 1,
            Self::LabLightness => 2,
            Self::HlsSaturation => 3,
            Self::Hue => 4,
            Self::Clusters => 5,
        }
    }

    /// Short machine-friendly name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Levels => "levels",
            Self::LabLightness => "lab_l",
            Self::HlsSaturation => "hls_s",
            Self::Hue => "hue",
            Self::Clusters => "clusters",
        }
    }

    /// Display label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Binary => "Binary threshold",
            Self::Levels => "Gray levels",
            Self::LabLightness => "LAB lightness",
            Self::HlsSaturation => "HLS saturation",
            Self::Hue => "Hue",
            Self::Clusters => "Color clusters",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Output of a single stage before assembly.
enum StageOutput {
    Binary(GrayImage),
    Levels {
        three: GrayImage,
        four: GrayImage,
    },
    LabLightness(GrayImage),
    HlsSaturation {
        saturation: GrayImage,
        inverted: GrayImage,
    },
    Hue {
        image: RgbImage,
        histogram: HueHistogram,
    },
    Clusters {
        eight: Segmentation,
        twelve: Segmentation,
    },
}

impl StageOutput {
    /// Fail unless every image this stage produced matches `source`.
    fn ensure_dimensions(&self, source: &RgbImage) -> Result<(), BufferError> {
        use crate::colorspace::ensure_same_dimensions;

        match self {
            Self::Binary(gray) | Self::LabLightness(gray) => ensure_same_dimensions(source, gray),
            Self::Levels { three, four } => {
                ensure_same_dimensions(source, three)?;
                ensure_same_dimensions(source, four)
            }
            Self::HlsSaturation {
                saturation,
                inverted,
            } => {
                ensure_same_dimensions(source, saturation)?;
                ensure_same_dimensions(source, inverted)
            }
            Self::Hue { image, .. } => ensure_same_dimensions(source, image),
            Self::Clusters { eight, twelve } => {
                ensure_same_dimensions(source, &eight.image)?;
                ensure_same_dimensions(source, &twelve.image)
            }
        }
    }
}

fn run_stage(
    stage: StageId,
    image: &RgbImage,
    threshold: BinaryThreshold,
) -> Result<StageOutput, BufferError> {
    use crate::{colorspace, histogram, kmeans, quantize};

    Ok(match stage {
        StageId::Binary => {
            let gray = colorspace::to_grayscale(image)?;
            StageOutput::Binary(colorspace::threshold(&gray, threshold)?)
        }
        StageId::Levels => {
            let gray = colorspace::to_grayscale(image)?;
            StageOutput::Levels {
                three: quantize::requantize(&gray, Levels::Three)?,
                four: quantize::requantize(&gray, Levels::Four)?,
            }
        }
        StageId::LabLightness => StageOutput::LabLightness(colorspace::to_lab_l(image)?),
        StageId::HlsSaturation => {
            let saturation = colorspace::to_hls_s(image)?;
            let inverted = colorspace::invert(&saturation)?;
            StageOutput::HlsSaturation {
                saturation,
                inverted,
            }
        }
        StageId::Hue => StageOutput::Hue {
            image: colorspace::hue_only(image)?,
            histogram: histogram::hue_histogram(image)?,
        },
        StageId::Clusters => StageOutput::Clusters {
            eight: kmeans::kmeans_segment(image, ClusterCount::Eight)?,
            twelve: kmeans::kmeans_segment(image, ClusterCount::Twelve)?,
        },
    })
}

/// Timing and convergence details of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Wall-clock duration of each stage, in stage order.
    pub stage_durations: Vec<(StageId, Duration)>,
    /// One entry per clustering run (8 then 12).
    pub clustering: Vec<ClusteringRun>,
}

/// Convergence details of one k-means run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusteringRun {
    /// Requested cluster count.
    pub clusters: ClusterCount,
    /// Lloyd iterations run.
    pub iterations: usize,
    /// Whether the centroids settled before the cap.
    pub converged: bool,
}

/// Run the full pipeline on a decoded image.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidBuffer`] if `image` is empty or
/// malformed, and [`PipelineError::Stage`] if any stage fails.
pub fn run(image: &RgbImage, threshold: BinaryThreshold) -> Result<AnalysisOutput, PipelineError> {
    run_with_progress(image, threshold, &|_| {})
}

/// Run the full pipeline, calling `on_stage_done` as each stage
/// finishes.
///
/// Stages complete in no particular order and the callback may be
/// invoked from worker threads.
///
/// # Errors
///
/// See [`run`].
pub fn run_with_progress(
    image: &RgbImage,
    threshold: BinaryThreshold,
    on_stage_done: &(dyn Fn(StageId) + Sync),
) -> Result<AnalysisOutput, PipelineError> {
    run_instrumented(image, threshold, on_stage_done).map(|(output, _)| output)
}

/// Run the full pipeline and also return per-stage timings.
///
/// # Errors
///
/// See [`run`].
pub fn run_instrumented(
    image: &RgbImage,
    threshold: BinaryThreshold,
    on_stage_done: &(dyn Fn(StageId) + Sync),
) -> Result<(AnalysisOutput, RunReport), PipelineError> {
    crate::colorspace::validate(image)?;
    run_stages_with(image, threshold, on_stage_done, &|stage| {
        run_stage(stage, image, threshold)
    })
}

/// Run `stage_fn` for every stage on its own scoped thread and join the
/// results in stage order. The first failure in that order wins.
fn run_stages_with(
    image: &RgbImage,
    threshold: BinaryThreshold,
    on_stage_done: &(dyn Fn(StageId) + Sync),
    stage_fn: &(dyn Fn(StageId) -> Result<StageOutput, BufferError> + Sync),
) -> Result<(AnalysisOutput, RunReport), PipelineError> {
    let joined: Vec<(StageId, std::thread::Result<(Result<StageOutput, BufferError>, Duration)>)> =
        std::thread::scope(|scope| {
            let handles: Vec<_> = StageId::ALL
                .into_iter()
                .map(|stage| {
                    let handle = scope.spawn(move || {
                        let start = web_time::Instant::now();
                        let result = stage_fn(stage);
                        let elapsed = start.elapsed();
                        if result.is_ok() {
                            on_stage_done(stage);
                        }
                        (result, elapsed)
                    });
                    (stage, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(stage, handle)| (stage, handle.join()))
                .collect()
        });

    let mut outputs = Vec::with_capacity(STAGE_COUNT);
    let mut stage_durations = Vec::with_capacity(STAGE_COUNT);
    for (stage, joined) in joined {
        let (result, elapsed) = joined.map_err(|payload| PipelineError::Stage {
            stage,
            cause: format!("stage panicked: {}", panic_message(payload.as_ref())),
        })?;
        let output = result
            .and_then(|output| output.ensure_dimensions(image).map(|()| output))
            .map_err(|e| PipelineError::Stage {
                stage,
                cause: e.to_string(),
            })?;
        tracing::debug!(
            stage = stage.name(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "stage complete"
        );
        stage_durations.push((stage, elapsed));
        outputs.push(output);
    }

    assemble(image, threshold, outputs, stage_durations)
}

/// Best-effort text of a caught panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

fn missing(stage: StageId) -> PipelineError {
    PipelineError::Stage {
        stage,
        cause: "stage produced no output".to_owned(),
    }
}

fn assemble(
    image: &RgbImage,
    threshold: BinaryThreshold,
    outputs: Vec<StageOutput>,
    stage_durations: Vec<(StageId, Duration)>,
) -> Result<(AnalysisOutput, RunReport), PipelineError> {
    let mut binary = None;
    let mut levels = None;
    let mut lab_l = None;
    let mut hls = None;
    let mut hue = None;
    let mut clusters = None;

    for output in outputs {
        match output {
            StageOutput::Binary(b) => binary = Some(b),
            StageOutput::Levels { three, four } => levels = Some((three, four)),
            StageOutput::LabLightness(l) => lab_l = Some(l),
            StageOutput::HlsSaturation {
                saturation,
                inverted,
            } => hls = Some((saturation, inverted)),
            StageOutput::Hue { image, histogram } => hue = Some((image, histogram)),
            StageOutput::Clusters { eight, twelve } => clusters = Some((eight, twelve)),
        }
    }

    let binary = binary.ok_or_else(|| missing(StageId::Binary))?;
    let (levels_3, levels_4) = levels.ok_or_else(|| missing(StageId::Levels))?;
    let lab_l = lab_l.ok_or_else(|| missing(StageId::LabLightness))?;
    let (hls_s, hls_s_inverted) = hls.ok_or_else(|| missing(StageId::HlsSaturation))?;
    let (hue, hue_histogram) = hue.ok_or_else(|| missing(StageId::Hue))?;
    let (eight, twelve) = clusters.ok_or_else(|| missing(StageId::Clusters))?;

    let report = RunReport {
        stage_durations,
        clustering: vec![
            ClusteringRun {
                clusters: ClusterCount::Eight,
                iterations: eight.iterations,
                converged: eight.converged,
            },
            ClusteringRun {
                clusters: ClusterCount::Twelve,
                iterations: twelve.iterations,
                converged: twelve.converged,
            },
        ],
    };

    let output = AnalysisOutput {
        threshold,
        dimensions: Dimensions::of(image),
        original: image.clone(),
        binary,
        levels_3,
        levels_4,
        lab_l,
        hls_s,
        hls_s_inverted,
        hue,
        hue_histogram,
        clusters_8: eight.image,
        clusters_12: twelve.image,
        palette_8: eight.palette,
        palette_12: twelve.palette,
    };

    Ok((output, report))
}
