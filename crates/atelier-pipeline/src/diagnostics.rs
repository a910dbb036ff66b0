//! Pipeline diagnostics: timing and per-stage metrics.
//!
//! Collected by [`analyze_with_diagnostics`] alongside the analysis
//! output. Intended for tuning and for the `atelier-bench` tool; the job
//! executor does not collect them.
//!
//! Timestamps are captured via the `web-time` crate, which uses
//! `performance.now()` on WASM and `std::time::Instant` on native.
//! Durations are serialized as fractional seconds (`f64`).

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kmeans::ClusterCount;
use crate::pipeline::{RunReport, StageId};
use crate::types::{AnalysisOutput, BinaryThreshold, GrayImage, PipelineError};

/// Serde support for `std::time::Duration` as fractional seconds, for
/// use with `#[serde(with = "...")]`.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Write `duration` as `f64` seconds.
    ///
    /// # Errors
    ///
    /// Whatever the serializer reports.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Read `f64` seconds back into a `Duration`.
    ///
    /// # Errors
    ///
    /// Fails for negative, non-finite, or overflowing values.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisDiagnostics {
    /// Size of the encoded input.
    pub input_bytes: usize,
    /// Time spent decoding the input.
    #[serde(with = "duration_serde")]
    pub decode_duration: Duration,
    /// One entry per stage, in stage order.
    pub stages: Vec<StageDiagnostics>,
    /// Wall-clock duration of decode plus all stages.
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Which stage.
    pub stage: StageId,
    /// Wall-clock duration of the stage. Stages run concurrently, so
    /// these do not add up to the total.
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Binary threshold.
    Binary {
        /// Preset used.
        threshold: BinaryThreshold,
        /// Fraction of pixels above the threshold.
        white_fraction: f64,
    },
    /// 3- and 4-level requantization.
    Levels {
        /// Fraction of pixels per level in the 3-level image, darkest first.
        three: Vec<f64>,
        /// Fraction of pixels per level in the 4-level image, darkest first.
        four: Vec<f64>,
    },
    /// LAB lightness.
    LabLightness {
        /// Mean `L*` scaled to `0..=255`.
        mean: f64,
    },
    /// HLS saturation.
    HlsSaturation {
        /// Mean saturation scaled to `0..=255`.
        mean: f64,
    },
    /// Hue.
    Hue {
        /// Index of the fullest 10° bucket.
        peak_bucket: usize,
        /// Number of non-empty buckets.
        occupied_buckets: usize,
    },
    /// K-means clustering.
    Clusters {
        /// Per cluster count: iterations run and whether it converged.
        runs: Vec<ClusterRunMetrics>,
    },
}

/// Convergence metrics of one k-means run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRunMetrics {
    /// Number of clusters.
    pub k: usize,
    /// Lloyd iterations run.
    pub iterations: usize,
    /// Whether centroids settled before the cap.
    pub converged: bool,
    /// Population ratio of the dominant color.
    pub top_ratio: f64,
}

#[allow(clippy::cast_precision_loss)]
fn mean(gray: &GrayImage) -> f64 {
    let n = gray.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    gray.as_raw().iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64
}

#[allow(clippy::cast_precision_loss)]
fn level_fractions(gray: &GrayImage, levels: &[u8]) -> Vec<f64> {
    let n = gray.as_raw().len().max(1) as f64;
    levels
        .iter()
        .map(|&level| gray.as_raw().iter().filter(|&&v| v == level).count() as f64 / n)
        .collect()
}

fn metrics_for(stage: StageId, output: &AnalysisOutput, report: &RunReport) -> StageMetrics {
    match stage {
        StageId::Binary => StageMetrics::Binary {
            threshold: output.threshold,
            white_fraction: level_fractions(&output.binary, &[255])[0],
        },
        StageId::Levels => StageMetrics::Levels {
            three: level_fractions(&output.levels_3, crate::quantize::Levels::Three.values()),
            four: level_fractions(&output.levels_4, crate::quantize::Levels::Four.values()),
        },
        StageId::LabLightness => StageMetrics::LabLightness {
            mean: mean(&output.lab_l),
        },
        StageId::HlsSaturation => StageMetrics::HlsSaturation {
            mean: mean(&output.hls_s),
        },
        StageId::Hue => StageMetrics::Hue {
            peak_bucket: output.hue_histogram.peak(),
            occupied_buckets: output
                .hue_histogram
                .buckets()
                .iter()
                .filter(|&&c| c > 0)
                .count(),
        },
        StageId::Clusters => StageMetrics::Clusters {
            runs: report
                .clustering
                .iter()
                .map(|run| {
                    let palette = match run.clusters {
                        ClusterCount::Eight => &output.palette_8,
                        ClusterCount::Twelve => &output.palette_12,
                    };
                    ClusterRunMetrics {
                        k: run.clusters.k(),
                        iterations: run.iterations,
                        converged: run.converged,
                        top_ratio: palette.entries().first().map_or(0.0, |e| e.ratio),
                    }
                })
                .collect(),
        },
    }
}

/// Decode and analyze `bytes`, collecting diagnostics.
///
/// # Errors
///
/// Same as [`crate::analyze`].
pub fn analyze_with_diagnostics(
    bytes: &[u8],
    threshold: BinaryThreshold,
) -> Result<(AnalysisOutput, AnalysisDiagnostics), PipelineError> {
    let start = web_time::Instant::now();
    let image = crate::decode::decode(bytes)?;
    let decode_duration = start.elapsed();

    let (output, report) = crate::pipeline::run_instrumented(&image, threshold, &|_| {})?;

    let stages = report
        .stage_durations
        .iter()
        .map(|&(stage, duration)| StageDiagnostics {
            stage,
            duration,
            metrics: metrics_for(stage, &output, &report),
        })
        .collect();

    let diagnostics = AnalysisDiagnostics {
        input_bytes: bytes.len(),
        decode_duration,
        stages,
        total_duration: start.elapsed(),
    };
    Ok((output, diagnostics))
}

impl AnalysisDiagnostics {
    /// Human-readable multi-line report.
    #[must_use]
    pub fn report(&self) -> String {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let mut out = String::new();
        let _ = writeln!(out, "Analysis diagnostics\n{}", "=".repeat(60));
        let _ = writeln!(
            out,
            "{:<24} {:>10.3}ms  ({} bytes)",
            "Decode",
            ms(self.decode_duration),
            self.input_bytes
        );
        for stage in &self.stages {
            let _ = writeln!(
                out,
                "{:<24} {:>10.3}ms  {}",
                stage.stage.label(),
                ms(stage.duration),
                stage.metrics.summary()
            );
        }
        let _ = writeln!(out, "{}", "-".repeat(60));
        let _ = writeln!(out, "{:<24} {:>10.3}ms", "Total", ms(self.total_duration));
        out
    }
}

impl StageMetrics {
    /// One-line summary for reports.
    #[must_use]
    pub fn summary(&self) -> String {
        let pct = |f: f64| format!("{:.1}%", f * 100.0);
        let join = |v: &[f64]| v.iter().map(|&f| pct(f)).collect::<Vec<_>>().join("/");
        match self {
            Self::Binary {
                threshold,
                white_fraction,
            } => format!("level={threshold} white={}", pct(*white_fraction)),
            Self::Levels { three, four } => format!("3={} 4={}", join(three), join(four)),
            Self::LabLightness { mean } => format!("mean L={mean:.1}"),
            Self::HlsSaturation { mean } => format!("mean S={mean:.1}"),
            Self::Hue {
                peak_bucket,
                occupied_buckets,
            } => format!(
                "peak={}..{}deg occupied={occupied_buckets}/36",
                peak_bucket * 10,
                peak_bucket * 10 + 10
            ),
            Self::Clusters { runs } => runs
                .iter()
                .map(|r| {
                    format!(
                        "k={} iters={}{} top={}",
                        r.k,
                        r.iterations,
                        if r.converged { "" } else { " (capped)" },
                        pct(r.top_ratio)
                    )
                })
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Rgb;

    use super::*;
    use crate::decode::tests::encode_png;
    use crate::types::RgbImage;

    fn png() -> Vec<u8> {
        encode_png(&RgbImage::from_fn(16, 16, |x, y| {
            Rgb([(x * 16) as u8, (y * 16) as u8, 128])
        }))
    }

    #[test]
    fn diagnostics_cover_every_stage() {
        let (_, diagnostics) = analyze_with_diagnostics(&png(), BinaryThreshold::L140).unwrap();
        let stages: Vec<StageId> = diagnostics.stages.iter().map(|s| s.stage).collect();
        assert_eq!(stages, StageId::ALL.to_vec());
        assert!(diagnostics.total_duration >= diagnostics.decode_duration);
    }

    #[test]
    fn level_fractions_sum_to_one() {
        let (_, diagnostics) = analyze_with_diagnostics(&png(), BinaryThreshold::L50).unwrap();
        let levels = diagnostics
            .stages
            .iter()
            .find_map(|s| match &s.metrics {
                StageMetrics::Levels { three, four } => Some((three.clone(), four.clone())),
                _ => None,
            })
            .unwrap();
        assert!((levels.0.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!((levels.1.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn report_mentions_each_stage() {
        let (_, diagnostics) = analyze_with_diagnostics(&png(), BinaryThreshold::L170).unwrap();
        let report = diagnostics.report();
        for stage in StageId::ALL {
            assert!(report.contains(stage.label()), "missing {}", stage.label());
        }
        assert!(report.contains("Total"));
    }

    #[test]
    fn diagnostics_serialize_to_json() {
        let (_, diagnostics) = analyze_with_diagnostics(&png(), BinaryThreshold::L140).unwrap();
        let json = serde_json::to_string(&diagnostics).unwrap();
        let back: AnalysisDiagnostics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stages.len(), 6);
    }

    #[test]
    fn decode_errors_propagate() {
        assert!(matches!(
            analyze_with_diagnostics(&[], BinaryThreshold::L140),
            Err(PipelineError::EmptyInput)
        ));
    }
}
