//! K-means color clustering in RGB space.
//!
//! Produces a segmented image (every pixel replaced by its cluster
//! centroid) and the dominant palette (centroids ranked by population).
//!
//! Initialization is k-means++ driven by a fixed seed, so repeated runs
//! on the same image and cluster count produce identical results.
//! Clustering is best-effort: if the centroids are still moving after
//! [`MAX_ITERATIONS`] rounds the last iterate is used as-is.

use image::Rgb;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::colorspace::validate;
use crate::types::{BufferError, Palette, PaletteEntry, RgbImage};

/// Upper bound on Lloyd iterations.
pub const MAX_ITERATIONS: usize = 20;

/// Iteration stops once no centroid moves farther than this (RGB units).
pub const CONVERGENCE_EPSILON: f32 = 0.5;

/// Seed for k-means++ initialization.
pub const SEED: u64 = 0x5eed_a7e1;

/// Supported cluster counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterCount {
    /// 8 clusters.
    Eight,
    /// 12 clusters.
    Twelve,
}

impl ClusterCount {
    /// Number of clusters.
    #[must_use]
    pub const fn k(self) -> usize {
        match self {
            Self::Eight => 8,
            Self::Twelve => 12,
        }
    }
}

/// Result of clustering one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    /// The image recolored with cluster centroids.
    pub image: RgbImage,
    /// Exactly `k` centroids, most populous first.
    pub palette: Palette,
    /// Lloyd iterations actually run.
    pub iterations: usize,
    /// Whether centroids settled before the iteration cap.
    pub converged: bool,
}

type Color = [f32; 3];

fn distance_squared(a: Color, b: Color) -> f32 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    dr.mul_add(dr, dg.mul_add(dg, db * db))
}

fn nearest(point: Color, centroids: &[Color]) -> usize {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (i, &c) in centroids.iter().enumerate() {
        let d = distance_squared(point, c);
        if d < best_distance {
            best = i;
            best_distance = d;
        }
    }
    best
}

/// k-means++ seeding. When every remaining point coincides with an
/// existing centroid the first centroid is repeated, so degenerate
/// images still yield `k` centroids.
fn initial_centroids(points: &[Color], k: usize, rng: &mut StdRng) -> Vec<Color> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.random_range(0..points.len())]);
    let mut min_distances: Vec<f64> = points
        .iter()
        .map(|&p| f64::from(distance_squared(p, centroids[0])))
        .collect();

    while centroids.len() < k {
        let total: f64 = min_distances.iter().sum();
        let next = if total > 0.0 {
            let target = rng.random::<f64>() * total;
            let mut cumulative = 0.0;
            let mut chosen = points.len() - 1;
            for (i, &d) in min_distances.iter().enumerate() {
                cumulative += d;
                if d > 0.0 && cumulative >= target {
                    chosen = i;
                    break;
                }
            }
            points[chosen]
        } else {
            centroids[0]
        };
        centroids.push(next);
        for (d, &p) in min_distances.iter_mut().zip(points) {
            *d = d.min(f64::from(distance_squared(p, next)));
        }
    }
    centroids
}

/// Cluster the colors of `image` into `clusters` groups.
///
/// # Errors
///
/// Returns a [`BufferError`] if `image` is malformed. Clustering itself
/// never fails.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn kmeans_segment(image: &RgbImage, clusters: ClusterCount) -> Result<Segmentation, BufferError> {
    validate(image)?;
    let k = clusters.k();
    let points: Vec<Color> = image
        .pixels()
        .map(|p| p.0.map(f32::from))
        .collect();

    let mut rng = StdRng::seed_from_u64(SEED);
    let mut centroids = initial_centroids(&points, k, &mut rng);
    let mut labels = vec![0_usize; points.len()];
    let mut counts = vec![0_u64; k];
    let mut iterations = 0;
    let mut converged = false;

    while iterations < MAX_ITERATIONS {
        iterations += 1;

        let mut sums = vec![[0.0_f64; 3]; k];
        counts.iter_mut().for_each(|c| *c = 0);
        for (label, &p) in labels.iter_mut().zip(&points) {
            *label = nearest(p, &centroids);
            counts[*label] += 1;
            for (s, v) in sums[*label].iter_mut().zip(p) {
                *s += f64::from(v);
            }
        }

        let mut shift = 0.0_f32;
        for ((centroid, sum), &count) in centroids.iter_mut().zip(&sums).zip(&counts) {
            // Empty clusters keep their previous centroid.
            if count == 0 {
                continue;
            }
            let updated = sum.map(|s| (s / count as f64) as f32);
            shift = shift.max(distance_squared(*centroid, updated).sqrt());
            *centroid = updated;
        }

        if shift <= CONVERGENCE_EPSILON {
            converged = true;
            break;
        }
    }

    if !converged {
        tracing::debug!(
            k,
            iterations,
            "k-means did not converge, keeping last iterate"
        );
    }

    let rounded: Vec<[u8; 3]> = centroids
        .iter()
        .map(|c| c.map(|v| v.round().clamp(0.0, 255.0) as u8))
        .collect();

    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]));
    let total = points.len() as f64;
    let palette = Palette::new(
        order
            .iter()
            .map(|&i| PaletteEntry {
                color: rounded[i],
                ratio: counts[i] as f64 / total,
            })
            .collect(),
    );

    let mut segmented = RgbImage::new(image.width(), image.height());
    for (pixel, &label) in segmented.pixels_mut().zip(&labels) {
        *pixel = Rgb(rounded[label]);
    }

    Ok(Segmentation {
        image: segmented,
        palette,
        iterations,
        converged,
    })
}
