//! Small k-means driver used to fit product-quantization codebooks.
//!
//! Centroids are seeded from the training points themselves, assignment is
//! metric-aware, the update step is the arithmetic mean, and empty clusters
//! hold their previous position. Ties between equidistant centroids resolve
//! to the lower centroid index.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use quiver_core::DistanceKind;

use crate::distance;

/// Iteration cap; typical runs converge in well under half of this.
const MAX_ITERATIONS: usize = 32;

/// Maximum squared centroid movement at which iteration stops.
const MOVEMENT_EPSILON: f32 = 1e-4;

/// Fits `k` centroids of `dim` floats over `count` training rows.
///
/// `data` is row-major `count * dim`. Returns a flat `k * dim` centroid
/// buffer; every centroid is initialized from a training row, so for
/// `count < k` the tail repeats rows and all `k` slots stay meaningful.
pub(crate) fn fit_centroids(
    data: &[f32],
    count: usize,
    dim: usize,
    k: usize,
    kind: DistanceKind,
    rng: &mut StdRng,
) -> Vec<f32> {
    debug_assert_eq!(data.len(), count * dim);
    debug_assert!(count > 0 && k > 0);

    let mut centroids = vec![0.0f32; k * dim];
    let mut seeds: Vec<usize> = (0..count).collect();
    seeds.shuffle(rng);
    for c in 0..k {
        let row = seeds[c % count];
        centroids[c * dim..(c + 1) * dim].copy_from_slice(&data[row * dim..(row + 1) * dim]);
    }

    let mut sums = vec![0.0f32; k * dim];
    let mut counts = vec![0usize; k];

    for _ in 0..MAX_ITERATIONS {
        sums.iter_mut().for_each(|s| *s = 0.0);
        counts.iter_mut().for_each(|c| *c = 0);

        for row in 0..count {
            let point = &data[row * dim..(row + 1) * dim];
            let best = nearest_centroid(point, &centroids, k, dim, kind);
            counts[best] += 1;
            let sum = &mut sums[best * dim..(best + 1) * dim];
            for (s, p) in sum.iter_mut().zip(point) {
                *s += *p;
            }
        }

        let mut movement = 0.0f32;
        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            let inv = 1.0 / counts[c] as f32;
            let centroid = &mut centroids[c * dim..(c + 1) * dim];
            let sum = &sums[c * dim..(c + 1) * dim];
            let mut shift = 0.0f32;
            for (value, total) in centroid.iter_mut().zip(sum) {
                let next = total * inv;
                let delta = next - *value;
                shift += delta * delta;
                *value = next;
            }
            movement = movement.max(shift);
        }

        if movement < MOVEMENT_EPSILON {
            break;
        }
    }

    centroids
}

/// Index of the centroid nearest to `point`; ties go to the lower index.
pub(crate) fn nearest_centroid(
    point: &[f32],
    centroids: &[f32],
    k: usize,
    dim: usize,
    kind: DistanceKind,
) -> usize {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for c in 0..k {
        let dist = distance::distance(kind, point, &centroids[c * dim..(c + 1) * dim]);
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}
