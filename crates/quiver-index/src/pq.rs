//! Product quantization: codebooks, codes and table-driven distance
//! estimation.
//!
//! A vector of dimension `D` is cut into `Q` disjoint sub-vectors of `S`
//! floats. Each sub-vector is quantized independently against a 256-entry
//! codebook, so a whole vector compresses to `Q` bytes. Distances are then
//! estimated as sums of precomputed per-subspace distances, which is what
//! lets the beam search score candidates without touching their full
//! vectors on disk.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use quiver_core::{CoreError, CoreResult, DistanceKind};

use crate::distance;
use crate::kmeans;

/// Entries per sub-codebook; one code byte addresses exactly one entry.
pub const CODEBOOK_SIZE: usize = 256;

/// Rounds of code-space Lloyd iteration used for partition clustering.
const CODE_CLUSTER_ITERATIONS: usize = 8;

/// Fitted product quantizer.
#[derive(Debug, Clone)]
pub struct PqCodec {
    dimension: usize,
    sub_len: usize,
    quantizers: usize,
    kind: DistanceKind,
    /// `quantizers * CODEBOOK_SIZE * sub_len` floats.
    codebooks: Vec<f32>,
}

impl PqCodec {
    /// Fits one 256-entry codebook per sub-vector column of the training set.
    ///
    /// `training` is row-major `count * dimension`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if `sub_len` does not divide `dimension`
    /// or the training set is empty.
    pub fn fit(
        training: &[f32],
        count: usize,
        dimension: usize,
        sub_len: usize,
        kind: DistanceKind,
        rng: &mut StdRng,
    ) -> CoreResult<Self> {
        if sub_len == 0 || dimension % sub_len != 0 {
            return Err(CoreError::config(format!(
                "sub-vector length {} does not divide dimension {}",
                sub_len, dimension
            )));
        }
        if count == 0 {
            return Err(CoreError::config("cannot fit quantizer on empty input"));
        }
        debug_assert_eq!(training.len(), count * dimension);

        let quantizers = dimension / sub_len;
        let mut codebooks = vec![0.0f32; quantizers * CODEBOOK_SIZE * sub_len];
        let mut column = vec![0.0f32; count * sub_len];

        for q in 0..quantizers {
            let start = q * sub_len;
            for row in 0..count {
                let src = &training[row * dimension + start..row * dimension + start + sub_len];
                column[row * sub_len..(row + 1) * sub_len].copy_from_slice(src);
            }
            let centroids =
                kmeans::fit_centroids(&column, count, sub_len, CODEBOOK_SIZE, kind, rng);
            let dst = &mut codebooks
                [q * CODEBOOK_SIZE * sub_len..(q + 1) * CODEBOOK_SIZE * sub_len];
            dst.copy_from_slice(&centroids);
        }

        debug!(quantizers, sub_len, count, "fitted product quantizer");
        Ok(Self {
            dimension,
            sub_len,
            quantizers,
            kind,
            codebooks,
        })
    }

    /// Reassembles a codec from persisted codebooks.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if the buffer does not hold exactly
    /// `Q * 256 * S` floats for the given dimension.
    pub fn from_parts(
        dimension: usize,
        sub_len: usize,
        kind: DistanceKind,
        codebooks: Vec<f32>,
    ) -> CoreResult<Self> {
        if sub_len == 0 || dimension % sub_len != 0 {
            return Err(CoreError::config(format!(
                "sub-vector length {} does not divide dimension {}",
                sub_len, dimension
            )));
        }
        let quantizers = dimension / sub_len;
        if codebooks.len() != quantizers * CODEBOOK_SIZE * sub_len {
            return Err(CoreError::config(format!(
                "codebook buffer holds {} floats, expected {}",
                codebooks.len(),
                quantizers * CODEBOOK_SIZE * sub_len
            )));
        }
        Ok(Self {
            dimension,
            sub_len,
            quantizers,
            kind,
            codebooks,
        })
    }

    /// Number of code bytes per vector.
    #[must_use]
    pub fn quantizers(&self) -> usize {
        self.quantizers
    }

    /// Sub-vector length in floats.
    #[must_use]
    pub fn sub_len(&self) -> usize {
        self.sub_len
    }

    /// Vector dimension the codec was fitted for.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Flat codebook buffer, `Q * 256 * S` floats.
    #[must_use]
    pub fn codebooks(&self) -> &[f32] {
        &self.codebooks
    }

    /// Centroid `c` of quantizer `q`.
    #[inline]
    fn centroid(&self, q: usize, c: usize) -> &[f32] {
        let start = (q * CODEBOOK_SIZE + c) * self.sub_len;
        &self.codebooks[start..start + self.sub_len]
    }

    /// Encodes a vector into `Q` code bytes, written into `out`.
    pub fn encode_into(&self, vector: &[f32], out: &mut [u8]) {
        debug_assert_eq!(vector.len(), self.dimension);
        debug_assert_eq!(out.len(), self.quantizers);
        for q in 0..self.quantizers {
            let sub = &vector[q * self.sub_len..(q + 1) * self.sub_len];
            let book = &self.codebooks
                [q * CODEBOOK_SIZE * self.sub_len..(q + 1) * CODEBOOK_SIZE * self.sub_len];
            out[q] =
                kmeans::nearest_centroid(sub, book, CODEBOOK_SIZE, self.sub_len, self.kind) as u8;
        }
    }

    /// Encodes a vector into a freshly allocated code.
    #[must_use]
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut out = vec![0u8; self.quantizers];
        self.encode_into(vector, &mut out);
        out
    }

    /// Concatenates the centroids a code addresses back into a vector.
    #[must_use]
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        debug_assert_eq!(code.len(), self.quantizers);
        let mut out = Vec::with_capacity(self.dimension);
        for (q, &c) in code.iter().enumerate() {
            out.extend_from_slice(self.centroid(q, c as usize));
        }
        out
    }

    /// Fills `table` with the `Q * 256` per-subspace distances from `query`
    /// to every centroid. Distances are additive across quantizers.
    pub fn lookup_table_into(&self, query: &[f32], table: &mut Vec<f32>) {
        debug_assert_eq!(query.len(), self.dimension);
        table.clear();
        table.reserve(self.quantizers * CODEBOOK_SIZE);
        for q in 0..self.quantizers {
            let sub = &query[q * self.sub_len..(q + 1) * self.sub_len];
            for c in 0..CODEBOOK_SIZE {
                table.push(distance::distance(self.kind, sub, self.centroid(q, c)));
            }
        }
    }

    /// All pairwise sub-centroid distances, `Q * 256 * 256` floats.
    ///
    /// Entry `(q, a, b)` is the sub-distance between centroids `a` and `b`
    /// of quantizer `q`; used for distance computation directly between
    /// codes during partition assignment.
    #[must_use]
    pub fn distance_tables(&self) -> Vec<f32> {
        let mut tables = vec![0.0f32; self.quantizers * CODEBOOK_SIZE * CODEBOOK_SIZE];
        for q in 0..self.quantizers {
            for a in 0..CODEBOOK_SIZE {
                for b in 0..CODEBOOK_SIZE {
                    tables[(q * CODEBOOK_SIZE + a) * CODEBOOK_SIZE + b] =
                        distance::distance(self.kind, self.centroid(q, a), self.centroid(q, b));
                }
            }
        }
        tables
    }
}

/// Estimated distance of a coded vector against a query lookup table.
#[inline]
#[must_use]
pub fn estimate(code: &[u8], table: &[f32]) -> f32 {
    let mut sum = 0.0;
    for (q, &c) in code.iter().enumerate() {
        sum += table[q * CODEBOOK_SIZE + c as usize];
    }
    sum
}

/// Distance between two codes under the pairwise sub-centroid tables.
#[inline]
#[must_use]
pub fn code_distance(tables: &[f32], a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0;
    for q in 0..a.len() {
        sum += tables[(q * CODEBOOK_SIZE + a[q] as usize) * CODEBOOK_SIZE + b[q] as usize];
    }
    sum
}

/// The two partition centroids closest to `code` under PQ distance.
///
/// With a single partition both slots are 0; otherwise the returned indices
/// are always distinct, even when several centroids are equidistant.
#[must_use]
pub fn two_nearest(code: &[u8], centroid_codes: &[Vec<u8>], tables: &[f32]) -> (usize, usize) {
    if centroid_codes.len() < 2 {
        return (0, 0);
    }

    let mut first = usize::MAX;
    let mut second = usize::MAX;
    let mut first_dist = f32::INFINITY;
    let mut second_dist = f32::INFINITY;
    for (p, centroid) in centroid_codes.iter().enumerate() {
        let dist = code_distance(tables, code, centroid);
        if dist < first_dist {
            second = first;
            second_dist = first_dist;
            first = p;
            first_dist = dist;
        } else if dist < second_dist {
            second = p;
            second_dist = dist;
        }
    }
    if second == usize::MAX {
        // All distances were infinite or equal; fall back to the first two.
        second = if first == 0 { 1 } else { 0 };
    }
    (first, second)
}

/// Clusters `n` codes into `k` centroid codes in code space.
///
/// Assignment uses the pairwise tables; the update step picks, per
/// quantizer, the code byte minimizing the summed sub-distance to the
/// cluster members, which keeps every centroid inside code space. Empty
/// clusters hold their previous centroid.
#[must_use]
pub fn cluster_codes(
    codes: &[u8],
    n: usize,
    quantizers: usize,
    tables: &[f32],
    k: usize,
    rng: &mut StdRng,
) -> Vec<Vec<u8>> {
    debug_assert_eq!(codes.len(), n * quantizers);
    debug_assert!(n > 0 && k > 0);

    let code_at = |i: usize| &codes[i * quantizers..(i + 1) * quantizers];

    let mut seeds: Vec<usize> = (0..n).collect();
    seeds.shuffle(rng);
    let mut centroids: Vec<Vec<u8>> = (0..k).map(|c| code_at(seeds[c % n]).to_vec()).collect();

    let mut assignment = vec![0usize; n];
    // Per-cluster, per-quantizer histogram of member code bytes.
    let mut histograms = vec![0u32; k * quantizers * CODEBOOK_SIZE];

    for _ in 0..CODE_CLUSTER_ITERATIONS {
        for (i, slot) in assignment.iter_mut().enumerate() {
            let code = code_at(i);
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let dist = code_distance(tables, code, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            *slot = best;
        }

        histograms.iter_mut().for_each(|h| *h = 0);
        for (i, &cluster) in assignment.iter().enumerate() {
            let code = code_at(i);
            for (q, &byte) in code.iter().enumerate() {
                histograms[(cluster * quantizers + q) * CODEBOOK_SIZE + byte as usize] += 1;
            }
        }

        let mut moved = false;
        for (cluster, centroid) in centroids.iter_mut().enumerate() {
            for q in 0..quantizers {
                let hist =
                    &histograms[(cluster * quantizers + q) * CODEBOOK_SIZE
                        ..(cluster * quantizers + q + 1) * CODEBOOK_SIZE];
                if hist.iter().all(|&h| h == 0) {
                    continue;
                }
                let mut best = centroid[q];
                let mut best_cost = f32::INFINITY;
                for candidate in 0..CODEBOOK_SIZE {
                    let row = &tables[(q * CODEBOOK_SIZE + candidate) * CODEBOOK_SIZE
                        ..(q * CODEBOOK_SIZE + candidate + 1) * CODEBOOK_SIZE];
                    let mut cost = 0.0f32;
                    for (byte, &population) in hist.iter().enumerate() {
                        if population > 0 {
                            cost += population as f32 * row[byte];
                        }
                    }
                    if cost < best_cost {
                        best_cost = cost;
                        best = candidate as u8;
                    }
                }
                if best != centroid[q] {
                    centroid[q] = best;
                    moved = true;
                }
            }
        }
        if !moved {
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn fitted_codec(dim: usize, sub_len: usize, count: usize) -> (PqCodec, Vec<f32>) {
        let mut rng = StdRng::seed_from_u64(11);
        let training: Vec<f32> = (0..count * dim)
            .map(|i| ((i * 37 % 101) as f32 * 0.21).sin())
            .collect();
        let codec =
            PqCodec::fit(&training, count, dim, sub_len, DistanceKind::L2, &mut rng).unwrap();
        (codec, training)
    }

    #[test]
    fn test_fit_rejects_bad_sub_len() {
        let training = vec![0.0; 30];
        let mut rng = StdRng::seed_from_u64(1);
        assert!(PqCodec::fit(&training, 10, 3, 2, DistanceKind::L2, &mut rng).is_err());
        assert!(PqCodec::fit(&training, 0, 3, 1, DistanceKind::L2, &mut rng).is_err());
    }

    #[test]
    fn test_encode_round_trip_is_stable() {
        let (codec, training) = fitted_codec(8, 2, 300);
        for row in [0usize, 17, 299] {
            let vector = &training[row * 8..(row + 1) * 8];
            let code = codec.encode(vector);
            let decoded = codec.decode(&code);
            // Re-encoding the decoded vector must yield the same code.
            assert_eq!(codec.encode(&decoded), code);
        }
    }

    #[test]
    fn test_estimate_of_training_vector_is_small() {
        let (codec, training) = fitted_codec(8, 2, 300);
        let mut table = Vec::new();
        for row in [3usize, 150] {
            let vector = &training[row * 8..(row + 1) * 8];
            let code = codec.encode(vector);
            codec.lookup_table_into(vector, &mut table);
            let est = estimate(&code, &table);
            assert!(est >= 0.0, "L2 estimate must be nonnegative");
            assert!(est < 0.5, "estimate {} too large for a training vector", est);
        }
    }

    #[test]
    fn test_estimate_matches_decoded_distance() {
        let (codec, training) = fitted_codec(8, 2, 300);
        let query = &training[8..16];
        let target = &training[40..48];
        let code = codec.encode(target);
        let mut table = Vec::new();
        codec.lookup_table_into(query, &mut table);

        let est = estimate(&code, &table);
        let exact = crate::distance::distance(DistanceKind::L2, query, &codec.decode(&code));
        assert!((est - exact).abs() < 1e-3);
    }

    #[test]
    fn test_two_nearest_distinct() {
        let (codec, training) = fitted_codec(8, 2, 300);
        let tables = codec.distance_tables();
        let centroids: Vec<Vec<u8>> = (0..4)
            .map(|p| codec.encode(&training[p * 50 * 8..(p * 50 + 1) * 8]))
            .collect();

        let code = codec.encode(&training[0..8]);
        let (p1, p2) = two_nearest(&code, &centroids, &tables);
        assert_ne!(p1, p2);
        assert!(p1 < 4 && p2 < 4);

        // Single partition collapses to (0, 0).
        assert_eq!(two_nearest(&code, &centroids[..1], &tables), (0, 0));
    }

    #[test]
    fn test_cluster_codes_covers_all_clusters() {
        let (codec, training) = fitted_codec(8, 2, 300);
        let tables = codec.distance_tables();
        let mut codes = Vec::new();
        for row in 0..300 {
            codes.extend(codec.encode(&training[row * 8..(row + 1) * 8]));
        }

        let mut rng = StdRng::seed_from_u64(5);
        let centroids = cluster_codes(&codes, 300, codec.quantizers(), &tables, 3, &mut rng);
        assert_eq!(centroids.len(), 3);
        for c in &centroids {
            assert_eq!(c.len(), codec.quantizers());
        }
    }
}
