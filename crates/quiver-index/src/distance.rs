//! Distance kernels for vector comparison.
//!
//! Two kinds are supported, both with "smaller is closer" semantics:
//! - L2: sum of squared component differences, never negative
//! - NegDot: negated inner product
//!
//! Single-pair kernels dispatch to AVX2 or NEON when the target supports
//! them and fall back to scalar loops otherwise. The 1x4 batched form
//! scores one query against four candidates in a single pass, keeping four
//! independent accumulator streams so the hot search and prune loops reach
//! the same decision boundaries on every architecture.

use quiver_core::DistanceKind;

/// Compute the distance between two equal-length vectors.
#[inline]
pub fn distance(kind: DistanceKind, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have the same dimension");
    match kind {
        DistanceKind::L2 => l2_sq(a, b),
        DistanceKind::NegDot => -dot(a, b),
    }
}

/// Compute distances from one query to four candidates in a single pass.
///
/// Equivalent to four `distance` calls; grouping amortizes the traversal of
/// the query and interleaves four independent memory streams.
#[inline]
pub fn distance_batch4(
    kind: DistanceKind,
    query: &[f32],
    a: &[f32],
    b: &[f32],
    c: &[f32],
    d: &[f32],
) -> [f32; 4] {
    debug_assert!(
        a.len() == query.len()
            && b.len() == query.len()
            && c.len() == query.len()
            && d.len() == query.len(),
        "batched candidates must match the query dimension"
    );

    let mut acc = [0.0f32; 4];
    match kind {
        DistanceKind::L2 => {
            for i in 0..query.len() {
                let q = query[i];
                let da = q - a[i];
                let db = q - b[i];
                let dc = q - c[i];
                let dd = q - d[i];
                acc[0] += da * da;
                acc[1] += db * db;
                acc[2] += dc * dc;
                acc[3] += dd * dd;
            }
        }
        DistanceKind::NegDot => {
            for i in 0..query.len() {
                let q = query[i];
                acc[0] += q * a[i];
                acc[1] += q * b[i];
                acc[2] += q * c[i];
                acc[3] += q * d[i];
            }
            for v in &mut acc {
                *v = -*v;
            }
        }
    }
    acc
}

/// Squared L2 distance.
#[inline]
pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { avx2::l2_sq_avx2(a, b) }
    }

    #[cfg(all(
        target_arch = "aarch64",
        target_feature = "neon",
        not(all(target_arch = "x86_64", target_feature = "avx2"))
    ))]
    {
        unsafe { neon::l2_sq_neon(a, b) }
    }

    #[cfg(not(any(
        all(target_arch = "x86_64", target_feature = "avx2"),
        all(target_arch = "aarch64", target_feature = "neon")
    )))]
    {
        l2_sq_scalar(a, b)
    }
}

/// Inner product.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
    {
        unsafe { avx2::dot_avx2(a, b) }
    }

    #[cfg(all(
        target_arch = "aarch64",
        target_feature = "neon",
        not(all(target_arch = "x86_64", target_feature = "avx2"))
    ))]
    {
        unsafe { neon::dot_neon(a, b) }
    }

    #[cfg(not(any(
        all(target_arch = "x86_64", target_feature = "avx2"),
        all(target_arch = "aarch64", target_feature = "neon")
    )))]
    {
        dot_scalar(a, b)
    }
}

// ============================================================================
// x86_64 AVX2 implementations
// ============================================================================

#[cfg(all(target_arch = "x86_64", target_feature = "avx2"))]
mod avx2 {
    use std::arch::x86_64::*;

    /// Squared L2 distance using AVX2 (8 f32 per iteration).
    ///
    /// # Safety
    ///
    /// Requires AVX2 support (guaranteed by the cfg feature gate).
    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn l2_sq_avx2(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut sum = _mm256_setzero_ps();

        let chunks = len / 8;
        for i in 0..chunks {
            let offset = i * 8;
            let va = _mm256_loadu_ps(a.as_ptr().add(offset));
            let vb = _mm256_loadu_ps(b.as_ptr().add(offset));
            let diff = _mm256_sub_ps(va, vb);
            sum = _mm256_fmadd_ps(diff, diff, sum);
        }

        let mut result = horizontal_sum(sum);
        for i in (chunks * 8)..len {
            let diff = a[i] - b[i];
            result += diff * diff;
        }
        result
    }

    /// Inner product using AVX2.
    ///
    /// # Safety
    ///
    /// Requires AVX2 support.
    #[inline]
    #[target_feature(enable = "avx2")]
    pub unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut sum = _mm256_setzero_ps();

        let chunks = len / 8;
        for i in 0..chunks {
            let offset = i * 8;
            let va = _mm256_loadu_ps(a.as_ptr().add(offset));
            let vb = _mm256_loadu_ps(b.as_ptr().add(offset));
            sum = _mm256_fmadd_ps(va, vb, sum);
        }

        let mut result = horizontal_sum(sum);
        for i in (chunks * 8)..len {
            result += a[i] * b[i];
        }
        result
    }

    /// Horizontal sum of 8 floats in an AVX2 register.
    ///
    /// # Safety
    ///
    /// Requires AVX2 support.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn horizontal_sum(v: __m256) -> f32 {
        let low = _mm256_castps256_ps128(v);
        let high = _mm256_extractf128_ps(v, 1);
        let sum128 = _mm_add_ps(low, high);
        let sum64 = _mm_hadd_ps(sum128, sum128);
        let sum32 = _mm_hadd_ps(sum64, sum64);
        _mm_cvtss_f32(sum32)
    }
}

// ============================================================================
// ARM NEON implementations
// ============================================================================

#[cfg(all(target_arch = "aarch64", target_feature = "neon"))]
mod neon {
    use std::arch::aarch64::*;

    /// Squared L2 distance using NEON (4 f32 per iteration).
    ///
    /// # Safety
    ///
    /// Requires NEON support (standard on all ARM64).
    #[inline]
    #[target_feature(enable = "neon")]
    pub unsafe fn l2_sq_neon(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut sum = vdupq_n_f32(0.0);

        let chunks = len / 4;
        for i in 0..chunks {
            let offset = i * 4;
            let va = vld1q_f32(a.as_ptr().add(offset));
            let vb = vld1q_f32(b.as_ptr().add(offset));
            let diff = vsubq_f32(va, vb);
            sum = vfmaq_f32(sum, diff, diff);
        }

        let mut result = vaddvq_f32(sum);
        for i in (chunks * 4)..len {
            let diff = a[i] - b[i];
            result += diff * diff;
        }
        result
    }

    /// Inner product using NEON.
    ///
    /// # Safety
    ///
    /// Requires NEON support.
    #[inline]
    #[target_feature(enable = "neon")]
    pub unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
        let len = a.len();
        let mut sum = vdupq_n_f32(0.0);

        let chunks = len / 4;
        for i in 0..chunks {
            let offset = i * 4;
            let va = vld1q_f32(a.as_ptr().add(offset));
            let vb = vld1q_f32(b.as_ptr().add(offset));
            sum = vfmaq_f32(sum, va, vb);
        }

        let mut result = vaddvq_f32(sum);
        for i in (chunks * 4)..len {
            result += a[i] * b[i];
        }
        result
    }
}

// ============================================================================
// Scalar fallbacks
// ============================================================================

/// Squared L2 distance (scalar fallback).
#[inline]
#[allow(dead_code)] // Used via conditional compilation
pub fn l2_sq_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0;
    for i in 0..a.len() {
        let diff = a[i] - b[i];
        sum += diff * diff;
    }
    sum
}

/// Inner product (scalar fallback).
#[inline]
#[allow(dead_code)] // Used via conditional compilation
pub fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-4;

    #[test]
    fn test_l2_matches_scalar() {
        let a: Vec<f32> = (0..37).map(|i| (i as f32 * 0.13).sin()).collect();
        let b: Vec<f32> = (0..37).map(|i| (i as f32 * 0.07).cos()).collect();

        let fast = l2_sq(&a, &b);
        let scalar = l2_sq_scalar(&a, &b);
        assert!((fast - scalar).abs() < EPSILON);
        assert!(fast >= 0.0);
    }

    #[test]
    fn test_dot_matches_scalar() {
        let a: Vec<f32> = (0..37).map(|i| (i as f32 * 0.13).sin()).collect();
        let b: Vec<f32> = (0..37).map(|i| (i as f32 * 0.07).cos()).collect();

        let fast = dot(&a, &b);
        let scalar = dot_scalar(&a, &b);
        assert!((fast - scalar).abs() < EPSILON);
    }

    #[test]
    fn test_neg_dot_sign() {
        let a = vec![1.0, 2.0];
        let b = vec![3.0, 4.0];
        assert_eq!(distance(DistanceKind::NegDot, &a, &b), -11.0);
    }

    #[test]
    fn test_batch4_matches_singles() {
        let query: Vec<f32> = (0..24).map(|i| i as f32 * 0.5).collect();
        let cands: Vec<Vec<f32>> = (0..4)
            .map(|c| (0..24).map(|i| ((c * 31 + i) as f32 * 0.11).sin()).collect())
            .collect();

        for kind in [DistanceKind::L2, DistanceKind::NegDot] {
            let batch =
                distance_batch4(kind, &query, &cands[0], &cands[1], &cands[2], &cands[3]);
            for lane in 0..4 {
                let single = distance(kind, &query, &cands[lane]);
                assert!(
                    (batch[lane] - single).abs() < EPSILON,
                    "lane {} diverged: {} vs {}",
                    lane,
                    batch[lane],
                    single
                );
            }
        }
    }
}
