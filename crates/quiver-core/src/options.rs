use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::metric::DistanceKind;

/// Configuration parameters for a disk-resident vector index.
///
/// The defaults favor recall over build speed and match the usual operating
/// point for embedding dimensions in the 128-1024 range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Index name; used as the stem of every on-disk file.
    pub name: String,

    /// Vector dimension. Must match the reader the index is built from.
    pub dimension: u32,

    /// Distance kind used for construction and search.
    pub metric: DistanceKind,

    /// Maximum out-degree per vertex (M).
    /// Range: [8, 128], Default: 64
    pub max_edges: u32,

    /// Beam width during search and build-time candidate harvesting (L).
    /// Range: [max_edges, 1024], Default: 128
    pub beam_width: u32,

    /// Robust-prune diversity multiplier (alpha).
    /// Range: [1.0, 2.0], Default: 1.2
    pub alpha: f32,

    /// Product-quantization ratio: source bytes per code byte.
    /// Must be a multiple of 4 and yield a sub-vector length dividing
    /// `dimension`. Default: 32
    pub compression: u32,

    /// Seed for every random choice made during the build.
    pub seed: u64,
}

impl IndexOptions {
    /// Default maximum out-degree per vertex.
    pub const DEFAULT_MAX_EDGES: u32 = 64;
    /// Default beam width.
    pub const DEFAULT_BEAM_WIDTH: u32 = 128;
    /// Default robust-prune diversity multiplier.
    pub const DEFAULT_ALPHA: f32 = 1.2;
    /// Default compression ratio (32 source bytes per code byte).
    pub const DEFAULT_COMPRESSION: u32 = 32;

    /// Creates options with default graph and quantization parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, dimension: u32, metric: DistanceKind) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric,
            max_edges: Self::DEFAULT_MAX_EDGES,
            beam_width: Self::DEFAULT_BEAM_WIDTH,
            alpha: Self::DEFAULT_ALPHA,
            compression: Self::DEFAULT_COMPRESSION,
            seed: 0,
        }
    }

    /// Sub-vector length in floats derived from the compression ratio.
    #[must_use]
    pub const fn sub_vector_len(&self) -> u32 {
        self.compression / 4
    }

    /// Number of quantizers (code bytes per vector).
    #[must_use]
    pub const fn quantizers(&self) -> u32 {
        self.dimension / self.sub_vector_len()
    }

    /// Validates parameter ranges and divisibility constraints.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` describing the first rejected parameter.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::config("index name must not be empty"));
        }
        if self.dimension == 0 {
            return Err(CoreError::config("dimension must be positive"));
        }
        if self.max_edges == 0 {
            return Err(CoreError::config("max_edges must be positive"));
        }
        if self.beam_width < self.max_edges {
            return Err(CoreError::config(format!(
                "beam_width {} must be at least max_edges {}",
                self.beam_width, self.max_edges
            )));
        }
        if !(1.0..=2.0).contains(&self.alpha) {
            return Err(CoreError::config(format!(
                "alpha {} is outside valid range [1.0, 2.0]",
                self.alpha
            )));
        }
        if self.compression == 0 || self.compression % 4 != 0 {
            return Err(CoreError::config(format!(
                "compression {} must be a positive multiple of 4",
                self.compression
            )));
        }
        if self.dimension % self.sub_vector_len() != 0 {
            return Err(CoreError::config(format!(
                "sub-vector length {} does not divide dimension {}",
                self.sub_vector_len(),
                self.dimension
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let opts = IndexOptions::new("vectors", 128, DistanceKind::L2);
        assert!(opts.validate().is_ok());
        assert_eq!(opts.sub_vector_len(), 8);
        assert_eq!(opts.quantizers(), 16);
    }

    #[test]
    fn test_rejects_bad_compression() {
        let mut opts = IndexOptions::new("vectors", 128, DistanceKind::L2);
        opts.compression = 6;
        assert!(opts.validate().is_err());

        // Sub-vector length 16 does not divide dimension 24.
        opts.compression = 64;
        opts.dimension = 24;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_rejects_beam_below_degree() {
        let mut opts = IndexOptions::new("vectors", 128, DistanceKind::L2);
        opts.beam_width = 32;
        assert!(opts.validate().is_err());
    }
}
