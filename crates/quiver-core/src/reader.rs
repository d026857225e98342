use crate::error::{CoreError, CoreResult};

/// Source of fixed-dimensional vectors consumed by the index builder.
///
/// Implementations provide random access by dense index `i` in `[0, size)`.
/// The builder reads each vector more than once (quantizer training,
/// encoding, per-partition loading), so `read` should be cheap.
pub trait VectorReader {
    /// Number of vectors in the source.
    fn size(&self) -> usize;

    /// Dimension of every vector in the source.
    fn dimensions(&self) -> usize;

    /// Borrows the vector at `index`. Panics if `index >= size()`.
    fn read(&self, index: usize) -> &[f32];

    /// External identifier of the vector at `index`, when the source has one.
    fn id(&self, index: usize) -> CoreResult<u64> {
        let _ = index;
        Err(CoreError::not_found("reader does not supply external ids"))
    }

    /// Releases any resources held by the reader.
    fn close(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

/// In-memory reader over a contiguous row-major `f32` buffer.
///
/// Used by tests, benchmarks and embedders whose dataset already fits in
/// process memory.
#[derive(Debug, Clone)]
pub struct SliceReader {
    vectors: Vec<f32>,
    dimension: usize,
}

impl SliceReader {
    /// Wraps a flat buffer of `count * dimension` floats.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if the buffer length is not a multiple of
    /// the dimension.
    pub fn new(vectors: Vec<f32>, dimension: usize) -> CoreResult<Self> {
        if dimension == 0 {
            return Err(CoreError::config("dimension must be positive"));
        }
        if vectors.len() % dimension != 0 {
            return Err(CoreError::config(format!(
                "buffer of {} floats is not a multiple of dimension {}",
                vectors.len(),
                dimension
            )));
        }
        Ok(Self { vectors, dimension })
    }
}

impl VectorReader for SliceReader {
    fn size(&self) -> usize {
        self.vectors.len() / self.dimension
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }

    fn read(&self, index: usize) -> &[f32] {
        let start = index * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    fn id(&self, index: usize) -> CoreResult<u64> {
        Ok(index as u64)
    }
}
