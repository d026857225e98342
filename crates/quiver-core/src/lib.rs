//! Core domain types for the Quiver vector index.
//!
//! This crate holds everything the index crate and its embedders share:
//! the canonical error type, the distance-kind tag, build/search options
//! with validation, and the vector-source reader seam.

pub mod error;
pub mod metric;
pub mod options;
pub mod reader;

pub use error::{CoreError, CoreResult};
pub use metric::DistanceKind;
pub use options::IndexOptions;
pub use reader::{SliceReader, VectorReader};
