//! Disk-resident approximate nearest neighbor index for Quiver.
//!
//! The index is a directed proximity graph in the DiskANN/Vamana family,
//! persisted as a paged memory-mapped file, with product quantization
//! carrying the in-memory distance estimates that keep beam search off the
//! disk-resident full vectors until candidates are worth re-scoring.
//!
//! Build flow: fit PQ codebooks over the reader, assign every vector to its
//! two PQ-nearest partitions, run a parallel Vamana build inside each
//! partition, then merge the partition graphs into the paged file. Query
//! flow: build a per-query PQ lookup table and walk the graph best-first
//! from the medoid, promoting candidates with precise mapped-vector
//! distances before expansion.

pub mod distance;
pub mod disk;
mod kmeans;
pub mod merge;
pub mod partition;
pub mod pq;
pub mod queue;

mod index;

pub use disk::{DiskGraph, PageLayout, SearchContext};
pub use index::{IndexStats, VamanaIndex};
pub use merge::MergeSummary;
pub use partition::PartitionGraph;
pub use pq::PqCodec;
pub use queue::CandidateQueue;
