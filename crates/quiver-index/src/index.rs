//! Index orchestration: quantizer fit, partition assignment, per-partition
//! Vamana builds, the N-way merge, and the query front-end.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use quiver_core::{CoreError, CoreResult, IndexOptions, VectorReader};

use crate::disk::{DiskGraph, PageLayout, SearchContext};
use crate::merge;
use crate::partition::PartitionGraph;
use crate::pq::{self, PqCodec};

/// Quantizer training is capped at this many vectors; larger datasets are
/// sampled without replacement.
const TRAINING_SAMPLE_CAP: usize = 65_536;

/// Aggregate figures recorded at the end of a build.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndexStats {
    /// Total vertices in the index.
    pub vertices: u32,
    /// Largest out-degree written by the merge.
    pub max_degree: u32,
    /// Mean out-degree across all vertices.
    pub avg_degree: f64,
    /// Wall-clock build duration.
    pub build_millis: u64,
}

/// Sidecar metadata persisted beside the paged graph file.
#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    options: IndexOptions,
    vertex_count: u32,
    medoid: u32,
    stats: IndexStats,
}

enum State {
    /// `build_index` has not been called.
    Unbuilt,
    /// Built over an empty reader; no files exist.
    EmptyBuilt,
    /// A graph file is mapped and ready to serve queries.
    Built { graph: DiskGraph, stats: IndexStats },
}

/// Disk-resident approximate nearest neighbor index.
///
/// # Example
///
/// ```no_run
/// use quiver_core::{DistanceKind, IndexOptions, SliceReader};
/// use quiver_index::VamanaIndex;
///
/// # fn main() -> quiver_core::CoreResult<()> {
/// let mut options = IndexOptions::new("embeddings", 128, DistanceKind::L2);
/// options.compression = 16;
/// let mut index = VamanaIndex::new(options, "/var/lib/quiver")?;
///
/// let reader = SliceReader::new(vec![0.0; 128 * 1000], 128)?;
/// index.build_index(4, &reader)?;
///
/// let query = vec![0.0f32; 128];
/// let nearest = index.nearest(&query, 10)?;
/// # let _ = nearest;
/// # Ok(())
/// # }
/// ```
pub struct VamanaIndex {
    options: IndexOptions,
    dir: PathBuf,
    state: State,
    contexts: Mutex<Vec<SearchContext>>,
}

impl VamanaIndex {
    /// Creates an unbuilt index rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` for invalid options and `CoreError::Io`
    /// when the directory cannot be created.
    pub fn new(options: IndexOptions, dir: impl Into<PathBuf>) -> CoreResult<Self> {
        options.validate()?;
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            options,
            dir,
            state: State::Unbuilt,
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// Reopens a previously built index read-only.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` when the persisted options disagree with
    /// the caller's, `CoreError::Io` when the files are missing, and
    /// `CoreError::InvariantViolation` when the graph file fails its header
    /// checks.
    pub fn open(options: IndexOptions, dir: impl Into<PathBuf>) -> CoreResult<Self> {
        options.validate()?;
        let dir = dir.into();

        let meta_path = dir.join(format!("{}.meta", options.name));
        let meta: MetaFile = serde_json::from_reader(BufReader::new(File::open(&meta_path)?))
            .map_err(|e| CoreError::config(format!("unreadable meta sidecar: {e}")))?;
        if meta.options.dimension != options.dimension
            || meta.options.metric != options.metric
            || meta.options.max_edges != options.max_edges
            || meta.options.compression != options.compression
        {
            return Err(CoreError::config(format!(
                "stored options for `{}` disagree with the requested ones",
                options.name
            )));
        }

        let (codec, codes) = read_pq_sidecar(
            &dir.join(format!("{}.pq", options.name)),
            &meta.options,
            meta.vertex_count,
        )?;
        let layout = PageLayout::new(
            meta.options.dimension as usize,
            meta.options.max_edges as usize,
        );
        let graph = DiskGraph::open_read_only(
            &dir.join(format!("{}.graph", options.name)),
            layout,
            meta.vertex_count,
            meta.medoid,
            meta.options.metric,
            Arc::new(codec),
            Arc::new(codes),
        )?;

        Ok(Self {
            options: meta.options,
            dir,
            state: State::Built {
                graph,
                stats: meta.stats,
            },
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// Path of the paged graph file.
    #[must_use]
    pub fn graph_path(&self) -> PathBuf {
        self.dir.join(format!("{}.graph", self.options.name))
    }

    /// Options the index was created with.
    #[must_use]
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Global id of the search entry point, once built over a non-empty
    /// reader.
    #[must_use]
    pub fn medoid(&self) -> Option<u32> {
        match &self.state {
            State::Built { graph, .. } => Some(graph.medoid()),
            _ => None,
        }
    }

    /// Build statistics, once built over a non-empty reader.
    #[must_use]
    pub fn stats(&self) -> Option<IndexStats> {
        match &self.state {
            State::Built { stats, .. } => Some(*stats),
            _ => None,
        }
    }

    /// Builds the index over `reader`, splitting the work across
    /// `partitions` partitions.
    ///
    /// An empty reader completes the build without creating any file.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` for a dimension mismatch or a
    /// non-positive partition count, `CoreError::Io` for file failures, and
    /// `CoreError::InvariantViolation` when the merge detects an id gap.
    pub fn build_index(&mut self, partitions: usize, reader: &dyn VectorReader) -> CoreResult<()> {
        let started = Instant::now();
        self.options.validate()?;
        if partitions == 0 {
            return Err(CoreError::config("partition count must be positive"));
        }
        if reader.dimensions() != self.options.dimension as usize {
            return Err(CoreError::config(format!(
                "reader dimension {} does not match index dimension {}",
                reader.dimensions(),
                self.options.dimension
            )));
        }

        let n = reader.size();
        if n == 0 {
            info!(name = %self.options.name, "empty reader; no index file written");
            self.state = State::EmptyBuilt;
            return Ok(());
        }

        let dimension = self.options.dimension as usize;
        let quantizers = self.options.quantizers() as usize;
        let max_edges = self.options.max_edges as usize;
        let mut rng = StdRng::seed_from_u64(self.options.seed);

        // Quantizer fit over a bounded training sample, then codes for
        // every vector.
        let codec = {
            let train_count = n.min(TRAINING_SAMPLE_CAP);
            let mut training = Vec::with_capacity(train_count * dimension);
            if train_count == n {
                for i in 0..n {
                    training.extend_from_slice(reader.read(i));
                }
            } else {
                for i in rand::seq::index::sample(&mut rng, n, train_count) {
                    training.extend_from_slice(reader.read(i));
                }
            }
            PqCodec::fit(
                &training,
                train_count,
                dimension,
                self.options.sub_vector_len() as usize,
                self.options.metric,
                &mut rng,
            )?
        };

        let mut codes = vec![0u8; n * quantizers];
        for i in 0..n {
            codec.encode_into(reader.read(i), &mut codes[i * quantizers..(i + 1) * quantizers]);
        }
        let tables = codec.distance_tables();

        // Global centroid in code space; its nearest vector seeds every
        // search.
        let global_code = pq::cluster_codes(&codes, n, quantizers, &tables, 1, &mut rng)
            .pop()
            .expect("single-cluster run always yields a centroid");
        let center = codec.decode(&global_code);
        let mut center_table = Vec::new();
        codec.lookup_table_into(&center, &mut center_table);
        let mut medoid = 0u32;
        let mut medoid_dist = f32::INFINITY;
        for gid in 0..n {
            let est = pq::estimate(
                &codes[gid * quantizers..(gid + 1) * quantizers],
                &center_table,
            );
            if est < medoid_dist {
                medoid_dist = est;
                medoid = gid as u32;
            }
        }
        debug!(medoid, "selected global medoid");

        // Every vector joins its two PQ-nearest partitions.
        let effective = partitions.min(n);
        let centroid_codes = if effective > 1 {
            pq::cluster_codes(&codes, n, quantizers, &tables, effective, &mut rng)
        } else {
            Vec::new()
        };
        let mut members: Vec<Vec<u32>> = vec![Vec::new(); effective];
        for gid in 0..n {
            let code = &codes[gid * quantizers..(gid + 1) * quantizers];
            let (p1, p2) = if effective > 1 {
                pq::two_nearest(code, &centroid_codes, &tables)
            } else {
                (0, 0)
            };
            members[p1].push(gid as u32);
            if p1 != p2 {
                members[p2].push(gid as u32);
            } else if effective > 1 {
                return Err(CoreError::invariant(format!(
                    "partition assignment produced a single partition for vertex {gid}"
                )));
            }
        }

        let codec = Arc::new(codec);
        let codes = Arc::new(codes);
        let layout = PageLayout::new(dimension, max_edges);
        let path = self.graph_path();
        if path.exists() {
            warn!(path = %path.display(), "replacing existing index file");
        }
        let mut disk = DiskGraph::create(
            &path,
            layout,
            n as u32,
            self.options.metric,
            codec.clone(),
            codes.clone(),
        )?;
        disk.set_medoid(medoid);

        let threads = std::thread::available_parallelism()
            .map(|t| t.get())
            .unwrap_or(1);
        let mut parts = Vec::new();
        for (pidx, ids) in members.iter().enumerate() {
            if ids.is_empty() {
                continue;
            }
            let mut part = PartitionGraph::new(
                &self.dir,
                &self.options.name,
                ids.len(),
                dimension,
                max_edges,
                self.options.beam_width as usize,
                self.options.alpha,
                self.options.metric,
            )?;
            for &gid in ids {
                part.push_vertex(gid, reader.read(gid as usize));
            }
            part.generate_random_edges(&mut rng);
            part.build(threads, rng.gen());
            part.save_vectors_to_disk(&mut disk)?;
            part.convert_local_edges_to_global();
            part.sort_edges_by_global_index();
            info!(partition = pidx, size = ids.len(), "partition ready for merge");
            parts.push(part);
        }

        let summary = merge::merge_partitions(&parts, &mut disk, max_edges, &mut rng)?;
        drop(parts);

        let stats = IndexStats {
            vertices: n as u32,
            max_degree: summary.max_degree,
            avg_degree: summary.total_edges as f64 / n as f64,
            build_millis: started.elapsed().as_millis() as u64,
        };
        self.write_sidecars(&codec, &codes, n as u32, medoid, &stats)?;

        info!(
            name = %self.options.name,
            vertices = n,
            max_degree = stats.max_degree,
            avg_degree = stats.avg_degree,
            millis = stats.build_millis,
            "index build complete"
        );
        self.state = State::Built { graph: disk, stats };
        Ok(())
    }

    /// Top-`k` nearest global ids for `query`, ascending by distance.
    ///
    /// At most `min(k, vertex_count)` ids are returned; an index built over
    /// an empty reader yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` when the index was never built or the
    /// query dimension is wrong.
    pub fn nearest(&self, query: &[f32], k: usize) -> CoreResult<Vec<u32>> {
        if query.len() != self.options.dimension as usize {
            return Err(CoreError::not_found(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.options.dimension
            )));
        }
        match &self.state {
            State::Unbuilt => Err(CoreError::not_found("index was not built")),
            State::EmptyBuilt => Ok(Vec::new()),
            State::Built { graph, .. } => {
                let mut ctx = self
                    .contexts
                    .lock()
                    .pop()
                    .unwrap_or_else(|| SearchContext::new(self.options.beam_width as usize));
                let out = graph.search(query, k, &mut ctx);
                self.contexts.lock().push(ctx);
                Ok(out)
            }
        }
    }

    /// Average relative error (percent) of PQ estimates against precise
    /// re-scores observed during searches.
    #[must_use]
    pub fn pq_error_avg(&self) -> f32 {
        match &self.state {
            State::Built { graph, .. } => graph.pq_error_avg(),
            _ => 0.0,
        }
    }

    /// Clears the PQ estimate error accumulator.
    pub fn reset_pq_error_stats(&self) {
        if let State::Built { graph, .. } = &self.state {
            graph.reset_pq_error_stats();
        }
    }

    /// Walks every record and checks the structural graph invariants.
    ///
    /// # Errors
    ///
    /// Propagates the first `InvariantViolation` found; `NotFound` when the
    /// index was never built.
    pub fn validate(&self) -> CoreResult<()> {
        match &self.state {
            State::Unbuilt => Err(CoreError::not_found("index was not built")),
            State::EmptyBuilt => Ok(()),
            State::Built { graph, .. } => graph.validate(),
        }
    }

    /// Flushes and drops the index handle.
    ///
    /// # Errors
    ///
    /// Propagates flush failures of a freshly built (writable) mapping.
    pub fn close(self) -> CoreResult<()> {
        if let State::Built { graph, .. } = &self.state {
            graph.flush()?;
        }
        Ok(())
    }

    fn write_sidecars(
        &self,
        codec: &PqCodec,
        codes: &[u8],
        vertex_count: u32,
        medoid: u32,
        stats: &IndexStats,
    ) -> CoreResult<()> {
        let meta = MetaFile {
            options: self.options.clone(),
            vertex_count,
            medoid,
            stats: *stats,
        };
        let meta_path = self.dir.join(format!("{}.meta", self.options.name));
        serde_json::to_writer_pretty(BufWriter::new(File::create(meta_path)?), &meta)
            .map_err(|e| CoreError::config(format!("meta sidecar write failed: {e}")))?;

        let pq_path = self.dir.join(format!("{}.pq", self.options.name));
        let mut out = BufWriter::new(File::create(pq_path)?);
        out.write_all(&(codec.quantizers() as u32).to_ne_bytes())?;
        out.write_all(&(codec.sub_len() as u32).to_ne_bytes())?;
        for &value in codec.codebooks() {
            out.write_all(&value.to_ne_bytes())?;
        }
        out.write_all(codes)?;
        out.flush()?;
        Ok(())
    }
}

/// Loads the codebooks and per-vertex codes persisted by `write_sidecars`.
fn read_pq_sidecar(
    path: &Path,
    options: &IndexOptions,
    vertex_count: u32,
) -> CoreResult<(PqCodec, Vec<u8>)> {
    let mut input = BufReader::new(File::open(path)?);
    let mut word = [0u8; 4];
    input.read_exact(&mut word)?;
    let quantizers = u32::from_ne_bytes(word) as usize;
    input.read_exact(&mut word)?;
    let sub_len = u32::from_ne_bytes(word) as usize;
    if quantizers != options.quantizers() as usize || sub_len != options.sub_vector_len() as usize
    {
        return Err(CoreError::config(format!(
            "pq sidecar shape {}x{} does not match options",
            quantizers, sub_len
        )));
    }

    let mut codebooks = vec![0.0f32; quantizers * pq::CODEBOOK_SIZE * sub_len];
    for value in &mut codebooks {
        input.read_exact(&mut word)?;
        *value = f32::from_ne_bytes(word);
    }
    let mut codes = vec![0u8; vertex_count as usize * quantizers];
    input.read_exact(&mut codes)?;

    let codec = PqCodec::from_parts(
        options.dimension as usize,
        sub_len,
        options.metric,
        codebooks,
    )?;
    Ok((codec, codes))
}
