//! Paged on-disk graph and the beam search that runs against it.
//!
//! # File format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Page 0..page_count                                       │
//! ├──────────────────────────────────────────────────────────┤
//! │ 0..3  : u32 total vertex count N (repeated on every page)│
//! │ 4..   : packed records of record_size bytes              │
//! │         { vector: [f32; D], edges: [i32; M], degree: u8 }│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Vertex `g` lives on page `g / per_page`, slot `g % per_page`; record
//! offsets are stable and computable in O(1). Values are stored in the
//! machine's native byte order, so the file is not portable across
//! architectures with different endianness.
//!
//! Queries walk the graph best-first: candidates enter the frontier with a
//! cheap PQ-estimated distance and are promoted to precise distances (read
//! from the map, four at a time) before they are allowed to be expanded.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;
use tracing::debug;

use quiver_core::{CoreError, CoreResult, DistanceKind};

use crate::distance;
use crate::pq::{self, PqCodec};
use crate::queue::CandidateQueue;

/// Bytes reserved at the start of every page for the vertex-count stamp.
const PAGE_HEADER: usize = 4;

/// Smallest page size used; raised for records that would not fit.
const MIN_PAGE_SIZE: usize = 64 * 1024;

/// Geometry of the paged record file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    dimension: usize,
    max_edges: usize,
    record_size: usize,
    page_size: usize,
    per_page: usize,
}

impl PageLayout {
    /// Computes the layout for the given vector dimension and degree cap.
    ///
    /// Records are padded to 4-byte alignment (the common alignment of the
    /// vector and edge elements) so every field slice inside the map stays
    /// aligned. The page size grows in 4 KiB steps when a single record
    /// would not fit the minimum page.
    #[must_use]
    pub fn new(dimension: usize, max_edges: usize) -> Self {
        let raw = dimension * 4 + max_edges * 4 + 1;
        let record_size = (raw + 3) & !3;
        let mut page_size = MIN_PAGE_SIZE;
        if page_size < record_size + PAGE_HEADER {
            page_size = (record_size + PAGE_HEADER + 4095) & !4095;
        }
        let per_page = (page_size - PAGE_HEADER) / record_size;
        Self {
            dimension,
            max_edges,
            record_size,
            page_size,
            per_page,
        }
    }

    /// Vertex records per page.
    #[must_use]
    pub fn per_page(&self) -> usize {
        self.per_page
    }

    /// Aligned record size in bytes.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Number of pages required for `n` vertices.
    #[must_use]
    pub fn page_count(&self, n: usize) -> usize {
        n.div_ceil(self.per_page)
    }

    /// Total file size for `n` vertices.
    #[must_use]
    pub fn file_size(&self, n: usize) -> usize {
        self.page_count(n) * self.page_size
    }

    /// Byte offset of vertex `gid`'s record.
    #[inline]
    fn record_offset(&self, gid: u32) -> usize {
        let page = gid as usize / self.per_page;
        let slot = gid as usize % self.per_page;
        page * self.page_size + PAGE_HEADER + slot * self.record_size
    }
}

/// Accumulated precise-vs-estimate divergence, in percent.
#[derive(Debug, Default)]
struct PqErrorStats {
    recalculated: u64,
    error_sum: f64,
}

enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::ReadWrite(map) => map,
            Mapping::ReadOnly(map) => map,
        }
    }

    fn bytes_mut(&mut self) -> CoreResult<&mut [u8]> {
        match self {
            Mapping::ReadWrite(map) => Ok(map),
            Mapping::ReadOnly(_) => Err(CoreError::invariant(
                "attempted to mutate a read-only graph mapping",
            )),
        }
    }
}

/// Memory-mapped paged graph file serving beam search.
pub struct DiskGraph {
    layout: PageLayout,
    mapping: Mapping,
    path: PathBuf,
    vertex_count: u32,
    medoid: u32,
    kind: DistanceKind,
    codec: Arc<PqCodec>,
    /// `vertex_count * quantizers` code bytes, by vertex then quantizer.
    codes: Arc<Vec<u8>>,
    pq_stats: Mutex<PqErrorStats>,
}

impl DiskGraph {
    /// Creates the paged file read-write, sized for `n` vertices, with the
    /// vertex count stamped into every page header.
    ///
    /// An existing file at `path` is replaced.
    pub fn create(
        path: &Path,
        layout: PageLayout,
        n: u32,
        kind: DistanceKind,
        codec: Arc<PqCodec>,
        codes: Arc<Vec<u8>>,
    ) -> CoreResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(layout.file_size(n as usize) as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        for page in 0..layout.page_count(n as usize) {
            let start = page * layout.page_size;
            map[start..start + PAGE_HEADER].copy_from_slice(&n.to_ne_bytes());
        }

        debug!(
            path = %path.display(),
            vertices = n,
            pages = layout.page_count(n as usize),
            per_page = layout.per_page,
            "created paged graph file"
        );
        Ok(Self {
            layout,
            mapping: Mapping::ReadWrite(map),
            path: path.to_path_buf(),
            vertex_count: n,
            medoid: 0,
            kind,
            codec,
            codes,
            pq_stats: Mutex::new(PqErrorStats::default()),
        })
    }

    /// Maps an existing paged file read-only for query-only use.
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` when the file size or any page
    /// header disagrees with the expected vertex count.
    pub fn open_read_only(
        path: &Path,
        layout: PageLayout,
        n: u32,
        medoid: u32,
        kind: DistanceKind,
        codec: Arc<PqCodec>,
        codes: Arc<Vec<u8>>,
    ) -> CoreResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() != layout.file_size(n as usize) {
            return Err(CoreError::invariant(format!(
                "graph file holds {} bytes, expected {} for {} vertices",
                map.len(),
                layout.file_size(n as usize),
                n
            )));
        }
        for page in 0..layout.page_count(n as usize) {
            let start = page * layout.page_size;
            let stamp = u32::from_ne_bytes(map[start..start + PAGE_HEADER].try_into().unwrap());
            if stamp != n {
                return Err(CoreError::invariant(format!(
                    "page {} header stores {} vertices, expected {}",
                    page, stamp, n
                )));
            }
        }
        Ok(Self {
            layout,
            mapping: Mapping::ReadOnly(map),
            path: path.to_path_buf(),
            vertex_count: n,
            medoid,
            kind,
            codec,
            codes,
            pq_stats: Mutex::new(PqErrorStats::default()),
        })
    }

    /// Total vertex count.
    #[must_use]
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Search entry point.
    #[must_use]
    pub fn medoid(&self) -> u32 {
        self.medoid
    }

    /// Sets the search entry point (chosen by the orchestrator).
    pub fn set_medoid(&mut self, medoid: u32) {
        self.medoid = medoid;
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page layout of the backing file.
    #[must_use]
    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    /// Borrows vertex `gid`'s full-precision vector from the map.
    #[must_use]
    pub fn vector(&self, gid: u32) -> &[f32] {
        debug_assert!(gid < self.vertex_count);
        let off = self.layout.record_offset(gid);
        let bytes = self.mapping.bytes();
        // Records start 4-aligned (4-byte header, 4-aligned record size).
        unsafe {
            std::slice::from_raw_parts(
                bytes.as_ptr().add(off) as *const f32,
                self.layout.dimension,
            )
        }
    }

    /// Borrows vertex `gid`'s adjacency: degree plus the full edge array
    /// (only the first `degree` entries are meaningful).
    #[must_use]
    pub fn edges(&self, gid: u32) -> (usize, &[i32]) {
        debug_assert!(gid < self.vertex_count);
        let off = self.layout.record_offset(gid) + self.layout.dimension * 4;
        let bytes = self.mapping.bytes();
        let degree = bytes[off + self.layout.max_edges * 4] as usize;
        let edges = unsafe {
            std::slice::from_raw_parts(bytes.as_ptr().add(off) as *const i32, self.layout.max_edges)
        };
        (degree.min(self.layout.max_edges), edges)
    }

    /// Copies a vector into its record slot, skipping the write when the
    /// destination already holds the same bytes (vertices shared by two
    /// partitions are saved twice).
    pub fn store_vector(&mut self, gid: u32, vector: &[f32]) -> CoreResult<()> {
        debug_assert_eq!(vector.len(), self.layout.dimension);
        let off = self.layout.record_offset(gid);
        let dimension = self.layout.dimension;
        let bytes = self.mapping.bytes_mut()?;
        let dst = unsafe {
            std::slice::from_raw_parts_mut(bytes.as_mut_ptr().add(off) as *mut f32, dimension)
        };
        if dst[..] != vector[..] {
            dst.copy_from_slice(vector);
        }
        Ok(())
    }

    /// Writes vertex `gid`'s adjacency record: the degree byte and exactly
    /// `edges.len()` edge slots; remaining slots are left as-is and never
    /// read.
    pub fn store_edges(&mut self, gid: u32, edges: &[i32]) -> CoreResult<()> {
        debug_assert!(edges.len() <= self.layout.max_edges);
        let off = self.layout.record_offset(gid) + self.layout.dimension * 4;
        let degree_off = off + self.layout.max_edges * 4;
        let bytes = self.mapping.bytes_mut()?;
        let dst = unsafe {
            std::slice::from_raw_parts_mut(bytes.as_mut_ptr().add(off) as *mut i32, edges.len())
        };
        dst.copy_from_slice(edges);
        bytes[degree_off] = edges.len() as u8;
        Ok(())
    }

    /// Flushes a writable mapping to disk. No-op for read-only maps.
    pub fn flush(&self) -> CoreResult<()> {
        if let Mapping::ReadWrite(map) = &self.mapping {
            map.flush()?;
        }
        Ok(())
    }

    /// Checks the structural invariants of every record.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` naming the first offense: a page header
    /// disagreeing with the vertex count, degree above the cap, neighbor
    /// out of range, self-loop or duplicate neighbor.
    pub fn validate(&self) -> CoreResult<()> {
        let bytes = self.mapping.bytes();
        for page in 0..self.layout.page_count(self.vertex_count as usize) {
            let start = page * self.layout.page_size;
            let stamp = u32::from_ne_bytes(bytes[start..start + PAGE_HEADER].try_into().unwrap());
            if stamp != self.vertex_count {
                return Err(CoreError::invariant(format!(
                    "page {} header stores {} vertices, expected {}",
                    page, stamp, self.vertex_count
                )));
            }
        }

        let mut seen = HashSet::new();
        for gid in 0..self.vertex_count {
            let (degree, edges) = self.edges(gid);
            if degree > self.layout.max_edges {
                return Err(CoreError::invariant(format!(
                    "vertex {} has degree {} above cap {}",
                    gid, degree, self.layout.max_edges
                )));
            }
            seen.clear();
            for &edge in &edges[..degree] {
                if edge < 0 || edge as u32 >= self.vertex_count {
                    return Err(CoreError::invariant(format!(
                        "vertex {} has out-of-range neighbor {}",
                        gid, edge
                    )));
                }
                if edge as u32 == gid {
                    return Err(CoreError::invariant(format!("vertex {} has a self-loop", gid)));
                }
                if !seen.insert(edge) {
                    return Err(CoreError::invariant(format!(
                        "vertex {} lists neighbor {} twice",
                        gid, edge
                    )));
                }
            }
        }
        Ok(())
    }

    /// Average relative error (percent) of PQ estimates observed since the
    /// last reset.
    #[must_use]
    pub fn pq_error_avg(&self) -> f32 {
        let stats = self.pq_stats.lock();
        if stats.recalculated == 0 {
            0.0
        } else {
            (stats.error_sum / stats.recalculated as f64) as f32
        }
    }

    /// Clears the PQ error accumulator.
    pub fn reset_pq_error_stats(&self) {
        let mut stats = self.pq_stats.lock();
        stats.recalculated = 0;
        stats.error_sum = 0.0;
    }

    /// Best-first beam search for the `k` nearest vertices to `query`.
    ///
    /// Frontier admissions use PQ-estimated distances; before a candidate
    /// may be expanded its distance is re-scored precisely from the mapped
    /// vector, four candidates at a time. Returns ids in ascending distance
    /// order, at most `min(k, vertex_count)` of them.
    pub fn search(&self, query: &[f32], k: usize, ctx: &mut SearchContext) -> Vec<u32> {
        let mut out = Vec::new();
        if self.vertex_count == 0 || k == 0 {
            return out;
        }

        ctx.reset();
        let seed = self.medoid;
        let seed_dist = distance::distance(self.kind, query, self.vector(seed));
        ctx.queue.push(seed, seed_dist, false);
        ctx.visited.insert(seed);
        let mut table_ready = false;

        loop {
            // Select the next vertex to expand: pull unchecked candidates,
            // re-scoring PQ-estimated ones in batches of up to four.
            let expand_idx = 'select: loop {
                let mut batch_len = 0usize;
                let mut non_pq = None;
                while batch_len < 4 {
                    match ctx.queue.next_not_checked() {
                        Some(idx) if ctx.queue.is_pq_estimate(idx) => {
                            ctx.batch[batch_len] = idx;
                            batch_len += 1;
                        }
                        Some(idx) => {
                            non_pq = Some(idx);
                            break;
                        }
                        None => break,
                    }
                }
                if batch_len > 0 {
                    if let Some(idx) = non_pq {
                        // Positions shift during the re-sorts below; give the
                        // entry back so the cursor revisits it afterwards.
                        ctx.queue.unmark(idx);
                    }
                    self.rescore_batch(query, ctx, batch_len);
                    continue 'select;
                }
                match non_pq {
                    Some(idx) => break 'select Some(idx),
                    None => break 'select None,
                }
            };
            let Some(expand_idx) = expand_idx else {
                break;
            };

            let vertex = ctx.queue.id(expand_idx);
            if !table_ready {
                self.codec.lookup_table_into(query, &mut ctx.table);
                table_ready = true;
            }

            let quantizers = self.codec.quantizers();
            let (degree, edges) = self.edges(vertex);
            for &edge in &edges[..degree] {
                let neighbor = edge as u32;
                if !ctx.visited.insert(neighbor) {
                    continue;
                }
                let code = &self.codes
                    [neighbor as usize * quantizers..(neighbor as usize + 1) * quantizers];
                let estimate = pq::estimate(code, &ctx.table);
                if ctx.queue.accepts(estimate) {
                    ctx.queue.push(neighbor, estimate, true);
                }
            }
        }

        ctx.queue.top_ids(k, &mut out);
        out
    }

    /// Re-scores `batch_len` PQ-estimated queue entries with precise
    /// distances read from the map and re-inserts each at its new position,
    /// keeping the remaining batch indices consistent.
    fn rescore_batch(&self, query: &[f32], ctx: &mut SearchContext, batch_len: usize) {
        let ids: [u32; 4] = std::array::from_fn(|j| {
            if j < batch_len {
                ctx.queue.id(ctx.batch[j])
            } else {
                ctx.queue.id(ctx.batch[0])
            }
        });

        if batch_len == 4 {
            ctx.dist4 = distance::distance_batch4(
                self.kind,
                query,
                self.vector(ids[0]),
                self.vector(ids[1]),
                self.vector(ids[2]),
                self.vector(ids[3]),
            );
        } else {
            for j in 0..batch_len {
                ctx.dist4[j] = distance::distance(self.kind, query, self.vector(ids[j]));
            }
        }

        {
            let mut stats = self.pq_stats.lock();
            for j in 0..batch_len {
                let precise = ctx.dist4[j];
                if precise != 0.0 {
                    let estimate = ctx.queue.dist(ctx.batch[j]);
                    stats.recalculated += 1;
                    stats.error_sum += (100.0 * (precise - estimate).abs() / precise) as f64;
                }
            }
        }

        for j in 0..batch_len {
            let idx = ctx.batch[j];
            let new_idx = ctx.queue.resort(idx, ctx.dist4[j]);
            // Removal shifts later entries down; insertion shifts entries at
            // or past the new position up.
            for l in (j + 1)..batch_len {
                let mut b = ctx.batch[l];
                if b > idx {
                    b -= 1;
                }
                if b >= new_idx {
                    b += 1;
                }
                ctx.batch[l] = b;
            }
        }
    }
}

/// Per-thread scratch for beam search: visited set, PQ lookup table,
/// candidate queue and the 4-slot re-scoring buffers.
///
/// A context must not be shared across threads concurrently; it is reset at
/// the start of every search.
pub struct SearchContext {
    visited: HashSet<u32>,
    table: Vec<f32>,
    queue: CandidateQueue,
    batch: [usize; 4],
    dist4: [f32; 4],
}

impl SearchContext {
    /// Creates scratch for searches with frontier capacity `beam_width`.
    #[must_use]
    pub fn new(beam_width: usize) -> Self {
        Self {
            visited: HashSet::new(),
            table: Vec::new(),
            queue: CandidateQueue::new(beam_width),
            batch: [0; 4],
            dist4: [0.0; 4],
        }
    }

    fn reset(&mut self) {
        self.visited.clear();
        self.table.clear();
        self.queue.clear();
    }
}
