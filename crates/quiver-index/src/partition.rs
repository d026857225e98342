//! Per-partition in-memory Vamana construction.
//!
//! Each partition holds full-precision copies of its member vectors in
//! process memory plus two mmap-backed scratch arrays: the adjacency rows
//! and the local-to-global id map. Construction proceeds in phases:
//!
//! 1. random seeding of every adjacency row
//! 2. a parallel pass where every vertex is re-linked through a greedy
//!    candidate harvest followed by a robust prune, with reverse edges
//!    routed to the worker that owns the target vertex
//! 3. vector hand-off into the paged file, edge conversion to global ids,
//!    and a permutation of the rows into global order for the merger
//!
//! Mutation of a vertex's row is guarded by a per-vertex version word:
//! odd means exclusively locked, and every completed mutation leaves the
//! version even and larger by two. Readers follow the seqlock pattern and
//! retry when the version moved underneath them.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use memmap2::MmapMut;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use quiver_core::{CoreResult, DistanceKind};

use crate::disk::DiskGraph;
use crate::distance;
use crate::queue::CandidateQueue;

/// Disambiguates scratch files created within the same nanosecond.
static SCRATCH_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Mmap-backed scratch array deleted when the partition is dropped.
struct ScratchFile {
    ptr: *mut u8,
    _map: MmapMut,
    path: PathBuf,
}

// The raw pointer targets a private mapping whose concurrent accesses are
// serialized by the per-vertex version protocol in `PartitionGraph`.
unsafe impl Send for ScratchFile {}
unsafe impl Sync for ScratchFile {}

impl ScratchFile {
    fn create(path: PathBuf, len: usize) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(len as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            ptr,
            _map: map,
            path,
        })
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Reusable per-worker buffers for the build phase.
pub(crate) struct BuildScratch {
    queue: CandidateQueue,
    visited: std::collections::HashSet<u32>,
    checked: Vec<(u32, f32)>,
    neighbors: Vec<u32>,
    unseen: Vec<u32>,
    cands: Vec<(u32, f32)>,
    removed: Vec<(u32, f32)>,
    keep: Vec<(u32, f32)>,
    targets: Vec<u32>,
}

impl BuildScratch {
    pub(crate) fn new(beam_width: usize) -> Self {
        Self {
            queue: CandidateQueue::new(beam_width),
            visited: std::collections::HashSet::new(),
            checked: Vec::new(),
            neighbors: Vec::new(),
            unseen: Vec::new(),
            cands: Vec::new(),
            removed: Vec::new(),
            keep: Vec::new(),
            targets: Vec::new(),
        }
    }
}

/// One partition's mutable graph during construction.
pub struct PartitionGraph {
    size: usize,
    dimension: usize,
    max_edges: usize,
    beam_width: usize,
    alpha: f32,
    kind: DistanceKind,
    /// Full-precision member vectors; released by `save_vectors_to_disk`.
    vectors: Vec<f32>,
    loaded: usize,
    /// `size * (max_edges + 1)` i32 rows: slot 0 is the degree.
    edges: ScratchFile,
    /// `size` u32 global ids, by local id.
    globals: ScratchFile,
    versions: Vec<AtomicU64>,
    medoid: OnceLock<u32>,
}

impl PartitionGraph {
    /// Allocates the scratch files and the vector buffer for `size`
    /// vertices. Scratch files land next to the final index file and are
    /// deleted when the partition is dropped.
    pub fn new(
        dir: &Path,
        name: &str,
        size: usize,
        dimension: usize,
        max_edges: usize,
        beam_width: usize,
        alpha: f32,
        kind: DistanceKind,
    ) -> CoreResult<Self> {
        debug_assert!(size > 0);
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
            .wrapping_add(SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed) as u128);
        let stem = format!("{}-{}{}", name, std::process::id(), stamp);

        let edges = ScratchFile::create(
            dir.join(format!("{stem}.edges")),
            size * (max_edges + 1) * 4,
        )?;
        let globals = ScratchFile::create(dir.join(format!("{stem}.globalIndexes")), size * 4)?;

        let mut versions = Vec::with_capacity(size);
        versions.resize_with(size, || AtomicU64::new(0));

        Ok(Self {
            size,
            dimension,
            max_edges,
            beam_width,
            alpha,
            kind,
            vectors: Vec::with_capacity(size * dimension),
            loaded: 0,
            edges,
            globals,
            versions,
            medoid: OnceLock::new(),
        })
    }

    /// Number of vertices held locally.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Appends the next member vertex during the load phase.
    pub fn push_vertex(&mut self, gid: u32, vector: &[f32]) {
        debug_assert!(self.loaded < self.size);
        debug_assert_eq!(vector.len(), self.dimension);
        unsafe {
            self.globals
                .ptr
                .cast::<u32>()
                .add(self.loaded)
                .write(gid);
        }
        self.vectors.extend_from_slice(vector);
        self.loaded += 1;
    }

    /// Global id of the vertex at `local`.
    #[must_use]
    pub fn global_at(&self, local: u32) -> u32 {
        debug_assert!((local as usize) < self.size);
        unsafe { self.globals.ptr.cast::<u32>().add(local as usize).read() }
    }

    fn vector(&self, local: u32) -> &[f32] {
        let start = local as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    fn row_ptr(&self, local: u32) -> *mut i32 {
        debug_assert!((local as usize) < self.size);
        unsafe {
            self.edges
                .ptr
                .cast::<i32>()
                .add(local as usize * (self.max_edges + 1))
        }
    }

    // ------------------------------------------------------------------
    // Per-vertex locking (version seqlock)
    // ------------------------------------------------------------------

    /// Locks vertex `local` for exclusive mutation.
    ///
    /// Every vertex has exactly one owning mutator thread, so an odd
    /// version here means a re-entrant acquire, which is a bug.
    fn acquire(&self, local: u32) {
        let version = self.versions[local as usize].load(Ordering::Acquire);
        assert!(
            version % 2 == 0,
            "vertex {} acquired while already locked",
            local
        );
        self.versions[local as usize]
            .compare_exchange(version, version + 1, Ordering::AcqRel, Ordering::Acquire)
            .unwrap_or_else(|_| panic!("vertex {} lock CAS lost to a second mutator", local));
    }

    /// Unlocks vertex `local`, leaving the version even and +2 overall.
    fn release(&self, local: u32) {
        let version = self.versions[local as usize].load(Ordering::Relaxed);
        debug_assert_eq!(version % 2, 1, "release of an unlocked vertex");
        self.versions[local as usize].store(version + 1, Ordering::Release);
    }

    /// Snapshots vertex `local`'s neighbor list into `out`.
    ///
    /// Seqlock read: sample the version, copy the row, resample; retry when
    /// the row was locked or moved underneath the copy.
    pub(crate) fn fetch_neighbors(&self, local: u32, out: &mut Vec<u32>) {
        let version = &self.versions[local as usize];
        loop {
            let before = version.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            out.clear();
            unsafe {
                let row = self.row_ptr(local);
                let degree = (row.read_volatile().max(0) as usize).min(self.max_edges);
                for slot in 0..degree {
                    out.push(row.add(1 + slot).read_volatile() as u32);
                }
            }
            fence(Ordering::Acquire);
            if version.load(Ordering::Relaxed) == before {
                return;
            }
        }
    }

    /// Reads the degree and neighbors of a vertex the caller holds locked.
    fn read_row_locked(&self, local: u32, out: &mut Vec<u32>) {
        out.clear();
        unsafe {
            let row = self.row_ptr(local);
            let degree = (row.read_volatile().max(0) as usize).min(self.max_edges);
            for slot in 0..degree {
                out.push(row.add(1 + slot).read_volatile() as u32);
            }
        }
    }

    /// Replaces the adjacency of a vertex the caller holds locked.
    pub(crate) fn write_row_locked(&self, local: u32, neighbors: &[u32]) {
        debug_assert!(neighbors.len() <= self.max_edges);
        unsafe {
            let row = self.row_ptr(local);
            for (slot, &n) in neighbors.iter().enumerate() {
                row.add(1 + slot).write_volatile(n as i32);
            }
            row.write_volatile(neighbors.len() as i32);
        }
    }

    /// Appends one neighbor to a vertex the caller holds locked.
    fn append_row_locked(&self, local: u32, neighbor: u32) {
        unsafe {
            let row = self.row_ptr(local);
            let degree = row.read_volatile() as usize;
            debug_assert!(degree < self.max_edges);
            row.add(1 + degree).write_volatile(neighbor as i32);
            row.write_volatile(degree as i32 + 1);
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Seeds every vertex with `min(size - 1, max_edges)` distinct random
    /// neighbors drawn from a shuffled permutation, refreshed when
    /// exhausted.
    pub fn generate_random_edges(&mut self, rng: &mut StdRng) {
        debug_assert_eq!(self.loaded, self.size);
        let wanted = self.max_edges.min(self.size.saturating_sub(1));
        let mut perm: Vec<u32> = (0..self.size as u32).collect();
        perm.shuffle(rng);
        let mut pos = 0usize;
        let mut chosen: Vec<u32> = Vec::with_capacity(wanted);

        for v in 0..self.size as u32 {
            chosen.clear();
            while chosen.len() < wanted {
                if pos == perm.len() {
                    perm.shuffle(rng);
                    pos = 0;
                }
                let candidate = perm[pos];
                pos += 1;
                if candidate != v && !chosen.contains(&candidate) {
                    chosen.push(candidate);
                }
            }
            self.write_row_locked(v, &chosen);
        }
    }

    /// Mean-vector medoid of the partition, computed once on first use.
    pub fn medoid(&self) -> u32 {
        *self.medoid.get_or_init(|| {
            let mut mean = vec![0.0f32; self.dimension];
            for local in 0..self.size as u32 {
                for (m, x) in mean.iter_mut().zip(self.vector(local)) {
                    *m += *x;
                }
            }
            let inv = 1.0 / self.size as f32;
            mean.iter_mut().for_each(|m| *m *= inv);

            let mut best = 0u32;
            let mut best_dist = f32::INFINITY;
            for local in 0..self.size as u32 {
                let dist = distance::distance(self.kind, &mean, self.vector(local));
                if dist < best_dist {
                    best_dist = dist;
                    best = local;
                }
            }
            best
        })
    }

    /// Greedy best-first walk from the medoid toward `v` using precise
    /// in-memory distances, harvesting every expanded vertex.
    fn greedy_search_prune(&self, v: u32, scratch: &mut BuildScratch) {
        scratch.queue.clear();
        scratch.visited.clear();
        scratch.checked.clear();
        scratch.visited.insert(v);

        let medoid = self.medoid();
        if medoid != v {
            let dist = distance::distance(self.kind, self.vector(v), self.vector(medoid));
            scratch.queue.push(medoid, dist, false);
            scratch.visited.insert(medoid);
        } else {
            // The walk starts at v itself; seed from its current neighbors.
            self.fetch_neighbors(v, &mut scratch.neighbors);
            let seeds = std::mem::take(&mut scratch.neighbors);
            for &seed in &seeds {
                if scratch.visited.insert(seed) {
                    let dist = distance::distance(self.kind, self.vector(v), self.vector(seed));
                    scratch.queue.push(seed, dist, false);
                }
            }
            scratch.neighbors = seeds;
        }

        while let Some(idx) = scratch.queue.next_not_checked() {
            let current = scratch.queue.id(idx);
            scratch.checked.push((current, scratch.queue.dist(idx)));

            self.fetch_neighbors(current, &mut scratch.neighbors);
            scratch.unseen.clear();
            for &n in &scratch.neighbors {
                if scratch.visited.insert(n) {
                    scratch.unseen.push(n);
                }
            }

            let query = self.vector(v);
            let mut i = 0;
            while i + 4 <= scratch.unseen.len() {
                let ids = [
                    scratch.unseen[i],
                    scratch.unseen[i + 1],
                    scratch.unseen[i + 2],
                    scratch.unseen[i + 3],
                ];
                let dists = distance::distance_batch4(
                    self.kind,
                    query,
                    self.vector(ids[0]),
                    self.vector(ids[1]),
                    self.vector(ids[2]),
                    self.vector(ids[3]),
                );
                for (id, dist) in ids.into_iter().zip(dists) {
                    if scratch.queue.accepts(dist) {
                        scratch.queue.push(id, dist, false);
                    }
                }
                i += 4;
            }
            for &id in &scratch.unseen[i..] {
                let dist = distance::distance(self.kind, query, self.vector(id));
                if scratch.queue.accepts(dist) {
                    scratch.queue.push(id, dist, false);
                }
            }
        }
    }

    /// Robust prune: selects at most `max_edges` neighbors for `v` that
    /// balance proximity against diversity, then installs them.
    ///
    /// `scratch.cands` carries the incoming candidates with distances to
    /// `v`, NaN marking "not yet measured". The surviving set is left in
    /// `scratch.keep`.
    fn robust_prune(&self, v: u32, scratch: &mut BuildScratch) {
        self.acquire(v);

        // Merge the current adjacency under the NaN sentinel.
        self.read_row_locked(v, &mut scratch.neighbors);
        for &u in &scratch.neighbors {
            if !scratch.cands.iter().any(|c| c.0 == u) {
                scratch.cands.push((u, f32::NAN));
            }
        }

        // Fill sentinels with precise distances, four at a time.
        scratch.unseen.clear();
        for (i, c) in scratch.cands.iter().enumerate() {
            if c.1.is_nan() {
                scratch.unseen.push(i as u32);
            }
        }
        let query = self.vector(v);
        let mut i = 0;
        while i + 4 <= scratch.unseen.len() {
            let slots = [
                scratch.unseen[i] as usize,
                scratch.unseen[i + 1] as usize,
                scratch.unseen[i + 2] as usize,
                scratch.unseen[i + 3] as usize,
            ];
            let dists = distance::distance_batch4(
                self.kind,
                query,
                self.vector(scratch.cands[slots[0]].0),
                self.vector(scratch.cands[slots[1]].0),
                self.vector(scratch.cands[slots[2]].0),
                self.vector(scratch.cands[slots[3]].0),
            );
            for (slot, dist) in slots.into_iter().zip(dists) {
                scratch.cands[slot].1 = dist;
            }
            i += 4;
        }
        for &slot in &scratch.unseen[i..] {
            let c = scratch.cands[slot as usize].0;
            scratch.cands[slot as usize].1 = distance::distance(self.kind, query, self.vector(c));
        }

        scratch
            .cands
            .sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        scratch.keep.clear();
        scratch.removed.clear();
        let mut current_alpha = 1.0f32;
        loop {
            while scratch.keep.len() < self.max_edges && !scratch.cands.is_empty() {
                let best = scratch.cands.remove(0);
                scratch.keep.push(best);
                if scratch.keep.len() == self.max_edges {
                    break;
                }
                let pivot = self.vector(best.0);
                let kind = self.kind;
                let removed = &mut scratch.removed;
                let vectors = &self.vectors;
                let dimension = self.dimension;
                scratch.cands.retain(|c| {
                    let start = c.0 as usize * dimension;
                    let to_pivot =
                        distance::distance(kind, pivot, &vectors[start..start + dimension]);
                    if to_pivot * current_alpha <= c.1 {
                        removed.push(*c);
                        false
                    } else {
                        true
                    }
                });
            }
            if scratch.keep.len() >= self.max_edges || scratch.removed.is_empty() {
                break;
            }
            current_alpha *= 1.2;
            if current_alpha > self.alpha {
                break;
            }
            scratch.cands.append(&mut scratch.removed);
            scratch
                .cands
                .sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        }

        scratch.keep.reverse();
        scratch.targets.clear();
        scratch.targets.extend(scratch.keep.iter().map(|c| c.0));
        self.write_row_locked(v, &scratch.targets);

        self.release(v);
    }

    /// Re-links vertex `v` and leaves its new neighbor set in
    /// `scratch.targets`.
    fn relink_vertex(&self, v: u32, scratch: &mut BuildScratch) {
        self.greedy_search_prune(v, scratch);
        scratch.cands.clear();
        scratch.cands.append(&mut scratch.checked);
        self.robust_prune(v, scratch);
    }

    /// Handles a reverse-edge request `(u, v)` on the worker owning `u`.
    fn apply_back_edge(&self, u: u32, v: u32, scratch: &mut BuildScratch) {
        if u == v {
            return;
        }
        self.acquire(u);
        self.read_row_locked(u, &mut scratch.neighbors);
        if scratch.neighbors.contains(&v) {
            self.release(u);
            return;
        }
        if scratch.neighbors.len() < self.max_edges {
            self.append_row_locked(u, v);
            self.release(u);
            return;
        }
        self.release(u);

        // Degree cap reached: re-select u's adjacency with v as a fresh
        // candidate.
        scratch.cands.clear();
        scratch.cands.push((v, f32::NAN));
        self.robust_prune(u, scratch);
    }

    /// Runs the parallel re-link pass over every vertex.
    ///
    /// Workers own vertices statically (`v mod T`); reverse-edge requests
    /// are routed to the owner's queue so each vertex has exactly one
    /// writer. A worker signals completion after exhausting its vertex
    /// list and exits once every worker has signalled and its own queue
    /// drained dry.
    pub fn build(&self, threads: usize, seed: u64) {
        let workers = threads.clamp(1, self.size);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<u32> = (0..self.size as u32).collect();
        order.shuffle(&mut rng);

        // Force the medoid before the workers race for it.
        let _ = self.medoid();

        let mut senders: Vec<Sender<(u32, u32)>> = Vec::with_capacity(workers);
        let mut receivers: Vec<Receiver<(u32, u32)>> = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let done = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for (worker, rx) in receivers.into_iter().enumerate() {
                let senders = senders.clone();
                let order = &order;
                let done = &done;
                scope.spawn(move || {
                    let mut scratch = BuildScratch::new(self.beam_width);
                    for &v in order
                        .iter()
                        .filter(|&&v| v as usize % workers == worker)
                    {
                        while let Ok((u, src)) = rx.try_recv() {
                            self.apply_back_edge(u, src, &mut scratch);
                        }
                        self.relink_vertex(v, &mut scratch);
                        let targets = std::mem::take(&mut scratch.targets);
                        for &u in &targets {
                            senders[u as usize % workers]
                                .send((u, v))
                                .expect("back-edge channel closed during build");
                        }
                        scratch.targets = targets;
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                    loop {
                        match rx.try_recv() {
                            Ok((u, src)) => self.apply_back_edge(u, src, &mut scratch),
                            Err(TryRecvError::Empty) => {
                                if done.load(Ordering::SeqCst) == workers {
                                    // All vertex lists are exhausted, so no
                                    // new requests can appear after this
                                    // final drain.
                                    while let Ok((u, src)) = rx.try_recv() {
                                        self.apply_back_edge(u, src, &mut scratch);
                                    }
                                    break;
                                }
                                std::thread::yield_now();
                            }
                            Err(TryRecvError::Disconnected) => break,
                        }
                    }
                });
            }
        });
        drop(senders);
        debug!(size = self.size, workers, "partition graph built");
    }

    // ------------------------------------------------------------------
    // Hand-off to the paged file
    // ------------------------------------------------------------------

    /// Copies every member vector into its final paged slot and releases
    /// the in-memory copies.
    pub fn save_vectors_to_disk(&mut self, disk: &mut DiskGraph) -> CoreResult<()> {
        debug_assert_eq!(self.loaded, self.size);
        for local in 0..self.size as u32 {
            let gid = self.global_at(local);
            let start = local as usize * self.dimension;
            disk.store_vector(gid, &self.vectors[start..start + self.dimension])?;
        }
        self.vectors = Vec::new();
        Ok(())
    }

    /// Rewrites every edge from a local id to its global id.
    pub fn convert_local_edges_to_global(&mut self) {
        for v in 0..self.size as u32 {
            unsafe {
                let row = self.row_ptr(v);
                let degree = row.read() as usize;
                for slot in 1..=degree {
                    let local = row.add(slot).read() as u32;
                    row.add(slot).write(self.global_at(local) as i32);
                }
            }
        }
    }

    /// Permutes vertex rows so local order matches ascending global order,
    /// using in-cycle row moves with a single row buffer.
    pub fn sort_edges_by_global_index(&mut self) {
        let row_len = self.max_edges + 1;
        let mut order: Vec<u32> = (0..self.size as u32).collect();
        order.sort_by_key(|&local| self.global_at(local));

        let mut placed = vec![false; self.size];
        let mut row_buf = vec![0i32; row_len];
        for start in 0..self.size {
            if placed[start] || order[start] as usize == start {
                placed[start] = true;
                continue;
            }
            // Rotate the cycle beginning at `start`: each position receives
            // the row that sorts into it.
            unsafe {
                let src = std::slice::from_raw_parts(self.row_ptr(start as u32), row_len);
                row_buf.copy_from_slice(src);
            }
            let gid_buf = self.global_at(start as u32);

            let mut dst = start;
            loop {
                let src = order[dst] as usize;
                placed[dst] = true;
                if src == start {
                    unsafe {
                        let dst_row =
                            std::slice::from_raw_parts_mut(self.row_ptr(dst as u32), row_len);
                        dst_row.copy_from_slice(&row_buf);
                        self.globals.ptr.cast::<u32>().add(dst).write(gid_buf);
                    }
                    break;
                }
                unsafe {
                    let src_row = std::slice::from_raw_parts(self.row_ptr(src as u32), row_len);
                    let dst_row =
                        std::slice::from_raw_parts_mut(self.row_ptr(dst as u32), row_len);
                    dst_row.copy_from_slice(src_row);
                    let gid = self.global_at(src as u32);
                    self.globals.ptr.cast::<u32>().add(dst).write(gid);
                }
                dst = src;
            }
        }
    }

    /// Copies the (global) neighbor ids of the vertex at `local` into
    /// `out`. Only valid after the hand-off phases.
    pub fn read_global_row(&self, local: u32, out: &mut Vec<i32>) {
        out.clear();
        unsafe {
            let row = self.row_ptr(local);
            let degree = (row.read().max(0) as usize).min(self.max_edges);
            for slot in 0..degree {
                out.push(row.add(1 + slot).read());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line_partition(dir: &Path, n: usize) -> PartitionGraph {
        let mut graph =
            PartitionGraph::new(dir, "test", n, 3, 3, 8, 1.2, DistanceKind::L2).unwrap();
        for i in 0..n {
            graph.push_vertex(i as u32, &[i as f32, 0.0, 0.0]);
        }
        graph
    }

    #[test]
    fn test_scratch_files_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _graph = line_partition(dir.path(), 4);
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_random_edges_degree_and_distinctness() {
        let dir = TempDir::new().unwrap();
        let mut graph = line_partition(dir.path(), 10);
        let mut rng = StdRng::seed_from_u64(1);
        graph.generate_random_edges(&mut rng);

        let mut neighbors = Vec::new();
        for v in 0..10u32 {
            graph.fetch_neighbors(v, &mut neighbors);
            assert_eq!(neighbors.len(), 3);
            assert!(!neighbors.contains(&v), "self-loop at {}", v);
            let mut sorted = neighbors.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), neighbors.len(), "duplicates at {}", v);
        }
    }

    #[test]
    fn test_medoid_of_line_is_center() {
        let dir = TempDir::new().unwrap();
        let graph = line_partition(dir.path(), 5);
        assert_eq!(graph.medoid(), 2);
    }

    #[test]
    fn test_lock_protocol_versions() {
        let dir = TempDir::new().unwrap();
        let graph = line_partition(dir.path(), 4);
        graph.acquire(1);
        graph.release(1);
        graph.acquire(1);
        graph.release(1);
        assert_eq!(graph.versions[1].load(Ordering::Relaxed), 4);
    }

    #[test]
    #[should_panic(expected = "already locked")]
    fn test_reentrant_acquire_panics() {
        let dir = TempDir::new().unwrap();
        let graph = line_partition(dir.path(), 4);
        graph.acquire(1);
        graph.acquire(1);
    }

    #[test]
    fn test_build_respects_degree_cap() {
        let dir = TempDir::new().unwrap();
        let mut graph = line_partition(dir.path(), 10);
        let mut rng = StdRng::seed_from_u64(2);
        graph.generate_random_edges(&mut rng);
        graph.build(2, 7);

        let mut neighbors = Vec::new();
        for v in 0..10u32 {
            graph.fetch_neighbors(v, &mut neighbors);
            assert!(neighbors.len() <= 3);
            assert!(!neighbors.contains(&v));
            let mut sorted = neighbors.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), neighbors.len());
        }
    }

    #[test]
    fn test_convert_and_sort_by_global() {
        let dir = TempDir::new().unwrap();
        // Load in reverse global order to force a real permutation.
        let mut graph =
            PartitionGraph::new(dir.path(), "perm", 4, 3, 3, 8, 1.2, DistanceKind::L2).unwrap();
        for i in (0..4u32).rev() {
            graph.push_vertex(i * 10, &[i as f32, 0.0, 0.0]);
        }

        // Hand-written local adjacency: each vertex points at the next
        // loaded vertex.
        for v in 0..4u32 {
            graph.write_row_locked(v, &[(v + 1) % 4]);
        }

        graph.convert_local_edges_to_global();
        graph.sort_edges_by_global_index();

        let mut row = Vec::new();
        let mut gids = Vec::new();
        for local in 0..4u32 {
            gids.push(graph.global_at(local));
        }
        assert_eq!(gids, vec![0, 10, 20, 30]);

        // Local 0 (gid 0) was loaded last, pointing at the first loaded
        // vertex (gid 30).
        graph.read_global_row(0, &mut row);
        assert_eq!(row, vec![30]);
    }
}
