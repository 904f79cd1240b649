//! Accumulation buffers shared between the mapping pipeline and the viewer.
//!
//! The mapping pipeline appends geometry as it is produced; the viewer loop
//! drains every buffer once per tick. Each buffer sits behind its own mutex
//! and is drained by swapping its `Vec` with the viewer's scratch `Vec`, so a
//! drain observes a consistent snapshot and the lock is held only for the
//! swap. Both sides keep their allocations across ticks.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::types::{GraphEdge, Point3, Pose};

/// Geometry drained from [`MapBuffers`] for one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapBatch {
    /// Keyframes created since the last tick.
    pub keyframes: Vec<Pose>,
    /// Covisibility graph edges.
    pub covisibility_edges: Vec<GraphEdge>,
    /// Spanning-tree edges.
    pub spanning_tree_edges: Vec<GraphEdge>,
    /// Loop-closure edges.
    pub loop_edges: Vec<GraphEdge>,
    /// Map points.
    pub map_points: Vec<Point3>,
    /// Reference points.
    pub reference_points: Vec<Point3>,
    /// Keypoint count at drain time (not accumulated).
    pub keypoint_count: i32,
}

impl MapBatch {
    /// Empty every sequence, keeping capacity.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.covisibility_edges.clear();
        self.spanning_tree_edges.clear();
        self.loop_edges.clear();
        self.map_points.clear();
        self.reference_points.clear();
    }
}

/// Number of pending elements per buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferLengths {
    pub keyframes: usize,
    pub covisibility_edges: usize,
    pub spanning_tree_edges: usize,
    pub loop_edges: usize,
    pub map_points: usize,
    pub reference_points: usize,
}

impl BufferLengths {
    /// Sum over all buffers.
    pub fn total(&self) -> usize {
        self.keyframes
            + self.covisibility_edges
            + self.spanning_tree_edges
            + self.loop_edges
            + self.map_points
            + self.reference_points
    }

    /// Whether every buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Thread-safe accumulation buffers.
#[derive(Debug, Default)]
pub struct MapBuffers {
    keyframes: Mutex<Vec<Pose>>,
    covisibility_edges: Mutex<Vec<GraphEdge>>,
    spanning_tree_edges: Mutex<Vec<GraphEdge>>,
    loop_edges: Mutex<Vec<GraphEdge>>,
    map_points: Mutex<Vec<Point3>>,
    reference_points: Mutex<Vec<Point3>>,
    keypoint_count: AtomicI32,
}

fn lock<T>(buffer: &Mutex<T>) -> MutexGuard<'_, T> {
    buffer.lock().unwrap_or_else(|e| e.into_inner())
}

/// Move the buffer contents into `out` and leave `out`'s old allocation behind.
fn swap_out<T>(buffer: &Mutex<Vec<T>>, out: &mut Vec<T>) {
    out.clear();
    std::mem::swap(&mut *lock(buffer), out);
}

impl MapBuffers {
    /// Create empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new keyframe pose.
    pub fn push_keyframe(&self, pose: Pose) {
        lock(&self.keyframes).push(pose);
    }

    /// Record a covisibility edge.
    pub fn push_covisibility_edge(&self, edge: GraphEdge) {
        lock(&self.covisibility_edges).push(edge);
    }

    /// Record a spanning-tree edge.
    pub fn push_spanning_tree_edge(&self, edge: GraphEdge) {
        lock(&self.spanning_tree_edges).push(edge);
    }

    /// Record a loop-closure edge.
    pub fn push_loop_edge(&self, edge: GraphEdge) {
        lock(&self.loop_edges).push(edge);
    }

    /// Record a map point.
    pub fn push_map_point(&self, point: Point3) {
        lock(&self.map_points).push(point);
    }

    /// Record a reference point.
    pub fn push_reference_point(&self, point: Point3) {
        lock(&self.reference_points).push(point);
    }

    /// Append several map points under one lock.
    pub fn extend_map_points(&self, points: impl IntoIterator<Item = Point3>) {
        lock(&self.map_points).extend(points);
    }

    /// Append several reference points under one lock.
    pub fn extend_reference_points(&self, points: impl IntoIterator<Item = Point3>) {
        lock(&self.reference_points).extend(points);
    }

    /// Append several covisibility edges under one lock.
    pub fn extend_covisibility_edges(&self, edges: impl IntoIterator<Item = GraphEdge>) {
        lock(&self.covisibility_edges).extend(edges);
    }

    /// Overwrite the tracked keypoint count.
    pub fn set_keypoint_count(&self, count: i32) {
        self.keypoint_count.store(count, Ordering::Relaxed);
    }

    /// Current keypoint count.
    pub fn keypoint_count(&self) -> i32 {
        self.keypoint_count.load(Ordering::Relaxed)
    }

    /// Pending element counts.
    pub fn lengths(&self) -> BufferLengths {
        BufferLengths {
            keyframes: lock(&self.keyframes).len(),
            covisibility_edges: lock(&self.covisibility_edges).len(),
            spanning_tree_edges: lock(&self.spanning_tree_edges).len(),
            loop_edges: lock(&self.loop_edges).len(),
            map_points: lock(&self.map_points).len(),
            reference_points: lock(&self.reference_points).len(),
        }
    }

    /// Drain every buffer into `batch`, leaving the buffers empty.
    ///
    /// Previous contents of `batch` are discarded; its allocations are
    /// handed to the buffers for the producer to refill.
    pub fn drain_into(&self, batch: &mut MapBatch) {
        swap_out(&self.keyframes, &mut batch.keyframes);
        swap_out(&self.covisibility_edges, &mut batch.covisibility_edges);
        swap_out(&self.spanning_tree_edges, &mut batch.spanning_tree_edges);
        swap_out(&self.loop_edges, &mut batch.loop_edges);
        swap_out(&self.map_points, &mut batch.map_points);
        swap_out(&self.reference_points, &mut batch.reference_points);
        batch.keypoint_count = self.keypoint_count();
    }

    /// Drain every buffer into a fresh batch.
    pub fn drain(&self) -> MapBatch {
        let mut batch = MapBatch::default();
        self.drain_into(&mut batch);
        batch
    }
}

/// Handle type for shared buffers (Arc<MapBuffers>).
pub type MapBuffersHandle = Arc<MapBuffers>;

/// Create new shared buffers.
pub fn create_map_buffers() -> MapBuffersHandle {
    Arc::new(MapBuffers::new())
}
