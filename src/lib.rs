//! Prasaran - live map telemetry streaming for 3D mapping viewers
//!
//! A mapping pipeline pushes keyframes, graph edges and points into shared
//! accumulation buffers; the viewer loop drains them once per tick and
//! broadcasts a tagged binary frame sequence to WebSocket clients.
//!
//! # Architecture
//!
//! The crate is organized into 4 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    threads/                         │  ← Orchestration
//! │           (viewer loop, pose source)                │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     state/                          │  ← Shared state
//! │        (map buffers, lifecycle, controls)           │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                      io/                            │  ← Infrastructure
//! │        (streaming: wire codec, server)              │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │                    (types)                          │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use prasaran::{LatestPose, Viewer, ViewerConfig, ViewerThread};
//!
//! let pose = LatestPose::new();
//! let viewer = Viewer::new(ViewerConfig::default(), Box::new(pose.clone()));
//! let thread = ViewerThread::spawn(viewer)?;
//!
//! // Mapping side
//! let buffers = thread.viewer().buffers().clone();
//! buffers.set_keypoint_count(812);
//!
//! thread.shutdown().ok();
//! # Ok::<(), prasaran::Error>(())
//! ```

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: I/O infrastructure (depends on core)
// ============================================================================
pub mod io;

// ============================================================================
// Layer 3: Shared state (depends on core)
// ============================================================================
pub mod state;

// ============================================================================
// Layer 4: Thread infrastructure (depends on all layers)
// ============================================================================
pub mod threads;

pub mod config;
pub mod error;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Core types
pub use core::types::{GraphEdge, Point3, Pose};

// I/O - Streaming
pub use io::streaming::{
    Frame, FrameEncoder, FrameSink, FrameTag, HEADER_LEN, ServerStats, StreamServer, decode_frame,
};

// State
pub use state::{
    Lifecycle, LifecycleState, MapBatch, MapBuffers, MapBuffersHandle, MapControl, ViewerControls,
};

// Threads
pub use threads::{LatestPose, PoseSource, TickStats, Viewer, ViewerHandle, ViewerThread};

pub use config::ViewerConfig;
pub use error::{Error, Result};
