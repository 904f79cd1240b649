//! State shared between the mapping pipeline and the viewer thread.
//!
//! This module provides:
//! - `MapBuffers`: per-tick accumulation of keyframes, graph edges and points
//! - `Lifecycle`: stop/release/finish controller for the viewer loop
//! - `ViewerControls`: operator flags forwarded to the mapping system

mod buffers;
mod controls;
mod lifecycle;

pub use buffers::{BufferLengths, MapBatch, MapBuffers, MapBuffersHandle, create_map_buffers};
pub use controls::{ControlTracker, MapControl, ViewerControls};
pub use lifecycle::{Lifecycle, LifecycleState, STOP_POLL_INTERVAL};
