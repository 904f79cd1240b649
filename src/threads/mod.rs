//! Thread management for the viewer.
//!
//! - `ViewerThread`: runs the per-tick frame producer (`Viewer::run`) on its
//!   own thread and hands out a `ViewerHandle` for producers and controllers.

mod viewer_thread;

pub use viewer_thread::{
    LatestPose, PoseSource, TickStats, Viewer, ViewerHandle, ViewerThread,
};
