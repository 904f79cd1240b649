//! Geometry types streamed to visualization clients.
//!
//! - [`Pose`]: 4x4 homogeneous camera transform (column-major)
//! - [`Point3`]: world-space point in meters
//! - [`GraphEdge`]: pair of keyframe origins linked in the map graph

mod geometry;

pub use geometry::{GraphEdge, Point3, Pose};
