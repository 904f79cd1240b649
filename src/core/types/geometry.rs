//! Pose, point and edge types for 3D map streaming.

use serde::{Deserialize, Serialize};

/// A 3D point in world coordinates (meters).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    /// X coordinate
    pub x: f32,
    /// Y coordinate
    pub y: f32,
    /// Z coordinate
    pub z: f32,
}

impl Point3 {
    /// Create a new point.
    #[inline]
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Components as an array in wire order.
    #[inline]
    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    /// Squared distance to another point.
    #[inline]
    pub fn distance_squared(&self, other: &Point3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

impl From<[f32; 3]> for Point3 {
    fn from(v: [f32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// Camera pose as a 4x4 homogeneous transform.
///
/// Stored column-major, the layout OpenGL-style viewers consume directly:
/// element `(row, col)` lives at index `col * 4 + row`, so the translation
/// occupies indices 12, 13 and 14.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Matrix elements, column-major.
    pub m: [f32; 16],
}

impl Pose {
    /// Identity transform.
    #[rustfmt::skip]
    pub const IDENTITY: Pose = Pose {
        m: [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ],
    };

    /// Identity transform.
    #[inline]
    pub fn identity() -> Self {
        Self::IDENTITY
    }

    /// Build from column-major elements.
    #[inline]
    pub fn from_column_major(m: [f32; 16]) -> Self {
        Self { m }
    }

    /// Build from a row-major rotation and a translation.
    pub fn from_rotation_translation(rotation: [[f32; 3]; 3], translation: Point3) -> Self {
        let mut pose = Self::IDENTITY;
        for (row, r) in rotation.iter().enumerate() {
            for (col, value) in r.iter().enumerate() {
                pose.m[col * 4 + row] = *value;
            }
        }
        pose.m[12] = translation.x;
        pose.m[13] = translation.y;
        pose.m[14] = translation.z;
        pose
    }

    /// Element at `(row, col)`.
    #[inline]
    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.m[col * 4 + row]
    }

    /// Translation part (camera center for a camera-to-world transform).
    #[inline]
    pub fn translation(&self) -> Point3 {
        Point3::new(self.m[12], self.m[13], self.m[14])
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// An edge between two keyframes, carried as the two keyframe origins.
///
/// The same layout is used for covisibility, spanning-tree and loop edges;
/// only the channel they are streamed on differs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Origin of the first keyframe
    pub a: Point3,
    /// Origin of the second keyframe
    pub b: Point3,
}

impl GraphEdge {
    /// Create a new edge.
    #[inline]
    pub fn new(a: Point3, b: Point3) -> Self {
        Self { a, b }
    }
}
