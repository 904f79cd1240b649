//! Tagged binary frame format
//!
//! # Frame Layout
//!
//! Every frame travels as one binary WebSocket message:
//!
//! ```text
//! ┌──────────┬────────────────────┬──────────────────────────────┐
//! │ Tag (1B) │ Reserved (7B, 0x00)│ Payload (stride × N bytes)   │
//! └──────────┴────────────────────┴──────────────────────────────┘
//! ```
//!
//! There is no length or count field. The element count is derived by the
//! receiver as `payload_len / stride`, relying on the transport's message
//! boundaries.
//!
//! ## Tags
//!
//! | Tag | Payload                  | Stride |
//! |-----|--------------------------|--------|
//! | `A` | current camera pose      | 64 (exactly one) |
//! | `B` | keyframe poses           | 64     |
//! | `C` | covisibility edges       | 24     |
//! | `D` | spanning-tree edges      | 24     |
//! | `E` | loop edges               | 24     |
//! | `F` | map points               | 12     |
//! | `G` | reference points         | 12     |
//! | `K` | keypoint count (`i32`)   | 4 (exactly one) |
//! | `Z` | end-of-tick marker       | empty  |
//!
//! ## Byte Order
//!
//! Floats are IEEE-754 binary32 and the keypoint count is a two's-complement
//! `i32`, both little-endian regardless of host. Poses are column-major.
//!
//! ## Per-Tick Sequence
//!
//! A tick always emits `A B C D E F G K Z`, in that order, including empty
//! batches. Clients detect tick boundaries on `Z`.

use crate::core::types::{GraphEdge, Point3, Pose};
use crate::error::{Error, Result};

/// Size of the frame header (tag + reserved bytes).
pub const HEADER_LEN: usize = 8;

/// Number of encodes after which the buffer's recent peak is re-evaluated.
const SHRINK_WINDOW: u32 = 512;

/// Buffers smaller than this are never shrunk.
const MIN_RETAINED_CAPACITY: usize = 64 * 1024;

/// Single-byte frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameTag {
    /// Current camera pose
    Pose = b'A',
    /// Keyframes created since the previous tick
    Keyframes = b'B',
    /// Covisibility graph edges
    CovisibilityEdges = b'C',
    /// Spanning-tree edges
    SpanningTreeEdges = b'D',
    /// Loop-closure edges
    LoopEdges = b'E',
    /// Map points
    MapPoints = b'F',
    /// Reference (local map) points
    ReferencePoints = b'G',
    /// Tracked keypoint count
    KeypointCount = b'K',
    /// End-of-tick marker
    EndOfTick = b'Z',
}

impl FrameTag {
    /// Order in which frames are emitted within one tick.
    pub const TICK_ORDER: [FrameTag; 9] = [
        FrameTag::Pose,
        FrameTag::Keyframes,
        FrameTag::CovisibilityEdges,
        FrameTag::SpanningTreeEdges,
        FrameTag::LoopEdges,
        FrameTag::MapPoints,
        FrameTag::ReferencePoints,
        FrameTag::KeypointCount,
        FrameTag::EndOfTick,
    ];

    /// Raw tag byte.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Tag as an ASCII character (for logs).
    #[inline]
    pub fn as_char(self) -> char {
        self.as_byte() as char
    }

    /// Parse a tag byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            b'A' => FrameTag::Pose,
            b'B' => FrameTag::Keyframes,
            b'C' => FrameTag::CovisibilityEdges,
            b'D' => FrameTag::SpanningTreeEdges,
            b'E' => FrameTag::LoopEdges,
            b'F' => FrameTag::MapPoints,
            b'G' => FrameTag::ReferencePoints,
            b'K' => FrameTag::KeypointCount,
            b'Z' => FrameTag::EndOfTick,
            other => return Err(Error::UnknownTag(other)),
        })
    }

    /// Payload element stride in bytes (0 for the marker).
    pub fn element_size(self) -> usize {
        match self {
            FrameTag::Pose | FrameTag::Keyframes => Pose::SIZE,
            FrameTag::CovisibilityEdges | FrameTag::SpanningTreeEdges | FrameTag::LoopEdges => {
                GraphEdge::SIZE
            }
            FrameTag::MapPoints | FrameTag::ReferencePoints => Point3::SIZE,
            FrameTag::KeypointCount => 4,
            FrameTag::EndOfTick => 0,
        }
    }
}

impl TryFrom<u8> for FrameTag {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        FrameTag::from_byte(byte)
    }
}

/// Fixed-stride element that can be packed into a frame payload.
pub trait WireElement: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Append the little-endian encoding to `out`.
    fn write_to(&self, out: &mut Vec<u8>);

    /// Decode from exactly `SIZE` bytes.
    fn read_from(bytes: &[u8]) -> Self;
}

#[inline]
fn put_f32(out: &mut Vec<u8>, value: f32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
fn get_f32(bytes: &[u8], index: usize) -> f32 {
    let start = index * 4;
    f32::from_le_bytes([
        bytes[start],
        bytes[start + 1],
        bytes[start + 2],
        bytes[start + 3],
    ])
}

impl WireElement for Point3 {
    const SIZE: usize = 3 * 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        for v in self.to_array() {
            put_f32(out, v);
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        Point3::new(get_f32(bytes, 0), get_f32(bytes, 1), get_f32(bytes, 2))
    }
}

impl WireElement for GraphEdge {
    const SIZE: usize = 2 * Point3::SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.a.write_to(out);
        self.b.write_to(out);
    }

    fn read_from(bytes: &[u8]) -> Self {
        GraphEdge::new(
            Point3::read_from(&bytes[..Point3::SIZE]),
            Point3::read_from(&bytes[Point3::SIZE..]),
        )
    }
}

impl WireElement for Pose {
    const SIZE: usize = 16 * 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        for value in self.m {
            put_f32(out, value);
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut m = [0.0f32; 16];
        for (i, value) in m.iter_mut().enumerate() {
            *value = get_f32(bytes, i);
        }
        Pose::from_column_major(m)
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `A`: current camera pose
    Pose(Pose),
    /// `B`: new keyframe poses
    Keyframes(Vec<Pose>),
    /// `C`: covisibility edges
    CovisibilityEdges(Vec<GraphEdge>),
    /// `D`: spanning-tree edges
    SpanningTreeEdges(Vec<GraphEdge>),
    /// `E`: loop edges
    LoopEdges(Vec<GraphEdge>),
    /// `F`: map points
    MapPoints(Vec<Point3>),
    /// `G`: reference points
    ReferencePoints(Vec<Point3>),
    /// `K`: keypoint count
    KeypointCount(i32),
    /// `Z`: end of tick
    EndOfTick,
}

impl Frame {
    /// Tag this frame is sent under.
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::Pose(_) => FrameTag::Pose,
            Frame::Keyframes(_) => FrameTag::Keyframes,
            Frame::CovisibilityEdges(_) => FrameTag::CovisibilityEdges,
            Frame::SpanningTreeEdges(_) => FrameTag::SpanningTreeEdges,
            Frame::LoopEdges(_) => FrameTag::LoopEdges,
            Frame::MapPoints(_) => FrameTag::MapPoints,
            Frame::ReferencePoints(_) => FrameTag::ReferencePoints,
            Frame::KeypointCount(_) => FrameTag::KeypointCount,
            Frame::EndOfTick => FrameTag::EndOfTick,
        }
    }

    /// Number of payload elements.
    pub fn element_count(&self) -> usize {
        match self {
            Frame::Pose(_) | Frame::KeypointCount(_) => 1,
            Frame::Keyframes(v) => v.len(),
            Frame::CovisibilityEdges(v) | Frame::SpanningTreeEdges(v) | Frame::LoopEdges(v) => {
                v.len()
            }
            Frame::MapPoints(v) | Frame::ReferencePoints(v) => v.len(),
            Frame::EndOfTick => 0,
        }
    }
}

/// Frame builder with a reusable output buffer.
///
/// Each `encode_*` call overwrites the previous frame and returns a view of
/// the new one. The buffer keeps its capacity between calls and is shrunk
/// back only when the recent peak frame size has fallen well below it.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    buffer: Vec<u8>,
    recent_peak: usize,
    encodes_in_window: u32,
}

impl FrameEncoder {
    /// Create an encoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an encoder with a pre-sized buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Current buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// `A`: current pose.
    pub fn encode_pose(&mut self, pose: &Pose) -> Result<&[u8]> {
        self.encode_elements(FrameTag::Pose, std::slice::from_ref(pose))
    }

    /// `B`: keyframe batch.
    pub fn encode_keyframes(&mut self, keyframes: &[Pose]) -> Result<&[u8]> {
        self.encode_elements(FrameTag::Keyframes, keyframes)
    }

    /// `C`: covisibility edges.
    pub fn encode_covisibility_edges(&mut self, edges: &[GraphEdge]) -> Result<&[u8]> {
        self.encode_elements(FrameTag::CovisibilityEdges, edges)
    }

    /// `D`: spanning-tree edges.
    pub fn encode_spanning_tree_edges(&mut self, edges: &[GraphEdge]) -> Result<&[u8]> {
        self.encode_elements(FrameTag::SpanningTreeEdges, edges)
    }

    /// `E`: loop edges.
    pub fn encode_loop_edges(&mut self, edges: &[GraphEdge]) -> Result<&[u8]> {
        self.encode_elements(FrameTag::LoopEdges, edges)
    }

    /// `F`: map points.
    pub fn encode_map_points(&mut self, points: &[Point3]) -> Result<&[u8]> {
        self.encode_elements(FrameTag::MapPoints, points)
    }

    /// `G`: reference points.
    pub fn encode_reference_points(&mut self, points: &[Point3]) -> Result<&[u8]> {
        self.encode_elements(FrameTag::ReferencePoints, points)
    }

    /// `K`: keypoint count.
    pub fn encode_keypoint_count(&mut self, count: i32) -> Result<&[u8]> {
        self.begin(FrameTag::KeypointCount, 4)?;
        self.buffer.extend_from_slice(&count.to_le_bytes());
        Ok(self.finish())
    }

    /// `Z`: end-of-tick marker.
    pub fn encode_end_of_tick(&mut self) -> Result<&[u8]> {
        self.begin(FrameTag::EndOfTick, 0)?;
        Ok(self.finish())
    }

    /// Encode an owned [`Frame`].
    pub fn encode(&mut self, frame: &Frame) -> Result<&[u8]> {
        match frame {
            Frame::Pose(pose) => self.encode_pose(pose),
            Frame::Keyframes(v) => self.encode_keyframes(v),
            Frame::CovisibilityEdges(v) => self.encode_covisibility_edges(v),
            Frame::SpanningTreeEdges(v) => self.encode_spanning_tree_edges(v),
            Frame::LoopEdges(v) => self.encode_loop_edges(v),
            Frame::MapPoints(v) => self.encode_map_points(v),
            Frame::ReferencePoints(v) => self.encode_reference_points(v),
            Frame::KeypointCount(count) => self.encode_keypoint_count(*count),
            Frame::EndOfTick => self.encode_end_of_tick(),
        }
    }

    fn encode_elements<T: WireElement>(&mut self, tag: FrameTag, items: &[T]) -> Result<&[u8]> {
        debug_assert_eq!(tag.element_size(), T::SIZE);
        self.begin(tag, items.len() * T::SIZE)?;
        for item in items {
            item.write_to(&mut self.buffer);
        }
        Ok(self.finish())
    }

    /// Reset the buffer, reserve room for the whole frame and write the header.
    fn begin(&mut self, tag: FrameTag, payload_len: usize) -> Result<()> {
        let total = HEADER_LEN + payload_len;
        self.buffer.clear();
        self.buffer
            .try_reserve_exact(total)
            .map_err(|_| Error::FrameAllocation {
                tag: tag.as_char(),
                bytes: total,
            })?;
        self.buffer.push(tag.as_byte());
        self.buffer.extend_from_slice(&[0u8; HEADER_LEN - 1]);
        Ok(())
    }

    fn finish(&mut self) -> &[u8] {
        self.recent_peak = self.recent_peak.max(self.buffer.len());
        self.encodes_in_window += 1;

        if self.encodes_in_window >= SHRINK_WINDOW {
            let retained = self.recent_peak.max(MIN_RETAINED_CAPACITY);
            if self.buffer.capacity() > retained * 4 {
                log::debug!(
                    "Shrinking frame buffer {} -> {} bytes",
                    self.buffer.capacity(),
                    retained
                );
                self.buffer.shrink_to(retained);
            }
            self.recent_peak = 0;
            self.encodes_in_window = 0;
        }

        &self.buffer
    }
}

/// Decode one frame from a complete transport message.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidFrame(format!(
            "frame of {} bytes is shorter than the {}-byte header",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let tag = FrameTag::from_byte(bytes[0])?;
    let payload = &bytes[HEADER_LEN..];

    Ok(match tag {
        FrameTag::Pose => {
            expect_len(tag, payload, Pose::SIZE)?;
            Frame::Pose(Pose::read_from(payload))
        }
        FrameTag::Keyframes => Frame::Keyframes(decode_elements(tag, payload)?),
        FrameTag::CovisibilityEdges => Frame::CovisibilityEdges(decode_elements(tag, payload)?),
        FrameTag::SpanningTreeEdges => Frame::SpanningTreeEdges(decode_elements(tag, payload)?),
        FrameTag::LoopEdges => Frame::LoopEdges(decode_elements(tag, payload)?),
        FrameTag::MapPoints => Frame::MapPoints(decode_elements(tag, payload)?),
        FrameTag::ReferencePoints => Frame::ReferencePoints(decode_elements(tag, payload)?),
        FrameTag::KeypointCount => {
            expect_len(tag, payload, 4)?;
            Frame::KeypointCount(i32::from_le_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]))
        }
        FrameTag::EndOfTick => {
            expect_len(tag, payload, 0)?;
            Frame::EndOfTick
        }
    })
}

fn expect_len(tag: FrameTag, payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(Error::InvalidFrame(format!(
            "'{}' payload must be {} bytes, got {}",
            tag.as_char(),
            expected,
            payload.len()
        )));
    }
    Ok(())
}

fn decode_elements<T: WireElement>(tag: FrameTag, payload: &[u8]) -> Result<Vec<T>> {
    if payload.len() % T::SIZE != 0 {
        return Err(Error::InvalidFrame(format!(
            "'{}' payload of {} bytes is not a multiple of stride {}",
            tag.as_char(),
            payload.len(),
            T::SIZE
        )));
    }
    Ok(payload.chunks_exact(T::SIZE).map(T::read_from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points(n: usize) -> Vec<Point3> {
        (0..n)
            .map(|i| Point3::new(i as f32 * 0.5, -(i as f32), 1.0 / (i as f32 + 1.0)))
            .collect()
    }

    fn sample_edges(n: usize) -> Vec<GraphEdge> {
        sample_points(n * 2)
            .chunks_exact(2)
            .map(|p| GraphEdge::new(p[0], p[1]))
            .collect()
    }

    fn sample_poses(n: usize) -> Vec<Pose> {
        (0..n)
            .map(|i| {
                let mut m = Pose::IDENTITY.m;
                m[12] = i as f32;
                m[13] = 0.25 * i as f32;
                m[14] = -3.0;
                Pose::from_column_major(m)
            })
            .collect()
    }

    fn round_trip(frame: Frame) {
        let mut encoder = FrameEncoder::new();
        let bytes = encoder.encode(&frame).unwrap().to_vec();

        assert_eq!(bytes[0], frame.tag().as_byte());
        assert_eq!(&bytes[1..HEADER_LEN], &[0u8; 7]);
        assert_eq!(
            bytes.len(),
            HEADER_LEN + frame.element_count() * frame.tag().element_size()
        );

        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_round_trip_all_tags_and_sizes() {
        round_trip(Frame::Pose(sample_poses(3)[2]));
        round_trip(Frame::KeypointCount(-17));
        round_trip(Frame::EndOfTick);

        for n in [0, 1, 100] {
            round_trip(Frame::Keyframes(sample_poses(n)));
            round_trip(Frame::CovisibilityEdges(sample_edges(n)));
            round_trip(Frame::SpanningTreeEdges(sample_edges(n)));
            round_trip(Frame::LoopEdges(sample_edges(n)));
            round_trip(Frame::MapPoints(sample_points(n)));
            round_trip(Frame::ReferencePoints(sample_points(n)));
        }
    }

    #[test]
    fn test_round_trip_is_bit_exact() {
        let odd = Point3::new(f32::MIN_POSITIVE, -0.0, f32::MAX);
        let mut encoder = FrameEncoder::new();
        let bytes = encoder.encode_map_points(&[odd]).unwrap().to_vec();

        match decode_frame(&bytes).unwrap() {
            Frame::MapPoints(points) => {
                assert_eq!(points[0].x.to_bits(), odd.x.to_bits());
                assert_eq!(points[0].y.to_bits(), odd.y.to_bits());
                assert_eq!(points[0].z.to_bits(), odd.z.to_bits());
            }
            other => panic!("Expected map points, got {:?}", other),
        }
    }

    #[test]
    fn test_identity_pose_layout() {
        let mut encoder = FrameEncoder::new();
        let bytes = encoder.encode_pose(&Pose::identity()).unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + 64);
        assert_eq!(bytes[0], b'A');
        // m[0] = 1.0 little-endian
        assert_eq!(&bytes[8..12], &1.0f32.to_le_bytes());
        // m[1] = 0.0
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_payload_sizes_match_strides() {
        let mut encoder = FrameEncoder::new();
        assert_eq!(encoder.encode_covisibility_edges(&sample_edges(2)).unwrap().len(), 8 + 48);
        assert_eq!(encoder.encode_map_points(&sample_points(3)).unwrap().len(), 8 + 36);
        assert_eq!(encoder.encode_keypoint_count(42).unwrap().len(), 8 + 4);
        assert_eq!(encoder.encode_end_of_tick().unwrap().len(), 8);
        assert_eq!(encoder.encode_keyframes(&[]).unwrap().len(), 8);
    }

    #[test]
    fn test_elements_keep_insertion_order() {
        let points = vec![
            Point3::new(3.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        let mut encoder = FrameEncoder::new();
        let bytes = encoder.encode_reference_points(&points).unwrap().to_vec();

        assert_eq!(decode_frame(&bytes).unwrap(), Frame::ReferencePoints(points));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(matches!(
            decode_frame(&[b'A', 0, 0]),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let bytes = [b'Q', 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(decode_frame(&bytes), Err(Error::UnknownTag(b'Q'))));
    }

    #[test]
    fn test_decode_rejects_partial_element() {
        let mut bytes = vec![b'F', 0, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0u8; 13]);
        assert!(matches!(decode_frame(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_decode_rejects_wrong_pose_size() {
        let mut bytes = vec![b'A', 0, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0u8; 128]);
        assert!(matches!(decode_frame(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_tag_bytes() {
        let chars: String = FrameTag::TICK_ORDER.iter().map(|t| t.as_char()).collect();
        assert_eq!(chars, "ABCDEFGKZ");

        for tag in FrameTag::TICK_ORDER {
            assert_eq!(FrameTag::try_from(tag.as_byte()).unwrap(), tag);
        }
    }

    #[test]
    fn test_buffer_is_reused() {
        let mut encoder = FrameEncoder::with_capacity(1024);
        encoder.encode_map_points(&sample_points(50)).unwrap();
        let capacity = encoder.capacity();

        encoder.encode_map_points(&sample_points(10)).unwrap();
        assert_eq!(encoder.capacity(), capacity);
    }

    #[test]
    fn test_buffer_shrinks_after_quiet_window() {
        let mut encoder = FrameEncoder::new();
        // ~1.2 MB frame
        encoder.encode_map_points(&sample_points(100_000)).unwrap();
        let grown = encoder.capacity();
        assert!(grown > MIN_RETAINED_CAPACITY * 4);

        for _ in 0..(2 * SHRINK_WINDOW) {
            encoder.encode_end_of_tick().unwrap();
        }
        assert!(encoder.capacity() < grown);
    }
}
