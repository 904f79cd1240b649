//! Viewer Thread - per-tick map telemetry producer.
//!
//! Each tick reads the current camera pose, drains the accumulation buffers
//! and emits one complete frame sequence to the sink:
//!
//! ```text
//! A (pose) → B C D E F G (drained batches) → K (keypoints) → Z (end of tick)
//! ```
//!
//! Every frame is followed by one `service()` step so the transport makes
//! progress even when nobody is connected. Buffers are drained whether or
//! not a frame could be encoded, so a failed tick never replays stale
//! geometry on the next one.
//!
//! Between ticks the loop sleeps for the remainder of the tick period (at
//! least the configured yield), honours pending stop requests at the tick
//! boundary and exits once a finish is requested.

use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ViewerConfig;
use crate::core::types::Pose;
use crate::error::Result;
use crate::io::streaming::{FrameEncoder, FrameSink, FrameTag, StreamServer};
use crate::state::{
    ControlTracker, Lifecycle, MapBatch, MapBuffersHandle, MapControl, ViewerControls,
    create_map_buffers,
};

/// Ticks between periodic throughput summaries.
const SUMMARY_INTERVAL_TICKS: u64 = 300;

/// Supplier of the current camera pose.
pub trait PoseSource: Send {
    /// Pose to publish this tick.
    fn current_pose(&mut self) -> Pose;
}

/// Last pose published by the tracker, shared across threads.
#[derive(Debug, Clone, Default)]
pub struct LatestPose {
    inner: Arc<RwLock<Pose>>,
}

impl LatestPose {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new pose.
    pub fn set(&self, pose: Pose) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = pose;
    }

    /// Most recently published pose (identity until the first `set`).
    pub fn get(&self) -> Pose {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl PoseSource for LatestPose {
    fn current_pose(&mut self) -> Pose {
        self.get()
    }
}

/// Producer-side handle to a viewer: buffers, lifecycle and controls.
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    lifecycle: Arc<Lifecycle>,
    buffers: MapBuffersHandle,
    controls: Arc<ViewerControls>,
}

impl ViewerHandle {
    /// Fresh handle with empty buffers and a not-yet-started lifecycle.
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle::new()),
            buffers: create_map_buffers(),
            controls: Arc::new(ViewerControls::new()),
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn buffers(&self) -> &MapBuffersHandle {
        &self.buffers
    }

    pub fn controls(&self) -> &Arc<ViewerControls> {
        &self.controls
    }
}

impl Default for ViewerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Loop timing and delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickStats {
    /// Completed ticks.
    pub ticks: u64,
    /// Duration of the most recent tick (excluding the sleep).
    pub last_tick: Duration,
    /// Longest tick seen.
    pub max_tick: Duration,
    /// Frames dropped because they could not be encoded.
    pub frames_skipped: u64,
    /// Bytes currently reserved by the reusable frame buffer.
    pub encoder_capacity: usize,
}

/// Render/producer loop driving a [`FrameSink`].
pub struct Viewer<S: FrameSink = StreamServer> {
    config: ViewerConfig,
    handle: ViewerHandle,
    pose_source: Box<dyn PoseSource>,
    map_control: Option<Box<dyn MapControl>>,
    control_tracker: ControlTracker,
    sink: S,
    encoder: FrameEncoder,
    batch: MapBatch,
    stats: TickStats,
}

impl Viewer<StreamServer> {
    /// Viewer streaming over WebSocket.
    pub fn new(config: ViewerConfig, pose_source: Box<dyn PoseSource>) -> Self {
        Self::with_sink(config, pose_source, StreamServer::new())
    }
}

impl<S: FrameSink> Viewer<S> {
    /// Viewer delivering frames to an arbitrary sink.
    pub fn with_sink(config: ViewerConfig, pose_source: Box<dyn PoseSource>, sink: S) -> Self {
        Self {
            config,
            handle: ViewerHandle::new(),
            pose_source,
            map_control: None,
            control_tracker: ControlTracker::new(),
            sink,
            encoder: FrameEncoder::new(),
            batch: MapBatch::default(),
            stats: TickStats::default(),
        }
    }

    /// Forward localization/reset controls to `control`.
    pub fn with_map_control(mut self, control: Box<dyn MapControl>) -> Self {
        self.map_control = Some(control);
        self
    }

    /// Share existing buffers, lifecycle and controls.
    pub fn with_handle(mut self, handle: ViewerHandle) -> Self {
        self.handle = handle;
        self
    }

    /// Producer-side handle.
    pub fn handle(&self) -> ViewerHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn stats(&self) -> TickStats {
        self.stats
    }

    /// Emit one complete `A..Z` frame sequence and apply pending controls.
    pub fn tick(&mut self) {
        let started = Instant::now();

        let pose = self.pose_source.current_pose();
        self.handle.buffers.drain_into(&mut self.batch);

        let skipped = &mut self.stats.frames_skipped;
        let sink = &mut self.sink;
        let encoder = &mut self.encoder;
        let batch = &self.batch;

        emit(sink, skipped, FrameTag::Pose, encoder.encode_pose(&pose));
        emit(sink, skipped, FrameTag::Keyframes, encoder.encode_keyframes(&batch.keyframes));
        emit(
            sink,
            skipped,
            FrameTag::CovisibilityEdges,
            encoder.encode_covisibility_edges(&batch.covisibility_edges),
        );
        emit(
            sink,
            skipped,
            FrameTag::SpanningTreeEdges,
            encoder.encode_spanning_tree_edges(&batch.spanning_tree_edges),
        );
        emit(sink, skipped, FrameTag::LoopEdges, encoder.encode_loop_edges(&batch.loop_edges));
        emit(sink, skipped, FrameTag::MapPoints, encoder.encode_map_points(&batch.map_points));
        emit(
            sink,
            skipped,
            FrameTag::ReferencePoints,
            encoder.encode_reference_points(&batch.reference_points),
        );
        emit(
            sink,
            skipped,
            FrameTag::KeypointCount,
            encoder.encode_keypoint_count(batch.keypoint_count),
        );
        emit(sink, skipped, FrameTag::EndOfTick, encoder.encode_end_of_tick());

        self.batch.clear();

        if let Some(control) = self.map_control.as_deref_mut() {
            self.control_tracker.apply(&self.handle.controls, control);
        }

        let elapsed = started.elapsed();
        self.stats.ticks += 1;
        self.stats.last_tick = elapsed;
        self.stats.max_tick = self.stats.max_tick.max(elapsed);
        self.stats.encoder_capacity = self.encoder.capacity();

        log::trace!("Tick {} took {:?}", self.stats.ticks, elapsed);
        if self.stats.ticks % SUMMARY_INTERVAL_TICKS == 0 {
            log::debug!(
                "Viewer: {} ticks, last {:?}, max {:?}, {} frames skipped, {} bytes reserved",
                self.stats.ticks,
                self.stats.last_tick,
                self.stats.max_tick,
                self.stats.frames_skipped,
                self.stats.encoder_capacity
            );
        }
    }

    /// Run the tick loop until a finish is requested.
    ///
    /// Opens the sink on the configured port first; if that fails the loop
    /// still runs and frames are discarded.
    pub fn run(&mut self) {
        let lifecycle = Arc::clone(&self.handle.lifecycle);
        lifecycle.begin();

        if self.config.stream.enabled {
            if let Err(e) = self.sink.open(self.config.stream.port) {
                log::warn!("Streaming unavailable, frames will be discarded: {}", e);
            }
        } else {
            log::info!("Streaming disabled by configuration");
        }

        let period = self.config.tick_period();
        let min_yield = self.config.tick_yield();
        log::info!(
            "Viewer loop starting ({:.1} fps, period {:?})",
            self.config.camera.fps,
            period
        );

        loop {
            let started = Instant::now();
            self.tick();

            let elapsed = started.elapsed();
            thread::sleep(period.saturating_sub(elapsed).max(min_yield));

            if lifecycle.stop() {
                lifecycle.wait_while_stopped();
            }

            if lifecycle.check_finish() {
                break;
            }
        }

        lifecycle.set_finish();
        self.sink.close();
        log::info!("Viewer loop finished after {} ticks", self.stats.ticks);
    }
}

/// Hand an encoded frame to the sink, or log and count it as skipped.
fn emit<S: FrameSink>(sink: &mut S, skipped: &mut u64, tag: FrameTag, frame: Result<&[u8]>) {
    match frame {
        Ok(bytes) => sink.broadcast(bytes),
        Err(e) => {
            log::warn!("Skipping frame '{}': {}", tag.as_char(), e);
            *skipped += 1;
        }
    }
    sink.service();
}

/// Viewer Thread handle.
pub struct ViewerThread {
    handle: JoinHandle<()>,
    viewer: ViewerHandle,
}

impl ViewerThread {
    /// Spawn the viewer loop on its own thread.
    pub fn spawn<S>(mut viewer: Viewer<S>) -> Result<Self>
    where
        S: FrameSink + Send + 'static,
    {
        let handle = viewer.handle();
        let join = thread::Builder::new()
            .name("viewer".into())
            .spawn(move || viewer.run())?;

        Ok(Self {
            handle: join,
            viewer: handle,
        })
    }

    /// Producer-side handle of the running viewer.
    pub fn viewer(&self) -> &ViewerHandle {
        &self.viewer
    }

    /// Request finish and wait for the loop to exit.
    pub fn shutdown(self) -> thread::Result<()> {
        self.viewer.lifecycle.request_finish();
        self.join()
    }

    /// Wait for thread to finish.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GraphEdge, Point3};
    use crate::io::streaming::HEADER_LEN;
    use crate::state::LifecycleState;

    /// Sink that records every broadcast frame.
    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<Vec<u8>>,
        services: usize,
        opened: Option<u16>,
        closed: bool,
    }

    impl FrameSink for RecordingSink {
        fn open(&mut self, port: u16) -> Result<()> {
            self.opened = Some(port);
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn broadcast(&mut self, frame: &[u8]) {
            self.frames.push(frame.to_vec());
        }

        fn service(&mut self) {
            self.services += 1;
        }
    }

    fn test_viewer() -> Viewer<RecordingSink> {
        let mut config = ViewerConfig::default();
        config.camera.fps = 200.0;
        config.stream.tick_yield_ms = 0;
        Viewer::with_sink(config, Box::new(LatestPose::new()), RecordingSink::default())
    }

    fn tags(frames: &[Vec<u8>]) -> String {
        frames.iter().map(|f| f[0] as char).collect()
    }

    #[test]
    fn test_tick_emits_full_sequence() {
        let mut viewer = test_viewer();
        viewer.tick();

        let sink = viewer.sink();
        assert_eq!(tags(&sink.frames), "ABCDEFGKZ");
        assert_eq!(sink.services, 9);
        assert!(sink.frames.iter().all(|f| f[1..HEADER_LEN] == [0u8; 7]));
    }

    #[test]
    fn test_tick_payload_sizes() {
        let mut viewer = test_viewer();
        let handle = viewer.handle();
        handle.buffers().push_covisibility_edge(GraphEdge::new(
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
        ));
        handle.buffers().push_covisibility_edge(GraphEdge::default());
        handle.buffers().extend_map_points((0..3).map(|i| Point3::new(i as f32, 0.0, 0.0)));
        handle.buffers().set_keypoint_count(812);

        viewer.tick();

        let payloads: Vec<usize> = viewer
            .sink()
            .frames
            .iter()
            .map(|f| f.len() - HEADER_LEN)
            .collect();
        assert_eq!(payloads, vec![64, 0, 48, 0, 0, 36, 0, 4, 0]);

        let k = &viewer.sink().frames[7];
        assert_eq!(&k[HEADER_LEN..], &812i32.to_le_bytes());
    }

    #[test]
    fn test_buffers_empty_after_tick() {
        let mut viewer = test_viewer();
        let handle = viewer.handle();
        handle.buffers().push_keyframe(Pose::identity());
        handle.buffers().push_loop_edge(GraphEdge::default());
        handle.buffers().push_reference_point(Point3::default());

        viewer.tick();
        assert!(handle.buffers().lengths().is_empty());

        // Second tick sends empty batches
        viewer.tick();
        let second = &viewer.sink().frames[9..];
        assert_eq!(tags(second), "ABCDEFGKZ");
        assert!(second[1..7].iter().all(|f| f.len() == HEADER_LEN));
    }

    #[test]
    fn test_pose_source_is_read_each_tick() {
        let pose = LatestPose::new();
        let mut viewer = Viewer::with_sink(
            ViewerConfig::default(),
            Box::new(pose.clone()),
            RecordingSink::default(),
        );

        let moved = Pose::from_rotation_translation(
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            Point3::new(4.0, 5.0, 6.0),
        );
        pose.set(moved);
        viewer.tick();

        let a = &viewer.sink().frames[0];
        let tx = f32::from_le_bytes(a[HEADER_LEN + 48..HEADER_LEN + 52].try_into().unwrap());
        assert_eq!(tx, 4.0);
    }

    #[test]
    fn test_many_ticks_without_clients() {
        let mut viewer = Viewer::new(ViewerConfig::default(), Box::new(LatestPose::new()));
        let handle = viewer.handle();
        let period = viewer.config().tick_period();

        let points: Vec<Point3> = (0..1000).map(|i| Point3::new(i as f32, 0.5, -1.0)).collect();
        let edges: Vec<GraphEdge> = points
            .windows(2)
            .step_by(2)
            .map(|w| GraphEdge::new(w[0], w[1]))
            .collect();

        let mut settled_capacity = None;
        for _ in 0..1000 {
            handle.buffers().extend_map_points(points.iter().copied());
            handle.buffers().extend_covisibility_edges(edges.iter().copied());
            handle.buffers().push_keyframe(Pose::identity());
            viewer.tick();

            assert!(handle.buffers().lengths().is_empty());
            let capacity = viewer.stats().encoder_capacity;
            assert_eq!(*settled_capacity.get_or_insert(capacity), capacity);
        }

        let stats = viewer.stats();
        assert_eq!(stats.ticks, 1000);
        assert_eq!(stats.frames_skipped, 0);
        assert!(stats.max_tick < period, "slowest tick {:?}", stats.max_tick);
        // Largest frame is 1000 map points
        assert!(stats.encoder_capacity >= HEADER_LEN + 1000 * 12);
        assert!(stats.encoder_capacity <= 256 * 1024);
        assert_eq!(viewer.sink().stats().frames_discarded, 9000);
    }

    #[test]
    fn test_controls_applied_after_frames() {
        struct Flag(Arc<std::sync::Mutex<Vec<&'static str>>>);
        impl MapControl for Flag {
            fn activate_localization_mode(&mut self) {
                self.0.lock().unwrap().push("activate");
            }
            fn deactivate_localization_mode(&mut self) {
                self.0.lock().unwrap().push("deactivate");
            }
            fn reset(&mut self) {
                self.0.lock().unwrap().push("reset");
            }
        }

        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut viewer = test_viewer().with_map_control(Box::new(Flag(Arc::clone(&calls))));
        let handle = viewer.handle();

        handle.controls().set_localization_mode(true);
        viewer.tick();
        handle.controls().request_reset();
        viewer.tick();

        assert_eq!(*calls.lock().unwrap(), vec!["activate", "reset"]);
    }

    #[test]
    fn test_run_until_finish() {
        let viewer = test_viewer();
        let viewer_thread = ViewerThread::spawn(viewer).unwrap();
        let handle = viewer_thread.viewer().clone();

        while handle.lifecycle().state() == LifecycleState::Finished {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(30));

        handle.lifecycle().request_finish();
        viewer_thread.join().unwrap();

        assert!(handle.lifecycle().is_finished());
        assert_eq!(handle.lifecycle().state(), LifecycleState::Finished);
    }

    #[test]
    fn test_run_opens_and_closes_sink() {
        let mut viewer = test_viewer();
        viewer.handle().lifecycle().request_finish();
        viewer.run();

        assert_eq!(viewer.sink().opened, Some(7681));
        assert!(viewer.sink().closed);
        // A finish requested before start still completes one tick
        assert_eq!(tags(&viewer.sink().frames), "ABCDEFGKZ");
    }

    #[test]
    fn test_stop_then_release_resumes_ticking() {
        let viewer = test_viewer();
        let viewer_thread = ViewerThread::spawn(viewer).unwrap();
        let handle = viewer_thread.viewer().clone();
        let lifecycle = handle.lifecycle();

        while lifecycle.state() == LifecycleState::Finished {
            thread::sleep(Duration::from_millis(1));
        }

        lifecycle.request_stop();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !lifecycle.is_stopped() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);

        lifecycle.release();
        assert_eq!(lifecycle.state(), LifecycleState::Running);

        viewer_thread.shutdown().unwrap();
        assert!(lifecycle.is_finished());
    }

    #[test]
    fn test_finish_racing_stop_always_exits() {
        for round in 0..20 {
            let viewer_thread = ViewerThread::spawn(test_viewer()).unwrap();
            let lifecycle = Arc::clone(viewer_thread.viewer().lifecycle());

            while lifecycle.state() == LifecycleState::Finished {
                thread::sleep(Duration::from_millis(1));
            }

            let finisher = {
                let lifecycle = Arc::clone(&lifecycle);
                thread::spawn(move || {
                    // Odd rounds: finish only once the loop is parked
                    if round % 2 == 1 {
                        let deadline = Instant::now() + Duration::from_secs(2);
                        while !lifecycle.is_stopped() && Instant::now() < deadline {
                            thread::yield_now();
                        }
                    }
                    lifecycle.request_finish();
                })
            };
            lifecycle.request_stop();

            finisher.join().unwrap();
            viewer_thread.join().unwrap();

            assert_eq!(lifecycle.state(), LifecycleState::Finished, "round {}", round);
            assert!(lifecycle.is_finished());
        }
    }
}
