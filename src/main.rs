//! Prasaran - map telemetry streaming daemon
//!
//! Streams a synthetic mapping session (circular trajectory, keyframes,
//! covisibility/spanning-tree/loop edges and map points) to WebSocket
//! clients. Useful for developing visualization clients without a live
//! mapping pipeline.
//!
//! # Usage
//!
//! ```bash
//! # With default config
//! cargo run --release
//!
//! # With custom config file and port override
//! cargo run --release -- --config prasaran.toml --port 7682
//! ```

use std::f32::consts::TAU;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clap::Parser;

use prasaran::{
    GraphEdge, LatestPose, MapBuffersHandle, Point3, Pose, Viewer, ViewerConfig, ViewerThread,
};

#[derive(Parser)]
#[command(name = "prasaran")]
#[command(about = "Stream live map telemetry to WebSocket viewers")]
struct Args {
    /// Configuration file (default: prasaran.toml, then /etc/prasaran.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the WebSocket port from the config
    #[arg(short, long)]
    port: Option<u16>,

    /// Synthetic producer step interval (milliseconds)
    #[arg(long, default_value = "33")]
    step_ms: u64,
}

/// Where the configuration came from, reported once logging is up.
enum ConfigSource {
    File(String),
    Defaults(Option<String>),
}

fn load_config(args: &Args) -> (ViewerConfig, ConfigSource) {
    match &args.config {
        Some(path) => match ViewerConfig::load(path) {
            Ok(cfg) => (cfg, ConfigSource::File(path.clone())),
            Err(e) => (
                ViewerConfig::default(),
                ConfigSource::Defaults(Some(format!("Failed to load config {}: {}", path, e))),
            ),
        },
        None => {
            // Try default paths
            for path in &["prasaran.toml", "/etc/prasaran.toml"] {
                if fs::metadata(path).is_ok()
                    && let Ok(cfg) = ViewerConfig::load(path)
                {
                    return (cfg, ConfigSource::File(path.to_string()));
                }
            }
            (ViewerConfig::default(), ConfigSource::Defaults(None))
        }
    }
}

fn main() {
    let args = Args::parse();
    let (mut config, source) = load_config(&args);
    if let Some(port) = args.port {
        config.stream.port = port;
    }

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .format(|buf, record| {
        writeln!(
            buf,
            "[{}] {} - {}",
            record.level(),
            record.target(),
            record.args()
        )
    })
    .init();

    log::info!("prasaran starting");
    match source {
        ConfigSource::File(path) => log::info!("  Config: {}", path),
        ConfigSource::Defaults(Some(reason)) => log::warn!("{}, using defaults", reason),
        ConfigSource::Defaults(None) => log::info!("  Config: defaults"),
    }
    log::info!("  Stream port: {}", config.stream.port);
    log::info!("  Camera: {} fps", config.camera.fps);

    if let Err(e) = run(config, Duration::from_millis(args.step_ms.max(1))) {
        log::error!("Daemon error: {}", e);
        std::process::exit(1);
    }

    log::info!("prasaran shutdown complete");
}

fn run(config: ViewerConfig, step: Duration) -> prasaran::Result<()> {
    let pose = LatestPose::new();
    let viewer = Viewer::new(config, Box::new(pose.clone()));
    let viewer_thread = ViewerThread::spawn(viewer)?;
    let handle = viewer_thread.viewer().clone();

    // Setup signal handler
    let lifecycle = Arc::clone(handle.lifecycle());
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        lifecycle.request_finish();
    }) {
        log::warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let running = Arc::new(AtomicBool::new(true));
    let producer = spawn_producer(pose, handle.buffers().clone(), step, Arc::clone(&running))?;

    if viewer_thread.join().is_err() {
        log::error!("Viewer thread panicked");
    }

    running.store(false, Ordering::Relaxed);
    if producer.join().is_err() {
        log::error!("Producer thread panicked");
    }
    Ok(())
}

/// Keyframe spacing along the synthetic trajectory, in steps.
const KEYFRAME_EVERY: u64 = 10;
/// Steps per full lap; each lap closes a loop to the first keyframe.
const STEPS_PER_LAP: u64 = 360;
const TRAJECTORY_RADIUS: f32 = 2.0;
const POINTS_PER_KEYFRAME: usize = 24;
/// Recent keyframes considered for covisibility with a new one.
const COVISIBILITY_WINDOW: usize = 8;
/// Keyframes closer than this (meters) share a covisibility edge.
const COVISIBILITY_RADIUS: f32 = 1.2;

fn spawn_producer(
    pose: LatestPose,
    buffers: MapBuffersHandle,
    step: Duration,
    running: Arc<AtomicBool>,
) -> prasaran::Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("producer".into())
        .spawn(move || run_producer(pose, buffers, step, running))?;
    Ok(handle)
}

/// Camera pose on a circle of radius `TRAJECTORY_RADIUS`, looking at the center.
fn trajectory_pose(angle: f32) -> Pose {
    let (s, c) = angle.sin_cos();
    let center = Point3::new(TRAJECTORY_RADIUS * c, 0.0, TRAJECTORY_RADIUS * s);
    // Yaw about the vertical axis
    let rotation = [[-s, 0.0, -c], [0.0, 1.0, 0.0], [c, 0.0, -s]];
    Pose::from_rotation_translation(rotation, center)
}

/// Covisibility edges from `origin` to nearby recent keyframes.
fn covisible_edges(
    keyframes: &[Point3],
    origin: Point3,
) -> impl Iterator<Item = GraphEdge> + '_ {
    let max_sq = COVISIBILITY_RADIUS * COVISIBILITY_RADIUS;
    keyframes
        .iter()
        .rev()
        .take(COVISIBILITY_WINDOW)
        .filter(move |kf| kf.distance_squared(&origin) <= max_sq)
        .map(move |&kf| GraphEdge::new(kf, origin))
}

fn run_producer(
    pose: LatestPose,
    buffers: MapBuffersHandle,
    step: Duration,
    running: Arc<AtomicBool>,
) {
    log::info!("Synthetic producer starting ({:?} per step)", step);

    let mut keyframes: Vec<Point3> = Vec::new();
    let mut n: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let angle = TAU * (n % STEPS_PER_LAP) as f32 / STEPS_PER_LAP as f32;
        let current = trajectory_pose(angle);
        pose.set(current);

        if n % KEYFRAME_EVERY == 0 {
            let origin = current.translation();
            buffers.push_keyframe(current);

            if let Some(&parent) = keyframes.last() {
                buffers.push_spanning_tree_edge(GraphEdge::new(parent, origin));
            }
            buffers.extend_covisibility_edges(covisible_edges(&keyframes, origin));
            if n > 0
                && n % STEPS_PER_LAP == 0
                && let Some(&first) = keyframes.first()
            {
                log::debug!("Closing loop at step {}", n);
                buffers.push_loop_edge(GraphEdge::new(first, origin));
            }
            keyframes.push(origin);

            // Ring of landmarks on the wall behind the trajectory
            let seed = n as f32 * 0.37;
            buffers.extend_map_points((0..POINTS_PER_KEYFRAME).map(|i| {
                let a = angle + (i as f32 - POINTS_PER_KEYFRAME as f32 / 2.0) * 0.02;
                let r = TRAJECTORY_RADIUS * 2.0 + (seed + i as f32).sin() * 0.1;
                let y = ((seed * 1.3 + i as f32 * 0.7).cos()) * 0.8;
                Point3::new(r * a.cos(), y, r * a.sin())
            }));
        }

        // Points currently tracked by the camera
        buffers.extend_reference_points((0..8).map(|i| {
            let a = angle + (i as f32 - 4.0) * 0.03;
            let r = TRAJECTORY_RADIUS * 2.0;
            Point3::new(r * a.cos(), (i as f32 - 4.0) * 0.1, r * a.sin())
        }));
        buffers.set_keypoint_count(600 + ((n * 37) % 400) as i32);

        n += 1;
        thread::sleep(step);
    }

    log::info!("Synthetic producer stopped after {} steps", n);
}
