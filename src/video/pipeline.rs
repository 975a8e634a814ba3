//! Preview and streaming pipelines
//!
//! Each pipeline instance owns one capture session and one blocking loop
//! thread. The loop is the single writer of the instance's state channel;
//! control-plane callers observe state through `watch` and stop the loop
//! through a `CancellationToken` checked once per iteration.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capture::DeviceSession;
use super::compose;
use super::encoder::RtspEncoder;
use super::format::{Resolution, FPS_PRESETS};
use super::normalize::{self, normalize};
use crate::error::{AppError, Result};
use crate::events::{ControlEvent, EventBus, PipelineKind};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Validation reads before a pipeline is considered live
const STARTUP_READ_ATTEMPTS: u32 = 10;

/// Backoff between startup validation reads
const STARTUP_READ_BACKOFF: Duration = Duration::from_millis(200);

/// Pause after a transient read failure while Running
const READ_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Streaming statistics cadence, in frames
const STATS_FRAME_INTERVAL: u64 = 30;

/// Preview statistics cadence, wall clock
const PREVIEW_STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Capture configuration for one pipeline run.
///
/// There is no persisted configuration; reconfiguration is always a full
/// stop and restart with a new value.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// V4L2 device index
    pub camera_index: u32,
    /// Requested capture resolution (drivers may grant another)
    pub resolution: Resolution,
    /// Requested frame rate
    pub fps: u32,
    /// RTSP ingest URL, used by the streaming pipeline only
    pub sink_url: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            resolution: Resolution::VGA,
            fps: 25,
            sink_url: String::new(),
        }
    }
}

impl StreamConfig {
    /// Reject off-preset values before any resource is acquired.
    pub fn validate(&self) -> Result<()> {
        if !self.resolution.is_preset() {
            return Err(AppError::ConfigError(format!(
                "resolution {} is not a preset",
                self.resolution
            )));
        }
        if !FPS_PRESETS.contains(&self.fps) {
            return Err(AppError::ConfigError(format!(
                "frame rate {} is not a preset",
                self.fps
            )));
        }
        Ok(())
    }

    /// Additional check for streaming starts: the sink URL must be present.
    pub fn validate_sink(&self) -> Result<()> {
        if self.sink_url.trim().is_empty() {
            return Err(AppError::ConfigError("RTSP URL must not be empty".into()));
        }
        Ok(())
    }
}

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Terminal for the instance; a restart creates a new instance
    Failed,
}

impl PipelineState {
    /// Legal state transitions. Failed is terminal, Idle is re-enterable
    /// only from Stopping. A stop issued during startup validation goes
    /// Starting to Stopping without ever reaching Running.
    pub fn can_transition(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Idle)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Point-in-time statistics for a running pipeline.
///
/// Wall-clock elapsed time is the single basis for both pipelines; counters
/// reset on every start.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StreamStats {
    pub frame_count: u64,
    pub elapsed_secs: f64,
    pub fps: f64,
}

impl StreamStats {
    pub fn compute(frame_count: u64, started: Instant) -> Self {
        let elapsed_secs = started.elapsed().as_secs_f64();
        let fps = if elapsed_secs > 0.0 {
            frame_count as f64 / elapsed_secs
        } else {
            0.0
        };
        Self {
            frame_count,
            elapsed_secs,
            fps,
        }
    }
}

/// Inter-frame pacing delay. Fixed sleep, so the configured rate is an
/// upper bound on throughput rather than an exact cadence.
pub fn pace_interval(fps: u32) -> Duration {
    Duration::from_millis((1000 / fps.max(1)).max(1) as u64)
}

/// Shared plumbing for both pipeline kinds
struct PipelineHandle {
    kind: PipelineKind,
    cancel: CancellationToken,
    state_rx: watch::Receiver<PipelineState>,
    task: Option<JoinHandle<()>>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl PipelineHandle {
    fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Wait until the loop leaves Starting. Returns the captured error on
    /// failure so callers get a terminal answer for every start attempt.
    async fn wait_until_started(&mut self, camera_index: u32) -> Result<()> {
        loop {
            match self.state() {
                PipelineState::Running => return Ok(()),
                PipelineState::Failed => {
                    let reason = self
                        .last_error()
                        .unwrap_or_else(|| "pipeline failed during startup".to_string());
                    return Err(AppError::DeviceUnavailable {
                        index: camera_index,
                        reason,
                    });
                }
                _ => {
                    if self.state_rx.changed().await.is_err() {
                        return Err(AppError::DeviceUnavailable {
                            index: camera_index,
                            reason: "pipeline exited before reaching Running".to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Cancel the loop and join it. Cancellation reaches the startup
    /// validation retries too, so worst-case latency is one iteration:
    /// one sleep plus one device read.
    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("{} pipeline task join failed: {}", self.kind, e);
            }
        }
    }
}

/// Captures, normalizes, composites and emits `FrameReady` events.
pub struct PreviewPipeline {
    handle: PipelineHandle,
    camera_index: u32,
}

impl PreviewPipeline {
    /// Spawn the preview loop. The returned instance is still Starting;
    /// await `wait_until_started` for a terminal answer.
    pub fn start(config: StreamConfig, viewport: (u32, u32), bus: Arc<EventBus>) -> Self {
        let camera_index = config.camera_index;
        let handle = spawn_pipeline(PipelineKind::Preview, bus, move |ctx| {
            run_preview_loop(config, viewport, ctx)
        });
        Self {
            handle,
            camera_index,
        }
    }

    pub async fn wait_until_started(&mut self) -> Result<()> {
        self.handle.wait_until_started(self.camera_index).await
    }

    pub fn state(&self) -> PipelineState {
        self.handle.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.handle.last_error()
    }

    pub async fn stop(mut self) {
        self.handle.stop().await;
    }
}

/// Captures, normalizes, timestamps and publishes to the RTSP sink.
pub struct StreamingPipeline {
    handle: PipelineHandle,
    camera_index: u32,
}

impl StreamingPipeline {
    pub fn start(config: StreamConfig, bus: Arc<EventBus>) -> Self {
        let camera_index = config.camera_index;
        let handle = spawn_pipeline(PipelineKind::Streaming, bus, move |ctx| {
            run_streaming_loop(config, ctx)
        });
        Self {
            handle,
            camera_index,
        }
    }

    pub async fn wait_until_started(&mut self) -> Result<()> {
        self.handle.wait_until_started(self.camera_index).await
    }

    pub fn state(&self) -> PipelineState {
        self.handle.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.handle.last_error()
    }

    pub async fn stop(mut self) {
        self.handle.stop().await;
    }
}

/// Everything a loop body needs from its handle
struct LoopContext {
    kind: PipelineKind,
    cancel: CancellationToken,
    state_tx: watch::Sender<PipelineState>,
    bus: Arc<EventBus>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl LoopContext {
    /// Publish a state change on both the watch channel and the bus.
    fn set_state(&self, state: PipelineState, message: Option<String>) {
        let prev = *self.state_tx.borrow();
        debug_assert!(
            prev == state || prev.can_transition(state),
            "illegal pipeline transition {} -> {}",
            prev,
            state
        );
        let _ = self.state_tx.send(state);
        self.bus.publish(ControlEvent::StatusChanged {
            pipeline: self.kind,
            state: state.to_string(),
            message,
        });
    }

    /// Record a fatal error, publish it, and mark the instance Failed.
    fn fail(&self, err: AppError) {
        let message = err.to_string();
        error!("{} pipeline failed: {}", self.kind, message);
        *self.last_error.write() = Some(message.clone());
        self.bus.publish(ControlEvent::ErrorOccurred {
            module: self.kind.to_string(),
            message: message.clone(),
        });
        self.set_state(PipelineState::Failed, Some(message));
    }
}

fn spawn_pipeline<F>(kind: PipelineKind, bus: Arc<EventBus>, body: F) -> PipelineHandle
where
    F: FnOnce(LoopContext) + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
    let last_error = Arc::new(RwLock::new(None));

    let ctx = LoopContext {
        kind,
        cancel: cancel.clone(),
        state_tx,
        bus,
        last_error: last_error.clone(),
    };
    let task = tokio::task::spawn_blocking(move || body(ctx));

    PipelineHandle {
        kind,
        cancel,
        state_rx,
        task: Some(task),
        last_error,
    }
}

/// Open the device for a starting pipeline.
fn open_session(config: &StreamConfig, ctx: &LoopContext) -> Option<DeviceSession> {
    ctx.set_state(PipelineState::Starting, None);

    match DeviceSession::open(config.camera_index, config.resolution, config.fps) {
        Ok(session) => Some(session),
        Err(e) => {
            ctx.fail(e);
            None
        }
    }
}

fn run_preview_loop(config: StreamConfig, viewport: (u32, u32), ctx: LoopContext) {
    let session = match open_session(&config, &ctx) {
        Some(session) => session,
        None => return,
    };
    let mut reader = match session.reader() {
        Ok(reader) => reader,
        Err(e) => {
            ctx.fail(e);
            return;
        }
    };

    // Prove the device delivers frames before going Running
    if let Err(e) =
        reader.read_frame_validated(STARTUP_READ_ATTEMPTS, STARTUP_READ_BACKOFF, &ctx.cancel)
    {
        if ctx.cancel.is_cancelled() {
            info!("Preview stopped during startup validation");
            ctx.set_state(PipelineState::Stopping, None);
            ctx.set_state(PipelineState::Idle, None);
            return;
        }
        ctx.fail(AppError::DeviceUnavailable {
            index: config.camera_index,
            reason: format!("no frames during startup validation: {}", e),
        });
        return;
    }

    ctx.set_state(PipelineState::Running, None);
    info!(
        "Preview running: device {} at {}x{}, viewport {}x{}",
        session.index(),
        session.actual_width(),
        session.actual_height(),
        viewport.0,
        viewport.1
    );

    let started = Instant::now();
    let mut last_report = started;
    let throttler = LogThrottler::default();
    let pace = pace_interval(config.fps);
    let mut frame_count: u64 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            ctx.set_state(PipelineState::Stopping, None);
            break;
        }

        match reader.read_frame() {
            Ok(raw) => {
                if let Some(rgb) = normalize(raw) {
                    if let Some(canvas) = compose::fit(&rgb, viewport.0, viewport.1) {
                        ctx.bus.publish(ControlEvent::FrameReady { canvas });
                    }
                    frame_count += 1;
                } else {
                    debug!("Skipping unusable frame");
                }
                throttler.clear("read");
            }
            Err(e) => {
                warn_throttled!(throttler, "read", "Preview read failed: {}", e);
                thread::sleep(READ_RETRY_PAUSE);
            }
        }

        if last_report.elapsed() >= PREVIEW_STATS_INTERVAL {
            let stats = StreamStats::compute(frame_count, started);
            debug!("Preview fps: {:.1}", stats.fps);
            ctx.bus.publish(ControlEvent::StatsUpdated {
                pipeline: PipelineKind::Preview,
                frame_count: stats.frame_count,
                elapsed_secs: stats.elapsed_secs,
                fps: stats.fps,
            });
            last_report = Instant::now();
        }

        thread::sleep(pace);
    }

    session.close();
    drop(reader);
    ctx.set_state(PipelineState::Idle, None);
    info!("Preview stopped after {} frames", frame_count);
}

fn run_streaming_loop(config: StreamConfig, ctx: LoopContext) {
    let session = match open_session(&config, &ctx) {
        Some(session) => session,
        None => return,
    };

    let mut reader = match session.reader() {
        Ok(reader) => reader,
        Err(e) => {
            ctx.fail(e);
            return;
        }
    };

    // Prove the device delivers frames before touching the encoder
    if let Err(e) =
        reader.read_frame_validated(STARTUP_READ_ATTEMPTS, STARTUP_READ_BACKOFF, &ctx.cancel)
    {
        if ctx.cancel.is_cancelled() {
            info!("Stream stopped during startup validation");
            ctx.set_state(PipelineState::Stopping, None);
            ctx.set_state(PipelineState::Idle, None);
            return;
        }
        ctx.fail(AppError::DeviceUnavailable {
            index: config.camera_index,
            reason: format!("no frames during startup validation: {}", e),
        });
        return;
    }

    let mut encoder = match RtspEncoder::configure(
        &config.sink_url,
        session.actual_width(),
        session.actual_height(),
        config.fps,
        normalize::layout_of(session.pixel_format()),
    )
    .and_then(|mut encoder| {
        encoder.start()?;
        Ok(encoder)
    }) {
        Ok(encoder) => encoder,
        Err(e) => {
            session.close();
            ctx.fail(e);
            return;
        }
    };

    ctx.set_state(PipelineState::Running, None);
    info!(
        "Streaming running: device {} at {}x{} -> {}",
        session.index(),
        session.actual_width(),
        session.actual_height(),
        config.sink_url
    );

    let started = Instant::now();
    let throttler = LogThrottler::default();
    let pace = pace_interval(config.fps);
    let mut frame_count: u64 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            ctx.set_state(PipelineState::Stopping, None);
            break;
        }

        match reader.read_frame() {
            Ok(raw) => {
                if let Some(rgb) = normalize(raw) {
                    let ts_micros = started.elapsed().as_micros() as u64;
                    encoder.record(&rgb, ts_micros);
                    frame_count += 1;

                    if frame_count % STATS_FRAME_INTERVAL == 0 {
                        let stats = StreamStats::compute(frame_count, started);
                        debug!(
                            "Streaming: {} frames, {:.1} fps",
                            stats.frame_count, stats.fps
                        );
                        ctx.bus.publish(ControlEvent::StatsUpdated {
                            pipeline: PipelineKind::Streaming,
                            frame_count: stats.frame_count,
                            elapsed_secs: stats.elapsed_secs,
                            fps: stats.fps,
                        });
                    }
                } else {
                    debug!("Skipping unusable frame");
                }
                throttler.clear("read");
            }
            Err(e) => {
                warn_throttled!(throttler, "read", "Streaming read failed: {}", e);
                thread::sleep(READ_RETRY_PAUSE);
            }
        }

        thread::sleep(pace);
    }

    // Finalization order: stop capture, then flush the encoder
    session.close();
    drop(reader);
    encoder.stop();
    ctx.set_state(PipelineState::Idle, None);
    info!("Streaming stopped after {} frames", frame_count);
}
