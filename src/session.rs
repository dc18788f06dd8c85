//! Recording session
//!
//! The orchestrating state machine for one record/stop cycle. The session
//! owns every stage for its lifetime; stages communicate only through
//! queues and channels, and status reaches the surrounding application
//! through a single typed event stream.

use crate::compositor::{CompositionLayout, FrameCompositor};
use crate::error::{PipelineError, Result};
use crate::frame::{CameraFrame, CameraSource, FramePair, Resolution};
use crate::pool::BufferPool;
use crate::quality::{
    MemoryPressure, QualityController, QualityControllerConfig, QualityTier, TelemetrySource,
};
use crate::queue::BoundedQueue;
use crate::sink::coordinator::{CoordinatorConfig, SinkOutcome};
use crate::sink::{
    AudioChunk, AudioFormat, OutputCoordinator, SessionPaths, SinkRecord, SinkRole, WriterFactory,
};
use crate::sync::{CaptureSynchronizer, SyncConfig};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, watch};

/// Pairs buffered between the synchronizer and the composition thread
const PAIR_QUEUE_DEPTH: usize = 2;

/// What the device offers, resolved once at configure time
#[derive(Debug, Clone, Copy)]
pub struct DeviceCapabilities {
    pub has_front_camera: bool,
    pub has_back_camera: bool,
    /// A composition-capable accelerator; absent means the composed output
    /// cannot be produced at all
    pub has_accelerator: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            has_front_camera: true,
            has_back_camera: true,
            has_accelerator: true,
        }
    }
}

/// Configuration for one recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub layout: CompositionLayout,
    pub initial_tier: QualityTier,
    pub output_dir: PathBuf,

    /// Resolution the raw per-camera streams are written at
    pub capture_resolution: Resolution,
    pub frame_rate: u32,

    /// Which camera's microphone feeds the composed sink
    pub audio_source: CameraSource,
    pub audio: AudioFormat,

    /// Favorable evaluation cycles required before a quality upgrade
    pub upgrade_hysteresis: u32,
    #[serde(with = "duration_secs")]
    pub evaluation_interval: Duration,
    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,

    /// Hard cap on outstanding pooled buffers
    pub pool_cap: usize,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(d)?))
    }
}

impl SessionConfig {
    pub fn new(
        layout: CompositionLayout,
        initial_tier: QualityTier,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            layout,
            initial_tier,
            output_dir: output_dir.into(),
            capture_resolution: Resolution::new(1920, 1080),
            frame_rate: 30,
            audio_source: CameraSource::Back,
            audio: AudioFormat::default(),
            upgrade_hysteresis: 3,
            evaluation_interval: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
            pool_cap: 32,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.frame_rate == 0 {
            return Err(PipelineError::Config("frame rate must be non-zero".into()));
        }
        if self.capture_resolution.width == 0 || self.capture_resolution.height == 0 {
            return Err(PipelineError::Config("capture resolution must be non-zero".into()));
        }
        if self.upgrade_hysteresis == 0 {
            return Err(PipelineError::Config("upgrade hysteresis must be at least 1".into()));
        }
        if self.pool_cap == 0 {
            return Err(PipelineError::Config("pool cap must be at least 1".into()));
        }
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Configuring,
    Recording,
    Stopping,
    Completed,
    CompletedWithDegradation,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::CompletedWithDegradation | SessionState::Failed
        )
    }

    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Completed => "completed",
            SessionState::CompletedWithDegradation => "completed_with_degradation",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events emitted during a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RecordingStarted { session_id: String },
    SyncDegraded,
    SyncRecovered,
    QualityChanged {
        old: QualityTier,
        new: QualityTier,
        reason: crate::quality::QualityReason,
    },
    CompositionSuspended,
    CompositionResumed,
    SinkFailed { role: SinkRole, reason: String },
    SessionCompleted(SessionResult),
}

/// Aggregated transient-loss counters and final sink accounting
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub duration_secs: f64,
    pub sync_misses: u64,
    pub pairs_emitted: u64,
    pub pairs_composed: u64,
    /// Pairs lost to queue overflow or composition failure
    pub compositor_drops: u64,
    /// Pairs intentionally skipped to honor the tier's target frame rate
    pub rate_limited: u64,
    pub pool_misses: u64,
    pub sinks: Vec<SinkRecord>,
}

/// Final result of a stopped session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    pub session_id: String,
    pub front_path: PathBuf,
    pub back_path: PathBuf,
    pub composed_path: PathBuf,
    pub status: SessionState,
    pub stats: SessionStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionManifest<'a> {
    session_id: &'a str,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    layout: &'a CompositionLayout,
    initial_tier: QualityTier,
    final_tier: QualityTier,
    status: SessionState,
    stats: &'a SessionStats,
}

/// Control values pushed from the quality loop into the composition thread
#[derive(Debug, Clone)]
struct ControlState {
    tier: QualityTier,
    layout: CompositionLayout,
    suspended: bool,
}

struct Active {
    coordinator: Arc<OutputCoordinator>,
    pair_queue: Arc<BoundedQueue<FramePair>>,
    compose_thread: Option<std::thread::JoinHandle<()>>,
    compose_done: oneshot::Receiver<()>,
    quality_task: tokio::task::JoinHandle<QualityTier>,
    quality_shutdown: oneshot::Sender<()>,
    compositor_drops: Arc<AtomicU64>,
    pairs_composed: Arc<AtomicU64>,
    rate_limited: Arc<AtomicU64>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

/// One record/stop cycle over the whole pipeline
///
/// Owns the synchronizer, compositor, quality loop, and output coordinator
/// arena-style for its lifetime. Capture callbacks feed `submit_frame` and
/// `submit_audio`; the surrounding application consumes the event stream.
pub struct RecordingSession {
    config: SessionConfig,
    session_id: String,
    paths: SessionPaths,
    state: Arc<RwLock<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
    sync: Arc<CaptureSynchronizer>,
    pool: BufferPool,
    control_tx: Arc<watch::Sender<ControlState>>,
    control_rx: watch::Receiver<ControlState>,
    factory: Arc<dyn WriterFactory>,
    telemetry: Arc<dyn TelemetrySource>,
    active: Mutex<Option<Active>>,
}

impl RecordingSession {
    /// Validate configuration and device capabilities, resolving the
    /// execution plan before any recording starts
    pub fn configure(
        config: SessionConfig,
        capabilities: &DeviceCapabilities,
        factory: Arc<dyn WriterFactory>,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> Result<Self> {
        config.validate()?;
        if !capabilities.has_front_camera || !capabilities.has_back_camera {
            return Err(PipelineError::Capability(
                "dual-camera capture requires both cameras".into(),
            ));
        }
        if !capabilities.has_accelerator {
            return Err(PipelineError::Capability(
                "no composition accelerator available".into(),
            ));
        }

        let session_id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let paths = SessionPaths::new(&config.output_dir, &session_id);
        let (events, _) = broadcast::channel(100);
        let (control_tx, control_rx) = watch::channel(ControlState {
            tier: config.initial_tier,
            layout: config.layout,
            suspended: false,
        });
        let pool = BufferPool::new(config.pool_cap);
        let sync = Arc::new(CaptureSynchronizer::new(SyncConfig::for_frame_rate(
            config.frame_rate,
        )));

        tracing::info!(%session_id, layout = ?config.layout, tier = %config.initial_tier, "session configured");

        Ok(Self {
            config,
            session_id,
            paths,
            state: Arc::new(RwLock::new(SessionState::Configuring)),
            events,
            sync,
            pool,
            control_tx: Arc::new(control_tx),
            control_rx,
            factory,
            telemetry,
            active: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Subscribe to the session's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Open all three sinks and start accepting frames
    pub fn start(&self) -> Result<()> {
        self.transition(&[SessionState::Configuring], SessionState::Recording)?;

        let coordinator_config = CoordinatorConfig {
            frame_rate: self.config.frame_rate,
            raw_resolution: self.config.capture_resolution,
            composed_resolution: self.config.initial_tier.resolution(),
            audio: self.config.audio,
        };
        let coordinator = match OutputCoordinator::open(
            &self.paths,
            &coordinator_config,
            self.factory.as_ref(),
            self.events.clone(),
        ) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                *self.state.write() = SessionState::Failed;
                return Err(e.into());
            }
        };

        let pair_queue = Arc::new(BoundedQueue::new(PAIR_QUEUE_DEPTH));
        let compositor_drops = Arc::new(AtomicU64::new(0));
        let pairs_composed = Arc::new(AtomicU64::new(0));
        let rate_limited = Arc::new(AtomicU64::new(0));
        let (compose_done_tx, compose_done) = oneshot::channel();

        let mut compositor = FrameCompositor::new(self.pool.clone());
        let latency = compositor.latency();

        let compose_thread = {
            let queue = Arc::clone(&pair_queue);
            let coordinator = Arc::clone(&coordinator);
            let control_rx = self.control_rx.clone();
            let drops = Arc::clone(&compositor_drops);
            let composed = Arc::clone(&pairs_composed);
            let limited = Arc::clone(&rate_limited);
            std::thread::Builder::new()
                .name("compositor".into())
                .spawn(move || {
                    run_compositor(
                        &queue,
                        &coordinator,
                        control_rx,
                        &mut compositor,
                        &drops,
                        &composed,
                        &limited,
                    );
                    let _ = compose_done_tx.send(());
                })
                .map_err(PipelineError::Io)?
        };

        let (quality_shutdown, shutdown_rx) = oneshot::channel();
        let quality_task = self.spawn_quality_loop(Arc::clone(&coordinator), latency, shutdown_rx);

        *self.active.lock() = Some(Active {
            coordinator,
            pair_queue,
            compose_thread: Some(compose_thread),
            compose_done,
            quality_task,
            quality_shutdown,
            compositor_drops,
            pairs_composed,
            rate_limited,
            started_at: Instant::now(),
            started_wall: Utc::now(),
        });

        self.emit(SessionEvent::RecordingStarted {
            session_id: self.session_id.clone(),
        });
        tracing::info!(session_id = %self.session_id, "recording started");
        Ok(())
    }

    /// Hot path: accept one camera frame
    ///
    /// Fans the frame out to its raw sink and the synchronizer; a completed
    /// pair goes to the composition queue. Never blocks; anything that
    /// cannot keep up is dropped and counted.
    pub fn submit_frame(&self, frame: CameraFrame) -> Result<()> {
        let active = self.active.lock();
        let Some(active) = active.as_ref() else {
            return Err(self.state_error("recording"));
        };
        if self.state() != SessionState::Recording {
            return Err(self.state_error("recording"));
        }

        active.coordinator.submit_raw(frame.source, &frame);

        let result = self.sync.submit(frame);
        match result.degraded_transition {
            Some(true) => self.emit(SessionEvent::SyncDegraded),
            Some(false) => self.emit(SessionEvent::SyncRecovered),
            None => {}
        }
        if let Some(pair) = result.pair {
            if active.pair_queue.push(pair) {
                active.compositor_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Accept audio samples from the designated microphone
    pub fn submit_audio(&self, chunk: AudioChunk) -> Result<()> {
        let active = self.active.lock();
        let Some(active) = active.as_ref() else {
            return Err(self.state_error("recording"));
        };
        if self.state() != SessionState::Recording {
            return Err(self.state_error("recording"));
        }
        active.coordinator.submit_audio(chunk);
        Ok(())
    }

    /// Change the composition layout; applied at the next pair boundary
    pub fn set_layout(&self, layout: CompositionLayout) -> Result<()> {
        if self.state() != SessionState::Recording {
            return Err(self.state_error("recording"));
        }
        self.control_tx.send_modify(|c| c.layout = layout);
        tracing::info!(?layout, "layout changed");
        Ok(())
    }

    /// Snapshot of session statistics
    pub fn stats(&self) -> SessionStats {
        let active = self.active.lock();
        let (duration, composed, drops, limited) = match active.as_ref() {
            Some(a) => (
                a.started_at.elapsed().as_secs_f64(),
                a.pairs_composed.load(Ordering::Relaxed),
                a.compositor_drops.load(Ordering::Relaxed),
                a.rate_limited.load(Ordering::Relaxed),
            ),
            None => (0.0, 0, 0, 0),
        };
        SessionStats {
            duration_secs: duration,
            sync_misses: self.sync.misses(),
            pairs_emitted: self.sync.pairs(),
            pairs_composed: composed,
            compositor_drops: drops,
            rate_limited: limited,
            pool_misses: self.pool.misses(),
            sinks: Vec::new(),
        }
    }

    /// Stop recording: quiesce stages cooperatively, drain and finalize all
    /// sinks, write the session manifest, and report the terminal state
    /// exactly once
    pub async fn stop(&self) -> Result<SessionResult> {
        self.transition(&[SessionState::Recording], SessionState::Stopping)?;
        tracing::info!(session_id = %self.session_id, "stopping session");

        let Some(mut active) = self.active.lock().take() else {
            return Err(self.state_error("recording"));
        };

        // Composition drains its queue and exits.
        active.pair_queue.finish();
        let timeout = self.config.stop_timeout;
        let compose_timed_out = tokio::time::timeout(timeout, active.compose_done)
            .await
            .is_err();
        if let Some(thread) = active.compose_thread.take() {
            if compose_timed_out {
                tracing::warn!("compositor did not quiesce in time, detaching");
                drop(thread);
            } else {
                let _ = thread.join();
            }
        }

        // Quality loop shuts down and reports the final tier.
        let _ = active.quality_shutdown.send(());
        let final_tier = active.quality_task.await.unwrap_or(self.config.initial_tier);

        let report = active.coordinator.stop(timeout).await;
        let outcome = report.outcome();

        let mut stats = SessionStats {
            duration_secs: active.started_at.elapsed().as_secs_f64(),
            sync_misses: self.sync.misses(),
            pairs_emitted: self.sync.pairs(),
            pairs_composed: active.pairs_composed.load(Ordering::Relaxed),
            compositor_drops: active.compositor_drops.load(Ordering::Relaxed),
            rate_limited: active.rate_limited.load(Ordering::Relaxed),
            pool_misses: self.pool.misses(),
            sinks: Vec::new(),
        };
        stats.sinks = report.records.clone();

        let status = match outcome {
            SinkOutcome::Completed if !compose_timed_out => SessionState::Completed,
            SinkOutcome::Completed | SinkOutcome::Degraded => {
                SessionState::CompletedWithDegradation
            }
            SinkOutcome::Failed => SessionState::Failed,
        };

        let result = SessionResult {
            session_id: self.session_id.clone(),
            front_path: self.paths.front.clone(),
            back_path: self.paths.back.clone(),
            composed_path: self.paths.composed.clone(),
            status,
            stats,
        };

        if let Err(e) = self.write_manifest(&result, active.started_wall, final_tier) {
            tracing::warn!(error = %e, "failed to write session manifest");
        }

        *self.state.write() = status;
        self.emit(SessionEvent::SessionCompleted(result.clone()));
        tracing::info!(session_id = %self.session_id, %status, "session finished");
        Ok(result)
    }

    fn write_manifest(
        &self,
        result: &SessionResult,
        started_wall: DateTime<Utc>,
        final_tier: QualityTier,
    ) -> Result<()> {
        let manifest = SessionManifest {
            session_id: &self.session_id,
            started_at: started_wall,
            ended_at: Utc::now(),
            layout: &self.config.layout,
            initial_tier: self.config.initial_tier,
            final_tier,
            status: result.status,
            stats: &result.stats,
        };
        let file = std::fs::File::create(&self.paths.manifest)?;
        serde_json::to_writer_pretty(file, &manifest)?;
        Ok(())
    }

    fn spawn_quality_loop(
        &self,
        coordinator: Arc<OutputCoordinator>,
        latency: Arc<crate::compositor::LatencyTracker>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<QualityTier> {
        let mut controller = QualityController::new(
            self.config.initial_tier,
            QualityControllerConfig {
                upgrade_hysteresis: self.config.upgrade_hysteresis,
                frame_interval: self.config.frame_interval(),
            },
        );
        let telemetry = Arc::clone(&self.telemetry);
        let sync = Arc::clone(&self.sync);
        let pool = self.pool.clone();
        let control_tx = Arc::clone(&self.control_tx);
        let events = self.events.clone();
        let interval = self.config.evaluation_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick completes immediately
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = ticker.tick() => {
                        let mut signals = telemetry.sample().await;
                        signals.compositor_latency = latency.trailing_average();
                        signals.sync_degraded = sync.is_degraded();
                        if pool.is_exhausted() {
                            signals.memory = MemoryPressure::Critical;
                        }
                        let Some(decision) = controller.evaluate(&signals) else {
                            continue;
                        };
                        if decision.suspend_composition {
                            coordinator.suspend_composed();
                            control_tx.send_modify(|c| c.suspended = true);
                            let _ = events.send(SessionEvent::CompositionSuspended);
                        }
                        if decision.resume_composition {
                            coordinator.resume_composed();
                            control_tx.send_modify(|c| c.suspended = false);
                            let _ = events.send(SessionEvent::CompositionResumed);
                        }
                        if decision.new != decision.old {
                            control_tx.send_modify(|c| c.tier = decision.new);
                            let _ = events.send(SessionEvent::QualityChanged {
                                old: decision.old,
                                new: decision.new,
                                reason: decision.reason,
                            });
                        }
                    }
                }
            }
            controller.tier()
        })
    }

    fn transition(&self, expected: &[SessionState], next: SessionState) -> Result<()> {
        let mut state = self.state.write();
        if !expected.contains(&*state) {
            return Err(PipelineError::InvalidState {
                expected: expected.first().map(|s| s.name()).unwrap_or("?"),
                actual: state.name(),
            });
        }
        *state = next;
        Ok(())
    }

    fn state_error(&self, expected: &'static str) -> PipelineError {
        PipelineError::InvalidState {
            expected,
            actual: self.state().name(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[allow(clippy::too_many_arguments)]
fn run_compositor(
    queue: &BoundedQueue<FramePair>,
    coordinator: &OutputCoordinator,
    control_rx: watch::Receiver<ControlState>,
    compositor: &mut FrameCompositor,
    drops: &AtomicU64,
    composed: &AtomicU64,
    rate_limited: &AtomicU64,
) {
    tracing::debug!("composition thread started");
    let mut last_pts: Option<Duration> = None;

    while let Some(pair) = queue.pop_blocking() {
        let control = control_rx.borrow().clone();
        // No point composing into a suspended or irrecoverably failed sink.
        if control.suspended || coordinator.composed_failed() {
            continue;
        }

        // Honor the tier's target frame rate by skipping pairs that arrive
        // faster than its interval.
        let min_interval =
            Duration::from_secs_f64(1.0 / control.tier.frame_rate() as f64).mul_f64(0.9);
        if let Some(last) = last_pts {
            if pair.pts < last + min_interval {
                rate_limited.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        match compositor.compose(&pair, &control.layout, control.tier) {
            Ok(frame) => {
                last_pts = Some(frame.pts);
                coordinator.submit_composed(frame);
                composed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                drops.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "composition failed, dropping pair");
            }
        }
    }

    tracing::debug!("composition thread stopped");
}
