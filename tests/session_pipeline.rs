//! End-to-end pipeline tests over a mock container writer.
//!
//! The mock records every open/write/finalize call, so tests can assert on
//! what actually reached each sink without spawning ffmpeg.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use twincap::quality::{QualitySignals, StaticTelemetry, TelemetrySource, ThermalLevel};
use twincap::sink::{AudioChunk, ContainerWriter, WriterConfig, WriterFactory};
use twincap::synthetic::{tone_chunk, SyntheticCamera};
use twincap::{
    CameraSource, CompositionLayout, DeviceCapabilities, PipelineError, QualityTier,
    RecordingSession, Resolution, SessionConfig, SessionEvent, SessionState, SinkError, SinkRole,
};

#[derive(Default)]
struct WriterLog {
    opened_with: Option<WriterConfig>,
    video: Vec<(Duration, Resolution)>,
    audio_samples: usize,
    finalized: bool,
}

struct MockWriter {
    role: SinkRole,
    log: Arc<Mutex<WriterLog>>,
    fail_open: bool,
    fail_video_after: Option<usize>,
}

impl ContainerWriter for MockWriter {
    fn open(&mut self, _path: &Path, config: &WriterConfig) -> Result<(), SinkError> {
        if self.fail_open {
            return Err(SinkError::Open {
                role: self.role,
                reason: "injected open failure".into(),
            });
        }
        self.log.lock().opened_with = Some(config.clone());
        Ok(())
    }

    fn write_video(
        &mut self,
        pts: Duration,
        resolution: Resolution,
        _pixels: &[u8],
    ) -> Result<(), SinkError> {
        let mut log = self.log.lock();
        if let Some(limit) = self.fail_video_after {
            if log.video.len() >= limit {
                return Err(SinkError::Write {
                    role: self.role,
                    reason: "injected write failure".into(),
                });
            }
        }
        log.video.push((pts, resolution));
        Ok(())
    }

    fn write_audio(&mut self, chunk: &AudioChunk) -> Result<(), SinkError> {
        self.log.lock().audio_samples += chunk.samples.len();
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        self.log.lock().finalized = true;
        Ok(())
    }
}

#[derive(Default)]
struct MockFactory {
    logs: Mutex<HashMap<SinkRole, Arc<Mutex<WriterLog>>>>,
    fail_open: Option<SinkRole>,
    fail_composed_after: Option<usize>,
}

impl MockFactory {
    fn log(&self, role: SinkRole) -> Arc<Mutex<WriterLog>> {
        Arc::clone(self.logs.lock().entry(role).or_default())
    }
}

impl WriterFactory for MockFactory {
    fn create(&self, role: SinkRole) -> Box<dyn ContainerWriter> {
        Box::new(MockWriter {
            role,
            log: self.log(role),
            fail_open: self.fail_open == Some(role),
            fail_video_after: match role {
                SinkRole::Composed => self.fail_composed_after,
                _ => None,
            },
        })
    }
}

struct SharedTelemetry(Arc<Mutex<QualitySignals>>);

#[async_trait]
impl TelemetrySource for SharedTelemetry {
    async fn sample(&self) -> QualitySignals {
        *self.0.lock()
    }
}

const CAPTURE: Resolution = Resolution::new(64, 36);

fn test_config(dir: &Path) -> SessionConfig {
    let mut config = SessionConfig::new(CompositionLayout::SideBySide, QualityTier::Full, dir);
    config.capture_resolution = CAPTURE;
    config.frame_rate = 30;
    // Keep the quality loop quiet unless a test drives it.
    config.evaluation_interval = Duration::from_secs(60);
    config
}

fn session_with(
    factory: Arc<MockFactory>,
    config: SessionConfig,
) -> Arc<RecordingSession> {
    Arc::new(
        RecordingSession::configure(
            config,
            &DeviceCapabilities::default(),
            factory,
            Arc::new(StaticTelemetry(QualitySignals::nominal())),
        )
        .unwrap(),
    )
}

/// Feed `count` near-simultaneous pairs starting at sequence `start`,
/// pacing slightly so the composition thread keeps up.
fn feed_pairs(session: &RecordingSession, start: u64, count: u64) {
    feed_pairs_paced(session, start, count, Duration::from_millis(2));
}

fn feed_pairs_paced(session: &RecordingSession, start: u64, count: u64, pace: Duration) {
    let front = SyntheticCamera::new(CameraSource::Front, CAPTURE, 30);
    let back = SyntheticCamera::new(CameraSource::Back, CAPTURE, 30);
    for i in start..start + count {
        let pts = Duration::from_micros(i * 33_333);
        session.submit_frame(front.frame_at(i, pts)).unwrap();
        session
            .submit_frame(back.frame_at(i, pts + Duration::from_millis(2)))
            .unwrap();
        std::thread::sleep(pace);
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completes_with_three_finalized_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::default());
    let session = session_with(Arc::clone(&factory), test_config(dir.path()));
    let mut events = session.subscribe();

    session.start().unwrap();
    // Already recording; a second start is an invalid transition.
    assert!(matches!(
        session.start(),
        Err(PipelineError::InvalidState { .. })
    ));
    // Ten seconds of footage, paced so the compositor can hold the rate.
    let pairs = 300u64;
    feed_pairs_paced(&session, 0, pairs, Duration::from_millis(10));
    let result = session.stop().await.unwrap();

    assert_eq!(result.status, SessionState::Completed);
    assert_eq!(session.state(), SessionState::Completed);
    assert!(result.stats.pairs_composed > 0);
    for role in [SinkRole::FrontRaw, SinkRole::BackRaw, SinkRole::Composed] {
        let log = factory.log(role);
        let log = log.lock();
        assert!(log.finalized, "{role} sink was not finalized");
        // Every sink sees roughly one frame per pair, minus drop tolerance.
        assert!(
            log.video.len() as u64 >= pairs * 9 / 10,
            "{role} sink wrote {} of {pairs} frames",
            log.video.len()
        );
    }

    // The composed sink is the only one opened with an audio track.
    assert!(factory
        .log(SinkRole::Composed)
        .lock()
        .opened_with
        .as_ref()
        .unwrap()
        .audio
        .is_some());
    assert!(factory
        .log(SinkRole::FrontRaw)
        .lock()
        .opened_with
        .as_ref()
        .unwrap()
        .audio
        .is_none());

    let events = drain_events(&mut events);
    assert!(matches!(events.first(), Some(SessionEvent::RecordingStarted { .. })));
    assert!(matches!(events.last(), Some(SessionEvent::SessionCompleted(_))));

    // A manifest lands next to the recordings.
    let manifest = std::fs::read_to_string(session.paths().manifest.clone()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&manifest).unwrap();
    assert_eq!(value["sessionId"], result.session_id.as_str());
    assert_eq!(value["status"], "completed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn composed_timestamps_are_strictly_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::default());
    let session = session_with(Arc::clone(&factory), test_config(dir.path()));

    session.start().unwrap();
    feed_pairs(&session, 0, 90);
    session.stop().await.unwrap();

    let log = factory.log(SinkRole::Composed);
    let log = log.lock();
    assert!(log.video.len() > 1);
    for pair in log.video.windows(2) {
        assert!(pair[1].0 > pair[0].0, "composed pts went backwards");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn composed_sink_failure_degrades_without_aborting() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory {
        fail_composed_after: Some(10),
        ..MockFactory::default()
    });
    let session = session_with(Arc::clone(&factory), test_config(dir.path()));
    let mut events = session.subscribe();

    session.start().unwrap();
    feed_pairs(&session, 0, 40);

    // Let the failure propagate, then verify composition halts for the dead
    // sink while raw capture continues.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let composed_at_failure = session.stats().pairs_composed;
    feed_pairs(&session, 40, 20);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.stats().pairs_composed, composed_at_failure);

    let result = session.stop().await.unwrap();

    assert_eq!(result.status, SessionState::CompletedWithDegradation);
    let failures: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::SinkFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        SessionEvent::SinkFailed { role: SinkRole::Composed, .. }
    ));

    // Raw recordings survive at full fidelity.
    for role in [SinkRole::FrontRaw, SinkRole::BackRaw] {
        let record = result.stats.sinks.iter().find(|r| r.role == role).unwrap();
        assert!(record.is_valid());
    }

    // The failed sink's accounting still balances: every composed frame that
    // reached it was written, dropped, or discarded in the failure drain.
    let composed = result
        .stats
        .sinks
        .iter()
        .find(|r| r.role == SinkRole::Composed)
        .unwrap();
    assert!(!composed.is_valid());
    assert_eq!(
        composed.frames_written + composed.dropped + composed.discarded,
        result.stats.pairs_composed,
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_failure_fails_the_session_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory {
        fail_open: Some(SinkRole::BackRaw),
        ..MockFactory::default()
    });
    let session = session_with(Arc::clone(&factory), test_config(dir.path()));
    let mut events = session.subscribe();

    let err = session.start().unwrap_err();
    assert!(matches!(err, PipelineError::Sink(SinkError::Open { .. })));
    assert_eq!(session.state(), SessionState::Failed);

    // The sink opened before the failure is closed again.
    assert!(factory.log(SinkRole::FrontRaw).lock().finalized);
    // No recording ever started, so no events fire.
    assert!(drain_events(&mut events).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejects_frames_outside_recording() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::default());
    let session = session_with(Arc::clone(&factory), test_config(dir.path()));
    let camera = SyntheticCamera::new(CameraSource::Front, CAPTURE, 30);

    let err = session.submit_frame(camera.frame_at(0, Duration::ZERO));
    assert!(matches!(err, Err(PipelineError::InvalidState { .. })));

    session.start().unwrap();
    session.stop().await.unwrap();

    let err = session.submit_frame(camera.frame_at(1, Duration::from_millis(33)));
    assert!(matches!(err, Err(PipelineError::InvalidState { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audio_reaches_only_the_composed_sink() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::default());
    let config = test_config(dir.path());
    let audio = config.audio;
    let session = session_with(Arc::clone(&factory), config);

    session.start().unwrap();
    feed_pairs(&session, 0, 10);
    for i in 0..10u64 {
        session
            .submit_audio(tone_chunk(
                Duration::from_micros(i * 33_333),
                audio,
                Duration::from_micros(33_333),
            ))
            .unwrap();
    }
    session.stop().await.unwrap();

    assert!(factory.log(SinkRole::Composed).lock().audio_samples > 0);
    assert_eq!(factory.log(SinkRole::FrontRaw).lock().audio_samples, 0);
    assert_eq!(factory.log(SinkRole::BackRaw).lock().audio_samples, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_sink_accounting_balances() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::default());
    let session = session_with(Arc::clone(&factory), test_config(dir.path()));

    session.start().unwrap();
    let submitted = 60u64;
    feed_pairs(&session, 0, submitted);
    let result = session.stop().await.unwrap();

    for role in [SinkRole::FrontRaw, SinkRole::BackRaw] {
        let record = result.stats.sinks.iter().find(|r| r.role == role).unwrap();
        assert_eq!(
            record.frames_written + record.dropped + record.discarded,
            submitted,
            "{role} accounting does not balance"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thermal_pressure_downgrades_the_composed_output() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::default());
    let mut config = test_config(dir.path());
    config.evaluation_interval = Duration::from_millis(50);
    let signals = Arc::new(Mutex::new(QualitySignals::nominal()));

    let session = Arc::new(
        RecordingSession::configure(
            config,
            &DeviceCapabilities::default(),
            factory.clone() as Arc<dyn WriterFactory>,
            Arc::new(SharedTelemetry(Arc::clone(&signals))),
        )
        .unwrap(),
    );
    let mut events = session.subscribe();

    session.start().unwrap();
    feed_pairs(&session, 0, 15);

    // Keep frames flowing while pressure is applied so composition happens
    // at the downgraded tier.
    signals.lock().thermal = ThermalLevel::Serious;
    feed_pairs(&session, 15, 60);
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.stop().await.unwrap();

    let downgrade = drain_events(&mut events).into_iter().find_map(|e| match e {
        SessionEvent::QualityChanged { old, new, .. } => Some((old, new)),
        _ => None,
    });
    let (old, new) = downgrade.expect("expected a quality change");
    assert_eq!(old, QualityTier::Full);
    assert!(new < old);

    // Frames composed after the downgrade come out smaller; raw sinks are
    // untouched.
    let composed = factory.log(SinkRole::Composed);
    let composed = composed.lock();
    assert!(composed
        .video
        .iter()
        .any(|(_, r)| *r != QualityTier::Full.resolution()));
    let raw = factory.log(SinkRole::FrontRaw);
    assert!(raw.lock().video.iter().all(|(_, r)| *r == CAPTURE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn floor_pressure_suspends_composition_until_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::default());
    let mut config = test_config(dir.path());
    config.initial_tier = QualityTier::Minimal;
    config.evaluation_interval = Duration::from_millis(50);
    config.upgrade_hysteresis = 2;
    let signals = Arc::new(Mutex::new(QualitySignals::nominal()));

    let session = Arc::new(
        RecordingSession::configure(
            config,
            &DeviceCapabilities::default(),
            factory.clone() as Arc<dyn WriterFactory>,
            Arc::new(SharedTelemetry(Arc::clone(&signals))),
        )
        .unwrap(),
    );
    let mut events = session.subscribe();

    session.start().unwrap();
    feed_pairs(&session, 0, 15);

    // Pressure at the floor tier sheds the composed sink entirely.
    signals.lock().thermal = ThermalLevel::Serious;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let composed = factory.log(SinkRole::Composed);
    let raw = factory.log(SinkRole::FrontRaw);
    let composed_while_suspended = composed.lock().video.len();
    let raw_before = raw.lock().video.len();
    feed_pairs(&session, 15, 20);
    assert!(
        raw.lock().video.len() > raw_before,
        "raw sinks must keep writing during suspension"
    );
    assert_eq!(
        composed.lock().video.len(),
        composed_while_suspended,
        "composed sink received frames while suspended"
    );

    // Recovery resumes composition before any tier upgrade.
    signals.lock().thermal = ThermalLevel::Nominal;
    tokio::time::sleep(Duration::from_millis(250)).await;
    feed_pairs(&session, 40, 20);
    session.stop().await.unwrap();

    assert!(
        composed.lock().video.len() > composed_while_suspended,
        "composition did not resume after recovery"
    );
    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::CompositionSuspended)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::CompositionResumed)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn layout_changes_apply_mid_session() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::default());
    let session = session_with(Arc::clone(&factory), test_config(dir.path()));

    session.start().unwrap();
    feed_pairs(&session, 0, 20);
    session
        .set_layout(CompositionLayout::PrimarySecondary {
            primary: CameraSource::Back,
        })
        .unwrap();
    feed_pairs(&session, 20, 20);
    let result = session.stop().await.unwrap();

    assert_eq!(result.status, SessionState::Completed);
    assert!(result.stats.pairs_composed > 0);
}

#[test]
fn capability_gaps_are_rejected_at_configure() {
    let factory: Arc<dyn WriterFactory> = Arc::new(MockFactory::default());
    let no_front = DeviceCapabilities {
        has_front_camera: false,
        ..DeviceCapabilities::default()
    };
    let err = RecordingSession::configure(
        test_config(Path::new("out")),
        &no_front,
        Arc::clone(&factory),
        Arc::new(StaticTelemetry(QualitySignals::nominal())),
    );
    assert!(matches!(err, Err(PipelineError::Capability(_))));

    let no_accel = DeviceCapabilities {
        has_accelerator: false,
        ..DeviceCapabilities::default()
    };
    let err = RecordingSession::configure(
        test_config(Path::new("out")),
        &no_accel,
        factory,
        Arc::new(StaticTelemetry(QualitySignals::nominal())),
    );
    assert!(matches!(err, Err(PipelineError::Capability(_))));
}
