//! Output coordinator
//!
//! Owns the three sinks of a recording session and drives their synchronized
//! lifecycle: atomic open, non-blocking fan-out of frames and audio, and a
//! drain-and-finalize stop bounded by a timeout.

use crate::error::SinkError;
use crate::frame::{CameraFrame, CameraSource, ComposedFrame, Resolution};
use crate::session::SessionEvent;
use crate::sink::writer::{AudioFormat, WriterConfig, WriterFactory};
use crate::sink::{AudioChunk, OutputSink, SinkItem, SinkRecord, SinkRole, SinkStatus};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;

/// The three container files (plus manifest) of one session, sharing the
/// session identifier in their names
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub front: PathBuf,
    pub back: PathBuf,
    pub composed: PathBuf,
    pub manifest: PathBuf,
}

impl SessionPaths {
    pub fn new(output_dir: &Path, session_id: &str) -> Self {
        Self {
            front: output_dir.join(format!("{session_id}-front.mp4")),
            back: output_dir.join(format!("{session_id}-back.mp4")),
            composed: output_dir.join(format!("{session_id}-composed.mp4")),
            manifest: output_dir.join(format!("{session_id}-session.json")),
        }
    }

    pub fn for_role(&self, role: SinkRole) -> &Path {
        match role {
            SinkRole::FrontRaw => &self.front,
            SinkRole::BackRaw => &self.back,
            SinkRole::Composed => &self.composed,
        }
    }
}

/// Writer geometry for one session
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub frame_rate: u32,
    pub raw_resolution: Resolution,
    pub composed_resolution: Resolution,
    pub audio: AudioFormat,
}

impl CoordinatorConfig {
    fn writer_config(&self, role: SinkRole) -> WriterConfig {
        match role {
            SinkRole::FrontRaw | SinkRole::BackRaw => WriterConfig {
                resolution: self.raw_resolution,
                frame_rate: self.frame_rate,
                audio: None,
            },
            SinkRole::Composed => WriterConfig {
                resolution: self.composed_resolution,
                frame_rate: self.frame_rate,
                audio: Some(self.audio),
            },
        }
    }
}

/// Aggregate outcome across the three sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Every sink finished cleanly with nothing discarded
    Completed,
    /// At least one valid output, but something failed or was discarded
    Degraded,
    /// No valid output at all
    Failed,
}

/// Final per-sink accounting for a stopped session
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkReport {
    pub records: Vec<SinkRecord>,
}

impl SinkReport {
    pub fn outcome(&self) -> SinkOutcome {
        let valid = self.records.iter().filter(|r| r.is_valid()).count();
        if valid == 0 {
            return SinkOutcome::Failed;
        }
        let clean = self
            .records
            .iter()
            .all(|r| r.is_valid() && r.discarded == 0);
        if clean {
            SinkOutcome::Completed
        } else {
            SinkOutcome::Degraded
        }
    }
}

/// Drives the three output sinks of one session
///
/// All submission paths are non-blocking enqueue-or-drop; only `stop` awaits
/// drainage, bounded by its timeout.
pub struct OutputCoordinator {
    front: Mutex<Option<OutputSink>>,
    back: Mutex<Option<OutputSink>>,
    composed: Mutex<Option<OutputSink>>,
}

impl OutputCoordinator {
    /// Open all three sinks before any data is accepted
    ///
    /// If any sink fails to open, the ones already open are closed and their
    /// partial files deleted, and the whole open fails.
    pub fn open(
        paths: &SessionPaths,
        config: &CoordinatorConfig,
        factory: &dyn WriterFactory,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<Self, SinkError> {
        let roles = [SinkRole::FrontRaw, SinkRole::BackRaw, SinkRole::Composed];
        let mut opened: Vec<OutputSink> = Vec::with_capacity(roles.len());

        for role in roles {
            let path = paths.for_role(role);
            let mut writer = factory.create(role);
            let result = writer
                .open(path, &config.writer_config(role))
                .and_then(|()| OutputSink::spawn(role, path.to_path_buf(), writer, events.clone()));
            match result {
                Ok(sink) => opened.push(sink),
                Err(e) => {
                    tracing::error!(%role, error = %e, "sink open failed, aborting session atomically");
                    for sink in opened {
                        sink.abort();
                    }
                    let _ = std::fs::remove_file(path);
                    return Err(e);
                }
            }
        }

        let mut opened = opened.into_iter();
        Ok(Self {
            front: Mutex::new(opened.next()),
            back: Mutex::new(opened.next()),
            composed: Mutex::new(opened.next()),
        })
    }

    fn slot(&self, role: SinkRole) -> &Mutex<Option<OutputSink>> {
        match role {
            SinkRole::FrontRaw => &self.front,
            SinkRole::BackRaw => &self.back,
            SinkRole::Composed => &self.composed,
        }
    }

    /// Enqueue a raw camera frame on its sink
    pub fn submit_raw(&self, source: CameraSource, frame: &CameraFrame) {
        let role = match source {
            CameraSource::Front => SinkRole::FrontRaw,
            CameraSource::Back => SinkRole::BackRaw,
        };
        if let Some(sink) = &*self.slot(role).lock() {
            sink.submit(SinkItem::Video(frame.into()));
        }
    }

    /// Enqueue a composed frame
    pub fn submit_composed(&self, frame: ComposedFrame) {
        if let Some(sink) = &*self.composed.lock() {
            sink.submit(SinkItem::Video(frame.into()));
        }
    }

    /// Enqueue audio for the composed sink
    pub fn submit_audio(&self, chunk: AudioChunk) {
        if let Some(sink) = &*self.composed.lock() {
            sink.submit(SinkItem::Audio(chunk));
        }
    }

    /// Graceful degradation: stop feeding the composed sink, raw sinks stay
    /// active
    pub fn suspend_composed(&self) {
        if let Some(sink) = &*self.composed.lock() {
            sink.suspend();
        }
    }

    pub fn resume_composed(&self) {
        if let Some(sink) = &*self.composed.lock() {
            sink.resume();
        }
    }

    /// Whether the composed sink has failed irrecoverably
    pub fn composed_failed(&self) -> bool {
        self.composed
            .lock()
            .as_ref()
            .map(|s| matches!(s.status(), SinkStatus::Failed(_)))
            .unwrap_or(false)
    }

    /// Finish inputs, drain queues, finalize containers, and aggregate
    ///
    /// The only awaiting operation in the pipeline; bounded by `timeout` per
    /// sink, after which remaining queued data is discarded.
    pub async fn stop(&self, timeout: Duration) -> SinkReport {
        let sinks: Vec<OutputSink> = [&self.front, &self.back, &self.composed]
            .iter()
            .filter_map(|slot| slot.lock().take())
            .collect();

        for sink in &sinks {
            sink.finish();
        }

        let mut records = Vec::with_capacity(sinks.len());
        for sink in sinks {
            records.push(sink.join(timeout).await);
        }

        for record in &records {
            tracing::info!(
                role = %record.role,
                status = ?record.status,
                frames = record.frames_written,
                dropped = record.dropped,
                discarded = record.discarded,
                "sink closed"
            );
        }

        SinkReport { records }
    }
}
