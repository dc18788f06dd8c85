//! Output sinks
//!
//! Each recording session owns three sinks (front raw, back raw, composed
//! with audio). A sink is a bounded drop-oldest queue in front of a
//! dedicated writer thread; producers never block, and one sink's failure
//! never touches the others.

pub mod coordinator;
pub mod writer;

pub use coordinator::{OutputCoordinator, SessionPaths, SinkReport};
pub use writer::{AudioFormat, ContainerWriter, FfmpegWriter, FfmpegWriterFactory, WriterConfig, WriterFactory};

use crate::frame::{CameraFrame, ComposedFrame, Resolution};
use crate::pool::FrameBuffer;
use crate::queue::BoundedQueue;
use crate::session::SessionEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

/// Queue depth in front of each writer thread
const SINK_QUEUE_DEPTH: usize = 3;

/// Which of the session's three outputs a sink feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkRole {
    FrontRaw,
    BackRaw,
    Composed,
}

impl SinkRole {
    pub fn label(self) -> &'static str {
        match self {
            SinkRole::FrontRaw => "front-raw",
            SinkRole::BackRaw => "back-raw",
            SinkRole::Composed => "composed",
        }
    }
}

impl fmt::Display for SinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal and non-terminal sink states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkStatus {
    Writing,
    Finished,
    Failed(String),
}

/// One video frame bound for a sink
#[derive(Clone)]
pub struct SinkFrame {
    pub pts: Duration,
    pub resolution: Resolution,
    pub pixels: FrameBuffer,
}

impl From<&CameraFrame> for SinkFrame {
    fn from(frame: &CameraFrame) -> Self {
        Self {
            pts: frame.pts,
            resolution: frame.resolution,
            pixels: frame.pixels.clone(),
        }
    }
}

impl From<ComposedFrame> for SinkFrame {
    fn from(frame: ComposedFrame) -> Self {
        Self {
            pts: frame.pts,
            resolution: frame.resolution,
            pixels: frame.pixels,
        }
    }
}

/// A run of PCM audio samples from the designated microphone
#[derive(Clone)]
pub struct AudioChunk {
    pub pts: Duration,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Arc<Vec<i16>>,
}

pub(crate) enum SinkItem {
    Video(SinkFrame),
    Audio(AudioChunk),
}

/// Final accounting for one sink
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkRecord {
    pub role: SinkRole,
    pub path: PathBuf,
    pub status: SinkStatus,
    pub frames_written: u64,
    pub dropped: u64,
    pub discarded: u64,
}

impl SinkRecord {
    pub fn is_valid(&self) -> bool {
        self.status == SinkStatus::Finished
    }
}

/// One output destination with its own lifecycle and writer thread
///
/// Created when a session starts, finalized when it stops, never reused.
pub struct OutputSink {
    role: SinkRole,
    path: PathBuf,
    queue: Arc<BoundedQueue<SinkItem>>,
    status: Arc<Mutex<SinkStatus>>,
    accepting: Arc<AtomicBool>,
    dropped: AtomicU64,
    discarded: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    thread: Option<std::thread::JoinHandle<()>>,
    done_rx: Option<oneshot::Receiver<()>>,
}

impl OutputSink {
    /// Spawn the writer thread over an already-open container writer
    pub(crate) fn spawn(
        role: SinkRole,
        path: PathBuf,
        writer: Box<dyn ContainerWriter>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<Self, crate::error::SinkError> {
        let queue = Arc::new(BoundedQueue::new(SINK_QUEUE_DEPTH));
        let status = Arc::new(Mutex::new(SinkStatus::Writing));
        let written = Arc::new(AtomicU64::new(0));
        let discarded = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = oneshot::channel();

        let thread = {
            let queue = Arc::clone(&queue);
            let status = Arc::clone(&status);
            let written = Arc::clone(&written);
            let discarded = Arc::clone(&discarded);
            std::thread::Builder::new()
                .name(format!("sink-{role}"))
                .spawn(move || {
                    run_writer(role, writer, &queue, &status, &written, &discarded, &events);
                    let _ = done_tx.send(());
                })
                .map_err(|e| crate::error::SinkError::Open {
                    role,
                    reason: format!("failed to spawn writer thread: {e}"),
                })?
        };

        Ok(Self {
            role,
            path,
            queue,
            status,
            accepting: Arc::new(AtomicBool::new(true)),
            dropped: AtomicU64::new(0),
            discarded,
            written,
            thread: Some(thread),
            done_rx: Some(done_rx),
        })
    }

    pub fn role(&self) -> SinkRole {
        self.role
    }

    pub fn status(&self) -> SinkStatus {
        self.status.lock().clone()
    }

    /// Non-blocking enqueue; anything that cannot be queued is counted as a
    /// drop, never waited on
    pub(crate) fn submit(&self, item: SinkItem) {
        if !self.accepting.load(Ordering::SeqCst) || self.status() != SinkStatus::Writing {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.queue.push(item) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stop accepting input and discard anything queued (graceful
    /// degradation for the composed sink)
    pub(crate) fn suspend(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let n = self.queue.clear();
        self.discarded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn resume(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Mark the input finished; queued items still drain
    pub(crate) fn finish(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.queue.finish();
    }

    /// Await the writer thread, bounded by `timeout`; on overrun the queue
    /// is discarded and the thread is left to wind down detached
    pub(crate) async fn join(mut self, timeout: Duration) -> SinkRecord {
        let mut timed_out = false;
        if let Some(done) = self.done_rx.take() {
            if tokio::time::timeout(timeout, done).await.is_err() {
                timed_out = true;
                let n = self.queue.clear();
                self.discarded.fetch_add(n, Ordering::Relaxed);
                tracing::warn!(role = %self.role, "sink did not quiesce in time, discarding queue");
            }
        }
        if let Some(thread) = self.thread.take() {
            if timed_out {
                drop(thread);
            } else {
                let _ = thread.join();
            }
        }

        let status = if timed_out && self.status() == SinkStatus::Writing {
            SinkStatus::Failed("stop timeout".into())
        } else {
            self.status()
        };
        SinkRecord {
            role: self.role,
            path: self.path.clone(),
            status,
            frames_written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Tear down a sink whose session never started: close the thread and
    /// delete the partial file
    pub(crate) fn abort(mut self) {
        self.queue.finish();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(role = %self.role, error = %e, "no partial file to remove");
        }
    }
}

fn run_writer(
    role: SinkRole,
    mut writer: Box<dyn ContainerWriter>,
    queue: &BoundedQueue<SinkItem>,
    status: &Mutex<SinkStatus>,
    written: &AtomicU64,
    discarded: &AtomicU64,
    events: &broadcast::Sender<SessionEvent>,
) {
    tracing::debug!(%role, "sink writer thread started");

    while let Some(item) = queue.pop_blocking() {
        let is_video = matches!(item, SinkItem::Video(_));
        let result = match item {
            SinkItem::Video(frame) => writer.write_video(frame.pts, frame.resolution, &frame.pixels),
            SinkItem::Audio(chunk) => writer.write_audio(&chunk),
        };
        match result {
            Ok(()) => {
                if is_video {
                    written.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::error!(%role, error = %e, "sink write failed, poisoning sink");
                *status.lock() = SinkStatus::Failed(e.to_string());
                let _ = events.send(SessionEvent::SinkFailed {
                    role,
                    reason: e.to_string(),
                });
                // Keep draining so producers see drops, not backpressure;
                // everything drained is accounted as discarded.
                while queue.pop_blocking().is_some() {
                    discarded.fetch_add(1, Ordering::Relaxed);
                }
                break;
            }
        }
    }

    let failed = *status.lock() != SinkStatus::Writing;
    if failed {
        // Best-effort close; the sink already reported its failure.
        let _ = writer.finalize();
    } else {
        match writer.finalize() {
            Ok(()) => *status.lock() = SinkStatus::Finished,
            Err(e) => {
                tracing::error!(%role, error = %e, "sink finalize failed");
                *status.lock() = SinkStatus::Failed(e.to_string());
                let _ = events.send(SessionEvent::SinkFailed {
                    role,
                    reason: e.to_string(),
                });
            }
        }
    }

    tracing::debug!(%role, "sink writer thread stopped");
}
