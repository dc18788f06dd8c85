//! twincap - dual-camera capture, composition, and recording pipeline.
//!
//! Ingests two independently-clocked camera streams, pairs them within a
//! timestamp tolerance, composes each pair under a selectable layout, and
//! records three container files per session (front raw, back raw, composed
//! with audio). A feedback quality controller adapts the composed output to
//! thermal, memory, and latency pressure while the raw recordings stay at
//! full fidelity.
//!
//! [`session::RecordingSession`] is the entry point; capture callbacks feed
//! [`session::RecordingSession::submit_frame`] and everything downstream is
//! non-blocking from the caller's point of view.

pub mod compositor;
pub mod error;
pub mod frame;
pub mod pool;
pub(crate) mod queue;
pub mod quality;
pub mod session;
pub mod sink;
pub mod sync;
pub mod synthetic;

pub use compositor::{CompositionLayout, FrameCompositor, PipCorner, PipSize};
pub use error::{PipelineError, Result, SinkError};
pub use frame::{CameraFrame, CameraSource, ComposedFrame, FramePair, Resolution};
pub use pool::{BufferPool, FrameBuffer};
pub use quality::{
    BatteryState, MemoryPressure, QualitySignals, QualityTier, TelemetrySource, ThermalLevel,
};
pub use session::{
    DeviceCapabilities, RecordingSession, SessionConfig, SessionEvent, SessionResult, SessionState,
};
pub use sink::{
    AudioChunk, AudioFormat, ContainerWriter, FfmpegWriterFactory, OutputCoordinator, SessionPaths,
    SinkRole, WriterFactory,
};
pub use sync::{CaptureSynchronizer, SyncConfig};
