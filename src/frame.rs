//! Core frame types
//!
//! Frames carry RGBA8 pixels behind a reference-counted pooled buffer so a
//! single capture can be shared by the raw sink and the compositor without
//! copying.

use crate::pool::FrameBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bytes per RGBA8 pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Which physical camera a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSource {
    Front,
    Back,
}

impl CameraSource {
    /// The opposite camera
    pub fn other(self) -> Self {
        match self {
            CameraSource::Front => CameraSource::Back,
            CameraSource::Back => CameraSource::Front,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CameraSource::Front => "front",
            CameraSource::Back => "back",
        }
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Byte length of one RGBA8 frame at this resolution
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One decoded video frame from a single camera
///
/// Cloning is cheap: the pixel buffer is reference counted and returns to its
/// pool when the last clone drops.
#[derive(Clone)]
pub struct CameraFrame {
    /// Source camera
    pub source: CameraSource,

    /// Presentation timestamp on the shared monotonic capture clock
    pub pts: Duration,

    /// Per-source frame sequence number
    pub sequence: u64,

    /// Frame resolution
    pub resolution: Resolution,

    /// RGBA8 pixel data, `resolution.byte_len()` bytes
    pub pixels: FrameBuffer,
}

impl fmt::Debug for CameraFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraFrame")
            .field("source", &self.source)
            .field("pts", &self.pts)
            .field("sequence", &self.sequence)
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

/// Two time-aligned frames, one per camera
///
/// Created by the synchronizer, consumed by the compositor. The pair's
/// presentation timestamp is the earlier of the two member timestamps.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub front: CameraFrame,
    pub back: CameraFrame,
    pub pts: Duration,
}

impl FramePair {
    pub fn new(front: CameraFrame, back: CameraFrame) -> Self {
        let pts = front.pts.min(back.pts);
        Self { front, back, pts }
    }

    pub fn get(&self, source: CameraSource) -> &CameraFrame {
        match source {
            CameraSource::Front => &self.front,
            CameraSource::Back => &self.back,
        }
    }

    /// Absolute timestamp delta between the two members
    pub fn skew(&self) -> Duration {
        if self.front.pts >= self.back.pts {
            self.front.pts - self.back.pts
        } else {
            self.back.pts - self.front.pts
        }
    }
}

/// A composed output frame produced by the compositor
///
/// Distinct from [`CameraFrame`] because it has no single source camera.
#[derive(Clone)]
pub struct ComposedFrame {
    pub pts: Duration,
    pub sequence: u64,
    pub resolution: Resolution,
    pub pixels: FrameBuffer,
}

impl fmt::Debug for ComposedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedFrame")
            .field("pts", &self.pts)
            .field("sequence", &self.sequence)
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}
