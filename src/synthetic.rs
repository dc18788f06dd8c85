//! Synthetic capture sources
//!
//! Deterministic frame and audio generators standing in for real camera and
//! microphone devices in demos and tests. Frames are timestamped on an ideal
//! capture clock; the pixel pattern varies per source and per frame so
//! output files are visually checkable.

use crate::frame::{CameraFrame, CameraSource, Resolution};
use crate::pool::FrameBuffer;
use crate::sink::{AudioChunk, AudioFormat};
use std::sync::Arc;
use std::time::Duration;

/// Generates an ideally-clocked stream of solid-tinted frames
pub struct SyntheticCamera {
    source: CameraSource,
    resolution: Resolution,
    interval: Duration,
    sequence: u64,
}

impl SyntheticCamera {
    pub fn new(source: CameraSource, resolution: Resolution, frame_rate: u32) -> Self {
        Self {
            source,
            resolution,
            interval: Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64),
            sequence: 0,
        }
    }

    /// Next frame on the ideal clock (`pts = sequence * interval`)
    pub fn next_frame(&mut self) -> CameraFrame {
        let frame = self.frame_at(self.sequence, self.interval * self.sequence as u32);
        self.sequence += 1;
        frame
    }

    /// A frame with an explicit timestamp, for exercising skew and drop paths
    pub fn frame_at(&self, sequence: u64, pts: Duration) -> CameraFrame {
        let color = self.color(sequence);
        let mut data = vec![0u8; self.resolution.byte_len()];
        for pixel in data.chunks_exact_mut(4) {
            pixel.copy_from_slice(&color);
        }
        CameraFrame {
            source: self.source,
            pts,
            sequence,
            resolution: self.resolution,
            pixels: FrameBuffer::from_vec(data),
        }
    }

    // Front is warm, back is cool; brightness cycles with the sequence.
    fn color(&self, sequence: u64) -> [u8; 4] {
        let ramp = 64 + ((sequence * 3) % 192) as u8;
        match self.source {
            CameraSource::Front => [ramp, ramp / 2, 32, 255],
            CameraSource::Back => [32, ramp / 2, ramp, 255],
        }
    }
}

/// One frame interval's worth of a 440 Hz sine tone
pub fn tone_chunk(pts: Duration, format: AudioFormat, duration: Duration) -> AudioChunk {
    let sample_count =
        (duration.as_secs_f64() * format.sample_rate as f64) as usize * format.channels as usize;
    let offset = (pts.as_secs_f64() * format.sample_rate as f64) as u64;
    let mut samples = Vec::with_capacity(sample_count);
    for i in 0..sample_count {
        let t = (offset + (i / format.channels as usize) as u64) as f64 / format.sample_rate as f64;
        let value = (t * 440.0 * std::f64::consts::TAU).sin();
        samples.push((value * i16::MAX as f64 * 0.25) as i16);
    }
    AudioChunk {
        pts,
        sample_rate: format.sample_rate,
        channels: format.channels,
        samples: Arc::new(samples),
    }
}
