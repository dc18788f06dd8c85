//! Container writers
//!
//! The `ContainerWriter` trait hides encoding and container format behind
//! the sink machinery; the shipped implementation pipes raw RGBA frames into
//! an ffmpeg child process and encodes H.264 MP4. Audio for the composed
//! sink is captured to a WAV sidecar and muxed in during finalize.

use crate::compositor::render::scale_rgba_into;
use crate::compositor::Rect;
use crate::error::SinkError;
use crate::frame::Resolution;
use crate::sink::{AudioChunk, SinkRole};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

/// PCM format for the composed sink's audio track
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
        }
    }
}

/// Fixed parameters a writer is opened with
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub resolution: Resolution,
    pub frame_rate: u32,
    /// Present only for the composed sink
    pub audio: Option<AudioFormat>,
}

/// Writes frames (and optionally audio) into one container file
///
/// Implementations handle encoding, the container format, and audio muxing.
/// `finalize` must leave a valid, playable file even after an abrupt stop.
pub trait ContainerWriter: Send {
    fn open(&mut self, path: &Path, config: &WriterConfig) -> Result<(), SinkError>;

    fn write_video(
        &mut self,
        pts: Duration,
        resolution: Resolution,
        pixels: &[u8],
    ) -> Result<(), SinkError>;

    fn write_audio(&mut self, chunk: &AudioChunk) -> Result<(), SinkError>;

    fn finalize(&mut self) -> Result<(), SinkError>;
}

/// Builds one writer per sink when a session starts
pub trait WriterFactory: Send + Sync {
    fn create(&self, role: SinkRole) -> Box<dyn ContainerWriter>;
}

/// Factory for the ffmpeg-backed writer
pub struct FfmpegWriterFactory;

impl WriterFactory for FfmpegWriterFactory {
    fn create(&self, role: SinkRole) -> Box<dyn ContainerWriter> {
        Box::new(FfmpegWriter::new(role))
    }
}

struct AudioSidecar {
    wav: hound::WavWriter<BufWriter<File>>,
    path: PathBuf,
}

/// Encodes raw RGBA frames to H.264 MP4 through an ffmpeg child process
///
/// The container's coded resolution is fixed at open time; frames arriving
/// at a different resolution (after a mid-session tier change) are rescaled
/// to it, since a raw pipe cannot change dimensions mid-stream.
pub struct FfmpegWriter {
    role: SinkRole,
    config: Option<WriterConfig>,
    final_path: Option<PathBuf>,
    temp: Option<TempDir>,
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    audio: Option<AudioSidecar>,
    scratch: Vec<u8>,
    frames: u64,
}

impl FfmpegWriter {
    pub fn new(role: SinkRole) -> Self {
        Self {
            role,
            config: None,
            final_path: None,
            temp: None,
            process: None,
            stdin: None,
            audio: None,
            scratch: Vec::new(),
            frames: 0,
        }
    }

    fn open_err(&self, reason: impl Into<String>) -> SinkError {
        SinkError::Open {
            role: self.role,
            reason: reason.into(),
        }
    }
}

/// Encoder arguments for a raw-RGBA-over-stdin H.264 MP4 pipe
fn encode_args(output: &Path, resolution: Resolution, frame_rate: u32) -> Vec<String> {
    vec![
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        format!("{}x{}", resolution.width, resolution.height),
        "-r".into(),
        frame_rate.to_string(),
        "-i".into(),
        "-".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-crf".into(),
        "18".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-movflags".into(),
        "+faststart".into(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Mux arguments combining an encoded video file and a WAV sidecar
fn mux_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        video.to_string_lossy().into_owned(),
        "-i".into(),
        audio.to_string_lossy().into_owned(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-shortest".into(),
        output.to_string_lossy().into_owned(),
    ]
}

impl ContainerWriter for FfmpegWriter {
    fn open(&mut self, path: &Path, config: &WriterConfig) -> Result<(), SinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| self.open_err(format!("failed to create output directory: {e}")))?;
        }

        // With audio, video is encoded into a temp file and muxed with the
        // WAV sidecar during finalize (a single stdin pipe carries only one
        // stream).
        let video_path = if let Some(audio) = &config.audio {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let temp = TempDir::new_in(parent)
                .map_err(|e| self.open_err(format!("failed to create temp dir: {e}")))?;
            let wav_path = temp.path().join("audio.wav");
            let spec = hound::WavSpec {
                channels: audio.channels,
                sample_rate: audio.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let wav = hound::WavWriter::create(&wav_path, spec)
                .map_err(|e| self.open_err(format!("failed to create WAV sidecar: {e}")))?;
            self.audio = Some(AudioSidecar {
                wav,
                path: wav_path,
            });
            let video_path = temp.path().join("video.mp4");
            self.temp = Some(temp);
            video_path
        } else {
            path.to_path_buf()
        };

        let args = encode_args(&video_path, config.resolution, config.frame_rate);
        tracing::info!(role = %self.role, ?video_path, "starting ffmpeg encoder");

        let mut process = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.open_err(format!("failed to start ffmpeg: {e}")))?;

        self.stdin = process.stdin.take();
        if self.stdin.is_none() {
            return Err(self.open_err("failed to capture ffmpeg stdin"));
        }
        self.process = Some(process);
        self.config = Some(config.clone());
        self.final_path = Some(path.to_path_buf());
        Ok(())
    }

    fn write_video(
        &mut self,
        _pts: Duration,
        resolution: Resolution,
        pixels: &[u8],
    ) -> Result<(), SinkError> {
        let role = self.role;
        let coded = self
            .config
            .as_ref()
            .map(|c| c.resolution)
            .ok_or_else(|| SinkError::Write {
                role,
                reason: "writer not open".into(),
            })?;
        let stdin = self.stdin.as_mut().ok_or_else(|| SinkError::Write {
            role,
            reason: "writer not open".into(),
        })?;

        let result = if resolution == coded {
            stdin.write_all(pixels)
        } else {
            self.scratch.resize(coded.byte_len(), 0);
            scale_rgba_into(
                pixels,
                resolution,
                &mut self.scratch,
                coded,
                Rect::new(0, 0, coded.width, coded.height),
            );
            stdin.write_all(&self.scratch)
        };
        result.map_err(|e| SinkError::Write {
            role,
            reason: format!("ffmpeg pipe write failed: {e}"),
        })?;
        self.frames += 1;
        Ok(())
    }

    fn write_audio(&mut self, chunk: &AudioChunk) -> Result<(), SinkError> {
        let role = self.role;
        let sidecar = self.audio.as_mut().ok_or_else(|| SinkError::Write {
            role,
            reason: "sink has no audio track".into(),
        })?;
        for &sample in chunk.samples.iter() {
            sidecar.wav.write_sample(sample).map_err(|e| SinkError::Write {
                role,
                reason: format!("WAV sidecar write failed: {e}"),
            })?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        let role = self.role;
        let fin = |reason: String| SinkError::Finalize { role, reason };

        // Closing stdin lets ffmpeg flush and write the trailer.
        drop(self.stdin.take());
        if let Some(mut process) = self.process.take() {
            let status = process
                .wait()
                .map_err(|e| fin(format!("failed to wait for ffmpeg: {e}")))?;
            if !status.success() {
                return Err(fin(format!("ffmpeg encoder exited with {status}")));
            }
        }

        if let Some(sidecar) = self.audio.take() {
            sidecar
                .wav
                .finalize()
                .map_err(|e| fin(format!("failed to finalize WAV sidecar: {e}")))?;

            let temp = self.temp.take();
            let video_path = temp
                .as_ref()
                .map(|t| t.path().join("video.mp4"))
                .ok_or_else(|| fin("missing temp video".into()))?;
            let final_path = self
                .final_path
                .take()
                .ok_or_else(|| fin("missing output path".into()))?;

            tracing::info!(role = %self.role, ?final_path, "muxing audio into composed output");
            let status = Command::new("ffmpeg")
                .args(mux_args(&video_path, &sidecar.path, &final_path))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map_err(|e| fin(format!("failed to run ffmpeg mux: {e}")))?;
            if !status.success() {
                return Err(fin(format!("ffmpeg mux exited with {status}")));
            }
            // temp dir (and its intermediates) cleans up on drop
        }

        tracing::info!(role = %self.role, frames = self.frames, "container finalized");
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.wait() {
                tracing::warn!(role = %self.role, error = %e, "ffmpeg did not exit cleanly on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_args_fix_the_raw_input_geometry() {
        let args = encode_args(Path::new("/tmp/out.mp4"), Resolution::new(1280, 720), 30);
        let joined = args.join(" ");
        assert!(joined.contains("-s 1280x720"));
        assert!(joined.contains("-r 30"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.ends_with("/tmp/out.mp4"));
    }

    #[test]
    fn mux_args_copy_video_and_encode_audio() {
        let args = mux_args(
            Path::new("v.mp4"),
            Path::new("a.wav"),
            Path::new("final.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a aac"));
    }
}
