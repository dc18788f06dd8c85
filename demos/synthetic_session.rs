//! Records a short synthetic dual-camera session into ./recordings.
//!
//! Requires `ffmpeg` on PATH. Run with:
//! `cargo run --example synthetic_session`

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twincap::quality::{QualitySignals, StaticTelemetry};
use twincap::synthetic::{tone_chunk, SyntheticCamera};
use twincap::{
    CameraSource, CompositionLayout, DeviceCapabilities, FfmpegWriterFactory, PipCorner, PipSize,
    QualityTier, RecordingSession, SessionConfig, SessionEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twincap=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SessionConfig::new(
        CompositionLayout::PictureInPicture {
            corner: PipCorner::TopRight,
            size: PipSize::Small,
        },
        QualityTier::Full,
        "recordings",
    );
    let frame_rate = config.frame_rate;
    let resolution = config.capture_resolution;
    let audio = config.audio;

    let session = Arc::new(RecordingSession::configure(
        config,
        &DeviceCapabilities::default(),
        Arc::new(FfmpegWriterFactory),
        Arc::new(StaticTelemetry(QualitySignals::nominal())),
    )?);

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::QualityChanged { old, new, reason } = event {
                tracing::info!(%old, %new, %reason, "quality changed");
            }
        }
    });

    session.start()?;

    // Two capture threads at the configured rate, five seconds of footage.
    let frames = frame_rate * 5;
    let interval = Duration::from_secs_f64(1.0 / frame_rate as f64);
    let handles: Vec<_> = [CameraSource::Front, CameraSource::Back]
        .into_iter()
        .map(|source| {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                let mut camera = SyntheticCamera::new(source, resolution, frame_rate);
                for _ in 0..frames {
                    let frame = camera.next_frame();
                    let pts = frame.pts;
                    if session.submit_frame(frame).is_err() {
                        break;
                    }
                    if source == CameraSource::Back {
                        let _ = session.submit_audio(tone_chunk(pts, audio, interval));
                    }
                    std::thread::sleep(interval);
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    let result = session.stop().await?;
    println!(
        "session {} finished: {} ({} composed frames)",
        result.session_id,
        result.status,
        result.stats.pairs_composed
    );
    println!("composed output: {}", result.composed_path.display());
    Ok(())
}
