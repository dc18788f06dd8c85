//! Capture synchronizer
//!
//! Pairs frames arriving independently from the two cameras within a
//! tolerance window. Pairing prioritizes freshness over completeness: at
//! most one pending unmatched frame is kept per source, and it is always the
//! newest one. Submission is O(1) and never waits for the other source.

use crate::frame::{CameraFrame, CameraSource, FramePair};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Synchronizer tuning
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum timestamp delta for two frames to pair
    pub tolerance: Duration,

    /// Sliding window length (in submissions) for the match-rate estimate
    pub window: usize,

    /// Match rate below which sync is reported degraded
    pub degraded_match_rate: f64,
}

impl SyncConfig {
    /// Tolerance of 1.5 frame intervals at the given capture rate
    pub fn for_frame_rate(frame_rate: u32) -> Self {
        let interval = Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64);
        Self {
            tolerance: interval.mul_f64(1.5),
            window: 120,
            degraded_match_rate: 0.5,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::for_frame_rate(30)
    }
}

/// Outcome of one submission
#[derive(Debug)]
pub struct SyncResult {
    /// A matched pair, if this frame completed one
    pub pair: Option<FramePair>,

    /// `Some(true)` when sync just became degraded, `Some(false)` when it
    /// just recovered
    pub degraded_transition: Option<bool>,
}

struct Pending {
    front: Option<CameraFrame>,
    back: Option<CameraFrame>,
    outcomes: VecDeque<bool>,
    matched_in_window: usize,
    degraded: bool,
}

impl Pending {
    fn slots(&mut self, source: CameraSource) -> (&mut Option<CameraFrame>, &mut Option<CameraFrame>) {
        match source {
            CameraSource::Front => (&mut self.front, &mut self.back),
            CameraSource::Back => (&mut self.back, &mut self.front),
        }
    }
}

/// Pairs independently-clocked frames from the two cameras
///
/// Safe to call from both capture threads; the interior lock covers only the
/// two pending slots and the match-rate window.
pub struct CaptureSynchronizer {
    config: SyncConfig,
    pending: Mutex<Pending>,
    misses: AtomicU64,
    pairs: AtomicU64,
}

impl CaptureSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(Pending {
                front: None,
                back: None,
                outcomes: VecDeque::new(),
                matched_in_window: 0,
                degraded: false,
            }),
            misses: AtomicU64::new(0),
            pairs: AtomicU64::new(0),
        }
    }

    /// Submit one frame; returns a pair iff this frame matched the pending
    /// frame from the other source within tolerance
    pub fn submit(&self, frame: CameraFrame) -> SyncResult {
        let mut pair = None;
        let mut misses = 0u64;

        let mut pending = self.pending.lock();
        let (own, other) = pending.slots(frame.source);

        // Freshness: a newer frame from the same source evicts the pending one.
        if own.take().is_some() {
            misses += 1;
        }

        if let Some(candidate) = other.take() {
            let delta = abs_delta(frame.pts, candidate.pts);
            if delta <= self.config.tolerance {
                let matched = match frame.source {
                    CameraSource::Front => FramePair::new(frame, candidate),
                    CameraSource::Back => FramePair::new(candidate, frame),
                };
                pair = Some(matched);
            } else {
                // No match. Drop the pending frame if it has gone stale;
                // otherwise leave it waiting for a closer frame.
                let stale = frame
                    .pts
                    .checked_sub(candidate.pts)
                    .map(|age| age > self.config.tolerance * 2)
                    .unwrap_or(false);
                if stale {
                    misses += 1;
                } else {
                    *other = Some(candidate);
                }
                *own = Some(frame);
            }
        } else {
            *own = Some(frame);
        }

        let matched = pair.is_some();
        let degraded_transition = self.record_outcome(&mut pending, matched);
        drop(pending);

        if misses > 0 {
            self.misses.fetch_add(misses, Ordering::Relaxed);
        }
        if matched {
            self.pairs.fetch_add(1, Ordering::Relaxed);
        }

        SyncResult {
            pair,
            degraded_transition,
        }
    }

    fn record_outcome(&self, pending: &mut Pending, matched: bool) -> Option<bool> {
        pending.outcomes.push_back(matched);
        if matched {
            pending.matched_in_window += 1;
        }
        if pending.outcomes.len() > self.config.window {
            if pending.outcomes.pop_front() == Some(true) {
                pending.matched_in_window -= 1;
            }
        }

        if pending.outcomes.len() < self.config.window {
            return None;
        }

        // Each pair consumes two submissions, so a perfectly synced stream
        // matches on half of them.
        let rate = 2.0 * pending.matched_in_window as f64 / pending.outcomes.len() as f64;
        let degraded = rate < self.config.degraded_match_rate;
        if degraded != pending.degraded {
            pending.degraded = degraded;
            tracing::warn!(match_rate = rate, degraded, "sync quality changed");
            Some(degraded)
        } else {
            None
        }
    }

    /// Whether sync is currently in the degraded regime
    pub fn is_degraded(&self) -> bool {
        self.pending.lock().degraded
    }

    /// Frames dropped unmatched (evicted or stale)
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Pairs emitted so far
    pub fn pairs(&self) -> u64 {
        self.pairs.load(Ordering::Relaxed)
    }
}

fn abs_delta(a: Duration, b: Duration) -> Duration {
    if a >= b {
        a - b
    } else {
        b - a
    }
}
