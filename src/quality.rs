//! Adaptive quality control
//!
//! Consumes thermal/memory/battery telemetry and the compositor's trailing
//! latency, and emits advisory tier decisions. Downgrades are immediate;
//! upgrades require a run of consecutive favorable evaluation cycles so the
//! tier never oscillates.

use crate::frame::Resolution;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Discrete quality level, totally ordered (`Minimal < Reduced < Full`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Minimal,
    Reduced,
    Full,
}

impl QualityTier {
    /// Target composed-output resolution for this tier
    pub fn resolution(self) -> Resolution {
        match self {
            QualityTier::Full => Resolution::new(1920, 1080),
            QualityTier::Reduced => Resolution::new(1280, 720),
            QualityTier::Minimal => Resolution::new(854, 480),
        }
    }

    /// Target composed-output frame rate for this tier
    pub fn frame_rate(self) -> u32 {
        match self {
            QualityTier::Full | QualityTier::Reduced => 30,
            QualityTier::Minimal => 24,
        }
    }

    /// Whether composition decorations (picture-in-picture border) are drawn
    pub fn effects_enabled(self) -> bool {
        matches!(self, QualityTier::Full)
    }

    /// One step down, if not already at the floor
    pub fn lower(self) -> Option<Self> {
        match self {
            QualityTier::Full => Some(QualityTier::Reduced),
            QualityTier::Reduced => Some(QualityTier::Minimal),
            QualityTier::Minimal => None,
        }
    }

    /// One step up, if not already at the ceiling
    pub fn higher(self) -> Option<Self> {
        match self {
            QualityTier::Minimal => Some(QualityTier::Reduced),
            QualityTier::Reduced => Some(QualityTier::Full),
            QualityTier::Full => None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityTier::Full => "full",
            QualityTier::Reduced => "reduced",
            QualityTier::Minimal => "minimal",
        };
        f.write_str(name)
    }
}

/// Device thermal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalLevel {
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// System memory pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
}

/// Battery state, advisory only: low battery blocks upgrades but never
/// forces a downgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    Charging,
    Normal,
    Low,
}

/// One telemetry sample plus the compositor's trailing latency
#[derive(Debug, Clone, Copy)]
pub struct QualitySignals {
    pub thermal: ThermalLevel,
    pub memory: MemoryPressure,
    pub battery: BatteryState,
    pub compositor_latency: Option<Duration>,
    /// Whether the synchronizer currently reports degraded pairing
    pub sync_degraded: bool,
}

impl QualitySignals {
    pub fn nominal() -> Self {
        Self {
            thermal: ThermalLevel::Nominal,
            memory: MemoryPressure::Normal,
            battery: BatteryState::Normal,
            compositor_latency: None,
            sync_degraded: false,
        }
    }
}

/// Source of live device telemetry, provided by the surrounding application
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn sample(&self) -> QualitySignals;
}

/// Fixed telemetry, useful for demos and tests
pub struct StaticTelemetry(pub QualitySignals);

#[async_trait]
impl TelemetrySource for StaticTelemetry {
    async fn sample(&self) -> QualitySignals {
        self.0
    }
}

/// Why a quality decision was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityReason {
    Thermal,
    MemoryPressure,
    CompositorLatency,
    Recovered,
}

impl fmt::Display for QualityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityReason::Thermal => "thermal",
            QualityReason::MemoryPressure => "memory_pressure",
            QualityReason::CompositorLatency => "compositor_latency",
            QualityReason::Recovered => "recovered",
        };
        f.write_str(name)
    }
}

/// An advisory decision emitted by one evaluation cycle
#[derive(Debug, Clone, Copy)]
pub struct QualityDecision {
    pub old: QualityTier,
    pub new: QualityTier,
    pub reason: QualityReason,
    /// Stop feeding the composed sink entirely (raw sinks stay active)
    pub suspend_composition: bool,
    /// Re-enable the composed sink after a suspension
    pub resume_composition: bool,
}

/// Controller tuning
#[derive(Debug, Clone)]
pub struct QualityControllerConfig {
    /// Consecutive favorable cycles required before an upgrade (or resume)
    pub upgrade_hysteresis: u32,

    /// Frame interval the compositor must stay under
    pub frame_interval: Duration,
}

impl QualityControllerConfig {
    pub fn for_frame_rate(frame_rate: u32) -> Self {
        Self {
            upgrade_hysteresis: 3,
            frame_interval: Duration::from_secs_f64(1.0 / frame_rate.max(1) as f64),
        }
    }
}

/// Feedback controller for the active quality tier
///
/// Pure state machine: it never touches other components. The session task
/// applies its decisions asynchronously.
pub struct QualityController {
    config: QualityControllerConfig,
    tier: QualityTier,
    suspended: bool,
    favorable_streak: u32,
}

impl QualityController {
    pub fn new(initial_tier: QualityTier, config: QualityControllerConfig) -> Self {
        Self {
            config,
            tier: initial_tier,
            suspended: false,
            favorable_streak: 0,
        }
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Evaluate one telemetry sample; `None` means hold the current tier
    pub fn evaluate(&mut self, signals: &QualitySignals) -> Option<QualityDecision> {
        if let Some(reason) = self.pressure(signals) {
            self.favorable_streak = 0;
            if let Some(lower) = self.tier.lower() {
                let old = self.tier;
                self.tier = lower;
                tracing::info!(%old, new = %lower, %reason, "quality downgrade");
                return Some(QualityDecision {
                    old,
                    new: lower,
                    reason,
                    suspend_composition: false,
                    resume_composition: false,
                });
            }
            // Already at the floor: shed the composed sink itself.
            if !self.suspended {
                self.suspended = true;
                tracing::warn!(%reason, "suspending composition at minimal tier");
                return Some(QualityDecision {
                    old: self.tier,
                    new: self.tier,
                    reason,
                    suspend_composition: true,
                    resume_composition: false,
                });
            }
            return None;
        }

        // Favorable cycle. Low battery or degraded pairing holds the line
        // without downgrading.
        if signals.battery == BatteryState::Low || signals.sync_degraded {
            self.favorable_streak = 0;
            return None;
        }

        self.favorable_streak += 1;
        if self.favorable_streak < self.config.upgrade_hysteresis {
            return None;
        }

        // Composition resumes before any tier upgrade.
        if self.suspended {
            self.suspended = false;
            self.favorable_streak = 0;
            tracing::info!("resuming composition");
            return Some(QualityDecision {
                old: self.tier,
                new: self.tier,
                reason: QualityReason::Recovered,
                suspend_composition: false,
                resume_composition: true,
            });
        }

        if let Some(higher) = self.tier.higher() {
            let old = self.tier;
            self.tier = higher;
            self.favorable_streak = 0;
            tracing::info!(%old, new = %higher, "quality upgrade");
            return Some(QualityDecision {
                old,
                new: higher,
                reason: QualityReason::Recovered,
                suspend_composition: false,
                resume_composition: false,
            });
        }

        None
    }

    fn pressure(&self, signals: &QualitySignals) -> Option<QualityReason> {
        if signals.thermal >= ThermalLevel::Serious {
            return Some(QualityReason::Thermal);
        }
        if signals.memory >= MemoryPressure::Warning {
            return Some(QualityReason::MemoryPressure);
        }
        if let Some(latency) = signals.compositor_latency {
            if latency > self.config.frame_interval {
                return Some(QualityReason::CompositorLatency);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> QualityController {
        QualityController::new(
            QualityTier::Full,
            QualityControllerConfig {
                upgrade_hysteresis: 3,
                frame_interval: Duration::from_millis(33),
            },
        )
    }

    fn pressured() -> QualitySignals {
        QualitySignals {
            thermal: ThermalLevel::Serious,
            ..QualitySignals::nominal()
        }
    }

    #[test]
    fn downgrade_happens_within_one_cycle() {
        let mut ctl = controller();
        let decision = ctl.evaluate(&pressured()).expect("should downgrade");
        assert_eq!(decision.old, QualityTier::Full);
        assert_eq!(decision.new, QualityTier::Reduced);
        assert_eq!(decision.reason, QualityReason::Thermal);
    }

    #[test]
    fn upgrade_requires_exact_hysteresis() {
        let mut ctl = controller();
        ctl.evaluate(&pressured());
        assert!(ctl.evaluate(&QualitySignals::nominal()).is_none());
        assert!(ctl.evaluate(&QualitySignals::nominal()).is_none());
        let decision = ctl.evaluate(&QualitySignals::nominal()).expect("third favorable cycle upgrades");
        assert_eq!(decision.new, QualityTier::Full);
    }

    #[test]
    fn stable_signal_stabilizes_after_one_transition() {
        let mut ctl = controller();
        assert!(ctl.evaluate(&pressured()).is_some());
        assert!(ctl.evaluate(&pressured()).is_some()); // second step to minimal
        assert!(ctl.evaluate(&pressured()).is_some()); // suspension at the floor
        for _ in 0..10 {
            assert!(ctl.evaluate(&pressured()).is_none());
        }
        assert_eq!(ctl.tier(), QualityTier::Minimal);
    }

    #[test]
    fn floor_pressure_suspends_composition_once() {
        let mut ctl = QualityController::new(
            QualityTier::Minimal,
            QualityControllerConfig {
                upgrade_hysteresis: 2,
                frame_interval: Duration::from_millis(33),
            },
        );
        let decision = ctl.evaluate(&pressured()).expect("suspend");
        assert!(decision.suspend_composition);
        assert!(ctl.evaluate(&pressured()).is_none());
    }

    #[test]
    fn resume_precedes_upgrade() {
        let mut ctl = QualityController::new(
            QualityTier::Minimal,
            QualityControllerConfig {
                upgrade_hysteresis: 2,
                frame_interval: Duration::from_millis(33),
            },
        );
        ctl.evaluate(&pressured());
        assert!(ctl.is_suspended());
        assert!(ctl.evaluate(&QualitySignals::nominal()).is_none());
        let decision = ctl.evaluate(&QualitySignals::nominal()).expect("resume");
        assert!(decision.resume_composition);
        assert_eq!(decision.new, QualityTier::Minimal);
        assert!(ctl.evaluate(&QualitySignals::nominal()).is_none());
        let upgrade = ctl.evaluate(&QualitySignals::nominal()).expect("upgrade");
        assert_eq!(upgrade.new, QualityTier::Reduced);
    }

    #[test]
    fn degraded_sync_blocks_upgrades() {
        let mut ctl = controller();
        ctl.evaluate(&pressured());
        let degraded = QualitySignals {
            sync_degraded: true,
            ..QualitySignals::nominal()
        };
        for _ in 0..6 {
            assert!(ctl.evaluate(&degraded).is_none());
        }
        assert_eq!(ctl.tier(), QualityTier::Reduced);
    }

    #[test]
    fn compositor_latency_triggers_downgrade() {
        let mut ctl = controller();
        let signals = QualitySignals {
            compositor_latency: Some(Duration::from_millis(40)),
            ..QualitySignals::nominal()
        };
        let decision = ctl.evaluate(&signals).expect("latency downgrade");
        assert_eq!(decision.reason, QualityReason::CompositorLatency);
    }

    #[test]
    fn low_battery_blocks_upgrades() {
        let mut ctl = controller();
        ctl.evaluate(&pressured());
        let low = QualitySignals {
            battery: BatteryState::Low,
            ..QualitySignals::nominal()
        };
        for _ in 0..6 {
            assert!(ctl.evaluate(&low).is_none());
        }
        assert_eq!(ctl.tier(), QualityTier::Reduced);
    }
}
