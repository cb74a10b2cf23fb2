use std::fmt;
use std::time::{Duration, Instant};

use tabs::TabRecord;

/// Coarse memory pressure signal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum PressureLevel {
    #[default]
    Normal,
    High,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureLevel::Normal => f.write_str("normal"),
            PressureLevel::High => f.write_str("high"),
        }
    }
}

/// Idle threshold used under high pressure when aggressive mode is on.
pub const AGGRESSIVE_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Tunable parameters of the suspension policy.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OptimizerConfig {
    /// Master switch.
    pub enabled: bool,
    /// Minimum idle time before a tab becomes a suspend candidate.
    pub inactivity_threshold: Duration,
    /// Informational trigger level, exposed for tuning.
    pub memory_threshold_mb: u64,
    /// Shortens the threshold while memory pressure is high.
    pub aggressive_mode: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizationLevel::Balanced.preset()
    }
}

impl OptimizerConfig {
    /// Idle time a tab needs before it may be suspended under `pressure`.
    pub fn effective_threshold(&self, pressure: PressureLevel) -> Duration {
        if pressure == PressureLevel::High && self.aggressive_mode {
            self.inactivity_threshold.min(AGGRESSIVE_INACTIVITY_THRESHOLD)
        } else {
            self.inactivity_threshold
        }
    }
}

/// Named presets exposed to users.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum OptimizationLevel {
    Disabled,
    Conservative,
    Balanced,
    Aggressive,
}

impl OptimizationLevel {
    pub const ALL: [OptimizationLevel; 4] = [
        OptimizationLevel::Disabled,
        OptimizationLevel::Conservative,
        OptimizationLevel::Balanced,
        OptimizationLevel::Aggressive,
    ];

    /// Fixed configuration for the preset.
    pub fn preset(self) -> OptimizerConfig {
        let (enabled, minutes, memory_threshold_mb, aggressive_mode) = match self {
            OptimizationLevel::Disabled => (false, 30, 2048, false),
            OptimizationLevel::Conservative => (true, 60, 4096, false),
            OptimizationLevel::Balanced => (true, 30, 2048, false),
            OptimizationLevel::Aggressive => (true, 10, 1024, true),
        };
        OptimizerConfig {
            enabled,
            inactivity_threshold: Duration::from_secs(minutes * 60),
            memory_threshold_mb,
            aggressive_mode,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OptimizationLevel::Disabled => "disabled",
            OptimizationLevel::Conservative => "conservative",
            OptimizationLevel::Balanced => "balanced",
            OptimizationLevel::Aggressive => "aggressive",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == name)
    }
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of a tab as reported by the engine at evaluation time.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TabSignals {
    pub alive: bool,
    pub foreground: bool,
    pub audible: bool,
    pub captured: bool,
    pub pending_navigation: bool,
}

impl Default for TabSignals {
    /// A live background tab doing nothing.
    fn default() -> Self {
        Self {
            alive: true,
            foreground: false,
            audible: false,
            captured: false,
            pending_navigation: false,
        }
    }
}

/// Why a tab was kept alive.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KeepReason {
    AlreadySuspended,
    Gone,
    Foreground,
    Media,
    PendingNavigation,
    Idle { remaining: Duration },
}

/// Outcome of evaluating one tab.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Decision {
    Suspend,
    Keep(KeepReason),
}

impl Decision {
    pub fn is_suspend(self) -> bool {
        self == Decision::Suspend
    }
}

/// Checks the exclusions that hold regardless of idle time.
///
/// These guard tabs that are in use or mid-transaction and always win over
/// the idle heuristic.
pub fn protection(record: &TabRecord, signals: &TabSignals) -> Option<KeepReason> {
    if record.is_suspended || record.pending.is_some() {
        return Some(KeepReason::AlreadySuspended);
    }
    if !signals.alive {
        return Some(KeepReason::Gone);
    }
    if signals.foreground {
        return Some(KeepReason::Foreground);
    }
    if signals.audible || signals.captured {
        return Some(KeepReason::Media);
    }
    if signals.pending_navigation {
        return Some(KeepReason::PendingNavigation);
    }
    None
}

/// Decides whether a tab should be suspended.
pub fn evaluate(
    record: &TabRecord,
    signals: &TabSignals,
    config: &OptimizerConfig,
    now: Instant,
    pressure: PressureLevel,
) -> Decision {
    if let Some(reason) = protection(record, signals) {
        return Decision::Keep(reason);
    }

    let threshold = config.effective_threshold(pressure);
    let idle = now.saturating_duration_since(record.last_active_time);
    if idle >= threshold {
        Decision::Suspend
    } else {
        Decision::Keep(KeepReason::Idle {
            remaining: threshold - idle,
        })
    }
}

pub fn should_suspend(
    record: &TabRecord,
    signals: &TabSignals,
    config: &OptimizerConfig,
    now: Instant,
    pressure: PressureLevel,
) -> bool {
    evaluate(record, signals, config, now, pressure).is_suspend()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tabs::{PendingTransition, TabHandle, TabId, TabRegistry};

    const MINUTE: Duration = Duration::from_secs(60);

    fn record_idle_since(start: Instant) -> TabRecord {
        let tab = TabHandle::new(TabId::new(1), 0);
        let mut registry = TabRegistry::new();
        registry.register(tab, start);
        registry.lookup(tab).cloned().unwrap()
    }

    #[test]
    fn exact_threshold_is_suspendable() {
        let start = Instant::now();
        let record = record_idle_since(start);
        let config = OptimizerConfig::default();
        let signals = TabSignals::default();

        let at = start + config.inactivity_threshold;
        assert!(should_suspend(&record, &signals, &config, at, PressureLevel::Normal));

        let just_before = at - Duration::from_secs(1);
        assert_eq!(
            evaluate(&record, &signals, &config, just_before, PressureLevel::Normal),
            Decision::Keep(KeepReason::Idle {
                remaining: Duration::from_secs(1)
            })
        );
    }

    #[test]
    fn exclusions_apply_in_order() {
        let start = Instant::now();
        let config = OptimizerConfig::default();
        let later = start + 5 * config.inactivity_threshold;

        let mut record = record_idle_since(start);
        record.is_suspended = true;
        let signals = TabSignals {
            alive: false,
            ..TabSignals::default()
        };
        assert_eq!(
            evaluate(&record, &signals, &config, later, PressureLevel::Normal),
            Decision::Keep(KeepReason::AlreadySuspended)
        );

        let record = record_idle_since(start);
        let signals = TabSignals {
            alive: false,
            foreground: true,
            ..TabSignals::default()
        };
        assert_eq!(
            evaluate(&record, &signals, &config, later, PressureLevel::Normal),
            Decision::Keep(KeepReason::Gone)
        );

        let signals = TabSignals {
            foreground: true,
            audible: true,
            ..TabSignals::default()
        };
        assert_eq!(
            evaluate(&record, &signals, &config, later, PressureLevel::Normal),
            Decision::Keep(KeepReason::Foreground)
        );

        let signals = TabSignals {
            captured: true,
            pending_navigation: true,
            ..TabSignals::default()
        };
        assert_eq!(
            evaluate(&record, &signals, &config, later, PressureLevel::Normal),
            Decision::Keep(KeepReason::Media)
        );

        let signals = TabSignals {
            pending_navigation: true,
            ..TabSignals::default()
        };
        assert_eq!(
            evaluate(&record, &signals, &config, later, PressureLevel::Normal),
            Decision::Keep(KeepReason::PendingNavigation)
        );
    }

    #[test]
    fn pending_transition_blocks_suspension() {
        let start = Instant::now();
        let mut record = record_idle_since(start);
        record.pending = Some(PendingTransition::Resume);
        let config = OptimizerConfig::default();
        let later = start + 2 * config.inactivity_threshold;
        assert!(!should_suspend(
            &record,
            &TabSignals::default(),
            &config,
            later,
            PressureLevel::Normal
        ));
    }

    #[test]
    fn aggressive_mode_clamps_threshold_under_pressure() {
        let start = Instant::now();
        let record = record_idle_since(start);
        let signals = TabSignals::default();
        let mut config = OptimizerConfig::default();
        config.aggressive_mode = true;
        let at = start + 11 * MINUTE;

        assert!(should_suspend(&record, &signals, &config, at, PressureLevel::High));
        assert!(!should_suspend(&record, &signals, &config, at, PressureLevel::Normal));

        config.aggressive_mode = false;
        assert!(!should_suspend(&record, &signals, &config, at, PressureLevel::High));
    }

    #[test]
    fn aggressive_clamp_never_lengthens_threshold() {
        let mut config = OptimizationLevel::Aggressive.preset();
        config.inactivity_threshold = 5 * MINUTE;
        assert_eq!(config.effective_threshold(PressureLevel::High), 5 * MINUTE);
    }

    #[test]
    fn clock_behind_record_counts_as_no_idle_time() {
        let start = Instant::now();
        let record = record_idle_since(start + MINUTE);
        let config = OptimizerConfig::default();
        assert!(!should_suspend(
            &record,
            &TabSignals::default(),
            &config,
            start,
            PressureLevel::High
        ));
    }

    #[test]
    fn presets_match_levels() {
        let balanced = OptimizationLevel::Balanced.preset();
        assert!(balanced.enabled);
        assert_eq!(balanced.inactivity_threshold, 30 * MINUTE);
        assert_eq!(balanced.memory_threshold_mb, 2048);
        assert!(!balanced.aggressive_mode);

        assert!(!OptimizationLevel::Disabled.preset().enabled);
        assert_eq!(OptimizationLevel::Conservative.preset().inactivity_threshold, 60 * MINUTE);
        assert!(OptimizationLevel::Aggressive.preset().aggressive_mode);

        for level in OptimizationLevel::ALL {
            assert_eq!(OptimizationLevel::from_name(level.as_str()), Some(level));
        }
    }

    proptest! {
        #[test]
        fn foreground_tab_is_never_suspended(
            idle_secs in 0u64..1_000_000,
            aggressive in any::<bool>(),
            high in any::<bool>(),
        ) {
            let start = Instant::now();
            let record = record_idle_since(start);
            let mut config = OptimizerConfig::default();
            config.aggressive_mode = aggressive;
            let pressure = if high { PressureLevel::High } else { PressureLevel::Normal };
            let signals = TabSignals { foreground: true, ..TabSignals::default() };
            let now = start + Duration::from_secs(idle_secs);

            prop_assert!(!should_suspend(&record, &signals, &config, now, pressure));
        }

        #[test]
        fn idle_background_tab_follows_threshold(
            threshold_mins in 1u64..240,
            idle_secs in 0u64..20_000,
        ) {
            let start = Instant::now();
            let record = record_idle_since(start);
            let mut config = OptimizerConfig::default();
            config.inactivity_threshold = Duration::from_secs(threshold_mins * 60);
            let now = start + Duration::from_secs(idle_secs);

            let expected = idle_secs >= threshold_mins * 60;
            prop_assert_eq!(
                should_suspend(&record, &TabSignals::default(), &config, now, PressureLevel::Normal),
                expected
            );
        }
    }
}
