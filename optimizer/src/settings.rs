use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use policy::{OptimizationLevel, OptimizerConfig};
use storage::{PrefValue, PreferenceStore};
use tracing::warn;

pub const PREF_OPTIMIZER_ENABLED: &str = "lunetix.memory.optimizer_enabled";
pub const PREF_INACTIVITY_THRESHOLD_MINUTES: &str = "lunetix.memory.inactivity_threshold_minutes";
pub const PREF_MEMORY_THRESHOLD_MB: &str = "lunetix.memory.memory_threshold_mb";
pub const PREF_AGGRESSIVE_MODE: &str = "lunetix.memory.aggressive_mode";

pub const DEFAULT_INACTIVITY_THRESHOLD_MINUTES: u64 = 30;
pub const DEFAULT_MEMORY_THRESHOLD_MB: u64 = 2048;

pub const MIN_INACTIVITY_THRESHOLD_MINUTES: u64 = 1;
pub const MAX_INACTIVITY_THRESHOLD_MINUTES: u64 = 24 * 60;
pub const MIN_MEMORY_THRESHOLD_MB: u64 = 256;
pub const MAX_MEMORY_THRESHOLD_MB: u64 = 256 * 1024;

/// User-facing memory optimizer settings backed by the preference store.
///
/// Values are loaded once and written through on every change. Out-of-range
/// values, stored or requested, are clamped to the nearest bound so the
/// optimizer always sees a usable configuration.
pub struct MemorySettings {
    prefs: Rc<dyn PreferenceStore>,
    config: Cell<OptimizerConfig>,
}

impl MemorySettings {
    pub fn new(prefs: Rc<dyn PreferenceStore>) -> Self {
        let config = load_config(prefs.as_ref());
        Self {
            prefs,
            config: Cell::new(config),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> OptimizerConfig {
        self.config.get()
    }

    /// Level implied by the stored values.
    pub fn level(&self) -> OptimizationLevel {
        let config = self.config.get();
        if !config.enabled {
            return OptimizationLevel::Disabled;
        }
        if config.aggressive_mode {
            return OptimizationLevel::Aggressive;
        }
        let minutes = config.inactivity_threshold.as_secs() / 60;
        if minutes <= 15 {
            OptimizationLevel::Aggressive
        } else if minutes <= 30 {
            OptimizationLevel::Balanced
        } else {
            OptimizationLevel::Conservative
        }
    }

    /// Applies every field of the preset.
    pub fn set_level(&self, level: OptimizationLevel) {
        let preset = level.preset();
        self.config.set(preset);
        self.persist(PREF_OPTIMIZER_ENABLED, PrefValue::Bool(preset.enabled));
        self.persist(PREF_AGGRESSIVE_MODE, PrefValue::Bool(preset.aggressive_mode));
        self.persist(
            PREF_INACTIVITY_THRESHOLD_MINUTES,
            PrefValue::Integer(minutes(preset.inactivity_threshold) as i64),
        );
        self.persist(
            PREF_MEMORY_THRESHOLD_MB,
            PrefValue::Integer(preset.memory_threshold_mb as i64),
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.config.get().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.update(|config| config.enabled = enabled);
        self.persist(PREF_OPTIMIZER_ENABLED, PrefValue::Bool(enabled));
    }

    pub fn aggressive_mode(&self) -> bool {
        self.config.get().aggressive_mode
    }

    pub fn set_aggressive_mode(&self, aggressive: bool) {
        self.update(|config| config.aggressive_mode = aggressive);
        self.persist(PREF_AGGRESSIVE_MODE, PrefValue::Bool(aggressive));
    }

    pub fn inactivity_threshold(&self) -> Duration {
        self.config.get().inactivity_threshold
    }

    /// Stores the threshold in whole minutes and returns the applied value.
    pub fn set_inactivity_threshold(&self, threshold: Duration) -> Duration {
        let minutes = clamp_minutes(minutes(threshold) as i64);
        let applied = Duration::from_secs(minutes * 60);
        self.update(|config| config.inactivity_threshold = applied);
        self.persist(
            PREF_INACTIVITY_THRESHOLD_MINUTES,
            PrefValue::Integer(minutes as i64),
        );
        applied
    }

    pub fn memory_threshold_mb(&self) -> u64 {
        self.config.get().memory_threshold_mb
    }

    /// Returns the applied value.
    pub fn set_memory_threshold_mb(&self, memory_mb: u64) -> u64 {
        let applied = memory_mb.clamp(MIN_MEMORY_THRESHOLD_MB, MAX_MEMORY_THRESHOLD_MB);
        self.update(|config| config.memory_threshold_mb = applied);
        self.persist(PREF_MEMORY_THRESHOLD_MB, PrefValue::Integer(applied as i64));
        applied
    }

    fn update<F: FnOnce(&mut OptimizerConfig)>(&self, f: F) {
        let mut config = self.config.get();
        f(&mut config);
        self.config.set(config);
    }

    fn persist(&self, key: &str, value: PrefValue) {
        if let Err(err) = self.prefs.set(key, value) {
            warn!(key, %err, "failed to persist memory setting");
        }
    }
}

fn load_config(prefs: &dyn PreferenceStore) -> OptimizerConfig {
    let enabled = prefs
        .get(PREF_OPTIMIZER_ENABLED)
        .and_then(|value| value.as_bool())
        .unwrap_or(true);
    let aggressive_mode = prefs
        .get(PREF_AGGRESSIVE_MODE)
        .and_then(|value| value.as_bool())
        .unwrap_or(false);
    let threshold_minutes = prefs
        .get(PREF_INACTIVITY_THRESHOLD_MINUTES)
        .and_then(|value| value.as_integer())
        .map(clamp_minutes)
        .unwrap_or(DEFAULT_INACTIVITY_THRESHOLD_MINUTES);
    let memory_threshold_mb = prefs
        .get(PREF_MEMORY_THRESHOLD_MB)
        .and_then(|value| value.as_integer())
        .map(|mb| {
            mb.clamp(MIN_MEMORY_THRESHOLD_MB as i64, MAX_MEMORY_THRESHOLD_MB as i64) as u64
        })
        .unwrap_or(DEFAULT_MEMORY_THRESHOLD_MB);

    OptimizerConfig {
        enabled,
        inactivity_threshold: Duration::from_secs(threshold_minutes * 60),
        memory_threshold_mb,
        aggressive_mode,
    }
}

fn minutes(duration: Duration) -> u64 {
    duration.as_secs() / 60
}

fn clamp_minutes(minutes: i64) -> u64 {
    minutes.clamp(
        MIN_INACTIVITY_THRESHOLD_MINUTES as i64,
        MAX_INACTIVITY_THRESHOLD_MINUTES as i64,
    ) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::{InMemoryPreferences, StorageError};

    const MINUTE: Duration = Duration::from_secs(60);

    fn settings() -> (Rc<InMemoryPreferences>, MemorySettings) {
        let prefs = Rc::new(InMemoryPreferences::new());
        let settings = MemorySettings::new(prefs.clone());
        (prefs, settings)
    }

    #[test]
    fn defaults_without_stored_values() {
        let (_, settings) = settings();
        assert_eq!(settings.level(), OptimizationLevel::Balanced);
        assert!(settings.is_enabled());
        assert_eq!(settings.inactivity_threshold(), 30 * MINUTE);
        assert_eq!(settings.memory_threshold_mb(), 2048);
        assert!(!settings.aggressive_mode());
        assert_eq!(settings.config(), OptimizerConfig::default());
    }

    #[test]
    fn presets_overwrite_all_fields_and_persist() {
        let (prefs, settings) = settings();
        settings.set_level(OptimizationLevel::Aggressive);

        assert_eq!(settings.config(), OptimizationLevel::Aggressive.preset());
        assert_eq!(settings.level(), OptimizationLevel::Aggressive);
        assert_eq!(prefs.get(PREF_AGGRESSIVE_MODE), Some(PrefValue::Bool(true)));
        assert_eq!(
            prefs.get(PREF_INACTIVITY_THRESHOLD_MINUTES),
            Some(PrefValue::Integer(10))
        );
        assert_eq!(prefs.get(PREF_MEMORY_THRESHOLD_MB), Some(PrefValue::Integer(1024)));

        settings.set_level(OptimizationLevel::Conservative);
        assert_eq!(settings.level(), OptimizationLevel::Conservative);
        assert_eq!(settings.inactivity_threshold(), 60 * MINUTE);

        settings.set_level(OptimizationLevel::Disabled);
        assert_eq!(settings.level(), OptimizationLevel::Disabled);
        assert_eq!(prefs.get(PREF_OPTIMIZER_ENABLED), Some(PrefValue::Bool(false)));
    }

    #[test]
    fn level_follows_threshold() {
        let (_, settings) = settings();
        settings.set_inactivity_threshold(15 * MINUTE);
        assert_eq!(settings.level(), OptimizationLevel::Aggressive);
        settings.set_inactivity_threshold(45 * MINUTE);
        assert_eq!(settings.level(), OptimizationLevel::Conservative);
        settings.set_inactivity_threshold(20 * MINUTE);
        assert_eq!(settings.level(), OptimizationLevel::Balanced);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let (_, settings) = settings();
        assert_eq!(settings.set_inactivity_threshold(Duration::ZERO), MINUTE);
        assert_eq!(
            settings.set_inactivity_threshold(Duration::from_secs(30 * 24 * 3600)),
            24 * 60 * MINUTE
        );
        assert_eq!(settings.set_memory_threshold_mb(0), MIN_MEMORY_THRESHOLD_MB);
        assert_eq!(settings.set_memory_threshold_mb(u64::MAX), MAX_MEMORY_THRESHOLD_MB);
    }

    #[test]
    fn stored_values_are_loaded_and_clamped() {
        let prefs = Rc::new(InMemoryPreferences::new());
        prefs.set(PREF_INACTIVITY_THRESHOLD_MINUTES, PrefValue::Integer(-5)).unwrap();
        prefs.set(PREF_MEMORY_THRESHOLD_MB, PrefValue::Integer(4096)).unwrap();
        prefs.set(PREF_OPTIMIZER_ENABLED, PrefValue::Bool(false)).unwrap();

        let settings = MemorySettings::new(prefs);
        assert_eq!(settings.inactivity_threshold(), MINUTE);
        assert_eq!(settings.memory_threshold_mb(), 4096);
        assert!(!settings.is_enabled());
        assert_eq!(settings.level(), OptimizationLevel::Disabled);
    }

    struct ReadOnlyPrefs;

    impl PreferenceStore for ReadOnlyPrefs {
        fn get(&self, _key: &str) -> Option<PrefValue> {
            None
        }

        fn set(&self, _key: &str, _value: PrefValue) -> Result<(), StorageError> {
            Err(StorageError::Io {
                path: "prefs.json".into(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
        }
    }

    #[test]
    fn failed_writes_still_apply_in_memory() {
        let settings = MemorySettings::new(Rc::new(ReadOnlyPrefs));
        settings.set_level(OptimizationLevel::Conservative);
        assert_eq!(settings.level(), OptimizationLevel::Conservative);
    }
}
