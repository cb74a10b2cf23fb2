use std::ops::RangeInclusive;
use std::rc::Rc;
use std::time::Duration;

use optimizer::{MemoryOptimizer, OptimizationLevel};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{UiBridge, UiError, UiMessage};

/// Minutes offered by the inactivity slider.
pub const THRESHOLD_SLIDER_MINUTES: RangeInclusive<u64> = 5..=120;

/// Snapshot rendered by the memory panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelState {
    pub memory_saved_mb: u64,
    pub suspended_tabs: usize,
    pub enabled: bool,
    pub threshold_minutes: u64,
    pub level: &'static str,
}

#[derive(Deserialize)]
struct TogglePayload {
    enabled: bool,
}

#[derive(Deserialize)]
struct ThresholdPayload {
    minutes: i64,
}

/// Binds the memory optimizer to the toolbar panel.
///
/// Every action is followed by a `memory.state` push so the panel never
/// shows stale numbers.
pub struct MemoryOptimizerPanel<B: UiBridge> {
    optimizer: Rc<MemoryOptimizer>,
    bridge: B,
}

impl<B: UiBridge> MemoryOptimizerPanel<B> {
    pub fn new(optimizer: Rc<MemoryOptimizer>, bridge: B) -> Self {
        Self { optimizer, bridge }
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn state(&self) -> PanelState {
        let stats = self.optimizer.stats();
        let config = self.optimizer.config();
        PanelState {
            memory_saved_mb: stats.total_memory_saved_mb,
            suspended_tabs: stats.suspended_count,
            enabled: config.enabled,
            threshold_minutes: config.inactivity_threshold.as_secs() / 60,
            level: self.optimizer.level().as_str(),
        }
    }

    pub fn refresh(&self) {
        let payload = match serde_json::to_value(self.state()) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%err, "could not encode panel state");
                return;
            }
        };
        self.bridge.send(UiMessage::new("memory.state", payload));
    }

    /// The switch maps to the Balanced preset or off.
    pub fn toggle(&self, enabled: bool) {
        let level = if enabled {
            OptimizationLevel::Balanced
        } else {
            OptimizationLevel::Disabled
        };
        self.optimizer.set_level(level);
        self.refresh();
    }

    /// Returns the applied number of minutes.
    pub fn set_threshold_minutes(&self, minutes: i64) -> u64 {
        let minutes = minutes.clamp(
            *THRESHOLD_SLIDER_MINUTES.start() as i64,
            *THRESHOLD_SLIDER_MINUTES.end() as i64,
        ) as u64;
        self.optimizer
            .set_inactivity_threshold(Duration::from_secs(minutes * 60));
        self.refresh();
        minutes
    }

    pub fn suspend_all(&self) -> usize {
        let count = self.optimizer.suspend_all();
        self.refresh();
        count
    }

    pub fn resume_all(&self) -> usize {
        let count = self.optimizer.resume_all();
        self.refresh();
        count
    }

    /// Dispatches a message sent by the panel.
    pub fn handle(&self, message: UiMessage) -> Result<(), UiError> {
        debug!(name = %message.name, "panel message");
        match message.name.as_str() {
            "memory.toggle" => {
                let TogglePayload { enabled } = decode(&message.name, message.payload)?;
                self.toggle(enabled);
            }
            "memory.threshold" => {
                let ThresholdPayload { minutes } = decode(&message.name, message.payload)?;
                self.set_threshold_minutes(minutes);
            }
            "memory.suspend_all" => {
                self.suspend_all();
            }
            "memory.resume_all" => {
                self.resume_all();
            }
            "memory.refresh" => self.refresh(),
            _ => return Err(UiError::UnknownMessage(message.name)),
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(name: &str, payload: Value) -> Result<T, UiError> {
    serde_json::from_value(payload).map_err(|source| UiError::InvalidPayload {
        name: name.to_string(),
        source,
    })
}
