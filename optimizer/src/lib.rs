//! Tab memory optimizer.
//!
//! [`MemoryOptimizer`] periodically sweeps the registered tabs, suspends the
//! ones the policy finds idle and resumes them when the user returns. Its
//! configuration comes from [`MemorySettings`]; its effect is summarised in
//! [`AggregateStats`] and reported as [`OptimizerEvent`]s.

mod controller;
mod events;
pub mod settings;
mod stats;

pub use controller::{MemoryOptimizer, ResumeOutcome, RunState, SuspendOutcome, SWEEP_INTERVAL};
pub use events::{EventBus, OptimizerEvent, SubscriptionId, SweepReport};
pub use settings::MemorySettings;
pub use stats::AggregateStats;

pub use policy::{OptimizationLevel, OptimizerConfig, PressureLevel};
