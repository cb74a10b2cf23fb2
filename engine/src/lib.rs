use tabs::TabHandle;

mod headless;

pub use headless::{HeadlessEngine, SubscriptionId};

/// Whether an engine transition finished inside the call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Transition {
    Complete,
    /// The engine will report completion later.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("tab {0} cannot be suspended on this platform")]
    Unsupported(TabHandle),

    #[error("tab {0} no longer exists")]
    NotFound(TabHandle),
}

/// Interface to the engine that owns tab contents.
///
/// The optimizer only ever reaches live tabs through this trait and never
/// holds engine objects directly.
pub trait TabLifecycle {
    /// Enumerates every open tab.
    fn tabs(&self) -> Vec<TabHandle>;

    /// Returns whether `tab` still refers to an open tab.
    fn is_alive(&self, tab: TabHandle) -> bool;

    /// Estimated resident memory of the tab's content process, in megabytes.
    fn estimated_memory_mb(&self, tab: TabHandle) -> Result<u64, LifecycleError>;

    /// Mutes the tab and discards its live content.
    fn mute_and_hide(&self, tab: TabHandle) -> Result<Transition, LifecycleError>;

    /// Unmutes the tab and restores its content.
    fn unmute_and_show(&self, tab: TabHandle) -> Result<Transition, LifecycleError>;

    fn is_audible(&self, tab: TabHandle) -> bool;

    /// Screen or tab sharing, recording.
    fn is_being_captured(&self, tab: TabHandle) -> bool;

    /// A user-initiated navigation is waiting for its response.
    fn has_pending_navigation(&self, tab: TabHandle) -> bool;

    fn is_foreground(&self, tab: TabHandle) -> bool;
}
