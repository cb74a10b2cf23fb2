use std::fmt;

mod registry;

pub use registry::{PendingTransition, TabRecord, TabRegistry};

/// Stable identifier for a browser tab slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TabId(u64);

impl TabId {
    /// Creates a new `TabId` from a raw numeric value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a live tab owned by the engine.
///
/// Slot ids may be reused once a tab is closed, but every reuse bumps the
/// generation. A handle whose generation no longer matches its slot refers to
/// a destroyed tab.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TabHandle {
    pub id: TabId,
    pub generation: u32,
}

impl TabHandle {
    pub fn new(id: TabId, generation: u32) -> Self {
        Self { id, generation }
    }
}

impl fmt::Display for TabHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

/// Lifecycle notification emitted by the engine for a tab.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TabEvent {
    Created(TabHandle),
    Destroyed(TabHandle),
    ForegroundChanged { tab: TabHandle, visible: bool },
    /// A main-frame navigation started.
    NavigationStarted(TabHandle),
    /// A main-frame navigation committed.
    NavigationCommitted(TabHandle),
}

impl TabEvent {
    /// Returns the tab the event refers to.
    pub fn tab(&self) -> TabHandle {
        match *self {
            TabEvent::Created(tab)
            | TabEvent::Destroyed(tab)
            | TabEvent::NavigationStarted(tab)
            | TabEvent::NavigationCommitted(tab) => tab,
            TabEvent::ForegroundChanged { tab, .. } => tab,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_with_different_generations_differ() {
        let old = TabHandle::new(TabId::new(3), 0);
        let reused = TabHandle::new(TabId::new(3), 1);
        assert_ne!(old, reused);
        assert_eq!(reused.to_string(), "3#1");
    }

    #[test]
    fn event_reports_its_tab() {
        let tab = TabHandle::new(TabId::new(9), 2);
        let event = TabEvent::ForegroundChanged { tab, visible: false };
        assert_eq!(event.tab(), tab);
        assert_eq!(TabEvent::Destroyed(tab).tab(), tab);
    }
}
