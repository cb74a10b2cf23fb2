use std::collections::HashMap;
use std::time::Instant;

use tracing::trace;

use crate::TabHandle;

/// Engine transition that has been requested but not yet confirmed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PendingTransition {
    Suspend,
    Resume,
}

/// Suspension bookkeeping for a single tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabRecord {
    pub handle: TabHandle,
    pub last_active_time: Instant,
    pub is_suspended: bool,
    /// Estimated resident memory captured at suspension, zero otherwise.
    pub memory_usage_before_suspend_mb: u64,
    /// Set while the engine is still applying a suspend or resume.
    pub pending: Option<PendingTransition>,
    /// When the current suspension began.
    pub suspended_at: Option<Instant>,
}

impl TabRecord {
    fn new(handle: TabHandle, now: Instant) -> Self {
        Self {
            handle,
            last_active_time: now,
            is_suspended: false,
            memory_usage_before_suspend_mb: 0,
            pending: None,
            suspended_at: None,
        }
    }
}

/// Tracks every open tab from creation to destruction.
///
/// The registry never owns tab lifetime and never talks to the engine; it
/// only records what the optimizer has observed and applied.
#[derive(Debug, Default)]
pub struct TabRegistry {
    records: HashMap<TabHandle, TabRecord>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record for `tab`. Returns `false` if it was already registered.
    pub fn register(&mut self, tab: TabHandle, now: Instant) -> bool {
        if self.records.contains_key(&tab) {
            return false;
        }
        trace!(%tab, "registering tab");
        self.records.insert(tab, TabRecord::new(tab, now));
        true
    }

    /// Drops the record for `tab`, suspended or not, and returns it.
    pub fn unregister(&mut self, tab: TabHandle) -> Option<TabRecord> {
        let removed = self.records.remove(&tab);
        if removed.is_some() {
            trace!(%tab, "unregistered tab");
        }
        removed
    }

    /// Records foreground use. Resuming a suspended tab is the caller's job.
    pub fn mark_active(&mut self, tab: TabHandle, now: Instant) -> bool {
        let Some(record) = self.records.get_mut(&tab) else {
            return false;
        };
        record.last_active_time = now;
        true
    }

    /// Records the moment a tab left the foreground.
    pub fn mark_inactive(&mut self, tab: TabHandle, now: Instant) -> bool {
        let Some(record) = self.records.get_mut(&tab) else {
            return false;
        };
        record.last_active_time = now;
        true
    }

    pub fn lookup(&self, tab: TabHandle) -> Option<&TabRecord> {
        self.records.get(&tab)
    }

    pub fn lookup_mut(&mut self, tab: TabHandle) -> Option<&mut TabRecord> {
        self.records.get_mut(&tab)
    }

    pub fn contains(&self, tab: TabHandle) -> bool {
        self.records.contains_key(&tab)
    }

    /// Owned snapshot of every registered tab.
    ///
    /// Sweeps iterate the snapshot, so records added or removed while the
    /// sweep applies its actions neither repeat nor vanish from it.
    pub fn all(&self) -> Vec<(TabHandle, TabRecord)> {
        self.records
            .iter()
            .map(|(handle, record)| (*handle, record.clone()))
            .collect()
    }

    /// Handles of every currently suspended tab.
    pub fn suspended(&self) -> Vec<TabHandle> {
        self.records
            .values()
            .filter(|record| record.is_suspended)
            .map(|record| record.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TabId;
    use std::time::Duration;

    fn handle(raw: u64) -> TabHandle {
        TabHandle::new(TabId::new(raw), 0)
    }

    #[test]
    fn registered_tab_starts_unsuspended() {
        let now = Instant::now();
        let mut registry = TabRegistry::new();
        assert!(registry.register(handle(1), now));

        let record = registry.lookup(handle(1)).unwrap();
        assert!(!record.is_suspended);
        assert_eq!(record.last_active_time, now);
        assert_eq!(record.memory_usage_before_suspend_mb, 0);
        assert_eq!(record.pending, None);
    }

    #[test]
    fn duplicate_registration_keeps_original_record() {
        let now = Instant::now();
        let mut registry = TabRegistry::new();
        registry.register(handle(1), now);
        registry.lookup_mut(handle(1)).unwrap().is_suspended = true;

        assert!(!registry.register(handle(1), now + Duration::from_secs(5)));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(handle(1)).unwrap().is_suspended);
    }

    #[test]
    fn unregister_drops_suspended_record() {
        let now = Instant::now();
        let mut registry = TabRegistry::new();
        registry.register(handle(1), now);
        {
            let record = registry.lookup_mut(handle(1)).unwrap();
            record.is_suspended = true;
            record.memory_usage_before_suspend_mb = 120;
        }

        let removed = registry.unregister(handle(1)).unwrap();
        assert_eq!(removed.memory_usage_before_suspend_mb, 120);
        assert!(registry.lookup(handle(1)).is_none());
        assert!(registry.unregister(handle(1)).is_none());
    }

    #[test]
    fn activity_marks_update_timestamp_only() {
        let now = Instant::now();
        let later = now + Duration::from_secs(60);
        let mut registry = TabRegistry::new();
        registry.register(handle(1), now);
        registry.lookup_mut(handle(1)).unwrap().is_suspended = true;

        assert!(registry.mark_active(handle(1), later));
        let record = registry.lookup(handle(1)).unwrap();
        assert_eq!(record.last_active_time, later);
        assert!(record.is_suspended);

        assert!(!registry.mark_inactive(handle(2), later));
    }

    #[test]
    fn snapshot_lists_each_tab_once() {
        let now = Instant::now();
        let mut registry = TabRegistry::new();
        for raw in 1..=4 {
            registry.register(handle(raw), now);
        }

        let snapshot = registry.all();
        registry.unregister(handle(2));
        registry.register(handle(5), now);

        let mut ids: Vec<u64> = snapshot.iter().map(|(tab, _)| tab.id.get()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn reused_slot_is_a_distinct_entry() {
        let now = Instant::now();
        let mut registry = TabRegistry::new();
        let old = TabHandle::new(TabId::new(1), 0);
        let new = TabHandle::new(TabId::new(1), 1);
        registry.register(old, now);
        registry.register(new, now);
        assert_eq!(registry.len(), 2);
        registry.unregister(old);
        assert!(registry.contains(new));
    }
}
