use serde::Serialize;

/// Aggregate effect of the tabs currently suspended.
///
/// Only the optimizer's suspend, resume and drop paths mutate it; readers get
/// a copy.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct AggregateStats {
    pub suspended_count: usize,
    pub total_memory_saved_mb: u64,
}

impl AggregateStats {
    pub(crate) fn record_suspend(&mut self, memory_mb: u64) {
        self.suspended_count += 1;
        self.total_memory_saved_mb = self.total_memory_saved_mb.saturating_add(memory_mb);
    }

    /// Removes a tab's contribution. Never goes below zero.
    pub(crate) fn record_release(&mut self, memory_mb: u64) {
        self.suspended_count = self.suspended_count.saturating_sub(1);
        self.total_memory_saved_mb = self.total_memory_saved_mb.saturating_sub(memory_mb);
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn release_saturates_at_zero() {
        let mut stats = AggregateStats::default();
        stats.record_suspend(100);
        stats.record_release(250);
        assert_eq!(stats, AggregateStats::default());

        stats.record_release(10);
        assert_eq!(stats.suspended_count, 0);
        assert_eq!(stats.total_memory_saved_mb, 0);
    }

    proptest! {
        #[test]
        fn balanced_suspend_release_tracks_sum(sizes in proptest::collection::vec(0u64..10_000, 0..32)) {
            let mut stats = AggregateStats::default();
            for size in &sizes {
                stats.record_suspend(*size);
            }
            prop_assert_eq!(stats.suspended_count, sizes.len());
            prop_assert_eq!(stats.total_memory_saved_mb, sizes.iter().sum::<u64>());

            for size in sizes.iter().rev() {
                stats.record_release(*size);
            }
            prop_assert_eq!(stats, AggregateStats::default());
        }
    }
}
