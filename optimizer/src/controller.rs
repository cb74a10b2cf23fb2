use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use engine::{LifecycleError, TabLifecycle, Transition};
use memory::MemoryPressureMonitor;
use policy::{Decision, OptimizationLevel, OptimizerConfig, TabSignals};
use tabs::{PendingTransition, TabEvent, TabHandle, TabRecord, TabRegistry};
use tracing::{debug, trace, warn};
use util::{Clock, SystemClock};

use crate::events::{EventBus, OptimizerEvent, SubscriptionId, SweepReport};
use crate::settings::MemorySettings;
use crate::stats::AggregateStats;

/// Time between periodic sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SuspendOutcome {
    Suspended,
    /// The engine accepted the request and will confirm it later.
    Pending,
    /// Not running, not registered, already suspended or mid-transition.
    Skipped,
    Unsupported,
    /// The tab no longer exists; its record was dropped.
    Gone,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResumeOutcome {
    Resumed,
    Pending,
    /// Not registered, not suspended or mid-transition.
    Skipped,
    Unsupported,
    Gone,
}

struct Inner {
    run: RunState,
    registry: TabRegistry,
    stats: AggregateStats,
    next_sweep: Option<Instant>,
    /// Suspends the engine has accepted but not confirmed.
    pending_suspends: HashMap<TabHandle, PendingSuspend>,
    /// Tabs whose suspend was still in flight when the optimizer stopped.
    orphaned: HashSet<TabHandle>,
}

#[derive(Debug, Clone, Copy)]
struct PendingSuspend {
    memory_mb: u64,
    /// The tab was used again before the engine confirmed.
    cancelled: bool,
}

/// Decides which tabs to suspend and applies the decisions.
///
/// Everything runs on the thread that delivers tab notifications. State sits
/// behind a `RefCell` that is never borrowed across engine calls or event
/// publication, so listeners and the engine may call back in.
pub struct MemoryOptimizer {
    engine: Rc<dyn TabLifecycle>,
    monitor: MemoryPressureMonitor,
    settings: MemorySettings,
    clock: Rc<dyn Clock>,
    sweep_interval: Duration,
    inner: RefCell<Inner>,
    events: EventBus,
}

impl MemoryOptimizer {
    pub fn new<E: TabLifecycle + 'static>(
        engine: Rc<E>,
        monitor: MemoryPressureMonitor,
        settings: MemorySettings,
    ) -> Self {
        let engine: Rc<dyn TabLifecycle> = engine;
        Self {
            engine,
            monitor,
            settings,
            clock: Rc::new(SystemClock),
            sweep_interval: SWEEP_INTERVAL,
            inner: RefCell::new(Inner {
                run: RunState::Stopped,
                registry: TabRegistry::new(),
                stats: AggregateStats::default(),
                next_sweep: None,
                pending_suspends: HashMap::new(),
                orphaned: HashSet::new(),
            }),
            events: EventBus::new(),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: Rc<C>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Registers every open tab and schedules the first sweep.
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        let now = self.clock.now();
        let tabs = self.engine.tabs();
        let count = {
            let mut inner = self.inner.borrow_mut();
            inner.run = RunState::Running;
            for tab in tabs {
                inner.registry.register(tab, now);
            }
            inner.next_sweep = Some(now + self.sweep_interval);
            inner.registry.len()
        };
        self.events.publish(OptimizerEvent::Started { tabs: count });
    }

    /// Resumes every suspended tab, then forgets all tabs and statistics.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        let resumed = self.resume_all();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let in_flight = inner
                .registry
                .all()
                .into_iter()
                .filter(|(_, record)| record.pending == Some(PendingTransition::Suspend))
                .map(|(tab, _)| tab);
            inner.orphaned.extend(in_flight);
            inner.pending_suspends.clear();
            inner.run = RunState::Stopped;
            inner.registry.clear();
            inner.stats.reset();
            inner.next_sweep = None;
        }
        self.events.publish(OptimizerEvent::Stopped { resumed });
    }

    pub fn run_state(&self) -> RunState {
        self.inner.borrow().run
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// Runs a sweep if one is due. Returns whether it did.
    pub fn poll(&self) -> bool {
        let now = self.clock.now();
        let due = {
            let inner = self.inner.borrow();
            inner.run == RunState::Running && inner.next_sweep.is_some_and(|at| now >= at)
        };
        due && self.sweep().is_some()
    }

    /// Evaluates every registered tab once and suspends the idle ones.
    ///
    /// Returns `None` when stopped or disabled.
    pub fn sweep(&self) -> Option<SweepReport> {
        let now = self.clock.now();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.run != RunState::Running {
                return None;
            }
            inner.next_sweep = Some(now + self.sweep_interval);
        }

        let config = self.settings.config();
        if !config.enabled {
            // The switch may have been flipped on the settings directly.
            if self.suspended_count() > 0 {
                self.resume_all();
            }
            return None;
        }

        let started = Instant::now();
        let pressure = self.monitor.sample();
        let snapshot = self.inner.borrow().registry.all();
        let mut report = SweepReport {
            pressure,
            evaluated: snapshot.len(),
            suspended: 0,
            pending: 0,
            failed: 0,
            duration: Duration::ZERO,
        };

        for (tab, record) in snapshot {
            if !self.is_running() {
                break;
            }
            let signals = self.signals(tab);
            // Suspended tabs are closed too without a destroy notification.
            if !signals.alive {
                self.drop_stale(tab);
                report.failed += 1;
                continue;
            }
            let decision = policy::evaluate(&record, &signals, &config, now, pressure);
            trace!(%tab, ?decision, "evaluated tab");
            match decision {
                Decision::Suspend => match self.suspend_tab(tab) {
                    SuspendOutcome::Suspended => report.suspended += 1,
                    SuspendOutcome::Pending => report.pending += 1,
                    SuspendOutcome::Unsupported | SuspendOutcome::Gone => report.failed += 1,
                    SuspendOutcome::Skipped => {}
                },
                Decision::Keep(_) => {}
            }
        }

        report.duration = started.elapsed();
        self.events.publish(OptimizerEvent::SweepCompleted(report));
        Some(report)
    }

    /// Suspends `tab` now, whatever its idle time.
    ///
    /// Does nothing while stopped or disabled, for tabs already suspended, and
    /// for tabs with a transition in flight.
    pub fn suspend(&self, tab: TabHandle) -> SuspendOutcome {
        if !self.settings.is_enabled() {
            return SuspendOutcome::Skipped;
        }
        self.suspend_tab(tab)
    }

    /// Same as [`suspend`](Self::suspend); the per-tab menu action.
    pub fn suspend_inactive(&self, tab: TabHandle) -> SuspendOutcome {
        self.suspend(tab)
    }

    fn suspend_tab(&self, tab: TabHandle) -> SuspendOutcome {
        let now = self.clock.now();
        {
            let inner = self.inner.borrow();
            if inner.run != RunState::Running || inner.orphaned.contains(&tab) {
                return SuspendOutcome::Skipped;
            }
            match inner.registry.lookup(tab) {
                Some(record) if !record.is_suspended && record.pending.is_none() => {}
                _ => return SuspendOutcome::Skipped,
            }
        }

        let memory_mb = match self.engine.estimated_memory_mb(tab) {
            Ok(memory_mb) => memory_mb,
            Err(LifecycleError::NotFound(_)) => {
                self.drop_stale(tab);
                return SuspendOutcome::Gone;
            }
            Err(LifecycleError::Unsupported(_)) => 0,
        };

        match self.engine.mute_and_hide(tab) {
            Ok(Transition::Complete) => {
                self.finish_suspend(tab, memory_mb, now);
                SuspendOutcome::Suspended
            }
            Ok(Transition::Pending) => {
                {
                    let mut guard = self.inner.borrow_mut();
                    let inner = &mut *guard;
                    if let Some(record) = inner.registry.lookup_mut(tab) {
                        record.pending = Some(PendingTransition::Suspend);
                        inner.pending_suspends.insert(
                            tab,
                            PendingSuspend {
                                memory_mb,
                                cancelled: false,
                            },
                        );
                    }
                }
                debug!(%tab, memory_mb, "suspend pending");
                SuspendOutcome::Pending
            }
            Err(LifecycleError::Unsupported(_)) => {
                self.events.publish(OptimizerEvent::SuspendUnsupported { tab });
                SuspendOutcome::Unsupported
            }
            Err(LifecycleError::NotFound(_)) => {
                self.drop_stale(tab);
                SuspendOutcome::Gone
            }
        }
    }

    /// Restores a suspended tab.
    pub fn resume(&self, tab: TabHandle) -> ResumeOutcome {
        let now = self.clock.now();
        {
            let inner = self.inner.borrow();
            match inner.registry.lookup(tab) {
                Some(record) if record.is_suspended && record.pending.is_none() => {}
                _ => return ResumeOutcome::Skipped,
            }
        }

        match self.engine.unmute_and_show(tab) {
            Ok(Transition::Complete) => {
                self.finish_resume(tab, now);
                ResumeOutcome::Resumed
            }
            Ok(Transition::Pending) => {
                if let Some(record) = self.inner.borrow_mut().registry.lookup_mut(tab) {
                    record.pending = Some(PendingTransition::Resume);
                }
                debug!(%tab, "resume pending");
                ResumeOutcome::Pending
            }
            Err(LifecycleError::Unsupported(_)) => {
                warn!(%tab, "engine cannot resume tab");
                ResumeOutcome::Unsupported
            }
            Err(LifecycleError::NotFound(_)) => {
                self.drop_stale(tab);
                ResumeOutcome::Gone
            }
        }
    }

    /// Suspends every tab not protected by use, media or navigation,
    /// regardless of idle time. Returns how many were suspended or pending.
    pub fn suspend_all(&self) -> usize {
        if !self.is_running() || !self.settings.is_enabled() {
            return 0;
        }
        let snapshot = self.inner.borrow().registry.all();
        let mut count = 0;
        for (tab, record) in snapshot {
            let signals = self.signals(tab);
            if !signals.alive {
                self.drop_stale(tab);
                continue;
            }
            match policy::protection(&record, &signals) {
                None => {
                    if matches!(
                        self.suspend_tab(tab),
                        SuspendOutcome::Suspended | SuspendOutcome::Pending
                    ) {
                        count += 1;
                    }
                }
                Some(_) => {}
            }
        }
        count
    }

    /// Resumes every suspended tab. Returns how many were resumed or pending.
    pub fn resume_all(&self) -> usize {
        let suspended = self.inner.borrow().registry.suspended();
        suspended
            .into_iter()
            .filter(|tab| {
                matches!(
                    self.resume(*tab),
                    ResumeOutcome::Resumed | ResumeOutcome::Pending
                )
            })
            .count()
    }

    /// Applies a tab lifecycle notification from the engine.
    pub fn on_tab_event(&self, event: TabEvent) {
        let now = self.clock.now();
        match event {
            TabEvent::Created(tab) => {
                let mut inner = self.inner.borrow_mut();
                if inner.run == RunState::Running {
                    inner.registry.register(tab, now);
                }
            }
            TabEvent::Destroyed(tab) => {
                if let Some(record) = self.forget(tab) {
                    debug!(%tab, was_suspended = record.is_suspended, "tab destroyed");
                }
            }
            TabEvent::ForegroundChanged {
                tab,
                visible: false,
            } => {
                self.inner.borrow_mut().registry.mark_inactive(tab, now);
            }
            TabEvent::ForegroundChanged { tab, visible: true }
            | TabEvent::NavigationStarted(tab)
            | TabEvent::NavigationCommitted(tab) => self.activate(tab, now),
        }
    }

    /// Completes a transition the engine reported as pending.
    pub fn on_transition_complete(&self, tab: TabHandle, result: Result<(), LifecycleError>) {
        let now = self.clock.now();
        if self.inner.borrow_mut().orphaned.remove(&tab) {
            if result.is_ok() {
                self.restore_orphan(tab);
            }
            return;
        }

        let pending = self
            .inner
            .borrow()
            .registry
            .lookup(tab)
            .and_then(|record| record.pending);

        match (pending, result) {
            (None, _) => debug!(%tab, "completion without a pending transition"),
            (Some(PendingTransition::Suspend), Ok(())) => {
                let requested = self.inner.borrow_mut().pending_suspends.remove(&tab);
                match requested {
                    Some(PendingSuspend {
                        memory_mb,
                        cancelled: false,
                    }) if self.is_running() && self.settings.is_enabled() => {
                        self.finish_suspend(tab, memory_mb, now)
                    }
                    _ => self.reverse_suspend(tab),
                }
            }
            (Some(PendingTransition::Resume), Ok(())) => self.finish_resume(tab, now),
            (Some(PendingTransition::Suspend), Err(LifecycleError::Unsupported(_))) => {
                self.clear_pending(tab);
                self.events.publish(OptimizerEvent::SuspendUnsupported { tab });
            }
            (Some(PendingTransition::Resume), Err(LifecycleError::Unsupported(_))) => {
                self.clear_pending(tab);
                warn!(%tab, "engine cannot resume tab");
            }
            (Some(_), Err(LifecycleError::NotFound(_))) => self.drop_stale(tab),
        }
    }

    /// Turns the master switch on or off. Off resumes every suspended tab.
    pub fn set_enabled(&self, enabled: bool) {
        self.settings.set_enabled(enabled);
        if !enabled {
            self.resume_all();
        }
    }

    pub fn set_level(&self, level: OptimizationLevel) {
        self.settings.set_level(level);
        if !self.settings.is_enabled() {
            self.resume_all();
        }
    }

    pub fn level(&self) -> OptimizationLevel {
        self.settings.level()
    }

    /// Takes effect from the next sweep.
    pub fn set_inactivity_threshold(&self, threshold: Duration) -> Duration {
        self.settings.set_inactivity_threshold(threshold)
    }

    pub fn set_memory_threshold_mb(&self, memory_mb: u64) -> u64 {
        self.settings.set_memory_threshold_mb(memory_mb)
    }

    pub fn config(&self) -> OptimizerConfig {
        self.settings.config()
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn suspended_count(&self) -> usize {
        self.inner.borrow().stats.suspended_count
    }

    pub fn memory_saved_mb(&self) -> u64 {
        self.inner.borrow().stats.total_memory_saved_mb
    }

    pub fn stats(&self) -> AggregateStats {
        self.inner.borrow().stats
    }

    pub fn is_suspended(&self, tab: TabHandle) -> bool {
        self.inner
            .borrow()
            .registry
            .lookup(tab)
            .is_some_and(|record| record.is_suspended)
    }

    pub fn record(&self, tab: TabHandle) -> Option<TabRecord> {
        self.inner.borrow().registry.lookup(tab).cloned()
    }

    pub fn tab_count(&self) -> usize {
        self.inner.borrow().registry.len()
    }

    pub fn next_sweep_at(&self) -> Option<Instant> {
        self.inner.borrow().next_sweep
    }

    pub fn subscribe<F: Fn(&OptimizerEvent) + 'static>(&self, listener: F) -> SubscriptionId {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    fn activate(&self, tab: TabHandle, now: Instant) {
        let suspended = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if !inner.registry.mark_active(tab, now) {
                return;
            }
            if let Some(pending) = inner.pending_suspends.get_mut(&tab) {
                pending.cancelled = true;
            }
            inner
                .registry
                .lookup(tab)
                .is_some_and(|record| record.is_suspended)
        };
        if suspended {
            self.resume(tab);
        }
    }

    fn signals(&self, tab: TabHandle) -> TabSignals {
        if !self.engine.is_alive(tab) {
            return TabSignals {
                alive: false,
                ..TabSignals::default()
            };
        }
        TabSignals {
            alive: true,
            foreground: self.engine.is_foreground(tab),
            audible: self.engine.is_audible(tab),
            captured: self.engine.is_being_captured(tab),
            pending_navigation: self.engine.has_pending_navigation(tab),
        }
    }

    fn finish_suspend(&self, tab: TabHandle, memory_mb: u64, now: Instant) {
        let applied = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match inner.registry.lookup_mut(tab) {
                Some(record) => {
                    record.is_suspended = true;
                    record.pending = None;
                    record.memory_usage_before_suspend_mb = memory_mb;
                    record.suspended_at = Some(now);
                    inner.stats.record_suspend(memory_mb);
                    true
                }
                None => false,
            }
        };
        if applied {
            self.events
                .publish(OptimizerEvent::TabSuspended { tab, memory_mb });
        }
    }

    fn finish_resume(&self, tab: TabHandle, now: Instant) {
        let resumed = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match inner.registry.lookup_mut(tab) {
                Some(record) if record.is_suspended => {
                    let memory_mb = record.memory_usage_before_suspend_mb;
                    let suspended_for = record
                        .suspended_at
                        .take()
                        .map(|at| now.saturating_duration_since(at));
                    record.is_suspended = false;
                    record.pending = None;
                    record.memory_usage_before_suspend_mb = 0;
                    record.last_active_time = now;
                    inner.stats.record_release(memory_mb);
                    Some((memory_mb, suspended_for))
                }
                Some(record) => {
                    record.pending = None;
                    None
                }
                None => None,
            }
        };
        if let Some((memory_mb, suspended_for)) = resumed {
            self.events.publish(OptimizerEvent::TabResumed {
                tab,
                memory_mb,
                suspended_for,
            });
        }
    }

    /// Undoes a suspend that completed after the tab was used again or the
    /// optimizer was switched off.
    fn reverse_suspend(&self, tab: TabHandle) {
        self.clear_pending(tab);
        match self.engine.unmute_and_show(tab) {
            Ok(Transition::Complete) => debug!(%tab, "reversed late suspend"),
            Ok(Transition::Pending) => {
                if let Some(record) = self.inner.borrow_mut().registry.lookup_mut(tab) {
                    record.pending = Some(PendingTransition::Resume);
                }
            }
            Err(LifecycleError::NotFound(_)) => self.drop_stale(tab),
            Err(err) => warn!(%tab, %err, "could not reverse late suspend"),
        }
    }

    fn restore_orphan(&self, tab: TabHandle) {
        match self.engine.unmute_and_show(tab) {
            Ok(_) => debug!(%tab, "restored tab suspended after stop"),
            Err(err) => warn!(%tab, %err, "could not restore tab suspended after stop"),
        }
    }

    fn clear_pending(&self, tab: TabHandle) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.pending_suspends.remove(&tab);
        if let Some(record) = inner.registry.lookup_mut(tab) {
            record.pending = None;
        }
    }

    /// Drops a record whose tab vanished without a destroy notification.
    fn drop_stale(&self, tab: TabHandle) {
        if let Some(record) = self.forget(tab) {
            let memory_mb = if record.is_suspended {
                record.memory_usage_before_suspend_mb
            } else {
                0
            };
            self.events
                .publish(OptimizerEvent::StaleTabDropped { tab, memory_mb });
        }
    }

    /// Removes a tab and its contribution to the statistics.
    fn forget(&self, tab: TabHandle) -> Option<TabRecord> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.orphaned.remove(&tab);
        inner.pending_suspends.remove(&tab);
        let record = inner.registry.unregister(tab)?;
        if record.is_suspended {
            inner.stats.record_release(record.memory_usage_before_suspend_mb);
        }
        Some(record)
    }
}

impl Drop for MemoryOptimizer {
    fn drop(&mut self) {
        self.stop();
    }
}
