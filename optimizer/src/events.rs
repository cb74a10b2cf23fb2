use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use policy::PressureLevel;
use tabs::TabHandle;
use tracing::{debug, info, warn};
use util::IdGenerator;

/// Summary of one periodic sweep.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SweepReport {
    pub pressure: PressureLevel,
    /// Registered tabs at the start of the sweep.
    pub evaluated: usize,
    pub suspended: usize,
    /// Suspensions the engine has not confirmed yet.
    pub pending: usize,
    /// Tabs whose suspension failed or whose handle went stale.
    pub failed: usize,
    pub duration: Duration,
}

/// Observable optimizer activity.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OptimizerEvent {
    Started { tabs: usize },
    Stopped { resumed: usize },
    TabSuspended { tab: TabHandle, memory_mb: u64 },
    TabResumed {
        tab: TabHandle,
        memory_mb: u64,
        suspended_for: Option<Duration>,
    },
    SuspendUnsupported { tab: TabHandle },
    /// A tab disappeared without a destroy notification.
    StaleTabDropped { tab: TabHandle, memory_mb: u64 },
    SweepCompleted(SweepReport),
}

/// Identifies an optimizer event subscription.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Rc<dyn Fn(&OptimizerEvent)>;

/// Publishes optimizer events to subscribers and the log.
#[derive(Default)]
pub struct EventBus {
    listeners: RefCell<Vec<(SubscriptionId, Listener)>>,
    ids: IdGenerator,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F: Fn(&OptimizerEvent) + 'static>(&self, listener: F) -> SubscriptionId {
        let id = SubscriptionId(self.ids.next());
        self.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        listeners.len() != before
    }

    pub fn publish(&self, event: OptimizerEvent) {
        log_event(&event);
        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

fn log_event(event: &OptimizerEvent) {
    match *event {
        OptimizerEvent::Started { tabs } => info!(tabs, "memory optimizer started"),
        OptimizerEvent::Stopped { resumed } => info!(resumed, "memory optimizer stopped"),
        OptimizerEvent::TabSuspended { tab, memory_mb } => {
            info!(%tab, memory_mb, "suspended tab")
        }
        OptimizerEvent::TabResumed {
            tab,
            memory_mb,
            suspended_for,
        } => info!(
            %tab,
            memory_mb,
            suspended_secs = suspended_for.map(|d| d.as_secs()),
            "resumed tab"
        ),
        OptimizerEvent::SuspendUnsupported { tab } => {
            warn!(%tab, "engine cannot suspend tab")
        }
        OptimizerEvent::StaleTabDropped { tab, memory_mb } => {
            warn!(%tab, memory_mb, "dropped stale tab")
        }
        OptimizerEvent::SweepCompleted(report) => debug!(
            pressure = %report.pressure,
            evaluated = report.evaluated,
            suspended = report.suspended,
            pending = report.pending,
            failed = report.failed,
            duration_us = report.duration.as_micros() as u64,
            "sweep completed"
        ),
    }
}
