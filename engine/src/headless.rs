use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tabs::{TabEvent, TabHandle, TabId};
use tracing::{debug, trace};
use util::IdGenerator;

use crate::{LifecycleError, TabLifecycle, Transition};

/// Identifies a tab event subscription.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
struct TabContents {
    url: String,
    memory_mb: u64,
    foreground: bool,
    audible: bool,
    captured: bool,
    pending_navigation: bool,
    muted: bool,
    discarded: bool,
    discard_supported: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    contents: Option<TabContents>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum QueuedOp {
    Discard,
    Restore,
}

type Subscriber = Rc<dyn Fn(&TabEvent)>;

/// In-process engine without a renderer.
///
/// Tabs are plain records holding the flags the optimizer asks about. Slots
/// are reused after a tab closes with a bumped generation, so stale handles
/// are detected rather than aliased to a new tab. In asynchronous mode
/// discard and restore requests are queued until [`complete_pending`] runs.
///
/// [`complete_pending`]: HeadlessEngine::complete_pending
pub struct HeadlessEngine {
    slots: RefCell<Vec<Slot>>,
    free: RefCell<Vec<usize>>,
    asynchronous: Cell<bool>,
    queued: RefCell<Vec<(TabHandle, QueuedOp)>>,
    subscribers: RefCell<Vec<(SubscriptionId, Subscriber)>>,
    subscription_ids: IdGenerator,
}

impl Default for HeadlessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            asynchronous: Cell::new(false),
            queued: RefCell::new(Vec::new()),
            subscribers: RefCell::new(Vec::new()),
            subscription_ids: IdGenerator::default(),
        }
    }

    /// Makes discard and restore report `Transition::Pending`.
    pub fn set_asynchronous(&self, asynchronous: bool) {
        self.asynchronous.set(asynchronous);
    }

    /// Registers a listener for tab lifecycle events.
    pub fn subscribe<F: Fn(&TabEvent) + 'static>(&self, listener: F) -> SubscriptionId {
        let id = SubscriptionId(self.subscription_ids.next());
        self.subscribers.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.borrow_mut().retain(|(sub, _)| *sub != id);
    }

    /// Opens a background tab.
    pub fn open_tab(&self, url: &str, memory_mb: u64) -> TabHandle {
        let contents = TabContents {
            url: url.to_string(),
            memory_mb,
            foreground: false,
            audible: false,
            captured: false,
            pending_navigation: false,
            muted: false,
            discarded: false,
            discard_supported: true,
        };

        let handle = {
            let mut slots = self.slots.borrow_mut();
            let index = match self.free.borrow_mut().pop() {
                Some(index) => index,
                None => {
                    slots.push(Slot::default());
                    slots.len() - 1
                }
            };
            let slot = &mut slots[index];
            slot.contents = Some(contents);
            TabHandle::new(TabId::new(index as u64), slot.generation)
        };

        debug!(tab = %handle, url, "opened tab");
        self.emit(TabEvent::Created(handle));
        handle
    }

    /// Closes a tab. Returns `false` for stale handles.
    pub fn close_tab(&self, tab: TabHandle) -> bool {
        let was_foreground = {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = live_slot_mut(&mut slots, tab) else {
                return false;
            };
            let foreground = slot.contents.as_ref().is_some_and(|c| c.foreground);
            slot.contents = None;
            slot.generation = slot.generation.wrapping_add(1);
            foreground
        };
        self.free.borrow_mut().push(tab.id.get() as usize);
        self.queued.borrow_mut().retain(|(queued, _)| *queued != tab);

        debug!(%tab, was_foreground, "closed tab");
        self.emit(TabEvent::Destroyed(tab));
        true
    }

    /// Brings `tab` to the foreground, sending the previous one to background.
    pub fn activate(&self, tab: TabHandle) -> bool {
        if !self.is_alive(tab) {
            return false;
        }
        let mut changes = Vec::new();
        {
            let mut slots = self.slots.borrow_mut();
            for (index, slot) in slots.iter_mut().enumerate() {
                let handle = TabHandle::new(TabId::new(index as u64), slot.generation);
                let Some(contents) = slot.contents.as_mut() else {
                    continue;
                };
                let visible = handle == tab;
                if contents.foreground != visible {
                    contents.foreground = visible;
                    changes.push(TabEvent::ForegroundChanged {
                        tab: handle,
                        visible,
                    });
                }
            }
        }
        // Background notifications go out before the new foreground one.
        changes.sort_by_key(|event| matches!(event, TabEvent::ForegroundChanged { visible: true, .. }));
        for event in changes {
            self.emit(event);
        }
        true
    }

    /// Starts a main-frame navigation that stays pending until committed.
    pub fn navigate(&self, tab: TabHandle, url: &str) -> bool {
        let started = self.update(tab, |contents| {
            contents.url = url.to_string();
            contents.pending_navigation = true;
        });
        if started {
            self.emit(TabEvent::NavigationStarted(tab));
        }
        started
    }

    pub fn commit_navigation(&self, tab: TabHandle) -> bool {
        let committed = self.update(tab, |contents| contents.pending_navigation = false);
        if committed {
            self.emit(TabEvent::NavigationCommitted(tab));
        }
        committed
    }

    pub fn set_audible(&self, tab: TabHandle, audible: bool) -> bool {
        self.update(tab, |contents| contents.audible = audible)
    }

    pub fn set_captured(&self, tab: TabHandle, captured: bool) -> bool {
        self.update(tab, |contents| contents.captured = captured)
    }

    pub fn set_memory_mb(&self, tab: TabHandle, memory_mb: u64) -> bool {
        self.update(tab, |contents| contents.memory_mb = memory_mb)
    }

    /// Marks a tab whose content cannot be discarded.
    pub fn set_discard_supported(&self, tab: TabHandle, supported: bool) -> bool {
        self.update(tab, |contents| contents.discard_supported = supported)
    }

    pub fn is_discarded(&self, tab: TabHandle) -> bool {
        self.read(tab, |contents| contents.discarded).unwrap_or(false)
    }

    pub fn is_muted(&self, tab: TabHandle) -> bool {
        self.read(tab, |contents| contents.muted).unwrap_or(false)
    }

    pub fn url(&self, tab: TabHandle) -> Option<String> {
        self.read(tab, |contents| contents.url.clone())
    }

    /// Number of transitions waiting for [`complete_pending`](Self::complete_pending).
    pub fn pending_count(&self) -> usize {
        self.queued.borrow().len()
    }

    /// Applies queued transitions and reports their outcome.
    ///
    /// The host forwards each result to the optimizer.
    pub fn complete_pending(&self) -> Vec<(TabHandle, Result<(), LifecycleError>)> {
        let queued = std::mem::take(&mut *self.queued.borrow_mut());
        queued
            .into_iter()
            .map(|(tab, op)| {
                let applied = self.update(tab, |contents| apply(contents, op));
                let result = if applied {
                    Ok(())
                } else {
                    Err(LifecycleError::NotFound(tab))
                };
                trace!(%tab, ?op, ok = applied, "completed queued transition");
                (tab, result)
            })
            .collect()
    }

    fn transition(&self, tab: TabHandle, op: QueuedOp) -> Result<Transition, LifecycleError> {
        let supported = self
            .read(tab, |contents| contents.discard_supported)
            .ok_or(LifecycleError::NotFound(tab))?;
        if op == QueuedOp::Discard && !supported {
            return Err(LifecycleError::Unsupported(tab));
        }

        if self.asynchronous.get() {
            self.queued.borrow_mut().push((tab, op));
            return Ok(Transition::Pending);
        }

        self.update(tab, |contents| apply(contents, op));
        Ok(Transition::Complete)
    }

    fn update<F: FnOnce(&mut TabContents)>(&self, tab: TabHandle, f: F) -> bool {
        let mut slots = self.slots.borrow_mut();
        let Some(contents) = live_slot_mut(&mut slots, tab).and_then(|slot| slot.contents.as_mut())
        else {
            return false;
        };
        f(contents);
        true
    }

    fn read<T, F: FnOnce(&TabContents) -> T>(&self, tab: TabHandle, f: F) -> Option<T> {
        let slots = self.slots.borrow();
        let slot = slots.get(tab.id.get() as usize)?;
        if slot.generation != tab.generation {
            return None;
        }
        slot.contents.as_ref().map(f)
    }

    fn emit(&self, event: TabEvent) {
        // Listeners may call back into the engine.
        let listeners: Vec<Subscriber> = self
            .subscribers
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

fn apply(contents: &mut TabContents, op: QueuedOp) {
    match op {
        QueuedOp::Discard => {
            contents.muted = true;
            contents.discarded = true;
        }
        QueuedOp::Restore => {
            contents.muted = false;
            contents.discarded = false;
        }
    }
}

fn live_slot_mut(slots: &mut [Slot], tab: TabHandle) -> Option<&mut Slot> {
    let slot = slots.get_mut(tab.id.get() as usize)?;
    (slot.generation == tab.generation && slot.contents.is_some()).then_some(slot)
}

impl TabLifecycle for HeadlessEngine {
    fn tabs(&self) -> Vec<TabHandle> {
        self.slots
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.contents.is_some())
            .map(|(index, slot)| TabHandle::new(TabId::new(index as u64), slot.generation))
            .collect()
    }

    fn is_alive(&self, tab: TabHandle) -> bool {
        self.read(tab, |_| ()).is_some()
    }

    fn estimated_memory_mb(&self, tab: TabHandle) -> Result<u64, LifecycleError> {
        self.read(tab, |contents| contents.memory_mb)
            .ok_or(LifecycleError::NotFound(tab))
    }

    fn mute_and_hide(&self, tab: TabHandle) -> Result<Transition, LifecycleError> {
        self.transition(tab, QueuedOp::Discard)
    }

    fn unmute_and_show(&self, tab: TabHandle) -> Result<Transition, LifecycleError> {
        self.transition(tab, QueuedOp::Restore)
    }

    fn is_audible(&self, tab: TabHandle) -> bool {
        self.read(tab, |contents| contents.audible).unwrap_or(false)
    }

    fn is_being_captured(&self, tab: TabHandle) -> bool {
        self.read(tab, |contents| contents.captured).unwrap_or(false)
    }

    fn has_pending_navigation(&self, tab: TabHandle) -> bool {
        self.read(tab, |contents| contents.pending_navigation)
            .unwrap_or(false)
    }

    fn is_foreground(&self, tab: TabHandle) -> bool {
        self.read(tab, |contents| contents.foreground).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_slot_is_reused_with_new_generation() {
        let engine = HeadlessEngine::new();
        let first = engine.open_tab("https://a.example", 100);
        assert!(engine.close_tab(first));
        let second = engine.open_tab("https://b.example", 100);

        assert_eq!(first.id, second.id);
        assert_ne!(first.generation, second.generation);
        assert!(!engine.is_alive(first));
        assert!(engine.is_alive(second));
        assert_eq!(engine.estimated_memory_mb(first), Err(LifecycleError::NotFound(first)));
        assert!(!engine.close_tab(first));
        assert_eq!(engine.tabs(), vec![second]);
    }

    #[test]
    fn activation_moves_foreground() {
        let engine = HeadlessEngine::new();
        let a = engine.open_tab("https://a.example", 10);
        let b = engine.open_tab("https://b.example", 10);
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        engine.subscribe(move |event| sink.borrow_mut().push(*event));

        engine.activate(a);
        engine.activate(b);

        assert!(!engine.is_foreground(a));
        assert!(engine.is_foreground(b));
        assert_eq!(
            *events.borrow(),
            vec![
                TabEvent::ForegroundChanged { tab: a, visible: true },
                TabEvent::ForegroundChanged { tab: a, visible: false },
                TabEvent::ForegroundChanged { tab: b, visible: true },
            ]
        );
    }

    #[test]
    fn discard_and_restore() {
        let engine = HeadlessEngine::new();
        let tab = engine.open_tab("https://a.example", 10);

        assert_eq!(engine.mute_and_hide(tab), Ok(Transition::Complete));
        assert!(engine.is_discarded(tab));
        assert!(engine.is_muted(tab));

        assert_eq!(engine.unmute_and_show(tab), Ok(Transition::Complete));
        assert!(!engine.is_discarded(tab));
        assert!(!engine.is_muted(tab));
    }

    #[test]
    fn unsupported_discard_is_reported() {
        let engine = HeadlessEngine::new();
        let tab = engine.open_tab("https://a.example", 10);
        engine.set_discard_supported(tab, false);

        assert_eq!(engine.mute_and_hide(tab), Err(LifecycleError::Unsupported(tab)));
        assert!(!engine.is_discarded(tab));
    }

    #[test]
    fn asynchronous_transitions_wait_for_completion() {
        let engine = HeadlessEngine::new();
        engine.set_asynchronous(true);
        let kept = engine.open_tab("https://a.example", 10);
        let closed = engine.open_tab("https://b.example", 10);

        assert_eq!(engine.mute_and_hide(kept), Ok(Transition::Pending));
        assert_eq!(engine.mute_and_hide(closed), Ok(Transition::Pending));
        assert!(!engine.is_discarded(kept));
        engine.close_tab(closed);

        let results = engine.complete_pending();
        assert_eq!(results, vec![(kept, Ok(()))]);
        assert!(engine.is_discarded(kept));
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn navigation_events() {
        let engine = HeadlessEngine::new();
        let tab = engine.open_tab("https://a.example", 10);
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        let id = engine.subscribe(move |event| sink.borrow_mut().push(*event));

        engine.navigate(tab, "https://a.example/form");
        assert!(engine.has_pending_navigation(tab));
        engine.commit_navigation(tab);
        assert!(!engine.has_pending_navigation(tab));
        assert_eq!(engine.url(tab).as_deref(), Some("https://a.example/form"));

        engine.unsubscribe(id);
        engine.close_tab(tab);
        assert_eq!(
            *events.borrow(),
            vec![TabEvent::NavigationStarted(tab), TabEvent::NavigationCommitted(tab)]
        );
    }
}
