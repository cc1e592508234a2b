/*!
The scheduler: simulated time and the ordered event queue.

A monotonic cycle clock plus a min-heap of pending events, ordered by
`(due_cycle, priority, insertion_order)`; lower is earlier on every
component. The machine loop drives it: after each CPU step it calls
`advance(cycles, ...)`, which moves `now` forward and dispatches every
event that has come due, in heap order.

Callbacks receive an `EventContext` and may schedule further events;
anything they schedule at or before the current cycle is dispatched in
the same sweep. `jump_to_next_event_and_dispatch` is the WAI fast-path:
warp `now` to the soonest pending event and dispatch it (the clock never
moves backward; an event already due dispatches without advancing).

Scheduling with `due < now` is accepted; the event fires on the next
dispatch and the late-schedule observers are told about it.

Observers (`on_event_scheduled` / `consumed` / `cancelled` / `late`) are
synchronous diagnostics hooks. They must not call back into the
scheduler; reentry from an observer is undefined in order, and the
single-writer contract of the core makes no attempt to detect it.
*/

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::bus::MainBus;
use crate::context::{ComponentBucket, EventContext};
use crate::signals::SignalBus;
use crate::types::Cycle;

/// Unique, opaque handle for a scheduled event. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHandle(u64);

/// Informational classification of a scheduled event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduledEventKind {
    DeviceTimer,
    InterruptLineChange,
    DmaPhase,
    AudioTick,
    VideoScanline,
    DeferredWork,
    Custom,
}

/// Callback invoked when an event comes due.
pub type EventCallback = Box<dyn FnOnce(&mut EventContext<'_>)>;

/// Observer callback; receives a snapshot of the event's metadata.
pub type EventObserver = Box<dyn FnMut(&ScheduledEventInfo)>;

/// Metadata snapshot handed to observers.
#[derive(Clone, Debug)]
pub struct ScheduledEventInfo {
    pub handle: EventHandle,
    pub due: Cycle,
    pub kind: ScheduledEventKind,
    pub priority: i32,
    pub tag: Option<String>,
}

struct PendingEvent {
    due: Cycle,
    kind: ScheduledEventKind,
    priority: i32,
    tag: Option<String>,
    callback: EventCallback,
}

impl PendingEvent {
    fn info(&self, handle: EventHandle) -> ScheduledEventInfo {
        ScheduledEventInfo {
            handle,
            due: self.due,
            kind: self.kind,
            priority: self.priority,
            tag: self.tag.clone(),
        }
    }
}

/// Heap key: `(due, priority, seq)` with the natural ordering; wrapped
/// in `Reverse` so the binary heap pops the earliest.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    due: Cycle,
    priority: i32,
    seq: u64,
    handle: EventHandle,
}

#[derive(Default)]
struct Observers {
    scheduled: Vec<EventObserver>,
    consumed: Vec<EventObserver>,
    cancelled: Vec<EventObserver>,
    late: Vec<EventObserver>,
}

/// Monotonic cycle clock plus the pending-event queue.
#[derive(Default)]
pub struct Scheduler {
    now: Cycle,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    pending: HashMap<EventHandle, PendingEvent>,
    next_handle: u64,
    observers: Observers,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    #[inline]
    pub fn now(&self) -> Cycle {
        self.now
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Schedule `callback` to run at absolute cycle `due`.
    pub fn schedule_at(
        &mut self,
        due: Cycle,
        kind: ScheduledEventKind,
        priority: i32,
        callback: EventCallback,
        tag: Option<String>,
    ) -> EventHandle {
        let handle = EventHandle(self.next_handle);
        self.next_handle += 1;
        let event = PendingEvent {
            due,
            kind,
            priority,
            tag,
            callback,
        };
        let info = event.info(handle);
        self.heap.push(Reverse(HeapEntry {
            due,
            priority,
            // Handles are issued in insertion order, so the handle value
            // doubles as the ordering tiebreaker.
            seq: handle.0,
            handle,
        }));
        self.pending.insert(handle, event);
        Self::notify(&mut self.observers.scheduled, &info);
        if due < self.now {
            log::warn!(
                "late schedule: {:?} due at {} but clock is at {}",
                info.kind,
                due,
                self.now
            );
            Self::notify(&mut self.observers.late, &info);
        }
        handle
    }

    /// Schedule `callback` to run `delta` cycles from now.
    pub fn schedule_after(
        &mut self,
        delta: u64,
        kind: ScheduledEventKind,
        priority: i32,
        callback: EventCallback,
        tag: Option<String>,
    ) -> EventHandle {
        self.schedule_at(self.now + delta, kind, priority, callback, tag)
    }

    /// Remove a pending event. Returns `false` for unknown (or already
    /// dispatched) handles. In-flight events cannot be cancelled.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        match self.pending.remove(&handle) {
            Some(event) => {
                let info = event.info(handle);
                Self::notify(&mut self.observers.cancelled, &info);
                true
            }
            None => false,
        }
    }

    /// Soonest pending due cycle, if any.
    pub fn peek_next_due(&mut self) -> Option<Cycle> {
        self.drop_stale();
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }

    /// Advance the clock by `delta`, then dispatch everything due.
    pub fn advance(
        &mut self,
        delta: u64,
        bus: &mut MainBus,
        signals: &mut SignalBus,
        components: &mut ComponentBucket,
    ) {
        self.now += delta;
        self.dispatch_due(bus, signals, components);
    }

    /// Warp the clock to the soonest pending event and dispatch it (and
    /// anything else that lands due). Returns whether anything ran.
    /// The clock never moves backward: an event already due-or-past
    /// dispatches at the current cycle.
    pub fn jump_to_next_event_and_dispatch(
        &mut self,
        bus: &mut MainBus,
        signals: &mut SignalBus,
        components: &mut ComponentBucket,
    ) -> bool {
        let Some(due) = self.peek_next_due() else {
            return false;
        };
        if due > self.now {
            self.now = due;
        }
        self.dispatch_due(bus, signals, components);
        true
    }

    /// Pop and invoke every event with `due <= now`, in heap order.
    /// Events scheduled during dispatch at or before `now` join the
    /// same sweep.
    pub fn dispatch_due(
        &mut self,
        bus: &mut MainBus,
        signals: &mut SignalBus,
        components: &mut ComponentBucket,
    ) {
        loop {
            self.drop_stale();
            let due_now = matches!(
                self.heap.peek(),
                Some(Reverse(entry)) if entry.due <= self.now
            );
            if !due_now {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry");
            let Some(event) = self.pending.remove(&entry.handle) else {
                continue;
            };
            let info = event.info(entry.handle);
            Self::notify(&mut self.observers.consumed, &info);
            let callback = event.callback;
            let mut ctx = EventContext {
                now: self.now,
                scheduler: self,
                signals,
                bus,
                components,
            };
            callback(&mut ctx);
        }
    }

    /// Set the clock to zero and cancel all pending events.
    pub fn reset(&mut self) {
        self.now = Cycle::ZERO;
        self.heap.clear();
        let handles: Vec<EventHandle> = self.pending.keys().copied().collect();
        for handle in handles {
            if let Some(event) = self.pending.remove(&handle) {
                let info = event.info(handle);
                Self::notify(&mut self.observers.cancelled, &info);
            }
        }
    }

    // -----------------------------
    // Observers
    // -----------------------------

    /// Observers must not call back into the scheduler.
    pub fn on_event_scheduled(&mut self, observer: impl FnMut(&ScheduledEventInfo) + 'static) {
        self.observers.scheduled.push(Box::new(observer));
    }

    /// Observers must not call back into the scheduler.
    pub fn on_event_consumed(&mut self, observer: impl FnMut(&ScheduledEventInfo) + 'static) {
        self.observers.consumed.push(Box::new(observer));
    }

    /// Observers must not call back into the scheduler.
    pub fn on_event_cancelled(&mut self, observer: impl FnMut(&ScheduledEventInfo) + 'static) {
        self.observers.cancelled.push(Box::new(observer));
    }

    /// Notified when an event is scheduled with `due < now`.
    pub fn on_late_schedule(&mut self, observer: impl FnMut(&ScheduledEventInfo) + 'static) {
        self.observers.late.push(Box::new(observer));
    }

    fn notify(observers: &mut [EventObserver], info: &ScheduledEventInfo) {
        for observer in observers.iter_mut() {
            observer(info);
        }
    }

    /// Discard heap entries whose event has been cancelled.
    fn drop_stale(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.pending.contains_key(&entry.handle) {
                break;
            }
            self.heap.pop();
        }
    }
}
