/*!
Event context and the typed component bucket.

Scheduler callbacks, device initialization and the CPU step all receive
an `EventContext`: short-lived mutable views of the scheduler, signal
fabric, main bus and the machine's component bucket, bundled so a device
callback can arm its next timer, raise IRQ and touch memory without
threading four references through every signature.

The component bucket is a type-keyed registry (one value per type) used
for machine-level collaborators that do not fit the device trait, e.g. a
slot-manager handle or a video frame counter. Lookup is by `TypeId` over
type-erased boxes; no reflection, no stringly-typed keys.
*/

use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::bus::MainBus;
use crate::scheduler::Scheduler;
use crate::signals::SignalBus;
use crate::types::Cycle;

/// One value per type, retrieved by that type.
#[derive(Default)]
pub struct ComponentBucket {
    components: HashMap<TypeId, Box<dyn Any>>,
}

impl ComponentBucket {
    pub fn new() -> ComponentBucket {
        ComponentBucket::default()
    }

    /// Insert (or replace) the component of type `T`. Returns the
    /// previous value if one was present.
    pub fn insert<T: 'static>(&mut self, value: T) -> Option<T> {
        self.components
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.components
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.components
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut::<T>())
    }

    pub fn remove<T: 'static>(&mut self) -> Option<T> {
        self.components
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.components.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Mutable views handed to scheduler callbacks, device lifecycle hooks
/// and the CPU step. `now` is the simulated time at which the callback
/// was entered.
pub struct EventContext<'a> {
    pub now: Cycle,
    pub scheduler: &'a mut Scheduler,
    pub signals: &'a mut SignalBus,
    pub bus: &'a mut MainBus,
    pub components: &'a mut ComponentBucket,
}
