/*!
Trap registry: native interception of guest code.

A trap replaces a well-known firmware entry point (HOME, COUT, RWTS...)
with a host-side handler. The registry maps `(address, operation,
memory context)` to a handler; the memory context disambiguates
overlapping banks, so a monitor-ROM trap at $F800 and a language-card
trap at the same address coexist and the active bank decides which one
fires.

The CPU fetch loop stays fast through `contains_address`: a refcounted
address index answers "is anything registered here, in any context,
enabled or not" in O(1) before the full key is ever built.

Handlers receive the CPU and bus (enough to fake the routine's effect)
and return a `TrapResult`: whether they handled the call, the cycles the
real routine would have burned, and how to rejoin guest control flow.
*/

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::bus::MainBus;
use crate::cpu::Cpu;
use crate::device::SlotManagerRef;
use crate::types::{Addr, Cycle};

/// Which kind of guest access a trap intercepts. `Call` fires on
/// instruction fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrapOperation {
    Read,
    Write,
    Call,
}

/// Coarse grouping used for bulk enable/disable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrapCategory {
    Firmware,
    Monitor,
    BasicInterp,
    BasicRuntime,
    Dos,
    PrinterDriver,
    DiskDriver,
    Custom,
}

/// Which logical bank is live at an address. Opaque to the registry;
/// the resolver decides which one applies at lookup time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryContext(Cow<'static, str>);

impl MemoryContext {
    pub const ROM: MemoryContext = MemoryContext(Cow::Borrowed("ROM"));
    pub const LANGUAGE_CARD_RAM: MemoryContext = MemoryContext(Cow::Borrowed("LC_RAM"));
    pub const AUX_RAM: MemoryContext = MemoryContext(Cow::Borrowed("AUX_RAM"));

    pub fn new(name: impl Into<String>) -> MemoryContext {
        MemoryContext(Cow::Owned(name.into()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Registry key: one handler at most per triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrapKey {
    pub addr: Addr,
    pub operation: TrapOperation,
    pub context: MemoryContext,
}

/// How a handled trap rejoins guest control flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnMethod {
    Rts,
    Rti,
    None,
}

/// Handler outcome.
#[derive(Clone, Copy, Debug)]
pub struct TrapResult {
    pub handled: bool,
    pub cycles_consumed: Cycle,
    pub return_method: ReturnMethod,
    pub return_address: Option<Addr>,
}

impl TrapResult {
    pub fn not_handled() -> TrapResult {
        TrapResult {
            handled: false,
            cycles_consumed: Cycle::ZERO,
            return_method: ReturnMethod::None,
            return_address: None,
        }
    }

    /// Handled; the handler did its own flow control (or none needed).
    pub fn handled(cycles: Cycle) -> TrapResult {
        TrapResult {
            handled: true,
            cycles_consumed: cycles,
            return_method: ReturnMethod::None,
            return_address: None,
        }
    }

    /// Handled; return to the caller the way RTS would.
    pub fn handled_rts(cycles: Cycle) -> TrapResult {
        TrapResult {
            return_method: ReturnMethod::Rts,
            ..TrapResult::handled(cycles)
        }
    }

    /// Handled; return the way RTI would.
    pub fn handled_rti(cycles: Cycle) -> TrapResult {
        TrapResult {
            return_method: ReturnMethod::Rti,
            ..TrapResult::handled(cycles)
        }
    }

    /// Handled; continue at `target`.
    pub fn handled_jump(cycles: Cycle, target: Addr) -> TrapResult {
        TrapResult {
            return_address: Some(target),
            ..TrapResult::handled(cycles)
        }
    }
}

/// What the handler gets to work with.
pub struct TrapInvocation<'a> {
    pub addr: Addr,
    pub operation: TrapOperation,
    pub cpu: &'a mut dyn Cpu,
    pub bus: &'a mut MainBus,
}

/// Handler: fake the intercepted routine, report how it went.
pub type TrapHandler = Box<dyn FnMut(&mut TrapInvocation<'_>) -> TrapResult>;

/// Observer of handled trap invocations.
pub type TrapObserver = Box<dyn FnMut(&TrapInfo, &TrapResult, Cycle)>;

/// Descriptive record for a registered trap.
#[derive(Clone, Debug)]
pub struct TrapInfo {
    pub key: TrapKey,
    pub name: String,
    pub category: TrapCategory,
    pub description: String,
    pub slot: Option<u8>,
    pub requires_expansion_rom: bool,
    pub enabled: bool,
}

#[derive(Debug, Error)]
pub enum TrapError {
    #[error("trap already registered for {0:?}")]
    Duplicate(TrapKey),
    #[error("no trap registered for {0:?}")]
    Unknown(TrapKey),
}

struct TrapEntry {
    info: TrapInfo,
    handler: TrapHandler,
}

/// Memory-context resolver: which bank is live at `addr` right now.
pub type ContextResolver = Box<dyn Fn(Addr) -> MemoryContext>;

/// The registry itself.
#[derive(Default)]
pub struct TrapRegistry {
    traps: HashMap<TrapKey, TrapEntry>,
    addr_refs: HashMap<Addr, u32>,
    disabled_categories: HashSet<TrapCategory>,
    lc_ram_read_enabled: bool,
    resolver: Option<ContextResolver>,
    slots: Option<SlotManagerRef>,
    observers: Vec<TrapObserver>,
}

impl TrapRegistry {
    pub fn new() -> TrapRegistry {
        TrapRegistry::default()
    }

    /// Wire in the slot manager consulted by slot-dependent traps.
    pub fn set_slot_manager(&mut self, slots: SlotManagerRef) {
        self.slots = Some(slots);
    }

    /// Replace the default memory-context resolver.
    pub fn set_context_resolver(&mut self, resolver: ContextResolver) {
        self.resolver = Some(resolver);
    }

    /// Feed the default resolver: whether language-card RAM reads are
    /// currently switched in.
    pub fn set_language_card_read_enabled(&mut self, enabled: bool) {
        self.lc_ram_read_enabled = enabled;
    }

    #[inline]
    pub fn language_card_read_enabled(&self) -> bool {
        self.lc_ram_read_enabled
    }

    /// The context live at `addr`: the custom resolver if configured,
    /// else language-card RAM for `addr >= $D000` while LC reads are
    /// enabled, else ROM.
    pub fn resolve_context(&self, addr: Addr) -> MemoryContext {
        if let Some(resolver) = &self.resolver {
            return resolver(addr);
        }
        if addr >= 0xD000 && self.lc_ram_read_enabled {
            MemoryContext::LANGUAGE_CARD_RAM
        } else {
            MemoryContext::ROM
        }
    }

    // -----------------------------
    // Registration
    // -----------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        addr: Addr,
        operation: TrapOperation,
        context: MemoryContext,
        name: impl Into<String>,
        category: TrapCategory,
        handler: TrapHandler,
        description: impl Into<String>,
    ) -> Result<(), TrapError> {
        self.register_entry(
            TrapInfo {
                key: TrapKey {
                    addr,
                    operation,
                    context,
                },
                name: name.into(),
                category,
                description: description.into(),
                slot: None,
                requires_expansion_rom: false,
                enabled: true,
            },
            handler,
        )
    }

    /// Default-context `Call` trap.
    pub fn register_call(
        &mut self,
        addr: Addr,
        name: impl Into<String>,
        category: TrapCategory,
        handler: TrapHandler,
        description: impl Into<String>,
    ) -> Result<(), TrapError> {
        self.register(
            addr,
            TrapOperation::Call,
            MemoryContext::ROM,
            name,
            category,
            handler,
            description,
        )
    }

    /// Slot-dependent `Call` trap. Inside the $C800-$CFFF window the
    /// trap additionally requires the slot's expansion ROM to be the
    /// selected one.
    #[allow(clippy::too_many_arguments)]
    pub fn register_slot_trap(
        &mut self,
        addr: Addr,
        slot: u8,
        name: impl Into<String>,
        category: TrapCategory,
        handler: TrapHandler,
        description: impl Into<String>,
    ) -> Result<(), TrapError> {
        self.register_entry(
            TrapInfo {
                key: TrapKey {
                    addr,
                    operation: TrapOperation::Call,
                    context: MemoryContext::ROM,
                },
                name: name.into(),
                category,
                description: description.into(),
                slot: Some(slot),
                requires_expansion_rom: (0xC800..=0xCFFF).contains(&addr),
                enabled: true,
            },
            handler,
        )
    }

    /// `Call` trap bound to the language-card RAM context.
    pub fn register_language_card_trap(
        &mut self,
        addr: Addr,
        name: impl Into<String>,
        category: TrapCategory,
        handler: TrapHandler,
        description: impl Into<String>,
    ) -> Result<(), TrapError> {
        self.register(
            addr,
            TrapOperation::Call,
            MemoryContext::LANGUAGE_CARD_RAM,
            name,
            category,
            handler,
            description,
        )
    }

    fn register_entry(&mut self, info: TrapInfo, handler: TrapHandler) -> Result<(), TrapError> {
        let key = info.key.clone();
        if self.traps.contains_key(&key) {
            return Err(TrapError::Duplicate(key));
        }
        log::debug!(
            "trap '{}' registered at {:#06x} ({:?}, {})",
            info.name,
            key.addr,
            key.operation,
            key.context.as_str()
        );
        *self.addr_refs.entry(key.addr).or_insert(0) += 1;
        self.traps.insert(key, TrapEntry { info, handler });
        Ok(())
    }

    pub fn unregister(
        &mut self,
        addr: Addr,
        operation: TrapOperation,
        context: MemoryContext,
    ) -> Result<TrapInfo, TrapError> {
        let key = TrapKey {
            addr,
            operation,
            context,
        };
        let entry = self
            .traps
            .remove(&key)
            .ok_or_else(|| TrapError::Unknown(key.clone()))?;
        self.release_addr(key.addr);
        Ok(entry.info)
    }

    fn release_addr(&mut self, addr: Addr) {
        if let Some(count) = self.addr_refs.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                self.addr_refs.remove(&addr);
            }
        }
    }

    // -----------------------------
    // Queries
    // -----------------------------

    /// Fetch-loop fast path: anything registered at `addr`, in any
    /// context, enabled or not.
    #[inline]
    pub fn contains_address(&self, addr: Addr) -> bool {
        self.addr_refs.contains_key(&addr)
    }

    pub fn info(
        &self,
        addr: Addr,
        operation: TrapOperation,
        context: &MemoryContext,
    ) -> Option<&TrapInfo> {
        let key = TrapKey {
            addr,
            operation,
            context: context.clone(),
        };
        self.traps.get(&key).map(|entry| &entry.info)
    }

    pub fn len(&self) -> usize {
        self.traps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traps.is_empty()
    }

    // -----------------------------
    // Toggling and bulk operations
    // -----------------------------

    /// Enable or disable one trap. Errors on an unknown key.
    pub fn set_enabled(
        &mut self,
        addr: Addr,
        operation: TrapOperation,
        context: MemoryContext,
        enabled: bool,
    ) -> Result<(), TrapError> {
        let key = TrapKey {
            addr,
            operation,
            context,
        };
        match self.traps.get_mut(&key) {
            Some(entry) => {
                entry.info.enabled = enabled;
                Ok(())
            }
            None => Err(TrapError::Unknown(key)),
        }
    }

    /// Mask or unmask a whole category. Returns how many registered
    /// traps carry that category. Per-trap enabled flags are untouched.
    pub fn set_category_enabled(&mut self, category: TrapCategory, enabled: bool) -> usize {
        if enabled {
            self.disabled_categories.remove(&category);
        } else {
            self.disabled_categories.insert(category);
        }
        self.traps
            .values()
            .filter(|entry| entry.info.category == category)
            .count()
    }

    /// Remove every trap bound to `slot`. Returns the count removed.
    pub fn unregister_slot(&mut self, slot: u8) -> usize {
        self.remove_matching(|info| info.slot == Some(slot))
    }

    /// Remove every trap registered under `context`. Returns the count
    /// removed.
    pub fn unregister_context(&mut self, context: &MemoryContext) -> usize {
        self.remove_matching(|info| &info.key.context == context)
    }

    fn remove_matching(&mut self, keep_out: impl Fn(&TrapInfo) -> bool) -> usize {
        let doomed: Vec<TrapKey> = self
            .traps
            .values()
            .filter(|entry| keep_out(&entry.info))
            .map(|entry| entry.info.key.clone())
            .collect();
        for key in &doomed {
            self.traps.remove(key);
            self.release_addr(key.addr);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.traps.clear();
        self.addr_refs.clear();
    }

    // -----------------------------
    // Execution
    // -----------------------------

    /// Look up and run the trap for `(addr, operation)` under the
    /// currently live memory context. `NotHandled` comes back as a
    /// result with `handled == false`.
    pub fn try_execute(
        &mut self,
        addr: Addr,
        operation: TrapOperation,
        cpu: &mut dyn Cpu,
        bus: &mut MainBus,
        now: Cycle,
    ) -> TrapResult {
        let context = self.resolve_context(addr);
        let key = TrapKey {
            addr,
            operation,
            context,
        };
        let Some(entry) = self.traps.get_mut(&key) else {
            return TrapResult::not_handled();
        };
        if !entry.info.enabled || self.disabled_categories.contains(&entry.info.category) {
            return TrapResult::not_handled();
        }
        if let Some(slot) = entry.info.slot {
            let Some(slots) = &self.slots else {
                return TrapResult::not_handled();
            };
            let slots = slots.borrow();
            if !slots.has_card(slot) {
                return TrapResult::not_handled();
            }
            if entry.info.requires_expansion_rom && slots.active_expansion_slot() != Some(slot) {
                return TrapResult::not_handled();
            }
        }

        let mut invocation = TrapInvocation {
            addr,
            operation,
            cpu,
            bus,
        };
        let result = (entry.handler)(&mut invocation);
        let info = entry.info.clone();
        for observer in self.observers.iter_mut() {
            observer(&info, &result, now);
        }
        result
    }

    /// Observe handled (and unhandled) invocations. Observers must not
    /// mutate the registry.
    pub fn on_trap_invoked(&mut self, observer: impl FnMut(&TrapInfo, &TrapResult, Cycle) + 'static) {
        self.observers.push(Box::new(observer));
    }
}
