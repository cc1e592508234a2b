//! Shared test fixtures.
//!
//! These helpers de-duplicate setup across the bus, trap, machine and
//! profile test modules:
//!
//! - `ScriptedCpu`: a stand-in for the external 65xx cores. It reads
//!   the reset vector through the bus, "executes" by fetching one byte
//!   and advancing PC, keeps its stack in page one, and can be fed a
//!   queue of step states to fake WAI/STP sequences.
//! - `ram_bus_16`: a 16-bit bus fully backed by RWX RAM.
//! - `test_machine`: a built machine over that RAM with the reset
//!   vector planted at $1234.
//!
//! Only compiled for tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::builder::MachineBuilder;
use crate::bus::{MainBus, PageEntry, PageTarget, RamTarget, target_ref};
use crate::context::EventContext;
use crate::cpu::{Cpu, CpuFactory, CpuKind, StepOutcome, StepState};
use crate::machine::Machine;
use crate::signals::SignalBus;
use crate::types::{Addr, BusAccess, Cycle, DeviceId, PagePerms, RegionTag, TargetCaps};

/// Step states the scripted CPU will return, front to back; empty means
/// `Normal`.
pub type StateQueue = Rc<RefCell<VecDeque<StepState>>>;

/// Deterministic CPU stand-in. Two cycles per step (one fetch, one
/// execute), PC advances by one.
pub struct ScriptedCpu {
    pc: Addr,
    sp: u8,
    status: u8,
    step_cycles: u64,
    queued: StateQueue,
    pub fetched: Vec<Addr>,
}

impl Default for ScriptedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCpu {
    pub fn new() -> ScriptedCpu {
        Self::with_queue(Rc::new(RefCell::new(VecDeque::new())))
    }

    pub fn with_queue(queued: StateQueue) -> ScriptedCpu {
        ScriptedCpu {
            pc: 0,
            sp: 0xFF,
            status: 0x20,
            step_cycles: 2,
            queued,
            fetched: Vec::new(),
        }
    }
}

impl Cpu for ScriptedCpu {
    fn kind(&self) -> CpuKind {
        CpuKind::Cpu65C02
    }

    fn reset(&mut self, bus: &mut MainBus, _signals: &mut SignalBus) {
        self.sp = 0xFF;
        self.pc = bus.read16(&BusAccess::data_read(0xFFFC)) as Addr;
    }

    fn step(&mut self, ctx: &mut EventContext<'_>) -> StepOutcome {
        if let Some(state) = self.queued.borrow_mut().pop_front() {
            return StepOutcome {
                cycles: Cycle(self.step_cycles),
                state,
            };
        }
        let access = BusAccess::fetch(self.pc).with_cycle(ctx.now);
        let _opcode = ctx.bus.read8(&access);
        self.fetched.push(self.pc);
        ctx.signals.signal_instruction_fetched(1);
        ctx.signals.signal_instruction_executed(self.step_cycles - 1);
        self.pc = self.pc.wrapping_add(1) & 0xFFFF;
        StepOutcome::normal(self.step_cycles)
    }

    fn pc(&self) -> Addr {
        self.pc
    }

    fn set_pc(&mut self, pc: Addr) {
        self.pc = pc;
    }

    fn pull8(&mut self, bus: &mut MainBus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read8(&BusAccess::data_read(0x0100 + self.sp as Addr))
    }

    fn push8(&mut self, bus: &mut MainBus, value: u8) {
        bus.write8(&BusAccess::data_write(0x0100 + self.sp as Addr), value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn status(&self) -> u8 {
        self.status
    }

    fn set_status(&mut self, status: u8) {
        self.status = status;
    }
}

/// CPU factory producing a fresh `ScriptedCpu`.
pub fn scripted_cpu_factory() -> CpuFactory {
    Box::new(|_bus, _signals| Box::new(ScriptedCpu::new()))
}

/// CPU factory plus a handle for queueing step states from outside the
/// machine (for WAI/STP sequences).
pub fn scripted_cpu_factory_with_queue() -> (CpuFactory, StateQueue) {
    let queue: StateQueue = Rc::new(RefCell::new(VecDeque::new()));
    let cloned = queue.clone();
    (
        Box::new(move |_bus, _signals| Box::new(ScriptedCpu::with_queue(cloned))),
        queue,
    )
}

/// 16-bit bus fully backed by one RWX RAM target.
pub fn ram_bus_16() -> MainBus {
    let mut bus = MainBus::new(16).expect("bus");
    bus.map_region(
        0x0000,
        0x10000,
        PageEntry::new(
            DeviceId::SYSTEM,
            RegionTag::Ram,
            PagePerms::RWX,
            TargetCaps::PEEK | TargetCaps::POKE | TargetCaps::WIDE,
            PageTarget::Leaf(target_ref(RamTarget::new(0x10000))),
            0,
        ),
    )
    .expect("map");
    bus
}

/// A built machine over full RAM with the reset vector at $1234.
pub fn test_machine() -> Machine {
    MachineBuilder::new(16)
        .cpu_factory(scripted_cpu_factory())
        .ram_region("main", 0x0000, 0x10000, PagePerms::RWX, None, 0)
        .memory_config(|bus| {
            bus.write8(&BusAccess::data_write(0xFFFC), 0x34);
            bus.write8(&BusAccess::data_write(0xFFFD), 0x12);
            Ok(())
        })
        .build()
        .expect("test machine")
}
