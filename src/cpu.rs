/*!
The CPU-side contract.

Concrete 65C02/65816/65832 cores live outside this crate; the machine
only needs the seam they all share: reset through the bus-visible reset
vector, single-instruction stepping that reports cycles and a state, and
enough register access (PC, stack, status) for the trap registry to
fake a firmware routine's return.

`apply_trap_return` is the one piece of shared behavior: how a handled
trap re-joins guest control flow (RTS pops and increments, RTI pops
status then PC verbatim, `None` optionally jumps). Cores inherit the
default; a core with unusual stack width can override it.
*/

use crate::bus::MainBus;
use crate::context::EventContext;
use crate::signals::SignalBus;
use crate::traps::{ReturnMethod, TrapResult};
use crate::types::{Addr, Cycle};

/// The processor families a machine profile can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuKind {
    Cpu65C02,
    Cpu65C816,
    Cpu65832,
}

impl CpuKind {
    /// Parse the profile spelling ("65C02", "65816", "65832").
    pub fn parse(s: &str) -> Option<CpuKind> {
        match s {
            "65C02" => Some(CpuKind::Cpu65C02),
            "65816" | "65C816" => Some(CpuKind::Cpu65C816),
            "65832" => Some(CpuKind::Cpu65832),
            _ => None,
        }
    }
}

/// How an instruction step left the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepState {
    Normal,
    /// WAI executed: stopped until the next interrupt-bearing event.
    WaitingForInterrupt,
    /// STP executed (or an unrecoverable condition): the core is done.
    Halted,
}

/// Result of one instruction step.
#[derive(Clone, Copy, Debug)]
pub struct StepOutcome {
    pub cycles: Cycle,
    pub state: StepState,
}

impl StepOutcome {
    #[inline]
    pub fn normal(cycles: u64) -> StepOutcome {
        StepOutcome {
            cycles: Cycle(cycles),
            state: StepState::Normal,
        }
    }
}

/// Factory injected into the builder; receives the wired bus and signal
/// fabric so the core can capture whatever it needs.
pub type CpuFactory = Box<dyn FnOnce(&mut MainBus, &mut SignalBus) -> Box<dyn Cpu>>;

/// Contract between a 65xx core and the machine.
pub trait Cpu {
    fn kind(&self) -> CpuKind;

    /// Hardware reset: re-read the reset vector through the bus and
    /// reinitialize internal state.
    fn reset(&mut self, bus: &mut MainBus, signals: &mut SignalBus);

    /// Execute one instruction (or interrupt entry). Signal sampling
    /// happens at the boundaries the family specifies; the machine only
    /// sees whole steps.
    fn step(&mut self, ctx: &mut EventContext<'_>) -> StepOutcome;

    fn pc(&self) -> Addr;

    fn set_pc(&mut self, pc: Addr);

    /// Pop one byte from the emulated stack.
    fn pull8(&mut self, bus: &mut MainBus) -> u8;

    /// Push one byte onto the emulated stack.
    fn push8(&mut self, bus: &mut MainBus, value: u8);

    fn status(&self) -> u8;

    fn set_status(&mut self, status: u8);

    /// Rejoin guest control flow after a handled trap.
    fn apply_trap_return(&mut self, bus: &mut MainBus, result: &TrapResult) {
        match result.return_method {
            ReturnMethod::Rts => {
                let lo = self.pull8(bus) as Addr;
                let hi = self.pull8(bus) as Addr;
                self.set_pc(((hi << 8) | lo).wrapping_add(1));
            }
            ReturnMethod::Rti => {
                let status = self.pull8(bus);
                self.set_status(status);
                let lo = self.pull8(bus) as Addr;
                let hi = self.pull8(bus) as Addr;
                self.set_pc((hi << 8) | lo);
            }
            ReturnMethod::None => {
                if let Some(addr) = result.return_address {
                    self.set_pc(addr);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedCpu, ram_bus_16};
    use crate::traps::TrapResult;
    use crate::types::BusAccess;

    #[test]
    fn cpu_kind_parsing() {
        assert_eq!(CpuKind::parse("65C02"), Some(CpuKind::Cpu65C02));
        assert_eq!(CpuKind::parse("65816"), Some(CpuKind::Cpu65C816));
        assert_eq!(CpuKind::parse("65832"), Some(CpuKind::Cpu65832));
        assert_eq!(CpuKind::parse("Z80"), None);
    }

    #[test]
    fn rts_return_pops_and_increments() {
        let mut bus = ram_bus_16();
        let mut cpu = ScriptedCpu::new();
        // Simulate a JSR from $1234: the return address minus one is on
        // the stack, high byte pushed first.
        cpu.push8(&mut bus, 0x12);
        cpu.push8(&mut bus, 0x34);

        cpu.apply_trap_return(&mut bus, &TrapResult::handled_rts(Cycle(8)));
        assert_eq!(cpu.pc(), 0x1235);
    }

    #[test]
    fn rti_return_pops_status_then_pc() {
        let mut bus = ram_bus_16();
        let mut cpu = ScriptedCpu::new();
        // Interrupt frame: PC high, PC low, then status on top.
        cpu.push8(&mut bus, 0x20);
        cpu.push8(&mut bus, 0x00);
        cpu.push8(&mut bus, 0xA5);

        cpu.apply_trap_return(&mut bus, &TrapResult::handled_rti(Cycle(8)));
        assert_eq!(cpu.status(), 0xA5);
        assert_eq!(cpu.pc(), 0x2000);
    }

    #[test]
    fn none_return_jumps_only_when_addressed() {
        let mut bus = ram_bus_16();
        let mut cpu = ScriptedCpu::new();
        cpu.set_pc(0x4000);

        cpu.apply_trap_return(&mut bus, &TrapResult::handled(Cycle(1)));
        assert_eq!(cpu.pc(), 0x4000);

        cpu.apply_trap_return(&mut bus, &TrapResult::handled_jump(Cycle(1), 0x5000));
        assert_eq!(cpu.pc(), 0x5000);
    }

    #[test]
    fn scripted_cpu_stack_is_page_one() {
        let mut bus = ram_bus_16();
        let mut cpu = ScriptedCpu::new();
        cpu.push8(&mut bus, 0x42);
        // The pushed byte lands in the $0100 stack page.
        assert_eq!(bus.read8(&BusAccess::data_read(0x01FF)), 0x42);
        assert_eq!(cpu.pull8(&mut bus), 0x42);
    }
}
