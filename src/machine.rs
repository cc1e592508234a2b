/*!
The assembled machine.

A `Machine` owns the CPU, main bus, scheduler, signal fabric, trap
registry, device registry, slot manager and the component bucket, and
drives the canonical loop: consult the trap fast-path at the program
counter, step the CPU, advance the scheduler by the cycles the step
consumed, dispatch whatever came due. `WaitingForInterrupt` fast-forwards
the clock to the next pending event instead of burning idle steps.

Lifecycle: `reset` asserts the Reset line, resets the CPU (which
re-reads the reset vector through the bus) and the scheduler, then
releases Reset and leaves the machine `Stopped`. `run` executes until a
stop request, a halt or a breakpoint; `step` executes one instruction
and leaves the machine `Paused`.

State transitions and breakpoint hits are reported through observer
callbacks; observers must not mutate the machine.
*/

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::bus::{IoPage, MainBus};
use crate::context::{ComponentBucket, EventContext};
use crate::cpu::{Cpu, StepState};
use crate::device::{Device, DeviceRegistry, SlotManagerRef};
use crate::scheduler::Scheduler;
use crate::signals::{SignalBus, SignalLine};
use crate::traps::{TrapOperation, TrapRegistry};
use crate::types::{Addr, DeviceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    Stopped,
    Running,
    Paused,
}

pub type StateObserver = Box<dyn FnMut(MachineState)>;
pub type BreakpointObserver = Box<dyn FnMut(Addr)>;

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

pub struct Machine {
    pub(crate) state: MachineState,
    pub(crate) cpu: Box<dyn Cpu>,
    pub(crate) bus: MainBus,
    pub(crate) scheduler: Scheduler,
    pub(crate) signals: SignalBus,
    pub(crate) components: ComponentBucket,
    pub(crate) devices: DeviceRegistry,
    pub(crate) traps: TrapRegistry,
    pub(crate) slots: SlotManagerRef,
    pub(crate) io_page: Option<Rc<RefCell<IoPage>>>,
    pub(crate) device_instances: Vec<Box<dyn Device>>,
    stop_requested: bool,
    breakpoints: HashSet<Addr>,
    state_observers: Vec<StateObserver>,
    breakpoint_observers: Vec<BreakpointObserver>,
}

impl Machine {
    pub(crate) fn assemble(
        cpu: Box<dyn Cpu>,
        bus: MainBus,
        scheduler: Scheduler,
        signals: SignalBus,
        components: ComponentBucket,
        devices: DeviceRegistry,
        traps: TrapRegistry,
        slots: SlotManagerRef,
        io_page: Option<Rc<RefCell<IoPage>>>,
    ) -> Machine {
        Machine {
            state: MachineState::Stopped,
            cpu,
            bus,
            scheduler,
            signals,
            components,
            devices,
            traps,
            slots,
            io_page,
            device_instances: Vec::new(),
            stop_requested: false,
            breakpoints: HashSet::new(),
            state_observers: Vec::new(),
            breakpoint_observers: Vec::new(),
        }
    }

    // -----------------------------
    // Component access
    // -----------------------------

    #[inline]
    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn bus(&self) -> &MainBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut MainBus {
        &mut self.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    pub fn signals_mut(&mut self) -> &mut SignalBus {
        &mut self.signals
    }

    pub fn cpu(&self) -> &dyn Cpu {
        &*self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut dyn Cpu {
        &mut *self.cpu
    }

    pub fn traps(&self) -> &TrapRegistry {
        &self.traps
    }

    pub fn traps_mut(&mut self) -> &mut TrapRegistry {
        &mut self.traps
    }

    pub fn components(&self) -> &ComponentBucket {
        &self.components
    }

    pub fn components_mut(&mut self) -> &mut ComponentBucket {
        &mut self.components
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn slots(&self) -> &SlotManagerRef {
        &self.slots
    }

    pub fn io_page(&self) -> Option<&Rc<RefCell<IoPage>>> {
        self.io_page.as_ref()
    }

    // -----------------------------
    // Observers and breakpoints
    // -----------------------------

    /// Observers must not mutate the machine.
    pub fn on_state_changed(&mut self, observer: impl FnMut(MachineState) + 'static) {
        self.state_observers.push(Box::new(observer));
    }

    /// Observers must not mutate the machine.
    pub fn on_breakpoint(&mut self, observer: impl FnMut(Addr) + 'static) {
        self.breakpoint_observers.push(Box::new(observer));
    }

    pub fn add_breakpoint(&mut self, addr: Addr) {
        self.breakpoints.insert(addr);
    }

    pub fn remove_breakpoint(&mut self, addr: Addr) -> bool {
        self.breakpoints.remove(&addr)
    }

    fn set_state(&mut self, state: MachineState) {
        if self.state == state {
            return;
        }
        log::debug!("machine state: {:?} -> {:?}", self.state, state);
        self.state = state;
        for observer in self.state_observers.iter_mut() {
            observer(state);
        }
    }

    // -----------------------------
    // Lifecycle
    // -----------------------------

    /// Hardware reset. Asserts Reset, resets CPU and scheduler,
    /// releases Reset, leaves the machine `Stopped`.
    pub fn reset(&mut self) {
        let now = self.scheduler.now();
        self.signals.assert(SignalLine::Reset, DeviceId::SYSTEM, now);
        self.cpu.reset(&mut self.bus, &mut self.signals);
        self.scheduler.reset();
        self.signals
            .deassert(SignalLine::Reset, DeviceId::SYSTEM, self.scheduler.now());
        self.set_state(MachineState::Stopped);
    }

    /// Request a graceful halt at the next instruction boundary.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Execute one instruction (or handled trap) and advance time.
    fn execute_one(&mut self) -> StepState {
        let pc = self.cpu.pc();

        // Trap fast path: consulted before the fetch ever reaches the
        // bus, so a handled trap short-circuits permission checks too.
        if self.traps.contains_address(pc) {
            let now = self.scheduler.now();
            let result =
                self.traps
                    .try_execute(pc, TrapOperation::Call, &mut *self.cpu, &mut self.bus, now);
            if result.handled {
                self.cpu.apply_trap_return(&mut self.bus, &result);
                self.signals
                    .signal_instruction_executed(result.cycles_consumed.as_u64());
                self.scheduler.advance(
                    result.cycles_consumed.as_u64(),
                    &mut self.bus,
                    &mut self.signals,
                    &mut self.components,
                );
                return StepState::Normal;
            }
        }

        let outcome = {
            let Machine {
                cpu,
                bus,
                scheduler,
                signals,
                components,
                ..
            } = self;
            let mut ctx = EventContext {
                now: scheduler.now(),
                scheduler,
                signals,
                bus,
                components,
            };
            cpu.step(&mut ctx)
        };

        match outcome.state {
            StepState::Normal => {
                self.scheduler.advance(
                    outcome.cycles.as_u64(),
                    &mut self.bus,
                    &mut self.signals,
                    &mut self.components,
                );
            }
            StepState::WaitingForInterrupt => {
                // WAI fast-forward: warp to the next event instead of
                // spinning. With nothing scheduled, charge the step so
                // time still moves.
                let dispatched = self.scheduler.jump_to_next_event_and_dispatch(
                    &mut self.bus,
                    &mut self.signals,
                    &mut self.components,
                );
                if !dispatched {
                    self.scheduler.advance(
                        outcome.cycles.as_u64().max(1),
                        &mut self.bus,
                        &mut self.signals,
                        &mut self.components,
                    );
                }
            }
            StepState::Halted => {}
        }
        outcome.state
    }

    /// Run until a stop request, a halt or a breakpoint.
    pub fn run(&mut self) {
        self.stop_requested = false;
        self.set_state(MachineState::Running);
        loop {
            if self.stop_requested {
                break;
            }
            let pc = self.cpu.pc();
            if self.breakpoints.contains(&pc) {
                log::debug!("breakpoint hit at {pc:#06x}");
                for observer in self.breakpoint_observers.iter_mut() {
                    observer(pc);
                }
                break;
            }
            if self.execute_one() == StepState::Halted {
                break;
            }
        }
        self.set_state(MachineState::Stopped);
    }

    /// Run at most `max_instructions`; returns how many executed.
    /// Stops early on the same conditions as `run`.
    pub fn run_for(&mut self, max_instructions: u64) -> u64 {
        self.stop_requested = false;
        self.set_state(MachineState::Running);
        let mut executed = 0;
        while executed < max_instructions {
            if self.stop_requested {
                break;
            }
            let pc = self.cpu.pc();
            if self.breakpoints.contains(&pc) {
                for observer in self.breakpoint_observers.iter_mut() {
                    observer(pc);
                }
                break;
            }
            if self.execute_one() == StepState::Halted {
                executed += 1;
                break;
            }
            executed += 1;
        }
        self.set_state(MachineState::Stopped);
        executed
    }

    /// Execute a single instruction and leave the machine `Paused`.
    pub fn step(&mut self) {
        self.execute_one();
        self.set_state(MachineState::Paused);
    }
}
