#![doc = r#"
Applecore: the memory-bus fabric of a 65xx-family machine emulator.

This crate is the substrate the rest of an Apple II-class emulator is
assembled on: the paged address-translation bus, bank-switching layers
and swap groups, the trap (ROM-interception) registry, the signal fabric
(IRQ/NMI/Reset/RDY/DMA), and the cycle scheduler that drives simulated
time. CPU cores and concrete peripherals live outside; they plug into
the `Cpu`, `Device` and `BusTarget` contracts defined here.

Modules:
- types: shared value types (addresses, cycles, permissions, accesses)
- bus: page table, targets, composite I/O page, layers, swap groups
- signals: reference-counted control lines and NMI edge latching
- scheduler: monotonic cycle clock plus the ordered event queue
- context: the `EventContext` bundle and the typed component bucket
- cpu: the contract 65C02/65816/65832 cores implement
- device: device lifecycle, identity registry, slots and slot cards
- traps: address/operation/context-keyed native interception
- machine: the assembled machine and its run loop
- builder: staged configuration and the fixed-order `build()`
- profile: the JSON machine-profile boundary

In tests, shared fixtures (a scripted CPU, prebuilt buses and machines)
are available under `crate::test_utils`.
"#]

pub mod builder;
pub mod bus;
pub mod context;
pub mod cpu;
pub mod device;
pub mod machine;
pub mod profile;
pub mod scheduler;
pub mod signals;
pub mod traps;
pub mod types;

// Re-export the types most hosts touch at the crate root.
pub use builder::{BuildError, MachineBuilder};
pub use bus::{BusResult, MainBus};
pub use machine::{Machine, MachineState};
pub use profile::MachineProfile;
pub use scheduler::Scheduler;
pub use signals::{SignalBus, SignalLine};
pub use traps::TrapRegistry;
pub use types::{Addr, BusAccess, Cycle, DeviceId};

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
