/*!
Signal fabric: the machine's control lines.

Each line carries the set of device ids currently asserting it; the line
reads asserted while that set is non-empty, so two cards can hold IRQ low
without fighting over a boolean. Assert and deassert are idempotent per
device, and deasserting a line a device never asserted is a no-op.

NMI is level-plus-edge: the transition from no-asserter to first-asserter
latches a one-shot pending edge which the CPU consumes through
`acknowledge_nmi`. Holding the line low does not re-latch.

The per-instruction cycle accounting lives here as well, split into fetch
and execute accumulators, because devices and debugger views want one
place to ask "how much simulated work has the CPU done".

Line identity is a closed enum, so the "unknown line" programming error
of looser designs cannot be expressed.
*/

use std::collections::HashSet;

use crate::types::{Cycle, DeviceId};

/// The control lines of a 65xx-family machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalLine {
    Irq,
    Nmi,
    Reset,
    Rdy,
    DmaReq,
    Sync,
}

impl SignalLine {
    pub const ALL: [SignalLine; 6] = [
        SignalLine::Irq,
        SignalLine::Nmi,
        SignalLine::Reset,
        SignalLine::Rdy,
        SignalLine::DmaReq,
        SignalLine::Sync,
    ];

    #[inline]
    fn index(self) -> usize {
        match self {
            SignalLine::Irq => 0,
            SignalLine::Nmi => 1,
            SignalLine::Reset => 2,
            SignalLine::Rdy => 3,
            SignalLine::DmaReq => 4,
            SignalLine::Sync => 5,
        }
    }
}

/// Result of sampling a line at a CPU sampling point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalState {
    Asserted,
    Clear,
}

/// Reference-counted control-line state plus CPU cycle accounting.
pub struct SignalBus {
    asserters: [HashSet<DeviceId>; 6],
    nmi_edge_pending: bool,
    fetch_cycles: Cycle,
    execute_cycles: Cycle,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> SignalBus {
        SignalBus {
            asserters: std::array::from_fn(|_| HashSet::new()),
            nmi_edge_pending: false,
            fetch_cycles: Cycle::ZERO,
            execute_cycles: Cycle::ZERO,
        }
    }

    /// Add `id` to the asserters of `line`. Idempotent. The NMI edge
    /// latches only on the empty-to-non-empty transition.
    pub fn assert(&mut self, line: SignalLine, id: DeviceId, cycle: Cycle) {
        let set = &mut self.asserters[line.index()];
        let was_empty = set.is_empty();
        if set.insert(id) {
            log::debug!("{line:?} asserted by {id} at cycle {cycle}");
        }
        if line == SignalLine::Nmi && was_empty {
            self.nmi_edge_pending = true;
        }
    }

    /// Remove `id` from the asserters of `line`. A no-op when `id` never
    /// asserted it.
    pub fn deassert(&mut self, line: SignalLine, id: DeviceId, cycle: Cycle) {
        if self.asserters[line.index()].remove(&id) {
            log::debug!("{line:?} deasserted by {id} at cycle {cycle}");
        }
    }

    #[inline]
    pub fn is_asserted(&self, line: SignalLine) -> bool {
        !self.asserters[line.index()].is_empty()
    }

    #[inline]
    pub fn asserter_count(&self, line: SignalLine) -> usize {
        self.asserters[line.index()].len()
    }

    /// Line state as seen from a CPU sampling point. NMI also reads
    /// asserted while an unconsumed edge is pending.
    pub fn sample(&self, line: SignalLine) -> SignalState {
        let asserted = self.is_asserted(line)
            || (line == SignalLine::Nmi && self.nmi_edge_pending);
        if asserted {
            SignalState::Asserted
        } else {
            SignalState::Clear
        }
    }

    #[inline]
    pub fn nmi_edge_pending(&self) -> bool {
        self.nmi_edge_pending
    }

    /// Consume the pending NMI edge. Returns whether one was pending;
    /// a second call without a new rising edge returns `false`.
    pub fn acknowledge_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_edge_pending)
    }

    // -----------------------------
    // Cycle accounting
    // -----------------------------

    pub fn signal_instruction_fetched(&mut self, cycles: u64) {
        self.fetch_cycles += cycles;
    }

    pub fn signal_instruction_executed(&mut self, cycles: u64) {
        self.execute_cycles += cycles;
    }

    #[inline]
    pub fn fetch_cycles(&self) -> Cycle {
        self.fetch_cycles
    }

    #[inline]
    pub fn execute_cycles(&self) -> Cycle {
        self.execute_cycles
    }

    #[inline]
    pub fn total_cpu_cycles(&self) -> Cycle {
        self.fetch_cycles + self.execute_cycles
    }

    /// Clear only the fetch/execute accumulators.
    pub fn reset_cycle_counters(&mut self) {
        self.fetch_cycles = Cycle::ZERO;
        self.execute_cycles = Cycle::ZERO;
    }

    /// Clear assertion sets, the NMI edge and the counters.
    pub fn reset(&mut self) {
        for set in &mut self.asserters {
            set.clear();
        }
        self.nmi_edge_pending = false;
        self.reset_cycle_counters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_A: DeviceId = DeviceId(1);
    const DEV_B: DeviceId = DeviceId(2);

    #[test]
    fn reference_counted_assertion() {
        let mut signals = SignalBus::new();
        assert!(!signals.is_asserted(SignalLine::Irq));

        signals.assert(SignalLine::Irq, DEV_A, Cycle(1));
        signals.assert(SignalLine::Irq, DEV_B, Cycle(2));
        assert!(signals.is_asserted(SignalLine::Irq));
        assert_eq!(signals.asserter_count(SignalLine::Irq), 2);

        // One device releasing does not clear the line.
        signals.deassert(SignalLine::Irq, DEV_A, Cycle(3));
        assert!(signals.is_asserted(SignalLine::Irq));
        signals.deassert(SignalLine::Irq, DEV_B, Cycle(4));
        assert!(!signals.is_asserted(SignalLine::Irq));
    }

    #[test]
    fn assert_and_deassert_are_idempotent() {
        let mut signals = SignalBus::new();
        signals.assert(SignalLine::Rdy, DEV_A, Cycle(1));
        signals.assert(SignalLine::Rdy, DEV_A, Cycle(2));
        assert_eq!(signals.asserter_count(SignalLine::Rdy), 1);

        // Deasserting from a device that never asserted is a no-op.
        signals.deassert(SignalLine::Rdy, DEV_B, Cycle(3));
        assert!(signals.is_asserted(SignalLine::Rdy));
        signals.deassert(SignalLine::Rdy, DEV_A, Cycle(4));
        signals.deassert(SignalLine::Rdy, DEV_A, Cycle(5));
        assert!(!signals.is_asserted(SignalLine::Rdy));
    }

    #[test]
    fn nmi_edge_latches_once() {
        let mut signals = SignalBus::new();
        signals.assert(SignalLine::Nmi, DEV_A, Cycle(1));
        assert!(signals.nmi_edge_pending());

        // Holding the line (even from another device) does not re-latch.
        signals.assert(SignalLine::Nmi, DEV_A, Cycle(2));
        signals.assert(SignalLine::Nmi, DEV_B, Cycle(3));
        assert!(signals.acknowledge_nmi());
        assert!(!signals.acknowledge_nmi());

        // Level is still observable even after the edge is consumed.
        assert_eq!(signals.sample(SignalLine::Nmi), SignalState::Asserted);

        // Full release then re-assert produces a fresh edge.
        signals.deassert(SignalLine::Nmi, DEV_A, Cycle(4));
        signals.deassert(SignalLine::Nmi, DEV_B, Cycle(5));
        assert_eq!(signals.sample(SignalLine::Nmi), SignalState::Clear);
        signals.assert(SignalLine::Nmi, DEV_A, Cycle(6));
        assert!(signals.acknowledge_nmi());
    }

    #[test]
    fn sample_reports_pending_edge_after_release() {
        let mut signals = SignalBus::new();
        signals.assert(SignalLine::Nmi, DEV_A, Cycle(1));
        signals.deassert(SignalLine::Nmi, DEV_A, Cycle(2));
        // Line released but the edge has not been consumed yet.
        assert_eq!(signals.sample(SignalLine::Nmi), SignalState::Asserted);
        assert!(signals.acknowledge_nmi());
        assert_eq!(signals.sample(SignalLine::Nmi), SignalState::Clear);
    }

    #[test]
    fn cycle_accounting() {
        let mut signals = SignalBus::new();
        signals.signal_instruction_fetched(2);
        signals.signal_instruction_executed(3);
        signals.signal_instruction_fetched(1);
        assert_eq!(signals.fetch_cycles(), Cycle(3));
        assert_eq!(signals.execute_cycles(), Cycle(3));
        assert_eq!(signals.total_cpu_cycles(), Cycle(6));

        signals.reset_cycle_counters();
        assert_eq!(signals.total_cpu_cycles(), Cycle::ZERO);
    }

    #[test]
    fn reset_clears_everything() {
        let mut signals = SignalBus::new();
        signals.assert(SignalLine::Irq, DEV_A, Cycle(1));
        signals.assert(SignalLine::Nmi, DEV_A, Cycle(1));
        signals.signal_instruction_executed(10);
        signals.reset();
        assert!(!signals.is_asserted(SignalLine::Irq));
        assert!(!signals.nmi_edge_pending());
        assert_eq!(signals.total_cpu_cycles(), Cycle::ZERO);
    }
}
