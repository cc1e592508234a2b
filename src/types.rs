/*!
Core value types shared by every subsystem.

These are the typed primitives the bus fabric, scheduler, signal fabric and
trap registry trade in:

- `Addr`: a virtual or physical address, wide enough for any configured
  address space (12 to 32 bits).
- `Cycle`: monotonic simulated time. A newtype over `u64` so cycle counts
  cannot be mixed with unrelated counters by accident.
- `DeviceId`: opaque device identity issued by the device registry.
- `PagePerms` / `TargetCaps` / `AccessFlags`: bit sets combined bitwise.
- `BusAccess`: the record a CPU (or DMA engine, or debugger) hands to the
  bus for every transaction.

Nothing here owns state or has behavior beyond construction and small
conversions; the types exist so signatures across the crate stay honest.
*/

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use bitflags::bitflags;

/// Virtual or physical address. The bus masks addresses down to its
/// configured width; `u32` covers the largest supported space (32 bits).
pub type Addr = u32;

/// Monotonic count of simulated CPU cycles.
///
/// Supports addition, subtraction and ordering. Only `Scheduler::reset`
/// moves simulated time backward; everything else accumulates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cycle(pub u64);

impl Cycle {
    pub const ZERO: Cycle = Cycle(0);

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Cycle) -> Cycle {
        Cycle(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Cycle {
    type Output = Cycle;
    #[inline]
    fn add(self, rhs: Cycle) -> Cycle {
        Cycle(self.0 + rhs.0)
    }
}

impl Add<u64> for Cycle {
    type Output = Cycle;
    #[inline]
    fn add(self, rhs: u64) -> Cycle {
        Cycle(self.0 + rhs)
    }
}

impl AddAssign for Cycle {
    #[inline]
    fn add_assign(&mut self, rhs: Cycle) {
        self.0 += rhs.0;
    }
}

impl AddAssign<u64> for Cycle {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for Cycle {
    type Output = Cycle;
    #[inline]
    fn sub(self, rhs: Cycle) -> Cycle {
        Cycle(self.0 - rhs.0)
    }
}

impl SubAssign for Cycle {
    #[inline]
    fn sub_assign(&mut self, rhs: Cycle) {
        self.0 -= rhs.0;
    }
}

impl From<u64> for Cycle {
    #[inline]
    fn from(v: u64) -> Self {
        Cycle(v)
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque device identity. Issued by `DeviceRegistry`; `DeviceId::SYSTEM`
/// is reserved for the machine itself (reset assertion, builder mappings
/// that belong to no particular device).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// The machine/motherboard itself.
    pub const SYSTEM: DeviceId = DeviceId(0);
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

bitflags! {
    /// Per-page access permissions. Combined bitwise; enforced by the
    /// checked bus entry points for non-debug intents.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PagePerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RX = Self::READ.bits() | Self::EXECUTE.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl PagePerms {
    /// Parse an `"rwx"`-style string as used by machine profiles.
    /// Letters may appear in any order; `-` is an accepted placeholder.
    /// Returns `None` on any other character.
    pub fn parse_rwx(s: &str) -> Option<PagePerms> {
        let mut perms = PagePerms::empty();
        for ch in s.chars() {
            match ch {
                'r' => perms |= PagePerms::READ,
                'w' => perms |= PagePerms::WRITE,
                'x' => perms |= PagePerms::EXECUTE,
                '-' => {}
                _ => return None,
            }
        }
        Some(perms)
    }
}

impl fmt::Display for PagePerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(PagePerms::READ) { 'r' } else { '-' };
        let w = if self.contains(PagePerms::WRITE) { 'w' } else { '-' };
        let x = if self.contains(PagePerms::EXECUTE) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

bitflags! {
    /// Capabilities advertised by a bus target.
    ///
    /// `PEEK`/`POKE` are the non-observable debugger variants; `WIDE`
    /// means native 16/32-bit entry points exist and may be used by the
    /// bus instead of byte decomposition.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TargetCaps: u8 {
        const PEEK = 1 << 0;
        const POKE = 1 << 1;
        const WIDE = 1 << 2;
        const SIDE_EFFECTS = 1 << 3;
        const TIMING_SENSITIVE = 1 << 4;
    }
}

bitflags! {
    /// Per-access override flags carried in `BusAccess`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AccessFlags: u8 {
        /// Force byte-by-byte decomposition regardless of target support.
        const FORCE_DECOMPOSE = 1 << 0;
        /// Caller asked for a native wide access when the target allows it.
        const ATOMIC_REQUESTED = 1 << 1;
    }
}

/// Informational classification of a mapped region. Carried through bus
/// results so callers can tell what answered without another lookup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RegionTag {
    Ram,
    Rom,
    Io,
    Slot,
    Composite,
    #[default]
    Other,
}

/// Why an access is happening. Debug variants bypass permission checks;
/// `InstructionFetch` additionally arms the execute-permission check and
/// the trap fast-path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessIntent {
    DataRead,
    DataWrite,
    InstructionFetch,
    DebugRead,
    DebugWrite,
}

impl AccessIntent {
    #[inline]
    pub fn is_debug(self) -> bool {
        matches!(self, AccessIntent::DebugRead | AccessIntent::DebugWrite)
    }

    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessIntent::DataWrite | AccessIntent::DebugWrite)
    }

    #[inline]
    pub fn is_read(self) -> bool {
        !self.is_write()
    }
}

/// Whether a wide access should model per-byte bus cycles (`Decomposed`,
/// the behavior of the real chips) or may complete in one step
/// (`Atomic`, when the target supports it and nothing forces otherwise).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusAccessMode {
    Atomic,
    Decomposed,
}

/// One bus transaction as issued by a CPU, DMA engine or debugger.
#[derive(Clone, Copy, Debug)]
pub struct BusAccess {
    pub addr: Addr,
    /// 8, 16 or 32.
    pub width_bits: u8,
    pub intent: AccessIntent,
    pub mode: BusAccessMode,
    pub source: DeviceId,
    pub cycle: Cycle,
    pub flags: AccessFlags,
}

impl BusAccess {
    fn new(addr: Addr, intent: AccessIntent) -> BusAccess {
        BusAccess {
            addr,
            width_bits: 8,
            intent,
            mode: BusAccessMode::Atomic,
            source: DeviceId::SYSTEM,
            cycle: Cycle::ZERO,
            flags: AccessFlags::empty(),
        }
    }

    #[inline]
    pub fn data_read(addr: Addr) -> BusAccess {
        Self::new(addr, AccessIntent::DataRead)
    }

    #[inline]
    pub fn data_write(addr: Addr) -> BusAccess {
        Self::new(addr, AccessIntent::DataWrite)
    }

    #[inline]
    pub fn fetch(addr: Addr) -> BusAccess {
        Self::new(addr, AccessIntent::InstructionFetch)
    }

    #[inline]
    pub fn debug_read(addr: Addr) -> BusAccess {
        Self::new(addr, AccessIntent::DebugRead)
    }

    #[inline]
    pub fn debug_write(addr: Addr) -> BusAccess {
        Self::new(addr, AccessIntent::DebugWrite)
    }

    #[inline]
    pub fn with_width(mut self, bits: u8) -> BusAccess {
        debug_assert!(matches!(bits, 8 | 16 | 32));
        self.width_bits = bits;
        self
    }

    #[inline]
    pub fn with_mode(mut self, mode: BusAccessMode) -> BusAccess {
        self.mode = mode;
        self
    }

    #[inline]
    pub fn with_flags(mut self, flags: AccessFlags) -> BusAccess {
        self.flags = flags;
        self
    }

    #[inline]
    pub fn with_source(mut self, source: DeviceId) -> BusAccess {
        self.source = source;
        self
    }

    #[inline]
    pub fn with_cycle(mut self, cycle: Cycle) -> BusAccess {
        self.cycle = cycle;
        self
    }

    /// Derive the byte-sized access used for one step of a decomposed
    /// wide transaction. Intent, mode, source and cycle carry over.
    #[inline]
    pub fn byte_at(&self, addr: Addr) -> BusAccess {
        BusAccess {
            addr,
            width_bits: 8,
            ..*self
        }
    }

    /// Number of bytes this access covers.
    #[inline]
    pub fn width_bytes(&self) -> u32 {
        (self.width_bits as u32) / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_arithmetic_and_ordering() {
        let a = Cycle(10);
        let b = Cycle(3);
        assert_eq!(a + b, Cycle(13));
        assert_eq!(a - b, Cycle(7));
        assert_eq!(a + 5u64, Cycle(15));
        assert!(b < a);

        let mut c = Cycle::ZERO;
        c += 4u64;
        c += Cycle(6);
        assert_eq!(c, Cycle(10));
        assert_eq!(Cycle(2).saturating_sub(Cycle(5)), Cycle::ZERO);
    }

    #[test]
    fn perms_parse_and_display() {
        assert_eq!(PagePerms::parse_rwx("rwx"), Some(PagePerms::RWX));
        assert_eq!(PagePerms::parse_rwx("r-x"), Some(PagePerms::RX));
        assert_eq!(PagePerms::parse_rwx("xr"), Some(PagePerms::RX));
        assert_eq!(PagePerms::parse_rwx(""), Some(PagePerms::empty()));
        assert_eq!(PagePerms::parse_rwx("rq"), None);
        assert_eq!(PagePerms::RW.to_string(), "rw-");
    }

    #[test]
    fn intent_classification() {
        assert!(AccessIntent::DebugRead.is_debug());
        assert!(AccessIntent::DebugWrite.is_debug());
        assert!(!AccessIntent::InstructionFetch.is_debug());
        assert!(AccessIntent::DataWrite.is_write());
        assert!(AccessIntent::InstructionFetch.is_read());
    }

    #[test]
    fn access_builders_compose() {
        let access = BusAccess::data_read(0x1FFF)
            .with_width(16)
            .with_mode(BusAccessMode::Decomposed)
            .with_source(DeviceId(3))
            .with_cycle(Cycle(99));
        assert_eq!(access.width_bytes(), 2);
        assert_eq!(access.source, DeviceId(3));

        let byte = access.byte_at(0x2000);
        assert_eq!(byte.addr, 0x2000);
        assert_eq!(byte.width_bits, 8);
        assert_eq!(byte.intent, AccessIntent::DataRead);
        assert_eq!(byte.cycle, Cycle(99));
    }
}
