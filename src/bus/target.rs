/*!
Bus target contract plus the two universal leaves, RAM and ROM.

A `BusTarget` is anything that can answer a bus access: a byte buffer, a
register file, a soft-switch dispatcher, a slot card. Targets operate in
physical space; the main bus has already translated the virtual address
and enforced permissions by the time a target sees the access.

Targets are shared between pages (and between the base table, layers and
swap variants) through `Rc<RefCell<dyn BusTarget>>`; the bus borrows them
only for the duration of one access.
*/

use std::cell::RefCell;
use std::rc::Rc;

use crate::types::{BusAccess, TargetCaps};

/// The value read when nothing drives the data lines.
pub const FLOATING_BUS: u8 = 0xFF;

/// Shared handle to a bus target.
pub type TargetRef = Rc<RefCell<dyn BusTarget>>;

/// Wrap a concrete target into the shared handle pages hold.
#[inline]
pub fn target_ref<T: BusTarget + 'static>(target: T) -> TargetRef {
    Rc::new(RefCell::new(target))
}

/// Anything that answers a bus access.
///
/// `read8`/`write8` are mandatory. The wide entry points are consulted by
/// the bus only when the target advertises `TargetCaps::WIDE`; the
/// defaults decompose into byte accesses (little-endian) so a target can
/// advertise wide support without hand-writing all four methods.
/// `peek8`/`poke8` are the non-observable debugger variants, gated on
/// `PEEK`/`POKE`.
pub trait BusTarget {
    fn caps(&self) -> TargetCaps;

    fn read8(&mut self, physical: usize, access: &BusAccess) -> u8;

    fn write8(&mut self, physical: usize, value: u8, access: &BusAccess);

    fn read16(&mut self, physical: usize, access: &BusAccess) -> u16 {
        let lo = self.read8(physical, &access.byte_at(access.addr)) as u16;
        let hi = self.read8(
            physical.wrapping_add(1),
            &access.byte_at(access.addr.wrapping_add(1)),
        ) as u16;
        (hi << 8) | lo
    }

    fn write16(&mut self, physical: usize, value: u16, access: &BusAccess) {
        self.write8(physical, (value & 0xFF) as u8, &access.byte_at(access.addr));
        self.write8(
            physical.wrapping_add(1),
            (value >> 8) as u8,
            &access.byte_at(access.addr.wrapping_add(1)),
        );
    }

    fn read32(&mut self, physical: usize, access: &BusAccess) -> u32 {
        let lo = self.read16(physical, access) as u32;
        let hi = self.read16(physical.wrapping_add(2), access) as u32;
        (hi << 16) | lo
    }

    fn write32(&mut self, physical: usize, value: u32, access: &BusAccess) {
        self.write16(physical, (value & 0xFFFF) as u16, access);
        self.write16(physical.wrapping_add(2), (value >> 16) as u16, access);
    }

    /// Side-effect-free read for debuggers. `None` when the target does
    /// not support peeking (or the position is out of range).
    fn peek8(&self, _physical: usize) -> Option<u8> {
        None
    }

    /// Side-effect-free write for debuggers. Returns whether the byte was
    /// actually stored.
    fn poke8(&mut self, _physical: usize, _value: u8) -> bool {
        false
    }
}

/// A plain byte buffer: physical RAM.
///
/// Doubles as a named physical memory block; several pages (and swap
/// variants) may map into one `RamTarget` at different physical bases.
pub struct RamTarget {
    data: Vec<u8>,
}

impl RamTarget {
    pub fn new(size: usize) -> RamTarget {
        RamTarget {
            data: vec![0; size],
        }
    }

    pub fn filled(size: usize, fill: u8) -> RamTarget {
        RamTarget {
            data: vec![fill; size],
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> RamTarget {
        RamTarget { data }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy `bytes` into the buffer at `offset`. Used by the builder to
    /// pre-load ROM images into physical blocks. Out-of-range tails are
    /// an error at configuration time, so this panics on overflow only in
    /// debug builds and truncates otherwise.
    pub fn load(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.data.len());
        let end = (offset + bytes.len()).min(self.data.len());
        if offset < end {
            self.data[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BusTarget for RamTarget {
    fn caps(&self) -> TargetCaps {
        TargetCaps::PEEK | TargetCaps::POKE | TargetCaps::WIDE
    }

    #[inline]
    fn read8(&mut self, physical: usize, _access: &BusAccess) -> u8 {
        self.data.get(physical).copied().unwrap_or(FLOATING_BUS)
    }

    #[inline]
    fn write8(&mut self, physical: usize, value: u8, _access: &BusAccess) {
        if let Some(slot) = self.data.get_mut(physical) {
            *slot = value;
        }
    }

    fn read16(&mut self, physical: usize, access: &BusAccess) -> u16 {
        match self.data.get(physical..physical + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => {
                let lo = self.read8(physical, access) as u16;
                let hi = self.read8(physical.wrapping_add(1), access) as u16;
                (hi << 8) | lo
            }
        }
    }

    fn write16(&mut self, physical: usize, value: u16, access: &BusAccess) {
        match self.data.get_mut(physical..physical + 2) {
            Some(b) => b.copy_from_slice(&value.to_le_bytes()),
            None => {
                self.write8(physical, (value & 0xFF) as u8, access);
                self.write8(physical.wrapping_add(1), (value >> 8) as u8, access);
            }
        }
    }

    fn read32(&mut self, physical: usize, access: &BusAccess) -> u32 {
        match self.data.get(physical..physical + 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => {
                let lo = self.read16(physical, access) as u32;
                let hi = self.read16(physical.wrapping_add(2), access) as u32;
                (hi << 16) | lo
            }
        }
    }

    fn write32(&mut self, physical: usize, value: u32, access: &BusAccess) {
        match self.data.get_mut(physical..physical + 4) {
            Some(b) => b.copy_from_slice(&value.to_le_bytes()),
            None => {
                self.write16(physical, (value & 0xFFFF) as u16, access);
                self.write16(physical.wrapping_add(2), (value >> 16) as u16, access);
            }
        }
    }

    #[inline]
    fn peek8(&self, physical: usize) -> Option<u8> {
        self.data.get(physical).copied()
    }

    #[inline]
    fn poke8(&mut self, physical: usize, value: u8) -> bool {
        match self.data.get_mut(physical) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

/// Read-only bytes: firmware, slot ROMs, character generators.
///
/// Normal writes are absorbed silently, as the hardware does. Debug-intent
/// writes (and pokes) land only when the target was constructed with a
/// mutable backing buffer, which is how ROM patching is opted into.
pub struct RomTarget {
    data: Vec<u8>,
    debug_writable: bool,
}

impl RomTarget {
    pub fn new(data: Vec<u8>) -> RomTarget {
        RomTarget {
            data,
            debug_writable: false,
        }
    }

    /// A ROM whose backing buffer may be patched through debug writes.
    pub fn writable(data: Vec<u8>) -> RomTarget {
        RomTarget {
            data,
            debug_writable: true,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl BusTarget for RomTarget {
    fn caps(&self) -> TargetCaps {
        let mut caps = TargetCaps::PEEK | TargetCaps::WIDE;
        if self.debug_writable {
            caps |= TargetCaps::POKE;
        }
        caps
    }

    #[inline]
    fn read8(&mut self, physical: usize, _access: &BusAccess) -> u8 {
        self.data.get(physical).copied().unwrap_or(FLOATING_BUS)
    }

    fn write8(&mut self, physical: usize, value: u8, access: &BusAccess) {
        if access.intent.is_debug() && self.debug_writable {
            if let Some(slot) = self.data.get_mut(physical) {
                *slot = value;
            }
        }
        // Non-debug writes to ROM land nowhere.
    }

    fn read16(&mut self, physical: usize, access: &BusAccess) -> u16 {
        match self.data.get(physical..physical + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => {
                let lo = self.read8(physical, access) as u16;
                let hi = self.read8(physical.wrapping_add(1), access) as u16;
                (hi << 8) | lo
            }
        }
    }

    fn read32(&mut self, physical: usize, access: &BusAccess) -> u32 {
        match self.data.get(physical..physical + 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => {
                let lo = self.read16(physical, access) as u32;
                let hi = self.read16(physical.wrapping_add(2), access) as u32;
                (hi << 16) | lo
            }
        }
    }

    #[inline]
    fn peek8(&self, physical: usize) -> Option<u8> {
        self.data.get(physical).copied()
    }

    fn poke8(&mut self, physical: usize, value: u8) -> bool {
        if !self.debug_writable {
            return false;
        }
        match self.data.get_mut(physical) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}
