/*!
Composite targets: one page, many personalities.

A composite target answers bus accesses by re-dispatching to nested
sub-ranges. The canonical example is the Apple II I/O page at
$C000-$CFFF, which stacks three different behaviors into 4 KiB:

- $C000-$C0FF: soft switches, dispatched per-offset to registered
  read/write handlers.
- $C100-$C7FF: per-slot ROM windows ($Cn00 shows slot n's 256-byte ROM);
  touching a populated slot's window also selects that slot's expansion
  ROM.
- $C800-$CFFF: the shared expansion-ROM window of whichever slot is
  selected; reading $CFFF deselects.

`IoPage` implements exactly that, and additionally accepts nested leaf
targets over explicit 256-byte-aligned sub-ranges for machine variants
that map extra hardware into the page.

Offsets given to a composite are offsets into the composite region
(`physical_base + (addr & 0xFFF)`; composites are normally mapped with a
physical base of zero, so the page offset and the composite offset
coincide).
*/

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bus::target::{BusTarget, FLOATING_BUS, TargetRef};
use crate::device::SlotManagerRef;
use crate::types::{AccessIntent, Addr, BusAccess, RegionTag, TargetCaps};

/// Required alignment (offset and size) for composite sub-ranges.
pub const SUBRANGE_ALIGN: u32 = 0x100;

/// Shared handle to a composite target.
pub type CompositeRef = Rc<RefCell<dyn CompositeTarget>>;

/// Wrap a concrete composite into the shared handle pages hold.
#[inline]
pub fn composite_ref<T: CompositeTarget + 'static>(target: T) -> CompositeRef {
    Rc::new(RefCell::new(target))
}

/// Descriptive record for one sub-range of a composite.
#[derive(Clone, Debug)]
pub struct SubrangeInfo {
    pub offset: Addr,
    pub size: u32,
    pub tag: RegionTag,
    pub name: String,
}

/// A bus target that internally dispatches sub-ranges to nested targets
/// or handlers. The bus consults `subregion_tag` so results report which
/// personality answered; `resolve_target` exposes nested leaves to
/// debuggers.
pub trait CompositeTarget: BusTarget {
    /// The nested leaf target covering `offset`, if the sub-range is
    /// backed by one (handler- and slot-backed windows return `None`).
    fn resolve_target(&self, offset: Addr, intent: AccessIntent) -> Option<TargetRef>;

    /// Classification of the sub-range covering `offset`.
    fn subregion_tag(&self, offset: Addr) -> RegionTag;

    /// Enumerate the fixed sub-ranges of this composite.
    fn subranges(&self) -> Vec<SubrangeInfo>;
}

/// Soft-switch read handler: `(switch_offset, access) -> byte`.
pub type ReadHandler = Box<dyn FnMut(Addr, &BusAccess) -> u8>;
/// Soft-switch write handler: `(switch_offset, byte, access)`.
pub type WriteHandler = Box<dyn FnMut(Addr, u8, &BusAccess)>;

struct NestedRange {
    offset: u32,
    size: u32,
    tag: RegionTag,
    name: String,
    target: TargetRef,
}

/// The combined soft-switch / slot-ROM / expansion-ROM page.
pub struct IoPage {
    read_handlers: HashMap<u16, ReadHandler>,
    write_handlers: HashMap<u16, WriteHandler>,
    slots: SlotManagerRef,
    nested: Vec<NestedRange>,
}

impl IoPage {
    pub fn new(slots: SlotManagerRef) -> IoPage {
        IoPage {
            read_handlers: HashMap::new(),
            write_handlers: HashMap::new(),
            slots,
            nested: Vec::new(),
        }
    }

    /// Register a read handler for one soft-switch offset ($C0xx low
    /// byte, 0x00-0xFF). Replaces any previous handler at that offset.
    pub fn register_read_handler(&mut self, offset: u16, handler: ReadHandler) {
        debug_assert!(offset <= 0xFF);
        self.read_handlers.insert(offset & 0xFF, handler);
    }

    /// Register a write handler for one soft-switch offset.
    pub fn register_write_handler(&mut self, offset: u16, handler: WriteHandler) {
        debug_assert!(offset <= 0xFF);
        self.write_handlers.insert(offset & 0xFF, handler);
    }

    /// Mount a nested leaf target over `[offset, offset + size)` inside
    /// the page. Both bounds must be 256-byte aligned. Nested ranges are
    /// consulted before the built-in windows.
    ///
    /// The sub-range is a window, not a remapping: the nested target
    /// receives offsets in the composite's own offset space, so the
    /// bus can delegate to it via `resolve_target` without translation.
    pub fn add_subrange(
        &mut self,
        offset: u32,
        size: u32,
        tag: RegionTag,
        name: impl Into<String>,
        target: TargetRef,
    ) {
        assert!(
            offset % SUBRANGE_ALIGN == 0 && size % SUBRANGE_ALIGN == 0 && size > 0,
            "composite sub-ranges must be 256-byte aligned"
        );
        self.nested.push(NestedRange {
            offset,
            size,
            tag,
            name: name.into(),
            target,
        });
    }

    pub fn slots(&self) -> &SlotManagerRef {
        &self.slots
    }

    fn nested_at(&self, offset: u32) -> Option<&NestedRange> {
        self.nested
            .iter()
            .find(|r| offset >= r.offset && offset < r.offset + r.size)
    }

    /// Slot number whose ROM window covers `offset`, for $C100-$C7FF.
    #[inline]
    fn slot_for_offset(offset: u32) -> u8 {
        (offset >> 8) as u8
    }
}

impl BusTarget for IoPage {
    fn caps(&self) -> TargetCaps {
        TargetCaps::SIDE_EFFECTS | TargetCaps::PEEK
    }

    fn read8(&mut self, physical: usize, access: &BusAccess) -> u8 {
        let offset = (physical as u32) & 0xFFF;
        let debug = access.intent.is_debug();

        if let Some(range) = self.nested_at(offset) {
            return range.target.clone().borrow_mut().read8(offset as usize, access);
        }

        match offset {
            0x000..=0x0FF => {
                // Debug reads must not fire switch side effects.
                if debug {
                    return FLOATING_BUS;
                }
                match self.read_handlers.get_mut(&(offset as u16)) {
                    Some(handler) => handler(offset, access),
                    None => FLOATING_BUS,
                }
            }
            0x100..=0x7FF => {
                let slot = Self::slot_for_offset(offset);
                let mut slots = self.slots.borrow_mut();
                if slots.has_card(slot) {
                    if !debug {
                        slots.select_expansion_slot(slot);
                    }
                    slots
                        .slot_rom_byte(slot, (offset & 0xFF) as usize)
                        .unwrap_or(FLOATING_BUS)
                } else {
                    FLOATING_BUS
                }
            }
            0x800..=0xFFF => {
                let mut slots = self.slots.borrow_mut();
                let value = slots
                    .expansion_rom_byte((offset - 0x800) as usize)
                    .unwrap_or(FLOATING_BUS);
                if offset == 0xFFF && !debug {
                    slots.deselect_expansion_slot();
                }
                value
            }
            _ => FLOATING_BUS,
        }
    }

    fn write8(&mut self, physical: usize, value: u8, access: &BusAccess) {
        let offset = (physical as u32) & 0xFFF;

        if let Some(range) = self.nested_at(offset) {
            range
                .target
                .clone()
                .borrow_mut()
                .write8(offset as usize, value, access);
            return;
        }

        match offset {
            0x000..=0x0FF => {
                if access.intent.is_debug() {
                    return;
                }
                if let Some(handler) = self.write_handlers.get_mut(&(offset as u16)) {
                    handler(offset, value, access);
                }
            }
            // Slot and expansion ROM windows ignore writes.
            _ => {}
        }
    }

    fn peek8(&self, physical: usize) -> Option<u8> {
        let offset = (physical as u32) & 0xFFF;
        if let Some(range) = self.nested_at(offset) {
            return range.target.borrow().peek8(offset as usize);
        }
        match offset {
            // Switch values are only knowable by running the handler.
            0x000..=0x0FF => None,
            0x100..=0x7FF => {
                let slots = self.slots.borrow();
                slots.slot_rom_byte(Self::slot_for_offset(offset), (offset & 0xFF) as usize)
            }
            0x800..=0xFFF => self.slots.borrow().expansion_rom_byte((offset - 0x800) as usize),
            _ => None,
        }
    }
}

impl CompositeTarget for IoPage {
    fn resolve_target(&self, offset: Addr, _intent: AccessIntent) -> Option<TargetRef> {
        self.nested_at(offset & 0xFFF).map(|r| r.target.clone())
    }

    fn subregion_tag(&self, offset: Addr) -> RegionTag {
        let offset = offset & 0xFFF;
        if let Some(range) = self.nested_at(offset) {
            return range.tag;
        }
        match offset {
            0x000..=0x0FF => RegionTag::Io,
            0x100..=0xFFF => RegionTag::Slot,
            _ => RegionTag::Other,
        }
    }

    fn subranges(&self) -> Vec<SubrangeInfo> {
        let mut ranges = vec![
            SubrangeInfo {
                offset: 0x000,
                size: 0x100,
                tag: RegionTag::Io,
                name: "soft-switches".into(),
            },
            SubrangeInfo {
                offset: 0x100,
                size: 0x700,
                tag: RegionTag::Slot,
                name: "slot-rom".into(),
            },
            SubrangeInfo {
                offset: 0x800,
                size: 0x800,
                tag: RegionTag::Slot,
                name: "expansion-rom".into(),
            },
        ];
        ranges.extend(self.nested.iter().map(|r| SubrangeInfo {
            offset: r.offset,
            size: r.size,
            tag: r.tag,
            name: r.name.clone(),
        }));
        ranges
    }
}
