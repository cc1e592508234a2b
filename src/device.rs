/*!
Devices, the identity registry, and the slot manager.

A device is anything wired into the machine besides the CPU: motherboard
peripherals (keyboard, speaker) and slot cards (disk controllers,
printers). The core does not implement any concrete device; it defines
the contract they plug into and the bookkeeping the machine needs:

- `DeviceRegistry` issues the opaque `DeviceId`s devices use when
  asserting signal lines and tagging bus mappings.
- `Device` is the lifecycle seam: initialization (arming timers via the
  scheduler), reset, and soft-switch handler registration.
- `SlotManager` owns the seven expansion slots, each card's slot ROM and
  expansion ROM bytes, and the single active expansion-ROM selection that
  the I/O page and the trap registry both consult.
*/

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::context::EventContext;
use crate::types::DeviceId;

/// Expansion ROM window size ($C800-$CFFF).
pub const EXPANSION_ROM_SIZE: usize = 0x800;
/// Per-slot ROM window size ($Cn00-$CnFF).
pub const SLOT_ROM_SIZE: usize = 0x100;

/// Lifecycle contract for motherboard devices and slot cards.
///
/// All methods run on the emulation thread. `initialize` is called once
/// during `build()` and is where a device arms its first scheduled
/// events; `reset` mirrors the machine-level reset.
pub trait Device {
    fn name(&self) -> &str;

    fn id(&self) -> DeviceId;

    fn initialize(&mut self, _ctx: &mut EventContext<'_>) {}

    fn reset(&mut self, _ctx: &mut EventContext<'_>) {}

    /// Register this device's soft-switch handlers on the I/O page.
    /// Called during build, after `initialize`.
    fn register_soft_switches(&mut self, _io: &mut crate::bus::IoPage) {}
}

/// Descriptive record for a registered device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
}

/// Issues `DeviceId`s and remembers who they belong to.
///
/// Id 0 is reserved for the machine itself (`DeviceId::SYSTEM`).
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceInfo>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry::default()
    }

    /// Register a device by name and return its freshly issued id.
    pub fn register(&mut self, name: impl Into<String>) -> DeviceId {
        let id = DeviceId(self.devices.len() as u32 + 1);
        self.devices.push(DeviceInfo {
            id,
            name: name.into(),
        });
        id
    }

    pub fn name_of(&self, id: DeviceId) -> Option<&str> {
        if id == DeviceId::SYSTEM {
            return Some("system");
        }
        self.devices
            .iter()
            .find(|d| d.id == id)
            .map(|d| d.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("slot {0} out of range (valid: 1-7)")]
    InvalidSlot(u8),
    #[error("slot {0} already has a card installed")]
    Occupied(u8),
}

/// A card installed in a peripheral slot: the 256-byte slot ROM visible
/// at $Cn00 and an optional 2 KiB expansion ROM shared through the $C800
/// window.
pub struct SlotCard {
    pub name: String,
    pub device: DeviceId,
    pub rom: Vec<u8>,
    pub expansion_rom: Vec<u8>,
}

impl SlotCard {
    pub fn new(name: impl Into<String>, device: DeviceId, rom: Vec<u8>) -> SlotCard {
        SlotCard {
            name: name.into(),
            device,
            rom,
            expansion_rom: Vec::new(),
        }
    }

    pub fn with_expansion_rom(mut self, bytes: Vec<u8>) -> SlotCard {
        self.expansion_rom = bytes;
        self
    }

    #[inline]
    pub fn has_expansion_rom(&self) -> bool {
        !self.expansion_rom.is_empty()
    }
}

/// The seven peripheral slots plus the mutually-exclusive expansion-ROM
/// selection. Accessing a populated slot's ROM window selects that
/// slot's expansion ROM; reading $CFFF deselects it.
#[derive(Default)]
pub struct SlotManager {
    slots: [Option<SlotCard>; 8],
    active_expansion: Option<u8>,
}

/// Shared handle; the I/O page and the trap registry both hold one.
pub type SlotManagerRef = Rc<RefCell<SlotManager>>;

impl SlotManager {
    pub fn new() -> SlotManager {
        SlotManager::default()
    }

    pub fn shared() -> SlotManagerRef {
        Rc::new(RefCell::new(SlotManager::new()))
    }

    pub fn install(&mut self, slot: u8, card: SlotCard) -> Result<(), SlotError> {
        if !(1..=7).contains(&slot) {
            return Err(SlotError::InvalidSlot(slot));
        }
        let entry = &mut self.slots[slot as usize];
        if entry.is_some() {
            return Err(SlotError::Occupied(slot));
        }
        log::debug!("slot {}: installed card '{}'", slot, card.name);
        *entry = Some(card);
        Ok(())
    }

    pub fn remove(&mut self, slot: u8) -> Option<SlotCard> {
        if !(1..=7).contains(&slot) {
            return None;
        }
        if self.active_expansion == Some(slot) {
            self.active_expansion = None;
        }
        self.slots[slot as usize].take()
    }

    #[inline]
    pub fn card(&self, slot: u8) -> Option<&SlotCard> {
        self.slots.get(slot as usize).and_then(|c| c.as_ref())
    }

    #[inline]
    pub fn has_card(&self, slot: u8) -> bool {
        self.card(slot).is_some()
    }

    /// Select `slot`'s expansion ROM into the $C800 window. A no-op for
    /// empty slots.
    pub fn select_expansion_slot(&mut self, slot: u8) {
        if self.has_card(slot) && self.active_expansion != Some(slot) {
            log::debug!("expansion ROM: slot {slot} selected");
            self.active_expansion = Some(slot);
        }
    }

    pub fn deselect_expansion_slot(&mut self) {
        if let Some(slot) = self.active_expansion.take() {
            log::debug!("expansion ROM: slot {slot} deselected");
        }
    }

    #[inline]
    pub fn active_expansion_slot(&self) -> Option<u8> {
        self.active_expansion
    }

    /// Byte from the installed card's slot ROM ($Cn00 window), if any.
    pub fn slot_rom_byte(&self, slot: u8, offset: usize) -> Option<u8> {
        self.card(slot)
            .and_then(|card| card.rom.get(offset % SLOT_ROM_SIZE.max(1)).copied())
    }

    /// Byte from the active expansion ROM ($C800 window), if a slot is
    /// selected and its card carries one.
    pub fn expansion_rom_byte(&self, offset: usize) -> Option<u8> {
        let slot = self.active_expansion?;
        let card = self.card(slot)?;
        card.expansion_rom.get(offset).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_issues_sequential_ids() {
        let mut reg = DeviceRegistry::new();
        let kb = reg.register("keyboard");
        let spk = reg.register("speaker");
        assert_eq!(kb, DeviceId(1));
        assert_eq!(spk, DeviceId(2));
        assert_eq!(reg.name_of(spk), Some("speaker"));
        assert_eq!(reg.name_of(DeviceId::SYSTEM), Some("system"));
        assert_eq!(reg.name_of(DeviceId(99)), None);
    }

    #[test]
    fn slot_install_bounds_and_occupancy() {
        let mut slots = SlotManager::new();
        let card = SlotCard::new("disk", DeviceId(1), vec![0xEA; 256]);
        assert!(slots.install(0, SlotCard::new("x", DeviceId(1), vec![])).is_err());
        assert!(slots.install(8, SlotCard::new("x", DeviceId(1), vec![])).is_err());
        slots.install(6, card).expect("install");
        assert!(slots.has_card(6));
        assert!(matches!(
            slots.install(6, SlotCard::new("dup", DeviceId(2), vec![])),
            Err(SlotError::Occupied(6))
        ));
    }

    #[test]
    fn expansion_selection_requires_card() {
        let mut slots = SlotManager::new();
        slots.select_expansion_slot(3);
        assert_eq!(slots.active_expansion_slot(), None);

        let card = SlotCard::new("scsi", DeviceId(1), vec![0x11; 256])
            .with_expansion_rom(vec![0x77; EXPANSION_ROM_SIZE]);
        slots.install(3, card).expect("install");
        slots.select_expansion_slot(3);
        assert_eq!(slots.active_expansion_slot(), Some(3));
        assert_eq!(slots.expansion_rom_byte(0x10), Some(0x77));

        slots.deselect_expansion_slot();
        assert_eq!(slots.active_expansion_slot(), None);
        assert_eq!(slots.expansion_rom_byte(0x10), None);
    }

    #[test]
    fn removing_selected_card_clears_selection() {
        let mut slots = SlotManager::new();
        let card = SlotCard::new("card", DeviceId(1), vec![0x22; 256])
            .with_expansion_rom(vec![0x33; 16]);
        slots.install(5, card).expect("install");
        slots.select_expansion_slot(5);
        let removed = slots.remove(5).expect("card");
        assert_eq!(removed.name, "card");
        assert_eq!(slots.active_expansion_slot(), None);
    }
}
