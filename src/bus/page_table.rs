/*!
Paged address translation: the main bus.

The bus holds one `PageEntry` per 4 KiB page of the configured address
space (width 12-32 bits, so `2^(w-12)` entries). Translation is a shift:
page index is `addr >> 12`, the position handed to the target is
`entry.physical_base + (addr & 0xFFF)`. Every CPU, DMA and debugger
access funnels through here.

Composite pages dispatch in two stages: the bus first asks
`resolve_target(offset, intent)` and delegates to the nested leaf it
returns; when no leaf is mounted at that offset the composite answers
through its own windows (soft switches, slot ROM), and offsets no
window covers float.

Two entry-point families:

- Infallible (`read8`, `write16`, ...): hardware-accurate absorption.
  Unmapped or unreadable positions float (`0xFF` per byte), denied writes
  land nowhere. This is the CPU's normal path.
- Checked (`try_read8`, `try_write16`, ...): return `BusResult` carrying
  the fault (unmapped / permission) or the success metadata (source
  device, region tag, cycles charged).

Wide accesses (16/32 bits) follow a fixed decomposition policy:

1. crossing a page boundary always decomposes into byte accesses;
2. `FORCE_DECOMPOSE` decomposes;
3. `ATOMIC_REQUESTED` + a wide-capable target goes native;
4. `Decomposed` mode decomposes (preserving byte-visible cycle effects
   for timing-sensitive hardware);
5. otherwise a wide-capable target goes native;
6. otherwise decompose.

A decomposed access that faults midway charges the byte cycles that
succeeded before the fault.

The base table records what the builder mapped; the effective table is
what accesses see, and is recomputed per page as `base -> winning active
layer -> swap-group selection` whenever layers or swap groups change.
*/

use thiserror::Error;

use crate::bus::composite::CompositeRef;
use crate::bus::fault::{BusFault, BusResult, PermissionKind};
use crate::bus::layers::{LayerSet, LayeredMapping, MappingLayer};
use crate::bus::swap::{SwapError, SwapGroup, SwapGroupId, SwapGroups, SwapVariant};
use crate::bus::target::{FLOATING_BUS, TargetRef};
use crate::types::{
    AccessFlags, AccessIntent, Addr, BusAccess, BusAccessMode, Cycle, DeviceId, PagePerms,
    RegionTag, TargetCaps,
};

/// Bytes per page.
pub const PAGE_SIZE: usize = 0x1000;
/// Address-to-page shift.
pub const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("address-space width {0} out of range (12-32 bits)")]
    WidthOutOfRange(u8),
    #[error("base address {0:#x} is not 4 KiB aligned")]
    UnalignedBase(Addr),
    #[error("size {0:#x} is not a non-zero multiple of 4 KiB")]
    UnalignedSize(u64),
    #[error("range {base:#x}+{size:#x} exceeds the address space")]
    RangeOutOfBounds { base: Addr, size: u64 },
    #[error("page index {0} out of range")]
    InvalidPageIndex(usize),
    #[error("layer '{0}' already exists")]
    DuplicateLayer(String),
    #[error("unknown layer '{0}'")]
    UnknownLayer(String),
}

/// What a page points at.
#[derive(Clone)]
pub enum PageTarget {
    Unmapped,
    Leaf(TargetRef),
    Composite(CompositeRef),
}

/// The resolved identity of one 4 KiB page.
#[derive(Clone)]
pub struct PageEntry {
    pub device: DeviceId,
    pub tag: RegionTag,
    pub perms: PagePerms,
    pub caps: TargetCaps,
    pub target: PageTarget,
    pub physical_base: usize,
}

impl PageEntry {
    pub fn new(
        device: DeviceId,
        tag: RegionTag,
        perms: PagePerms,
        caps: TargetCaps,
        target: PageTarget,
        physical_base: usize,
    ) -> PageEntry {
        PageEntry {
            device,
            tag,
            perms,
            caps,
            target,
            physical_base,
        }
    }

    pub fn unmapped() -> PageEntry {
        PageEntry {
            device: DeviceId::SYSTEM,
            tag: RegionTag::Other,
            perms: PagePerms::empty(),
            caps: TargetCaps::empty(),
            target: PageTarget::Unmapped,
            physical_base: 0,
        }
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        !matches!(self.target, PageTarget::Unmapped)
    }
}

/// The paged main bus.
pub struct MainBus {
    width_bits: u8,
    addr_mask: Addr,
    base: Vec<PageEntry>,
    effective: Vec<PageEntry>,
    layers: LayerSet,
    swaps: SwapGroups,
}

impl MainBus {
    /// Create an empty bus covering a `width_bits`-bit address space.
    pub fn new(width_bits: u8) -> Result<MainBus, MappingError> {
        if !(12..=32).contains(&width_bits) {
            return Err(MappingError::WidthOutOfRange(width_bits));
        }
        let pages = 1usize << (width_bits - 12);
        let space = 1u64 << width_bits;
        Ok(MainBus {
            width_bits,
            addr_mask: (space - 1) as Addr,
            base: vec![PageEntry::unmapped(); pages],
            effective: vec![PageEntry::unmapped(); pages],
            layers: LayerSet::default(),
            swaps: SwapGroups::default(),
        })
    }

    #[inline]
    pub fn width_bits(&self) -> u8 {
        self.width_bits
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.base.len()
    }

    #[inline]
    pub fn space_size(&self) -> u64 {
        1u64 << self.width_bits
    }

    /// Page index of an address (masked to the configured width).
    #[inline]
    pub fn page_index(&self, addr: Addr) -> usize {
        ((addr & self.addr_mask) >> PAGE_SHIFT) as usize
    }

    /// The effective entry governing `addr` right now.
    #[inline]
    pub fn get_page_entry(&self, addr: Addr) -> &PageEntry {
        &self.effective[self.page_index(addr)]
    }

    /// Alias kept for the layer-system vocabulary.
    #[inline]
    pub fn get_effective_mapping(&self, addr: Addr) -> &PageEntry {
        self.get_page_entry(addr)
    }

    /// The base (pre-layer, pre-swap) entry for `addr`.
    #[inline]
    pub fn get_base_entry(&self, addr: Addr) -> &PageEntry {
        &self.base[self.page_index(addr)]
    }

    // -----------------------------
    // Mapping mutation
    // -----------------------------

    fn validate_range(&self, base: Addr, size: u64) -> Result<(usize, usize), MappingError> {
        if base as usize % PAGE_SIZE != 0 {
            return Err(MappingError::UnalignedBase(base));
        }
        if size == 0 || size % PAGE_SIZE as u64 != 0 {
            return Err(MappingError::UnalignedSize(size));
        }
        if base as u64 + size > self.space_size() {
            return Err(MappingError::RangeOutOfBounds { base, size });
        }
        Ok(((base >> PAGE_SHIFT) as usize, (size >> PAGE_SHIFT) as usize))
    }

    /// Map `[base, base + size)` to `entry`, advancing the physical base
    /// page by page. Validates fully before touching any state.
    pub fn map_region(
        &mut self,
        base: Addr,
        size: u64,
        entry: PageEntry,
    ) -> Result<(), MappingError> {
        let (first, count) = self.validate_range(base, size)?;
        log::debug!(
            "map {:#x}+{:#x}: {:?} perms={} ({})",
            base,
            size,
            entry.tag,
            entry.perms,
            entry.device
        );
        for i in 0..count {
            let mut page_entry = entry.clone();
            page_entry.physical_base = entry.physical_base + i * PAGE_SIZE;
            self.base[first + i] = page_entry;
        }
        self.recompute_range(first, count);
        Ok(())
    }

    /// Return `[base, base + size)` to the unmapped state.
    pub fn unmap_region(&mut self, base: Addr, size: u64) -> Result<(), MappingError> {
        let (first, count) = self.validate_range(base, size)?;
        for page in first..first + count {
            self.base[page] = PageEntry::unmapped();
        }
        self.recompute_range(first, count);
        Ok(())
    }

    /// Replace one base page entry.
    pub fn remap_page(&mut self, index: usize, entry: PageEntry) -> Result<(), MappingError> {
        if index >= self.base.len() {
            return Err(MappingError::InvalidPageIndex(index));
        }
        self.base[index] = entry;
        self.recompute_page(index);
        Ok(())
    }

    /// Repoint one base page at a different target/physical base,
    /// keeping its identity bits.
    pub fn remap_page_target(
        &mut self,
        index: usize,
        target: PageTarget,
        physical_base: usize,
    ) -> Result<(), MappingError> {
        if index >= self.base.len() {
            return Err(MappingError::InvalidPageIndex(index));
        }
        self.base[index].target = target;
        self.base[index].physical_base = physical_base;
        self.recompute_page(index);
        Ok(())
    }

    /// Replace `count` base entries starting at `first`, advancing the
    /// physical base page by page.
    pub fn remap_page_range(
        &mut self,
        first: usize,
        count: usize,
        entry: PageEntry,
    ) -> Result<(), MappingError> {
        let end = first
            .checked_add(count)
            .ok_or(MappingError::InvalidPageIndex(usize::MAX))?;
        if end > self.base.len() {
            return Err(MappingError::InvalidPageIndex(end.saturating_sub(1)));
        }
        for i in 0..count {
            let mut page_entry = entry.clone();
            page_entry.physical_base = entry.physical_base + i * PAGE_SIZE;
            self.base[first + i] = page_entry;
        }
        self.recompute_range(first, count);
        Ok(())
    }

    // -----------------------------
    // Layers
    // -----------------------------

    pub fn add_layer(&mut self, name: &str, priority: i32) -> Result<(), MappingError> {
        self.layers.add_layer(name, priority)
    }

    pub fn layer(&self, name: &str) -> Option<&MappingLayer> {
        self.layers.layer(name)
    }

    pub fn add_layered_mapping(&mut self, mapping: LayeredMapping) -> Result<(), MappingError> {
        self.validate_range(mapping.virtual_base, mapping.size)?;
        let pages = self.layers.add_mapping(mapping)?;
        for page in pages {
            self.recompute_page(page);
        }
        Ok(())
    }

    pub fn activate_layer(&mut self, name: &str) -> Result<(), MappingError> {
        if let Some(pages) = self.layers.set_active(name, true)? {
            log::debug!("layer '{name}' activated ({} pages)", pages.len());
            self.recompute_pages(&pages);
        }
        Ok(())
    }

    pub fn deactivate_layer(&mut self, name: &str) -> Result<(), MappingError> {
        if let Some(pages) = self.layers.set_active(name, false)? {
            log::debug!("layer '{name}' deactivated ({} pages)", pages.len());
            self.recompute_pages(&pages);
        }
        Ok(())
    }

    pub fn set_layer_permissions(
        &mut self,
        name: &str,
        perms: PagePerms,
    ) -> Result<(), MappingError> {
        let pages = self.layers.set_permissions(name, perms)?;
        self.recompute_pages(&pages);
        Ok(())
    }

    /// Every layered mapping (active or not) covering `addr`.
    pub fn get_all_mappings_at(&self, addr: Addr) -> Vec<&LayeredMapping> {
        self.layers.mappings_at(addr & self.addr_mask)
    }

    // -----------------------------
    // Swap groups
    // -----------------------------

    pub fn create_swap_group(
        &mut self,
        name: &str,
        base: Addr,
        size: u64,
    ) -> Result<SwapGroupId, SwapError> {
        self.validate_range(base, size)?;
        self.swaps.create(name, base, size)
    }

    pub fn add_swap_variant(
        &mut self,
        id: SwapGroupId,
        variant: SwapVariant,
    ) -> Result<(), SwapError> {
        self.swaps.add_variant(id, variant)
    }

    /// Atomically point the group's range at `variant`. No intermediate
    /// page state is observable: the emulation thread is the only
    /// mutator and nothing runs between the per-page rewrites.
    pub fn select_swap_variant(
        &mut self,
        id: SwapGroupId,
        variant: &str,
    ) -> Result<(), SwapError> {
        let pages = self.swaps.select(id, variant)?;
        for page in pages {
            self.recompute_page(page);
        }
        Ok(())
    }

    pub fn active_swap_variant(&self, id: SwapGroupId) -> Result<Option<&str>, SwapError> {
        Ok(self.swaps.group(id)?.active_variant().map(|v| v.name.as_str()))
    }

    pub fn swap_group_by_name(&self, name: &str) -> Option<SwapGroupId> {
        self.swaps.by_name(name)
    }

    pub fn swap_groups(&self) -> impl Iterator<Item = &SwapGroup> {
        self.swaps.iter()
    }

    // -----------------------------
    // Effective-entry recomputation
    // -----------------------------

    fn recompute_page(&mut self, page: usize) {
        let mut entry = match self.layers.top_entry_for_page(page) {
            Some(overlay) => overlay,
            None => self.base[page].clone(),
        };
        if let Some((first_page, variant)) = self.swaps.overlay_for_page(page) {
            entry.target = PageTarget::Leaf(variant.target.clone());
            entry.physical_base = variant.physical_base + (page - first_page) * PAGE_SIZE;
            entry.perms = variant.perms;
            // Device id, region tag and caps stay those of the resolved
            // entry underneath the swap.
        }
        self.effective[page] = entry;
    }

    fn recompute_range(&mut self, first: usize, count: usize) {
        for page in first..first + count {
            self.recompute_page(page);
        }
    }

    fn recompute_pages(&mut self, pages: &[usize]) {
        for &page in pages {
            self.recompute_page(page);
        }
    }

    // -----------------------------
    // Byte access
    // -----------------------------

    /// Composite dispatch seam: ask the composite for a nested leaf at
    /// this offset. `Some` delegates to the leaf directly; `None` means
    /// the composite answers through its own windows (handler-backed
    /// sub-ranges have no nested target), and offsets no window covers
    /// float inside it. Nested targets operate in the composite's
    /// offset space, so both paths use the same `physical`.
    fn resolve_composite(
        composite: &CompositeRef,
        physical: usize,
        intent: AccessIntent,
    ) -> Option<TargetRef> {
        composite.borrow().resolve_target(physical as Addr, intent)
    }

    fn denied(entry: &PageEntry, access: &BusAccess) -> Option<PermissionKind> {
        if access.intent.is_debug() {
            return None;
        }
        if access.intent.is_write() {
            if !entry.perms.contains(PagePerms::WRITE) {
                return Some(PermissionKind::NoWrite);
            }
            return None;
        }
        if !entry.perms.contains(PagePerms::READ) {
            return Some(PermissionKind::NoRead);
        }
        if access.intent == AccessIntent::InstructionFetch
            && access.mode == BusAccessMode::Atomic
            && !entry.perms.contains(PagePerms::EXECUTE)
        {
            return Some(PermissionKind::NoExecute);
        }
        None
    }

    #[inline]
    fn physical_of(entry: &PageEntry, addr: Addr) -> usize {
        entry.physical_base + ((addr as usize) & (PAGE_SIZE - 1))
    }

    /// Infallible byte read: unmapped or denied positions float.
    pub fn read8(&mut self, access: &BusAccess) -> u8 {
        let entry = &self.effective[self.page_index(access.addr)];
        if !entry.is_mapped() || Self::denied(entry, access).is_some() {
            return FLOATING_BUS;
        }
        let physical = Self::physical_of(entry, access.addr);
        match &entry.target {
            PageTarget::Leaf(target) => target.borrow_mut().read8(physical, access),
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, access.intent) {
                    Some(target) => target.borrow_mut().read8(physical, access),
                    None => composite.borrow_mut().read8(physical, access),
                }
            }
            PageTarget::Unmapped => FLOATING_BUS,
        }
    }

    /// Infallible byte write: unmapped or denied positions absorb.
    pub fn write8(&mut self, access: &BusAccess, value: u8) {
        let entry = &self.effective[self.page_index(access.addr)];
        if !entry.is_mapped() || Self::denied(entry, access).is_some() {
            return;
        }
        let physical = Self::physical_of(entry, access.addr);
        match &entry.target {
            PageTarget::Leaf(target) => target.borrow_mut().write8(physical, value, access),
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, access.intent) {
                    Some(target) => target.borrow_mut().write8(physical, value, access),
                    None => composite.borrow_mut().write8(physical, value, access),
                }
            }
            PageTarget::Unmapped => {}
        }
    }

    /// Checked byte read.
    pub fn try_read8(&mut self, access: &BusAccess) -> BusResult<u8> {
        let entry = &self.effective[self.page_index(access.addr)];
        if !entry.is_mapped() {
            return BusResult::fault(BusFault::unmapped(*access), Cycle::ZERO);
        }
        if let Some(kind) = Self::denied(entry, access) {
            return BusResult::fault(
                BusFault::permission(kind, *access, entry.device, entry.tag),
                Cycle::ZERO,
            );
        }
        let physical = Self::physical_of(entry, access.addr);
        let (value, region) = match &entry.target {
            PageTarget::Leaf(target) => (target.borrow_mut().read8(physical, access), entry.tag),
            PageTarget::Composite(composite) => {
                let value = match Self::resolve_composite(composite, physical, access.intent) {
                    Some(target) => target.borrow_mut().read8(physical, access),
                    None => composite.borrow_mut().read8(physical, access),
                };
                let region = composite.borrow().subregion_tag(physical as Addr);
                (value, region)
            }
            PageTarget::Unmapped => unreachable!("checked above"),
        };
        BusResult::success(value, entry.device, region, Cycle(1))
    }

    /// Checked byte write.
    pub fn try_write8(&mut self, access: &BusAccess, value: u8) -> BusResult<()> {
        let entry = &self.effective[self.page_index(access.addr)];
        if !entry.is_mapped() {
            return BusResult::fault(BusFault::unmapped(*access), Cycle::ZERO);
        }
        if let Some(kind) = Self::denied(entry, access) {
            return BusResult::fault(
                BusFault::permission(kind, *access, entry.device, entry.tag),
                Cycle::ZERO,
            );
        }
        let physical = Self::physical_of(entry, access.addr);
        let region = match &entry.target {
            PageTarget::Leaf(target) => {
                target.borrow_mut().write8(physical, value, access);
                entry.tag
            }
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, access.intent) {
                    Some(target) => target.borrow_mut().write8(physical, value, access),
                    None => composite.borrow_mut().write8(physical, value, access),
                }
                composite.borrow().subregion_tag(physical as Addr)
            }
            PageTarget::Unmapped => unreachable!("checked above"),
        };
        BusResult::success((), entry.device, region, Cycle(1))
    }

    // -----------------------------
    // Wide access
    // -----------------------------

    /// Apply the decomposition policy to a 16/32-bit access.
    fn should_decompose(&self, access: &BusAccess) -> bool {
        let bytes = access.width_bytes();
        if bytes <= 1 {
            return false;
        }
        let page_off = (access.addr as u64) & (PAGE_SIZE as u64 - 1);
        if page_off + bytes as u64 - 1 > PAGE_SIZE as u64 - 1 {
            return true;
        }
        if access.flags.contains(AccessFlags::FORCE_DECOMPOSE) {
            return true;
        }
        let entry = &self.effective[self.page_index(access.addr)];
        let wide = entry.is_mapped() && entry.caps.contains(TargetCaps::WIDE);
        if access.flags.contains(AccessFlags::ATOMIC_REQUESTED) && wide {
            return false;
        }
        if access.mode == BusAccessMode::Decomposed {
            return true;
        }
        !wide
    }

    fn read_wide(&mut self, access: &BusAccess) -> u32 {
        let bytes = access.width_bytes();
        if self.should_decompose(access) {
            let mut value = 0u32;
            for i in 0..bytes {
                let byte = self.read8(&access.byte_at(access.addr.wrapping_add(i)));
                value |= (byte as u32) << (8 * i);
            }
            return value;
        }
        let entry = &self.effective[self.page_index(access.addr)];
        if Self::denied(entry, access).is_some() {
            return if bytes == 2 { 0xFFFF } else { u32::MAX };
        }
        let physical = Self::physical_of(entry, access.addr);
        match &entry.target {
            PageTarget::Leaf(target) => {
                let mut guard = target.borrow_mut();
                if bytes == 2 {
                    guard.read16(physical, access) as u32
                } else {
                    guard.read32(physical, access)
                }
            }
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, access.intent) {
                    Some(target) => {
                        let mut guard = target.borrow_mut();
                        if bytes == 2 {
                            guard.read16(physical, access) as u32
                        } else {
                            guard.read32(physical, access)
                        }
                    }
                    None => {
                        let mut guard = composite.borrow_mut();
                        if bytes == 2 {
                            guard.read16(physical, access) as u32
                        } else {
                            guard.read32(physical, access)
                        }
                    }
                }
            }
            PageTarget::Unmapped => u32::MAX,
        }
    }

    fn write_wide(&mut self, access: &BusAccess, value: u32) {
        let bytes = access.width_bytes();
        if self.should_decompose(access) {
            for i in 0..bytes {
                self.write8(
                    &access.byte_at(access.addr.wrapping_add(i)),
                    (value >> (8 * i)) as u8,
                );
            }
            return;
        }
        let entry = &self.effective[self.page_index(access.addr)];
        if Self::denied(entry, access).is_some() {
            return;
        }
        let physical = Self::physical_of(entry, access.addr);
        match &entry.target {
            PageTarget::Leaf(target) => {
                let mut guard = target.borrow_mut();
                if bytes == 2 {
                    guard.write16(physical, value as u16, access);
                } else {
                    guard.write32(physical, value, access);
                }
            }
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, access.intent) {
                    Some(target) => {
                        let mut guard = target.borrow_mut();
                        if bytes == 2 {
                            guard.write16(physical, value as u16, access);
                        } else {
                            guard.write32(physical, value, access);
                        }
                    }
                    None => {
                        let mut guard = composite.borrow_mut();
                        if bytes == 2 {
                            guard.write16(physical, value as u16, access);
                        } else {
                            guard.write32(physical, value, access);
                        }
                    }
                }
            }
            PageTarget::Unmapped => {}
        }
    }

    fn try_read_wide(&mut self, access: &BusAccess) -> BusResult<u32> {
        let bytes = access.width_bytes();
        if self.should_decompose(access) {
            let mut value = 0u32;
            let mut cycles = Cycle::ZERO;
            let mut source = DeviceId::SYSTEM;
            let mut region = RegionTag::Other;
            for i in 0..bytes {
                match self.try_read8(&access.byte_at(access.addr.wrapping_add(i))) {
                    BusResult::Success {
                        value: byte,
                        source: byte_source,
                        region: byte_region,
                        cycles_charged,
                    } => {
                        if i == 0 {
                            source = byte_source;
                            region = byte_region;
                        }
                        cycles += cycles_charged;
                        value |= (byte as u32) << (8 * i);
                    }
                    BusResult::Fault {
                        fault,
                        cycles_charged,
                    } => {
                        // Bytes that completed stay charged.
                        return BusResult::fault(fault, cycles + cycles_charged);
                    }
                }
            }
            return BusResult::success(value, source, region, cycles);
        }

        let entry = &self.effective[self.page_index(access.addr)];
        if !entry.is_mapped() {
            return BusResult::fault(BusFault::unmapped(*access), Cycle::ZERO);
        }
        if let Some(kind) = Self::denied(entry, access) {
            return BusResult::fault(
                BusFault::permission(kind, *access, entry.device, entry.tag),
                Cycle::ZERO,
            );
        }
        let physical = Self::physical_of(entry, access.addr);
        let value = match &entry.target {
            PageTarget::Leaf(target) => {
                let mut guard = target.borrow_mut();
                if bytes == 2 {
                    guard.read16(physical, access) as u32
                } else {
                    guard.read32(physical, access)
                }
            }
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, access.intent) {
                    Some(target) => {
                        let mut guard = target.borrow_mut();
                        if bytes == 2 {
                            guard.read16(physical, access) as u32
                        } else {
                            guard.read32(physical, access)
                        }
                    }
                    None => {
                        let mut guard = composite.borrow_mut();
                        if bytes == 2 {
                            guard.read16(physical, access) as u32
                        } else {
                            guard.read32(physical, access)
                        }
                    }
                }
            }
            PageTarget::Unmapped => unreachable!("checked above"),
        };
        BusResult::success(value, entry.device, entry.tag, Cycle(1))
    }

    fn try_write_wide(&mut self, access: &BusAccess, value: u32) -> BusResult<()> {
        let bytes = access.width_bytes();
        if self.should_decompose(access) {
            let mut cycles = Cycle::ZERO;
            let mut source = DeviceId::SYSTEM;
            let mut region = RegionTag::Other;
            for i in 0..bytes {
                match self.try_write8(
                    &access.byte_at(access.addr.wrapping_add(i)),
                    (value >> (8 * i)) as u8,
                ) {
                    BusResult::Success {
                        source: byte_source,
                        region: byte_region,
                        cycles_charged,
                        ..
                    } => {
                        if i == 0 {
                            source = byte_source;
                            region = byte_region;
                        }
                        cycles += cycles_charged;
                    }
                    BusResult::Fault {
                        fault,
                        cycles_charged,
                    } => {
                        return BusResult::fault(fault, cycles + cycles_charged);
                    }
                }
            }
            return BusResult::success((), source, region, cycles);
        }

        let entry = &self.effective[self.page_index(access.addr)];
        if !entry.is_mapped() {
            return BusResult::fault(BusFault::unmapped(*access), Cycle::ZERO);
        }
        if let Some(kind) = Self::denied(entry, access) {
            return BusResult::fault(
                BusFault::permission(kind, *access, entry.device, entry.tag),
                Cycle::ZERO,
            );
        }
        let physical = Self::physical_of(entry, access.addr);
        match &entry.target {
            PageTarget::Leaf(target) => {
                let mut guard = target.borrow_mut();
                if bytes == 2 {
                    guard.write16(physical, value as u16, access);
                } else {
                    guard.write32(physical, value, access);
                }
            }
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, access.intent) {
                    Some(target) => {
                        let mut guard = target.borrow_mut();
                        if bytes == 2 {
                            guard.write16(physical, value as u16, access);
                        } else {
                            guard.write32(physical, value, access);
                        }
                    }
                    None => {
                        let mut guard = composite.borrow_mut();
                        if bytes == 2 {
                            guard.write16(physical, value as u16, access);
                        } else {
                            guard.write32(physical, value, access);
                        }
                    }
                }
            }
            PageTarget::Unmapped => unreachable!("checked above"),
        }
        BusResult::success((), entry.device, entry.tag, Cycle(1))
    }

    #[inline]
    pub fn read16(&mut self, access: &BusAccess) -> u16 {
        self.read_wide(&access.with_width(16)) as u16
    }

    #[inline]
    pub fn write16(&mut self, access: &BusAccess, value: u16) {
        self.write_wide(&access.with_width(16), value as u32);
    }

    #[inline]
    pub fn read32(&mut self, access: &BusAccess) -> u32 {
        self.read_wide(&access.with_width(32))
    }

    #[inline]
    pub fn write32(&mut self, access: &BusAccess, value: u32) {
        self.write_wide(&access.with_width(32), value);
    }

    pub fn try_read16(&mut self, access: &BusAccess) -> BusResult<u16> {
        match self.try_read_wide(&access.with_width(16)) {
            BusResult::Success {
                value,
                source,
                region,
                cycles_charged,
            } => BusResult::success(value as u16, source, region, cycles_charged),
            BusResult::Fault {
                fault,
                cycles_charged,
            } => BusResult::fault(fault, cycles_charged),
        }
    }

    #[inline]
    pub fn try_write16(&mut self, access: &BusAccess, value: u16) -> BusResult<()> {
        self.try_write_wide(&access.with_width(16), value as u32)
    }

    #[inline]
    pub fn try_read32(&mut self, access: &BusAccess) -> BusResult<u32> {
        self.try_read_wide(&access.with_width(32))
    }

    #[inline]
    pub fn try_write32(&mut self, access: &BusAccess, value: u32) -> BusResult<()> {
        self.try_write_wide(&access.with_width(32), value)
    }

    // -----------------------------
    // Debugger surface
    // -----------------------------

    /// Side-effect-free read; `None` when the page (or its target) does
    /// not support peeking.
    pub fn peek8(&self, addr: Addr) -> Option<u8> {
        let entry = &self.effective[self.page_index(addr)];
        let physical = Self::physical_of(entry, addr);
        match &entry.target {
            PageTarget::Leaf(target) => target.borrow().peek8(physical),
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, AccessIntent::DebugRead) {
                    Some(target) => target.borrow().peek8(physical),
                    None => composite.borrow().peek8(physical),
                }
            }
            PageTarget::Unmapped => None,
        }
    }

    /// Side-effect-free write; reports whether the byte landed.
    pub fn poke8(&mut self, addr: Addr, value: u8) -> bool {
        let entry = &self.effective[self.page_index(addr)];
        let physical = Self::physical_of(entry, addr);
        match &entry.target {
            PageTarget::Leaf(target) => target.borrow_mut().poke8(physical, value),
            PageTarget::Composite(composite) => {
                match Self::resolve_composite(composite, physical, AccessIntent::DebugWrite) {
                    Some(target) => target.borrow_mut().poke8(physical, value),
                    None => composite.borrow_mut().poke8(physical, value),
                }
            }
            PageTarget::Unmapped => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fault::FaultKind;
    use crate::bus::layers::LayeredMapping;
    use crate::bus::swap::SwapVariant;
    use crate::bus::target::{BusTarget, RamTarget, RomTarget, target_ref};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ram_entry(target: TargetRef) -> PageEntry {
        PageEntry::new(
            DeviceId(1),
            RegionTag::Ram,
            PagePerms::RWX,
            TargetCaps::PEEK | TargetCaps::POKE | TargetCaps::WIDE,
            PageTarget::Leaf(target),
            0,
        )
    }

    fn bus16_with_ram() -> MainBus {
        let mut bus = MainBus::new(16).expect("bus");
        let ram = target_ref(RamTarget::new(0x10000));
        bus.map_region(0x0000, 0x10000, ram_entry(ram)).expect("map");
        bus
    }

    #[test]
    fn width_validation() {
        assert!(matches!(MainBus::new(8), Err(MappingError::WidthOutOfRange(8))));
        assert!(matches!(MainBus::new(33), Err(MappingError::WidthOutOfRange(33))));
        assert_eq!(MainBus::new(16).expect("bus").page_count(), 16);
        assert_eq!(MainBus::new(12).expect("bus").page_count(), 1);
    }

    #[test]
    fn alignment_validation() {
        let mut bus = MainBus::new(16).expect("bus");
        let ram = target_ref(RamTarget::new(0x2000));
        assert!(matches!(
            bus.map_region(0x0800, 0x1000, ram_entry(ram.clone())),
            Err(MappingError::UnalignedBase(0x0800))
        ));
        assert!(matches!(
            bus.map_region(0x0000, 0x0800, ram_entry(ram.clone())),
            Err(MappingError::UnalignedSize(0x0800))
        ));
        assert!(matches!(
            bus.map_region(0xF000, 0x2000, ram_entry(ram)),
            Err(MappingError::RangeOutOfBounds { .. })
        ));
    }

    #[test]
    fn whole_page_shares_one_entry() {
        let bus = bus16_with_ram();
        let entry = bus.get_page_entry(0x3000);
        for addr in [0x3000u32, 0x3001, 0x37FF, 0x3FFF] {
            let other = bus.get_page_entry(addr);
            assert_eq!(other.physical_base, entry.physical_base);
            assert_eq!(other.tag, entry.tag);
        }
        assert_ne!(bus.get_page_entry(0x4000).physical_base, entry.physical_base);
    }

    #[test]
    fn ram_round_trip() {
        let mut bus = bus16_with_ram();
        for value in [0x00u8, 0x5A, 0xFF] {
            bus.write8(&BusAccess::data_write(0x1234), value);
            assert_eq!(bus.read8(&BusAccess::data_read(0x1234)), value);
        }
    }

    #[test]
    fn unmapped_floats_and_faults() {
        let mut bus = MainBus::new(16).expect("bus");
        assert_eq!(bus.read8(&BusAccess::data_read(0x8000)), FLOATING_BUS);
        bus.write8(&BusAccess::data_write(0x8000), 0x12);

        let result = bus.try_read8(&BusAccess::data_read(0x8000));
        let fault = result.fault_ref().expect("fault");
        assert_eq!(fault.kind, FaultKind::Unmapped);
        assert_eq!(result.cycles_charged(), Cycle::ZERO);
    }

    #[test]
    fn permission_enforcement_and_debug_bypass() {
        let mut bus = MainBus::new(16).expect("bus");
        let rom = target_ref(RomTarget::writable(vec![0xCC; 0x1000]));
        bus.map_region(
            0xD000,
            0x1000,
            PageEntry::new(
                DeviceId(2),
                RegionTag::Rom,
                PagePerms::RX,
                TargetCaps::PEEK | TargetCaps::WIDE,
                PageTarget::Leaf(rom),
                0,
            ),
        )
        .expect("map");

        // Normal write denied at the bus; ROM content unchanged.
        let denied = bus.try_write8(&BusAccess::data_write(0xD100), 0x00);
        assert_eq!(
            denied.fault_ref().expect("fault").kind,
            FaultKind::PermissionDenied(PermissionKind::NoWrite)
        );
        assert_eq!(bus.read8(&BusAccess::data_read(0xD100)), 0xCC);

        // Debug write bypasses the check and lands (mutable backing).
        let patched = bus.try_write8(&BusAccess::debug_write(0xD100), 0x42);
        assert!(patched.is_success());
        assert_eq!(bus.read8(&BusAccess::data_read(0xD100)), 0x42);
    }

    #[test]
    fn execute_permission_applies_to_atomic_fetch_only() {
        let mut bus = MainBus::new(16).expect("bus");
        let ram = target_ref(RamTarget::new(0x1000));
        bus.map_region(
            0x2000,
            0x1000,
            PageEntry::new(
                DeviceId(1),
                RegionTag::Ram,
                PagePerms::RW,
                TargetCaps::WIDE,
                PageTarget::Leaf(ram),
                0,
            ),
        )
        .expect("map");

        let fetch = BusAccess::fetch(0x2000);
        assert_eq!(
            bus.try_read8(&fetch).fault_ref().expect("fault").kind,
            FaultKind::PermissionDenied(PermissionKind::NoExecute)
        );
        // Decomposed-mode fetch skips the execute check.
        let decomposed = fetch.with_mode(BusAccessMode::Decomposed);
        assert!(bus.try_read8(&decomposed).is_success());
        // Plain data read is fine.
        assert!(bus.try_read8(&BusAccess::data_read(0x2000)).is_success());
    }

    #[test]
    fn wide_native_vs_decomposed_equivalence() {
        let mut bus = bus16_with_ram();
        bus.write8(&BusAccess::data_write(0x1000), 0xAA);
        bus.write8(&BusAccess::data_write(0x1001), 0xBB);

        let atomic = bus.read16(&BusAccess::data_read(0x1000));
        let decomposed =
            bus.read16(&BusAccess::data_read(0x1000).with_mode(BusAccessMode::Decomposed));
        assert_eq!(atomic, 0xBBAA);
        assert_eq!(atomic, decomposed);

        bus.write16(
            &BusAccess::data_write(0x1000).with_mode(BusAccessMode::Decomposed),
            0x1122,
        );
        assert_eq!(bus.read16(&BusAccess::data_read(0x1000)), 0x1122);
    }

    /// Records every byte access it answers, to observe decomposition.
    struct Recorder {
        log: Rc<RefCell<Vec<usize>>>,
        data: Vec<u8>,
    }

    impl BusTarget for Recorder {
        fn caps(&self) -> TargetCaps {
            TargetCaps::WIDE
        }
        fn read8(&mut self, physical: usize, _access: &BusAccess) -> u8 {
            self.log.borrow_mut().push(physical);
            self.data.get(physical).copied().unwrap_or(FLOATING_BUS)
        }
        fn write8(&mut self, physical: usize, value: u8, _access: &BusAccess) {
            self.log.borrow_mut().push(physical);
            if let Some(slot) = self.data.get_mut(physical) {
                *slot = value;
            }
        }
    }

    #[test]
    fn cross_page_wide_always_decomposes() {
        let mut bus = MainBus::new(16).expect("bus");
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut data = vec![0u8; 0x2000];
        data[0x0FFF] = 0xAA;
        data[0x1000] = 0xBB;
        let recorder = target_ref(Recorder {
            log: log.clone(),
            data,
        });
        bus.map_region(0x1000, 0x2000, ram_entry(recorder)).expect("map");

        // 0x1FFF is the last byte of its page.
        let value = bus.read16(&BusAccess::data_read(0x1FFF));
        assert_eq!(value, 0xBBAA);
        // Two byte reads, in address order, despite Atomic mode + WIDE.
        assert_eq!(*log.borrow(), vec![0x0FFF, 0x1000]);
    }

    #[test]
    fn force_decompose_flag_overrides_native() {
        let mut bus = MainBus::new(16).expect("bus");
        let log = Rc::new(RefCell::new(Vec::new()));
        let recorder = target_ref(Recorder {
            log: log.clone(),
            data: vec![0x11; 0x1000],
        });
        bus.map_region(0x3000, 0x1000, ram_entry(recorder)).expect("map");

        let access = BusAccess::data_read(0x3000)
            .with_flags(AccessFlags::FORCE_DECOMPOSE);
        let _ = bus.read16(&access);
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn non_wide_target_decomposes() {
        struct ByteOnly;
        impl BusTarget for ByteOnly {
            fn caps(&self) -> TargetCaps {
                TargetCaps::empty()
            }
            fn read8(&mut self, physical: usize, _access: &BusAccess) -> u8 {
                physical as u8
            }
            fn write8(&mut self, _physical: usize, _value: u8, _access: &BusAccess) {}
        }
        let mut bus = MainBus::new(16).expect("bus");
        bus.map_region(
            0x5000,
            0x1000,
            PageEntry::new(
                DeviceId(1),
                RegionTag::Io,
                PagePerms::RW,
                TargetCaps::empty(),
                PageTarget::Leaf(target_ref(ByteOnly)),
                0,
            ),
        )
        .expect("map");
        assert_eq!(bus.read16(&BusAccess::data_read(0x5010)), 0x1110);
    }

    #[test]
    fn decomposed_fault_charges_completed_bytes() {
        // RAM page at 0x1000, nothing at 0x2000: a 16-bit read at
        // 0x1FFF completes one byte then faults, charging one cycle.
        let mut bus = MainBus::new(16).expect("bus");
        let ram = target_ref(RamTarget::new(0x1000));
        bus.map_region(0x1000, 0x1000, ram_entry(ram)).expect("map");
        bus.write8(&BusAccess::data_write(0x1FFF), 0x77);

        let result = bus.try_read16(&BusAccess::data_read(0x1FFF));
        match result {
            BusResult::Fault {
                fault,
                cycles_charged,
            } => {
                assert_eq!(fault.kind, FaultKind::Unmapped);
                assert_eq!(fault.access.addr, 0x2000);
                assert_eq!(cycles_charged, Cycle(1));
            }
            BusResult::Success { .. } => panic!("expected fault"),
        }
    }

    #[test]
    fn remap_page_switches_backing() {
        let mut bus = MainBus::new(16).expect("bus");
        let a = target_ref(RamTarget::filled(0x1000, 0xAA));
        let b = target_ref(RamTarget::filled(0x1000, 0xBB));
        bus.map_region(0x4000, 0x1000, ram_entry(a)).expect("map");
        assert_eq!(bus.read8(&BusAccess::data_read(0x4000)), 0xAA);
        bus.remap_page_target(4, PageTarget::Leaf(b), 0).expect("remap");
        assert_eq!(bus.read8(&BusAccess::data_read(0x4000)), 0xBB);
        assert!(matches!(
            bus.remap_page(100, PageEntry::unmapped()),
            Err(MappingError::InvalidPageIndex(100))
        ));
    }

    #[test]
    fn layer_priority_shadows_and_restores() {
        let mut bus = bus16_with_ram();
        bus.write8(&BusAccess::data_write(0xA123), 0x01);

        let hi = target_ref(RamTarget::filled(0x1000, 0x22));
        let lo = target_ref(RamTarget::filled(0x1000, 0x33));
        bus.add_layer("hi", 10).expect("layer");
        bus.add_layer("lo", 1).expect("layer");
        for (layer, target) in [("hi", hi), ("lo", lo)] {
            bus.add_layered_mapping(LayeredMapping {
                virtual_base: 0xA000,
                size: 0x1000,
                layer: layer.into(),
                device: DeviceId(9),
                tag: RegionTag::Ram,
                perms: PagePerms::RW,
                caps: TargetCaps::WIDE,
                target: PageTarget::Leaf(target),
                physical_base: 0,
            })
            .expect("mapping");
        }
        bus.activate_layer("hi").expect("activate");
        bus.activate_layer("lo").expect("activate");
        assert_eq!(bus.read8(&BusAccess::data_read(0xA123)), 0x22);

        bus.deactivate_layer("hi").expect("deactivate");
        assert_eq!(bus.read8(&BusAccess::data_read(0xA123)), 0x33);

        bus.deactivate_layer("lo").expect("deactivate");
        assert_eq!(bus.read8(&BusAccess::data_read(0xA123)), 0x01);

        assert_eq!(bus.get_all_mappings_at(0xA123).len(), 2);
    }

    #[test]
    fn swap_variants_rewrite_atomically() {
        let mut bus = bus16_with_ram();
        bus.write8(&BusAccess::data_write(0xC000), 0x77); // outside group

        let group = bus.create_swap_group("lc", 0xD000, 0x1000).expect("group");
        for (name, fill) in [("bank1", 0xAA), ("bank2", 0x55), ("rom", 0xCC)] {
            bus.add_swap_variant(
                group,
                SwapVariant {
                    name: name.into(),
                    target: target_ref(RamTarget::filled(0x1000, fill)),
                    physical_base: 0,
                    perms: PagePerms::RW,
                },
            )
            .expect("variant");
        }

        bus.select_swap_variant(group, "bank1").expect("select");
        assert_eq!(bus.read8(&BusAccess::data_read(0xD500)), 0xAA);
        bus.select_swap_variant(group, "bank2").expect("select");
        assert_eq!(bus.read8(&BusAccess::data_read(0xD500)), 0x55);
        bus.select_swap_variant(group, "rom").expect("select");
        assert_eq!(bus.read8(&BusAccess::data_read(0xD500)), 0xCC);
        assert_eq!(bus.active_swap_variant(group).expect("group"), Some("rom"));

        // Reads outside the group's range are untouched throughout.
        assert_eq!(bus.read8(&BusAccess::data_read(0xC000)), 0x77);
        assert!(bus.select_swap_variant(group, "bank9").is_err());
    }

    #[test]
    fn swap_preserves_identity_overrides_perms() {
        let mut bus = bus16_with_ram();
        let group = bus.create_swap_group("lc", 0xD000, 0x1000).expect("group");
        bus.add_swap_variant(
            group,
            SwapVariant {
                name: "ro".into(),
                target: target_ref(RamTarget::filled(0x1000, 0x99)),
                physical_base: 0,
                perms: PagePerms::READ,
            },
        )
        .expect("variant");
        bus.select_swap_variant(group, "ro").expect("select");

        let entry = bus.get_page_entry(0xD000);
        // Identity bits come from the resolved entry underneath.
        assert_eq!(entry.device, DeviceId(1));
        assert_eq!(entry.tag, RegionTag::Ram);
        // Perms come from the variant.
        assert_eq!(entry.perms, PagePerms::READ);
        assert!(bus
            .try_write8(&BusAccess::data_write(0xD000), 0x00)
            .is_fault());
    }

    #[test]
    fn composite_dispatch_resolves_nested_targets_first() {
        use crate::bus::composite::{IoPage, composite_ref};
        use crate::device::SlotManager;

        let mut bus = MainBus::new(16).expect("bus");
        let mut io = IoPage::new(SlotManager::shared());
        io.register_read_handler(0x30, Box::new(|_, _| 0x5A));
        io.add_subrange(
            0x700,
            0x100,
            RegionTag::Ram,
            "aux",
            target_ref(RamTarget::filled(0x800, 0x42)),
        );
        bus.map_region(
            0xC000,
            0x1000,
            PageEntry::new(
                DeviceId(4),
                RegionTag::Composite,
                PagePerms::RW,
                TargetCaps::SIDE_EFFECTS,
                PageTarget::Composite(composite_ref(io)),
                0,
            ),
        )
        .expect("map");

        // A mounted sub-range resolves to its leaf and answers directly.
        assert_eq!(bus.read8(&BusAccess::data_read(0xC710)), 0x42);
        bus.write8(&BusAccess::data_write(0xC711), 0x24);
        assert_eq!(bus.read8(&BusAccess::data_read(0xC711)), 0x24);

        // Unresolved offsets fall through to the composite's windows.
        assert_eq!(bus.read8(&BusAccess::data_read(0xC030)), 0x5A);
        assert_eq!(bus.read8(&BusAccess::data_read(0xC040)), FLOATING_BUS);

        // The region tag still comes from the composite either way.
        match bus.try_read8(&BusAccess::data_read(0xC710)) {
            BusResult::Success { region, .. } => assert_eq!(region, RegionTag::Ram),
            BusResult::Fault { .. } => panic!("expected success"),
        }
        match bus.try_read8(&BusAccess::data_read(0xC030)) {
            BusResult::Success { region, .. } => assert_eq!(region, RegionTag::Io),
            BusResult::Fault { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn peek_and_poke_route_to_targets() {
        let mut bus = bus16_with_ram();
        bus.write8(&BusAccess::data_write(0x6000), 0x42);
        assert_eq!(bus.peek8(0x6000), Some(0x42));
        assert!(bus.poke8(0x6001, 0x24));
        assert_eq!(bus.read8(&BusAccess::data_read(0x6001)), 0x24);

        let empty = MainBus::new(16).expect("bus");
        assert_eq!(empty.peek8(0x6000), None);
    }
}
