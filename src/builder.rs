/*!
Machine builder: staged configuration, fixed-order assembly.

The builder collects everything a machine is made of (address-space
width, CPU factory, physical memory blocks, ROM images, regions, layers,
swap groups, device and slot-card factories, lifecycle hooks) and
`build()` assembles them in a fixed order:

1. core subsystems (scheduler, signal bus, device registry, empty bus,
   slot manager, trap registry);
2. physical blocks (with ROM images pre-loaded), declared RAM and
   composite regions, then user memory-configuration callbacks, in
   registration order;
3. ROM regions, layers, layered mappings, swap groups (all layers still
   inactive, no swap variant selected);
4. the CPU, via the injected factory;
5. machine assembly and motherboard device instantiation;
6. device initialization (bracketed by hooks);
7. soft-switch handler registration on the I/O page (bracketed);
8. pending slot-card installation (bracketed);
9. activation of every declared layer, then the `after_build` hooks.

Configuration problems are fatal at `build()` and come back as
`BuildError`.
*/

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

use crate::bus::{
    IoPage, LayeredMapping, MainBus, MappingError, PageEntry, PageTarget, RamTarget, RomTarget,
    SwapError, SwapVariant,
};
use crate::context::{ComponentBucket, EventContext};
use crate::cpu::{CpuFactory, CpuKind};
use crate::device::{Device, DeviceRegistry, SlotCard, SlotError, SlotManager};
use crate::machine::Machine;
use crate::scheduler::Scheduler;
use crate::signals::SignalBus;
use crate::traps::TrapRegistry;
use crate::types::{Addr, DeviceId, PagePerms, RegionTag, TargetCaps};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no CPU factory configured")]
    MissingCpuFactory,
    #[error("duplicate physical memory block '{0}'")]
    DuplicatePhysicalBlock(String),
    #[error("unknown physical memory block '{0}'")]
    UnknownPhysicalBlock(String),
    #[error("unknown ROM image '{0}'")]
    UnknownRomImage(String),
    #[error("ROM image '{image}' too small: region needs {needed:#x} bytes from offset {offset:#x}")]
    RomImageTooSmall {
        image: String,
        offset: usize,
        needed: u64,
    },
    #[error("ROM image '{image}' does not fit block '{block}' at offset {offset:#x}")]
    RomImageOverflow {
        image: String,
        block: String,
        offset: usize,
    },
    #[error("failed to read ROM image '{name}': {source}")]
    RomLoad {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("region '{0}' needs a source")]
    RegionSourceMissing(String),
    #[error("unknown motherboard device type '{0}'")]
    UnknownDeviceType(String),
    #[error("unknown slot card type '{0}'")]
    UnknownCardType(String),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// Creates a motherboard device once its id has been issued.
pub type DeviceFactory = Box<dyn Fn(DeviceId) -> Box<dyn Device>>;
/// Creates a slot card once its owning device id has been issued.
pub type CardFactory = Box<dyn Fn(DeviceId) -> SlotCard>;
/// Step-2 callback operating directly on the fresh bus.
pub type MemoryConfigHook = Box<dyn FnOnce(&mut MainBus) -> Result<(), BuildError>>;
/// Lifecycle hook bracketing a build phase.
pub type LifecycleHook = Box<dyn FnMut(&mut Machine)>;

/// Work queued for the slot-card installation phase.
pub enum PendingInstall {
    Slot(u8, String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Ram,
    Rom,
    Composite,
}

struct RegionSpec {
    name: String,
    kind: RegionKind,
    start: Addr,
    size: u64,
    perms: PagePerms,
    source: Option<String>,
    source_offset: usize,
}

struct BlockSpec {
    name: String,
    size: usize,
    fill: u8,
    sources: Vec<(String, usize)>,
}

struct LayeredSpec {
    layer: String,
    virtual_base: Addr,
    size: u64,
    perms: PagePerms,
    tag: RegionTag,
    block: String,
    block_offset: usize,
}

struct SwapVariantSpec {
    group: String,
    name: String,
    block: String,
    physical_base: usize,
    perms: PagePerms,
}

struct SwapGroupSpec {
    name: String,
    base: Addr,
    size: u64,
}

struct MotherboardSpec {
    kind: String,
    name: String,
    enabled: bool,
}

#[derive(Default)]
struct Hooks {
    before_device_init: Vec<LifecycleHook>,
    after_device_init: Vec<LifecycleHook>,
    before_soft_switch_registration: Vec<LifecycleHook>,
    after_soft_switch_registration: Vec<LifecycleHook>,
    before_slot_card_install: Vec<LifecycleHook>,
    after_slot_card_install: Vec<LifecycleHook>,
    after_build: Vec<LifecycleHook>,
}

pub struct MachineBuilder {
    width_bits: u8,
    cpu_kind: Option<CpuKind>,
    cpu_factory: Option<CpuFactory>,
    rom_images: HashMap<String, Vec<u8>>,
    blocks: Vec<BlockSpec>,
    regions: Vec<RegionSpec>,
    layers: Vec<(String, i32)>,
    layered: Vec<LayeredSpec>,
    swap_groups: Vec<SwapGroupSpec>,
    swap_variants: Vec<SwapVariantSpec>,
    memory_hooks: Vec<MemoryConfigHook>,
    device_factories: HashMap<String, DeviceFactory>,
    card_factories: HashMap<String, CardFactory>,
    motherboard: Vec<MotherboardSpec>,
    pending_installs: Vec<PendingInstall>,
    hooks: Hooks,
}

impl MachineBuilder {
    pub fn new(width_bits: u8) -> MachineBuilder {
        MachineBuilder {
            width_bits,
            cpu_kind: None,
            cpu_factory: None,
            rom_images: HashMap::new(),
            blocks: Vec::new(),
            regions: Vec::new(),
            layers: Vec::new(),
            layered: Vec::new(),
            swap_groups: Vec::new(),
            swap_variants: Vec::new(),
            memory_hooks: Vec::new(),
            device_factories: HashMap::new(),
            card_factories: HashMap::new(),
            motherboard: Vec::new(),
            pending_installs: Vec::new(),
            hooks: Hooks::default(),
        }
    }

    // -----------------------------
    // CPU
    // -----------------------------

    /// Record which processor family the machine is meant to carry.
    /// Informational; the factory decides what actually gets built.
    pub fn cpu_kind(mut self, kind: CpuKind) -> Self {
        self.cpu_kind = Some(kind);
        self
    }

    pub fn configured_cpu_kind(&self) -> Option<CpuKind> {
        self.cpu_kind
    }

    pub fn cpu_factory(mut self, factory: CpuFactory) -> Self {
        self.cpu_factory = Some(factory);
        self
    }

    // -----------------------------
    // Memory
    // -----------------------------

    /// Register a named ROM image (opaque bytes).
    pub fn rom_image(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.rom_images.insert(name.into(), bytes);
        self
    }

    /// Register a named ROM image read from `path`.
    pub fn rom_image_from_file(
        self,
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self, BuildError> {
        let name = name.into();
        let bytes = std::fs::read(path.as_ref()).map_err(|source| BuildError::RomLoad {
            name: name.clone(),
            source,
        })?;
        Ok(self.rom_image(name, bytes))
    }

    /// Declare a named physical memory block.
    pub fn physical_block(mut self, name: impl Into<String>, size: usize, fill: u8) -> Self {
        self.blocks.push(BlockSpec {
            name: name.into(),
            size,
            fill,
            sources: Vec::new(),
        });
        self
    }

    /// Pre-load a ROM image into a declared block at `offset`.
    pub fn load_rom_into_block(
        mut self,
        block: impl Into<String>,
        image: impl Into<String>,
        offset: usize,
    ) -> Self {
        let block = block.into();
        if let Some(spec) = self.blocks.iter_mut().find(|b| b.name == block) {
            spec.sources.push((image.into(), offset));
        } else {
            // Unknown block: keep the request, fail with a proper error
            // at build time.
            self.blocks.push(BlockSpec {
                name: block,
                size: 0,
                fill: 0,
                sources: vec![(image.into(), offset)],
            });
        }
        self
    }

    /// Declare a RAM region. `block` of `None` backs the region with an
    /// anonymous zero-filled buffer of its own size.
    pub fn ram_region(
        mut self,
        name: impl Into<String>,
        start: Addr,
        size: u64,
        perms: PagePerms,
        block: Option<String>,
        block_offset: usize,
    ) -> Self {
        self.regions.push(RegionSpec {
            name: name.into(),
            kind: RegionKind::Ram,
            start,
            size,
            perms,
            source: block,
            source_offset: block_offset,
        });
        self
    }

    /// Declare a ROM region backed by a slice of a registered image.
    pub fn rom_region(
        mut self,
        name: impl Into<String>,
        start: Addr,
        size: u64,
        perms: PagePerms,
        image: impl Into<String>,
        source_offset: usize,
    ) -> Self {
        self.regions.push(RegionSpec {
            name: name.into(),
            kind: RegionKind::Rom,
            start,
            size,
            perms,
            source: Some(image.into()),
            source_offset,
        });
        self
    }

    /// Declare the composite I/O page (soft switches + slot ROM +
    /// expansion ROM) at `start`.
    pub fn composite_io_region(mut self, name: impl Into<String>, start: Addr) -> Self {
        self.regions.push(RegionSpec {
            name: name.into(),
            kind: RegionKind::Composite,
            start,
            size: crate::bus::PAGE_SIZE as u64,
            perms: PagePerms::RW,
            source: None,
            source_offset: 0,
        });
        self
    }

    /// Arbitrary step-2 configuration against the fresh bus.
    pub fn memory_config(
        mut self,
        hook: impl FnOnce(&mut MainBus) -> Result<(), BuildError> + 'static,
    ) -> Self {
        self.memory_hooks.push(Box::new(hook));
        self
    }

    // -----------------------------
    // Layers and swap groups
    // -----------------------------

    pub fn layer(mut self, name: impl Into<String>, priority: i32) -> Self {
        self.layers.push((name.into(), priority));
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn layered_region(
        mut self,
        layer: impl Into<String>,
        virtual_base: Addr,
        size: u64,
        perms: PagePerms,
        tag: RegionTag,
        block: impl Into<String>,
        block_offset: usize,
    ) -> Self {
        self.layered.push(LayeredSpec {
            layer: layer.into(),
            virtual_base,
            size,
            perms,
            tag,
            block: block.into(),
            block_offset,
        });
        self
    }

    pub fn swap_group(mut self, name: impl Into<String>, base: Addr, size: u64) -> Self {
        self.swap_groups.push(SwapGroupSpec {
            name: name.into(),
            base,
            size,
        });
        self
    }

    pub fn swap_variant(
        mut self,
        group: impl Into<String>,
        name: impl Into<String>,
        block: impl Into<String>,
        physical_base: usize,
        perms: PagePerms,
    ) -> Self {
        self.swap_variants.push(SwapVariantSpec {
            group: group.into(),
            name: name.into(),
            block: block.into(),
            physical_base,
            perms,
        });
        self
    }

    // -----------------------------
    // Devices and slot cards
    // -----------------------------

    pub fn register_device_type(
        mut self,
        type_id: impl Into<String>,
        factory: DeviceFactory,
    ) -> Self {
        self.device_factories.insert(type_id.into(), factory);
        self
    }

    pub fn register_card_type(mut self, type_id: impl Into<String>, factory: CardFactory) -> Self {
        self.card_factories.insert(type_id.into(), factory);
        self
    }

    pub fn motherboard_device(
        mut self,
        type_id: impl Into<String>,
        name: impl Into<String>,
        enabled: bool,
    ) -> Self {
        self.motherboard.push(MotherboardSpec {
            kind: type_id.into(),
            name: name.into(),
            enabled,
        });
        self
    }

    pub fn slot_card(mut self, slot: u8, type_id: impl Into<String>) -> Self {
        self.pending_installs
            .push(PendingInstall::Slot(slot, type_id.into()));
        self
    }

    // -----------------------------
    // Lifecycle hooks
    // -----------------------------

    pub fn before_device_init(mut self, hook: impl FnMut(&mut Machine) + 'static) -> Self {
        self.hooks.before_device_init.push(Box::new(hook));
        self
    }

    pub fn after_device_init(mut self, hook: impl FnMut(&mut Machine) + 'static) -> Self {
        self.hooks.after_device_init.push(Box::new(hook));
        self
    }

    pub fn before_soft_switch_handler_registration(
        mut self,
        hook: impl FnMut(&mut Machine) + 'static,
    ) -> Self {
        self.hooks
            .before_soft_switch_registration
            .push(Box::new(hook));
        self
    }

    pub fn after_soft_switch_handler_registration(
        mut self,
        hook: impl FnMut(&mut Machine) + 'static,
    ) -> Self {
        self.hooks
            .after_soft_switch_registration
            .push(Box::new(hook));
        self
    }

    pub fn before_slot_card_install(mut self, hook: impl FnMut(&mut Machine) + 'static) -> Self {
        self.hooks.before_slot_card_install.push(Box::new(hook));
        self
    }

    pub fn after_slot_card_install(mut self, hook: impl FnMut(&mut Machine) + 'static) -> Self {
        self.hooks.after_slot_card_install.push(Box::new(hook));
        self
    }

    pub fn after_build(mut self, hook: impl FnMut(&mut Machine) + 'static) -> Self {
        self.hooks.after_build.push(Box::new(hook));
        self
    }

    // -----------------------------
    // Assembly
    // -----------------------------

    pub fn build(self) -> Result<Machine, BuildError> {
        let MachineBuilder {
            width_bits,
            cpu_kind: _,
            cpu_factory,
            rom_images,
            blocks: block_specs,
            regions,
            layers,
            layered,
            swap_groups,
            swap_variants,
            memory_hooks,
            device_factories,
            card_factories,
            motherboard,
            pending_installs,
            mut hooks,
        } = self;

        // 1. Core subsystems.
        let scheduler = Scheduler::new();
        let mut signals = SignalBus::new();
        let mut device_registry = DeviceRegistry::new();
        let mut bus = MainBus::new(width_bits)?;
        let slots = SlotManager::shared();
        let mut traps = TrapRegistry::new();
        traps.set_slot_manager(slots.clone());

        // 2. Physical blocks, declared RAM/composite regions, user
        // memory callbacks.
        let mut blocks: HashMap<String, Rc<RefCell<RamTarget>>> = HashMap::new();
        for spec in &block_specs {
            if blocks.contains_key(&spec.name) {
                return Err(BuildError::DuplicatePhysicalBlock(spec.name.clone()));
            }
            let mut ram = RamTarget::filled(spec.size, spec.fill);
            for (image, offset) in &spec.sources {
                let bytes = rom_images
                    .get(image)
                    .ok_or_else(|| BuildError::UnknownRomImage(image.clone()))?;
                if offset + bytes.len() > spec.size {
                    return Err(BuildError::RomImageOverflow {
                        image: image.clone(),
                        block: spec.name.clone(),
                        offset: *offset,
                    });
                }
                ram.load(*offset, bytes);
            }
            blocks.insert(spec.name.clone(), Rc::new(RefCell::new(ram)));
        }

        let mut io_page: Option<Rc<RefCell<IoPage>>> = None;
        for region in regions.iter().filter(|r| r.kind != RegionKind::Rom) {
            match region.kind {
                RegionKind::Ram => {
                    let (target, physical_base): (crate::bus::TargetRef, usize) =
                        match &region.source {
                            Some(block) => {
                                let target = blocks.get(block).ok_or_else(|| {
                                    BuildError::UnknownPhysicalBlock(block.clone())
                                })?;
                                (target.clone(), region.source_offset)
                            }
                            None => (
                                Rc::new(RefCell::new(RamTarget::new(region.size as usize))),
                                0,
                            ),
                        };
                    bus.map_region(
                        region.start,
                        region.size,
                        PageEntry::new(
                            DeviceId::SYSTEM,
                            RegionTag::Ram,
                            region.perms,
                            TargetCaps::PEEK | TargetCaps::POKE | TargetCaps::WIDE,
                            PageTarget::Leaf(target),
                            physical_base,
                        ),
                    )?;
                }
                RegionKind::Composite => {
                    let page = Rc::new(RefCell::new(IoPage::new(slots.clone())));
                    bus.map_region(
                        region.start,
                        region.size,
                        PageEntry::new(
                            DeviceId::SYSTEM,
                            RegionTag::Composite,
                            region.perms,
                            TargetCaps::SIDE_EFFECTS,
                            PageTarget::Composite(page.clone()),
                            0,
                        ),
                    )?;
                    if io_page.is_none() {
                        io_page = Some(page);
                    }
                }
                RegionKind::Rom => unreachable!("filtered"),
            }
        }
        for hook in memory_hooks {
            hook(&mut bus)?;
        }

        // 3. ROM regions, layers, layered mappings, swap groups.
        for region in regions.iter().filter(|r| r.kind == RegionKind::Rom) {
            let image_name = region
                .source
                .as_ref()
                .ok_or_else(|| BuildError::RegionSourceMissing(region.name.clone()))?;
            let image = rom_images
                .get(image_name)
                .ok_or_else(|| BuildError::UnknownRomImage(image_name.clone()))?;
            let end = region.source_offset + region.size as usize;
            if image.len() < end {
                return Err(BuildError::RomImageTooSmall {
                    image: image_name.clone(),
                    offset: region.source_offset,
                    needed: region.size,
                });
            }
            let rom = RomTarget::new(image[region.source_offset..end].to_vec());
            bus.map_region(
                region.start,
                region.size,
                PageEntry::new(
                    DeviceId::SYSTEM,
                    RegionTag::Rom,
                    region.perms,
                    TargetCaps::PEEK | TargetCaps::WIDE,
                    PageTarget::Leaf(crate::bus::target_ref(rom)),
                    0,
                ),
            )?;
        }
        for (name, priority) in &layers {
            bus.add_layer(name, *priority)?;
        }
        for spec in &layered {
            let block = blocks
                .get(&spec.block)
                .ok_or_else(|| BuildError::UnknownPhysicalBlock(spec.block.clone()))?;
            bus.add_layered_mapping(LayeredMapping {
                virtual_base: spec.virtual_base,
                size: spec.size,
                layer: spec.layer.clone(),
                device: DeviceId::SYSTEM,
                tag: spec.tag,
                perms: spec.perms,
                caps: TargetCaps::PEEK | TargetCaps::POKE | TargetCaps::WIDE,
                target: PageTarget::Leaf(block.clone()),
                physical_base: spec.block_offset,
            })?;
        }
        for group in &swap_groups {
            let id = bus.create_swap_group(&group.name, group.base, group.size)?;
            for variant in swap_variants.iter().filter(|v| v.group == group.name) {
                let block = blocks
                    .get(&variant.block)
                    .ok_or_else(|| BuildError::UnknownPhysicalBlock(variant.block.clone()))?;
                bus.add_swap_variant(
                    id,
                    SwapVariant {
                        name: variant.name.clone(),
                        target: block.clone(),
                        physical_base: variant.physical_base,
                        perms: variant.perms,
                    },
                )?;
            }
        }

        // 4. CPU.
        let factory = cpu_factory.ok_or(BuildError::MissingCpuFactory)?;
        let cpu = factory(&mut bus, &mut signals);

        // 5. Machine assembly and motherboard devices.
        let mut instances: Vec<Box<dyn Device>> = Vec::new();
        for spec in &motherboard {
            if !spec.enabled {
                continue;
            }
            let factory = device_factories
                .get(&spec.kind)
                .ok_or_else(|| BuildError::UnknownDeviceType(spec.kind.clone()))?;
            let id = device_registry.register(spec.name.clone());
            instances.push(factory(id));
        }
        let mut machine = Machine::assemble(
            cpu,
            bus,
            scheduler,
            signals,
            ComponentBucket::new(),
            device_registry,
            traps,
            slots,
            io_page,
        );
        machine.device_instances = instances;

        // 6. Device initialization.
        run_hooks(&mut hooks.before_device_init, &mut machine);
        {
            let Machine {
                scheduler,
                signals,
                bus,
                components,
                device_instances,
                ..
            } = &mut machine;
            let mut ctx = EventContext {
                now: scheduler.now(),
                scheduler,
                signals,
                bus,
                components,
            };
            for device in device_instances.iter_mut() {
                device.initialize(&mut ctx);
            }
        }
        run_hooks(&mut hooks.after_device_init, &mut machine);

        // 7. Soft-switch handlers.
        run_hooks(&mut hooks.before_soft_switch_registration, &mut machine);
        if let Some(io) = machine.io_page.clone() {
            let mut io = io.borrow_mut();
            for device in machine.device_instances.iter_mut() {
                device.register_soft_switches(&mut io);
            }
        }
        run_hooks(&mut hooks.after_soft_switch_registration, &mut machine);

        // 8. Slot cards.
        run_hooks(&mut hooks.before_slot_card_install, &mut machine);
        for install in pending_installs {
            let PendingInstall::Slot(slot, kind) = install;
            let factory = card_factories
                .get(&kind)
                .ok_or_else(|| BuildError::UnknownCardType(kind.clone()))?;
            let id = machine.devices.register(format!("slot{slot}:{kind}"));
            let card = factory(id);
            machine.slots.borrow_mut().install(slot, card)?;
        }
        run_hooks(&mut hooks.after_slot_card_install, &mut machine);

        // 9. Activate declared layers, then finish.
        for (name, _) in &layers {
            machine.bus.activate_layer(name)?;
        }
        run_hooks(&mut hooks.after_build, &mut machine);
        log::debug!(
            "machine built: {}-bit space, {} devices, {} traps",
            width_bits,
            machine.devices.len(),
            machine.traps.len()
        );
        Ok(machine)
    }
}

fn run_hooks(hooks: &mut [LifecycleHook], machine: &mut Machine) {
    for hook in hooks.iter_mut() {
        hook(machine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FLOATING_BUS;
    use crate::context::EventContext;
    use crate::device::Device;
    use crate::scheduler::ScheduledEventKind;
    use crate::test_utils::scripted_cpu_factory;
    use crate::types::BusAccess;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Reset-vector fetch through a built machine: RAM low, ROM high,
    /// vector at $FFFC/$FFFD.
    #[test]
    fn reset_vector_fetch_end_to_end() {
        let mut rom = vec![0x00u8; 0x3000];
        rom[0x2FFC] = 0x34; // $FFFC
        rom[0x2FFD] = 0x12; // $FFFD
        let mut machine = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .rom_image("monitor", rom)
            .ram_region("main", 0x0000, 0xC000, PagePerms::RWX, None, 0)
            .rom_region("firmware", 0xD000, 0x3000, PagePerms::RX, "monitor", 0)
            .build()
            .expect("build");

        machine.reset();
        assert_eq!(machine.cpu().pc(), 0x1234);
        // ROM refuses normal writes.
        machine.bus_mut().write8(&BusAccess::data_write(0xFFFC), 0x00);
        assert_eq!(machine.bus_mut().read8(&BusAccess::data_read(0xFFFC)), 0x34);
    }

    #[test]
    fn missing_cpu_factory_is_fatal() {
        let err = MachineBuilder::new(16).build().unwrap_err();
        assert!(matches!(err, BuildError::MissingCpuFactory));
    }

    #[test]
    fn unknown_block_and_image_are_fatal() {
        let err = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .ram_region("main", 0x0000, 0x1000, PagePerms::RW, Some("nope".into()), 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownPhysicalBlock(_)));

        let err = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .rom_region("fw", 0xF000, 0x1000, PagePerms::RX, "ghost", 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownRomImage(_)));
    }

    #[test]
    fn duplicate_block_names_are_fatal() {
        let err = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .physical_block("main", 0x1000, 0)
            .physical_block("main", 0x2000, 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicatePhysicalBlock(_)));
    }

    #[test]
    fn unaligned_region_is_fatal() {
        let err = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .ram_region("main", 0x0800, 0x1000, PagePerms::RW, None, 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::Mapping(MappingError::UnalignedBase(_))));
    }

    #[test]
    fn rom_image_preloads_into_block() {
        let mut machine = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .rom_image("boot", vec![0xB0; 0x100])
            .physical_block("main", 0x10000, 0x00)
            .load_rom_into_block("main", "boot", 0x2000)
            .ram_region("all", 0x0000, 0x10000, PagePerms::RWX, Some("main".into()), 0)
            .build()
            .expect("build");

        assert_eq!(machine.bus_mut().read8(&BusAccess::data_read(0x2000)), 0xB0);
        assert_eq!(machine.bus_mut().read8(&BusAccess::data_read(0x20FF)), 0xB0);
        assert_eq!(machine.bus_mut().read8(&BusAccess::data_read(0x2100)), 0x00);
    }

    #[test]
    fn swap_groups_start_unselected_and_layers_active() {
        // Base RAM shows through the group range until a variant is
        // selected; declared layers are active after build.
        let mut machine = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .physical_block("base", 0x10000, 0x11)
            .physical_block("bank", 0x1000, 0xAA)
            .physical_block("overlay", 0x1000, 0x99)
            .ram_region("all", 0x0000, 0x10000, PagePerms::RWX, Some("base".into()), 0)
            .layer("aux", 10)
            .layered_region("aux", 0x2000, 0x1000, PagePerms::RW, RegionTag::Ram, "overlay", 0)
            .swap_group("lc", 0xD000, 0x1000)
            .swap_variant("lc", "bank1", "bank", 0, PagePerms::RW)
            .build()
            .expect("build");

        let bus = machine.bus_mut();
        assert_eq!(bus.read8(&BusAccess::data_read(0xD500)), 0x11);
        assert_eq!(bus.read8(&BusAccess::data_read(0x2500)), 0x99);

        let group = bus.swap_group_by_name("lc").expect("group");
        assert_eq!(bus.active_swap_variant(group).expect("group"), None);
        bus.select_swap_variant(group, "bank1").expect("select");
        assert_eq!(bus.read8(&BusAccess::data_read(0xD500)), 0xAA);
    }

    struct TickerDevice {
        id: DeviceId,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Device for TickerDevice {
        fn name(&self) -> &str {
            "ticker"
        }
        fn id(&self) -> DeviceId {
            self.id
        }
        fn initialize(&mut self, ctx: &mut EventContext<'_>) {
            self.log.borrow_mut().push("init");
            let log = self.log.clone();
            ctx.scheduler.schedule_after(
                100,
                ScheduledEventKind::DeviceTimer,
                0,
                Box::new(move |_| log.borrow_mut().push("tick")),
                Some("ticker".into()),
            );
        }
        fn register_soft_switches(&mut self, io: &mut IoPage) {
            self.log.borrow_mut().push("switches");
            io.register_read_handler(0x30, Box::new(|_, _| 0x42));
        }
    }

    #[test]
    fn build_order_devices_switches_hooks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let device_log = log.clone();
        let hook_log = log.clone();
        let after_log = log.clone();

        let mut machine = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .ram_region("main", 0x0000, 0xC000, PagePerms::RWX, None, 0)
            .composite_io_region("io", 0xC000)
            .register_device_type(
                "ticker",
                Box::new(move |id| {
                    Box::new(TickerDevice {
                        id,
                        log: device_log.clone(),
                    })
                }),
            )
            .motherboard_device("ticker", "ticker0", true)
            .before_device_init(move |_machine| hook_log.borrow_mut().push("before-init"))
            .after_build(move |_machine| after_log.borrow_mut().push("after-build"))
            .build()
            .expect("build");

        assert_eq!(
            *log.borrow(),
            vec!["before-init", "init", "switches", "after-build"]
        );

        // The registered soft switch answers through the bus.
        assert_eq!(machine.bus_mut().read8(&BusAccess::data_read(0xC030)), 0x42);
        assert_eq!(machine.bus_mut().read8(&BusAccess::data_read(0xC031)), FLOATING_BUS);

        // The device's timer fires when time reaches it.
        let Machine {
            scheduler,
            bus,
            signals,
            components,
            ..
        } = &mut machine;
        scheduler.advance(100, bus, signals, components);
        assert_eq!(log.borrow().last(), Some(&"tick"));
    }

    #[test]
    fn disabled_devices_are_skipped_and_unknown_types_fatal() {
        let machine = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .ram_region("main", 0x0000, 0x1000, PagePerms::RW, None, 0)
            .register_device_type("noop", Box::new(|id| Box::new(NoopDevice { id })))
            .motherboard_device("noop", "off", false)
            .build()
            .expect("build");
        assert_eq!(machine.devices().len(), 0);

        let err = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .motherboard_device("mystery", "x", true)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownDeviceType(_)));
    }

    struct NoopDevice {
        id: DeviceId,
    }

    impl Device for NoopDevice {
        fn name(&self) -> &str {
            "noop"
        }
        fn id(&self) -> DeviceId {
            self.id
        }
    }

    #[test]
    fn slot_cards_install_via_factories() {
        let machine = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .ram_region("main", 0x0000, 0x1000, PagePerms::RW, None, 0)
            .register_card_type(
                "disk2",
                Box::new(|id| SlotCard::new("disk2", id, vec![0xD2; 256])),
            )
            .slot_card(6, "disk2")
            .build()
            .expect("build");

        assert!(machine.slots().borrow().has_card(6));
        assert_eq!(machine.slots().borrow().card(6).expect("card").name, "disk2");

        let err = MachineBuilder::new(16)
            .cpu_factory(scripted_cpu_factory())
            .slot_card(3, "ghost")
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownCardType(_)));
    }
}
