/*!
Bus module: façade and submodules.

Overview
- This directory contains the memory bus fabric, split into focused
  submodules. `MainBus` is the single dispatch point every CPU, DMA and
  debugger access goes through.

Modules and responsibilities
- target: the `BusTarget` contract plus the RAM/ROM leaves and the
  floating-bus constant.
- composite: `CompositeTarget` and the soft-switch / slot-ROM /
  expansion-ROM I/O page.
- fault: `BusFault` and `BusResult` for the checked access paths.
- page_table: the paged translation table itself: mapping mutation,
  permission enforcement, the wide-access decomposition policy, and the
  base-vs-effective entry recomputation.
- layers: prioritised, activatable overlays over the base table.
- swap: mutually-exclusive bank variants over a fixed range.

The re-exports below are the public surface; the submodule layout is an
implementation detail.
*/

pub mod composite;
pub mod fault;
pub mod layers;
pub mod page_table;
pub mod swap;
pub mod target;

pub use composite::{
    CompositeRef, CompositeTarget, IoPage, ReadHandler, SUBRANGE_ALIGN, SubrangeInfo,
    WriteHandler, composite_ref,
};
pub use fault::{BusFault, BusResult, FaultKind, PermissionKind};
pub use layers::{LayeredMapping, MappingLayer};
pub use page_table::{
    MainBus, MappingError, PAGE_SHIFT, PAGE_SIZE, PageEntry, PageTarget,
};
pub use swap::{SwapError, SwapGroup, SwapGroupId, SwapVariant};
pub use target::{BusTarget, FLOATING_BUS, RamTarget, RomTarget, TargetRef, target_ref};
