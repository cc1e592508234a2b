/*!
Mapping layers: prioritised, activatable overlays over the base page
table.

A layer is a named group of mappings with a priority and an active flag.
While a layer is active, its mappings shadow the base table (and any
lower-priority layers) on every page they cover; deactivating the layer
exposes whatever is underneath. The bus owns a `LayerSet` and asks it,
per page, for the winning overlay when recomputing effective entries.

Ties between mappings of equal priority go to the earliest registered.
*/

use crate::bus::page_table::{MappingError, PAGE_SHIFT, PAGE_SIZE, PageEntry, PageTarget};
use crate::types::{Addr, DeviceId, PagePerms, RegionTag, TargetCaps};

/// A named overlay with a stacking priority.
#[derive(Clone, Debug)]
pub struct MappingLayer {
    pub name: String,
    pub priority: i32,
    pub active: bool,
}

/// One mapping belonging to a layer. Base and size are 4 KiB aligned.
#[derive(Clone)]
pub struct LayeredMapping {
    pub virtual_base: Addr,
    pub size: u64,
    pub layer: String,
    pub device: DeviceId,
    pub tag: RegionTag,
    pub perms: PagePerms,
    pub caps: TargetCaps,
    pub target: PageTarget,
    pub physical_base: usize,
}

impl LayeredMapping {
    #[inline]
    fn first_page(&self) -> usize {
        (self.virtual_base >> PAGE_SHIFT) as usize
    }

    #[inline]
    fn last_page(&self) -> usize {
        ((self.virtual_base as u64 + self.size - 1) >> PAGE_SHIFT) as usize
    }

    #[inline]
    fn covers_page(&self, page: usize) -> bool {
        page >= self.first_page() && page <= self.last_page()
    }

    /// The page entry this mapping produces for `page` (which it must
    /// cover).
    pub(crate) fn entry_for_page(&self, page: usize) -> PageEntry {
        PageEntry {
            device: self.device,
            tag: self.tag,
            perms: self.perms,
            caps: self.caps,
            target: self.target.clone(),
            physical_base: self.physical_base + (page - self.first_page()) * PAGE_SIZE,
        }
    }

    fn pages(&self) -> std::ops::RangeInclusive<usize> {
        self.first_page()..=self.last_page()
    }
}

/// Layer bookkeeping owned by the main bus.
#[derive(Default)]
pub(crate) struct LayerSet {
    layers: Vec<MappingLayer>,
    mappings: Vec<LayeredMapping>,
}

impl LayerSet {
    fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    pub fn layer(&self, name: &str) -> Option<&MappingLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layers(&self) -> &[MappingLayer] {
        &self.layers
    }

    pub fn add_layer(&mut self, name: &str, priority: i32) -> Result<(), MappingError> {
        if self.layer_index(name).is_some() {
            return Err(MappingError::DuplicateLayer(name.into()));
        }
        self.layers.push(MappingLayer {
            name: name.into(),
            priority,
            active: false,
        });
        Ok(())
    }

    /// Add a mapping; the layer must exist. Returns the pages it covers.
    pub fn add_mapping(
        &mut self,
        mapping: LayeredMapping,
    ) -> Result<std::ops::RangeInclusive<usize>, MappingError> {
        if self.layer_index(&mapping.layer).is_none() {
            return Err(MappingError::UnknownLayer(mapping.layer.clone()));
        }
        let pages = mapping.pages();
        self.mappings.push(mapping);
        Ok(pages)
    }

    /// Flip a layer's active flag. Returns the pages needing
    /// recomputation, or `None` when the layer was already in the
    /// requested state (a no-op).
    pub fn set_active(
        &mut self,
        name: &str,
        active: bool,
    ) -> Result<Option<Vec<usize>>, MappingError> {
        let index = self
            .layer_index(name)
            .ok_or_else(|| MappingError::UnknownLayer(name.into()))?;
        if self.layers[index].active == active {
            return Ok(None);
        }
        self.layers[index].active = active;
        Ok(Some(self.pages_of_layer(name)))
    }

    /// Update the permissions of every mapping in a layer. Returns the
    /// pages needing recomputation.
    pub fn set_permissions(
        &mut self,
        name: &str,
        perms: PagePerms,
    ) -> Result<Vec<usize>, MappingError> {
        if self.layer_index(name).is_none() {
            return Err(MappingError::UnknownLayer(name.into()));
        }
        for mapping in self.mappings.iter_mut().filter(|m| m.layer == name) {
            mapping.perms = perms;
        }
        Ok(self.pages_of_layer(name))
    }

    fn pages_of_layer(&self, name: &str) -> Vec<usize> {
        let mut pages: Vec<usize> = self
            .mappings
            .iter()
            .filter(|m| m.layer == name)
            .flat_map(|m| m.pages())
            .collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    /// The winning overlay entry for `page`: highest-priority active
    /// layer covering it, earliest-registered on ties.
    pub fn top_entry_for_page(&self, page: usize) -> Option<PageEntry> {
        let mut best: Option<(i32, &LayeredMapping)> = None;
        for mapping in &self.mappings {
            if !mapping.covers_page(page) {
                continue;
            }
            let Some(layer) = self.layer(&mapping.layer) else {
                continue;
            };
            if !layer.active {
                continue;
            }
            // Strictly-greater keeps the earliest registration on ties.
            if best.is_none_or(|(p, _)| layer.priority > p) {
                best = Some((layer.priority, mapping));
            }
        }
        best.map(|(_, m)| m.entry_for_page(page))
    }

    /// Every mapping (active or not) covering `addr`, for debugging.
    pub fn mappings_at(&self, addr: Addr) -> Vec<&LayeredMapping> {
        let page = (addr >> PAGE_SHIFT) as usize;
        self.mappings.iter().filter(|m| m.covers_page(page)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::target::{RamTarget, target_ref};

    fn mapping(layer: &str, base: Addr, size: u64, fill: u8) -> LayeredMapping {
        LayeredMapping {
            virtual_base: base,
            size,
            layer: layer.into(),
            device: DeviceId(7),
            tag: RegionTag::Ram,
            perms: PagePerms::RW,
            caps: TargetCaps::WIDE,
            target: PageTarget::Leaf(target_ref(RamTarget::filled(size as usize, fill))),
            physical_base: 0,
        }
    }

    #[test]
    fn duplicate_and_unknown_layers_are_errors() {
        let mut set = LayerSet::default();
        set.add_layer("aux", 10).expect("add");
        assert!(matches!(
            set.add_layer("aux", 20),
            Err(MappingError::DuplicateLayer(_))
        ));
        assert!(matches!(
            set.add_mapping(mapping("nope", 0x0000, 0x1000, 0)),
            Err(MappingError::UnknownLayer(_))
        ));
        assert!(matches!(
            set.set_active("nope", true),
            Err(MappingError::UnknownLayer(_))
        ));
    }

    #[test]
    fn priority_and_tie_breaking() {
        let mut set = LayerSet::default();
        set.add_layer("low", 1).expect("add");
        set.add_layer("high", 5).expect("add");
        set.add_layer("high2", 5).expect("add");
        set.add_mapping(mapping("low", 0x2000, 0x1000, 0x11)).expect("map");
        set.add_mapping(mapping("high", 0x2000, 0x1000, 0x22)).expect("map");
        set.add_mapping(mapping("high2", 0x2000, 0x1000, 0x33)).expect("map");
        set.set_active("low", true).expect("activate");
        set.set_active("high", true).expect("activate");
        set.set_active("high2", true).expect("activate");

        // Priority 5 beats 1; between the two fives the earlier
        // registration ("high") wins.
        let entry = set.top_entry_for_page(2).expect("entry");
        let PageTarget::Leaf(target) = entry.target else {
            panic!("leaf expected")
        };
        let value = target
            .borrow_mut()
            .read8(0, &crate::types::BusAccess::data_read(0x2000));
        assert_eq!(value, 0x22);
    }

    #[test]
    fn reactivation_is_a_no_op() {
        let mut set = LayerSet::default();
        set.add_layer("aux", 1).expect("add");
        set.add_mapping(mapping("aux", 0x0000, 0x2000, 0)).expect("map");
        assert_eq!(
            set.set_active("aux", true).expect("activate"),
            Some(vec![0, 1])
        );
        assert_eq!(set.set_active("aux", true).expect("activate"), None);
    }

    #[test]
    fn mappings_at_reports_inactive_layers_too() {
        let mut set = LayerSet::default();
        set.add_layer("a", 1).expect("add");
        set.add_layer("b", 2).expect("add");
        set.add_mapping(mapping("a", 0x3000, 0x1000, 0)).expect("map");
        set.add_mapping(mapping("b", 0x3000, 0x2000, 0)).expect("map");
        assert_eq!(set.mappings_at(0x3123).len(), 2);
        assert_eq!(set.mappings_at(0x4123).len(), 1);
        assert_eq!(set.mappings_at(0x5123).len(), 0);
    }
}
