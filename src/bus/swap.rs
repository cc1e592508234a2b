/*!
Swap groups: mutually-exclusive bank variants over a fixed virtual range.

A swap group models bank-switched memory the way the language card does
it: one window of address space, several physical backings, exactly one
visible at a time. Selecting a variant atomically repoints every page in
the group's range; the previously selected variant keeps its contents
and simply stops being addressable.

Selection only records the choice here; the bus recomputes the affected
effective page entries immediately after, so no partially-rewritten
state is ever observable.
*/

use thiserror::Error;

use crate::bus::page_table::{MappingError, PAGE_SHIFT};
use crate::bus::target::TargetRef;
use crate::types::{Addr, PagePerms};

/// Identifier issued by `create_swap_group`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SwapGroupId(pub u32);

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("unknown swap group {0:?}")]
    UnknownGroup(SwapGroupId),
    #[error("swap group '{0}' already exists")]
    DuplicateGroup(String),
    #[error("variant '{variant}' already registered in group '{group}'")]
    DuplicateVariant { group: String, variant: String },
    #[error("no variant '{variant}' in group '{group}'")]
    UnknownVariant { group: String, variant: String },
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// One selectable bank: where reads and writes land while it is active.
#[derive(Clone)]
pub struct SwapVariant {
    pub name: String,
    pub target: TargetRef,
    pub physical_base: usize,
    pub perms: PagePerms,
}

/// A named group of variants over `[virtual_base, virtual_base + size)`.
pub struct SwapGroup {
    pub id: SwapGroupId,
    pub name: String,
    pub virtual_base: Addr,
    pub size: u64,
    variants: Vec<SwapVariant>,
    active: Option<usize>,
}

impl SwapGroup {
    #[inline]
    pub(crate) fn first_page(&self) -> usize {
        (self.virtual_base >> PAGE_SHIFT) as usize
    }

    #[inline]
    pub(crate) fn last_page(&self) -> usize {
        ((self.virtual_base as u64 + self.size - 1) >> PAGE_SHIFT) as usize
    }

    #[inline]
    fn covers_page(&self, page: usize) -> bool {
        page >= self.first_page() && page <= self.last_page()
    }

    pub fn active_variant(&self) -> Option<&SwapVariant> {
        self.active.map(|i| &self.variants[i])
    }

    pub fn variant_names(&self) -> impl Iterator<Item = &str> {
        self.variants.iter().map(|v| v.name.as_str())
    }
}

/// All swap groups of one bus.
#[derive(Default)]
pub(crate) struct SwapGroups {
    groups: Vec<SwapGroup>,
}

impl SwapGroups {
    pub fn create(
        &mut self,
        name: &str,
        virtual_base: Addr,
        size: u64,
    ) -> Result<SwapGroupId, SwapError> {
        if self.groups.iter().any(|g| g.name == name) {
            return Err(SwapError::DuplicateGroup(name.into()));
        }
        let id = SwapGroupId(self.groups.len() as u32);
        self.groups.push(SwapGroup {
            id,
            name: name.into(),
            virtual_base,
            size,
            variants: Vec::new(),
            active: None,
        });
        Ok(id)
    }

    pub fn group(&self, id: SwapGroupId) -> Result<&SwapGroup, SwapError> {
        self.groups
            .get(id.0 as usize)
            .ok_or(SwapError::UnknownGroup(id))
    }

    fn group_mut(&mut self, id: SwapGroupId) -> Result<&mut SwapGroup, SwapError> {
        self.groups
            .get_mut(id.0 as usize)
            .ok_or(SwapError::UnknownGroup(id))
    }

    pub fn by_name(&self, name: &str) -> Option<SwapGroupId> {
        self.groups.iter().find(|g| g.name == name).map(|g| g.id)
    }

    pub fn add_variant(&mut self, id: SwapGroupId, variant: SwapVariant) -> Result<(), SwapError> {
        let group = self.group_mut(id)?;
        if group.variants.iter().any(|v| v.name == variant.name) {
            return Err(SwapError::DuplicateVariant {
                group: group.name.clone(),
                variant: variant.name,
            });
        }
        group.variants.push(variant);
        Ok(())
    }

    /// Record the selection and return the pages to recompute.
    pub fn select(
        &mut self,
        id: SwapGroupId,
        variant: &str,
    ) -> Result<std::ops::RangeInclusive<usize>, SwapError> {
        let group = self.group_mut(id)?;
        let index = group
            .variants
            .iter()
            .position(|v| v.name == variant)
            .ok_or_else(|| SwapError::UnknownVariant {
                group: group.name.clone(),
                variant: variant.into(),
            })?;
        group.active = Some(index);
        log::debug!("swap group '{}': variant '{}' selected", group.name, variant);
        Ok(group.first_page()..=group.last_page())
    }

    /// The active overlay covering `page`, if any: the group's first
    /// page plus the selected variant.
    pub fn overlay_for_page(&self, page: usize) -> Option<(usize, &SwapVariant)> {
        self.groups
            .iter()
            .find(|g| g.covers_page(page) && g.active.is_some())
            .map(|g| (g.first_page(), g.active_variant().expect("active variant")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SwapGroup> {
        self.groups.iter()
    }
}
