/*!
Machine profiles: the JSON configuration boundary.

A profile describes a machine declaratively (address-space width, CPU
family, ROM images, physical memory blocks, regions, devices, slot
cards) and is turned into a configured `MachineBuilder`. All address
and size fields are hex strings (`"0x1000"` or bare `"1000"`, `$`
prefix also accepted); permissions use the `"rwx"` spelling with `-`
placeholders.

ROM image bytes are pulled through an injected resolver (`name/path ->
bytes`) so the core never hardwires a file-system layout; `fs_loader` is
the obvious std resolver for hosts that do keep ROMs on disk.

The profile layer validates what it can see (hex syntax, permission
strings, CPU type, address-space range, source kinds); structural
problems it cannot see (alignment, overlaps, unknown names) surface
later as `BuildError` from `build()`.
*/

use std::fmt;

use serde::Deserialize;
use serde::de::{self, Deserializer};
use thiserror::Error;

use crate::builder::MachineBuilder;
use crate::cpu::CpuKind;
use crate::types::PagePerms;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("address space of {0} bits out of range (12-32)")]
    AddressSpaceOutOfRange(u8),
    #[error("unknown CPU type '{0}'")]
    UnknownCpuType(String),
    #[error("invalid permission string '{0}'")]
    InvalidPerms(String),
    #[error("unknown region type '{0}'")]
    UnknownRegionType(String),
    #[error("unknown composite handler '{0}'")]
    UnknownHandler(String),
    #[error("unknown physical source type '{0}'")]
    UnknownSourceType(String),
    #[error("ROM image '{name}' is {actual:#x} bytes, profile declares {declared:#x}")]
    RomImageSizeMismatch {
        name: String,
        declared: u64,
        actual: u64,
    },
    #[error("failed to load ROM image '{name}': {source}")]
    RomImageLoad {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A hex-string number field (`"0x1000"`, `"$1000"` or `"1000"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HexU64(pub u64);

impl<'de> Deserialize<'de> for HexU64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl de::Visitor<'_> for HexVisitor {
            type Value = HexU64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hex string like \"0x1000\"")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<HexU64, E> {
                let digits = value
                    .strip_prefix("0x")
                    .or_else(|| value.strip_prefix("0X"))
                    .or_else(|| value.strip_prefix('$'))
                    .unwrap_or(value);
                u64::from_str_radix(digits, 16)
                    .map(HexU64)
                    .map_err(|_| E::custom(format!("invalid hex value '{value}'")))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

#[derive(Debug, Deserialize)]
pub struct MachineProfile {
    pub address_space: u8,
    pub cpu: CpuSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub devices: DevicesSection,
}

#[derive(Debug, Deserialize)]
pub struct CpuSection {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MemorySection {
    #[serde(default)]
    pub rom_images: Vec<RomImageSpec>,
    #[serde(default)]
    pub physical: Vec<PhysicalSpec>,
    #[serde(default)]
    pub regions: Vec<RegionSpec>,
}

#[derive(Debug, Deserialize)]
pub struct RomImageSpec {
    pub name: String,
    pub source: String,
    pub size: HexU64,
}

#[derive(Debug, Deserialize)]
pub struct PhysicalSpec {
    pub name: String,
    pub size: HexU64,
    #[serde(default)]
    pub fill: Option<u8>,
    #[serde(default)]
    pub sources: Vec<PhysicalSource>,
}

#[derive(Debug, Deserialize)]
pub struct PhysicalSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub rom_image: String,
    pub offset: HexU64,
}

#[derive(Debug, Deserialize)]
pub struct RegionSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub start: HexU64,
    pub size: HexU64,
    pub permissions: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_offset: Option<HexU64>,
    #[serde(default)]
    pub handler: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DevicesSection {
    #[serde(default)]
    pub motherboard: Vec<MotherboardSpec>,
    #[serde(default)]
    pub slots: SlotsSection,
}

#[derive(Debug, Deserialize)]
pub struct MotherboardSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SlotsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cards: Vec<CardSpec>,
}

#[derive(Debug, Deserialize)]
pub struct CardSpec {
    pub slot: u8,
    #[serde(rename = "type")]
    pub kind: String,
}

fn default_true() -> bool {
    true
}

/// Resolves a ROM image `source` string to its bytes.
pub type RomLoader<'a> = &'a dyn Fn(&str) -> std::io::Result<Vec<u8>>;

/// The obvious loader: treat `source` as a file-system path.
pub fn fs_loader(source: &str) -> std::io::Result<Vec<u8>> {
    std::fs::read(source)
}

impl MachineProfile {
    pub fn from_json(text: &str) -> Result<MachineProfile, ProfileError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The CPU family this profile names.
    pub fn cpu_kind(&self) -> Result<CpuKind, ProfileError> {
        CpuKind::parse(&self.cpu.kind)
            .ok_or_else(|| ProfileError::UnknownCpuType(self.cpu.kind.clone()))
    }

    /// Turn the profile into a configured builder. The host still has
    /// to attach a CPU factory and register device/card types before
    /// calling `build()`.
    pub fn into_builder(&self, rom_loader: RomLoader<'_>) -> Result<MachineBuilder, ProfileError> {
        if !(12..=32).contains(&self.address_space) {
            return Err(ProfileError::AddressSpaceOutOfRange(self.address_space));
        }
        let cpu_kind = self.cpu_kind()?;
        let mut builder = MachineBuilder::new(self.address_space).cpu_kind(cpu_kind);

        for image in &self.memory.rom_images {
            let bytes = rom_loader(&image.source).map_err(|source| ProfileError::RomImageLoad {
                name: image.name.clone(),
                source,
            })?;
            if bytes.len() as u64 != image.size.0 {
                return Err(ProfileError::RomImageSizeMismatch {
                    name: image.name.clone(),
                    declared: image.size.0,
                    actual: bytes.len() as u64,
                });
            }
            builder = builder.rom_image(image.name.clone(), bytes);
        }

        for block in &self.memory.physical {
            builder = builder.physical_block(
                block.name.clone(),
                block.size.0 as usize,
                block.fill.unwrap_or(0),
            );
            for source in &block.sources {
                if source.kind != "rom-image" {
                    return Err(ProfileError::UnknownSourceType(source.kind.clone()));
                }
                builder = builder.load_rom_into_block(
                    block.name.clone(),
                    source.rom_image.clone(),
                    source.offset.0 as usize,
                );
            }
        }

        for region in &self.memory.regions {
            let perms = PagePerms::parse_rwx(&region.permissions)
                .ok_or_else(|| ProfileError::InvalidPerms(region.permissions.clone()))?;
            let source_offset = region.source_offset.map(|h| h.0 as usize).unwrap_or(0);
            match region.kind.as_str() {
                "ram" => {
                    builder = builder.ram_region(
                        region.name.clone(),
                        region.start.0 as u32,
                        region.size.0,
                        perms,
                        region.source.clone(),
                        source_offset,
                    );
                }
                "rom" => {
                    let image = region
                        .source
                        .clone()
                        .unwrap_or_else(|| region.name.clone());
                    builder = builder.rom_region(
                        region.name.clone(),
                        region.start.0 as u32,
                        region.size.0,
                        perms,
                        image,
                        source_offset,
                    );
                }
                "composite" => {
                    match region.handler.as_deref() {
                        None | Some("io") => {}
                        Some(other) => {
                            return Err(ProfileError::UnknownHandler(other.into()));
                        }
                    }
                    builder =
                        builder.composite_io_region(region.name.clone(), region.start.0 as u32);
                }
                other => return Err(ProfileError::UnknownRegionType(other.into())),
            }
        }

        for device in &self.devices.motherboard {
            let name = device.name.clone().unwrap_or_else(|| device.kind.clone());
            builder = builder.motherboard_device(device.kind.clone(), name, device.enabled);
        }
        if self.devices.slots.enabled {
            for card in &self.devices.slots.cards {
                builder = builder.slot_card(card.slot, card.kind.clone());
            }
        }

        Ok(builder)
    }
}
