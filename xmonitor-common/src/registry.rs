//! Metric source registry.
//!
//! An ordered, fixed-capacity table written once by the loader before the
//! program is attached. Blocks appear in the reply in registry order, so the
//! order is part of the wire format.

use crate::metrics::MetricCategory;

/// Upper bound on registry entries, and therefore on blocks per reply.
pub const MAX_REGISTRY_ENTRIES: usize = 100;

/// How a registry entry's block is acquired.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Host counters kept in the responder's own maps.
    Direct = 0,
    /// Counters exported by a separately running instance, keyed by port.
    Indirect = 1,
}

impl Strategy {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Strategy::Direct),
            1 => Some(Strategy::Indirect),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Category tag for direct entries, instance port for indirect ones.
    pub id: u16,
    /// `Strategy` discriminant.
    pub strategy: u8,
    pub _pad: u8,
    /// Exact size of the block this entry contributes.
    pub block_len: u32,
}

impl RegistryEntry {
    pub const fn direct(category: MetricCategory) -> Self {
        Self {
            id: category.tag(),
            strategy: Strategy::Direct as u8,
            _pad: 0,
            block_len: category.block_len() as u32,
        }
    }

    pub const fn indirect(port: u16, block_len: u32) -> Self {
        Self {
            id: port,
            strategy: Strategy::Indirect as u8,
            _pad: 0,
            block_len,
        }
    }

    pub const fn strategy(&self) -> Option<Strategy> {
        Strategy::from_u8(self.strategy)
    }

    /// Host category of a direct entry.
    pub const fn category(&self) -> Option<MetricCategory> {
        match self.strategy() {
            Some(Strategy::Direct) => MetricCategory::from_tag(self.id),
            _ => None,
        }
    }

    /// Instance port of an indirect entry.
    pub const fn port(&self) -> Option<u16> {
        match self.strategy() {
            Some(Strategy::Indirect) => Some(self.id),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryFull;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registry {
    pub len: u32,
    pub _pad: u32,
    pub entries: [RegistryEntry; MAX_REGISTRY_ENTRIES],
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            len: 0,
            _pad: 0,
            entries: [RegistryEntry {
                id: 0,
                strategy: 0,
                _pad: 0,
                block_len: 0,
            }; MAX_REGISTRY_ENTRIES],
        }
    }

    pub fn from_entries(entries: &[RegistryEntry]) -> Result<Self, RegistryFull> {
        let mut registry = Self::new();
        for entry in entries {
            registry.push(*entry)?;
        }
        Ok(registry)
    }

    pub fn push(&mut self, entry: RegistryEntry) -> Result<(), RegistryFull> {
        let slot = self
            .entries
            .get_mut(self.len as usize)
            .ok_or(RegistryFull)?;
        *slot = entry;
        self.len += 1;
        Ok(())
    }

    /// Live entries in order. A corrupt `len` is clamped to the capacity.
    pub fn entries(&self) -> &[RegistryEntry] {
        let len = (self.len as usize).min(MAX_REGISTRY_ENTRIES);
        &self.entries[..len]
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes a reply carries when every entry is collected.
    pub fn payload_len(&self) -> usize {
        self.entries().iter().map(|e| e.block_len as usize).sum()
    }
}
