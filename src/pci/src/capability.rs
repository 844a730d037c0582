// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Walks the capability linked list of a PCI function.

use crate::configuration::{
    ConfigError, PciCapabilityId, PciConfigAccess, CAPABILITY_LIST_HEAD_OFFSET,
    FIRST_CAPABILITY_OFFSET, STATUS_CAPABILITIES_LIST, STATUS_OFFSET,
};

/// Upper bound on the number of entries in a well formed list. Each capability takes at least
/// one dword of the 192 bytes after the standard header.
pub const MAX_CAPABILITIES: usize = 48;

// The bottom two bits of capability pointers are reserved.
const CAPABILITY_POINTER_MASK: u8 = !0x3;

/// One entry of the capability list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityEntry {
    /// Byte offset of the capability in configuration space.
    pub offset: u8,
    /// Raw capability id.
    pub id: u8,
}

/// Returns the capability list of `config` in list order.
pub fn capabilities(config: &dyn PciConfigAccess) -> Result<Vec<CapabilityEntry>, ConfigError> {
    let mut entries = Vec::new();
    if config.read_u16(STATUS_OFFSET)? & STATUS_CAPABILITIES_LIST == 0 {
        return Ok(entries);
    }

    let mut next = config.read_u8(CAPABILITY_LIST_HEAD_OFFSET)? & CAPABILITY_POINTER_MASK;
    while u16::from(next) >= FIRST_CAPABILITY_OFFSET {
        if entries.len() == MAX_CAPABILITIES {
            return Err(ConfigError::CapabilityListCorrupt(MAX_CAPABILITIES));
        }
        let offset = u16::from(next);
        let id = config.read_u8(offset)?;
        entries.push(CapabilityEntry { offset: next, id });
        next = config.read_u8(offset + 1)? & CAPABILITY_POINTER_MASK;
    }
    Ok(entries)
}

/// Returns the offset of the first capability with the given id.
pub fn find_first_capability(
    config: &dyn PciConfigAccess,
    id: PciCapabilityId,
) -> Result<u8, ConfigError> {
    capabilities(config)?
        .into_iter()
        .find(|entry| entry.id == id as u8)
        .map(|entry| entry.offset)
        .ok_or(ConfigError::CapabilityNotFound(id))
}

/// Returns the offset of the first capability with the given id that follows the capability at
/// `start_offset` in list order.
pub fn find_next_capability(
    config: &dyn PciConfigAccess,
    id: PciCapabilityId,
    start_offset: u8,
) -> Result<u8, ConfigError> {
    capabilities(config)?
        .into_iter()
        .skip_while(|entry| entry.offset != start_offset)
        .skip(1)
        .find(|entry| entry.id == id as u8)
        .map(|entry| entry.offset)
        .ok_or(ConfigError::CapabilityNotFound(id))
}
