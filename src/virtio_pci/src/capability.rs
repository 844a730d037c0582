// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtio vendor specific PCI capabilities.
//!
//! Layout, relative to the capability offset:
//!
//! ```text
//!    u8 cap_vndr;    // 0x00 generic PCI field: PCI_CAP_ID_VNDR
//!    u8 cap_next;    // 0x01 generic PCI field: next ptr
//!    u8 cap_len;     // 0x02 generic PCI field: capability length
//!    u8 cfg_type;    // 0x03 identifies the structure
//!    u8 bar;         // 0x04 where to find it
//!    u8 id;          // 0x05 multiple capabilities of the same type
//!    u8 padding[2];  // 0x06 pad to full dword
//!    le32 offset;    // 0x08 offset within bar
//!    le32 length;    // 0x0C length of the structure, in bytes
//!    le32 notify_off_multiplier;  // 0x10 notify capabilities only
//!    le32 offset_hi; // 0x10 64-bit capabilities only
//!    le32 length_hi; // 0x14 64-bit capabilities only
//! ```

use pci::{ConfigError, PciConfigAccess};

const CFG_TYPE_OFFSET: u16 = 3;
const BAR_OFFSET: u16 = 4;
const ID_OFFSET: u16 = 5;
const REGION_OFFSET_OFFSET: u16 = 8;
const REGION_LENGTH_OFFSET: u16 = 12;
const NOTIFY_OFF_MULTIPLIER_OFFSET: u16 = 16;
const REGION_OFFSET_HI_OFFSET: u16 = 16;
const REGION_LENGTH_HI_OFFSET: u16 = 20;

/// Structure a virtio capability points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VirtioPciCapType {
    Common = 1,
    Notify = 2,
    Isr = 3,
    Device = 4,
    Pci = 5,
    SharedMemory = 8,
}

impl TryFrom<u8> for VirtioPciCapType {
    type Error = u8;

    fn try_from(cfg_type: u8) -> Result<Self, u8> {
        match cfg_type {
            1 => Ok(VirtioPciCapType::Common),
            2 => Ok(VirtioPciCapType::Notify),
            3 => Ok(VirtioPciCapType::Isr),
            4 => Ok(VirtioPciCapType::Device),
            5 => Ok(VirtioPciCapType::Pci),
            8 => Ok(VirtioPciCapType::SharedMemory),
            other => Err(other),
        }
    }
}

/// A virtio capability read from configuration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioPciCap {
    /// Raw `cfg_type`; unknown types are kept so callers can skip them.
    pub cfg_type: u8,
    pub bar: u8,
    pub id: u8,
    pub offset: u32,
    pub length: u32,
}

impl VirtioPciCap {
    /// Reads the capability at `cap_offset`.
    pub fn read(config: &dyn PciConfigAccess, cap_offset: u8) -> Result<Self, ConfigError> {
        let base = u16::from(cap_offset);
        Ok(VirtioPciCap {
            cfg_type: config.read_u8(base + CFG_TYPE_OFFSET)?,
            bar: config.read_u8(base + BAR_OFFSET)?,
            id: config.read_u8(base + ID_OFFSET)?,
            offset: config.read_u32(base + REGION_OFFSET_OFFSET)?,
            length: config.read_u32(base + REGION_LENGTH_OFFSET)?,
        })
    }

    pub fn cap_type(&self) -> Option<VirtioPciCapType> {
        VirtioPciCapType::try_from(self.cfg_type).ok()
    }
}

/// Reads the `notify_off_multiplier` of the notify capability at `cap_offset`.
pub fn read_notify_off_multiplier(
    config: &dyn PciConfigAccess,
    cap_offset: u8,
) -> Result<u32, ConfigError> {
    config.read_u32(u16::from(cap_offset) + NOTIFY_OFF_MULTIPLIER_OFFSET)
}

/// Reads the 64-bit offset and length of the shared memory capability at `cap_offset`. The high
/// halves follow the base capability.
pub fn read_cap64(
    config: &dyn PciConfigAccess,
    cap_offset: u8,
    cap: &VirtioPciCap,
) -> Result<(u64, u64), ConfigError> {
    let base = u16::from(cap_offset);
    let offset_hi = config.read_u32(base + REGION_OFFSET_HI_OFFSET)?;
    let length_hi = config.read_u32(base + REGION_LENGTH_HI_OFFSET)?;
    Ok((
        (u64::from(offset_hi) << 32) | u64::from(cap.offset),
        (u64::from(length_hi) << 32) | u64::from(cap.length),
    ))
}
