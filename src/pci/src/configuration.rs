// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fmt;
use std::sync::Mutex;

use log::warn;

/// Size of the conventional (non-extended) configuration space, in bytes.
pub const CONFIG_SPACE_SIZE: usize = 256;
// The number of 32bit registers in the conventional config space.
const NUM_CONFIGURATION_REGISTERS: usize = CONFIG_SPACE_SIZE / 4;

pub const COMMAND_OFFSET: u16 = 0x04;
pub const STATUS_OFFSET: u16 = 0x06;
pub const BAR0_OFFSET: u16 = 0x10;
pub const CAPABILITY_LIST_HEAD_OFFSET: u16 = 0x34;
pub const FIRST_CAPABILITY_OFFSET: u16 = 0x40;

pub const COMMAND_IO_SPACE: u16 = 0x0001;
pub const COMMAND_MEMORY_SPACE: u16 = 0x0002;
pub const COMMAND_BUS_MASTER: u16 = 0x0004;
/// Status register bit advertising a capability list at `CAPABILITY_LIST_HEAD_OFFSET`.
pub const STATUS_CAPABILITIES_LIST: u16 = 0x0010;

const COMMAND_REG: usize = 1;
const INTERRUPT_LINE_PIN_REG: usize = 15;

/// Types of PCI capabilities.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[allow(dead_code)]
#[repr(u8)]
pub enum PciCapabilityId {
    ListId = 0,
    PowerManagement = 0x01,
    AcceleratedGraphicsPort = 0x02,
    VitalProductData = 0x03,
    SlotIdentification = 0x04,
    MessageSignalledInterrupts = 0x05,
    CompactPciHotSwap = 0x06,
    PciX = 0x07,
    HyperTransport = 0x08,
    VendorSpecific = 0x09,
    Debugport = 0x0A,
    CompactPciCentralResourceControl = 0x0B,
    PciStandardHotPlugController = 0x0C,
    BridgeSubsystemVendorDeviceId = 0x0D,
    AgpTargetPciPcibridge = 0x0E,
    SecureDevice = 0x0F,
    PciExpress = 0x10,
    MsiX = 0x11,
    SataDataIndexConf = 0x12,
    PciAdvancedFeatures = 0x13,
    PciEnhancedAllocation = 0x14,
}

impl From<u8> for PciCapabilityId {
    fn from(c: u8) -> Self {
        match c {
            0 => PciCapabilityId::ListId,
            0x01 => PciCapabilityId::PowerManagement,
            0x02 => PciCapabilityId::AcceleratedGraphicsPort,
            0x03 => PciCapabilityId::VitalProductData,
            0x04 => PciCapabilityId::SlotIdentification,
            0x05 => PciCapabilityId::MessageSignalledInterrupts,
            0x06 => PciCapabilityId::CompactPciHotSwap,
            0x07 => PciCapabilityId::PciX,
            0x08 => PciCapabilityId::HyperTransport,
            0x09 => PciCapabilityId::VendorSpecific,
            0x0A => PciCapabilityId::Debugport,
            0x0B => PciCapabilityId::CompactPciCentralResourceControl,
            0x0C => PciCapabilityId::PciStandardHotPlugController,
            0x0D => PciCapabilityId::BridgeSubsystemVendorDeviceId,
            0x0E => PciCapabilityId::AgpTargetPciPcibridge,
            0x0F => PciCapabilityId::SecureDevice,
            0x10 => PciCapabilityId::PciExpress,
            0x11 => PciCapabilityId::MsiX,
            0x12 => PciCapabilityId::SataDataIndexConf,
            0x13 => PciCapabilityId::PciAdvancedFeatures,
            0x14 => PciCapabilityId::PciEnhancedAllocation,
            _ => PciCapabilityId::ListId,
        }
    }
}

/// A capability body as laid out in configuration space, minus the id and next pointer bytes.
pub trait PciCapability {
    fn bytes(&self) -> &[u8];
    fn id(&self) -> PciCapabilityId;
}

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Config space offset {0:#x} is outside the configuration space
    OutOfRange(u16),
    /// Config space access of {1} bytes at {0:#x} is not naturally aligned
    Unaligned(u16, usize),
    /// Capability {0:?} not found
    CapabilityNotFound(PciCapabilityId),
    /// Capability list loops or exceeds {0} entries
    CapabilityListCorrupt(usize),
    /// Empty capabilities are invalid
    CapabilityEmpty,
    /// Capability of size {0} doesn't fit
    CapabilitySpaceFull(usize),
    /// Config space access failed: {0}
    Io(#[from] std::io::Error),
}

/// Sized accesses to the configuration space of a PCI function.
///
/// Implementations are provided by the platform bus driver (port 0xcf8/0xcfc, ECAM, sysfs ...).
/// Accesses must be naturally aligned.
pub trait PciConfigAccess: Send + Sync {
    fn read_u8(&self, offset: u16) -> Result<u8, ConfigError>;
    fn read_u16(&self, offset: u16) -> Result<u16, ConfigError>;
    fn read_u32(&self, offset: u16) -> Result<u32, ConfigError>;
    fn write_u8(&self, offset: u16, value: u8) -> Result<(), ConfigError>;
    fn write_u16(&self, offset: u16, value: u16) -> Result<(), ConfigError>;
    fn write_u32(&self, offset: u16, value: u32) -> Result<(), ConfigError>;
}

#[derive(Debug)]
struct Registers {
    registers: [u32; NUM_CONFIGURATION_REGISTERS],
    writable_bits: [u32; NUM_CONFIGURATION_REGISTERS], // writable bits for each register.
    // Contains the byte offset and size of the last capability.
    last_capability: Option<(usize, usize)>,
}

/// In-memory copy of a conventional configuration space.
///
/// Serves `PciConfigAccess` from memory. Capabilities are linked the same way a device exposes
/// them.
pub struct ConfigSpace {
    inner: Mutex<Registers>,
}

impl fmt::Debug for ConfigSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSpace").finish()
    }
}

impl ConfigSpace {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut registers = [0u32; NUM_CONFIGURATION_REGISTERS];
        let mut writable_bits = [0u32; NUM_CONFIGURATION_REGISTERS];
        registers[0] = (u32::from(device_id) << 16) | u32::from(vendor_id);
        writable_bits[COMMAND_REG] = 0x0000_ffff; // Status (r/o), command (r/w)
        writable_bits[INTERRUPT_LINE_PIN_REG] = 0x0000_00ff; // Interrupt line (r/w)

        ConfigSpace {
            inner: Mutex::new(Registers {
                registers,
                writable_bits,
                last_capability: None,
            }),
        }
    }

    /// Reads a 32bit register from `reg_idx` in the register map.
    pub fn read_reg(&self, reg_idx: usize) -> u32 {
        let inner = self.inner.lock().expect("Poisoned lock");
        *(inner.registers.get(reg_idx).unwrap_or(&0xffff_ffff))
    }

    /// Appends a capability to the capability list and returns its offset.
    pub fn add_capability(&self, cap_data: &dyn PciCapability) -> Result<usize, ConfigError> {
        let total_len = cap_data.bytes().len() + 2;
        // Check that the length is valid.
        if cap_data.bytes().is_empty() {
            return Err(ConfigError::CapabilityEmpty);
        }
        let mut inner = self.inner.lock().expect("Poisoned lock");
        let (cap_offset, tail_offset) = match inner.last_capability {
            Some((offset, len)) => (Self::next_dword(offset, len), offset + 1),
            None => (
                usize::from(FIRST_CAPABILITY_OFFSET),
                usize::from(CAPABILITY_LIST_HEAD_OFFSET),
            ),
        };
        let end_offset = cap_offset
            .checked_add(total_len)
            .ok_or(ConfigError::CapabilitySpaceFull(total_len))?;
        if end_offset > CONFIG_SPACE_SIZE {
            return Err(ConfigError::CapabilitySpaceFull(total_len));
        }
        inner.registers[COMMAND_REG] |= u32::from(STATUS_CAPABILITIES_LIST) << 16;
        // cap_offset < CONFIG_SPACE_SIZE, so it fits in the 8 bit pointer.
        #[allow(clippy::cast_possible_truncation)]
        inner.write_byte(tail_offset, cap_offset as u8, false);
        inner.write_byte(cap_offset, cap_data.id() as u8, false);
        inner.write_byte(cap_offset + 1, 0, false); // Next pointer.
        for (i, byte) in cap_data.bytes().iter().enumerate() {
            inner.write_byte(cap_offset + i + 2, *byte, false);
        }
        inner.last_capability = Some((cap_offset, total_len));

        Ok(cap_offset)
    }

    /// Overwrites a capability's next pointer, for building arbitrary (even broken) lists.
    #[cfg(test)]
    pub fn set_next_pointer(&self, cap_offset: usize, next: u8) {
        let mut inner = self.inner.lock().expect("Poisoned lock");
        inner.write_byte(cap_offset + 1, next, false);
    }

    // Find the next aligned offset after the one given.
    fn next_dword(offset: usize, len: usize) -> usize {
        let next = offset + len;
        (next + 3) & !3
    }

    fn check(offset: u16, width: usize) -> Result<usize, ConfigError> {
        let offset_usize = usize::from(offset);
        if offset_usize % width != 0 {
            return Err(ConfigError::Unaligned(offset, width));
        }
        if offset_usize + width > CONFIG_SPACE_SIZE {
            return Err(ConfigError::OutOfRange(offset));
        }
        Ok(offset_usize)
    }

    fn read(&self, offset: u16, width: usize) -> Result<u32, ConfigError> {
        let offset = Self::check(offset, width)?;
        let reg = self.read_reg(offset / 4);
        let shift = (offset % 4) * 8;
        let mask = match width {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        };
        Ok((reg >> shift) & mask)
    }

    fn write(&self, offset: u16, width: usize, value: u32) -> Result<(), ConfigError> {
        let offset = Self::check(offset, width)?;
        let mut inner = self.inner.lock().expect("Poisoned lock");
        for i in 0..width {
            #[allow(clippy::cast_possible_truncation)]
            inner.write_byte(offset + i, (value >> (i * 8)) as u8, true);
        }
        Ok(())
    }
}

impl Registers {
    /// Writes a byte to `offset`, optionally enforcing read-only bits.
    fn write_byte(&mut self, offset: usize, value: u8, apply_writable_mask: bool) {
        let shift = (offset % 4) * 8;
        let reg_idx = offset / 4;

        if let Some(r) = self.registers.get_mut(reg_idx) {
            let writable_mask = if apply_writable_mask {
                self.writable_bits[reg_idx]
            } else {
                0xffff_ffff
            };
            let mask = (0xffu32 << shift) & writable_mask;
            let shifted_value = (u32::from(value) << shift) & writable_mask;
            *r = *r & !mask | shifted_value;
        } else {
            warn!("bad PCI config write offset {}", offset);
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
impl PciConfigAccess for ConfigSpace {
    fn read_u8(&self, offset: u16) -> Result<u8, ConfigError> {
        self.read(offset, 1).map(|v| v as u8)
    }

    fn read_u16(&self, offset: u16) -> Result<u16, ConfigError> {
        self.read(offset, 2).map(|v| v as u16)
    }

    fn read_u32(&self, offset: u16) -> Result<u32, ConfigError> {
        self.read(offset, 4)
    }

    fn write_u8(&self, offset: u16, value: u8) -> Result<(), ConfigError> {
        self.write(offset, 1, u32::from(value))
    }

    fn write_u16(&self, offset: u16, value: u16) -> Result<(), ConfigError> {
        self.write(offset, 2, u32::from(value))
    }

    fn write_u32(&self, offset: u16, value: u32) -> Result<(), ConfigError> {
        self.write(offset, 4, value)
    }
}
