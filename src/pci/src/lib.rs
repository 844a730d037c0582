// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Driver side view of a PCI function: configuration space access, capability discovery,
//! BAR mappings and interrupt sources.

mod capability;
mod configuration;
mod device;
mod interrupt;
mod mmio;

use std::fmt::{self, Debug, Display};
use std::num::ParseIntError;
use std::str::FromStr;

use serde::de::Visitor;

pub use self::capability::{
    capabilities, find_first_capability, find_next_capability, CapabilityEntry,
    MAX_CAPABILITIES,
};
pub use self::configuration::{
    ConfigError, ConfigSpace, PciCapability, PciCapabilityId, PciConfigAccess,
    BAR0_OFFSET, CAPABILITY_LIST_HEAD_OFFSET, COMMAND_BUS_MASTER, COMMAND_IO_SPACE,
    COMMAND_MEMORY_SPACE, COMMAND_OFFSET, CONFIG_SPACE_SIZE, FIRST_CAPABILITY_OFFSET,
    STATUS_CAPABILITIES_LIST, STATUS_OFFSET,
};
pub use self::device::{BarInfo, PciDeviceError, PciFunction, PciIrqMode, NUM_BARS};
pub use self::interrupt::{EventFdInterruptPort, InterruptPort, WaitError};
pub use self::mmio::{check_access, MmioError, MmioRegion};

/// Segment/bus/device/function address of a PCI function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Hash)]
pub struct PciBdf(u32);

struct PciBdfVisitor;

impl Visitor<'_> for PciBdfVisitor {
    type Value = PciBdf;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a PCI address formatted as ssss:bb:dd.f")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> serde::Deserialize<'de> for PciBdf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(PciBdfVisitor)
    }
}

impl serde::Serialize for PciBdf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&self.to_string())
    }
}

// Every field is masked to its width first.
#[allow(clippy::cast_possible_truncation)]
impl PciBdf {
    pub fn segment(&self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    pub fn bus(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    pub fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self(
            (u32::from(segment) << 16)
                | (u32::from(bus) << 8)
                | (u32::from(device & 0x1f) << 3)
                | u32::from(function & 0x7),
        )
    }
}

impl From<u32> for PciBdf {
    fn from(bdf: u32) -> Self {
        Self(bdf)
    }
}

impl From<PciBdf> for u32 {
    fn from(bdf: PciBdf) -> Self {
        bdf.0
    }
}

impl Debug for PciBdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for PciBdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.segment(),
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

/// Errors parsing a `PciBdf` from its `ssss:bb:dd.f` form.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum PciBdfParseError {
    /// Malformed PCI address: {0}
    Format(String),
    /// Invalid number in PCI address: {0}
    Number(#[from] ParseIntError),
}

impl FromStr for PciBdf {
    type Err = PciBdfParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, function) = s
            .split_once('.')
            .ok_or_else(|| PciBdfParseError::Format(s.to_string()))?;
        let items: Vec<&str> = prefix.split(':').collect();
        if items.len() != 3 {
            return Err(PciBdfParseError::Format(s.to_string()));
        }
        let segment = u16::from_str_radix(items[0], 16)?;
        let bus = u8::from_str_radix(items[1], 16)?;
        let device = u8::from_str_radix(items[2], 16)?;
        let function = u8::from_str_radix(function, 16)?;
        if device > 0x1f || function > 0x7 {
            return Err(PciBdfParseError::Format(s.to_string()));
        }
        Ok(PciBdf::new(segment, bus, device, function))
    }
}
