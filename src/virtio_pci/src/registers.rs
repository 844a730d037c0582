// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sized register accesses over MMIO windows and legacy port ranges.
//!
//! 64-bit registers are two consecutive little endian 32-bit fields on the wire. Both window kinds
//! access them as two 32-bit operations, low word at `offset` first and high word at
//! `offset + 4` second.

use std::io;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use pci::{MmioError, MmioRegion};

use crate::legacy_io::LegacyIo;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum RegisterError {
    /// MMIO register access failed: {0}
    Mmio(#[from] MmioError),
    /// Port I/O access at {0:#x} failed: {1}
    Port(u16, io::Error),
    /// Port offset {1:#x} overflows the I/O window at {0:#x}
    PortOverflow(u16, u64),
    /// Access of {1} bytes at {0:#x} is outside the {2:#x} bytes register window
    OutOfWindow(u64, usize, u64),
    /// Registers cannot be accessed {0} bytes at a time
    AccessWidth(usize),
}

/// Integer types a register can hold.
pub trait RegisterValue: Copy + Sized {
    /// Access width in bytes.
    const WIDTH: usize;

    fn read_mmio(region: &dyn MmioRegion, offset: usize) -> Result<Self, RegisterError>;
    fn write_mmio(self, region: &dyn MmioRegion, offset: usize) -> Result<(), RegisterError>;
    fn read_port(io: &dyn LegacyIo, port: u16) -> Result<Self, RegisterError>;
    fn write_port(self, io: &dyn LegacyIo, port: u16) -> Result<(), RegisterError>;
}

macro_rules! register_value {
    ($ty:ty, $read:ident, $write:ident, $inp:ident, $outp:ident) => {
        impl RegisterValue for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn read_mmio(region: &dyn MmioRegion, offset: usize) -> Result<Self, RegisterError> {
                Ok(region.$read(offset)?)
            }

            fn write_mmio(
                self,
                region: &dyn MmioRegion,
                offset: usize,
            ) -> Result<(), RegisterError> {
                Ok(region.$write(offset, self)?)
            }

            fn read_port(io: &dyn LegacyIo, port: u16) -> Result<Self, RegisterError> {
                io.$inp(port).map_err(|err| RegisterError::Port(port, err))
            }

            fn write_port(self, io: &dyn LegacyIo, port: u16) -> Result<(), RegisterError> {
                io.$outp(port, self)
                    .map_err(|err| RegisterError::Port(port, err))
            }
        }
    };
}

register_value!(u8, read_u8, write_u8, inb, outb);
register_value!(u16, read_u16, write_u16, inw, outw);
register_value!(u32, read_u32, write_u32, inl, outl);

/// Splits `value` into its low and high 32-bit halves.
#[allow(clippy::cast_possible_truncation)]
pub fn split_u64(value: u64) -> (u32, u32) {
    ((value & 0xffff_ffff) as u32, (value >> 32) as u32)
}

// Port of the high half of a 64-bit port register.
fn high_port(port: u16) -> Result<u16, RegisterError> {
    port.checked_add(4)
        .ok_or(RegisterError::PortOverflow(port, 4))
}

impl RegisterValue for u64 {
    const WIDTH: usize = 8;

    fn read_mmio(region: &dyn MmioRegion, offset: usize) -> Result<Self, RegisterError> {
        let lo = region.read_u32(offset)?;
        let hi = region.read_u32(offset + 4)?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    }

    fn write_mmio(self, region: &dyn MmioRegion, offset: usize) -> Result<(), RegisterError> {
        let (lo, hi) = split_u64(self);
        region.write_u32(offset, lo)?;
        region.write_u32(offset + 4, hi)?;
        Ok(())
    }

    fn read_port(io: &dyn LegacyIo, port: u16) -> Result<Self, RegisterError> {
        let lo = u32::read_port(io, port)?;
        let hi = u32::read_port(io, high_port(port)?)?;
        Ok((u64::from(hi) << 32) | u64::from(lo))
    }

    fn write_port(self, io: &dyn LegacyIo, port: u16) -> Result<(), RegisterError> {
        let (lo, hi) = split_u64(self);
        lo.write_port(io, port)?;
        hi.write_port(io, high_port(port)?)
    }
}

/// Register file addressed by byte offset.
pub trait RegisterSpace {
    fn read<T: RegisterValue>(&self, offset: u64) -> Result<T, RegisterError>;
    fn write<T: RegisterValue>(&self, offset: u64, value: T) -> Result<(), RegisterError>;

    /// Reads `data.len()` bytes at `offset` as a single register of that width.
    fn read_bytes(&self, offset: u64, data: &mut [u8]) -> Result<(), RegisterError> {
        match data.len() {
            1 => data[0] = self.read(offset)?,
            2 => LittleEndian::write_u16(data, self.read(offset)?),
            4 => LittleEndian::write_u32(data, self.read(offset)?),
            8 => LittleEndian::write_u64(data, self.read(offset)?),
            len => return Err(RegisterError::AccessWidth(len)),
        }
        Ok(())
    }

    /// Writes `data` at `offset` as a single register of its width.
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), RegisterError> {
        match data.len() {
            1 => self.write(offset, data[0]),
            2 => self.write(offset, LittleEndian::read_u16(data)),
            4 => self.write(offset, LittleEndian::read_u32(data)),
            8 => self.write(offset, LittleEndian::read_u64(data)),
            len => Err(RegisterError::AccessWidth(len)),
        }
    }
}

/// A bounded window inside a mapped BAR, e.g. the common configuration structure.
#[derive(Debug, Clone)]
pub struct RegisterWindow {
    region: Arc<dyn MmioRegion>,
    base: usize,
    len: u64,
}

impl RegisterWindow {
    pub fn new(region: Arc<dyn MmioRegion>, base: usize, len: u64) -> Self {
        RegisterWindow { region, base, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn locate(&self, offset: u64, width: usize) -> Result<usize, RegisterError> {
        let out_of_window = || RegisterError::OutOfWindow(offset, width, self.len);
        let end = offset
            .checked_add(width as u64)
            .ok_or_else(out_of_window)?;
        if end > self.len {
            return Err(out_of_window());
        }
        usize::try_from(offset)
            .ok()
            .and_then(|offset| self.base.checked_add(offset))
            .filter(|at| at.checked_add(width).is_some())
            .ok_or_else(out_of_window)
    }
}

impl RegisterSpace for RegisterWindow {
    fn read<T: RegisterValue>(&self, offset: u64) -> Result<T, RegisterError> {
        let at = self.locate(offset, T::WIDTH)?;
        T::read_mmio(self.region.as_ref(), at)
    }

    fn write<T: RegisterValue>(&self, offset: u64, value: T) -> Result<(), RegisterError> {
        let at = self.locate(offset, T::WIDTH)?;
        value.write_mmio(self.region.as_ref(), at)
    }
}

/// The port range of a legacy I/O BAR.
#[derive(Debug, Clone)]
pub struct PortWindow {
    io: Arc<dyn LegacyIo>,
    base: u16,
}

impl PortWindow {
    pub fn new(io: Arc<dyn LegacyIo>, base: u16) -> Self {
        PortWindow { io, base }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    fn port(&self, offset: u64) -> Result<u16, RegisterError> {
        u16::try_from(offset)
            .ok()
            .and_then(|offset| self.base.checked_add(offset))
            .ok_or(RegisterError::PortOverflow(self.base, offset))
    }
}

impl RegisterSpace for PortWindow {
    fn read<T: RegisterValue>(&self, offset: u64) -> Result<T, RegisterError> {
        T::read_port(self.io.as_ref(), self.port(offset)?)
    }

    fn write<T: RegisterValue>(&self, offset: u64, value: T) -> Result<(), RegisterError> {
        value.write_port(self.io.as_ref(), self.port(offset)?)
    }
}
