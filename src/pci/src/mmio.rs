// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;

use vm_memory::volatile_memory::Error as VolatileMemoryError;
use vm_memory::{ByteValued, MmapRegion, VolatileMemory};

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MmioError {
    /// Access of {width} bytes at {offset:#x} is outside the {size:#x} bytes region
    OutOfBounds {
        offset: usize,
        width: usize,
        size: usize,
    },
    /// Access of {1} bytes at {0:#x} is not naturally aligned
    Unaligned(usize, usize),
    /// Volatile access failed: {0}
    Volatile(#[from] VolatileMemoryError),
}

/// A mapped BAR window that device registers are accessed through.
///
/// Every access is a single volatile load or store of exactly the requested width. Dropping the
/// last reference to a region releases the mapping.
pub trait MmioRegion: Debug + Send + Sync {
    /// Size of the region in bytes.
    fn size(&self) -> usize;
    fn read_u8(&self, offset: usize) -> Result<u8, MmioError>;
    fn read_u16(&self, offset: usize) -> Result<u16, MmioError>;
    fn read_u32(&self, offset: usize) -> Result<u32, MmioError>;
    fn write_u8(&self, offset: usize, value: u8) -> Result<(), MmioError>;
    fn write_u16(&self, offset: usize, value: u16) -> Result<(), MmioError>;
    fn write_u32(&self, offset: usize, value: u32) -> Result<(), MmioError>;
}

/// Validates an access against a region of `size` bytes.
pub fn check_access(offset: usize, width: usize, size: usize) -> Result<(), MmioError> {
    if offset % width != 0 {
        return Err(MmioError::Unaligned(offset, width));
    }
    match offset.checked_add(width) {
        Some(end) if end <= size => Ok(()),
        _ => Err(MmioError::OutOfBounds {
            offset,
            width,
            size,
        }),
    }
}

fn load<T: ByteValued>(region: &MmapRegion, offset: usize) -> Result<T, MmioError> {
    check_access(offset, std::mem::size_of::<T>(), region.size())?;
    Ok(region.get_ref::<T>(offset)?.load())
}

fn store<T: ByteValued>(region: &MmapRegion, offset: usize, value: T) -> Result<(), MmioError> {
    check_access(offset, std::mem::size_of::<T>(), region.size())?;
    region.get_ref::<T>(offset)?.store(value);
    Ok(())
}

/// Mappings produced with `MmapRegion::build_raw` over a physical BAR window, or anonymous
/// regions standing in for device memory.
impl MmioRegion for MmapRegion {
    fn size(&self) -> usize {
        MmapRegion::size(self)
    }

    fn read_u8(&self, offset: usize) -> Result<u8, MmioError> {
        load(self, offset)
    }

    fn read_u16(&self, offset: usize) -> Result<u16, MmioError> {
        load(self, offset)
    }

    fn read_u32(&self, offset: usize) -> Result<u32, MmioError> {
        load(self, offset)
    }

    fn write_u8(&self, offset: usize, value: u8) -> Result<(), MmioError> {
        store(self, offset, value)
    }

    fn write_u16(&self, offset: usize, value: u16) -> Result<(), MmioError> {
        store(self, offset, value)
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<(), MmioError> {
        store(self, offset, value)
    }
}
