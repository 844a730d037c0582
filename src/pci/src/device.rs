// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use crate::configuration::{ConfigError, PciConfigAccess};
use crate::interrupt::InterruptPort;
use crate::mmio::MmioRegion;
use crate::PciBdf;

/// Number of BARs of a type 0 configuration header.
pub const NUM_BARS: usize = 6;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PciDeviceError {
    /// Failed to change bus mastering: {0}
    BusMaster(ConfigError),
    /// Invalid BAR index {0}
    BarInvalid(u8),
    /// BAR {0} is not implemented by the device
    BarNotPresent(u8),
    /// Failed to map BAR {0}: {1}
    BarMap(u8, io::Error),
    /// Interrupt mode {0:?} with {1} vector(s) is not available
    IrqModeUnsupported(PciIrqMode, u32),
    /// PCI function access failed: {0}
    Io(#[from] io::Error),
}

/// Address window assigned to a BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarInfo {
    pub bus_addr: u64,
    pub size: u64,
    pub is_mmio: bool,
    pub is_64bit: bool,
    pub is_prefetchable: bool,
}

/// Interrupt delivery mechanisms a function can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciIrqMode {
    /// Shared INTx line.
    Legacy,
    /// Message signaled, single address.
    Msi,
    /// Message signaled, per vector table entries.
    MsiX,
}

/// Services a driver needs from the bus to operate one PCI function.
///
/// Implementations sit on top of whatever the platform offers (VFIO, uio, sysfs resources) and
/// are shared between a transport and its interrupt thread.
pub trait PciFunction: Debug + Send + Sync {
    /// Address of the function.
    fn bdf(&self) -> PciBdf;

    /// Configuration space of the function.
    fn config(&self) -> &dyn PciConfigAccess;

    /// Enables or disables bus mastering.
    fn set_bus_master(&self, enable: bool) -> Result<(), PciDeviceError>;

    /// Reports the window assigned to `bar`.
    fn bar_info(&self, bar: u8) -> Result<BarInfo, PciDeviceError>;

    /// Maps an MMIO BAR. The mapping lives as long as the returned region.
    fn map_mmio(&self, bar: u8, info: &BarInfo) -> Result<Arc<dyn MmioRegion>, PciDeviceError>;

    /// Grants access to the port range of an I/O BAR.
    fn enable_pio(&self, bar: u8, info: &BarInfo) -> Result<(), PciDeviceError>;

    /// Switches the function to `mode` with `vectors` interrupt vectors and returns the port the
    /// interrupts are delivered on.
    fn set_irq_mode(
        &self,
        mode: PciIrqMode,
        vectors: u32,
    ) -> Result<Arc<dyn InterruptPort>, PciDeviceError>;
}
