// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use log::{debug, warn};
use pci::{InterruptPort, PciFunction, PciIrqMode};

use crate::backend::BackendError;
use crate::config::TransportConfig;

/// MSI-X vector signalling configuration changes.
pub const MSIX_CONFIG_VECTOR: u16 = 0;
/// MSI-X vector signalling used ring updates of every queue.
pub const MSIX_QUEUE_VECTOR: u16 = 1;
/// Vector value meaning "no vector".
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

const MSIX_VECTORS: u32 = 2;
const LEGACY_VECTORS: u32 = 1;

/// How the device signals interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqMode {
    Unconfigured,
    /// INTx line; the cause is read from the ISR status register.
    Legacy,
    /// Vector 0 for configuration changes, vector 1 for ring updates.
    MsiX,
}

/// Interrupt configuration settled at bind time.
#[derive(Debug)]
pub struct InterruptSetup {
    pub mode: IrqMode,
    pub vectors: u32,
    pub port: Arc<dyn InterruptPort>,
}

/// Asks `pci` for MSI-X with one vector per cause, then for a legacy line.
pub fn negotiate_interrupts(
    pci: &dyn PciFunction,
    config: &TransportConfig,
    tag: &str,
) -> Result<InterruptSetup, BackendError> {
    if config.msix_enabled {
        match pci.set_irq_mode(PciIrqMode::MsiX, MSIX_VECTORS) {
            Ok(port) => {
                return Ok(InterruptSetup {
                    mode: IrqMode::MsiX,
                    vectors: MSIX_VECTORS,
                    port,
                })
            }
            Err(err) => debug!("{tag}: MSI-X unavailable: {err}"),
        }
    }

    match pci.set_irq_mode(PciIrqMode::Legacy, LEGACY_VECTORS) {
        Ok(port) => Ok(InterruptSetup {
            mode: IrqMode::Legacy,
            vectors: LEGACY_VECTORS,
            port,
        }),
        Err(err) => {
            warn!("{tag}: legacy interrupts unavailable: {err}");
            Err(BackendError::NoInterruptMode)
        }
    }
}
