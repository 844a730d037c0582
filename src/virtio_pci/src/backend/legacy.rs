// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Legacy (virtio 0.9.5) devices: a fixed register layout at the start of the I/O BAR 0.
//!
//!    le32 host_features;         // 0x00 // read-only
//!    le32 guest_features;        // 0x04 // read-write
//!    le32 queue_pfn;             // 0x08 // read-write
//!    le16 queue_size;            // 0x0C // read-only
//!    le16 queue_select;          // 0x0E // read-write
//!    le16 queue_notify;          // 0x10 // read-write
//!    u8 device_status;           // 0x12 // read-write
//!    u8 isr_status;              // 0x13 // read-only, clear on read
//!    le16 config_msix_vector;    // 0x14 // read-write, only with MSI-X enabled
//!    le16 queue_msix_vector;     // 0x16 // read-write, only with MSI-X enabled
//!
//! The device specific configuration follows at 0x14, or at 0x18 when MSI-X is enabled.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use pci::PciFunction;

use super::{device_status, isr_status, Backend, BackendError, PciTransport};
use crate::config::TransportConfig;
use crate::interrupt::{IrqMode, MSIX_CONFIG_VECTOR, MSIX_QUEUE_VECTOR};
use crate::legacy_io::LegacyIo;
use crate::metrics::IncMetric;
use crate::registers::{split_u64, PortWindow, RegisterSpace};

pub const HOST_FEATURES: u64 = 0x00;
pub const GUEST_FEATURES: u64 = 0x04;
pub const QUEUE_PFN: u64 = 0x08;
pub const QUEUE_SIZE: u64 = 0x0C;
pub const QUEUE_SELECT: u64 = 0x0E;
pub const QUEUE_NOTIFY: u64 = 0x10;
pub const DEVICE_STATUS: u64 = 0x12;
pub const ISR_STATUS: u64 = 0x13;
pub const MSIX_CONFIG_VECTOR_REG: u64 = 0x14;
pub const MSIX_QUEUE_VECTOR_REG: u64 = 0x16;

pub const DEVICE_CONFIG: u64 = 0x14;
pub const DEVICE_CONFIG_MSIX: u64 = 0x18;

/// Legacy rings are addressed by page frame number.
pub const QUEUE_ADDR_SHIFT: u32 = 12;
const QUEUE_ALIGN: u64 = 1 << QUEUE_ADDR_SHIFT;

/// Avail and used ring addresses a legacy device derives from a descriptor table of `size`
/// entries at `desc`: the avail ring follows the table and the used ring starts on the next page
/// boundary after the avail ring.
pub fn ring_layout(desc: u64, size: u16) -> Option<(u64, u64)> {
    let size = u64::from(size);
    let avail = desc.checked_add(16 * size)?;
    // flags, idx, one entry per descriptor and used_event.
    let avail_end = avail.checked_add(6 + 2 * size)?;
    let used = avail_end.checked_next_multiple_of(QUEUE_ALIGN)?;
    Some((avail, used))
}

#[derive(Debug)]
struct LegacyRegisters {
    ports: PortWindow,
    device_config: u64,
}

/// Backend for devices exposing the legacy port I/O layout.
#[derive(Debug)]
pub struct LegacyBackend {
    transport: PciTransport,
    io: Arc<dyn LegacyIo>,
    regs: Mutex<Option<LegacyRegisters>>,
}

impl LegacyBackend {
    pub fn new(pci: Arc<dyn PciFunction>, io: Arc<dyn LegacyIo>, config: TransportConfig) -> Self {
        LegacyBackend {
            transport: PciTransport::new(pci, config),
            io,
            regs: Mutex::new(None),
        }
    }

    fn with_regs<T>(
        &self,
        f: impl FnOnce(&LegacyRegisters) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let guard = self.regs.lock().expect("Poisoned lock");
        f(guard.as_ref().ok_or(BackendError::NotInitialized)?)
    }

    fn bind_vector(
        ports: &PortWindow,
        name: &'static str,
        reg: u64,
        vector: u16,
    ) -> Result<(), BackendError> {
        ports.write(reg, vector)?;
        let readback = ports.read::<u16>(reg)?;
        if readback != vector {
            return Err(BackendError::VectorMismatch(name, vector, readback));
        }
        Ok(())
    }
}

impl Backend for LegacyBackend {
    fn transport(&self) -> &PciTransport {
        &self.transport
    }

    fn init(&self, mode: IrqMode) -> Result<(), BackendError> {
        let mut regs = self.regs.lock().expect("Poisoned lock");
        if regs.is_some() {
            return Err(BackendError::AlreadyBound);
        }
        let pci = self.transport.pci();
        let info = pci.bar_info(0)?;
        if info.is_mmio {
            return Err(BackendError::LegacyBarNotPio);
        }
        let base =
            u16::try_from(info.bus_addr).map_err(|_| BackendError::LegacyBarAddress(info.bus_addr))?;
        pci.enable_pio(0, &info)?;

        // MSI-X adds two vector registers in front of the device configuration.
        let device_config = if mode == IrqMode::MsiX {
            DEVICE_CONFIG_MSIX
        } else {
            DEVICE_CONFIG
        };
        info!(
            "{}: legacy virtio device, I/O ports at {base:#x}",
            self.transport.tag()
        );
        *regs = Some(LegacyRegisters {
            ports: PortWindow::new(self.io.clone(), base),
            device_config,
        });
        Ok(())
    }

    fn device_reset(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| Ok(regs.ports.write(DEVICE_STATUS, device_status::INIT)?))
    }

    fn wait_for_device_reset(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            self.transport
                .wait_for_reset(|| Ok(regs.ports.read::<u8>(DEVICE_STATUS)?))
        })
    }

    fn device_status(&self) -> Result<u8, BackendError> {
        self.with_regs(|regs| Ok(regs.ports.read(DEVICE_STATUS)?))
    }

    fn driver_status_ack(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            let status = regs.ports.read::<u8>(DEVICE_STATUS)?;
            regs.ports.write(
                DEVICE_STATUS,
                status | device_status::ACKNOWLEDGE | device_status::DRIVER,
            )?;
            Ok(())
        })
    }

    fn driver_status_ok(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            let status = regs.ports.read::<u8>(DEVICE_STATUS)?;
            regs.ports
                .write(DEVICE_STATUS, status | device_status::DRIVER_OK)?;
            Ok(())
        })
    }

    fn read_features(&self) -> Result<u64, BackendError> {
        self.with_regs(|regs| {
            let features = regs.ports.read::<u32>(HOST_FEATURES)?;
            debug!("{}: device features {features:#010x}", self.transport.tag());
            Ok(u64::from(features))
        })
    }

    fn set_features(&self, bitmap: u64) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            let (bits, high) = split_u64(bitmap);
            if high != 0 {
                warn!(
                    "{}: legacy devices have 32 feature bits, ignoring {:#x}",
                    self.transport.tag(),
                    bitmap & !0xffff_ffff
                );
            }
            if bits == 0 {
                return Ok(());
            }
            let current = regs.ports.read::<u32>(GUEST_FEATURES)?;
            regs.ports.write(GUEST_FEATURES, current | bits)?;
            debug!(
                "{}: driver features {:#010x}",
                self.transport.tag(),
                current | bits
            );
            Ok(())
        })
    }

    fn confirm_features(&self) -> Result<(), BackendError> {
        // Legacy devices accept whatever the driver writes; there is no FEATURES_OK handshake.
        self.with_regs(|_| Ok(()))
    }

    fn isr_status(&self) -> Result<u8, BackendError> {
        // Reading the register clears it.
        self.with_regs(|regs| Ok(regs.ports.read::<u8>(ISR_STATUS)? & isr_status::MASK))
    }

    fn get_ring_size(&self, index: u16) -> Result<u16, BackendError> {
        self.with_regs(|regs| {
            regs.ports.write(QUEUE_SELECT, index)?;
            Ok(regs.ports.read(QUEUE_SIZE)?)
        })
    }

    fn set_ring(
        &self,
        index: u16,
        count: u16,
        desc: u64,
        avail: u64,
        used: u64,
    ) -> Result<(), BackendError> {
        // The device derives the avail and used rings from the page of the descriptor table.
        if desc % QUEUE_ALIGN != 0 {
            return Err(BackendError::InvalidRingAddress(desc));
        }
        let pfn = u32::try_from(desc >> QUEUE_ADDR_SHIFT)
            .map_err(|_| BackendError::InvalidRingAddress(desc))?;

        self.with_regs(|regs| {
            regs.ports.write(QUEUE_SELECT, index)?;
            // The queue size is fixed by the device.
            let size = regs.ports.read::<u16>(QUEUE_SIZE)?;
            if size == 0 || count != size {
                return Err(BackendError::RingSizeMismatch(index, size, count));
            }
            let (want_avail, want_used) =
                ring_layout(desc, size).ok_or(BackendError::InvalidRingAddress(desc))?;
            if avail != want_avail {
                return Err(BackendError::InvalidRingAddress(avail));
            }
            if used != want_used {
                return Err(BackendError::InvalidRingAddress(used));
            }
            regs.ports.write(QUEUE_PFN, pfn)?;

            if self.transport.irq_mode() == IrqMode::MsiX {
                Self::bind_vector(
                    &regs.ports,
                    "config",
                    MSIX_CONFIG_VECTOR_REG,
                    MSIX_CONFIG_VECTOR,
                )?;
                Self::bind_vector(
                    &regs.ports,
                    "queue",
                    MSIX_QUEUE_VECTOR_REG,
                    MSIX_QUEUE_VECTOR,
                )?;
            }
            debug!(
                "{}: queue {index}: {count} entries, pfn {pfn:#x}",
                self.transport.tag()
            );
            Ok(())
        })
    }

    fn ring_kick(&self, index: u16) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            regs.ports.write(QUEUE_NOTIFY, index)?;
            self.transport.metrics().kicks.inc();
            Ok(())
        })
    }

    fn read_device_config(&self, offset: u16, data: &mut [u8]) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            Ok(regs
                .ports
                .read_bytes(regs.device_config + u64::from(offset), data)?)
        })
    }

    fn write_device_config(&self, offset: u16, data: &[u8]) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            Ok(regs
                .ports
                .write_bytes(regs.device_config + u64::from(offset), data)?)
        })
    }

    fn copy_device_config(&self, buf: &mut [u8]) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            for (offset, byte) in (regs.device_config..).zip(buf.iter_mut()) {
                *byte = regs.ports.read(offset)?;
            }
            Ok(())
        })
    }
}
