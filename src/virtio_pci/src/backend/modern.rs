// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use pci::{
    find_first_capability, find_next_capability, ConfigError, MmioRegion, PciCapabilityId,
    PciDeviceError, PciFunction, NUM_BARS,
};

use super::common_config::*;
use super::{device_status, isr_status, Backend, BackendError, PciTransport};
use crate::capability::{read_cap64, read_notify_off_multiplier, VirtioPciCap, VirtioPciCapType};
use crate::config::TransportConfig;
use crate::interrupt::{IrqMode, MSIX_CONFIG_VECTOR, MSIX_QUEUE_VECTOR};
use crate::metrics::IncMetric;
use crate::registers::{split_u64, RegisterSpace, RegisterWindow};

/// A shared memory region advertised by the device.
#[derive(Debug, Clone)]
pub struct SharedMemoryRegion {
    /// Region id, unique among the shared memory capabilities of the device.
    pub id: u8,
    pub bar: u8,
    /// Offset of the region inside the BAR.
    pub offset: u64,
    pub length: u64,
    /// Mapping of the whole BAR.
    pub mapping: Arc<dyn MmioRegion>,
}

// Resolved register layout. Only reachable through the backend lock.
#[derive(Debug)]
struct ModernRegisters {
    // Keeps every BAR mapping alive for as long as the layout exists.
    _bars: [Option<Arc<dyn MmioRegion>>; NUM_BARS],
    common: RegisterWindow,
    notify: RegisterWindow,
    notify_off_multiplier: u32,
    isr: RegisterWindow,
    device: RegisterWindow,
    shared_memory: Vec<SharedMemoryRegion>,
}

#[derive(Debug, Default)]
struct LayoutBuilder {
    bars: [Option<Arc<dyn MmioRegion>>; NUM_BARS],
    common: Option<RegisterWindow>,
    notify: Option<(RegisterWindow, u32)>,
    isr: Option<RegisterWindow>,
    device: Option<RegisterWindow>,
    shared_memory: Vec<SharedMemoryRegion>,
}

impl LayoutBuilder {
    /// Returns the mapping of `bar`, mapping it on first use.
    fn map_bar(
        &mut self,
        pci: &dyn PciFunction,
        bar: u8,
        tag: &str,
    ) -> Result<Arc<dyn MmioRegion>, BackendError> {
        let slot = self
            .bars
            .get_mut(usize::from(bar))
            .ok_or(PciDeviceError::BarInvalid(bar))?;
        if let Some(region) = slot {
            return Ok(region.clone());
        }

        let info = pci.bar_info(bar)?;
        if !info.is_mmio {
            return Err(BackendError::BarNotMmio(bar));
        }
        let region = pci.map_mmio(bar, &info)?;
        debug!(
            "{tag}: mapped BAR {bar}: {:#x} bytes at {:#x}",
            info.size, info.bus_addr
        );
        *slot = Some(region.clone());
        Ok(region)
    }

    fn window(
        &mut self,
        pci: &dyn PciFunction,
        cap: &VirtioPciCap,
        tag: &str,
    ) -> Result<RegisterWindow, BackendError> {
        let region = self.map_bar(pci, cap.bar, tag)?;
        // An unrepresentable offset yields a window that rejects every access.
        let base = usize::try_from(cap.offset).unwrap_or(usize::MAX);
        Ok(RegisterWindow::new(region, base, u64::from(cap.length)))
    }

    fn add_capability(
        &mut self,
        pci: &dyn PciFunction,
        cap_offset: u8,
        cap: &VirtioPciCap,
        tag: &str,
    ) -> Result<(), BackendError> {
        let Some(cap_type) = cap.cap_type() else {
            debug!("{tag}: skipping unknown virtio capability type {}", cap.cfg_type);
            return Ok(());
        };
        debug!(
            "{tag}: {cap_type:?} capability at {cap_offset:#x}: BAR {} offset {:#x} length {:#x}",
            cap.bar, cap.offset, cap.length
        );

        // The first usable capability of each type wins.
        match cap_type {
            VirtioPciCapType::Common if self.common.is_none() => {
                self.common = Some(self.window(pci, cap, tag)?);
            }
            VirtioPciCapType::Notify if self.notify.is_none() => {
                let multiplier = read_notify_off_multiplier(pci.config(), cap_offset)?;
                self.notify = Some((self.window(pci, cap, tag)?, multiplier));
            }
            VirtioPciCapType::Isr if self.isr.is_none() => {
                self.isr = Some(self.window(pci, cap, tag)?);
            }
            VirtioPciCapType::Device if self.device.is_none() => {
                self.device = Some(self.window(pci, cap, tag)?);
            }
            VirtioPciCapType::SharedMemory => {
                let (offset, length) = read_cap64(pci.config(), cap_offset, cap)?;
                let mapping = self.map_bar(pci, cap.bar, tag)?;
                self.shared_memory.push(SharedMemoryRegion {
                    id: cap.id,
                    bar: cap.bar,
                    offset,
                    length,
                    mapping,
                });
            }
            // BARs are mapped directly, the PCI config access window is not needed.
            VirtioPciCapType::Pci => {}
            _ => debug!("{tag}: ignoring duplicate {cap_type:?} capability"),
        }
        Ok(())
    }

    fn build(self) -> Result<ModernRegisters, BackendError> {
        let common = self.common.ok_or(BackendError::MissingCapability("common"))?;
        let (notify, notify_off_multiplier) = self
            .notify
            .ok_or(BackendError::MissingCapability("notify"))?;
        let isr = self.isr.ok_or(BackendError::MissingCapability("ISR"))?;
        let device = self
            .device
            .ok_or(BackendError::MissingCapability("device"))?;
        Ok(ModernRegisters {
            _bars: self.bars,
            common,
            notify,
            notify_off_multiplier,
            isr,
            device,
            shared_memory: self.shared_memory,
        })
    }
}

/// Backend for devices exposing the capability based MMIO layout.
#[derive(Debug)]
pub struct ModernBackend {
    transport: PciTransport,
    regs: Mutex<Option<ModernRegisters>>,
}

impl ModernBackend {
    pub fn new(pci: Arc<dyn PciFunction>, config: TransportConfig) -> Self {
        ModernBackend {
            transport: PciTransport::new(pci, config),
            regs: Mutex::new(None),
        }
    }

    fn with_regs<T>(
        &self,
        f: impl FnOnce(&ModernRegisters) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let guard = self.regs.lock().expect("Poisoned lock");
        f(guard.as_ref().ok_or(BackendError::NotInitialized)?)
    }

    /// Shared memory regions advertised by the device.
    pub fn shared_memory(&self) -> Result<Vec<SharedMemoryRegion>, BackendError> {
        self.with_regs(|regs| Ok(regs.shared_memory.clone()))
    }

    pub fn num_queues(&self) -> Result<u16, BackendError> {
        self.with_regs(|regs| Ok(regs.common.read(NUM_QUEUES)?))
    }

    pub fn config_generation(&self) -> Result<u8, BackendError> {
        self.with_regs(|regs| Ok(regs.common.read(CONFIG_GENERATION)?))
    }

    fn scan(&self) -> Result<ModernRegisters, BackendError> {
        let pci = self.transport.pci();
        let config = pci.config();
        let tag = self.transport.tag();
        let mut layout = LayoutBuilder::default();

        let mut next = find_first_capability(config, PciCapabilityId::VendorSpecific);
        loop {
            let cap_offset = match next {
                Ok(offset) => offset,
                Err(ConfigError::CapabilityNotFound(_)) => break,
                Err(err) => return Err(err.into()),
            };
            let cap = VirtioPciCap::read(config, cap_offset)?;
            // One unusable capability does not spoil the others.
            if let Err(err) = layout.add_capability(pci, cap_offset, &cap, tag) {
                warn!("{tag}: skipping capability at {cap_offset:#x}: {err}");
            }
            next = find_next_capability(config, PciCapabilityId::VendorSpecific, cap_offset);
        }
        layout.build()
    }
}

impl Backend for ModernBackend {
    fn transport(&self) -> &PciTransport {
        &self.transport
    }

    fn init(&self, _mode: IrqMode) -> Result<(), BackendError> {
        let mut regs = self.regs.lock().expect("Poisoned lock");
        if regs.is_some() {
            return Err(BackendError::AlreadyBound);
        }
        // On failure the partial layout, and every BAR mapped for it, is dropped here.
        let layout = self.scan()?;
        info!(
            "{}: modern virtio device, notify multiplier {}",
            self.transport.tag(),
            layout.notify_off_multiplier
        );
        *regs = Some(layout);
        Ok(())
    }

    fn device_reset(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| Ok(regs.common.write(DEVICE_STATUS, device_status::INIT)?))
    }

    fn wait_for_device_reset(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            self.transport
                .wait_for_reset(|| Ok(regs.common.read::<u8>(DEVICE_STATUS)?))
        })
    }

    fn device_status(&self) -> Result<u8, BackendError> {
        self.with_regs(|regs| Ok(regs.common.read(DEVICE_STATUS)?))
    }

    fn driver_status_ack(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            let status = regs.common.read::<u8>(DEVICE_STATUS)?;
            regs.common.write(
                DEVICE_STATUS,
                status | device_status::ACKNOWLEDGE | device_status::DRIVER,
            )?;
            Ok(())
        })
    }

    fn driver_status_ok(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            let status = regs.common.read::<u8>(DEVICE_STATUS)?;
            regs.common
                .write(DEVICE_STATUS, status | device_status::DRIVER_OK)?;
            Ok(())
        })
    }

    fn read_features(&self) -> Result<u64, BackendError> {
        self.with_regs(|regs| {
            regs.common.write(DEVICE_FEATURE_SELECT, FEATURES_LOW)?;
            let low = regs.common.read::<u32>(DEVICE_FEATURE)?;
            regs.common.write(DEVICE_FEATURE_SELECT, FEATURES_HIGH)?;
            let high = regs.common.read::<u32>(DEVICE_FEATURE)?;
            let features = (u64::from(high) << 32) | u64::from(low);
            debug!("{}: device features {features:#018x}", self.transport.tag());
            Ok(features)
        })
    }

    fn set_features(&self, bitmap: u64) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            let (low, high) = split_u64(bitmap);
            let halves = [(FEATURES_LOW, low), (FEATURES_HIGH, high)];
            for (select, bits) in halves {
                // Halves without bits keep what an earlier negotiation step accepted.
                if bits == 0 {
                    continue;
                }
                regs.common.write(DRIVER_FEATURE_SELECT, select)?;
                let current = regs.common.read::<u32>(DRIVER_FEATURE)?;
                regs.common.write(DRIVER_FEATURE, current | bits)?;
                debug!(
                    "{}: driver features[{select}] {:#010x}",
                    self.transport.tag(),
                    current | bits
                );
            }
            Ok(())
        })
    }

    fn confirm_features(&self) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            let status = regs.common.read::<u8>(DEVICE_STATUS)?;
            regs.common
                .write(DEVICE_STATUS, status | device_status::FEATURES_OK)?;
            if regs.common.read::<u8>(DEVICE_STATUS)? & device_status::FEATURES_OK == 0 {
                warn!("{}: device rejected the feature set", self.transport.tag());
                self.transport.metrics().feature_rejections.inc();
                return Err(BackendError::FeaturesRejected);
            }
            Ok(())
        })
    }

    fn isr_status(&self) -> Result<u8, BackendError> {
        self.with_regs(|regs| Ok(regs.isr.read::<u8>(0)? & isr_status::MASK))
    }

    fn get_ring_size(&self, index: u16) -> Result<u16, BackendError> {
        self.with_regs(|regs| {
            regs.common.write(QUEUE_SELECT, index)?;
            Ok(regs.common.read(QUEUE_SIZE)?)
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
        self.with_regs(|regs| {
            let common = &regs.common;
            common.write(QUEUE_SELECT, index)?;
            common.write(QUEUE_SIZE, count)?;
            common.write(QUEUE_DESC, desc)?;
            common.write(QUEUE_AVAIL, avail)?;
            common.write(QUEUE_USED, used)?;

            if self.transport.irq_mode() == IrqMode::MsiX {
                common.write(MSIX_CONFIG, MSIX_CONFIG_VECTOR)?;
                let vector = common.read::<u16>(MSIX_CONFIG)?;
                if vector != MSIX_CONFIG_VECTOR {
                    return Err(BackendError::VectorMismatch(
                        "config",
                        MSIX_CONFIG_VECTOR,
                        vector,
                    ));
                }
                common.write(QUEUE_MSIX_VECTOR, MSIX_QUEUE_VECTOR)?;
                let vector = common.read::<u16>(QUEUE_MSIX_VECTOR)?;
                if vector != MSIX_QUEUE_VECTOR {
                    return Err(BackendError::VectorMismatch(
                        "queue",
                        MSIX_QUEUE_VECTOR,
                        vector,
                    ));
                }
            }

            common.write(QUEUE_ENABLE, 1u16)?;

            // Notifications are addressed by queue index.
            let notify_off = common.read::<u16>(QUEUE_NOTIFY_OFF)?;
            if notify_off != index {
                return Err(BackendError::NotifyOffsetMismatch(index, notify_off));
            }
            debug!(
                "{}: queue {index}: {count} entries, desc {desc:#x} avail {avail:#x} used {used:#x}",
                self.transport.tag()
            );
            Ok(())
        })
    }

    fn ring_kick(&self, index: u16) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            let offset = u64::from(index) * u64::from(regs.notify_off_multiplier);
            regs.notify.write(offset, index)?;
            self.transport.metrics().kicks.inc();
            Ok(())
        })
    }

    fn read_device_config(&self, offset: u16, data: &mut [u8]) -> Result<(), BackendError> {
        self.with_regs(|regs| Ok(regs.device.read_bytes(u64::from(offset), data)?))
    }

    fn write_device_config(&self, offset: u16, data: &[u8]) -> Result<(), BackendError> {
        self.with_regs(|regs| Ok(regs.device.write_bytes(u64::from(offset), data)?))
    }

    fn copy_device_config(&self, buf: &mut [u8]) -> Result<(), BackendError> {
        self.with_regs(|regs| {
            for (offset, byte) in (0u64..).zip(buf.iter_mut()) {
                *byte = regs.device.read(offset)?;
            }
            Ok(())
        })
    }
}
