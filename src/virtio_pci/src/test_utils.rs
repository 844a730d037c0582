// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::cast_possible_truncation)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pci::{
    check_access, BarInfo, ConfigSpace, EventFdInterruptPort, InterruptPort, MmioError,
    MmioRegion, PciBdf, PciCapability, PciCapabilityId, PciConfigAccess, PciDeviceError,
    PciFunction, PciIrqMode, WaitError, COMMAND_BUS_MASTER, COMMAND_OFFSET, NUM_BARS,
};

use crate::backend::common_config::*;
use crate::backend::legacy::ring_layout;
use crate::backend::{device_status, Backend};
use crate::capability::VirtioPciCapType;
use crate::device::{DeviceError, VirtioDriver};
use crate::interrupt::VIRTIO_MSI_NO_VECTOR;
use crate::legacy_io::LegacyIo;

/// I/O port base of the legacy BAR 0 of `MockPciFunction::legacy`.
pub const LEGACY_PORT_BASE: u16 = 0xc000;

const MOCK_BAR_SIZE: usize = 0x1000;
const MOCK_MMIO_BASE: u64 = 0xfe00_0000;
const MOCK_PIO_SIZE: u64 = 0x40;

// Layout of BAR 0 of `MockModernDevice`.
const NOTIFY_BASE: usize = 0x100;
const NOTIFY_LEN: usize = 0x100;
const NOTIFY_MULTIPLIER: u32 = 4;
const ISR_BASE: usize = 0x200;
const ISR_LEN: usize = 0x4;
const DEVICE_CFG_BASE: usize = 0x300;
const DEVICE_CFG_LEN: usize = 0x100;

const NUM_QUEUES_DEFAULT: u16 = 4;
const MODERN_QUEUE_SIZE: u16 = 256;
const LEGACY_QUEUE_SIZE: u16 = 128;

fn mask(width: usize) -> u32 {
    match width {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

fn read_le(bytes: &[u8], offset: usize, width: usize) -> u32 {
    bytes[offset..offset + width]
        .iter()
        .rev()
        .fold(0, |acc, byte| (acc << 8) | u32::from(*byte))
}

fn write_le(bytes: &mut [u8], offset: usize, width: usize, value: u32) {
    for (i, byte) in bytes[offset..offset + width].iter_mut().enumerate() {
        *byte = (value >> (i * 8)) as u8;
    }
}

fn set_half(value: &mut u64, high: bool, half: u32) {
    if high {
        *value = (*value & 0xffff_ffff) | (u64::from(half) << 32);
    } else {
        *value = (*value & !0xffff_ffff) | u64::from(half);
    }
}

fn get_half(value: u64, high: bool) -> u32 {
    if high {
        (value >> 32) as u32
    } else {
        value as u32
    }
}

/// A single access seen by a recording MMIO region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioAccess {
    Read { offset: usize, width: usize },
    Write { offset: usize, width: usize, value: u32 },
}

/// Plain memory region that logs every access.
#[derive(Debug)]
pub struct RecordingRegion {
    memory: Mutex<Vec<u8>>,
    accesses: Mutex<Vec<MmioAccess>>,
}

impl RecordingRegion {
    pub fn new(size: usize) -> Self {
        RecordingRegion {
            memory: Mutex::new(vec![0; size]),
            accesses: Mutex::new(Vec::new()),
        }
    }

    pub fn accesses(&self) -> Vec<MmioAccess> {
        self.accesses.lock().unwrap().clone()
    }

    fn read(&self, offset: usize, width: usize) -> Result<u32, MmioError> {
        let memory = self.memory.lock().unwrap();
        check_access(offset, width, memory.len())?;
        self.accesses
            .lock()
            .unwrap()
            .push(MmioAccess::Read { offset, width });
        Ok(read_le(&memory, offset, width))
    }

    fn write(&self, offset: usize, width: usize, value: u32) -> Result<(), MmioError> {
        let mut memory = self.memory.lock().unwrap();
        check_access(offset, width, memory.len())?;
        self.accesses.lock().unwrap().push(MmioAccess::Write {
            offset,
            width,
            value,
        });
        write_le(&mut memory, offset, width, value);
        Ok(())
    }
}

// Routes the sized `MmioRegion` accessors to `read(offset, width)` and
// `write(offset, width, value)` of the implementing type.
macro_rules! mmio_region_impl {
    ($ty:ty) => {
        impl MmioRegion for $ty {
            fn size(&self) -> usize {
                self.region_size()
            }

            fn read_u8(&self, offset: usize) -> Result<u8, MmioError> {
                Ok(self.read(offset, 1)? as u8)
            }

            fn read_u16(&self, offset: usize) -> Result<u16, MmioError> {
                Ok(self.read(offset, 2)? as u16)
            }

            fn read_u32(&self, offset: usize) -> Result<u32, MmioError> {
                self.read(offset, 4)
            }

            fn write_u8(&self, offset: usize, value: u8) -> Result<(), MmioError> {
                self.write(offset, 1, u32::from(value))
            }

            fn write_u16(&self, offset: usize, value: u16) -> Result<(), MmioError> {
                self.write(offset, 2, u32::from(value))
            }

            fn write_u32(&self, offset: usize, value: u32) -> Result<(), MmioError> {
                self.write(offset, 4, value)
            }
        }
    };
}

impl RecordingRegion {
    fn region_size(&self) -> usize {
        self.memory.lock().unwrap().len()
    }
}

mmio_region_impl!(RecordingRegion);

/// Raw port space: every port holds one byte.
#[derive(Debug)]
pub struct MockLegacyIo {
    ports: Mutex<Vec<u8>>,
    writes: Mutex<Vec<(u16, usize)>>,
}

impl Default for MockLegacyIo {
    fn default() -> Self {
        MockLegacyIo {
            ports: Mutex::new(vec![0; 0x1_0000]),
            writes: Mutex::new(Vec::new()),
        }
    }
}

impl MockLegacyIo {
    /// Port and width of every write, in order.
    pub fn writes(&self) -> Vec<(u16, usize)> {
        self.writes.lock().unwrap().clone()
    }

    fn range(port: u16, width: usize) -> io::Result<usize> {
        let start = usize::from(port);
        if start + width > 0x1_0000 {
            return Err(io::Error::other("port access past the end of the port space"));
        }
        Ok(start)
    }

    fn read(&self, port: u16, width: usize) -> io::Result<u32> {
        let start = Self::range(port, width)?;
        Ok(read_le(&self.ports.lock().unwrap(), start, width))
    }

    fn write(&self, port: u16, width: usize, value: u32) -> io::Result<()> {
        let start = Self::range(port, width)?;
        self.writes.lock().unwrap().push((port, width));
        write_le(&mut self.ports.lock().unwrap(), start, width, value);
        Ok(())
    }
}

// Routes the `LegacyIo` accessors to `read(port, width)` and `write(port, width, value)`.
macro_rules! legacy_io_impl {
    ($ty:ty) => {
        impl LegacyIo for $ty {
            fn inb(&self, port: u16) -> io::Result<u8> {
                Ok(self.read(port, 1)? as u8)
            }

            fn inw(&self, port: u16) -> io::Result<u16> {
                Ok(self.read(port, 2)? as u16)
            }

            fn inl(&self, port: u16) -> io::Result<u32> {
                self.read(port, 4)
            }

            fn outb(&self, port: u16, value: u8) -> io::Result<()> {
                self.write(port, 1, u32::from(value))
            }

            fn outw(&self, port: u16, value: u16) -> io::Result<()> {
                self.write(port, 2, u32::from(value))
            }

            fn outl(&self, port: u16, value: u32) -> io::Result<()> {
                self.write(port, 4, value)
            }
        }
    };
}

legacy_io_impl!(MockLegacyIo);

/// Virtio capability without trailing fields.
#[derive(Debug)]
pub struct PciCap {
    bytes: Vec<u8>,
}

fn cap_bytes(cap_len: u8, cfg_type: u8, bar: u8, offset: u32, length: u32) -> Vec<u8> {
    // cap_len, cfg_type, bar, id, padding[2], offset, length
    let mut bytes = vec![cap_len, cfg_type, bar, 0, 0, 0];
    bytes.extend_from_slice(&offset.to_le_bytes());
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes
}

impl PciCap {
    pub fn new(cfg_type: VirtioPciCapType, bar: u8, offset: u32, length: u32) -> Self {
        Self::new_raw(cfg_type as u8, bar, offset, length)
    }

    pub fn new_raw(cfg_type: u8, bar: u8, offset: u32, length: u32) -> Self {
        PciCap {
            bytes: cap_bytes(16, cfg_type, bar, offset, length),
        }
    }
}

impl PciCapability for PciCap {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn id(&self) -> PciCapabilityId {
        PciCapabilityId::VendorSpecific
    }
}

/// Notify capability with its offset multiplier.
#[derive(Debug)]
pub struct PciNotifyCap {
    bytes: Vec<u8>,
}

impl PciNotifyCap {
    pub fn new(bar: u8, offset: u32, length: u32, multiplier: u32) -> Self {
        let mut bytes = cap_bytes(20, VirtioPciCapType::Notify as u8, bar, offset, length);
        bytes.extend_from_slice(&multiplier.to_le_bytes());
        PciNotifyCap { bytes }
    }
}

impl PciCapability for PciNotifyCap {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn id(&self) -> PciCapabilityId {
        PciCapabilityId::VendorSpecific
    }
}

/// Shared memory capability with 64-bit offset and length.
#[derive(Debug)]
pub struct PciCap64 {
    bytes: Vec<u8>,
}

impl PciCap64 {
    pub fn new(bar: u8, offset: u64, length: u64) -> Self {
        let mut bytes = cap_bytes(
            24,
            VirtioPciCapType::SharedMemory as u8,
            bar,
            offset as u32,
            length as u32,
        );
        bytes.extend_from_slice(&((offset >> 32) as u32).to_le_bytes());
        bytes.extend_from_slice(&((length >> 32) as u32).to_le_bytes());
        PciCap64 { bytes }
    }
}

impl PciCapability for PciCap64 {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn id(&self) -> PciCapabilityId {
        PciCapabilityId::VendorSpecific
    }
}

/// Queue registers of `MockModernDevice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockQueue {
    pub size: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
    pub msix_vector: u16,
    pub enabled: bool,
}

impl Default for MockQueue {
    fn default() -> Self {
        MockQueue {
            size: MODERN_QUEUE_SIZE,
            desc: 0,
            avail: 0,
            used: 0,
            msix_vector: VIRTIO_MSI_NO_VECTOR,
            enabled: false,
        }
    }
}

#[derive(Debug)]
struct ModernState {
    device_feature_select: u32,
    driver_feature_select: u32,
    device_features: u64,
    driver_features: u64,
    msix_config: u16,
    status: u8,
    config_generation: u8,
    queue_select: u16,
    queues: Vec<MockQueue>,
    isr: u8,
    device_config: Vec<u8>,
    reset_polls: u32,
    reset_pending: u32,
    accept_features: bool,
    msix_supported: bool,
    mirror_features: bool,
    notify_off_override: Option<u16>,
    accesses: Vec<MmioAccess>,
    notifications: Vec<(usize, u16)>,
}

impl ModernState {
    fn queue(&mut self) -> Option<&mut MockQueue> {
        self.queues.get_mut(usize::from(self.queue_select))
    }

    fn reset(&mut self) {
        self.status = device_status::INIT;
        self.driver_features = 0;
        self.msix_config = VIRTIO_MSI_NO_VECTOR;
        self.queues = vec![MockQueue::default(); self.queues.len()];
        self.reset_pending = self.reset_polls;
    }

    fn read_common(&mut self, offset: u64) -> u32 {
        let queue = self.queues.get(usize::from(self.queue_select)).copied();
        match offset {
            DEVICE_FEATURE_SELECT => self.device_feature_select,
            DEVICE_FEATURE => {
                let features = if self.mirror_features {
                    self.driver_features
                } else {
                    self.device_features
                };
                get_half(features, self.device_feature_select == FEATURES_HIGH)
            }
            DRIVER_FEATURE_SELECT => self.driver_feature_select,
            DRIVER_FEATURE => get_half(
                self.driver_features,
                self.driver_feature_select == FEATURES_HIGH,
            ),
            MSIX_CONFIG => u32::from(self.msix_config),
            NUM_QUEUES => self.queues.len() as u32,
            DEVICE_STATUS => {
                if self.reset_pending > 0 {
                    self.reset_pending -= 1;
                    return u32::from(device_status::ACKNOWLEDGE);
                }
                u32::from(self.status)
            }
            CONFIG_GENERATION => u32::from(self.config_generation),
            QUEUE_SELECT => u32::from(self.queue_select),
            QUEUE_SIZE => queue.map_or(0, |q| u32::from(q.size)),
            QUEUE_MSIX_VECTOR => queue.map_or(0, |q| u32::from(q.msix_vector)),
            QUEUE_ENABLE => queue.map_or(0, |q| u32::from(q.enabled)),
            QUEUE_NOTIFY_OFF => u32::from(self.notify_off_override.unwrap_or(self.queue_select)),
            o if (QUEUE_DESC..QUEUE_DESC + 8).contains(&o) => {
                queue.map_or(0, |q| get_half(q.desc, o != QUEUE_DESC))
            }
            o if (QUEUE_AVAIL..QUEUE_AVAIL + 8).contains(&o) => {
                queue.map_or(0, |q| get_half(q.avail, o != QUEUE_AVAIL))
            }
            o if (QUEUE_USED..QUEUE_USED + 8).contains(&o) => {
                queue.map_or(0, |q| get_half(q.used, o != QUEUE_USED))
            }
            _ => 0,
        }
    }

    fn write_common(&mut self, offset: u64, value: u32) {
        let msix_supported = self.msix_supported;
        let vector = |value: u32| {
            if msix_supported {
                value as u16
            } else {
                VIRTIO_MSI_NO_VECTOR
            }
        };
        match offset {
            DEVICE_FEATURE_SELECT => self.device_feature_select = value,
            DRIVER_FEATURE_SELECT => self.driver_feature_select = value,
            DRIVER_FEATURE => {
                let high = self.driver_feature_select == FEATURES_HIGH;
                set_half(&mut self.driver_features, high, value);
            }
            MSIX_CONFIG => self.msix_config = vector(value),
            DEVICE_STATUS => {
                let mut status = value as u8;
                if status == device_status::INIT {
                    self.reset();
                    return;
                }
                if !self.accept_features {
                    status &= !device_status::FEATURES_OK;
                }
                self.status = status;
            }
            QUEUE_SELECT => self.queue_select = value as u16,
            QUEUE_SIZE => {
                if let Some(q) = self.queue() {
                    q.size = value as u16;
                }
            }
            QUEUE_MSIX_VECTOR => {
                let vector = vector(value);
                if let Some(q) = self.queue() {
                    q.msix_vector = vector;
                }
            }
            QUEUE_ENABLE => {
                if let Some(q) = self.queue() {
                    q.enabled = value != 0;
                }
            }
            o if (QUEUE_DESC..QUEUE_DESC + 8).contains(&o) => {
                if let Some(q) = self.queue() {
                    set_half(&mut q.desc, o != QUEUE_DESC, value);
                }
            }
            o if (QUEUE_AVAIL..QUEUE_AVAIL + 8).contains(&o) => {
                if let Some(q) = self.queue() {
                    set_half(&mut q.avail, o != QUEUE_AVAIL, value);
                }
            }
            o if (QUEUE_USED..QUEUE_USED + 8).contains(&o) => {
                if let Some(q) = self.queue() {
                    set_half(&mut q.used, o != QUEUE_USED, value);
                }
            }
            _ => {}
        }
    }
}

/// Modern virtio device behind BAR 0.
///
/// Layout: common configuration at 0x0, notifications at 0x100 with a multiplier of 4, ISR at
/// 0x200 and 0x100 bytes of device configuration at 0x300.
#[derive(Debug)]
pub struct MockModernDevice {
    state: Mutex<ModernState>,
}

impl Default for MockModernDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockModernDevice {
    pub fn new() -> Self {
        MockModernDevice {
            state: Mutex::new(ModernState {
                device_feature_select: 0,
                driver_feature_select: 0,
                device_features: 0,
                driver_features: 0,
                msix_config: VIRTIO_MSI_NO_VECTOR,
                status: device_status::INIT,
                config_generation: 0,
                queue_select: 0,
                queues: vec![MockQueue::default(); usize::from(NUM_QUEUES_DEFAULT)],
                isr: 0,
                device_config: vec![0; DEVICE_CFG_LEN],
                reset_polls: 0,
                reset_pending: 0,
                accept_features: true,
                msix_supported: true,
                mirror_features: false,
                notify_off_override: None,
                accesses: Vec::new(),
                notifications: Vec::new(),
            }),
        }
    }

    /// Number of status reads a reset stays pending for.
    pub fn set_reset_polls(&self, polls: u32) {
        self.state.lock().unwrap().reset_polls = polls;
    }

    pub fn set_accept_features(&self, accept: bool) {
        self.state.lock().unwrap().accept_features = accept;
    }

    pub fn set_msix_supported(&self, supported: bool) {
        self.state.lock().unwrap().msix_supported = supported;
    }

    /// Makes the device offer exactly what the driver accepted.
    pub fn set_mirror_features(&self, mirror: bool) {
        self.state.lock().unwrap().mirror_features = mirror;
    }

    pub fn set_notify_off_override(&self, notify_off: Option<u16>) {
        self.state.lock().unwrap().notify_off_override = notify_off;
    }

    pub fn set_device_features(&self, features: u64) {
        self.state.lock().unwrap().device_features = features;
    }

    pub fn set_isr(&self, isr: u8) {
        self.state.lock().unwrap().isr = isr;
    }

    pub fn set_device_config(&self, data: &[u8]) {
        self.state.lock().unwrap().device_config[..data.len()].copy_from_slice(data);
    }

    pub fn bump_config_generation(&self) {
        let mut state = self.state.lock().unwrap();
        state.config_generation = state.config_generation.wrapping_add(1);
    }

    pub fn status(&self) -> u8 {
        self.state.lock().unwrap().status
    }

    pub fn driver_features(&self) -> u64 {
        self.state.lock().unwrap().driver_features
    }

    pub fn queue(&self, index: usize) -> MockQueue {
        self.state.lock().unwrap().queues[index]
    }

    pub fn accesses(&self) -> Vec<MmioAccess> {
        self.state.lock().unwrap().accesses.clone()
    }

    pub fn clear_accesses(&self) {
        let mut state = self.state.lock().unwrap();
        state.accesses.clear();
        state.notifications.clear();
    }

    /// BAR offset and value of every notification write.
    pub fn notifications(&self) -> Vec<(usize, u16)> {
        self.state.lock().unwrap().notifications.clone()
    }

    fn region_size(&self) -> usize {
        MOCK_BAR_SIZE
    }

    fn read(&self, offset: usize, width: usize) -> Result<u32, MmioError> {
        check_access(offset, width, MOCK_BAR_SIZE)?;
        let mut state = self.state.lock().unwrap();
        state.accesses.push(MmioAccess::Read { offset, width });
        let value = match offset {
            o if o < COMMON_CONFIG_SIZE as usize => state.read_common(o as u64),
            o if (ISR_BASE..ISR_BASE + ISR_LEN).contains(&o) => u32::from(state.isr),
            o if (DEVICE_CFG_BASE..DEVICE_CFG_BASE + DEVICE_CFG_LEN).contains(&o) => {
                read_le(&state.device_config, o - DEVICE_CFG_BASE, width)
            }
            _ => 0,
        };
        Ok(value & mask(width))
    }

    fn write(&self, offset: usize, width: usize, value: u32) -> Result<(), MmioError> {
        check_access(offset, width, MOCK_BAR_SIZE)?;
        let mut state = self.state.lock().unwrap();
        state.accesses.push(MmioAccess::Write {
            offset,
            width,
            value,
        });
        match offset {
            o if o < COMMON_CONFIG_SIZE as usize => state.write_common(o as u64, value),
            o if (NOTIFY_BASE..NOTIFY_BASE + NOTIFY_LEN).contains(&o) => {
                state.notifications.push((o, value as u16));
            }
            o if (DEVICE_CFG_BASE..DEVICE_CFG_BASE + DEVICE_CFG_LEN).contains(&o) => {
                write_le(&mut state.device_config, o - DEVICE_CFG_BASE, width, value);
            }
            _ => {}
        }
        Ok(())
    }
}

mmio_region_impl!(MockModernDevice);

#[derive(Debug, Clone, Copy)]
struct LegacyQueue {
    pfn: u32,
    vector: u16,
}

#[derive(Debug)]
struct LegacyState {
    host_features: u32,
    guest_features: u32,
    queue_select: u16,
    queues: Vec<LegacyQueue>,
    status: u8,
    isr: u8,
    config_vector: u16,
    msix_enabled: bool,
    msix_supported: bool,
    device_config: Vec<u8>,
    reset_polls: u32,
    reset_pending: u32,
    notifications: Vec<u16>,
    port_writes: Vec<(u16, usize)>,
}

impl LegacyState {
    fn device_config_start(&self) -> usize {
        if self.msix_enabled {
            0x18
        } else {
            0x14
        }
    }

    fn queue(&mut self) -> Option<&mut LegacyQueue> {
        self.queues.get_mut(usize::from(self.queue_select))
    }

    fn vector(&self, value: u32) -> u16 {
        if self.msix_supported {
            value as u16
        } else {
            VIRTIO_MSI_NO_VECTOR
        }
    }

    fn read(&mut self, offset: usize, width: usize) -> u32 {
        let config_start = self.device_config_start();
        if offset >= config_start {
            let offset = offset - config_start;
            if offset + width > self.device_config.len() {
                return mask(width);
            }
            return read_le(&self.device_config, offset, width);
        }
        let queue = self.queues.get(usize::from(self.queue_select)).copied();
        match offset {
            0x00 => self.host_features,
            0x04 => self.guest_features,
            0x08 => queue.map_or(0, |q| q.pfn),
            0x0c => queue.map_or(0, |_| u32::from(LEGACY_QUEUE_SIZE)),
            0x0e => u32::from(self.queue_select),
            0x12 => {
                if self.reset_pending > 0 {
                    self.reset_pending -= 1;
                    return u32::from(device_status::ACKNOWLEDGE);
                }
                u32::from(self.status)
            }
            0x13 => u32::from(std::mem::take(&mut self.isr)),
            0x14 => u32::from(self.config_vector),
            0x16 => queue.map_or(u32::from(VIRTIO_MSI_NO_VECTOR), |q| u32::from(q.vector)),
            _ => 0,
        }
    }

    fn write(&mut self, offset: usize, width: usize, value: u32) {
        let config_start = self.device_config_start();
        if offset >= config_start {
            let offset = offset - config_start;
            if offset + width <= self.device_config.len() {
                write_le(&mut self.device_config, offset, width, value);
            }
            return;
        }
        match offset {
            0x04 => self.guest_features = value,
            0x08 => {
                if let Some(q) = self.queue() {
                    q.pfn = value;
                }
            }
            0x0e => self.queue_select = value as u16,
            0x10 => self.notifications.push(value as u16),
            0x12 => {
                self.status = value as u8;
                if self.status == device_status::INIT {
                    self.guest_features = 0;
                    for queue in self.queues.iter_mut() {
                        queue.pfn = 0;
                    }
                    self.reset_pending = self.reset_polls;
                }
            }
            0x14 => self.config_vector = self.vector(value),
            0x16 => {
                let vector = self.vector(value);
                if let Some(q) = self.queue() {
                    q.vector = vector;
                }
            }
            _ => {}
        }
    }
}

/// Legacy virtio device decoding the ports of `LEGACY_PORT_BASE`.
#[derive(Debug)]
pub struct MockLegacyDevice {
    state: Mutex<LegacyState>,
}

impl Default for MockLegacyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLegacyDevice {
    pub fn new() -> Self {
        MockLegacyDevice {
            state: Mutex::new(LegacyState {
                host_features: 0,
                guest_features: 0,
                queue_select: 0,
                queues: vec![
                    LegacyQueue {
                        pfn: 0,
                        vector: VIRTIO_MSI_NO_VECTOR,
                    };
                    usize::from(NUM_QUEUES_DEFAULT)
                ],
                status: device_status::INIT,
                isr: 0,
                config_vector: VIRTIO_MSI_NO_VECTOR,
                msix_enabled: true,
                msix_supported: true,
                device_config: vec![0; 0x100],
                reset_polls: 0,
                reset_pending: 0,
                notifications: Vec::new(),
                port_writes: Vec::new(),
            }),
        }
    }

    pub fn set_host_features(&self, features: u32) {
        self.state.lock().unwrap().host_features = features;
    }

    pub fn set_reset_polls(&self, polls: u32) {
        self.state.lock().unwrap().reset_polls = polls;
    }

    pub fn set_msix_supported(&self, supported: bool) {
        self.state.lock().unwrap().msix_supported = supported;
    }

    /// Whether the MSI-X vector registers precede the device configuration.
    pub fn set_msix_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().msix_enabled = enabled;
    }

    pub fn raise_isr(&self, bits: u8) {
        self.state.lock().unwrap().isr |= bits;
    }

    pub fn set_device_config(&self, data: &[u8]) {
        self.state.lock().unwrap().device_config[..data.len()].copy_from_slice(data);
    }

    pub fn guest_features(&self) -> u32 {
        self.state.lock().unwrap().guest_features
    }

    pub fn queue_pfn(&self, index: usize) -> u32 {
        self.state.lock().unwrap().queues[index].pfn
    }

    pub fn queue_vector(&self, index: usize) -> u16 {
        self.state.lock().unwrap().queues[index].vector
    }

    pub fn config_vector(&self) -> u16 {
        self.state.lock().unwrap().config_vector
    }

    pub fn notifications(&self) -> Vec<u16> {
        self.state.lock().unwrap().notifications.clone()
    }

    pub fn port_writes(&self) -> Vec<(u16, usize)> {
        self.state.lock().unwrap().port_writes.clone()
    }

    fn offset(port: u16) -> io::Result<usize> {
        port.checked_sub(LEGACY_PORT_BASE)
            .map(usize::from)
            .ok_or_else(|| io::Error::other(format!("port {port:#x} not decoded")))
    }

    fn read(&self, port: u16, width: usize) -> io::Result<u32> {
        let offset = Self::offset(port)?;
        Ok(self.state.lock().unwrap().read(offset, width) & mask(width))
    }

    fn write(&self, port: u16, width: usize, value: u32) -> io::Result<()> {
        let offset = Self::offset(port)?;
        let mut state = self.state.lock().unwrap();
        state.port_writes.push((port, width));
        state.write(offset, width, value & mask(width));
        Ok(())
    }
}

legacy_io_impl!(MockLegacyDevice);

// Keeps count of the mappings handed out that are still alive.
#[derive(Debug)]
struct TrackedMapping {
    region: Arc<dyn MmioRegion>,
    live: Arc<AtomicUsize>,
}

impl Drop for TrackedMapping {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MmioRegion for TrackedMapping {
    fn size(&self) -> usize {
        self.region.size()
    }

    fn read_u8(&self, offset: usize) -> Result<u8, MmioError> {
        self.region.read_u8(offset)
    }

    fn read_u16(&self, offset: usize) -> Result<u16, MmioError> {
        self.region.read_u16(offset)
    }

    fn read_u32(&self, offset: usize) -> Result<u32, MmioError> {
        self.region.read_u32(offset)
    }

    fn write_u8(&self, offset: usize, value: u8) -> Result<(), MmioError> {
        self.region.write_u8(offset, value)
    }

    fn write_u16(&self, offset: usize, value: u16) -> Result<(), MmioError> {
        self.region.write_u16(offset, value)
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<(), MmioError> {
        self.region.write_u32(offset, value)
    }
}

#[derive(Debug, Clone)]
enum MockBar {
    Mmio(Arc<dyn MmioRegion>),
    Pio(u64),
}

#[derive(Debug, Default)]
struct MockPciState {
    map_calls: usize,
    pio_enabled: Vec<u8>,
    irq_requests: Vec<(PciIrqMode, u32)>,
    port: Option<Arc<EventFdInterruptPort>>,
}

/// PCI function at 0000:00:03.0 with an in-memory configuration space.
#[derive(Debug)]
pub struct MockPciFunction {
    bdf: PciBdf,
    config: ConfigSpace,
    bars: [Option<MockBar>; NUM_BARS],
    pub msix_ok: bool,
    pub legacy_ok: bool,
    pub bus_master_ok: bool,
    /// When false, cancelling an interrupt wait fails.
    pub cancel_ok: bool,
    state: Mutex<MockPciState>,
    live: Arc<AtomicUsize>,
}

impl Default for MockPciFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPciFunction {
    /// A function with no capabilities and no BARs.
    pub fn new() -> Self {
        MockPciFunction {
            bdf: PciBdf::new(0, 0, 3, 0),
            config: ConfigSpace::new(0x1af4, 0x1041),
            bars: Default::default(),
            msix_ok: true,
            legacy_ok: true,
            bus_master_ok: true,
            cancel_ok: true,
            state: Mutex::new(MockPciState::default()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Legacy device: I/O BAR 0 at `LEGACY_PORT_BASE`.
    pub fn legacy() -> Self {
        let mut pci = Self::new();
        pci.set_pio_bar(0, u64::from(LEGACY_PORT_BASE));
        pci
    }

    /// Modern device with every structure in BAR 0, laid out as `MockModernDevice` decodes it.
    pub fn modern(device: Arc<MockModernDevice>) -> Self {
        let mut pci = Self::new();
        pci.add_capability(&PciCap::new(
            VirtioPciCapType::Common,
            0,
            0,
            COMMON_CONFIG_SIZE as u32,
        ));
        pci.add_capability(&PciNotifyCap::new(
            0,
            NOTIFY_BASE as u32,
            NOTIFY_LEN as u32,
            NOTIFY_MULTIPLIER,
        ));
        pci.add_capability(&PciCap::new(
            VirtioPciCapType::Isr,
            0,
            ISR_BASE as u32,
            ISR_LEN as u32,
        ));
        pci.add_capability(&PciCap::new(
            VirtioPciCapType::Device,
            0,
            DEVICE_CFG_BASE as u32,
            DEVICE_CFG_LEN as u32,
        ));
        pci.set_mmio_bar(0, device);
        pci
    }

    pub fn add_capability(&mut self, cap: &dyn PciCapability) {
        self.config.add_capability(cap).unwrap();
    }

    pub fn set_mmio_bar(&mut self, bar: u8, region: Arc<dyn MmioRegion>) {
        self.bars[usize::from(bar)] = Some(MockBar::Mmio(region));
    }

    pub fn set_pio_bar(&mut self, bar: u8, addr: u64) {
        self.bars[usize::from(bar)] = Some(MockBar::Pio(addr));
    }

    pub fn bus_master_enabled(&self) -> bool {
        self.config.read_u16(COMMAND_OFFSET).unwrap() & COMMAND_BUS_MASTER != 0
    }

    pub fn map_calls(&self) -> usize {
        self.state.lock().unwrap().map_calls
    }

    /// Mappings handed out by `map_mmio` that were not dropped yet.
    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn pio_enabled(&self) -> Vec<u8> {
        self.state.lock().unwrap().pio_enabled.clone()
    }

    pub fn irq_requests(&self) -> Vec<(PciIrqMode, u32)> {
        self.state.lock().unwrap().irq_requests.clone()
    }

    /// The port of the last successful `set_irq_mode`, for injecting interrupts.
    pub fn interrupt_port(&self) -> Option<Arc<EventFdInterruptPort>> {
        self.state.lock().unwrap().port.clone()
    }

    fn bar(&self, bar: u8) -> Result<&MockBar, PciDeviceError> {
        self.bars
            .get(usize::from(bar))
            .ok_or(PciDeviceError::BarInvalid(bar))?
            .as_ref()
            .ok_or(PciDeviceError::BarNotPresent(bar))
    }
}

impl PciFunction for MockPciFunction {
    fn bdf(&self) -> PciBdf {
        self.bdf
    }

    fn config(&self) -> &dyn PciConfigAccess {
        &self.config
    }

    fn set_bus_master(&self, enable: bool) -> Result<(), PciDeviceError> {
        if enable && !self.bus_master_ok {
            return Err(PciDeviceError::BusMaster(pci::ConfigError::Io(
                io::Error::other("command register is read-only"),
            )));
        }
        let command = self
            .config
            .read_u16(COMMAND_OFFSET)
            .map_err(PciDeviceError::BusMaster)?;
        let command = if enable {
            command | COMMAND_BUS_MASTER
        } else {
            command & !COMMAND_BUS_MASTER
        };
        self.config
            .write_u16(COMMAND_OFFSET, command)
            .map_err(PciDeviceError::BusMaster)
    }

    fn bar_info(&self, bar: u8) -> Result<BarInfo, PciDeviceError> {
        Ok(match self.bar(bar)? {
            MockBar::Mmio(region) => BarInfo {
                bus_addr: MOCK_MMIO_BASE + u64::from(bar) * 0x10_0000,
                size: region.size() as u64,
                is_mmio: true,
                ..Default::default()
            },
            MockBar::Pio(addr) => BarInfo {
                bus_addr: *addr,
                size: MOCK_PIO_SIZE,
                ..Default::default()
            },
        })
    }

    fn map_mmio(&self, bar: u8, _info: &BarInfo) -> Result<Arc<dyn MmioRegion>, PciDeviceError> {
        match self.bar(bar)? {
            MockBar::Mmio(region) => {
                self.state.lock().unwrap().map_calls += 1;
                self.live.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(TrackedMapping {
                    region: region.clone(),
                    live: self.live.clone(),
                }))
            }
            MockBar::Pio(_) => Err(PciDeviceError::BarMap(
                bar,
                io::Error::other("not a memory BAR"),
            )),
        }
    }

    fn enable_pio(&self, bar: u8, _info: &BarInfo) -> Result<(), PciDeviceError> {
        match self.bar(bar)? {
            MockBar::Pio(_) => {
                self.state.lock().unwrap().pio_enabled.push(bar);
                Ok(())
            }
            MockBar::Mmio(_) => Err(PciDeviceError::BarNotPresent(bar)),
        }
    }

    fn set_irq_mode(
        &self,
        mode: PciIrqMode,
        vectors: u32,
    ) -> Result<Arc<dyn InterruptPort>, PciDeviceError> {
        let mut state = self.state.lock().unwrap();
        state.irq_requests.push((mode, vectors));
        let supported = match mode {
            PciIrqMode::MsiX => self.msix_ok,
            PciIrqMode::Legacy => self.legacy_ok,
            PciIrqMode::Msi => false,
        };
        if !supported {
            return Err(PciDeviceError::IrqModeUnsupported(mode, vectors));
        }
        let port = Arc::new(EventFdInterruptPort::new(vectors)?);
        state.port = Some(port.clone());
        if self.cancel_ok {
            Ok(port)
        } else {
            Ok(Arc::new(UncancellablePort(port)))
        }
    }
}

/// Interrupt port whose waits can only end by an interrupt or a timeout.
#[derive(Debug)]
struct UncancellablePort(Arc<EventFdInterruptPort>);

impl InterruptPort for UncancellablePort {
    fn wait(&self, timeout: Option<std::time::Duration>) -> Result<u32, WaitError> {
        self.0.wait(timeout)
    }

    fn ack(&self, key: u32) -> Result<(), WaitError> {
        self.0.ack(key)
    }

    fn cancel(&self) -> Result<(), WaitError> {
        Err(WaitError::Io(io::Error::other("cancellation unsupported")))
    }

    fn vectors(&self) -> u32 {
        self.0.vectors()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum InitMode {
    #[default]
    Complete,
    FailAfterAck,
    SkipDriverOk,
}

/// Minimal driver: negotiates every offered feature and sets up queue 0. Each ring update kicks
/// queue 0 back.
#[derive(Debug, Default)]
pub struct TestDriver {
    mode: InitMode,
    ring_updates: AtomicUsize,
    config_changes: AtomicUsize,
}

impl TestDriver {
    pub fn failing_init() -> Self {
        TestDriver {
            mode: InitMode::FailAfterAck,
            ..Default::default()
        }
    }

    pub fn without_driver_ok() -> Self {
        TestDriver {
            mode: InitMode::SkipDriverOk,
            ..Default::default()
        }
    }

    pub fn ring_updates(&self) -> usize {
        self.ring_updates.load(Ordering::SeqCst)
    }

    pub fn config_changes(&self) -> usize {
        self.config_changes.load(Ordering::SeqCst)
    }
}

impl VirtioDriver for TestDriver {
    fn init(&self, backend: &dyn Backend) -> Result<(), DeviceError> {
        backend.device_reset()?;
        backend.wait_for_device_reset()?;
        backend.driver_status_ack()?;
        if self.mode == InitMode::FailAfterAck {
            return Err(DeviceError::Driver("unsupported device".to_string()));
        }
        let features = backend.read_features()?;
        backend.set_features(features)?;
        backend.confirm_features()?;
        // A layout legacy devices accept as well.
        let size = backend.get_ring_size(0)?;
        let desc = 0x10_0000;
        let (avail, used) = ring_layout(desc, size).unwrap();
        backend.set_ring(0, size, desc, avail, used)?;
        if self.mode == InitMode::SkipDriverOk {
            return Ok(());
        }
        backend.driver_status_ok()?;
        Ok(())
    }

    fn on_ring_update(&self, backend: &dyn Backend) {
        self.ring_updates.fetch_add(1, Ordering::SeqCst);
        backend.ring_kick(0).unwrap();
    }

    fn on_config_change(&self, _backend: &dyn Backend) {
        self.config_changes.fetch_add(1, Ordering::SeqCst);
    }
}
