// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Register level access to a virtio device behind a PCI function.
//!
//! `Backend` is the contract device drivers program against. It has two implementations: the
//! capability discovered MMIO layout of modern devices and the fixed port I/O layout of legacy
//! ones. Both share a `PciTransport`, which owns the PCI function, the interrupt setup chosen at
//! bind time and the device metrics.

pub mod common_config;
pub mod legacy;
pub mod modern;

use std::fmt::Debug;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use pci::{
    find_first_capability, find_next_capability, ConfigError, PciCapabilityId, PciDeviceError,
    PciFunction, WaitError,
};

use crate::capability::{VirtioPciCap, VirtioPciCapType};
use crate::config::TransportConfig;
use crate::interrupt::{negotiate_interrupts, InterruptSetup, IrqMode};
use crate::legacy_io::LegacyIo;
use crate::metrics::{IncMetric, VirtioPciMetrics};
use crate::registers::RegisterError;

pub use self::legacy::LegacyBackend;
pub use self::modern::{ModernBackend, SharedMemoryRegion};

/// Device status bits.
pub mod device_status {
    pub const INIT: u8 = 0;
    pub const ACKNOWLEDGE: u8 = 1;
    pub const DRIVER: u8 = 2;
    pub const DRIVER_OK: u8 = 4;
    pub const FEATURES_OK: u8 = 8;
    pub const DEVICE_NEEDS_RESET: u8 = 0x40;
    pub const FAILED: u8 = 0x80;
}

/// ISR status bits.
pub mod isr_status {
    /// A used ring was updated.
    pub const QUEUE_INTERRUPT: u8 = 0x1;
    /// The device configuration changed.
    pub const CONFIG_INTERRUPT: u8 = 0x2;
    /// Bits with a defined meaning.
    pub const MASK: u8 = QUEUE_INTERRUPT | CONFIG_INTERRUPT;
}

/// Coarse classification of backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device or the transport is not in a state that allows the operation.
    BadState,
    /// A required resource does not exist.
    NotFound,
    /// The device does not support what was asked.
    NotSupported,
    /// The device did not answer in time.
    TimedOut,
    /// The caller passed invalid arguments.
    InvalidArgs,
    /// Accessing the device failed.
    Io,
}

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum BackendError {
    /// Failed to enable bus mastering: {0}
    BusMaster(PciDeviceError),
    /// Neither MSI-X nor legacy interrupts are available
    NoInterruptMode,
    /// Backend is already bound
    AlreadyBound,
    /// Backend is not initialized
    NotInitialized,
    /// Device does not expose a {0} configuration capability
    MissingCapability(&'static str),
    /// BAR {0} of a modern device is not memory mapped
    BarNotMmio(u8),
    /// Configuration space access failed: {0}
    Config(#[from] ConfigError),
    /// PCI function error: {0}
    Pci(#[from] PciDeviceError),
    /// Register access failed: {0}
    Register(#[from] RegisterError),
    /// BAR 0 of a legacy device is not an I/O BAR
    LegacyBarNotPio,
    /// Legacy I/O BAR at {0:#x} is outside the port space
    LegacyBarAddress(u64),
    /// Device rejected the negotiated features
    FeaturesRejected,
    /// Device reports MSI-X {0} vector {2:#x} instead of {1:#x}
    VectorMismatch(&'static str, u16, u16),
    /// Queue {0} reports notify offset {1}
    NotifyOffsetMismatch(u16, u16),
    /// Device did not complete reset within {0:?}
    ResetTimeout(Duration),
    /// Ring address {0:#x} cannot be programmed into a legacy device
    InvalidRingAddress(u64),
    /// Queue {0} has {1} entries, not {2}
    RingSizeMismatch(u16, u16, u16),
    /// Interrupt port failed: {0}
    Interrupt(#[from] WaitError),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::AlreadyBound
            | BackendError::NotInitialized
            | BackendError::MissingCapability(_)
            | BackendError::BarNotMmio(_)
            | BackendError::LegacyBarNotPio
            | BackendError::LegacyBarAddress(_)
            | BackendError::VectorMismatch(..)
            | BackendError::NotifyOffsetMismatch(..) => ErrorKind::BadState,
            BackendError::NoInterruptMode => ErrorKind::NotFound,
            BackendError::FeaturesRejected => ErrorKind::NotSupported,
            BackendError::ResetTimeout(_) => ErrorKind::TimedOut,
            BackendError::InvalidRingAddress(_) | BackendError::RingSizeMismatch(..) => {
                ErrorKind::InvalidArgs
            }
            BackendError::Pci(PciDeviceError::BarInvalid(_)) => ErrorKind::InvalidArgs,
            BackendError::Pci(PciDeviceError::BarNotPresent(_)) => ErrorKind::NotFound,
            BackendError::Pci(PciDeviceError::IrqModeUnsupported(..)) => ErrorKind::NotSupported,
            BackendError::Register(RegisterError::AccessWidth(_))
            | BackendError::Register(RegisterError::OutOfWindow(..)) => ErrorKind::InvalidArgs,
            BackendError::Interrupt(WaitError::TimedOut) => ErrorKind::TimedOut,
            BackendError::Interrupt(WaitError::NotConfigured) => ErrorKind::BadState,
            BackendError::Interrupt(WaitError::InvalidKey(_)) => ErrorKind::InvalidArgs,
            BackendError::BusMaster(_)
            | BackendError::Config(_)
            | BackendError::Pci(_)
            | BackendError::Register(_)
            | BackendError::Interrupt(_) => ErrorKind::Io,
        }
    }
}

/// State shared by both backend variants.
#[derive(Debug)]
pub struct PciTransport {
    pci: Arc<dyn PciFunction>,
    tag: String,
    config: TransportConfig,
    interrupts: OnceLock<InterruptSetup>,
    metrics: Arc<VirtioPciMetrics>,
}

impl PciTransport {
    pub fn new(pci: Arc<dyn PciFunction>, config: TransportConfig) -> Self {
        let bdf = pci.bdf();
        let tag = format!(
            "pci[{:02x}:{:02x}.{:1x}]",
            bdf.bus(),
            bdf.device(),
            bdf.function()
        );
        PciTransport {
            pci,
            tag,
            config,
            interrupts: OnceLock::new(),
            metrics: Arc::new(VirtioPciMetrics::new()),
        }
    }

    pub fn pci(&self) -> &dyn PciFunction {
        self.pci.as_ref()
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<VirtioPciMetrics> {
        &self.metrics
    }

    pub fn interrupts(&self) -> Option<&InterruptSetup> {
        self.interrupts.get()
    }

    pub fn irq_mode(&self) -> IrqMode {
        self.interrupts
            .get()
            .map_or(IrqMode::Unconfigured, |setup| setup.mode)
    }

    /// Enables bus mastering and settles the interrupt mode. The setup is not visible through
    /// `interrupts()` until it is handed to `publish_interrupts`.
    pub fn bind_common(&self) -> Result<InterruptSetup, BackendError> {
        if self.interrupts.get().is_some() {
            return Err(BackendError::AlreadyBound);
        }
        self.pci
            .set_bus_master(true)
            .map_err(BackendError::BusMaster)?;
        let setup = match negotiate_interrupts(self.pci.as_ref(), &self.config, &self.tag) {
            Ok(setup) => setup,
            Err(err) => {
                self.disable_bus_master();
                return Err(err);
            }
        };
        info!(
            "{}: using {:?} interrupts with {} vector(s)",
            self.tag, setup.mode, setup.vectors
        );
        Ok(setup)
    }

    /// Makes `setup` the interrupt source of the backend. Succeeds once.
    pub fn publish_interrupts(&self, setup: InterruptSetup) -> Result<(), BackendError> {
        self.interrupts
            .set(setup)
            .map_err(|_| BackendError::AlreadyBound)
    }

    /// Clears bus mastering, logging a failure.
    pub fn disable_bus_master(&self) {
        if let Err(err) = self.pci.set_bus_master(false) {
            warn!("{}: failed to disable bus mastering: {err}", self.tag);
        }
    }

    /// Polls `read_status` until the device reports a completed reset or the configured
    /// timeout expires.
    pub fn wait_for_reset(
        &self,
        mut read_status: impl FnMut() -> Result<u8, BackendError>,
    ) -> Result<(), BackendError> {
        let timeout = self.config.reset_timeout();
        let start = Instant::now();
        loop {
            if read_status()? == device_status::INIT {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                self.metrics.reset_timeouts.inc();
                return Err(BackendError::ResetTimeout(timeout));
            }
            match self.config.reset_poll_interval() {
                Some(interval) => thread::sleep(interval),
                None => std::hint::spin_loop(),
            }
        }
    }
}

/// Operations a virtio driver performs on its device.
///
/// Every register touching operation holds the backend lock for its whole duration, so calls
/// from the interrupt thread and from driver threads serialize.
pub trait Backend: Debug + Send + Sync {
    fn transport(&self) -> &PciTransport;

    /// Enables bus mastering, negotiates the interrupt mode and discovers the register layout.
    ///
    /// A failed bind disables bus mastering again and releases the negotiated interrupts, so
    /// the backend can be bound again.
    fn bind(&self) -> Result<(), BackendError> {
        let transport = self.transport();
        let setup = transport.bind_common()?;
        if let Err(err) = self.init(setup.mode) {
            transport.disable_bus_master();
            return Err(err);
        }
        transport.publish_interrupts(setup)
    }

    /// Discovers the register layout of the device for interrupts delivered in `mode`.
    fn init(&self, mode: IrqMode) -> Result<(), BackendError>;

    fn device_reset(&self) -> Result<(), BackendError>;
    fn wait_for_device_reset(&self) -> Result<(), BackendError>;
    fn device_status(&self) -> Result<u8, BackendError>;
    /// Sets ACKNOWLEDGE and DRIVER.
    fn driver_status_ack(&self) -> Result<(), BackendError>;
    /// Sets DRIVER_OK. Queues must not be reconfigured afterwards.
    fn driver_status_ok(&self) -> Result<(), BackendError>;

    fn read_features(&self) -> Result<u64, BackendError>;
    fn set_features(&self, bitmap: u64) -> Result<(), BackendError>;
    /// Sets FEATURES_OK and checks that the device kept it.
    fn confirm_features(&self) -> Result<(), BackendError>;

    fn isr_status(&self) -> Result<u8, BackendError>;

    fn get_ring_size(&self, index: u16) -> Result<u16, BackendError>;
    fn set_ring(
        &self,
        index: u16,
        count: u16,
        desc: u64,
        avail: u64,
        used: u64,
    ) -> Result<(), BackendError>;
    fn ring_kick(&self, index: u16) -> Result<(), BackendError>;

    /// Reads `data.len()` (1, 2, 4 or 8) bytes of device configuration at `offset` with a single
    /// sized access.
    fn read_device_config(&self, offset: u16, data: &mut [u8]) -> Result<(), BackendError>;
    /// Writes `data` (1, 2, 4 or 8 bytes) to the device configuration at `offset`.
    fn write_device_config(&self, offset: u16, data: &[u8]) -> Result<(), BackendError>;
    /// Copies the start of the device configuration into `buf`, one byte at a time.
    fn copy_device_config(&self, buf: &mut [u8]) -> Result<(), BackendError>;

    fn tag(&self) -> &str {
        self.transport().tag()
    }

    fn irq_mode(&self) -> IrqMode {
        self.transport().irq_mode()
    }

    fn metrics(&self) -> &Arc<VirtioPciMetrics> {
        self.transport().metrics()
    }

    /// Whether an interrupt source is configured.
    fn interrupt_valid(&self) -> bool {
        self.transport().interrupts().is_some()
    }

    fn wait_for_interrupt(&self, timeout: Option<Duration>) -> Result<u32, WaitError> {
        self.transport()
            .interrupts()
            .ok_or(WaitError::NotConfigured)?
            .port
            .wait(timeout)
    }

    fn interrupt_ack(&self, key: u32) -> Result<(), WaitError> {
        self.transport()
            .interrupts()
            .ok_or(WaitError::NotConfigured)?
            .port
            .ack(key)
    }

    /// Wakes the interrupt thread out of its wait for good.
    fn terminate(&self) -> Result<(), WaitError> {
        match self.transport().interrupts() {
            Some(setup) => setup.port.cancel(),
            None => Ok(()),
        }
    }
}

macro_rules! device_config_accessors {
    ($($read:ident, $write:ident, $ty:ty);*) => {
        $(
            fn $read(&self, offset: u16) -> Result<$ty, BackendError> {
                let mut data = [0u8; std::mem::size_of::<$ty>()];
                self.read_device_config(offset, &mut data)?;
                Ok(<$ty>::from_le_bytes(data))
            }

            fn $write(&self, offset: u16, value: $ty) -> Result<(), BackendError> {
                self.write_device_config(offset, &value.to_le_bytes())
            }
        )*
    };
}

/// Typed device configuration accessors.
pub trait DeviceConfigExt: Backend {
    device_config_accessors!(
        read_config_u8, write_config_u8, u8;
        read_config_u16, write_config_u16, u16;
        read_config_u32, write_config_u32, u32;
        read_config_u64, write_config_u64, u64
    );
}

impl<T: Backend + ?Sized> DeviceConfigExt for T {}

/// Builds the backend matching the register layout `pci` exposes: modern when a common
/// configuration capability is present, legacy port I/O otherwise.
pub fn probe_backend(
    pci: Arc<dyn PciFunction>,
    io: Arc<dyn LegacyIo>,
    config: TransportConfig,
) -> Result<Arc<dyn Backend>, BackendError> {
    if has_common_cfg(pci.as_ref())? {
        debug!("{}: probed modern virtio device", pci.bdf());
        Ok(Arc::new(ModernBackend::new(pci, config)))
    } else {
        debug!("{}: probed legacy virtio device", pci.bdf());
        Ok(Arc::new(LegacyBackend::new(pci, io, config)))
    }
}

fn has_common_cfg(pci: &dyn PciFunction) -> Result<bool, BackendError> {
    let config = pci.config();
    let mut next = find_first_capability(config, PciCapabilityId::VendorSpecific);
    loop {
        let offset = match next {
            Ok(offset) => offset,
            Err(ConfigError::CapabilityNotFound(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let cap = VirtioPciCap::read(config, offset)?;
        if cap.cap_type() == Some(VirtioPciCapType::Common) {
            return Ok(true);
        }
        next = find_next_capability(config, PciCapabilityId::VendorSpecific, offset);
    }
}
