// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of a virtio device driven over PCI: binding the backend, running the driver's
//! initialization and servicing interrupts on a dedicated thread until release.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use pci::{PciFunction, WaitError};

use crate::backend::{device_status, isr_status, probe_backend, Backend, BackendError};
use crate::config::TransportConfig;
use crate::interrupt::{IrqMode, MSIX_CONFIG_VECTOR, MSIX_QUEUE_VECTOR};
use crate::legacy_io::LegacyIo;
use crate::metrics::IncMetric;

/// Device class specific half of a driver.
///
/// Callbacks run on the interrupt thread with no backend lock held, so they may call back into
/// the backend (e.g. to kick a queue). They must not block indefinitely.
pub trait VirtioDriver: Send + Sync + 'static {
    /// Brings the device up: reset, feature negotiation, queue setup, ending with
    /// `driver_status_ok`.
    fn init(&self, backend: &dyn Backend) -> Result<(), DeviceError>;
    /// A used ring was updated.
    fn on_ring_update(&self, backend: &dyn Backend);
    /// The device configuration changed.
    fn on_config_change(&self, backend: &dyn Backend);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unbound,
    Bound,
    Running,
    Terminating,
    Released,
}

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DeviceError {
    /// Backend error: {0}
    Backend(#[from] BackendError),
    /// Operation not allowed in state {0:?}
    InvalidState(DeviceState),
    /// Failed to spawn the interrupt thread: {0}
    SpawnIrqThread(io::Error),
    /// Interrupt thread panicked
    IrqThreadPanicked,
    /// Interrupt thread cannot be stopped: {0}
    IrqThreadStuck(WaitError),
    /// Driver initialization left device status {0:#x} without DRIVER_OK
    DriverNotReady(u8),
    /// Driver error: {0}
    Driver(String),
}

/// Callbacks run for one interrupt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub ring_update: bool,
    pub config_change: bool,
}

/// Runs the driver callbacks matching interrupt `key`.
///
/// With MSI-X the vector identifies the cause. With a legacy line the ISR status is read once,
/// after the interrupt was acknowledged, and both causes may be reported by a single wake.
pub fn dispatch_interrupt<D: VirtioDriver + ?Sized>(
    backend: &dyn Backend,
    driver: &D,
    mode: IrqMode,
    key: u32,
) -> Result<Dispatched, BackendError> {
    let mut dispatched = Dispatched::default();
    match mode {
        IrqMode::MsiX => match u16::try_from(key) {
            Ok(MSIX_CONFIG_VECTOR) => dispatched.config_change = true,
            Ok(MSIX_QUEUE_VECTOR) => dispatched.ring_update = true,
            _ => warn!("{}: interrupt on unknown MSI-X vector {key}", backend.tag()),
        },
        IrqMode::Legacy => {
            let isr = backend.isr_status()?;
            dispatched.ring_update = isr & isr_status::QUEUE_INTERRUPT != 0;
            dispatched.config_change = isr & isr_status::CONFIG_INTERRUPT != 0;
        }
        IrqMode::Unconfigured => {}
    }

    let metrics = backend.metrics();
    metrics.interrupts.inc();
    if dispatched.ring_update {
        metrics.ring_updates.inc();
        driver.on_ring_update(backend);
    }
    if dispatched.config_change {
        metrics.config_changes.inc();
        driver.on_config_change(backend);
    }
    if dispatched == Dispatched::default() {
        metrics.spurious_interrupts.inc();
    }
    Ok(dispatched)
}

fn irq_worker<D: VirtioDriver>(
    backend: Arc<dyn Backend>,
    driver: Arc<D>,
    should_exit: Arc<AtomicBool>,
) {
    let tag = backend.tag().to_owned();
    let mode = backend.irq_mode();
    let timeout = backend.transport().config().irq_wait_timeout();
    debug!("{tag}: interrupt thread started");

    while backend.interrupt_valid() {
        let key = match backend.wait_for_interrupt(timeout) {
            Ok(key) => key,
            Err(WaitError::TimedOut) => {
                if should_exit.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
            Err(WaitError::Cancelled) => break,
            Err(err) => {
                error!("{tag}: interrupt wait failed: {err}");
                backend.metrics().wait_fails.inc();
                break;
            }
        };
        if should_exit.load(Ordering::Acquire) {
            break;
        }

        if let Err(err) = backend.interrupt_ack(key) {
            warn!("{tag}: failed to ack interrupt {key}: {err}");
            backend.metrics().ack_fails.inc();
        }
        if let Err(err) = dispatch_interrupt(backend.as_ref(), driver.as_ref(), mode, key) {
            warn!("{tag}: failed to dispatch interrupt {key}: {err}");
        }
    }
    debug!("{tag}: interrupt thread exiting");
}

/// A virtio device: one backend, one driver and the interrupt thread serving them.
#[derive(Debug)]
pub struct Device<D: VirtioDriver> {
    backend: Option<Arc<dyn Backend>>,
    driver: Arc<D>,
    state: DeviceState,
    // JoinHandles have to be wrapped in Option to be joined from `&mut self`.
    irq_thread: Option<JoinHandle<()>>,
    should_exit: Arc<AtomicBool>,
}

impl<D: VirtioDriver> Device<D> {
    pub fn new(backend: Arc<dyn Backend>, driver: Arc<D>) -> Self {
        Device {
            backend: Some(backend),
            driver,
            state: DeviceState::Unbound,
            irq_thread: None,
            should_exit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// The backend, until the device is released.
    pub fn backend(&self) -> Option<&Arc<dyn Backend>> {
        self.backend.as_ref()
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Binds the backend, initializes the driver and starts the interrupt thread.
    ///
    /// On failure the device ends up `Released` with nothing left running.
    pub fn bind(&mut self) -> Result<(), DeviceError> {
        let backend = match (&self.backend, self.state) {
            (Some(backend), DeviceState::Unbound) => backend.clone(),
            (_, state) => return Err(DeviceError::InvalidState(state)),
        };

        if let Err(err) = backend.bind() {
            self.abort_bind(&backend, false);
            return Err(err.into());
        }
        self.state = DeviceState::Bound;

        match self.start(&backend) {
            Ok(()) => {
                self.state = DeviceState::Running;
                info!("{}: device running", backend.tag());
                Ok(())
            }
            Err(err) => {
                self.abort_bind(&backend, true);
                Err(err)
            }
        }
    }

    fn start(&mut self, backend: &Arc<dyn Backend>) -> Result<(), DeviceError> {
        self.driver.init(backend.as_ref())?;
        let status = backend.device_status()?;
        if status & device_status::DRIVER_OK == 0 {
            return Err(DeviceError::DriverNotReady(status));
        }

        let thread_backend = backend.clone();
        let driver = self.driver.clone();
        let should_exit = self.should_exit.clone();
        let irq_thread = thread::Builder::new()
            .name(format!("{}-irq-worker", backend.tag()))
            .spawn(move || irq_worker(thread_backend, driver, should_exit))
            .map_err(DeviceError::SpawnIrqThread)?;
        self.irq_thread = Some(irq_thread);
        Ok(())
    }

    fn abort_bind(&mut self, backend: &Arc<dyn Backend>, bound: bool) {
        warn!("{}: bind failed, releasing device", backend.tag());
        if bound {
            if let Err(err) = backend.device_reset() {
                warn!("{}: failed to reset device: {err}", backend.tag());
            }
        }
        shutdown_pci(backend.transport().pci(), backend.tag());
        self.backend = None;
        self.state = DeviceState::Released;
    }

    /// Stops the interrupt thread, resets the device and drops the backend.
    ///
    /// When the interrupt wait can neither be cancelled nor times out, the thread is left
    /// detached and `IrqThreadStuck` is returned once the device is shut down.
    pub fn release(&mut self) -> Result<(), DeviceError> {
        if self.state != DeviceState::Running {
            return Err(DeviceError::InvalidState(self.state));
        }
        let backend = self
            .backend
            .take()
            .ok_or(DeviceError::InvalidState(self.state))?;
        self.state = DeviceState::Terminating;

        self.should_exit.store(true, Ordering::Release);
        let polling = backend.transport().config().irq_wait_timeout().is_some();
        let joined = match (backend.terminate(), self.irq_thread.take()) {
            (Err(err), Some(_handle)) if !polling => {
                error!(
                    "{}: failed to cancel interrupt wait, detaching the interrupt thread: {err}",
                    backend.tag()
                );
                Err(DeviceError::IrqThreadStuck(err))
            }
            (cancelled, handle) => {
                if let Err(err) = cancelled {
                    // A polling thread notices the exit flag on its next wait timeout.
                    warn!("{}: failed to cancel interrupt wait: {err}", backend.tag());
                }
                match handle {
                    Some(handle) => handle.join().map_err(|_| DeviceError::IrqThreadPanicked),
                    None => Ok(()),
                }
            }
        };

        // Mappings go away with the backend, so the device must stop using them first.
        if let Err(err) = backend.device_reset() {
            warn!("{}: failed to reset device: {err}", backend.tag());
        }
        shutdown_pci(backend.transport().pci(), backend.tag());
        self.state = DeviceState::Released;
        info!("{}: device released", backend.tag());
        joined
    }
}

impl<D: VirtioDriver> Drop for Device<D> {
    fn drop(&mut self) {
        if self.state == DeviceState::Running {
            if let Err(err) = self.release() {
                error!("failed to release virtio device: {err}");
            }
        }
    }
}

fn shutdown_pci(pci: &dyn PciFunction, tag: &str) {
    if let Err(err) = pci.set_bus_master(false) {
        warn!("{tag}: failed to disable bus mastering: {err}");
    }
}

/// Probes the backend of `pci`, wraps it with `driver` and binds the resulting device.
pub fn create_and_bind<D: VirtioDriver>(
    pci: Arc<dyn PciFunction>,
    io: Arc<dyn LegacyIo>,
    config: TransportConfig,
    driver: Arc<D>,
) -> Result<Device<D>, DeviceError> {
    let backend = probe_backend(pci, io, config)?;
    let mut device = Device::new(backend, driver);
    device.bind()?;
    Ok(device)
}
