// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Driver side virtio over PCI transport.
//!
//! A [`Backend`] hides whether a device exposes the modern, capability described MMIO layout or
//! the legacy port I/O layout. A [`Device`] pairs a backend with a class specific
//! [`VirtioDriver`] and services the device's interrupts on a dedicated thread.

pub mod backend;
pub mod capability;
pub mod config;
pub mod device;
pub mod interrupt;
pub mod legacy_io;
pub mod metrics;
pub mod registers;

#[cfg(test)]
pub(crate) mod test_utils;

pub use self::backend::{
    device_status, isr_status, probe_backend, Backend, BackendError, DeviceConfigExt, ErrorKind,
    LegacyBackend, ModernBackend, PciTransport, SharedMemoryRegion,
};
pub use self::config::{TransportConfig, TransportConfigError};
pub use self::device::{
    create_and_bind, dispatch_interrupt, Device, DeviceError, DeviceState, Dispatched,
    VirtioDriver,
};
pub use self::interrupt::{IrqMode, MSIX_CONFIG_VECTOR, MSIX_QUEUE_VECTOR, VIRTIO_MSI_NO_VECTOR};
pub use self::legacy_io::{LegacyIo, PortIo};
pub use self::metrics::VirtioPciMetrics;
