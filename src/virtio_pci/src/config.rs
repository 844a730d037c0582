// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound on waiting for a device reset to complete.
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 1000;
/// Default interval at which a blocked interrupt thread checks for termination.
pub const DEFAULT_IRQ_POLL_INTERVAL_MS: u64 = 100;

/// Errors associated with transport configuration.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TransportConfigError {
    /// Failed to parse transport configuration: {0}
    Parse(#[from] serde_json::Error),
    /// Reset timeout must not be zero
    ZeroResetTimeout,
    /// Reset poll interval of {0} us exceeds the reset timeout
    ResetPollTooLong(u64),
}

fn default_reset_timeout_ms() -> u64 {
    DEFAULT_RESET_TIMEOUT_MS
}

fn default_irq_poll_interval_ms() -> u64 {
    DEFAULT_IRQ_POLL_INTERVAL_MS
}

fn default_msix_enabled() -> bool {
    true
}

/// Tunables of a virtio PCI transport instance.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Milliseconds to wait for the device to report a completed reset.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Microseconds to sleep between reset status polls. 0 spins.
    #[serde(default)]
    pub reset_poll_interval_us: u64,
    /// Interrupt wait timeout in milliseconds, after which the interrupt thread checks whether
    /// it should exit. 0 waits without timeout and relies on cancellation alone.
    #[serde(default = "default_irq_poll_interval_ms")]
    pub irq_poll_interval_ms: u64,
    /// Whether MSI-X may be used when the device supports it.
    #[serde(default = "default_msix_enabled")]
    pub msix_enabled: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            reset_poll_interval_us: 0,
            irq_poll_interval_ms: DEFAULT_IRQ_POLL_INTERVAL_MS,
            msix_enabled: true,
        }
    }
}

impl TransportConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, TransportConfigError> {
        let config: TransportConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), TransportConfigError> {
        if self.reset_timeout_ms == 0 {
            return Err(TransportConfigError::ZeroResetTimeout);
        }
        if self.reset_poll_interval_us / 1000 >= self.reset_timeout_ms {
            return Err(TransportConfigError::ResetPollTooLong(
                self.reset_poll_interval_us,
            ));
        }
        Ok(())
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn reset_poll_interval(&self) -> Option<Duration> {
        (self.reset_poll_interval_us != 0)
            .then(|| Duration::from_micros(self.reset_poll_interval_us))
    }

    /// Timeout for a single interrupt wait; `None` blocks until an interrupt or cancellation.
    pub fn irq_wait_timeout(&self) -> Option<Duration> {
        (self.irq_poll_interval_ms != 0).then(|| Duration::from_millis(self.irq_poll_interval_ms))
    }
}
