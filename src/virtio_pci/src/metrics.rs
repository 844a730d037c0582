// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per device transport metrics.
//!
//! Counters are `SharedIncMetric`s: lock free, updated from any thread, and serialized as the
//! delta since the previous serialization.
//!
//! ## JSON example with metrics:
//! ```json
//! {
//!   "interrupts": 12,
//!   "ring_updates": 11,
//!   "config_changes": 1,
//!   "spurious_interrupts": 0,
//!   ...
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

/// Used for defining new types of metrics that act as a counter (i.e they are continuously
/// updated by incrementing their value).
pub trait IncMetric {
    /// Adds `value` to the current counter.
    fn add(&self, value: u64);
    /// Increments by 1 unit the current counter.
    fn inc(&self) {
        self.add(1);
    }
    /// Returns current value of the counter.
    fn count(&self) -> u64;
    /// Returns diff of current and old value of the counter.
    fn fetch_diff(&self) -> u64;
}

/// Representation of a metric that is expected to be incremented from more than one thread, so
/// more synchronization is necessary.
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);

impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn fetch_diff(&self) -> u64 {
        self.0.load(Ordering::Relaxed) - self.1.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    /// Reset counters of each metrics. Here we suppose that Serialize's goal is to help with the
    /// flushing of metrics.
    /// !!! Any print of the metrics will also reset them. Use with caution !!!
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

/// Virtio PCI transport metrics of one device.
#[derive(Debug, Default, Serialize)]
pub struct VirtioPciMetrics {
    /// Number of interrupts dispatched.
    pub interrupts: SharedIncMetric,
    /// Number of ring update callbacks run.
    pub ring_updates: SharedIncMetric,
    /// Number of config change callbacks run.
    pub config_changes: SharedIncMetric,
    /// Number of interrupts without a known cause.
    pub spurious_interrupts: SharedIncMetric,
    /// Number of failed interrupt acknowledgements.
    pub ack_fails: SharedIncMetric,
    /// Number of fatal interrupt wait failures.
    pub wait_fails: SharedIncMetric,
    /// Number of queue notifications sent to the device.
    pub kicks: SharedIncMetric,
    /// Number of resets the device did not complete in time.
    pub reset_timeouts: SharedIncMetric,
    /// Number of feature sets the device refused.
    pub feature_rejections: SharedIncMetric,
}

impl VirtioPciMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            interrupts: SharedIncMetric::new(),
            ring_updates: SharedIncMetric::new(),
            config_changes: SharedIncMetric::new(),
            spurious_interrupts: SharedIncMetric::new(),
            ack_fails: SharedIncMetric::new(),
            wait_fails: SharedIncMetric::new(),
            kicks: SharedIncMetric::new(),
            reset_timeouts: SharedIncMetric::new(),
            feature_rejections: SharedIncMetric::new(),
        }
    }
}
