// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Register offsets of the modern common configuration structure.
//!
//! ** About the whole device.
//!    le32 device_feature_select;     // 0x00 // read-write
//!    le32 device_feature;            // 0x04 // read-only for driver
//!    le32 driver_feature_select;     // 0x08 // read-write
//!    le32 driver_feature;            // 0x0C // read-write
//!    le16 msix_config;               // 0x10 // read-write
//!    le16 num_queues;                // 0x12 // read-only for driver
//!    u8 device_status;               // 0x14 // read-write (driver_status)
//!    u8 config_generation;           // 0x15 // read-only for driver
//!
//! ** About a specific virtqueue.
//!    le16 queue_select;              // 0x16 // read-write
//!    le16 queue_size;                // 0x18 // read-write, power of 2, or 0.
//!    le16 queue_msix_vector;         // 0x1A // read-write
//!    le16 queue_enable;              // 0x1C // read-write (Ready)
//!    le16 queue_notify_off;          // 0x1E // read-only for driver
//!    le64 queue_desc;                // 0x20 // read-write
//!    le64 queue_avail;               // 0x28 // read-write
//!    le64 queue_used;                // 0x30 // read-write

pub const DEVICE_FEATURE_SELECT: u64 = 0x00;
pub const DEVICE_FEATURE: u64 = 0x04;
pub const DRIVER_FEATURE_SELECT: u64 = 0x08;
pub const DRIVER_FEATURE: u64 = 0x0C;
pub const MSIX_CONFIG: u64 = 0x10;
pub const NUM_QUEUES: u64 = 0x12;
pub const DEVICE_STATUS: u64 = 0x14;
pub const CONFIG_GENERATION: u64 = 0x15;
pub const QUEUE_SELECT: u64 = 0x16;
pub const QUEUE_SIZE: u64 = 0x18;
pub const QUEUE_MSIX_VECTOR: u64 = 0x1A;
pub const QUEUE_ENABLE: u64 = 0x1C;
pub const QUEUE_NOTIFY_OFF: u64 = 0x1E;
pub const QUEUE_DESC: u64 = 0x20;
pub const QUEUE_AVAIL: u64 = 0x28;
pub const QUEUE_USED: u64 = 0x30;

/// Size of the structure.
pub const COMMON_CONFIG_SIZE: u64 = 0x38;

/// Feature select value of the low 32 feature bits.
pub const FEATURES_LOW: u32 = 0;
/// Feature select value of the high 32 feature bits.
pub const FEATURES_HIGH: u32 = 1;
