// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest disk devices.
//!
//! [`Drive`] is the per-disk entity shared by the volume monitor, the
//! live-merge coordinator and the backup flow: configuration, derived name,
//! thin-provisioning size policy, the block-threshold state machine and the
//! volume chain, plus domain-XML rendering and parsing.

pub mod config;
pub mod drive;
pub mod xml;

pub use config::DiskDevice;
pub use config::DiskFormat;
pub use config::DiskInterface;
pub use config::DiskType;
pub use config::DriveConfig;
pub use config::IoTune;
pub use config::ReplicaConfig;
pub use config::SharedType;
pub use drive::Drive;
pub use drive::DriveError;
pub use drive::MonitorGuard;
pub use drive::ScratchRef;
pub use drive::SizePolicy;
pub use drive::ThresholdState;
pub use drive::VolumeChainEntry;
