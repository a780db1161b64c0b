// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side agent core for thin-provisioned guest storage.
//!
//! Per guest, the agent runs two tightly-coupled subsystems over a shared
//! set of [`devices::Drive`] entities and one domain connection:
//!
//! - the [`monitor::VolumeMonitor`] keeps chunked (qcow2-over-LV) drives
//!   physically larger than the guest's allocation by arming block
//!   thresholds in the domain and driving an asynchronous extend pipeline;
//! - the [`livemerge::DriveMerger`] starts block-commit jobs, polls their
//!   progress and runs the per-job cleanup state machine, including the
//!   pivot that ends an active-layer commit.
//!
//! The backup module owns the scratch-disk lifecycle of pull-mode backups;
//! block-typed scratches are handed to the monitor like any chunked top.
//!
//! The domain client and the storage subsystem stay behind the capability
//! traits of the `hypervisor` and `storage_api` crates; nothing in this
//! crate talks to libvirt or LVM directly.

pub mod backup;
pub mod clock;
pub mod config;
pub mod extend;
pub mod livemerge;
pub mod monitor;
pub mod response;
pub mod vm;

pub use config::AgentConfig;
pub use config::MonitorConfig;
pub use livemerge::DriveMerger;
pub use monitor::VolumeMonitor;
pub use vm::VmDisks;
