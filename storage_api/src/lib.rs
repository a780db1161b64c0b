// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the storage collaborator.
//!
//! Volume geometry queries, asynchronous LV extension through the pool
//! manager, volume refresh, chain reconciliation and transient (scratch)
//! disks. The agent only consumes this trait; the implementation lives in
//! the storage subsystem.

use std::path::PathBuf;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[sorted]
#[derive(Debug, Error)]
pub enum StorageError {
    /// The migration destination cannot refresh a volume mid-migration.
    #[error("disk refresh is not supported on the destination host")]
    DiskRefreshNotSupported,
    #[error("extend request rejected: {0}")]
    ExtendRejected(String),
    #[error("storage is unavailable: {0}")]
    Unavailable(String),
    #[error("volume {vol_id} does not exist on domain {sd_id}")]
    VolumeDoesNotExist { sd_id: Uuid, vol_id: Uuid },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Addressing tuple of one volume.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeRef {
    pub pool_id: Uuid,
    pub sd_id: Uuid,
    pub img_id: Uuid,
    pub vol_id: Uuid,
}

/// Sizes of one volume as the storage layer sees it. `apparentsize` is the
/// logical LV size, `truesize` the allocated size on storage.
#[derive(Clone, Copy, Debug)]
pub struct VolumeSize {
    pub apparentsize: u64,
    pub truesize: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum VolumeFormat {
    Cow,
    Raw,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum VolumeType {
    Internal,
    Leaf,
    Shared,
}

#[derive(Clone, Copy, Debug)]
pub struct VolumeInfo {
    pub format: VolumeFormat,
    pub voltype: VolumeType,
    pub capacity: u64,
    pub apparentsize: u64,
}

/// An extend request sent to the pool manager mailbox.
#[derive(Clone, Copy, Debug)]
pub struct ExtendSpec {
    pub vol: VolumeRef,
    pub new_size: u64,
}

/// Completion hook for [`StorageOps::send_extend_msg`]. Invoked exactly once
/// on a storage-collaborator thread, with the outcome of the request; a
/// request that could not even be queued reports its failure the same way.
pub type ExtendDone = Box<dyn FnOnce(Result<()>) + Send>;

pub trait StorageOps: Send + Sync {
    fn volume_size(&self, vol: &VolumeRef) -> Result<VolumeSize>;

    fn volume_info(&self, vol: &VolumeRef) -> Result<VolumeInfo>;

    /// Queue an asynchronous extension of `spec.vol` to `spec.new_size`
    /// bytes. Returns as soon as the request is on the wire; `done` fires
    /// later with the outcome.
    fn send_extend_msg(&self, spec: &ExtendSpec, done: ExtendDone);

    /// Re-read LV metadata so the local kernel sees the current size.
    fn refresh_volume(&self, vol: &VolumeRef) -> Result<()>;

    /// Whether extend completions must also refresh the volume on a
    /// migration destination before the local refresh.
    fn should_refresh_destination(&self) -> bool {
        false
    }

    fn refresh_destination_volume(&self, _vol: &VolumeRef) -> Result<()> {
        Ok(())
    }

    /// Mark `leaf` illegal and record `others` as the valid chain, so crash
    /// recovery restarts the guest from the parent volume.
    fn image_sync_volume_chain(
        &self,
        sd_id: Uuid,
        img_id: Uuid,
        leaf_id: Uuid,
        others: &[Uuid],
    ) -> Result<()>;

    /// Update the recorded capacity of a volume in storage metadata.
    fn set_volume_size(&self, vol: &VolumeRef, bytes: u64) -> Result<()>;

    fn teardown_volume(&self, sd_id: Uuid, img_id: Uuid, vol_id: Uuid) -> Result<()>;

    /// Create a transient disk owned by `owner`; returns its path.
    fn create_transient_disk(&self, owner: Uuid, name: &str, size: u64) -> Result<PathBuf>;

    fn remove_transient_disk(&self, owner: Uuid, name: &str) -> Result<()>;

    fn list_transient_disks(&self, owner: Uuid) -> Result<Vec<String>>;
}
