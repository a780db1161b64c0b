// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capability traits for the libvirt domain client.
//!
//! The agent never talks to libvirt directly. Each subsystem consumes one
//! curated capability set ([`BlockOps`] for volume monitoring, [`MergeOps`]
//! for live merge, [`BackupOps`] for pull-mode backups), all implemented by
//! the same domain client. Splitting the surface keeps every subsystem
//! honest about which domain operations it may issue.

use std::fmt;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Block commit copies data into an existing backing element of the chain.
pub const BLOCK_COMMIT_SHALLOW: u32 = 1 << 0;
pub const BLOCK_COMMIT_DELETE: u32 = 1 << 1;
/// Commit the active layer; the job ends with an explicit pivot.
pub const BLOCK_COMMIT_ACTIVE: u32 = 1 << 2;
/// Keep backing chain references relative so the chain is valid on any host.
pub const BLOCK_COMMIT_RELATIVE: u32 = 1 << 3;

pub const BLOCK_JOB_ABORT_ASYNC: u32 = 1 << 0;
/// Finish a two-phase job by pivoting to the new active layer.
pub const BLOCK_JOB_ABORT_PIVOT: u32 = 1 << 1;

pub const BACKUP_BEGIN_REUSE_EXTERNAL: u32 = 1 << 0;

pub const CHECKPOINT_CREATE_REDEFINE: u32 = 1 << 0;
pub const CHECKPOINT_CREATE_QUIESCE: u32 = 1 << 1;
pub const CHECKPOINT_CREATE_REDEFINE_VALIDATE: u32 = 1 << 2;

/// Classified libvirt error, carrying only the kinds the agent dispatches on.
/// The concrete client maps raw libvirt error codes to these kinds.
#[sorted]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The block copy/commit job is still active and cannot be pivoted yet.
    BlockCopyActive,
    /// A checkpoint in the chain no longer matches the on-disk bitmaps.
    CheckpointInconsistent,
    /// The domain is gone (shut down, migrated away).
    NoDomain,
    /// No backup job is currently running for the domain.
    NoDomainBackup,
    /// The named checkpoint does not exist.
    NoDomainCheckpoint,
    /// The operation is not valid in the domain's current state.
    OperationInvalid,
    /// Anything the agent does not dispatch on.
    Other,
}

#[derive(Clone, Debug, Error)]
#[error("libvirt error ({kind:?}): {message}")]
pub struct VirtError {
    kind: ErrorKind,
    message: String,
}

impl VirtError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        VirtError {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub type Result<T> = std::result::Result<T, VirtError>;

/// Reason recorded when the agent pauses a guest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PauseCode {
    Enospc,
    Eio,
    Eother,
}

impl PauseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseCode::Enospc => "ENOSPC",
            PauseCode::Eio => "EIO",
            PauseCode::Eother => "EOTHER",
        }
    }
}

impl fmt::Display for PauseCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of a running block job, as reported by the domain client.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BlockJobType {
    Unknown,
    Pull,
    Copy,
    Commit,
    ActiveCommit,
}

/// Progress of a block job. `cur == end` alone does not mean the job is
/// ready; see the merge coordinator for the full pivot-readiness check.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct BlockJobInfo {
    pub job_type: BlockJobType,
    pub bandwidth: u64,
    pub cur: u64,
    pub end: u64,
}

/// One node of a domain's flattened block stats, keyed by the stable
/// backing index. Fields the domain did not report are `None`; consumers
/// apply their own defaults.
#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    pub name: Option<String>,
    pub backing_index: Option<u32>,
    pub path: Option<String>,
    pub allocation: Option<u64>,
    pub capacity: Option<u64>,
    pub physical: Option<u64>,
    pub threshold: Option<u64>,
}

/// Result of a `blockInfo` query on a single disk.
#[derive(Clone, Copy, Debug)]
pub struct BlockDeviceInfo {
    pub capacity: u64,
    pub allocation: u64,
    pub physical: u64,
}

/// Domain operations needed by the volume monitor.
pub trait BlockOps: Send + Sync {
    /// Flat `block.*` stats for every node of every disk, one call.
    fn block_stats_all(&self) -> Result<Vec<NodeStats>>;

    /// Arm (or with 0, disarm) the write threshold on `target`, which is
    /// either a disk name (`vda`) or an indexed node name (`vda[7]`).
    fn set_block_threshold(&self, target: &str, bytes: u64) -> Result<()>;

    fn xml_desc(&self) -> Result<String>;

    /// Pause the guest, recording `code` as the reason.
    fn suspend(&self, code: PauseCode) -> Result<()>;
}

/// Domain operations needed by the live-merge coordinator.
pub trait MergeOps: Send + Sync {
    fn xml_desc(&self) -> Result<String>;

    fn block_commit(
        &self,
        disk: &str,
        base: &str,
        top: &str,
        bandwidth: u64,
        flags: u32,
    ) -> Result<()>;

    /// `None` when the domain no longer reports a job for `disk`.
    fn block_job_info(&self, disk: &str) -> Result<Option<BlockJobInfo>>;

    fn block_job_abort(&self, disk: &str, flags: u32) -> Result<()>;
}

/// Domain operations needed by the backup flow.
pub trait BackupOps: Send + Sync {
    fn backup_begin(&self, backup_xml: &str, checkpoint_xml: Option<&str>, flags: u32)
        -> Result<()>;

    fn backup_xml_desc(&self) -> Result<String>;

    /// Abort the running backup job.
    fn abort_backup(&self) -> Result<()>;

    fn checkpoint_create_xml(&self, xml: &str, flags: u32) -> Result<()>;

    fn checkpoint_xml_desc(&self, checkpoint_id: &str) -> Result<String>;

    fn checkpoint_delete(&self, checkpoint_id: &str) -> Result<()>;

    /// Checkpoint names in topological order.
    fn list_checkpoints(&self) -> Result<Vec<String>>;

    fn block_info(&self, path: &str) -> Result<BlockDeviceInfo>;

    /// Freeze guest filesystems; best-effort consistency for backups.
    fn freeze(&self) -> Result<()>;

    fn thaw(&self) -> Result<()>;
}

/// Format the indexed node name the domain uses to address one element of a
/// disk's backing chain.
pub fn format_target(name: &str, index: u32) -> String {
    format!("{}[{}]", name, index)
}

/// Split a threshold event target into the disk name and the optional
/// backing index. `"vda"` yields `("vda", None)`; `"vda[7]"` yields
/// `("vda", Some(7))`. A malformed index suffix is treated as a plain name.
pub fn parse_target(target: &str) -> (&str, Option<u32>) {
    if let Some(open) = target.find('[') {
        if let Some(inner) = target[open..].strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Ok(index) = inner.parse::<u32>() {
                return (&target[..open], Some(index));
            }
        }
    }
    (target, None)
}
