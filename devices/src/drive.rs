// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-disk drive entity.
//!
//! A `Drive` is shared between the monitoring cycle, the threshold event
//! handler, the extend completion worker and the live-merge cleanup worker.
//! Short-lived state updates go through an internal mutex; the long
//! monitoring decision and the extend-completion tail serialize on a
//! separate timed monitor lock so a stale cycle cannot extend right after a
//! completion re-armed the threshold.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::warn;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

use crate::config::DiskDevice;
use crate::config::DiskFormat;
use crate::config::DiskInterface;
use crate::config::DiskType;
use crate::config::DriveConfig;
use crate::config::HostAddress;
use crate::config::IoTune;
use crate::config::NetworkAuth;
use crate::config::PropagateErrors;
use crate::config::ReplicaConfig;
use crate::config::Sgio;
use crate::config::SharedType;
use crate::config::storage_ref::VolumeRefFields;

pub const MIB: u64 = 1 << 20;

/// Extra space the qcow format needs on top of the virtual capacity for its
/// internal metadata.
const COW_OVERHEAD: f64 = 1.1;

/// Chunk multiplier while the drive is being replicated: the destination
/// must absorb both guest writes and the copy stream.
const REPLICATION_CHUNK_MULT: u64 = 2;

#[sorted]
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("invalid drive configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid disk XML: {0}")]
    InvalidDiskXml(String),
    #[error("timed out acquiring the monitor lock of drive {0}")]
    MonitorBusy(String),
    #[error("volume {0} is not part of the volume chain")]
    VolumeNotFound(Uuid),
}

/// Block threshold state of one monitored node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThresholdState {
    /// No threshold armed; the next cycle arms one or extends right away.
    Unset,
    /// A threshold is armed; nothing to do until the event fires.
    Set,
    /// The guest crossed the threshold; an extension is due.
    Exceeded,
    /// The volume reached its maximum size; monitoring is off until resize.
    Disabled,
}

impl fmt::Display for ThresholdState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ThresholdState::Unset => "unset",
            ThresholdState::Set => "set",
            ThresholdState::Exceeded => "exceeded",
            ThresholdState::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// One element of a volume chain, base to top. `index` is only present on
/// entries recovered from domain XML.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeChainEntry {
    pub path: PathBuf,
    pub vol_id: Uuid,
    pub index: Option<u32>,
    pub lease_path: Option<PathBuf>,
    pub lease_offset: Option<u64>,
}

impl From<&crate::config::VolumeChainConfig> for VolumeChainEntry {
    fn from(cfg: &crate::config::VolumeChainConfig) -> Self {
        VolumeChainEntry {
            path: cfg.path.clone(),
            vol_id: cfg.vol_id,
            index: None,
            lease_path: cfg.lease_path.clone(),
            lease_offset: cfg.lease_offset,
        }
    }
}

/// A block-typed backup scratch disk registered on the drive. Monitored
/// like a chunked top on its own node index, with its own threshold state.
#[derive(Clone, Debug)]
pub struct ScratchRef {
    pub index: u32,
    pub path: PathBuf,
    /// Storage identity; present for engine-created scratch volumes, which
    /// are the only ones the agent can extend.
    pub vol: Option<VolumeRefFields>,
    pub threshold_state: ThresholdState,
    pub exceeded_time: Option<Instant>,
    pub extend_time: Option<Instant>,
}

impl ScratchRef {
    pub fn new(index: u32, path: PathBuf, vol: Option<VolumeRefFields>) -> Self {
        ScratchRef {
            index,
            path,
            vol,
            threshold_state: ThresholdState::Unset,
            exceeded_time: None,
            extend_time: None,
        }
    }
}

/// Thin-provisioning size policy, from the agent configuration.
#[derive(Clone, Copy, Debug)]
pub struct SizePolicy {
    chunk_size: u64,
    free_pct: u64,
}

impl SizePolicy {
    pub fn new(chunk_size: u64, free_pct: u64) -> Self {
        SizePolicy {
            chunk_size,
            free_pct,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

fn round_up_mib(bytes: u64) -> u64 {
    (bytes + MIB - 1) / MIB * MIB
}

struct DriveState {
    vol_id: Uuid,
    path: PathBuf,
    disk_type: DiskType,
    format: DiskFormat,
    apparentsize: u64,
    truesize: u64,
    capacity: u64,
    volume_chain: Vec<VolumeChainEntry>,
    replica: Option<ReplicaConfig>,
    threshold_state: ThresholdState,
    exceeded_time: Option<Instant>,
    extend_time: Option<Instant>,
    monitorable: bool,
    scratch: Option<ScratchRef>,
}

pub struct Drive {
    name: String,
    iface: DiskInterface,
    device: DiskDevice,
    index: u32,
    readonly: bool,
    shared: SharedType,
    serial: Option<String>,
    boot_order: Option<u32>,
    alias: Option<String>,
    sgio: Option<Sgio>,
    managed_reservation: bool,
    cache: Option<String>,
    discard: bool,
    propagate_errors: PropagateErrors,
    iotune: Option<IoTune>,
    hosts: Vec<HostAddress>,
    protocol: Option<String>,
    auth: Option<NetworkAuth>,
    pool_id: Uuid,
    sd_id: Uuid,
    img_id: Uuid,
    policy: SizePolicy,
    state: Mutex<DriveState>,
    monitor_mutex: Mutex<()>,
}

/// Guard for the per-drive monitor lock; released on drop on every exit
/// path.
pub struct MonitorGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl Drive {
    pub fn new(cfg: DriveConfig, policy: SizePolicy) -> Result<Drive, DriveError> {
        cfg.validate()?;
        let name = make_name(cfg.iface, cfg.index);
        let iotune = cfg.effective_iotune().copied();
        let state = DriveState {
            vol_id: cfg.vol_id,
            path: cfg.path.clone(),
            disk_type: cfg.disk_type,
            format: cfg.format,
            apparentsize: cfg.apparentsize,
            truesize: cfg.truesize,
            capacity: cfg.capacity,
            volume_chain: cfg.volume_chain.iter().map(VolumeChainEntry::from).collect(),
            replica: cfg.disk_replicate.clone(),
            threshold_state: ThresholdState::Unset,
            exceeded_time: None,
            extend_time: None,
            monitorable: true,
            scratch: None,
        };
        Ok(Drive {
            name,
            iface: cfg.iface,
            device: cfg.device,
            index: cfg.index,
            readonly: cfg.readonly,
            shared: cfg.shared,
            serial: cfg.serial,
            boot_order: cfg.boot_order,
            alias: cfg.alias,
            sgio: cfg.sgio,
            managed_reservation: cfg.managed_reservation,
            cache: cfg.cache,
            discard: cfg.discard,
            propagate_errors: cfg.propagate_errors,
            iotune,
            hosts: cfg.hosts,
            protocol: cfg.protocol,
            auth: cfg.auth,
            pool_id: cfg.pool_id,
            sd_id: cfg.sd_id,
            img_id: cfg.img_id,
            policy,
            state: Mutex::new(state),
            monitor_mutex: Mutex::new(()),
        })
    }

    // Identity.

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iface(&self) -> DiskInterface {
        self.iface
    }

    pub fn device(&self) -> DiskDevice {
        self.device
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn shared(&self) -> SharedType {
        self.shared
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn boot_order(&self) -> Option<u32> {
        self.boot_order
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn sgio(&self) -> Option<Sgio> {
        self.sgio
    }

    pub fn managed_reservation(&self) -> bool {
        self.managed_reservation
    }

    pub fn cache(&self) -> Option<&str> {
        self.cache.as_deref()
    }

    pub fn discard(&self) -> bool {
        self.discard
    }

    pub fn propagate_errors(&self) -> PropagateErrors {
        self.propagate_errors
    }

    pub fn iotune(&self) -> Option<IoTune> {
        self.iotune
    }

    pub fn hosts(&self) -> &[HostAddress] {
        &self.hosts
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn auth(&self) -> Option<&NetworkAuth> {
        self.auth.as_ref()
    }

    pub fn pool_id(&self) -> Uuid {
        self.pool_id
    }

    pub fn sd_id(&self) -> Uuid {
        self.sd_id
    }

    pub fn img_id(&self) -> Uuid {
        self.img_id
    }

    pub fn vol_id(&self) -> Uuid {
        self.state.lock().vol_id
    }

    /// The leaf volume as a storage reference.
    pub fn vol_ref(&self) -> VolumeRefFields {
        VolumeRefFields {
            pool_id: self.pool_id,
            sd_id: self.sd_id,
            img_id: self.img_id,
            vol_id: self.vol_id(),
        }
    }

    // Mutable attributes.

    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    /// After a path change the drive may live on a different LV, so any
    /// armed threshold is stale.
    pub fn set_path(&self, path: PathBuf) {
        let mut state = self.state.lock();
        if state.path != path {
            debug!(
                "Drive {} moved from {} to {}",
                self.name,
                state.path.display(),
                path.display()
            );
            state.path = path;
            Self::leave_exceeded(&mut state, ThresholdState::Unset);
        }
    }

    pub fn disk_type(&self) -> DiskType {
        self.state.lock().disk_type
    }

    pub fn format(&self) -> DiskFormat {
        self.state.lock().format
    }

    pub fn apparentsize(&self) -> u64 {
        self.state.lock().apparentsize
    }

    pub fn truesize(&self) -> u64 {
        self.state.lock().truesize
    }

    pub fn set_sizes(&self, apparentsize: u64, truesize: u64) {
        let mut state = self.state.lock();
        state.apparentsize = apparentsize;
        state.truesize = truesize;
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.state.lock().capacity = capacity;
    }

    pub fn replica(&self) -> Option<ReplicaConfig> {
        self.state.lock().replica.clone()
    }

    pub fn set_replica(&self, replica: Option<ReplicaConfig>) {
        self.state.lock().replica = replica;
    }

    pub fn replicating(&self) -> bool {
        self.state.lock().replica.is_some()
    }

    // Thin-provisioning classification.

    /// A chunked drive lives on an LV smaller than its virtual size and
    /// must be grown as the guest writes.
    pub fn chunked(&self) -> bool {
        let state = self.state.lock();
        state.disk_type == DiskType::Block && state.format == DiskFormat::Cow
    }

    pub fn replica_chunked(&self) -> bool {
        self.state
            .lock()
            .replica
            .as_ref()
            .is_some_and(|r| r.chunked())
    }

    pub fn monitorable(&self) -> bool {
        self.state.lock().monitorable
    }

    pub fn set_monitorable(&self, monitorable: bool) {
        self.state.lock().monitorable = monitorable;
    }

    pub fn needs_monitoring(&self) -> bool {
        let state = self.state.lock();
        if self.readonly || !state.monitorable {
            return false;
        }
        if state.threshold_state == ThresholdState::Disabled {
            return false;
        }
        let chunked = state.disk_type == DiskType::Block && state.format == DiskFormat::Cow;
        let replica_chunked = state.replica.as_ref().is_some_and(|r| r.chunked());
        chunked || replica_chunked || state.scratch.is_some()
    }

    // Threshold state machine.

    pub fn threshold_state(&self) -> ThresholdState {
        self.state.lock().threshold_state
    }

    pub fn exceeded_time(&self) -> Option<Instant> {
        self.state.lock().exceeded_time
    }

    pub fn extend_time(&self) -> Option<Instant> {
        self.state.lock().extend_time
    }

    pub fn set_extend_time(&self, time: Option<Instant>) {
        self.state.lock().extend_time = time;
    }

    pub fn mark_threshold_set(&self) {
        let mut state = self.state.lock();
        Self::leave_exceeded(&mut state, ThresholdState::Set);
    }

    pub fn mark_threshold_unset(&self) {
        let mut state = self.state.lock();
        Self::leave_exceeded(&mut state, ThresholdState::Unset);
    }

    pub fn mark_threshold_disabled(&self) {
        let mut state = self.state.lock();
        Self::leave_exceeded(&mut state, ThresholdState::Disabled);
    }

    fn leave_exceeded(state: &mut DriveState, new: ThresholdState) {
        state.threshold_state = new;
        state.exceeded_time = None;
    }

    /// Threshold event for `path`. Matches either the drive's top volume or
    /// a registered scratch disk; a stale path is ignored. Re-delivery in
    /// the exceeded state keeps the original exceeded timestamp.
    pub fn on_block_threshold(&self, path: &Path) {
        let mut state = self.state.lock();
        if state.path == path {
            match state.threshold_state {
                ThresholdState::Unset | ThresholdState::Set => {
                    state.threshold_state = ThresholdState::Exceeded;
                    state.exceeded_time = Some(Instant::now());
                }
                ThresholdState::Exceeded => {
                    debug!("Drive {} already exceeded, ignoring event", self.name);
                }
                ThresholdState::Disabled => {
                    warn!(
                        "Threshold event for disabled drive {}, ignoring",
                        self.name
                    );
                }
            }
            return;
        }
        if let Some(scratch) = &mut state.scratch {
            if scratch.path == path {
                match scratch.threshold_state {
                    ThresholdState::Unset | ThresholdState::Set => {
                        scratch.threshold_state = ThresholdState::Exceeded;
                        scratch.exceeded_time = Some(Instant::now());
                    }
                    ThresholdState::Exceeded | ThresholdState::Disabled => {}
                }
                return;
            }
        }
        debug!(
            "Stale threshold event for drive {} (event path {}, current {})",
            self.name,
            path.display(),
            state.path.display()
        );
    }

    /// The guest paused with ENOSPC on this drive; whatever the threshold
    /// state says, an extension is overdue.
    pub fn on_enospc(&self) {
        let mut state = self.state.lock();
        if state.threshold_state != ThresholdState::Exceeded {
            state.threshold_state = ThresholdState::Exceeded;
            state.exceeded_time = Some(Instant::now());
        }
    }

    // Monitor lock.

    pub fn monitor_lock(&self, timeout: Duration) -> Result<MonitorGuard<'_>, DriveError> {
        match self.monitor_mutex.try_lock_for(timeout) {
            Some(guard) => Ok(MonitorGuard { _guard: guard }),
            None => Err(DriveError::MonitorBusy(self.name.clone())),
        }
    }

    // Size policy.

    /// Extension chunk in bytes; doubled while the drive is replicating.
    pub fn extension_chunk(&self) -> u64 {
        if self.replicating() {
            self.policy.chunk_size * REPLICATION_CHUNK_MULT
        } else {
            self.policy.chunk_size
        }
    }

    /// Minimum free space (physical minus allocation) a thin-provisioned
    /// volume must keep to avoid an extension.
    pub fn watermark_limit(&self) -> u64 {
        self.policy.free_pct * self.extension_chunk() / 100
    }

    /// The size to request for the next extension of a volume currently
    /// `cur_size` bytes large, clamped to the maximum for `capacity`.
    pub fn next_volume_size(&self, cur_size: u64, capacity: u64) -> u64 {
        let next = round_up_mib(cur_size + self.extension_chunk());
        next.min(self.max_volume_size(capacity))
    }

    /// Largest useful LV size for a volume of the given virtual capacity.
    /// The actual LV may still end up larger due to extent rounding.
    pub fn max_volume_size(&self, capacity: u64) -> u64 {
        round_up_mib((capacity as f64 * COW_OVERHEAD) as u64)
    }

    // Volume chain.

    pub fn volume_chain(&self) -> Vec<VolumeChainEntry> {
        self.state.lock().volume_chain.clone()
    }

    pub fn set_volume_chain(&self, chain: Vec<VolumeChainEntry>) {
        self.state.lock().volume_chain = chain;
    }

    /// Path of a chain member, from the drive's own (engine-side) view.
    pub fn volume_path(&self, vol_id: Uuid) -> Result<PathBuf, DriveError> {
        self.state
            .lock()
            .volume_chain
            .iter()
            .find(|entry| entry.vol_id == vol_id)
            .map(|entry| entry.path.clone())
            .ok_or(DriveError::VolumeNotFound(vol_id))
    }

    /// The token the domain client uses to address `vol_id`: the plain disk
    /// name for the top layer, the indexed node name for anything below it.
    pub fn volume_target(
        &self,
        vol_id: Uuid,
        actual_chain: &[VolumeChainEntry],
    ) -> Result<String, DriveError> {
        let top = actual_chain.last().map(|entry| entry.vol_id);
        if top == Some(vol_id) {
            return Ok(self.name.clone());
        }
        for entry in actual_chain {
            if entry.vol_id == vol_id {
                let index = entry.index.ok_or_else(|| {
                    DriveError::InvalidDiskXml(format!(
                        "backing element for volume {} has no index",
                        vol_id
                    ))
                })?;
                return Ok(hypervisor::format_target(&self.name, index));
            }
        }
        Err(DriveError::VolumeNotFound(vol_id))
    }

    /// Reconcile the drive with the actual chain reported by the domain,
    /// after a completed merge. Dropped volumes leave the chain; the drive's
    /// leaf and path follow the new top. A changed path resets the
    /// threshold state.
    pub fn sync_volume_chain(&self, actual: &[VolumeChainEntry]) {
        let actual_ids: HashSet<Uuid> = actual.iter().map(|entry| entry.vol_id).collect();
        let mut state = self.state.lock();
        let old_len = state.volume_chain.len();
        state
            .volume_chain
            .retain(|entry| actual_ids.contains(&entry.vol_id));
        if state.volume_chain.len() != old_len {
            info!(
                "Drive {} volume chain reduced to {} volumes",
                self.name,
                state.volume_chain.len()
            );
        }
        if let Some(top) = actual.last() {
            if state.vol_id != top.vol_id {
                state.vol_id = top.vol_id;
            }
            let own_path = state
                .volume_chain
                .iter()
                .find(|entry| entry.vol_id == top.vol_id)
                .map(|entry| entry.path.clone());
            if let Some(path) = own_path {
                if state.path != path {
                    state.path = path;
                    Self::leave_exceeded(&mut state, ThresholdState::Unset);
                }
            }
        }
    }

    // Backup scratch disk.

    pub fn register_scratch(&self, scratch: ScratchRef) {
        self.state.lock().scratch = Some(scratch);
    }

    pub fn clear_scratch(&self) {
        self.state.lock().scratch = None;
    }

    pub fn scratch(&self) -> Option<ScratchRef> {
        self.state.lock().scratch.clone()
    }

    pub fn scratch_mark_set(&self) {
        if let Some(scratch) = &mut self.state.lock().scratch {
            scratch.threshold_state = ThresholdState::Set;
            scratch.exceeded_time = None;
        }
    }

    pub fn scratch_mark_unset(&self) {
        if let Some(scratch) = &mut self.state.lock().scratch {
            scratch.threshold_state = ThresholdState::Unset;
            scratch.exceeded_time = None;
        }
    }

    pub fn scratch_mark_disabled(&self) {
        if let Some(scratch) = &mut self.state.lock().scratch {
            scratch.threshold_state = ThresholdState::Disabled;
            scratch.exceeded_time = None;
        }
    }

    pub fn scratch_set_extend_time(&self, time: Option<Instant>) {
        if let Some(scratch) = &mut self.state.lock().scratch {
            scratch.extend_time = time;
        }
    }
}

impl fmt::Debug for Drive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Drive")
            .field("name", &self.name)
            .field("vol_id", &state.vol_id)
            .field("path", &state.path)
            .field("threshold_state", &state.threshold_state)
            .finish()
    }
}

fn make_name(iface: DiskInterface, index: u32) -> String {
    let mut letters = Vec::new();
    let mut i = index as i64;
    loop {
        letters.push(b'a' + (i % 26) as u8);
        i = i / 26 - 1;
        if i < 0 {
            break;
        }
    }
    let mut name = String::from(iface.name_prefix());
    name.extend(letters.iter().rev().map(|b| *b as char));
    name
}
