// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-guest volume monitor.
//!
//! Every periodic tick checks the thin-provisioned drives of one guest:
//! drives without an armed threshold get one, drives whose threshold was
//! crossed get an extension through the extend pipeline. Threshold events
//! from the domain only flip a drive to the exceeded state; the next tick
//! converges it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::Sender;
use devices::drive::ScratchRef;
use devices::drive::ThresholdState;
use devices::Drive;
use devices::DriveError;
use hypervisor::format_target;
use hypervisor::parse_target;
use hypervisor::BlockOps;
use hypervisor::ErrorKind;
use hypervisor::PauseCode;
use hypervisor::VirtError;
use log::debug;
use log::error;
use log::info;
use log::warn;
use parking_lot::Mutex;
use remain::sorted;
use storage_api::StorageError;
use storage_api::StorageOps;
use storage_api::VolumeRef;
use thiserror::Error;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::extend::ExtendCallback;
use crate::extend::ExtendEvent;
use crate::vm::VmDisks;

#[sorted]
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Drive(#[from] DriveError),
    /// The guest reports more written data than the volume could hold
    /// after the next extension; looks like a corrupted image tricking the
    /// host into runaway extension.
    #[error(
        "improbable allocation for drive {drive}: allocation {allocation} \
         exceeds next volume size {next_size}, pausing the guest"
    )]
    ImprobableAllocation {
        drive: String,
        allocation: u64,
        next_size: u64,
    },
    #[error("no block stats entry for node index {0}")]
    MissingNode(u32),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Virt(#[from] VirtError),
}

/// Monitoring-relevant view of one chain node, rebuilt from one block-stats
/// call per cycle and never carried across cycles.
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub index: u32,
    pub name: String,
    pub path: Option<String>,
    pub allocation: u64,
    pub capacity: u64,
    pub physical: u64,
    pub threshold: u64,
}

pub(crate) struct MonitorInner {
    pub(crate) vm_id: Uuid,
    pub(crate) disks: Arc<VmDisks>,
    pub(crate) virt: Arc<dyn BlockOps>,
    pub(crate) storage: Arc<dyn StorageOps>,
    pub(crate) config: MonitorConfig,
    enabled: AtomicBool,
    pub(crate) events: Sender<ExtendEvent>,
}

/// Tracks the allocation watermarks of a guest's thin-provisioned volumes
/// and triggers the extension flow when needed.
pub struct VolumeMonitor {
    inner: Arc<MonitorInner>,
    completion_worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VolumeMonitor {
    pub fn new(
        disks: Arc<VmDisks>,
        virt: Arc<dyn BlockOps>,
        storage: Arc<dyn StorageOps>,
        config: MonitorConfig,
    ) -> Self {
        let (events, completions) = crossbeam_channel::unbounded();
        let inner = Arc::new(MonitorInner {
            vm_id: disks.vm_id(),
            disks,
            virt,
            storage,
            config,
            enabled: AtomicBool::new(true),
            events,
        });
        let worker_inner = Arc::clone(&inner);
        let thread_name = format!("extend/{}", &worker_inner.vm_id.to_string()[..8]);
        let completion_worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while let Ok(event) = completions.recv() {
                    if !worker_inner.handle_event(event) {
                        break;
                    }
                }
            })
            .ok();
        if completion_worker.is_none() {
            error!("Failed to spawn the extend completion worker");
        }
        VolumeMonitor {
            inner,
            completion_worker: Mutex::new(completion_worker),
        }
    }

    /// Stop the completion worker and wait for it. Pending completions are
    /// drained first.
    pub fn shutdown(&self) {
        let worker = self.completion_worker.lock().take();
        if let Some(worker) = worker {
            let _ = self.inner.events.send(ExtendEvent::Shutdown);
            if worker.join().is_err() {
                error!("Extend completion worker panicked");
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn enable(&self) {
        self.inner.set_enabled(true);
    }

    pub fn disable(&self) {
        self.inner.set_enabled(false);
    }

    /// Whether the periodic system should run [`Self::monitor_volumes`]
    /// this cycle.
    pub fn monitoring_needed(&self) -> bool {
        self.enabled()
            && self
                .inner
                .disks
                .drives()
                .iter()
                .any(|drive| drive.needs_monitoring())
    }

    /// One monitoring pass. Fails only on improbable allocation; every
    /// transient domain or storage hiccup leaves the drive in a state the
    /// next tick converges.
    pub fn monitor_volumes(&self) -> Result<(), MonitorError> {
        self.inner.monitor_volumes()
    }

    /// Threshold event entry point, called from the domain event thread.
    /// `target` is either a disk name or an indexed node name; bare names
    /// are duplicate reports of the top volume and deliberately ignored.
    pub fn on_block_threshold(&self, target: &str, path: &str, threshold: u64, excess: u64) {
        info!(
            "Block threshold {} exceeded by {} for target {} ({})",
            threshold, excess, target, path
        );
        let (name, index) = parse_target(target);
        if index.is_none() {
            debug!("Ignoring duplicate event for drive {}", name);
            return;
        }
        match self.inner.disks.drive_by_name(name) {
            Ok(drive) => drive.on_block_threshold(Path::new(path)),
            Err(_) => warn!(
                "Unknown drive {} for VM {} - ignored block threshold event",
                name, self.inner.vm_id
            ),
        }
    }

    /// The guest paused with ENOSPC on this drive.
    pub fn on_enospc(&self, drive: &Drive) {
        drive.on_enospc();
    }

    /// Start the extension flow for a drive volume (or an internal volume
    /// of its chain, e.g. a merge base). Exposed to the merge coordinator.
    pub fn extend_volume(
        &self,
        drive: &Arc<Drive>,
        vol_id: Uuid,
        cur_size: u64,
        capacity: u64,
        callback: Option<ExtendCallback>,
    ) {
        self.inner
            .extend_volume(drive, vol_id, cur_size, capacity, callback)
    }

    /// Disarm the threshold on the drive's top volume or on one indexed
    /// node.
    pub fn clear_threshold(&self, drive: &Drive, index: Option<u32>) -> Result<(), VirtError> {
        let target = match index {
            Some(index) => format_target(drive.name(), index),
            None => drive.name().to_string(),
        };
        info!("Clearing block threshold for {}", target);
        self.inner.virt.set_block_threshold(&target, 0)
    }

    /// Synchronous single-drive refresh; used by merge pre-checks.
    pub fn query_block_info(&self, drive: &Drive, vol_id: Uuid) -> Result<BlockInfo, MonitorError> {
        let stats = self.inner.query_block_stats()?;
        self.inner.drive_block_info(drive, vol_id, &stats)
    }
}

impl Drop for VolumeMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MonitorInner {
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if enabled {
            info!("Enabling volume monitoring for VM {}", self.vm_id);
        } else {
            info!("Disabling volume monitoring for VM {}", self.vm_id);
        }
    }

    fn monitor_volumes(&self) -> Result<(), MonitorError> {
        let drives: Vec<Arc<Drive>> = self
            .disks
            .drives()
            .into_iter()
            .filter(|drive| drive.needs_monitoring())
            .collect();
        if drives.is_empty() {
            return Ok(());
        }

        let stats = match self.query_block_stats() {
            Ok(stats) => stats,
            Err(err) => {
                error!("Unable to get block stats: {}", err);
                return Ok(());
            }
        };

        for drive in &drives {
            let guard = match drive.monitor_lock(self.config.monitor_timeout()) {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(
                        "Timeout acquiring monitor lock for drive {}, retrying \
                         in the next monitoring cycle",
                        drive.name()
                    );
                    continue;
                }
            };
            let result = self.extend_drive_if_needed(drive, &stats);
            drop(guard);
            match result {
                Ok(()) => {}
                Err(err @ MonitorError::ImprobableAllocation { .. }) => return Err(err),
                Err(err) => {
                    warn!("Monitoring drive {} failed: {}", drive.name(), err);
                }
            }
        }
        Ok(())
    }

    /// Must run under the drive's monitor lock.
    fn extend_drive_if_needed(
        &self,
        drive: &Arc<Drive>,
        stats: &HashMap<u32, BlockInfo>,
    ) -> Result<(), MonitorError> {
        if drive.chunked() || drive.replica_chunked() {
            let info = self.drive_block_info(drive, drive.vol_id(), stats)?;
            match drive.threshold_state() {
                ThresholdState::Unset => self.handle_unset(drive, &info)?,
                ThresholdState::Set => {}
                ThresholdState::Exceeded => self.handle_exceeded(drive, &info, false),
                ThresholdState::Disabled => {}
            }
        }
        if let Some(scratch) = drive.scratch() {
            self.handle_scratch(drive, &scratch, stats);
        }
        Ok(())
    }

    fn handle_unset(&self, drive: &Arc<Drive>, info: &BlockInfo) -> Result<(), MonitorError> {
        if self.drive_needs_extend(drive, info)? {
            // The threshold was already crossed before we could arm it, so
            // the domain will never deliver an event. Synthesize one and
            // handle the drive as if it had just arrived.
            drive.on_block_threshold(&drive.path());
            self.handle_exceeded(drive, info, true);
        } else {
            self.set_threshold(drive, info.physical, info.index);
        }
        Ok(())
    }

    fn handle_exceeded(&self, drive: &Arc<Drive>, info: &BlockInfo, urgent: bool) {
        if !urgent && self.extend_in_progress(drive.extend_time()) {
            debug!(
                "Extension of drive {} already in progress, skipping this cycle",
                drive.name()
            );
            return;
        }
        // Physical may exceed the maximum since LV sizes round up to the
        // next extent.
        if info.physical >= drive.max_volume_size(info.capacity) {
            info!(
                "Drive {} extended to maximum size, disabling monitoring",
                drive.name()
            );
            drive.mark_threshold_disabled();
            return;
        }
        info!(
            "Requesting an extension for volume {} of drive {} (allocation {}, \
             physical {}, capacity {})",
            drive.vol_id(),
            drive.name(),
            info.allocation,
            info.physical,
            info.capacity
        );
        self.extend_volume(drive, drive.vol_id(), info.physical, info.capacity, None);
    }

    fn extend_in_progress(&self, extend_time: Option<Instant>) -> bool {
        extend_time.is_some_and(|time| time.elapsed() < self.config.extend_timeout())
    }

    fn drive_needs_extend(&self, drive: &Arc<Drive>, info: &BlockInfo) -> Result<bool, MonitorError> {
        let next_size = drive.next_volume_size(info.physical, info.capacity);
        // Allocation includes clusters not yet written, so it cannot be
        // compared with physical directly; anything above the next volume
        // size means the image cannot be trusted.
        if info.allocation > next_size {
            if let Err(err) = self.virt.suspend(PauseCode::Eother) {
                error!("Failed to pause VM {}: {}", self.vm_id, err);
            }
            return Err(MonitorError::ImprobableAllocation {
                drive: drive.name().to_string(),
                allocation: info.allocation,
                next_size,
            });
        }
        let free_space = info.physical.saturating_sub(info.allocation);
        Ok(free_space < drive.watermark_limit())
    }

    /// Arm the block threshold on the indexed node of the drive's top
    /// volume. An armed threshold moves the drive to the set state; any
    /// failure leaves it unset so the next cycle retries.
    pub(crate) fn set_threshold(&self, drive: &Drive, apparentsize: u64, index: u32) {
        let limit = drive.watermark_limit();
        if apparentsize < limit {
            // A drive smaller than the watermark window is a storage bug;
            // 1 is the minimum meaningful threshold.
            warn!(
                "Drive {} apparent size {} is below the watermark limit {}",
                drive.name(),
                apparentsize,
                limit
            );
        }
        let threshold = std::cmp::max(1, apparentsize.saturating_sub(limit));
        let target = format_target(drive.name(), index);
        info!(
            "Setting block threshold to {} bytes for {} (apparentsize {})",
            threshold, target, apparentsize
        );
        match self.virt.set_block_threshold(&target, threshold) {
            Ok(()) => drive.mark_threshold_set(),
            Err(err) => {
                drive.mark_threshold_unset();
                if err.kind() == ErrorKind::OperationInvalid {
                    // The domain is not connected, e.g. mid-migration; the
                    // call is expected to fail.
                    debug!(
                        "Domain not connected, skipping set block threshold \
                         for drive {}: {}",
                        drive.name(),
                        err
                    );
                } else {
                    error!(
                        "Failed to set block threshold for drive {} ({}): {}",
                        drive.name(),
                        drive.path().display(),
                        err
                    );
                }
            }
        }
    }

    // Scratch disks of a running backup are monitored like a chunked top,
    // with their own threshold state on their own node index.

    fn handle_scratch(&self, drive: &Arc<Drive>, scratch: &ScratchRef, stats: &HashMap<u32, BlockInfo>) {
        let info = match stats.get(&scratch.index) {
            Some(info) => info,
            None => {
                warn!(
                    "No block stats for scratch disk of drive {} (index {})",
                    drive.name(),
                    scratch.index
                );
                return;
            }
        };
        match scratch.threshold_state {
            ThresholdState::Unset => {
                let free = info.physical.saturating_sub(info.allocation);
                if free < drive.watermark_limit() {
                    drive.on_block_threshold(&scratch.path);
                    self.extend_scratch(drive, scratch, info, true);
                } else {
                    self.set_scratch_threshold(drive, scratch, info.physical);
                }
            }
            ThresholdState::Set => {}
            ThresholdState::Exceeded => self.extend_scratch(drive, scratch, info, false),
            ThresholdState::Disabled => {}
        }
    }

    pub(crate) fn set_scratch_threshold(&self, drive: &Drive, scratch: &ScratchRef, physical: u64) {
        let threshold = std::cmp::max(1, physical.saturating_sub(drive.watermark_limit()));
        let target = format_target(drive.name(), scratch.index);
        info!(
            "Setting block threshold to {} bytes for scratch disk {} of drive {}",
            threshold,
            target,
            drive.name()
        );
        match self.virt.set_block_threshold(&target, threshold) {
            Ok(()) => drive.scratch_mark_set(),
            Err(err) => {
                drive.scratch_mark_unset();
                error!(
                    "Failed to set block threshold for scratch disk of drive {}: {}",
                    drive.name(),
                    err
                );
            }
        }
    }

    fn extend_scratch(&self, drive: &Arc<Drive>, scratch: &ScratchRef, info: &BlockInfo, urgent: bool) {
        let scratch_extend_time = drive.scratch().and_then(|s| s.extend_time);
        if !urgent && self.extend_in_progress(scratch_extend_time) {
            debug!(
                "Extension of scratch disk of drive {} already in progress",
                drive.name()
            );
            return;
        }
        if info.physical >= drive.max_volume_size(info.capacity) {
            info!(
                "Scratch disk of drive {} extended to maximum size, disabling \
                 monitoring",
                drive.name()
            );
            drive.scratch_mark_disabled();
            return;
        }
        let vol = match &scratch.vol {
            Some(fields) => VolumeRef {
                pool_id: fields.pool_id,
                sd_id: fields.sd_id,
                img_id: fields.img_id,
                vol_id: fields.vol_id,
            },
            None => {
                warn!(
                    "Scratch disk of drive {} has no storage identity, cannot \
                     extend",
                    drive.name()
                );
                return;
            }
        };
        let new_size = drive.next_volume_size(info.physical, info.capacity);
        info!(
            "Requesting an extension for the scratch disk of drive {} to {}",
            drive.name(),
            new_size
        );
        self.send_extend_scratch(drive, scratch.index, vol, new_size);
    }

    // Block stats.

    /// One flat block-stats query, mapped by backing index. Nodes without a
    /// backing index (cdroms) are skipped; nodes without a name are skipped
    /// with a warning.
    pub(crate) fn query_block_stats(&self) -> Result<HashMap<u32, BlockInfo>, VirtError> {
        let nodes = self.virt.block_stats_all()?;
        let mut result = HashMap::new();
        for (i, node) in nodes.into_iter().enumerate() {
            let index = match node.backing_index {
                Some(index) => index,
                None => continue,
            };
            let name = match node.name {
                Some(name) => name,
                None => {
                    warn!("Missing name in block stats node {}, skipping", i);
                    continue;
                }
            };
            result.insert(
                index,
                BlockInfo {
                    index,
                    name,
                    path: node.path,
                    allocation: node.allocation.unwrap_or(0),
                    capacity: node.capacity.unwrap_or(0),
                    physical: node.physical.unwrap_or(0),
                    threshold: node.threshold.unwrap_or(0),
                },
            );
        }
        Ok(result)
    }

    pub(crate) fn drive_block_info(
        &self,
        drive: &Drive,
        vol_id: Uuid,
        stats: &HashMap<u32, BlockInfo>,
    ) -> Result<BlockInfo, MonitorError> {
        let index = self.query_volume_index(drive, vol_id)?;
        let info = stats
            .get(&index)
            .cloned()
            .ok_or(MonitorError::MissingNode(index))?;
        self.amend_block_info(drive, info)
    }

    /// The domain reports watermarks only for the source drive, but for
    /// file-typed sources allocation and physical are identical, which
    /// breaks the extend logic. A drive that is not chunked is monitored
    /// because of its block replica, so take the physical size from there.
    fn amend_block_info(&self, drive: &Drive, mut info: BlockInfo) -> Result<BlockInfo, MonitorError> {
        if !drive.chunked() && drive.replica_chunked() {
            if let Some(replica) = drive.replica() {
                let fields = replica.vol_ref();
                let size = self.storage.volume_size(&VolumeRef {
                    pool_id: fields.pool_id,
                    sd_id: fields.sd_id,
                    img_id: fields.img_id,
                    vol_id: fields.vol_id,
                })?;
                info.physical = size.apparentsize;
            }
        }
        Ok(info)
    }

    /// The domain node index backing `vol_id` of this drive, recovered from
    /// the domain XML.
    pub(crate) fn query_volume_index(&self, drive: &Drive, vol_id: Uuid) -> Result<u32, MonitorError> {
        let xml = self.virt.xml_desc()?;
        let disks = devices::xml::parse_domain_disks(&xml)?;
        let disk = devices::xml::find_disk(&disks, drive.name()).ok_or_else(|| {
            DriveError::InvalidDiskXml(format!("no disk {} in the domain XML", drive.name()))
        })?;
        Ok(devices::xml::volume_index(drive, disk, vol_id)?)
    }
}
