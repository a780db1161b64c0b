// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The asynchronous extend pipeline.
//!
//! Requests go out through the storage collaborator's extend mailbox; the
//! outcomes come back as tagged events on the per-guest completion channel
//! and are processed one at a time by the monitor's completion worker.
//! During a replication the replica volume is extended first, then the
//! source; an internal-volume extension (e.g. a live-merge base) never
//! touches the leaf drive's size or threshold.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use devices::Drive;
use hypervisor::ErrorKind;
use log::debug;
use log::error;
use log::info;
use log::warn;
use storage_api::ExtendDone;
use storage_api::ExtendSpec;
use storage_api::StorageError;
use storage_api::VolumeRef;
use storage_api::VolumeSize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::monitor::MonitorError;
use crate::monitor::MonitorInner;

/// Invoked exactly once when the whole extension flow finished, with the
/// error if it failed.
pub type ExtendCallback = Box<dyn FnOnce(Option<anyhow::Error>) + Send>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ExtendKind {
    /// Extending the replication target; the source may follow.
    Replica,
    /// Extending a volume of the drive's own chain. `internal` marks a
    /// non-leaf volume whose completion must not update the drive.
    Volume { internal: bool },
    /// Extending a backup scratch volume monitored on `index`.
    Scratch { index: u32 },
}

/// Everything a completion needs to pick up where the request left off.
pub(crate) struct ExtendTicket {
    pub kind: ExtendKind,
    pub drive_name: String,
    pub vol: VolumeRef,
    pub new_size: u64,
    pub clock: Clock,
    pub callback: Option<ExtendCallback>,
}

pub(crate) enum ExtendEvent {
    ReplicaDone(ExtendTicket),
    VolumeDone(ExtendTicket),
    Failed {
        ticket: ExtendTicket,
        error: StorageError,
    },
    Shutdown,
}

fn to_vol_ref(fields: devices::config::storage_ref::VolumeRefFields) -> VolumeRef {
    VolumeRef {
        pool_id: fields.pool_id,
        sd_id: fields.sd_id,
        img_id: fields.img_id,
        vol_id: fields.vol_id,
    }
}

impl MonitorInner {
    /// Extend a drive volume, extending the replica first while a
    /// replication to chunked storage is in progress. Must be called only
    /// when the drive or its replica is chunked.
    pub(crate) fn extend_volume(
        &self,
        drive: &Arc<Drive>,
        vol_id: Uuid,
        cur_size: u64,
        capacity: u64,
        callback: Option<ExtendCallback>,
    ) {
        let new_size = drive.next_volume_size(cur_size, capacity);
        // The total span covers the wait since the threshold event when we
        // got one; otherwise only the extension itself.
        let mut clock = Clock::new();
        match drive.exceeded_time() {
            Some(exceeded) => {
                clock.start_at("total", exceeded);
                clock.start_at("wait", exceeded);
                clock.stop("wait");
            }
            None => clock.start("total"),
        }
        drive.set_extend_time(Some(Instant::now()));
        if drive.replica_chunked() {
            self.send_extend_replica(drive, new_size, clock, callback);
        } else {
            self.send_extend_volume(drive, vol_id, new_size, clock, callback);
        }
    }

    fn send_extend_replica(
        &self,
        drive: &Arc<Drive>,
        new_size: u64,
        mut clock: Clock,
        callback: Option<ExtendCallback>,
    ) {
        let replica = match drive.replica() {
            Some(replica) => replica,
            None => {
                error!(
                    "Drive {} is not replicating, cannot extend the replica",
                    drive.name()
                );
                if let Some(callback) = callback {
                    callback(Some(anyhow!("drive {} is not replicating", drive.name())));
                }
                return;
            }
        };
        clock.start("extend-replica");
        let ticket = ExtendTicket {
            kind: ExtendKind::Replica,
            drive_name: drive.name().to_string(),
            vol: to_vol_ref(replica.vol_ref()),
            new_size,
            clock,
            callback,
        };
        debug!(
            "Requesting an extension for the replication volume {} of drive {} to {}",
            ticket.vol.vol_id,
            ticket.drive_name,
            new_size
        );
        self.dispatch(ticket);
    }

    fn send_extend_volume(
        &self,
        drive: &Arc<Drive>,
        vol_id: Uuid,
        new_size: u64,
        mut clock: Clock,
        callback: Option<ExtendCallback>,
    ) {
        clock.start("extend-volume");
        let internal = drive.vol_id() != vol_id;
        let ticket = ExtendTicket {
            kind: ExtendKind::Volume { internal },
            drive_name: drive.name().to_string(),
            vol: VolumeRef {
                pool_id: drive.pool_id(),
                sd_id: drive.sd_id(),
                img_id: drive.img_id(),
                vol_id,
            },
            new_size,
            clock,
            callback,
        };
        debug!(
            "Requesting an extension for volume {} of drive {} to {} (internal: {})",
            vol_id, ticket.drive_name, new_size, internal
        );
        self.dispatch(ticket);
    }

    pub(crate) fn send_extend_scratch(
        &self,
        drive: &Arc<Drive>,
        index: u32,
        vol: VolumeRef,
        new_size: u64,
    ) {
        drive.scratch_set_extend_time(Some(Instant::now()));
        let mut clock = Clock::new();
        clock.start("total");
        clock.start("extend-volume");
        let ticket = ExtendTicket {
            kind: ExtendKind::Scratch { index },
            drive_name: drive.name().to_string(),
            vol,
            new_size,
            clock,
            callback: None,
        };
        self.dispatch(ticket);
    }

    fn dispatch(&self, ticket: ExtendTicket) {
        let spec = ExtendSpec {
            vol: ticket.vol,
            new_size: ticket.new_size,
        };
        let events = self.events.clone();
        let is_replica = ticket.kind == ExtendKind::Replica;
        let done: ExtendDone = Box::new(move |result| {
            let event = match result {
                Ok(()) if is_replica => ExtendEvent::ReplicaDone(ticket),
                Ok(()) => ExtendEvent::VolumeDone(ticket),
                Err(error) => ExtendEvent::Failed { ticket, error },
            };
            // A closed channel means the monitor shut down; nothing to do.
            let _ = events.send(event);
        });
        self.storage.send_extend_msg(&spec, done);
    }

    /// Completion worker dispatch; returns false on shutdown.
    pub(crate) fn handle_event(&self, event: ExtendEvent) -> bool {
        match event {
            ExtendEvent::Shutdown => false,
            ExtendEvent::Failed { ticket, error } => {
                self.extend_failed(ticket, error);
                true
            }
            ExtendEvent::ReplicaDone(ticket) => {
                self.extend_replica_completed(ticket);
                true
            }
            ExtendEvent::VolumeDone(ticket) => {
                self.extend_volume_completed(ticket);
                true
            }
        }
    }

    fn extend_failed(&self, ticket: ExtendTicket, error: StorageError) {
        // The drive stays exceeded; the next cycle retries once the extend
        // gate expires.
        error!(
            "Extension of volume {} for drive {} failed: {}",
            ticket.vol.vol_id, ticket.drive_name, error
        );
        if let Some(callback) = ticket.callback {
            callback(Some(error.into()));
        }
    }

    fn extend_replica_completed(&self, mut ticket: ExtendTicket) {
        ticket.clock.stop("extend-replica");

        ticket.clock.start("refresh-replica");
        let refreshed = self.storage.refresh_volume(&ticket.vol);
        ticket.clock.stop("refresh-replica");
        if let Err(err) = refreshed {
            return self.finish_with_error(ticket, err.into());
        }

        if let Err(err) = self.verify_volume_extension(&ticket) {
            return self.finish_with_error(ticket, err);
        }

        let drive = match self.disks.drive_by_name(&ticket.drive_name) {
            Ok(drive) => drive,
            Err(err) => return self.finish_with_error(ticket, err.into()),
        };
        if !drive.chunked() {
            // Replica-only extension, we are done.
            ticket.clock.stop("total");
            info!(
                "Extend replica {} completed {}",
                ticket.vol.vol_id, ticket.clock
            );
            if let Some(callback) = ticket.callback {
                callback(None);
            }
            return;
        }

        debug!(
            "Requesting extension for the original drive {} (vol_id: {})",
            drive.name(),
            drive.vol_id()
        );
        self.send_extend_volume(
            &drive,
            drive.vol_id(),
            ticket.new_size,
            ticket.clock,
            ticket.callback,
        );
    }

    fn extend_volume_completed(&self, mut ticket: ExtendTicket) {
        ticket.clock.stop("extend-volume");

        if self.storage.should_refresh_destination() {
            ticket.clock.start("refresh-destination-volume");
            let refreshed = self.storage.refresh_destination_volume(&ticket.vol);
            ticket.clock.stop("refresh-destination-volume");
            match refreshed {
                Err(StorageError::DiskRefreshNotSupported) => {
                    warn!(
                        "Migration destination host does not support extending \
                         a disk during migration, disabling disk extension"
                    );
                    self.set_enabled(false);
                    return self
                        .finish_with_error(ticket, StorageError::DiskRefreshNotSupported.into());
                }
                Err(err) => return self.finish_with_error(ticket, err.into()),
                Ok(()) => {}
            }
        }

        let drive = match self.disks.drive_by_name(&ticket.drive_name) {
            Ok(drive) => drive,
            Err(err) => return self.finish_with_error(ticket, err.into()),
        };

        // After a refresh the monitor may wake up and trigger an unwanted
        // extend to the next chunk size. Hold the drive's monitor lock from
        // the refresh until the new threshold is set. On timeout this
        // attempt is aborted without refreshing; the next extend retries.
        let guard = match drive.monitor_lock(self.config.refresh_timeout()) {
            Ok(guard) => guard,
            Err(err) => {
                warn!(
                    "Timeout acquiring monitor lock of drive {}, aborting \
                     refresh; the next extend attempt will retry",
                    drive.name()
                );
                return self.finish_with_error(ticket, err.into());
            }
        };

        ticket.clock.start("refresh-volume");
        let refreshed = self.storage.refresh_volume(&ticket.vol);
        ticket.clock.stop("refresh-volume");
        if let Err(err) = refreshed {
            return self.finish_with_error(ticket, err.into());
        }

        let vol_size = match self.verify_volume_extension(&ticket) {
            Ok(size) => size,
            Err(err) => return self.finish_with_error(ticket, err),
        };

        ticket.clock.stop("total");
        info!(
            "Extend volume {} completed {}",
            ticket.vol.vol_id, ticket.clock
        );

        let mut error = None;
        match ticket.kind {
            ExtendKind::Volume { internal: false } => {
                if let Err(err) = self.update_drive_volume_size(&drive, vol_size) {
                    let domain_gone = matches!(
                        &err,
                        MonitorError::Virt(virt) if virt.kind() == ErrorKind::NoDomain
                    );
                    if domain_gone {
                        debug!(
                            "VM not running, skipping threshold update for \
                             drive {}",
                            drive.name()
                        );
                    } else {
                        error = Some(err.into());
                    }
                }
            }
            ExtendKind::Volume { internal: true } => {}
            ExtendKind::Scratch { index } => {
                drive.scratch_set_extend_time(None);
                match drive.scratch() {
                    Some(scratch) if scratch.index == index => {
                        self.set_scratch_threshold(&drive, &scratch, vol_size.apparentsize)
                    }
                    _ => debug!(
                        "Scratch disk of drive {} gone before completion",
                        drive.name()
                    ),
                }
            }
            ExtendKind::Replica => {}
        }
        drop(guard);

        match error {
            Some(err) => self.finish_with_error(ticket, err),
            None => {
                if let Some(callback) = ticket.callback {
                    callback(None);
                }
            }
        }
    }

    /// Update the drive sizes after a leaf extension and arm a new
    /// threshold based on them. Must run under the drive's monitor lock.
    fn update_drive_volume_size(
        &self,
        drive: &Arc<Drive>,
        vol_size: VolumeSize,
    ) -> Result<(), MonitorError> {
        drive.set_sizes(vol_size.apparentsize, vol_size.truesize);
        drive.set_extend_time(None);
        let index = self.query_volume_index(drive, drive.vol_id())?;
        self.set_threshold(drive, vol_size.apparentsize, index);
        Ok(())
    }

    fn verify_volume_extension(&self, ticket: &ExtendTicket) -> Result<VolumeSize, anyhow::Error> {
        let size = self.storage.volume_size(&ticket.vol)?;
        debug!(
            "Verifying extension for volume {}, requested size {}, current \
             size {}",
            ticket.vol.vol_id, ticket.new_size, size.apparentsize
        );
        if size.apparentsize < ticket.new_size {
            return Err(anyhow!(
                "volume extension failed for {} (sd_id: {}, vol_id: {})",
                ticket.drive_name,
                ticket.vol.sd_id,
                ticket.vol.vol_id
            ));
        }
        Ok(size)
    }

    fn finish_with_error(&self, ticket: ExtendTicket, error: anyhow::Error) {
        error!(
            "Extend completion for drive {} failed: {:#}",
            ticket.drive_name, error
        );
        if let Some(callback) = ticket.callback {
            callback(Some(error));
        }
    }
}
