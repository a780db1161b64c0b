// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-guest disk registry. The guest owns its drives; the monitor, the
//! merger and the backup flow share them through this registry and never
//! own each other.

use std::sync::Arc;

use devices::Drive;
use parking_lot::RwLock;
use remain::sorted;
use thiserror::Error;
use uuid::Uuid;

#[sorted]
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no drive named {0}")]
    NoDriveWithName(String),
    #[error("no drive for spec {0:?}")]
    NoDriveWithSpec(DriveSpec),
}

/// Storage identity of a drive as the engine addresses it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DriveSpec {
    pub sd_id: Uuid,
    pub img_id: Uuid,
    pub vol_id: Uuid,
}

pub struct VmDisks {
    vm_id: Uuid,
    drives: RwLock<Vec<Arc<Drive>>>,
}

impl VmDisks {
    pub fn new(vm_id: Uuid) -> Self {
        VmDisks {
            vm_id,
            drives: RwLock::new(Vec::new()),
        }
    }

    pub fn vm_id(&self) -> Uuid {
        self.vm_id
    }

    pub fn add(&self, drive: Arc<Drive>) {
        self.drives.write().push(drive);
    }

    pub fn drives(&self) -> Vec<Arc<Drive>> {
        self.drives.read().clone()
    }

    pub fn drive_by_name(&self, name: &str) -> Result<Arc<Drive>, LookupError> {
        self.drives
            .read()
            .iter()
            .find(|drive| drive.name() == name)
            .cloned()
            .ok_or_else(|| LookupError::NoDriveWithName(name.to_string()))
    }

    /// Look up by the engine's `(domainID, imageID, volumeID)` triple. The
    /// volume id matches the drive's current leaf.
    pub fn drive_by_spec(&self, spec: &DriveSpec) -> Result<Arc<Drive>, LookupError> {
        self.drives
            .read()
            .iter()
            .find(|drive| {
                drive.sd_id() == spec.sd_id
                    && drive.img_id() == spec.img_id
                    && drive.vol_id() == spec.vol_id
            })
            .cloned()
            .ok_or(LookupError::NoDriveWithSpec(*spec))
    }
}
