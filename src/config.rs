// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Agent configuration. Everything is plain construction-time data; the
//! subsystems receive what they need explicitly and no knob lives in a
//! global.

use std::path::PathBuf;
use std::time::Duration;

use devices::drive::SizePolicy;
use devices::drive::MIB;
use serde::Deserialize;

/// Knobs of the volume monitor and the extend pipeline.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// LV extension chunk, in MiB.
    pub volume_utilization_chunk_mb: u64,
    /// Extend when the guest used more than this percentage of the chunk,
    /// i.e. when free space drops under `100 - this` percent of one chunk.
    pub volume_utilization_percent: u64,
    /// Seconds to wait for a drive's monitor lock during a cycle before
    /// skipping the drive until the next tick.
    pub monitor_timeout: f64,
    /// Seconds to wait for the monitor lock in the extend completion before
    /// giving up on the refresh (the next extend retries it).
    pub refresh_timeout: f64,
    /// Seconds an extend request may stay in flight before the monitor
    /// sends another one for the same drive.
    pub extend_timeout: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            volume_utilization_chunk_mb: 1024,
            volume_utilization_percent: 50,
            monitor_timeout: 1.0,
            refresh_timeout: 30.0,
            extend_timeout: 20.0,
        }
    }
}

impl MonitorConfig {
    pub fn size_policy(&self) -> SizePolicy {
        SizePolicy::new(
            self.volume_utilization_chunk_mb * MIB,
            100 - self.volume_utilization_percent,
        )
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_timeout)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.refresh_timeout)
    }

    pub fn extend_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.extend_timeout)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory holding the per-backup NBD unix sockets.
    pub socket_dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            socket_dir: PathBuf::from("/run/vm-agent/backup"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub monitor: MonitorConfig,
    pub backup: BackupConfig,
}
