// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory fakes of the domain client and the storage collaborator,
//! shared by the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use devices::config::DriveConfig;
use devices::drive::SizePolicy;
use devices::Drive;
use hypervisor::BackupOps;
use hypervisor::BlockDeviceInfo;
use hypervisor::BlockJobInfo;
use hypervisor::BlockOps;
use hypervisor::ErrorKind;
use hypervisor::MergeOps;
use hypervisor::NodeStats;
use hypervisor::PauseCode;
use hypervisor::VirtError;
use parking_lot::Mutex;
use storage_api::ExtendDone;
use storage_api::ExtendSpec;
use storage_api::StorageError;
use storage_api::StorageOps;
use storage_api::VolumeInfo;
use storage_api::VolumeRef;
use storage_api::VolumeSize;
use uuid::Uuid;
use vm_agent::config::MonitorConfig;
use vm_agent::livemerge::JobStore;
use vm_agent::livemerge::MergeJob;
use vm_agent::monitor::VolumeMonitor;
use vm_agent::vm::VmDisks;

pub const GIB: u64 = 1 << 30;

pub fn test_config() -> MonitorConfig {
    // 2.5 GiB chunks, watermark at 80% of one chunk free.
    serde_json::from_value(serde_json::json!({
        "volume_utilization_chunk_mb": 2560,
        "volume_utilization_percent": 20,
        "monitor_timeout": 0.2,
        "refresh_timeout": 0.5,
        "extend_timeout": 20.0,
    }))
    .unwrap()
}

pub fn policy() -> SizePolicy {
    test_config().size_policy()
}

// Drive / domain XML helpers.

pub fn drive_json(
    iface: &str,
    index: u32,
    disk_type: &str,
    format: &str,
) -> serde_json::Value {
    let vol_id = Uuid::new_v4().to_string();
    let path = format!("/virtio/{}", index);
    serde_json::json!({
        "device": "disk",
        "iface": iface,
        "index": index,
        "diskType": disk_type,
        "format": format,
        "path": path.clone(),
        "poolID": Uuid::new_v4().to_string(),
        "domainID": Uuid::new_v4().to_string(),
        "imageID": Uuid::new_v4().to_string(),
        "volumeID": vol_id.clone(),
        "volumeChain": [{"path": path, "volumeID": vol_id}],
    })
}

pub fn make_drive(json: serde_json::Value) -> Arc<Drive> {
    let cfg: DriveConfig = serde_json::from_value(json).unwrap();
    Arc::new(Drive::new(cfg, policy()).unwrap())
}

/// A disk element of the fake domain XML: device name plus the reported
/// chain, top first, each node as `(path, index)`.
#[derive(Clone)]
pub struct XmlDisk {
    pub dev: String,
    pub chain: Vec<(String, u32)>,
    pub mirror_ready: Option<bool>,
}

pub fn render_dom_xml(disks: &[XmlDisk]) -> String {
    let mut xml = String::from("<domain><devices>");
    for disk in disks {
        xml.push_str("<disk type='block' device='disk'>");
        for (i, (path, index)) in disk.chain.iter().enumerate() {
            if i == 0 {
                xml.push_str(&format!("<source dev='{}' index='{}'/>", path, index));
            } else {
                xml.push_str(&format!(
                    "<backingStore type='block' index='{}'><source dev='{}'/>",
                    index, path
                ));
            }
        }
        // Terminator plus closing tags for the nested backing stores.
        if disk.chain.len() > 1 {
            xml.push_str("<backingStore/>");
            for _ in 1..disk.chain.len() {
                xml.push_str("</backingStore>");
            }
        }
        if let Some(ready) = disk.mirror_ready {
            if ready {
                xml.push_str("<mirror type='block' job='active-commit' ready='yes'/>");
            } else {
                xml.push_str("<mirror type='block' job='active-commit'/>");
            }
        }
        xml.push_str(&format!("<target dev='{}' bus='virtio'/>", disk.dev));
        xml.push_str("</disk>");
    }
    xml.push_str("</devices></domain>");
    xml
}

pub fn node_stats(
    name: &str,
    index: u32,
    path: &str,
    allocation: u64,
    capacity: u64,
    physical: u64,
) -> NodeStats {
    NodeStats {
        name: Some(name.to_string()),
        backing_index: Some(index),
        path: Some(path.to_string()),
        allocation: Some(allocation),
        capacity: Some(capacity),
        physical: Some(physical),
        threshold: Some(0),
    }
}

// Fake domain client.

#[derive(Default)]
pub struct VirtState {
    pub nodes: Vec<NodeStats>,
    pub xml: String,
    pub thresholds: Vec<(String, u64)>,
    pub threshold_error: Option<ErrorKind>,
    pub stats_error: bool,
    pub suspended: Option<PauseCode>,
    pub commits: Vec<(String, String, String, u64, u32)>,
    pub commit_error: bool,
    pub job_info: HashMap<String, Option<BlockJobInfo>>,
    pub job_info_error: bool,
    pub aborts: Vec<(String, u32)>,
    pub abort_error: Option<ErrorKind>,
    /// XML installed after a successful blockJobAbort (pivot completion).
    pub xml_after_abort: Option<String>,
    pub backup_begins: Vec<(String, Option<String>, u32)>,
    pub backup_begin_error: Option<ErrorKind>,
    pub backup_xml: Option<String>,
    pub backup_aborts: u32,
    pub freezes: u32,
    pub freeze_error: bool,
    pub thaws: u32,
    pub checkpoint_creates: Vec<(String, u32)>,
    pub checkpoint_create_error: Option<ErrorKind>,
    pub checkpoint_deletes: Vec<String>,
    pub checkpoint_delete_errors: HashMap<String, ErrorKind>,
    pub checkpoint_xmls: HashMap<String, String>,
    pub checkpoints: Vec<String>,
    pub block_infos: HashMap<String, BlockDeviceInfo>,
}

#[derive(Default)]
pub struct FakeVirt {
    pub state: Mutex<VirtState>,
}

impl FakeVirt {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeVirt::default())
    }

    fn err(kind: ErrorKind) -> VirtError {
        VirtError::new(kind, "injected error")
    }
}

impl BlockOps for FakeVirt {
    fn block_stats_all(&self) -> hypervisor::Result<Vec<NodeStats>> {
        let state = self.state.lock();
        if state.stats_error {
            return Err(Self::err(ErrorKind::Other));
        }
        Ok(state.nodes.clone())
    }

    fn set_block_threshold(&self, target: &str, bytes: u64) -> hypervisor::Result<()> {
        let mut state = self.state.lock();
        if let Some(kind) = state.threshold_error {
            return Err(Self::err(kind));
        }
        state.thresholds.push((target.to_string(), bytes));
        Ok(())
    }

    fn xml_desc(&self) -> hypervisor::Result<String> {
        Ok(self.state.lock().xml.clone())
    }

    fn suspend(&self, code: PauseCode) -> hypervisor::Result<()> {
        self.state.lock().suspended = Some(code);
        Ok(())
    }
}

impl MergeOps for FakeVirt {
    fn xml_desc(&self) -> hypervisor::Result<String> {
        Ok(self.state.lock().xml.clone())
    }

    fn block_commit(
        &self,
        disk: &str,
        base: &str,
        top: &str,
        bandwidth: u64,
        flags: u32,
    ) -> hypervisor::Result<()> {
        let mut state = self.state.lock();
        if state.commit_error {
            return Err(Self::err(ErrorKind::Other));
        }
        state.commits.push((
            disk.to_string(),
            base.to_string(),
            top.to_string(),
            bandwidth,
            flags,
        ));
        Ok(())
    }

    fn block_job_info(&self, disk: &str) -> hypervisor::Result<Option<BlockJobInfo>> {
        let state = self.state.lock();
        if state.job_info_error {
            return Err(Self::err(ErrorKind::Other));
        }
        Ok(state.job_info.get(disk).cloned().flatten())
    }

    fn block_job_abort(&self, disk: &str, flags: u32) -> hypervisor::Result<()> {
        let mut state = self.state.lock();
        state.aborts.push((disk.to_string(), flags));
        if let Some(kind) = state.abort_error.take() {
            return Err(Self::err(kind));
        }
        if let Some(xml) = state.xml_after_abort.take() {
            state.xml = xml;
        }
        Ok(())
    }
}

impl BackupOps for FakeVirt {
    fn backup_begin(
        &self,
        backup_xml: &str,
        checkpoint_xml: Option<&str>,
        flags: u32,
    ) -> hypervisor::Result<()> {
        let mut state = self.state.lock();
        if let Some(kind) = state.backup_begin_error {
            return Err(Self::err(kind));
        }
        state.backup_begins.push((
            backup_xml.to_string(),
            checkpoint_xml.map(str::to_string),
            flags,
        ));
        Ok(())
    }

    fn backup_xml_desc(&self) -> hypervisor::Result<String> {
        match &self.state.lock().backup_xml {
            Some(xml) => Ok(xml.clone()),
            None => Err(Self::err(ErrorKind::NoDomainBackup)),
        }
    }

    fn abort_backup(&self) -> hypervisor::Result<()> {
        self.state.lock().backup_aborts += 1;
        Ok(())
    }

    fn checkpoint_create_xml(&self, xml: &str, flags: u32) -> hypervisor::Result<()> {
        let mut state = self.state.lock();
        if let Some(kind) = state.checkpoint_create_error {
            return Err(Self::err(kind));
        }
        state.checkpoint_creates.push((xml.to_string(), flags));
        Ok(())
    }

    fn checkpoint_xml_desc(&self, checkpoint_id: &str) -> hypervisor::Result<String> {
        match self.state.lock().checkpoint_xmls.get(checkpoint_id) {
            Some(xml) => Ok(xml.clone()),
            None => Err(Self::err(ErrorKind::NoDomainCheckpoint)),
        }
    }

    fn checkpoint_delete(&self, checkpoint_id: &str) -> hypervisor::Result<()> {
        let mut state = self.state.lock();
        if let Some(kind) = state.checkpoint_delete_errors.get(checkpoint_id) {
            return Err(Self::err(*kind));
        }
        state.checkpoint_deletes.push(checkpoint_id.to_string());
        Ok(())
    }

    fn list_checkpoints(&self) -> hypervisor::Result<Vec<String>> {
        Ok(self.state.lock().checkpoints.clone())
    }

    fn block_info(&self, path: &str) -> hypervisor::Result<BlockDeviceInfo> {
        self.state
            .lock()
            .block_infos
            .get(path)
            .copied()
            .ok_or_else(|| Self::err(ErrorKind::Other))
    }

    fn freeze(&self) -> hypervisor::Result<()> {
        let mut state = self.state.lock();
        state.freezes += 1;
        if state.freeze_error {
            return Err(Self::err(ErrorKind::Other));
        }
        Ok(())
    }

    fn thaw(&self) -> hypervisor::Result<()> {
        self.state.lock().thaws += 1;
        Ok(())
    }
}

// Fake storage collaborator.

#[derive(Default)]
pub struct StorageState {
    pub volume_sizes: HashMap<Uuid, VolumeSize>,
    pub volume_infos: HashMap<Uuid, VolumeInfo>,
    pub pending: Vec<(ExtendSpec, Option<ExtendDone>)>,
    pub send_error: Option<StorageError>,
    pub refreshed: Vec<Uuid>,
    pub refresh_error: bool,
    pub refresh_destination: bool,
    pub refresh_destination_unsupported: bool,
    pub chain_syncs: Vec<(Uuid, Uuid, Uuid, Vec<Uuid>)>,
    pub size_updates: Vec<(Uuid, u64)>,
    pub torn_down: Vec<Uuid>,
    pub transient: Vec<String>,
    pub transient_error_on: Option<String>,
    pub removed_transient: Vec<String>,
}

#[derive(Default)]
pub struct FakeStorage {
    pub state: Mutex<StorageState>,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeStorage::default())
    }

    pub fn set_volume_size(&self, vol_id: Uuid, apparentsize: u64) {
        self.state.lock().volume_sizes.insert(
            vol_id,
            VolumeSize {
                apparentsize,
                truesize: apparentsize,
            },
        );
    }

    pub fn set_volume_info(&self, vol_id: Uuid, info: VolumeInfo) {
        self.state.lock().volume_infos.insert(vol_id, info);
    }

    pub fn extension_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn extension_spec(&self, i: usize) -> ExtendSpec {
        self.state.lock().pending[i].0
    }

    /// Complete the i-th extension request; the monitor's completion worker
    /// picks the outcome up asynchronously.
    pub fn complete_extension(&self, i: usize, result: Result<(), StorageError>) {
        let done = self.state.lock().pending[i].1.take().expect("already completed");
        done(result);
    }
}

impl StorageOps for FakeStorage {
    fn volume_size(&self, vol: &VolumeRef) -> storage_api::Result<VolumeSize> {
        self.state
            .lock()
            .volume_sizes
            .get(&vol.vol_id)
            .copied()
            .ok_or(StorageError::VolumeDoesNotExist {
                sd_id: vol.sd_id,
                vol_id: vol.vol_id,
            })
    }

    fn volume_info(&self, vol: &VolumeRef) -> storage_api::Result<VolumeInfo> {
        self.state
            .lock()
            .volume_infos
            .get(&vol.vol_id)
            .copied()
            .ok_or(StorageError::VolumeDoesNotExist {
                sd_id: vol.sd_id,
                vol_id: vol.vol_id,
            })
    }

    fn send_extend_msg(&self, spec: &ExtendSpec, done: ExtendDone) {
        let mut state = self.state.lock();
        if let Some(err) = state.send_error.take() {
            drop(state);
            done(Err(err));
            return;
        }
        state.pending.push((*spec, Some(done)));
    }

    fn refresh_volume(&self, vol: &VolumeRef) -> storage_api::Result<()> {
        let mut state = self.state.lock();
        if state.refresh_error {
            return Err(StorageError::Unavailable("refresh failed".to_string()));
        }
        state.refreshed.push(vol.vol_id);
        Ok(())
    }

    fn should_refresh_destination(&self) -> bool {
        self.state.lock().refresh_destination
    }

    fn refresh_destination_volume(&self, _vol: &VolumeRef) -> storage_api::Result<()> {
        if self.state.lock().refresh_destination_unsupported {
            return Err(StorageError::DiskRefreshNotSupported);
        }
        Ok(())
    }

    fn image_sync_volume_chain(
        &self,
        sd_id: Uuid,
        img_id: Uuid,
        leaf_id: Uuid,
        others: &[Uuid],
    ) -> storage_api::Result<()> {
        self.state
            .lock()
            .chain_syncs
            .push((sd_id, img_id, leaf_id, others.to_vec()));
        Ok(())
    }

    fn set_volume_size(&self, vol: &VolumeRef, bytes: u64) -> storage_api::Result<()> {
        self.state.lock().size_updates.push((vol.vol_id, bytes));
        Ok(())
    }

    fn teardown_volume(&self, _sd_id: Uuid, _img_id: Uuid, vol_id: Uuid) -> storage_api::Result<()> {
        self.state.lock().torn_down.push(vol_id);
        Ok(())
    }

    fn create_transient_disk(
        &self,
        _owner: Uuid,
        name: &str,
        _size: u64,
    ) -> storage_api::Result<PathBuf> {
        let mut state = self.state.lock();
        if state.transient_error_on.as_deref() == Some(name) {
            return Err(StorageError::Unavailable("no space".to_string()));
        }
        state.transient.push(name.to_string());
        Ok(PathBuf::from(format!("/var/run/transient/{}", name)))
    }

    fn remove_transient_disk(&self, _owner: Uuid, name: &str) -> storage_api::Result<()> {
        let mut state = self.state.lock();
        state.transient.retain(|existing| existing != name);
        state.removed_transient.push(name.to_string());
        Ok(())
    }

    fn list_transient_disks(&self, _owner: Uuid) -> storage_api::Result<Vec<String>> {
        Ok(self.state.lock().transient.clone())
    }
}

// Job store fake.

#[derive(Default)]
pub struct MemJobStore {
    pub saved: Mutex<Vec<std::collections::BTreeMap<Uuid, MergeJob>>>,
}

impl MemJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemJobStore::default())
    }

    pub fn save_count(&self) -> usize {
        self.saved.lock().len()
    }
}

impl JobStore for MemJobStore {
    fn save(
        &self,
        _vm_id: Uuid,
        jobs: &std::collections::BTreeMap<Uuid, MergeJob>,
    ) -> anyhow::Result<()> {
        self.saved.lock().push(jobs.clone());
        Ok(())
    }
}

// Test harness.

pub struct TestVm {
    pub disks: Arc<VmDisks>,
    pub virt: Arc<FakeVirt>,
    pub storage: Arc<FakeStorage>,
    pub monitor: Arc<VolumeMonitor>,
}

impl TestVm {
    pub fn new(drives: Vec<Arc<Drive>>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let disks = Arc::new(VmDisks::new(Uuid::new_v4()));
        for drive in drives {
            disks.add(drive);
        }
        let virt = FakeVirt::new();
        let storage = FakeStorage::new();
        let monitor = Arc::new(VolumeMonitor::new(
            Arc::clone(&disks),
            Arc::clone(&virt) as Arc<dyn BlockOps>,
            Arc::clone(&storage) as Arc<dyn StorageOps>,
            test_config(),
        ));
        TestVm {
            disks,
            virt,
            storage,
            monitor,
        }
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
