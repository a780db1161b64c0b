// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Live block-commit coordination.
//!
//! A merge job cannot be aborted once `blockCommit` is running, so the
//! merger tracks every job in a persisted table that survives agent
//! restarts, polls the domain for progress on every tick, and hands
//! finished jobs to a one-shot cleanup worker. Active-layer commits end
//! with a pivot the worker must request exactly when the domain reports
//! the mirror ready.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use devices::drive::VolumeChainEntry;
use devices::Drive;
use hypervisor::BlockJobInfo;
use hypervisor::BlockJobType;
use hypervisor::ErrorKind;
use hypervisor::MergeOps;
use hypervisor::VirtError;
use hypervisor::BLOCK_COMMIT_ACTIVE;
use hypervisor::BLOCK_COMMIT_RELATIVE;
use hypervisor::BLOCK_JOB_ABORT_PIVOT;
use log::debug;
use log::error;
use log::info;
use log::warn;
use parking_lot::Mutex;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use storage_api::StorageError;
use storage_api::StorageOps;
use storage_api::VolumeFormat;
use storage_api::VolumeRef;
use storage_api::VolumeType;
use thiserror::Error;
use uuid::Uuid;

use crate::monitor::VolumeMonitor;
use crate::response::ErrorName;
use crate::vm::DriveSpec;
use crate::vm::VmDisks;

/// Poll interval of the post-pivot wait for the domain XML to show the new
/// chain.
const WAIT_INTERVAL: Duration = Duration::from_secs(1);

#[sorted]
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("base volume {base} is too small for top volume {top}")]
    DestVolumeTooSmall { base: Uuid, top: Uuid },
    #[error("no drive for spec {0:?}")]
    DriveNotFound(DriveSpec),
    #[error("a block job is already active on image {img_id}")]
    JobExists { img_id: Uuid },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("merge is not possible: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Virt(#[from] VirtError),
}

impl MergeError {
    /// The wire error this maps to at the RPC boundary.
    pub fn error_name(&self) -> ErrorName {
        match self {
            MergeError::DriveNotFound(_) => ErrorName::ImageErr,
            MergeError::DestVolumeTooSmall { .. } => ErrorName::DestVolumeTooSmall,
            _ => ErrorName::MergeErr,
        }
    }
}

/// A tracked block-commit job. Persisted on every mutation so a restarted
/// agent can resume polling.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MergeJob {
    pub id: Uuid,
    /// Drive name at job start.
    pub drive: String,
    pub pool_id: Uuid,
    pub sd_id: Uuid,
    pub img_id: Uuid,
    /// The leaf volume at job start.
    pub vol_id: Uuid,
    pub base: Uuid,
    pub top: Uuid,
    /// The domain stopped reporting this job; never flips back.
    pub gone: bool,
}

/// Where the jobs table is persisted between mutations.
pub trait JobStore: Send + Sync {
    fn save(&self, vm_id: Uuid, jobs: &BTreeMap<Uuid, MergeJob>) -> anyhow::Result<()>;
}

/// Per-job progress reported to the engine.
#[derive(Clone, Debug, Serialize)]
pub struct JobReport {
    pub bandwidth: u64,
    #[serde(rename = "blockJobType")]
    pub block_job_type: &'static str,
    pub cur: String,
    pub end: String,
    pub drive: String,
    pub id: Uuid,
    #[serde(rename = "imgUUID")]
    pub img_id: Uuid,
    #[serde(rename = "jobType")]
    pub job_type: &'static str,
}

impl JobReport {
    fn new(job: &MergeJob) -> Self {
        JobReport {
            bandwidth: 0,
            block_job_type: "commit",
            cur: "0".to_string(),
            end: "0".to_string(),
            drive: job.drive.clone(),
            id: job.id,
            img_id: job.img_id,
            job_type: "block",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CleanupState {
    /// Fresh worker, still running.
    Trying,
    /// Failed with a recoverable error; the caller should respawn it.
    Retry,
    /// Completed successfully.
    Done,
    /// Unrecoverable error; the job must be dropped.
    Abort,
}

struct CleanupHandle {
    state: Arc<Mutex<CleanupState>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CleanupHandle {
    fn state(&self) -> CleanupState {
        *self.state.lock()
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Cleanup worker panicked");
            }
        }
    }
}

struct JobTable {
    jobs: BTreeMap<Uuid, MergeJob>,
    cleanups: HashMap<Uuid, CleanupHandle>,
}

pub struct DriveMerger {
    vm_id: Uuid,
    disks: Arc<VmDisks>,
    virt: Arc<dyn MergeOps>,
    storage: Arc<dyn StorageOps>,
    monitor: Arc<VolumeMonitor>,
    store: Arc<dyn JobStore>,
    // The jobs lock: every mutation and every consistent read of the table
    // goes through it.
    jobs: Mutex<JobTable>,
}

impl DriveMerger {
    pub fn new(
        disks: Arc<VmDisks>,
        virt: Arc<dyn MergeOps>,
        storage: Arc<dyn StorageOps>,
        monitor: Arc<VolumeMonitor>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        DriveMerger {
            vm_id: disks.vm_id(),
            disks,
            virt,
            storage,
            monitor,
            store,
            jobs: Mutex::new(JobTable {
                jobs: BTreeMap::new(),
                cleanups: HashMap::new(),
            }),
        }
    }

    /// Start a live merge of `top` into `base` on the drive identified by
    /// `spec`. With `top` being the active layer the job is two-phase and
    /// ends with a pivot driven by [`Self::query_jobs`].
    pub fn merge(
        &self,
        spec: &DriveSpec,
        base: Uuid,
        top: Uuid,
        bandwidth: u64,
        job_id: Option<Uuid>,
    ) -> Result<(), MergeError> {
        let job_id = job_id.unwrap_or_else(Uuid::new_v4);
        let drive = self
            .disks
            .drive_by_spec(spec)
            .map_err(|_| MergeError::DriveNotFound(*spec))?;

        let actual_chain = self.query_actual_chain(&drive).map_err(|err| {
            error!(
                "merge: the domain does not report the volume chain of drive \
                 {}, unable to perform a live merge: {}",
                drive.name(),
                err
            );
            MergeError::Unsupported("volume chain monitoring is not available".to_string())
        })?;

        let base_target = drive
            .volume_target(base, &actual_chain)
            .map_err(|err| MergeError::Unsupported(err.to_string()))?;
        let top_target = drive
            .volume_target(top, &actual_chain)
            .map_err(|err| MergeError::Unsupported(err.to_string()))?;

        let base_ref = VolumeRef {
            pool_id: drive.pool_id(),
            sd_id: drive.sd_id(),
            img_id: drive.img_id(),
            vol_id: base,
        };
        let top_ref = VolumeRef {
            vol_id: top,
            ..base_ref
        };
        let base_info = self.storage.volume_info(&base_ref)?;
        let top_info = self.storage.volume_info(&top_ref)?;

        // Merging into a shared volume would corrupt it for its other
        // users.
        if base_info.voltype == VolumeType::Shared {
            return Err(MergeError::Unsupported(
                "refusing to merge into a shared volume".to_string(),
            ));
        }

        // The domain keeps backing paths relative so the chain stays valid
        // on any host.
        let mut flags = BLOCK_COMMIT_RELATIVE;
        if top == drive.vol_id() {
            // Two-phase job: data is copied into base, then the domain
            // waits for an explicit pivot to the new active layer.
            flags |= BLOCK_COMMIT_ACTIVE;
        }

        if !can_merge_into(&drive, &base_info, &top_info) {
            return Err(MergeError::DestVolumeTooSmall { base, top });
        }

        // A raw base that the engine extended may still have a stale size
        // in the local kernel view; refresh so the commit sees the real LV.
        if drive.chunked()
            && base_info.format == VolumeFormat::Raw
            && base_info.apparentsize < base_info.capacity
        {
            info!(
                "Refreshing raw base volume {} (apparentsize={}, capacity={})",
                base, base_info.apparentsize, base_info.capacity
            );
            self.storage.refresh_volume(&base_ref)?;
        }

        {
            // Taken here so query_jobs cannot clean up the new job before
            // blockCommit started.
            let mut table = self.jobs.lock();
            if let Some(existing) = table.jobs.values().find(|job| {
                job.sd_id == spec.sd_id && job.img_id == spec.img_id && job.vol_id == spec.vol_id
            }) {
                error!(
                    "Cannot add block job {}: a block job with id {} already \
                     exists for image {}",
                    job_id, existing.id, spec.img_id
                );
                return Err(MergeError::JobExists {
                    img_id: spec.img_id,
                });
            }
            table.jobs.insert(
                job_id,
                MergeJob {
                    id: job_id,
                    drive: drive.name().to_string(),
                    pool_id: drive.pool_id(),
                    sd_id: spec.sd_id,
                    img_id: spec.img_id,
                    vol_id: spec.vol_id,
                    base,
                    top,
                    gone: false,
                },
            );
            self.persist(&table);

            info!(
                "Starting merge with job_id={}, disk={}, base={}, top={}, \
                 bandwidth={}, flags={}",
                job_id,
                drive.name(),
                base_target,
                top_target,
                bandwidth,
                flags
            );
            if let Err(err) =
                self.virt
                    .block_commit(drive.name(), &base_target, &top_target, bandwidth, flags)
            {
                error!("Live merge failed (job: {}): {}", job_id, err);
                table.jobs.remove(&job_id);
                self.persist(&table);
                return Err(err.into());
            }
        }

        // blockCommit writes into the base volume, but the domain does not
        // report the base's internal watermark during the commit, so one
        // large extension up front replaces monitoring: in the worst case
        // the base grows by the whole allocated size of the top.
        if drive.chunked() && base_info.format == VolumeFormat::Cow {
            let capacity = match self.monitor.query_block_info(&drive, drive.vol_id()) {
                Ok(info) => info.capacity,
                Err(err) => {
                    warn!(
                        "Cannot query block info of drive {}: {}, using the \
                         top volume capacity",
                        drive.name(),
                        err
                    );
                    top_info.capacity
                }
            };
            let max_alloc = base_info.apparentsize + top_info.apparentsize;
            self.monitor
                .extend_volume(&drive, base, max_alloc, capacity, None);
        }

        Ok(())
    }

    /// Poll tracked jobs, spawn or respawn cleanup workers as jobs
    /// terminate, and return the progress map for reporting. Called on
    /// every tick.
    pub fn query_jobs(&self) -> HashMap<Uuid, JobReport> {
        let mut tracked = HashMap::new();
        let mut table = self.jobs.lock();
        let snapshot: Vec<MergeJob> = table.jobs.values().cloned().collect();

        for job in snapshot {
            let job_id = job.id;
            debug!("Checking job {}", job_id);

            // Successful cleanups first: the job only needs untracking, and
            // its recorded disk info may be stale after a pivot anyway.
            if table.cleanups.get(&job_id).map(CleanupHandle::state) == Some(CleanupState::Done) {
                info!(
                    "Cleanup of job {} completed, untracking (base={}, top={})",
                    job_id, job.base, job.top
                );
                self.untrack_job(&mut table, job_id);
                continue;
            }

            let spec = DriveSpec {
                sd_id: job.sd_id,
                img_id: job.img_id,
                vol_id: job.vol_id,
            };
            let drive = match self.disks.drive_by_spec(&spec) {
                Ok(drive) => drive,
                Err(_) => {
                    if job.vol_id != job.top {
                        error!("Cannot find drive for job {} ({:?})", job_id, spec);
                        continue;
                    }
                    // Active layer merge with the pivot already completed:
                    // the drive's leaf is the old base now.
                    let pivoted = DriveSpec {
                        vol_id: job.base,
                        ..spec
                    };
                    match self.disks.drive_by_spec(&pivoted) {
                        Ok(drive) => drive,
                        Err(_) => {
                            error!(
                                "Pivot completed but cannot find drive for job \
                                 {} ({:?})",
                                job_id, pivoted
                            );
                            continue;
                        }
                    }
                }
            };

            let mut report = JobReport::new(&job);

            let mut live_info = None;
            if !job.gone {
                match self.virt.block_job_info(drive.name()) {
                    Ok(info) => live_info = info,
                    Err(err) => {
                        error!("Error getting block job info: {}", err);
                        tracked.insert(job_id, report);
                        continue;
                    }
                }
            }

            let do_pivot = match live_info {
                Some(info) => {
                    debug!("Job {} live info: {:?}", job_id, info);
                    report.bandwidth = info.bandwidth;
                    report.cur = info.cur.to_string();
                    report.end = info.end.to_string();
                    self.active_layer_commit_ready(&info, &drive)
                }
                None => {
                    // The domain stopped reporting the job and will never
                    // report it again.
                    if !job.gone {
                        info!("Libvirt job {} was terminated", job_id);
                        if let Some(tracked_job) = table.jobs.get_mut(&job_id) {
                            tracked_job.gone = true;
                        }
                        self.persist(&table);
                    }
                    false
                }
            };

            if live_info.is_none() || do_pivot {
                match table.cleanups.get(&job_id).map(CleanupHandle::state) {
                    None => {
                        info!("Starting cleanup for job {}", job_id);
                        self.start_cleanup(&mut table, &job, &drive, do_pivot);
                    }
                    Some(CleanupState::Trying) => {
                        debug!("Still waiting for job {} to be synchronized", job_id);
                    }
                    Some(CleanupState::Retry) => {
                        info!(
                            "Cleanup of job {} failed with a recoverable error, \
                             retrying",
                            job_id
                        );
                        self.start_cleanup(&mut table, &job, &drive, do_pivot);
                    }
                    Some(CleanupState::Abort) => {
                        error!(
                            "Aborting job {} due to an unrecoverable error",
                            job_id
                        );
                        self.untrack_job(&mut table, job_id);
                        continue;
                    }
                    Some(CleanupState::Done) => {}
                }
            }

            tracked.insert(job_id, report);
        }
        tracked
    }

    pub fn find_job_id(&self, drive_name: &str) -> Option<Uuid> {
        let table = self.jobs.lock();
        table
            .jobs
            .values()
            .find(|job| job.drive == drive_name)
            .map(|job| job.id)
    }

    pub fn load_jobs(&self, jobs: BTreeMap<Uuid, MergeJob>) {
        let mut table = self.jobs.lock();
        table.jobs = jobs;
    }

    pub fn dump_jobs(&self) -> BTreeMap<Uuid, MergeJob> {
        self.jobs.lock().jobs.clone()
    }

    pub fn has_jobs(&self) -> bool {
        !self.jobs.lock().jobs.is_empty()
    }

    /// Join every cleanup worker; called on guest shutdown.
    pub fn wait_for_cleanup(&self) {
        let mut handles: Vec<CleanupHandle> = {
            let mut table = self.jobs.lock();
            let ids: Vec<Uuid> = table.cleanups.keys().cloned().collect();
            ids.into_iter()
                .filter_map(|id| table.cleanups.remove(&id))
                .collect()
        };
        for handle in &mut handles {
            handle.join();
        }
    }

    /// Must run under the jobs lock.
    fn untrack_job(&self, table: &mut JobTable, job_id: Uuid) {
        table.jobs.remove(&job_id);
        if let Some(mut cleanup) = table.cleanups.remove(&job_id) {
            cleanup.join();
        }
        self.persist(table);
    }

    /// Must run under the jobs lock.
    fn persist(&self, table: &JobTable) {
        if let Err(err) = self.store.save(self.vm_id, &table.jobs) {
            error!("Failed to persist the jobs table: {:#}", err);
        }
    }

    /// Must run under the jobs lock.
    fn start_cleanup(&self, table: &mut JobTable, job: &MergeJob, drive: &Arc<Drive>, do_pivot: bool) {
        let worker = CleanupWorker {
            job: job.clone(),
            drive: Arc::clone(drive),
            do_pivot,
            virt: Arc::clone(&self.virt),
            storage: Arc::clone(&self.storage),
            monitor: Arc::clone(&self.monitor),
        };
        let state = Arc::new(Mutex::new(CleanupState::Trying));
        let worker_state = Arc::clone(&state);
        let thread_name = format!("merge/{}", &job.id.to_string()[..8]);
        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let final_state = worker.run();
                *worker_state.lock() = final_state;
            })
            .ok();
        if thread.is_none() {
            error!("Failed to spawn the cleanup worker of job {}", job.id);
            return;
        }
        table.cleanups.insert(job.id, CleanupHandle { state, thread });
    }

    /// An active-layer commit is ready to pivot only when the job caught up
    /// and the domain XML reports the mirror ready. `cur == end == 0` right
    /// after job start and `cur == end` before the mirror is ready both
    /// falsely look complete and make the pivot fail.
    fn active_layer_commit_ready(&self, info: &BlockJobInfo, drive: &Drive) -> bool {
        if info.cur != info.end || info.job_type != BlockJobType::ActiveCommit {
            return false;
        }
        debug!("Checking mirror state of drive {}", drive.name());
        let xml = match self.virt.xml_desc() {
            Ok(xml) => xml,
            Err(err) => {
                warn!("Cannot fetch the domain XML: {}", err);
                return false;
            }
        };
        match devices::xml::domain_disk_mirror_ready(&xml, drive.name()) {
            Ok(Some(ready)) => ready,
            Ok(None) => {
                warn!("Unable to find drive {} in the domain XML", drive.name());
                false
            }
            Err(err) => {
                warn!("Cannot parse the domain XML: {}", err);
                false
            }
        }
    }

    fn query_actual_chain(&self, drive: &Drive) -> Result<Vec<VolumeChainEntry>, anyhow::Error> {
        let xml = self.virt.xml_desc()?;
        let disks = devices::xml::parse_domain_disks(&xml)?;
        let disk = devices::xml::find_disk(&disks, drive.name())
            .ok_or_else(|| anyhow::anyhow!("no disk {} in the domain XML", drive.name()))?;
        Ok(devices::xml::resolve_chain(drive, disk)?)
    }
}

#[sorted]
#[derive(Debug, Error)]
enum CleanupError {
    /// The block copy job is still active; expected race, retried later.
    #[error("block copy of job {0} is still active, not ready for pivot")]
    BlockCopyActive(Uuid),
    #[error(transparent)]
    Recoverable(#[from] anyhow::Error),
    #[error("job {job_id} failed with a libvirt error: {error}")]
    Unrecoverable { job_id: Uuid, error: VirtError },
}

/// One-shot cleanup of a finished merge job, on its own thread.
struct CleanupWorker {
    job: MergeJob,
    drive: Arc<Drive>,
    do_pivot: bool,
    virt: Arc<dyn MergeOps>,
    storage: Arc<dyn StorageOps>,
    monitor: Arc<VolumeMonitor>,
}

impl CleanupWorker {
    fn run(&self) -> CleanupState {
        match self.cleanup() {
            Ok(()) => {
                info!("Synchronization completed (job {})", self.job.id);
                CleanupState::Done
            }
            Err(CleanupError::BlockCopyActive(job_id)) => {
                warn!(
                    "Pivot failed (job {}): block copy still active, retrying \
                     later",
                    job_id
                );
                CleanupState::Retry
            }
            Err(CleanupError::Unrecoverable { job_id, error }) => {
                error!(
                    "Pivot failed (job {}), aborting due to an unrecoverable \
                     error: {}",
                    job_id, error
                );
                CleanupState::Abort
            }
            Err(CleanupError::Recoverable(err)) => {
                error!(
                    "Cleanup failed with a recoverable error (job {}): {:#}",
                    self.job.id, err
                );
                CleanupState::Retry
            }
        }
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.update_base_size()?;
        if self.do_pivot {
            self.try_pivot()?;
        }

        info!(
            "Synchronizing volume chain after live merge (job {})",
            self.job.id
        );
        let chain = self.query_actual_chain()?;
        self.drive.sync_volume_chain(&chain);
        if self.do_pivot {
            self.monitor.enable();
        }

        let chain_after: Vec<Uuid> = self
            .drive
            .volume_chain()
            .iter()
            .map(|entry| entry.vol_id)
            .collect();
        if !chain_after.contains(&self.job.top) {
            self.teardown_top_volume()?;
        }
        Ok(())
    }

    /// If the drive was resized after the snapshot being removed was taken,
    /// the domain enlarged the base during blockCommit; reflect that in the
    /// storage metadata.
    fn update_base_size(&self) -> Result<(), CleanupError> {
        let top_ref = VolumeRef {
            pool_id: self.drive.pool_id(),
            sd_id: self.drive.sd_id(),
            img_id: self.drive.img_id(),
            vol_id: self.job.top,
        };
        let top_info = self
            .storage
            .volume_info(&top_ref)
            .map_err(anyhow::Error::from)?;
        let base_ref = VolumeRef {
            vol_id: self.job.base,
            ..top_ref
        };
        self.storage
            .set_volume_size(&base_ref, top_info.capacity)
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn try_pivot(&self) -> Result<(), CleanupError> {
        // Mark the current leaf illegal before requesting the pivot: the
        // active layer already holds the same data as its parent, so after
        // a crash in between the guest must be restarted from the parent.
        let leaf = self.drive.vol_id();
        let others: Vec<Uuid> = self
            .drive
            .volume_chain()
            .iter()
            .map(|entry| entry.vol_id)
            .filter(|vol_id| *vol_id != leaf)
            .collect();
        self.storage
            .image_sync_volume_chain(self.drive.sd_id(), self.drive.img_id(), leaf, &others)
            .map_err(anyhow::Error::from)?;

        // The pivot transiently invalidates the drive metadata; the monitor
        // must not act until the chain is synchronized again.
        self.monitor.disable();

        info!(
            "Requesting pivot to complete the active layer commit (job {})",
            self.job.id
        );
        if let Err(err) = self
            .virt
            .block_job_abort(self.drive.name(), BLOCK_JOB_ABORT_PIVOT)
        {
            self.monitor.enable();
            return if err.kind() == ErrorKind::BlockCopyActive {
                Err(CleanupError::BlockCopyActive(self.job.id))
            } else {
                Err(CleanupError::Unrecoverable {
                    job_id: self.job.id,
                    error: err,
                })
            };
        }

        self.wait_for_xml_update()?;
        info!("Pivot completed (job {})", self.job.id);
        Ok(())
    }

    /// The synchronous blockJobAbort may return before the domain XML shows
    /// the new chain, which would leave the agent with a stale leaf. Wait
    /// until the XML drops exactly the old leaf. The wait is unbounded: if
    /// the guest is powered off meanwhile, the chain is resolved by the
    /// external reconciliation path.
    fn wait_for_xml_update(&self) -> Result<(), CleanupError> {
        let mut orig_vols: Vec<Uuid> = self
            .drive
            .volume_chain()
            .iter()
            .map(|entry| entry.vol_id)
            .collect();
        orig_vols.sort_unstable();
        let leaf = self.drive.vol_id();
        let mut expected_vols: Vec<Uuid> = orig_vols
            .iter()
            .copied()
            .filter(|vol_id| *vol_id != leaf)
            .collect();
        expected_vols.sort_unstable();

        info!(
            "Waiting for the domain XML to reflect the pivot of drive {}",
            self.drive.name()
        );
        loop {
            let chain = self.query_actual_chain()?;
            let mut cur_vols: Vec<Uuid> = chain.iter().map(|entry| entry.vol_id).collect();
            cur_vols.sort_unstable();

            if cur_vols == orig_vols {
                thread::sleep(WAIT_INTERVAL);
            } else if cur_vols == expected_vols {
                info!("The XML update has been completed");
                return Ok(());
            } else {
                error!(
                    "Bad volume chain found for drive {}. Previous chain: \
                     {:?}, expected chain: {:?}, actual chain: {:?}",
                    self.drive.name(),
                    orig_vols,
                    expected_vols,
                    cur_vols
                );
                return Err(anyhow::anyhow!("bad volume chain").into());
            }
        }
    }

    fn query_actual_chain(&self) -> Result<Vec<VolumeChainEntry>, CleanupError> {
        let xml = self.virt.xml_desc().map_err(anyhow::Error::from)?;
        let disks = devices::xml::parse_domain_disks(&xml).map_err(anyhow::Error::from)?;
        let disk = devices::xml::find_disk(&disks, self.drive.name()).ok_or_else(|| {
            anyhow::anyhow!(
                "failed to retrieve the volume chain of drive {}",
                self.drive.name()
            )
        })?;
        devices::xml::resolve_chain(&self.drive, disk)
            .map_err(anyhow::Error::from)
            .map_err(CleanupError::from)
    }

    fn teardown_top_volume(&self) -> Result<(), CleanupError> {
        self.storage
            .teardown_volume(self.drive.sd_id(), self.drive.img_id(), self.job.top)
            .map_err(|err| {
                anyhow::Error::from(err).context(format!(
                    "failed to tear down top volume {}",
                    self.job.top
                ))
            })?;
        Ok(())
    }
}

/// A raw block base cannot be grown by the domain, so a resized (larger)
/// top cannot be committed into it; everything else is safe.
fn can_merge_into(
    drive: &Drive,
    base_info: &storage_api::VolumeInfo,
    top_info: &storage_api::VolumeInfo,
) -> bool {
    if drive.disk_type() != devices::DiskType::Block || base_info.format != VolumeFormat::Raw {
        return true;
    }
    if base_info.capacity < top_info.capacity {
        warn!(
            "The base volume is undersized and cannot be extended (base \
             capacity: {}, top capacity: {})",
            base_info.capacity, top_info.capacity
        );
        return false;
    }
    true
}
