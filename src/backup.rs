// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pull-mode backups.
//!
//! The agent assembles the backup and checkpoint XML, creates a scratch
//! disk per participating drive (unless the engine created one on shared
//! storage), starts the domain backup job and exposes the per-disk NBD
//! export URLs. Scratch disks receive the copy-on-read data for the whole
//! backup and are torn down unconditionally when the backup stops;
//! block-typed scratches are registered on their drive so the volume
//! monitor extends them like any chunked top.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use devices::config::storage_ref::VolumeRefFields;
use devices::drive::ScratchRef;
use devices::DiskType;
use devices::Drive;
use hypervisor::BackupOps;
use hypervisor::ErrorKind;
use hypervisor::VirtError;
use hypervisor::BACKUP_BEGIN_REUSE_EXTERNAL;
use hypervisor::CHECKPOINT_CREATE_REDEFINE;
use hypervisor::CHECKPOINT_CREATE_REDEFINE_VALIDATE;
use log::debug;
use log::info;
use log::warn;
use quick_xml::events::BytesText;
use quick_xml::events::Event;
use quick_xml::Reader;
use quick_xml::Writer;
use remain::sorted;
use serde::Deserialize;
use storage_api::StorageOps;
use thiserror::Error;
use uuid::Uuid;

use crate::config::BackupConfig;
use crate::vm::DriveSpec;
use crate::vm::VmDisks;

#[sorted]
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup {backup_id} failed: {reason}")]
    Backup { backup_id: Uuid, reason: String },
    #[error("checkpoint cannot be used: {reason}")]
    InconsistentCheckpoint { reason: String },
    #[error("no backup {backup_id} for VM {vm_id}")]
    NoSuchBackup { vm_id: Uuid, backup_id: Uuid },
    #[error("checkpoint {checkpoint_id} does not exist: {reason}")]
    NoSuchCheckpoint {
        checkpoint_id: Uuid,
        reason: String,
    },
    #[error("failed to parse backup XML: {0}")]
    Parse(String),
    #[error(transparent)]
    Virt(#[from] VirtError),
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    Incremental,
}

impl BackupMode {
    fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Full => "full",
            BackupMode::Incremental => "incremental",
        }
    }
}

/// Scratch disk description, either provided by the engine (created on
/// shared storage) or filled in after creating a transient disk locally.
#[derive(Clone, Debug, Deserialize)]
pub struct ScratchDiskConfig {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub disk_type: DiskType,
    #[serde(default, rename = "domainID")]
    pub sd_id: Option<Uuid>,
    #[serde(default, rename = "imageID")]
    pub img_id: Option<Uuid>,
    #[serde(default, rename = "volumeID")]
    pub vol_id: Option<Uuid>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BackupDiskSpec {
    #[serde(rename = "domainID")]
    pub sd_id: Uuid,
    #[serde(rename = "imageID")]
    pub img_id: Uuid,
    #[serde(rename = "volumeID")]
    pub vol_id: Uuid,
    /// Whether the disk is included in the checkpoint.
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default)]
    pub backup_mode: Option<BackupMode>,
    #[serde(default)]
    pub scratch_disk: Option<ScratchDiskConfig>,
}

/// Backup request as sent by the engine.
#[derive(Clone, Debug, Deserialize)]
pub struct BackupSpec {
    pub backup_id: Uuid,
    #[serde(default)]
    pub from_checkpoint_id: Option<Uuid>,
    #[serde(default)]
    pub to_checkpoint_id: Option<Uuid>,
    #[serde(default)]
    pub require_consistency: bool,
    #[serde(default)]
    pub creation_time: Option<u64>,
    #[serde(default)]
    pub disks: Vec<BackupDiskSpec>,
}

/// One drive participating in a backup, with its (possibly just created)
/// scratch disk.
struct BackupDisk {
    drive: Arc<Drive>,
    backup_mode: Option<BackupMode>,
    scratch: ScratchDiskConfig,
}

/// Result of a started or queried backup.
#[derive(Clone, Debug)]
pub struct BackupInfo {
    /// NBD export URL per image.
    pub disks: HashMap<Uuid, String>,
    pub checkpoint_xml: Option<String>,
}

fn backup_err(backup_id: Uuid, reason: impl Into<String>) -> BackupError {
    BackupError::Backup {
        backup_id,
        reason: reason.into(),
    }
}

/// The per-backup NBD unix socket path.
pub fn socket_path(config: &BackupConfig, backup_id: Uuid) -> PathBuf {
    config.socket_dir.join(backup_id.to_string())
}

fn nbd_url(socket: &Path, export_name: &str) -> String {
    format!("nbd+unix:///{}?socket={}", export_name, socket.display())
}

pub fn start_backup(
    disks: &VmDisks,
    dom: &dyn BackupOps,
    storage: &dyn StorageOps,
    config: &BackupConfig,
    spec: &BackupSpec,
) -> Result<BackupInfo, BackupError> {
    let vm_id = disks.vm_id();
    let backup_id = spec.backup_id;
    if spec.disks.is_empty() {
        return Err(backup_err(backup_id, "cannot start a backup without disks"));
    }
    for disk in &spec.disks {
        if disk.backup_mode == Some(BackupMode::Incremental) && spec.from_checkpoint_id.is_none() {
            return Err(backup_err(
                backup_id,
                format!(
                    "cannot start an incremental backup for disk {}, full \
                     backup is requested",
                    disk.img_id
                ),
            ));
        }
    }

    let mut backup_disks = resolve_backup_disks(disks, spec)?;
    let socket = socket_path(config, backup_id);

    create_scratch_disks(vm_id, dom, storage, backup_id, &mut backup_disks)?;

    let begin = (|| -> Result<(), BackupError> {
        if let Err(err) = dom.freeze() {
            if spec.require_consistency {
                return Err(backup_err(
                    backup_id,
                    format!("failed to freeze VM: {}", err),
                ));
            }
            warn!("Failed to freeze VM {}: {}", vm_id, err);
        }

        let backup_xml = create_backup_xml(&socket, &backup_disks, spec.from_checkpoint_id);
        let checkpoint_xml = create_checkpoint_xml(spec, &backup_disks);
        info!(
            "Starting backup {} with backup XML {} and checkpoint XML {:?}",
            backup_id, backup_xml, checkpoint_xml
        );
        match dom.backup_begin(
            &backup_xml,
            checkpoint_xml.as_deref(),
            BACKUP_BEGIN_REUSE_EXTERNAL,
        ) {
            Err(err) if err.kind() == ErrorKind::CheckpointInconsistent => {
                Err(BackupError::InconsistentCheckpoint {
                    reason: err.to_string(),
                })
            }
            Err(err) => Err(backup_err(
                backup_id,
                format!("error starting backup: {}", err),
            )),
            Ok(()) => Ok(()),
        }
    })();

    // Always thaw, even if the freeze failed: the guest may have frozen its
    // filesystems but failed to reply in time.
    if let Err(err) = dom.thaw() {
        warn!("Failed to thaw VM {}: {}", vm_id, err);
    }

    if let Err(err) = begin {
        remove_scratch_disks(vm_id, storage, backup_id);
        return Err(err);
    }

    let backup = query_backup(vm_id, dom, backup_id)?;
    debug!("Backup {} info: {:?}", backup_id, backup);

    start_monitoring_scratch_disks(&backup_disks, &backup);

    backup_info_result(disks, dom, backup_id, &backup, spec.to_checkpoint_id)
}

pub fn stop_backup(
    disks: &VmDisks,
    dom: &dyn BackupOps,
    storage: &dyn StorageOps,
    backup_id: Uuid,
) -> Result<(), BackupError> {
    let vm_id = disks.vm_id();
    if backup_exists(vm_id, dom, backup_id) {
        if let Err(err) = dom.abort_backup() {
            if err.kind() != ErrorKind::OperationInvalid {
                return Err(backup_err(
                    backup_id,
                    format!("failed to end VM backup: {}", err),
                ));
            }
        }
    }
    stop_monitoring_scratch_disks(disks);
    remove_scratch_disks(vm_id, storage, backup_id);
    Ok(())
}

pub fn backup_info(
    disks: &VmDisks,
    dom: &dyn BackupOps,
    backup_id: Uuid,
    checkpoint_id: Option<Uuid>,
) -> Result<BackupInfo, BackupError> {
    let backup = query_backup(disks.vm_id(), dom, backup_id)?;
    debug!("Backup {} info: {:?}", backup_id, backup);
    backup_info_result(disks, dom, backup_id, &backup, checkpoint_id)
}

/// Outcome of a bulk checkpoint operation: the checkpoints handled before
/// the first failure, plus the failure message if any.
#[derive(Clone, Debug, Default)]
pub struct CheckpointResult {
    pub checkpoint_ids: Vec<Uuid>,
    pub error: Option<String>,
}

/// Delete checkpoints, ordered base to leaf. A checkpoint that is already
/// gone counts as deleted; any other failure stops the iteration.
pub fn delete_checkpoints(dom: &dyn BackupOps, checkpoint_ids: &[Uuid]) -> CheckpointResult {
    let mut result = CheckpointResult::default();
    for checkpoint_id in checkpoint_ids {
        info!("Deleting checkpoint {}", checkpoint_id);
        match dom.checkpoint_delete(&checkpoint_id.to_string()) {
            Ok(()) => result.checkpoint_ids.push(*checkpoint_id),
            Err(err) if err.kind() == ErrorKind::NoDomainCheckpoint => {
                debug!("Checkpoint {} does not exist: {}", checkpoint_id, err);
                result.checkpoint_ids.push(*checkpoint_id);
            }
            Err(err) => {
                warn!("Failed to delete checkpoint {}: {}", checkpoint_id, err);
                result.error = Some(err.to_string());
                return result;
            }
        }
    }
    result
}

/// A checkpoint to redefine after e.g. a migration, either from its saved
/// XML or regenerated from the original backup request.
#[derive(Clone, Debug, Deserialize)]
pub struct CheckpointSpec {
    pub id: Uuid,
    #[serde(default)]
    pub xml: Option<String>,
    #[serde(default)]
    pub config: Option<BackupSpec>,
}

/// Redefine checkpoints in the domain, ordered base to leaf.
pub fn redefine_checkpoints(
    disks: &VmDisks,
    dom: &dyn BackupOps,
    checkpoints: &[CheckpointSpec],
) -> CheckpointResult {
    let mut result = CheckpointResult::default();
    for checkpoint in checkpoints {
        info!("Redefining checkpoint {}", checkpoint.id);
        let xml = if let Some(xml) = &checkpoint.xml {
            xml.clone()
        } else if let Some(config) = &checkpoint.config {
            match resolve_backup_disks(disks, config) {
                Ok(backup_disks) => match create_checkpoint_xml(config, &backup_disks) {
                    Some(xml) => xml,
                    None => {
                        result.error =
                            Some(format!("checkpoint {} has no target id", checkpoint.id));
                        return result;
                    }
                },
                Err(err) => {
                    result.error = Some(err.to_string());
                    return result;
                }
            }
        } else {
            result.error = Some(format!(
                "cannot redefine checkpoint {} without XML or backup config",
                checkpoint.id
            ));
            return result;
        };
        let flags = CHECKPOINT_CREATE_REDEFINE | CHECKPOINT_CREATE_REDEFINE_VALIDATE;
        if let Err(err) = dom.checkpoint_create_xml(&xml, flags) {
            warn!("Failed to redefine checkpoint {}: {}", checkpoint.id, err);
            result.error = Some(err.to_string());
            return result;
        }
        result.checkpoint_ids.push(checkpoint.id);
    }
    result
}

pub fn list_checkpoints(dom: &dyn BackupOps) -> Result<Vec<String>, BackupError> {
    Ok(dom.list_checkpoints()?)
}

pub fn dump_checkpoint(dom: &dyn BackupOps, checkpoint_id: Uuid) -> Result<String, BackupError> {
    match dom.checkpoint_xml_desc(&checkpoint_id.to_string()) {
        Ok(xml) => Ok(xml),
        Err(err) if err.kind() == ErrorKind::NoDomainCheckpoint => {
            Err(BackupError::NoSuchCheckpoint {
                checkpoint_id,
                reason: err.to_string(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn resolve_backup_disks(
    disks: &VmDisks,
    spec: &BackupSpec,
) -> Result<Vec<BackupDisk>, BackupError> {
    let mut backup_disks = Vec::with_capacity(spec.disks.len());
    for disk in &spec.disks {
        let drive = disks
            .drive_by_spec(&DriveSpec {
                sd_id: disk.sd_id,
                img_id: disk.img_id,
                vol_id: disk.vol_id,
            })
            .map_err(|err| {
                backup_err(
                    spec.backup_id,
                    format!("failed to find one of the backup disks: {}", err),
                )
            })?;
        backup_disks.push(BackupDisk {
            drive,
            backup_mode: disk.backup_mode,
            // Placeholder until scratch creation runs; replaced either by
            // the engine-provided config or by the created transient disk.
            scratch: disk.scratch_disk.clone().unwrap_or(ScratchDiskConfig {
                path: PathBuf::new(),
                disk_type: DiskType::File,
                sd_id: None,
                img_id: None,
                vol_id: None,
            }),
        });
    }
    Ok(backup_disks)
}

fn transient_disk_name(backup_id: Uuid, drive_name: &str) -> String {
    format!("{}.{}", backup_id, drive_name)
}

/// Create a transient scratch disk for every drive the engine did not
/// provide one for. All-or-nothing: one failure tears down every scratch
/// created in this batch.
fn create_scratch_disks(
    vm_id: Uuid,
    dom: &dyn BackupOps,
    storage: &dyn StorageOps,
    backup_id: Uuid,
    backup_disks: &mut [BackupDisk],
) -> Result<(), BackupError> {
    for backup_disk in backup_disks.iter_mut() {
        if !backup_disk.scratch.path.as_os_str().is_empty() {
            // Created by the engine on shared storage.
            continue;
        }
        let drive = &backup_disk.drive;
        let capacity = match dom.block_info(&drive.path().to_string_lossy()) {
            Ok(info) => info.capacity,
            Err(err) => {
                remove_scratch_disks(vm_id, storage, backup_id);
                return Err(backup_err(
                    backup_id,
                    format!("failed to get drive {} capacity: {}", drive.name(), err),
                ));
            }
        };
        let name = transient_disk_name(backup_id, drive.name());
        match storage.create_transient_disk(vm_id, &name, capacity) {
            Ok(path) => {
                backup_disk.scratch = ScratchDiskConfig {
                    path,
                    disk_type: DiskType::File,
                    sd_id: None,
                    img_id: None,
                    vol_id: None,
                };
            }
            Err(err) => {
                remove_scratch_disks(vm_id, storage, backup_id);
                return Err(backup_err(
                    backup_id,
                    format!("failed to create transient disk {}: {}", name, err),
                ));
            }
        }
    }
    Ok(())
}

/// Best-effort removal of every transient disk owned by the guest.
fn remove_scratch_disks(vm_id: Uuid, storage: &dyn StorageOps, backup_id: Uuid) {
    info!("Removing scratch disks for backup {}", backup_id);
    let names = match storage.list_transient_disks(vm_id) {
        Ok(names) => names,
        Err(err) => {
            warn!("Failed to fetch scratch disks of VM {}: {}", vm_id, err);
            return;
        }
    };
    for name in names {
        if let Err(err) = storage.remove_transient_disk(vm_id, &name) {
            warn!(
                "Failed to remove backup {} scratch disk {}: {}",
                backup_id, name, err
            );
        }
    }
}

/// Register block-typed scratch disks on their drives so the volume
/// monitor arms thresholds and extends them during the backup.
fn start_monitoring_scratch_disks(backup_disks: &[BackupDisk], backup: &ParsedBackup) {
    for backup_disk in backup_disks {
        if backup_disk.scratch.disk_type != DiskType::Block {
            continue;
        }
        let drive = &backup_disk.drive;
        let parsed = match backup.disks.get(drive.name()) {
            Some(parsed) => parsed,
            None => {
                warn!(
                    "Backup does not report drive {}, not monitoring its \
                     scratch disk",
                    drive.name()
                );
                continue;
            }
        };
        info!(
            "Start monitoring scratch disk {} for drive {}",
            backup_disk.scratch.path.display(),
            drive.name()
        );
        let vol = match (
            backup_disk.scratch.sd_id,
            backup_disk.scratch.img_id,
            backup_disk.scratch.vol_id,
        ) {
            (Some(sd_id), Some(img_id), Some(vol_id)) => Some(VolumeRefFields {
                pool_id: drive.pool_id(),
                sd_id,
                img_id,
                vol_id,
            }),
            _ => None,
        };
        drive.register_scratch(ScratchRef::new(
            parsed.index,
            backup_disk.scratch.path.clone(),
            vol,
        ));
    }
}

fn stop_monitoring_scratch_disks(disks: &VmDisks) {
    for drive in disks.drives() {
        if drive.scratch().is_some() {
            info!("Stop monitoring scratch disk for drive {}", drive.name());
            drive.clear_scratch();
        }
    }
}

fn backup_exists(vm_id: Uuid, dom: &dyn BackupOps, backup_id: Uuid) -> bool {
    match dom.backup_xml_desc() {
        Ok(_) => true,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::NoDomainBackup | ErrorKind::NoDomain
            ) =>
        {
            info!(
                "VM {} has no backup {}, error: {}",
                vm_id, backup_id, err
            );
            false
        }
        Err(err) => {
            warn!("Failed to fetch backup {} info: {}", backup_id, err);
            false
        }
    }
}

fn query_backup(
    vm_id: Uuid,
    dom: &dyn BackupOps,
    backup_id: Uuid,
) -> Result<ParsedBackup, BackupError> {
    let xml = match dom.backup_xml_desc() {
        Ok(xml) => xml,
        Err(err) if err.kind() == ErrorKind::NoDomainBackup => {
            return Err(BackupError::NoSuchBackup { vm_id, backup_id });
        }
        Err(err) => {
            return Err(backup_err(
                backup_id,
                format!("failed to fetch backup info: {}", err),
            ));
        }
    };
    debug!("Backup {} XML: {}", backup_id, xml);
    parse_backup_xml(&xml)
}

fn backup_info_result(
    disks: &VmDisks,
    dom: &dyn BackupOps,
    backup_id: Uuid,
    backup: &ParsedBackup,
    checkpoint_id: Option<Uuid>,
) -> Result<BackupInfo, BackupError> {
    let mut urls = HashMap::new();
    for (name, parsed) in &backup.disks {
        let drive = disks.drive_by_name(name).map_err(|err| {
            backup_err(
                backup_id,
                format!("backup reports unknown drive {}: {}", name, err),
            )
        })?;
        urls.insert(
            drive.img_id(),
            nbd_url(&backup.socket, &parsed.export_name),
        );
    }
    let checkpoint_xml = match checkpoint_id {
        Some(checkpoint_id) => match dom.checkpoint_xml_desc(&checkpoint_id.to_string()) {
            Ok(xml) => Some(xml),
            Err(err) => {
                warn!(
                    "Failed to fetch checkpoint {} of backup {}: {}",
                    checkpoint_id, backup_id, err
                );
                None
            }
        },
        None => None,
    };
    Ok(BackupInfo {
        disks: urls,
        checkpoint_xml,
    })
}

/// Parsed view of the domain's backup XML.
#[derive(Clone, Debug)]
struct ParsedBackup {
    socket: PathBuf,
    /// Keyed by drive name; only disks actually backed up.
    disks: HashMap<String, ParsedBackupDisk>,
}

#[derive(Clone, Debug)]
struct ParsedBackupDisk {
    index: u32,
    export_name: String,
}

fn parse_err(err: impl std::fmt::Display) -> BackupError {
    BackupError::Parse(err.to_string())
}

fn parse_backup_xml(xml: &str) -> Result<ParsedBackup, BackupError> {
    let mut reader = Reader::from_str(xml);
    let mut socket = None;
    let mut disks = HashMap::new();
    loop {
        match reader.read_event().map_err(parse_err)? {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"server" => {
                    for attr in e.attributes() {
                        let attr = attr.map_err(parse_err)?;
                        if attr.key.as_ref() == b"socket" {
                            socket = Some(PathBuf::from(
                                attr.unescape_value().map_err(parse_err)?.into_owned(),
                            ));
                        }
                    }
                }
                b"disk" => {
                    let mut name = None;
                    let mut backup = None;
                    let mut index = None;
                    let mut export_name = None;
                    let mut disk_type = None;
                    for attr in e.attributes() {
                        let attr = attr.map_err(parse_err)?;
                        let value = attr.unescape_value().map_err(parse_err)?.into_owned();
                        match attr.key.as_ref() {
                            b"name" => name = Some(value),
                            b"backup" => backup = Some(value),
                            b"index" => index = Some(value),
                            b"exportname" => export_name = Some(value),
                            b"type" => disk_type = Some(value),
                            _ => {}
                        }
                    }
                    if backup.as_deref() != Some("yes") {
                        continue;
                    }
                    let name =
                        name.ok_or_else(|| parse_err("backup disk without a name"))?;
                    let index = index
                        .ok_or_else(|| parse_err("backup disk without an index"))?
                        .parse::<u32>()
                        .map_err(|err| parse_err(format!("bad disk index: {}", err)))?;
                    let export_name = export_name
                        .ok_or_else(|| parse_err("backup disk without an exportname"))?;
                    disk_type.ok_or_else(|| parse_err("backup disk without a type"))?;
                    disks.insert(name, ParsedBackupDisk { index, export_name });
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(ParsedBackup {
        socket: socket.ok_or_else(|| parse_err("backup XML without a server socket"))?,
        disks,
    })
}

fn create_backup_xml(
    socket: &Path,
    backup_disks: &[BackupDisk],
    from_checkpoint_id: Option<Uuid>,
) -> String {
    let from_checkpoint = from_checkpoint_id.map(|id| id.to_string());
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let result: Result<_, quick_xml::Error> = writer
        .create_element("domainbackup")
        .with_attribute(("mode", "pull"))
        .write_inner_content(|w| {
            if let Some(from) = &from_checkpoint {
                w.create_element("incremental")
                    .write_text_content(BytesText::new(from))?;
            }
            w.create_element("server")
                .with_attribute(("transport", "unix"))
                .with_attribute(("socket", socket.to_string_lossy().as_ref()))
                .write_empty()?;
            w.create_element("disks").write_inner_content(|w| {
                for backup_disk in backup_disks {
                    let mut disk = w
                        .create_element("disk")
                        .with_attribute(("name", backup_disk.drive.name()))
                        .with_attribute(("type", backup_disk.scratch.disk_type.as_str()));
                    if let Some(mode) = backup_disk.backup_mode {
                        disk = disk.with_attribute(("backupmode", mode.as_str()));
                        if mode == BackupMode::Incremental {
                            if let Some(from) = &from_checkpoint {
                                disk = disk.with_attribute(("incremental", from.as_str()));
                            }
                        }
                    }
                    let path = backup_disk.scratch.path.to_string_lossy().into_owned();
                    let scratch_attr = if backup_disk.scratch.disk_type == DiskType::Block {
                        ("dev", path.as_str())
                    } else {
                        ("file", path.as_str())
                    };
                    disk.write_inner_content(|w| {
                        w.create_element("scratch")
                            .with_attribute(scratch_attr)
                            .write_inner_content(|w| {
                                w.create_element("seclabel")
                                    .with_attribute(("model", "dac"))
                                    .with_attribute(("relabel", "no"))
                                    .write_empty()?;
                                Ok::<(), quick_xml::Error>(())
                            })?;
                        Ok::<(), quick_xml::Error>(())
                    })?;
                }
                Ok::<(), quick_xml::Error>(())
            })?;
            Ok(())
        })
        .map(|_| ());
    debug_assert!(result.is_ok());
    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
}

fn create_checkpoint_xml(spec: &BackupSpec, backup_disks: &[BackupDisk]) -> Option<String> {
    let to_checkpoint_id = spec.to_checkpoint_id?;
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let checkpoint_disks: Vec<&BackupDisk> = spec
        .disks
        .iter()
        .zip(backup_disks)
        .filter(|(disk_spec, _)| disk_spec.checkpoint)
        .map(|(_, backup_disk)| backup_disk)
        .collect();
    let result: Result<_, quick_xml::Error> = writer
        .create_element("domaincheckpoint")
        .write_inner_content(|w| {
            w.create_element("name")
                .write_text_content(BytesText::new(&to_checkpoint_id.to_string()))?;
            w.create_element("description")
                .write_text_content(BytesText::new(&format!(
                    "checkpoint for backup '{}'",
                    spec.backup_id
                )))?;
            if let Some(creation_time) = spec.creation_time {
                w.create_element("creationTime")
                    .write_text_content(BytesText::new(&creation_time.to_string()))?;
            }
            // When redefining, old disks may have been detached from the
            // guest; without disks the element is omitted entirely.
            if !spec.disks.is_empty() {
                w.create_element("disks").write_inner_content(|w| {
                    for backup_disk in &checkpoint_disks {
                        w.create_element("disk")
                            .with_attribute(("name", backup_disk.drive.name()))
                            .with_attribute(("checkpoint", "bitmap"))
                            .with_attribute(("bitmap", to_checkpoint_id.to_string().as_str()))
                            .write_empty()?;
                    }
                    Ok::<(), quick_xml::Error>(())
                })?;
            }
            Ok(())
        })
        .map(|_| ());
    debug_assert!(result.is_ok());
    Some(String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default())
}
