// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drive configuration records, as handed to the agent by the management
//! engine. Field names follow the engine's wire format.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use uuid::Uuid;

use crate::drive::DriveError;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    #[default]
    Disk,
    Cdrom,
    Floppy,
    Lun,
}

impl DiskDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskDevice::Disk => "disk",
            DiskDevice::Cdrom => "cdrom",
            DiskDevice::Floppy => "floppy",
            DiskDevice::Lun => "lun",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskInterface {
    Ide,
    Scsi,
    Virtio,
    Fdc,
    Sata,
}

impl DiskInterface {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskInterface::Ide => "ide",
            DiskInterface::Scsi => "scsi",
            DiskInterface::Virtio => "virtio",
            DiskInterface::Fdc => "fdc",
            DiskInterface::Sata => "sata",
        }
    }

    /// Device-name prefix used when deriving the short drive name.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            DiskInterface::Ide => "hd",
            DiskInterface::Scsi | DiskInterface::Sata => "sd",
            DiskInterface::Virtio => "vd",
            DiskInterface::Fdc => "fd",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    File,
    Block,
    Network,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::File => "file",
            DiskType::Block => "block",
            DiskType::Network => "network",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Cow,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Cow => "cow",
        }
    }
}

/// Sharing policy. The engine still sends legacy boolean strings, which fold
/// into `Shared`/`None`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedType {
    #[default]
    None,
    Exclusive,
    Shared,
    Transient,
}

impl SharedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharedType::None => "none",
            SharedType::Exclusive => "exclusive",
            SharedType::Shared => "shared",
            SharedType::Transient => "transient",
        }
    }
}

fn deserialize_shared<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<SharedType, D::Error> {
    let value = String::deserialize(deserializer)?;
    match value.to_ascii_lowercase().as_str() {
        "none" => Ok(SharedType::None),
        "exclusive" => Ok(SharedType::Exclusive),
        "shared" | "true" => Ok(SharedType::Shared),
        "transient" => Ok(SharedType::Transient),
        "false" => Ok(SharedType::None),
        other => Err(serde::de::Error::custom(format!(
            "unknown shared value {:?}",
            other
        ))),
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagateErrors {
    On,
    #[default]
    Off,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sgio {
    Filtered,
    Unfiltered,
}

impl Sgio {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sgio::Filtered => "filtered",
            Sgio::Unfiltered => "unfiltered",
        }
    }
}

/// Per-category I/O limits. Values are validated rather than typed unsigned
/// because the engine sends plain JSON numbers and a negative limit must be
/// reported as a drive configuration error, not a decode error.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct IoTune {
    #[serde(default)]
    pub total_bytes_sec: Option<i64>,
    #[serde(default)]
    pub read_bytes_sec: Option<i64>,
    #[serde(default)]
    pub write_bytes_sec: Option<i64>,
    #[serde(default)]
    pub total_iops_sec: Option<i64>,
    #[serde(default)]
    pub read_iops_sec: Option<i64>,
    #[serde(default)]
    pub write_iops_sec: Option<i64>,
}

impl IoTune {
    pub fn validate(&self) -> Result<(), DriveError> {
        let params = [
            ("total_bytes_sec", self.total_bytes_sec),
            ("read_bytes_sec", self.read_bytes_sec),
            ("write_bytes_sec", self.write_bytes_sec),
            ("total_iops_sec", self.total_iops_sec),
            ("read_iops_sec", self.read_iops_sec),
            ("write_iops_sec", self.write_iops_sec),
        ];
        for (name, value) in params {
            if let Some(value) = value {
                if value < 0 {
                    return Err(DriveError::InvalidConfig(format!(
                        "iotune parameter {} must be equal or greater than zero",
                        name
                    )));
                }
            }
        }
        for (category, total, read, write) in [
            (
                "bytes",
                self.total_bytes_sec,
                self.read_bytes_sec,
                self.write_bytes_sec,
            ),
            (
                "iops",
                self.total_iops_sec,
                self.read_iops_sec,
                self.write_iops_sec,
            ),
        ] {
            let set = |v: Option<i64>| v.unwrap_or(0) != 0;
            if set(total) && (set(read) || set(write)) {
                return Err(DriveError::InvalidConfig(format!(
                    "a non-zero total value and a non-zero read/write value \
                     for {}_sec cannot be set at the same time",
                    category
                )));
            }
        }
        Ok(())
    }

    /// `(element name, value)` pairs for the set limits, in XML order.
    pub fn entries(&self) -> Vec<(&'static str, i64)> {
        [
            ("total_bytes_sec", self.total_bytes_sec),
            ("read_bytes_sec", self.read_bytes_sec),
            ("write_bytes_sec", self.write_bytes_sec),
            ("total_iops_sec", self.total_iops_sec),
            ("read_iops_sec", self.read_iops_sec),
            ("write_iops_sec", self.write_iops_sec),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SpecParams {
    #[serde(default, rename = "ioTune")]
    pub io_tune: Option<IoTune>,
    #[serde(default, rename = "pinToIoThread")]
    pub pin_to_io_thread: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HostAddress {
    pub name: String,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkAuth {
    pub username: String,
    #[serde(rename = "type")]
    pub auth_type: String,
    pub uuid: Uuid,
}

/// One element of the volume chain, ordered base to top in the
/// configuration record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeChainConfig {
    pub path: PathBuf,
    #[serde(rename = "volumeID")]
    pub vol_id: Uuid,
    #[serde(default, rename = "leasePath")]
    pub lease_path: Option<PathBuf>,
    #[serde(default, rename = "leaseOffset")]
    pub lease_offset: Option<u64>,
}

/// Replication target descriptor, present while a live storage migration is
/// copying this drive to another domain.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReplicaConfig {
    pub device: DiskDevice,
    #[serde(rename = "diskType")]
    pub disk_type: DiskType,
    pub format: DiskFormat,
    pub path: PathBuf,
    #[serde(rename = "poolID")]
    pub pool_id: Uuid,
    #[serde(rename = "domainID")]
    pub sd_id: Uuid,
    #[serde(rename = "imageID")]
    pub img_id: Uuid,
    #[serde(rename = "volumeID")]
    pub vol_id: Uuid,
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default, rename = "propagateErrors")]
    pub propagate_errors: PropagateErrors,
}

impl ReplicaConfig {
    pub fn chunked(&self) -> bool {
        self.disk_type == DiskType::Block && self.format == DiskFormat::Cow
    }

    pub fn vol_ref(&self) -> storage_ref::VolumeRefFields {
        storage_ref::VolumeRefFields {
            pool_id: self.pool_id,
            sd_id: self.sd_id,
            img_id: self.img_id,
            vol_id: self.vol_id,
        }
    }
}

/// Plain field bundle so `devices` does not depend on the storage trait
/// crate; callers convert to their own reference types.
pub mod storage_ref {
    use uuid::Uuid;

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct VolumeRefFields {
        pub pool_id: Uuid,
        pub sd_id: Uuid,
        pub img_id: Uuid,
        pub vol_id: Uuid,
    }
}

/// Drive configuration record as received from the engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DriveConfig {
    #[serde(default)]
    pub device: DiskDevice,
    pub iface: DiskInterface,
    pub index: u32,
    #[serde(rename = "diskType")]
    pub disk_type: DiskType,
    pub format: DiskFormat,
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default, deserialize_with = "deserialize_shared")]
    pub shared: SharedType,
    #[serde(default, rename = "propagateErrors")]
    pub propagate_errors: PropagateErrors,
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub discard: bool,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub iotune: Option<IoTune>,
    #[serde(default, rename = "specParams")]
    pub spec_params: Option<SpecParams>,
    #[serde(default, rename = "bootOrder")]
    pub boot_order: Option<u32>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub sgio: Option<Sgio>,
    #[serde(default)]
    pub managed_reservation: bool,
    #[serde(rename = "poolID")]
    pub pool_id: Uuid,
    #[serde(rename = "domainID")]
    pub sd_id: Uuid,
    #[serde(rename = "imageID")]
    pub img_id: Uuid,
    #[serde(rename = "volumeID")]
    pub vol_id: Uuid,
    #[serde(default, rename = "volumeChain")]
    pub volume_chain: Vec<VolumeChainConfig>,
    #[serde(default, rename = "diskReplicate")]
    pub disk_replicate: Option<ReplicaConfig>,
    #[serde(default)]
    pub hosts: Vec<HostAddress>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub auth: Option<NetworkAuth>,
    #[serde(default)]
    pub apparentsize: u64,
    #[serde(default)]
    pub truesize: u64,
    #[serde(default)]
    pub capacity: u64,
}

impl DriveConfig {
    pub fn validate(&self) -> Result<(), DriveError> {
        if self.device == DiskDevice::Lun && self.format == DiskFormat::Cow {
            return Err(DriveError::InvalidConfig(
                "cow format is not supported for LUN devices".into(),
            ));
        }
        if self.sgio.is_some() && self.device != DiskDevice::Lun {
            return Err(DriveError::InvalidConfig(
                "sgio can be set only for LUN devices".into(),
            ));
        }
        if self.disk_type == DiskType::Network {
            if self.hosts.is_empty() {
                return Err(DriveError::InvalidConfig(
                    "network disk without hosts".into(),
                ));
            }
            if self.protocol.is_none() {
                return Err(DriveError::InvalidConfig(
                    "network disk without protocol".into(),
                ));
            }
        }
        if let Some(iotune) = &self.iotune {
            iotune.validate()?;
        }
        if let Some(iotune) = self.spec_params.as_ref().and_then(|sp| sp.io_tune.as_ref()) {
            iotune.validate()?;
        }
        Ok(())
    }

    /// The effective iotune record: the dedicated field wins over the one
    /// nested in specParams.
    pub fn effective_iotune(&self) -> Option<&IoTune> {
        self.iotune
            .as_ref()
            .or_else(|| self.spec_params.as_ref().and_then(|sp| sp.io_tune.as_ref()))
    }
}
