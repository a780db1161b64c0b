// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Domain XML for disks: rendering the disk element the agent defines, and
//! recovering chain information from the XML the domain reports back.

use std::io::Cursor;
use std::path::Path;
use std::path::PathBuf;

use quick_xml::events::BytesText;
use quick_xml::events::Event;
use quick_xml::Reader;
use quick_xml::Writer;
use uuid::Uuid;

use crate::config::DiskDevice;
use crate::config::DiskFormat;
use crate::config::DiskType;
use crate::config::PropagateErrors;
use crate::config::SharedType;
use crate::drive::Drive;
use crate::drive::DriveError;
use crate::drive::VolumeChainEntry;

/// One `source` node of a disk element, top layer first in document order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceNode {
    pub path: PathBuf,
    pub index: Option<u32>,
}

/// The parts of a reported disk element the agent dispatches on.
#[derive(Clone, Debug, Default)]
pub struct DiskElement {
    pub dev: Option<String>,
    /// Top layer first; backing layers follow in chain order.
    pub sources: Vec<SourceNode>,
    /// A `<mirror ready='yes'>` element was present.
    pub mirror_ready: bool,
}

fn xml_err(err: quick_xml::Error) -> DriveError {
    DriveError::InvalidDiskXml(err.to_string())
}

fn attr_err(err: quick_xml::events::attributes::AttrError) -> DriveError {
    DriveError::InvalidDiskXml(err.to_string())
}

/// Parse every disk element of a full domain XML document.
pub fn parse_domain_disks(xml: &str) -> Result<Vec<DiskElement>, DriveError> {
    let mut reader = Reader::from_str(xml);
    let mut disks = Vec::new();
    let mut current: Option<DiskElement> = None;
    // Sources under <mirror> belong to the block-copy target, not to the
    // chain.
    let mut in_mirror = false;
    // Index attributes of the open backingStore elements, innermost last.
    let mut backing_indexes: Vec<Option<u32>> = Vec::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"disk" => {
                        current = Some(DiskElement::default());
                        backing_indexes.clear();
                        in_mirror = false;
                    }
                    b"mirror" if current.is_some() => {
                        in_mirror = true;
                        if attr_value(&e, b"ready")?.as_deref() == Some("yes") {
                            if let Some(disk) = &mut current {
                                disk.mirror_ready = true;
                            }
                        }
                    }
                    b"backingStore" if current.is_some() && !in_mirror => {
                        backing_indexes.push(parse_index_attr(&e)?);
                    }
                    b"source" => handle_source(&e, &mut current, in_mirror, &backing_indexes)?,
                    b"target" => handle_target(&e, &mut current)?,
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"mirror" if current.is_some() => {
                        if attr_value(&e, b"ready")?.as_deref() == Some("yes") {
                            if let Some(disk) = &mut current {
                                disk.mirror_ready = true;
                            }
                        }
                    }
                    b"source" => handle_source(&e, &mut current, in_mirror, &backing_indexes)?,
                    b"target" => handle_target(&e, &mut current)?,
                    // An empty backingStore terminates the chain.
                    _ => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"disk" => {
                    if let Some(disk) = current.take() {
                        disks.push(disk);
                    }
                }
                b"mirror" => in_mirror = false,
                b"backingStore" => {
                    if !in_mirror {
                        backing_indexes.pop();
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(disks)
}

fn handle_source(
    e: &quick_xml::events::BytesStart,
    current: &mut Option<DiskElement>,
    in_mirror: bool,
    backing_indexes: &[Option<u32>],
) -> Result<(), DriveError> {
    let disk = match current {
        Some(disk) if !in_mirror => disk,
        _ => return Ok(()),
    };
    let mut path = None;
    let mut index = None;
    for attr in e.attributes() {
        let attr = attr.map_err(attr_err)?;
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        match attr.key.as_ref() {
            b"file" | b"dev" | b"name" => path = Some(value),
            b"index" => {
                index = Some(value.parse::<u32>().map_err(|_| {
                    DriveError::InvalidDiskXml(format!("bad source index {:?}", value))
                })?)
            }
            _ => {}
        }
    }
    let path = path.ok_or_else(|| {
        DriveError::InvalidDiskXml("source element without a path".into())
    })?;
    // The enclosing backingStore carries the node index of its source.
    let index = index.or_else(|| backing_indexes.last().copied().flatten());
    disk.sources.push(SourceNode {
        path: PathBuf::from(path),
        index,
    });
    Ok(())
}

fn handle_target(
    e: &quick_xml::events::BytesStart,
    current: &mut Option<DiskElement>,
) -> Result<(), DriveError> {
    if let Some(disk) = current {
        if let Some(dev) = attr_value(e, b"dev")? {
            disk.dev = Some(dev);
        }
    }
    Ok(())
}

fn attr_value(
    e: &quick_xml::events::BytesStart,
    key: &[u8],
) -> Result<Option<String>, DriveError> {
    for attr in e.attributes() {
        let attr = attr.map_err(attr_err)?;
        if attr.key.as_ref() == key {
            return Ok(Some(attr.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

fn parse_index_attr(e: &quick_xml::events::BytesStart) -> Result<Option<u32>, DriveError> {
    match attr_value(e, b"index")? {
        Some(value) => value
            .parse::<u32>()
            .map(Some)
            .map_err(|_| DriveError::InvalidDiskXml(format!("bad backingStore index {:?}", value))),
        None => Ok(None),
    }
}

/// Parse a standalone disk element (or any fragment containing one).
pub fn parse_disk_element(xml: &str) -> Result<DiskElement, DriveError> {
    parse_domain_disks(xml)?
        .into_iter()
        .next()
        .ok_or_else(|| DriveError::InvalidDiskXml("no disk element".into()))
}

pub fn find_disk<'a>(disks: &'a [DiskElement], dev: &str) -> Option<&'a DiskElement> {
    disks.iter().find(|disk| disk.dev.as_deref() == Some(dev))
}

/// Whether the domain reports the named disk's mirror as ready to pivot.
/// `None` when the domain XML has no such disk.
pub fn domain_disk_mirror_ready(
    dom_xml: &str,
    dev: &str,
) -> Result<Option<bool>, DriveError> {
    Ok(find_disk(&parse_domain_disks(dom_xml)?, dev).map(|disk| disk.mirror_ready))
}

fn realpath(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Cross-reference the sources reported by the domain against the drive's
/// own volume chain (matching by resolved real path) and return the chain
/// base to top, carrying the domain's node indexes.
pub fn resolve_chain(
    drive: &Drive,
    disk: &DiskElement,
) -> Result<Vec<VolumeChainEntry>, DriveError> {
    if disk.sources.is_empty() {
        return Err(DriveError::InvalidDiskXml(
            "disk element without a source".into(),
        ));
    }
    let own = drive.volume_chain();
    let mut entries = Vec::with_capacity(disk.sources.len());
    for node in &disk.sources {
        let real = realpath(&node.path);
        let owner = own
            .iter()
            .find(|entry| realpath(&entry.path) == real)
            .ok_or_else(|| {
                DriveError::InvalidDiskXml(format!(
                    "reported volume {} is not in the chain of drive {}",
                    node.path.display(),
                    drive.name()
                ))
            })?;
        entries.push(VolumeChainEntry {
            path: node.path.clone(),
            vol_id: owner.vol_id,
            index: node.index,
            lease_path: owner.lease_path.clone(),
            lease_offset: owner.lease_offset,
        });
    }
    entries.reverse();
    Ok(entries)
}

/// The domain node index backing `vol_id` on this drive.
pub fn volume_index(
    drive: &Drive,
    disk: &DiskElement,
    vol_id: Uuid,
) -> Result<u32, DriveError> {
    let chain = resolve_chain(drive, disk)?;
    let entry = chain
        .iter()
        .find(|entry| entry.vol_id == vol_id)
        .ok_or(DriveError::VolumeNotFound(vol_id))?;
    entry.index.ok_or_else(|| {
        DriveError::InvalidDiskXml(format!("no node index reported for volume {}", vol_id))
    })
}

impl Drive {
    /// Recover the current volume chain from a reported disk element.
    pub fn parse_volume_chain(
        &self,
        disk_xml: &str,
    ) -> Result<Vec<VolumeChainEntry>, DriveError> {
        let disk = parse_disk_element(disk_xml)?;
        resolve_chain(self, &disk)
    }
}

type XmlWriter<'a> = &'a mut Writer<Cursor<Vec<u8>>>;

fn write_source(w: XmlWriter, drive: &Drive) -> Result<(), quick_xml::Error> {
    let path = drive.path();
    let path_str = path.to_string_lossy();
    let mut source = w.create_element("source");
    match drive.disk_type() {
        DiskType::Block => source = source.with_attribute(("dev", path_str.as_ref())),
        DiskType::File => {
            source = source.with_attribute(("file", path_str.as_ref()));
            if matches!(drive.device(), DiskDevice::Cdrom | DiskDevice::Floppy) {
                source = source.with_attribute(("startupPolicy", "optional"));
            }
        }
        DiskType::Network => {
            let protocol = drive.protocol().unwrap_or_default().to_string();
            source = source
                .with_attribute(("protocol", protocol.as_str()))
                .with_attribute(("name", path_str.as_ref()));
        }
    }
    source.write_inner_content(|w| {
        if drive.disk_type() == DiskType::Network {
            for host in drive.hosts() {
                let mut element = w.create_element("host");
                element = element.with_attribute(("name", host.name.as_str()));
                if let Some(port) = &host.port {
                    element = element.with_attribute(("port", port.as_str()));
                }
                if let Some(transport) = &host.transport {
                    element = element.with_attribute(("transport", transport.as_str()));
                }
                element.write_empty()?;
            }
        }
        // Keep dynamic ownership off; the agent manages volume ownership.
        w.create_element("seclabel")
            .with_attribute(("model", "dac"))
            .with_attribute(("relabel", "no"))
            .with_attribute(("type", "none"))
            .write_empty()?;
        Ok::<(), quick_xml::Error>(())
    })?;
    Ok(())
}

fn write_driver(w: XmlWriter, drive: &Drive) -> Result<(), quick_xml::Error> {
    let mut driver = w
        .create_element("driver")
        .with_attribute(("name", "qemu"))
        .with_attribute((
            "type",
            match drive.format() {
                DiskFormat::Cow => "qcow2",
                DiskFormat::Raw => "raw",
            },
        ));
    let cache = drive.cache().map(str::to_owned);
    if let Some(cache) = &cache {
        driver = driver.with_attribute(("cache", cache.as_str()));
    }
    driver = driver.with_attribute((
        "io",
        if drive.disk_type() == DiskType::Block {
            "native"
        } else {
            "threads"
        },
    ));
    driver = driver.with_attribute((
        "error_policy",
        if drive.propagate_errors() == PropagateErrors::On {
            "enospace"
        } else {
            "stop"
        },
    ));
    if drive.discard() {
        driver = driver.with_attribute(("discard", "unmap"));
    }
    driver.write_empty()?;
    Ok(())
}

/// Render the disk element for the domain definition.
pub fn render_disk_xml(drive: &Drive) -> Result<String, DriveError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .create_element("disk")
        .with_attribute(("device", drive.device().as_str()))
        .with_attribute(("snapshot", "no"))
        .with_attribute(("type", drive.disk_type().as_str()))
        .write_inner_content(|w| {
            write_source(w, drive)?;
            if drive.disk_type() == DiskType::Network {
                if let Some(auth) = drive.auth() {
                    w.create_element("auth")
                        .with_attribute(("username", auth.username.as_str()))
                        .write_inner_content(|w| {
                            w.create_element("secret")
                                .with_attribute(("type", auth.auth_type.as_str()))
                                .with_attribute(("uuid", auth.uuid.to_string().as_str()))
                                .write_empty()?;
                            Ok::<(), quick_xml::Error>(())
                        })?;
                }
            }
            w.create_element("target")
                .with_attribute(("bus", drive.iface().as_str()))
                .with_attribute(("dev", drive.name()))
                .write_empty()?;
            if drive.readonly() {
                w.create_element("readonly").write_empty()?;
            }
            if drive.shared() == SharedType::Shared {
                w.create_element("shareable").write_empty()?;
            }
            if drive.device() != DiskDevice::Lun {
                if let Some(serial) = drive.serial() {
                    w.create_element("serial")
                        .write_text_content(BytesText::new(serial))?;
                }
            }
            if matches!(drive.device(), DiskDevice::Disk | DiskDevice::Lun) {
                write_driver(w, drive)?;
            }
            if let Some(order) = drive.boot_order() {
                w.create_element("boot")
                    .with_attribute(("order", order.to_string().as_str()))
                    .write_empty()?;
            }
            if let Some(alias) = drive.alias() {
                w.create_element("alias")
                    .with_attribute(("name", alias))
                    .write_empty()?;
            }
            if let Some(iotune) = drive.iotune() {
                let entries = iotune.entries();
                if !entries.is_empty() {
                    w.create_element("iotune").write_inner_content(|w| {
                        for (name, value) in entries {
                            w.create_element(name)
                                .write_text_content(BytesText::new(&value.to_string()))?;
                        }
                        Ok::<(), quick_xml::Error>(())
                    })?;
                }
            }
            if drive.managed_reservation() {
                w.create_element("reservations")
                    .with_attribute(("managed", "yes"))
                    .write_empty()?;
            }
            Ok(())
        })
        .map_err(xml_err)?;
    into_string(writer)
}

/// Render the replica disk element used while setting up a block copy; only
/// the source and driver matter to the destination.
pub fn render_replica_xml(drive: &Drive) -> Result<String, DriveError> {
    let replica = drive.replica().ok_or_else(|| {
        DriveError::InvalidConfig(format!("drive {} is not replicating", drive.name()))
    })?;
    let path = replica.path.to_string_lossy().into_owned();
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .create_element("disk")
        .with_attribute(("device", replica.device.as_str()))
        .with_attribute(("snapshot", "no"))
        .with_attribute(("type", replica.disk_type.as_str()))
        .write_inner_content(|w| {
            let source = w.create_element("source");
            match replica.disk_type {
                DiskType::Block => source.with_attribute(("dev", path.as_str())),
                DiskType::File => source.with_attribute(("file", path.as_str())),
                DiskType::Network => source.with_attribute(("name", path.as_str())),
            }
            .write_empty()?;
            let mut driver = w
                .create_element("driver")
                .with_attribute(("name", "qemu"))
                .with_attribute((
                    "type",
                    match replica.format {
                        DiskFormat::Cow => "qcow2",
                        DiskFormat::Raw => "raw",
                    },
                ));
            if let Some(cache) = &replica.cache {
                driver = driver.with_attribute(("cache", cache.as_str()));
            }
            driver
                .with_attribute((
                    "error_policy",
                    if replica.propagate_errors == PropagateErrors::On {
                        "enospace"
                    } else {
                        "stop"
                    },
                ))
                .write_empty()?;
            Ok(())
        })
        .map_err(xml_err)?;
    into_string(writer)
}

fn into_string(writer: Writer<Cursor<Vec<u8>>>) -> Result<String, DriveError> {
    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|err| DriveError::InvalidDiskXml(err.to_string()))
}
