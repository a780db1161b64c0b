// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Volume monitor integration tests over fake domain and storage
//! collaborators.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use common::*;
use devices::config::storage_ref::VolumeRefFields;
use devices::drive::ScratchRef;
use devices::drive::ThresholdState;
use devices::drive::MIB;
use devices::Drive;
use hypervisor::ErrorKind;
use hypervisor::PauseCode;
use storage_api::StorageError;
use uuid::Uuid;
use vm_agent::monitor::MonitorError;

const WAIT: Duration = Duration::from_secs(5);

/// Two block/cow drives shaped like the canonical scenario: 1 GiB
/// allocated, 5 GiB physical, 10 GiB capacity, 2.5 GiB chunks, watermark
/// 2 GiB, so the first threshold lands at 3 GiB.
fn setup() -> (TestVm, Arc<Drive>, Arc<Drive>) {
    let vda = make_drive(drive_json("virtio", 0, "block", "cow"));
    let vdb = make_drive(drive_json("virtio", 1, "block", "cow"));
    let vm = TestVm::new(vec![Arc::clone(&vda), Arc::clone(&vdb)]);
    {
        let mut state = vm.virt.state.lock();
        state.nodes = vec![
            node_stats("vda", 1, "/virtio/0", GIB, 10 * GIB, 5 * GIB),
            node_stats("vdb", 2, "/virtio/1", GIB, 10 * GIB, 5 * GIB),
        ];
        state.xml = render_dom_xml(&[
            XmlDisk {
                dev: "vda".to_string(),
                chain: vec![("/virtio/0".to_string(), 1)],
                mirror_ready: None,
            },
            XmlDisk {
                dev: "vdb".to_string(),
                chain: vec![("/virtio/1".to_string(), 2)],
                mirror_ready: None,
            },
        ]);
    }
    (vm, vda, vdb)
}

fn vdb_stats(vm: &TestVm, allocation: u64, capacity: u64, physical: u64) {
    let mut state = vm.virt.state.lock();
    state.nodes[1] = node_stats("vdb", 2, "/virtio/1", allocation, capacity, physical);
}

#[test]
fn first_cycle_arms_thresholds() {
    let (vm, vda, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();

    let thresholds = vm.virt.state.lock().thresholds.clone();
    assert_eq!(
        thresholds,
        vec![
            ("vda[1]".to_string(), 3 * GIB),
            ("vdb[2]".to_string(), 3 * GIB),
        ]
    );
    assert_eq!(vda.threshold_state(), ThresholdState::Set);
    assert_eq!(vdb.threshold_state(), ThresholdState::Set);
    // Nothing was extended.
    assert_eq!(vm.storage.extension_count(), 0);
}

#[test]
fn second_cycle_leaves_set_drives_alone() {
    let (vm, _, _) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vm.virt.state.lock().thresholds.len(), 2);
}

#[test]
fn bare_name_event_is_ignored() {
    let (vm, _, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vm.monitor
        .on_block_threshold("vdb", "/virtio/1", 3 * GIB, MIB);
    assert_eq!(vdb.threshold_state(), ThresholdState::Set);
}

#[test]
fn indexed_event_marks_exceeded() {
    let (vm, vda, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vm.monitor
        .on_block_threshold("vdb[2]", "/virtio/1", 3 * GIB, MIB);
    assert_eq!(vdb.threshold_state(), ThresholdState::Exceeded);
    assert!(vdb.exceeded_time().is_some());
    assert_eq!(vda.threshold_state(), ThresholdState::Set);
}

#[test]
fn unknown_drive_event_is_dropped() {
    let (vm, vda, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vm.monitor
        .on_block_threshold("vdc[3]", "/virtio/2", 3 * GIB, MIB);
    assert_eq!(vda.threshold_state(), ThresholdState::Set);
    assert_eq!(vdb.threshold_state(), ThresholdState::Set);
}

#[test]
fn exceeded_drive_gets_extended() {
    let (vm, _, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vdb_stats(&vm, 3 * GIB + MIB, 10 * GIB, 5 * GIB);
    vm.monitor
        .on_block_threshold("vdb[2]", "/virtio/1", 3 * GIB + MIB, MIB);

    vm.monitor.monitor_volumes().unwrap();

    assert_eq!(vm.storage.extension_count(), 1);
    let spec = vm.storage.extension_spec(0);
    assert_eq!(spec.vol.vol_id, vdb.vol_id());
    assert_eq!(spec.vol.sd_id, vdb.sd_id());
    assert_eq!(spec.new_size, 7680 * MIB);
    assert_eq!(vdb.threshold_state(), ThresholdState::Exceeded);
    assert!(vdb.extend_time().is_some());
}

#[test]
fn extend_completion_updates_drive_and_rearms() {
    let (vm, _, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vdb_stats(&vm, 3 * GIB + MIB, 10 * GIB, 5 * GIB);
    vm.monitor
        .on_block_threshold("vdb[2]", "/virtio/1", 3 * GIB + MIB, MIB);
    vm.monitor.monitor_volumes().unwrap();

    // The storage layer grew the LV to the requested size.
    vm.storage.set_volume_size(vdb.vol_id(), 7680 * MIB);
    vm.storage.complete_extension(0, Ok(()));

    assert!(wait_until(WAIT, || {
        vdb.threshold_state() == ThresholdState::Set
    }));
    assert_eq!(vdb.apparentsize(), 7680 * MIB);
    assert!(vdb.extend_time().is_none());
    let state = vm.virt.state.lock();
    // 7680 MiB minus the 2 GiB watermark.
    assert_eq!(
        state.thresholds.last().unwrap(),
        &("vdb[2]".to_string(), 5632 * MIB)
    );
    drop(state);
    assert!(vm
        .storage
        .state
        .lock()
        .refreshed
        .contains(&vdb.vol_id()));
}

#[test]
fn extend_verification_failure_leaves_drive_exceeded() {
    let (vm, _, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vdb_stats(&vm, 3 * GIB + MIB, 10 * GIB, 5 * GIB);
    vm.monitor
        .on_block_threshold("vdb[2]", "/virtio/1", 3 * GIB + MIB, MIB);
    vm.monitor.monitor_volumes().unwrap();

    // The storage layer reports a size smaller than requested.
    vm.storage.set_volume_size(vdb.vol_id(), 5 * GIB);
    vm.storage.complete_extension(0, Ok(()));

    // The drive must stay exceeded so the next cycle retries.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(vdb.threshold_state(), ThresholdState::Exceeded);
}

#[test]
fn extend_send_failure_leaves_drive_exceeded() {
    let (vm, _, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vdb_stats(&vm, 3 * GIB + MIB, 10 * GIB, 5 * GIB);
    vm.monitor
        .on_block_threshold("vdb[2]", "/virtio/1", 3 * GIB + MIB, MIB);
    vm.storage.state.lock().send_error =
        Some(StorageError::Unavailable("mailbox down".to_string()));

    vm.monitor.monitor_volumes().unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(vm.storage.extension_count(), 0);
    assert_eq!(vdb.threshold_state(), ThresholdState::Exceeded);
}

#[test]
fn drive_at_maximum_size_is_disabled() {
    let (vm, _, vdb) = setup();
    // Maximum size for a 10 GiB volume is 11 GiB; physical reached it.
    vdb_stats(&vm, 8 * GIB, 10 * GIB, 11 * GIB);
    vdb.on_enospc();

    vm.monitor.monitor_volumes().unwrap();

    assert_eq!(vdb.threshold_state(), ThresholdState::Disabled);
    assert_eq!(vm.storage.extension_count(), 0);
    assert!(!vdb.needs_monitoring());
}

#[test]
fn resized_drive_is_monitored_again() {
    let (vm, _, vdb) = setup();
    vdb_stats(&vm, 8 * GIB, 10 * GIB, 11 * GIB);
    vdb.on_enospc();
    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vdb.threshold_state(), ThresholdState::Disabled);

    // The operator resized the drive to 15 GiB and cleared the state.
    vdb_stats(&vm, 9 * GIB + MIB, 15 * GIB, 11 * GIB);
    vdb.mark_threshold_unset();

    vm.monitor.monitor_volumes().unwrap();

    // Free space is below the watermark, so the cycle synthesized an event
    // and queued an extension to the next chunk.
    assert_eq!(vdb.threshold_state(), ThresholdState::Exceeded);
    assert_eq!(vm.storage.extension_count(), 1);
    assert_eq!(vm.storage.extension_spec(0).new_size, 13824 * MIB);
}

#[test]
fn improbable_allocation_pauses_the_guest() {
    let (vm, vda, _) = setup();
    let next_size = vda.next_volume_size(5 * GIB, 10 * GIB);
    {
        let mut state = vm.virt.state.lock();
        state.nodes[0] = node_stats("vda", 1, "/virtio/0", next_size + 1, 10 * GIB, 5 * GIB);
    }

    let result = vm.monitor.monitor_volumes();

    assert!(matches!(
        result,
        Err(MonitorError::ImprobableAllocation { .. })
    ));
    assert_eq!(vm.virt.state.lock().suspended, Some(PauseCode::Eother));
    assert_eq!(vm.storage.extension_count(), 0);
}

#[test]
fn threshold_arm_failure_leaves_drive_unset() {
    let (vm, vda, vdb) = setup();
    vm.virt.state.lock().threshold_error = Some(ErrorKind::Other);

    vm.monitor.monitor_volumes().unwrap();

    assert_eq!(vda.threshold_state(), ThresholdState::Unset);
    assert_eq!(vdb.threshold_state(), ThresholdState::Unset);

    // The next cycle retries once the domain recovers.
    vm.virt.state.lock().threshold_error = None;
    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vda.threshold_state(), ThresholdState::Set);
}

#[test]
fn arm_failure_while_migrating_is_expected() {
    let (vm, vda, _) = setup();
    vm.virt.state.lock().threshold_error = Some(ErrorKind::OperationInvalid);
    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vda.threshold_state(), ThresholdState::Unset);
}

#[test]
fn stats_failure_skips_the_cycle() {
    let (vm, vda, _) = setup();
    vm.virt.state.lock().stats_error = true;
    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vda.threshold_state(), ThresholdState::Unset);
    assert!(vm.virt.state.lock().thresholds.is_empty());
}

#[test]
fn inflight_extension_is_not_repeated() {
    let (vm, _, vdb) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vdb_stats(&vm, 3 * GIB + MIB, 10 * GIB, 5 * GIB);
    vm.monitor
        .on_block_threshold("vdb[2]", "/virtio/1", 3 * GIB + MIB, MIB);
    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vm.storage.extension_count(), 1);

    // Still exceeded, extension still in flight: skip.
    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vm.storage.extension_count(), 1);

    // Enough time passed since the request: extend again.
    vdb.set_extend_time(Some(Instant::now() - Duration::from_secs(21)));
    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vm.storage.extension_count(), 2);
}

#[test]
fn lost_threshold_extends_despite_inflight_gate() {
    let (vm, _, vdb) = setup();
    // A recent extension is in flight, but arming the new threshold failed
    // and the guest already wrote past it.
    vdb.set_extend_time(Some(Instant::now()));
    vdb_stats(&vm, 3 * GIB + MIB, 10 * GIB, 5 * GIB);

    vm.monitor.monitor_volumes().unwrap();

    assert!(vm
        .storage
        .state
        .lock()
        .pending
        .iter()
        .any(|(spec, _)| spec.vol.vol_id == vdb.vol_id()));
    assert_eq!(vdb.threshold_state(), ThresholdState::Exceeded);
}

#[test]
fn busy_monitor_lock_skips_only_that_drive() {
    let (vm, vda, vdb) = setup();
    let _guard = vda.monitor_lock(Duration::from_millis(50)).unwrap();

    vm.monitor.monitor_volumes().unwrap();

    assert_eq!(vda.threshold_state(), ThresholdState::Unset);
    assert_eq!(vdb.threshold_state(), ThresholdState::Set);
}

#[test]
fn clear_threshold_disarms() {
    let (vm, vda, _) = setup();
    vm.monitor.clear_threshold(&vda, Some(1)).unwrap();
    vm.monitor.clear_threshold(&vda, None).unwrap();
    let state = vm.virt.state.lock();
    assert_eq!(state.thresholds[0], ("vda[1]".to_string(), 0));
    assert_eq!(state.thresholds[1], ("vda".to_string(), 0));
}

#[test]
fn enospc_marks_exceeded() {
    let (vm, vda, _) = setup();
    vm.monitor.monitor_volumes().unwrap();
    vm.monitor.on_enospc(&vda);
    assert_eq!(vda.threshold_state(), ThresholdState::Exceeded);
}

#[test]
fn monitoring_needed_follows_enable_state() {
    let (vm, _, _) = setup();
    assert!(vm.monitor.monitoring_needed());
    vm.monitor.disable();
    assert!(!vm.monitor.monitoring_needed());
    vm.monitor.enable();
    assert!(vm.monitor.monitoring_needed());
}

#[test]
fn raw_drives_are_not_monitored() {
    let raw = make_drive(drive_json("virtio", 0, "block", "raw"));
    let vm = TestVm::new(vec![raw]);
    assert!(!vm.monitor.monitoring_needed());
    vm.monitor.monitor_volumes().unwrap();
    assert!(vm.virt.state.lock().thresholds.is_empty());
}

// Replication.

fn replica_json(disk_type: &str) -> serde_json::Value {
    serde_json::json!({
        "device": "disk",
        "diskType": disk_type,
        "format": "cow",
        "path": "/dev/replica",
        "poolID": Uuid::new_v4().to_string(),
        "domainID": Uuid::new_v4().to_string(),
        "imageID": Uuid::new_v4().to_string(),
        "volumeID": Uuid::new_v4().to_string(),
    })
}

fn setup_replicating(source_type: &str) -> (TestVm, Arc<Drive>, Uuid) {
    let mut json = drive_json("virtio", 0, source_type, "cow");
    let replica = replica_json("block");
    let replica_vol: Uuid = replica["volumeID"].as_str().unwrap().parse().unwrap();
    json["diskReplicate"] = replica;
    let vda = make_drive(json);
    let vm = TestVm::new(vec![Arc::clone(&vda)]);
    {
        let mut state = vm.virt.state.lock();
        state.xml = render_dom_xml(&[XmlDisk {
            dev: "vda".to_string(),
            chain: vec![("/virtio/0".to_string(), 1)],
            mirror_ready: None,
        }]);
    }
    (vm, vda, replica_vol)
}

#[test]
fn file_source_uses_replica_size_for_arming() {
    // A file drive replicating to a block drive: the domain reports equal
    // allocation and physical for the source, so the replica's apparent
    // size is the physical value that matters. During replication the
    // chunk doubles, putting the watermark at 4 GiB.
    let (vm, vda, replica_vol) = setup_replicating("file");
    vm.virt.state.lock().nodes =
        vec![node_stats("vda", 1, "/virtio/0", GIB, 10 * GIB, GIB)];
    vm.storage
        .set_volume_size(replica_vol, 7680 * MIB);

    vm.monitor.monitor_volumes().unwrap();

    assert_eq!(
        vm.virt.state.lock().thresholds,
        vec![("vda[1]".to_string(), 3584 * MIB)]
    );
    assert_eq!(vda.threshold_state(), ThresholdState::Set);
}

#[test]
fn replica_only_extension_for_file_source() {
    let (vm, vda, replica_vol) = setup_replicating("file");
    // Free space on the replica (5 GiB) minus allocation is below the
    // doubled watermark, so the first cycle extends immediately.
    vm.virt.state.lock().nodes = vec![node_stats(
        "vda",
        1,
        "/virtio/0",
        1536 * MIB,
        10 * GIB,
        1536 * MIB,
    )];
    vm.storage.set_volume_size(replica_vol, 5 * GIB);

    vm.monitor.monitor_volumes().unwrap();

    assert_eq!(vm.storage.extension_count(), 1);
    let spec = vm.storage.extension_spec(0);
    assert_eq!(spec.vol.vol_id, replica_vol);
    assert_eq!(spec.new_size, 10 * GIB);

    // Completion verifies the replica and finishes; the source is a file
    // and needs no extension of its own.
    vm.storage.set_volume_size(replica_vol, 10 * GIB);
    vm.storage.complete_extension(0, Ok(()));
    assert!(wait_until(WAIT, || {
        vm.storage.state.lock().refreshed.contains(&replica_vol)
    }));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(vm.storage.extension_count(), 1);
    assert_eq!(vda.threshold_state(), ThresholdState::Exceeded);
}

#[test]
fn replica_then_source_extension_for_block_source() {
    let (vm, vda, replica_vol) = setup_replicating("block");
    vm.virt.state.lock().nodes = vec![node_stats(
        "vda",
        1,
        "/virtio/0",
        3584 * MIB,
        10 * GIB,
        5 * GIB,
    )];

    vm.monitor.monitor_volumes().unwrap();

    // The replica goes first.
    assert_eq!(vm.storage.extension_count(), 1);
    assert_eq!(vm.storage.extension_spec(0).vol.vol_id, replica_vol);
    assert_eq!(vm.storage.extension_spec(0).new_size, 10 * GIB);

    vm.storage.set_volume_size(replica_vol, 10 * GIB);
    vm.storage.complete_extension(0, Ok(()));

    // Then the source, with the same new size.
    assert!(wait_until(WAIT, || vm.storage.extension_count() == 2));
    let spec = vm.storage.extension_spec(1);
    assert_eq!(spec.vol.vol_id, vda.vol_id());
    assert_eq!(spec.new_size, 10 * GIB);

    vm.storage.set_volume_size(vda.vol_id(), 10 * GIB);
    vm.storage.complete_extension(1, Ok(()));

    assert!(wait_until(WAIT, || {
        vda.threshold_state() == ThresholdState::Set
    }));
    assert_eq!(vda.apparentsize(), 10 * GIB);
    // The new threshold uses the doubled replication watermark.
    assert_eq!(
        vm.virt.state.lock().thresholds.last().unwrap(),
        &("vda[1]".to_string(), 6 * GIB)
    );
}

#[test]
fn unsupported_destination_refresh_disables_monitoring() {
    let (vm, _, vdb) = setup();
    {
        let mut state = vm.storage.state.lock();
        state.refresh_destination = true;
        state.refresh_destination_unsupported = true;
    }
    vm.monitor.monitor_volumes().unwrap();
    vdb_stats(&vm, 3 * GIB + MIB, 10 * GIB, 5 * GIB);
    vm.monitor
        .on_block_threshold("vdb[2]", "/virtio/1", 3 * GIB + MIB, MIB);
    vm.monitor.monitor_volumes().unwrap();

    vm.storage.set_volume_size(vdb.vol_id(), 7680 * MIB);
    vm.storage.complete_extension(0, Ok(()));

    assert!(wait_until(WAIT, || !vm.monitor.enabled()));
}

// Backup scratch disks.

#[test]
fn block_scratch_disk_is_monitored() {
    let raw = make_drive(drive_json("virtio", 0, "file", "raw"));
    let vm = TestVm::new(vec![Arc::clone(&raw)]);
    let scratch_vol = Uuid::new_v4();
    raw.register_scratch(ScratchRef::new(
        7,
        PathBuf::from("/dev/scratch"),
        Some(VolumeRefFields {
            pool_id: raw.pool_id(),
            sd_id: Uuid::new_v4(),
            img_id: Uuid::new_v4(),
            vol_id: scratch_vol,
        }),
    ));
    vm.virt.state.lock().nodes =
        vec![node_stats("vda", 7, "/dev/scratch", GIB, 10 * GIB, 5 * GIB)];

    assert!(vm.monitor.monitoring_needed());
    vm.monitor.monitor_volumes().unwrap();

    assert_eq!(
        vm.virt.state.lock().thresholds,
        vec![("vda[7]".to_string(), 3 * GIB)]
    );
    assert_eq!(
        raw.scratch().unwrap().threshold_state,
        ThresholdState::Set
    );

    // The guest wrote into the scratch disk.
    vm.monitor
        .on_block_threshold("vda[7]", "/dev/scratch", 3 * GIB, MIB);
    assert_eq!(
        raw.scratch().unwrap().threshold_state,
        ThresholdState::Exceeded
    );

    vm.monitor.monitor_volumes().unwrap();
    assert_eq!(vm.storage.extension_count(), 1);
    let spec = vm.storage.extension_spec(0);
    assert_eq!(spec.vol.vol_id, scratch_vol);
    assert_eq!(spec.new_size, 7680 * MIB);

    vm.storage.set_volume_size(scratch_vol, 7680 * MIB);
    vm.storage.complete_extension(0, Ok(()));
    assert!(wait_until(WAIT, || {
        raw.scratch().unwrap().threshold_state == ThresholdState::Set
    }));
    assert_eq!(
        vm.virt.state.lock().thresholds.last().unwrap(),
        &("vda[7]".to_string(), 5632 * MIB)
    );
}
