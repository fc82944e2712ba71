//! Reconnect and resynchronization between two live devices.
//!
//! Packets travel by draining each device's outbox into the other's
//! packet handler, the way an embedding layer pumps a session pair.

use blockmirror::device::{DeviceConfig, ReplicaDevice};
use blockmirror::meta::{Superblock, FLAG_FULL_SYNC_PENDING};
use blockmirror::resync::{ResyncPhase, SyncDecision, SyncDirection};
use blockmirror::state::{ConnectionState, DiskState, Role};
use blockmirror::storage::MemoryDisk;

const DEVICE_SECTORS: u64 = 1 << 12; // 2 MiB, 512 bitmap blocks

fn make_device(minor: u32, disk: DiskState) -> ReplicaDevice {
    let mut config = DeviceConfig::new(minor, DEVICE_SECTORS);
    // keep resync data packets within one wire frame
    config.max_resync_chunk_blocks = 8;
    let storage = MemoryDisk::new(config.device_sectors);
    let mut dev = ReplicaDevice::new(config, Box::new(storage)).unwrap();
    dev.attach(disk).unwrap();
    dev
}

/// Give a device a known generation chain, as if restored from disk.
fn seed_generation(dev: &mut ReplicaDevice, current: u64, bitmap: u64) {
    let mut sb = Superblock::new(dev.superblock().device_uuid, dev.superblock().geometry);
    sb.uuids.current = current;
    sb.uuids.bitmap = bitmap;
    dev.load_metadata(&sb.encode()).unwrap();
}

/// Exchange outboxes until both sides go quiet.
fn pump(a: &mut ReplicaDevice, b: &mut ReplicaDevice) {
    loop {
        let from_a = a.drain_outbox();
        let from_b = b.drain_outbox();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for packet in from_a {
            b.handle_packet(packet).unwrap();
        }
        for packet in from_b {
            a.handle_packet(packet).unwrap();
        }
    }
}

fn connect(a: &mut ReplicaDevice, b: &mut ReplicaDevice) {
    a.begin_connection().unwrap();
    b.begin_connection().unwrap();
    a.establish_connection().unwrap();
    b.establish_connection().unwrap();
    pump(a, b);
}

/// Drive a running source-side resync to completion.
fn drive_resync(source: &mut ReplicaDevice, target: &mut ReplicaDevice) {
    let mut steps = 0;
    while source.resync_phase() == ResyncPhase::Running {
        assert!(source.resync_step().unwrap(), "running resync must hand out work");
        pump(source, target);
        steps += 1;
        assert!(steps < 10_000, "resync failed to converge");
    }
    pump(source, target);
}

#[test]
fn test_equal_generations_reconnect_without_resync() {
    let mut a = make_device(0, DiskState::UpToDate);
    let mut b = make_device(1, DiskState::UpToDate);
    seed_generation(&mut a, 0x1000, 0);
    seed_generation(&mut b, 0x1000, 0);

    connect(&mut a, &mut b);
    assert_eq!(a.decide_resync().unwrap(), SyncDecision::NoSync);
    assert_eq!(b.decide_resync().unwrap(), SyncDecision::NoSync);
    pump(&mut a, &mut b);

    for dev in [&a, &b] {
        let state = dev.state();
        assert_eq!(state.connection, ConnectionState::Connected);
        assert_eq!(state.disk, DiskState::UpToDate);
        assert_eq!(state.peer_disk, DiskState::UpToDate);
        assert_eq!(dev.dirty_blocks(), 0);
        assert_eq!(dev.resync_phase(), ResyncPhase::Idle, "no sync ever started");
    }
}

#[test]
fn test_partial_resync_covers_disconnected_writes() {
    let mut a = make_device(0, DiskState::UpToDate);
    let mut b = make_device(1, DiskState::UpToDate);
    // both replicas last parted on generation 0x20
    seed_generation(&mut a, 0x20, 0);
    seed_generation(&mut b, 0x20, 0);

    // promotion without a reachable peer opens a new generation, with
    // 0x20 demoted into the bitmap slot
    a.promote(0).unwrap();
    a.submit_write(0, &[0xaa; 4096]).unwrap();
    a.submit_write(8, &[0xbb; 4096]).unwrap();
    a.demote().unwrap();
    assert_eq!(a.dirty_blocks(), 2);

    connect(&mut a, &mut b);
    assert_eq!(
        a.decide_resync().unwrap(),
        SyncDecision::Partial(SyncDirection::Source),
        "our bitmap slot still names the peer's generation"
    );
    pump(&mut a, &mut b); // ships the dirty map and the sync uuid
    assert_eq!(
        b.decide_resync().unwrap(),
        SyncDecision::Partial(SyncDirection::Target)
    );
    pump(&mut a, &mut b);
    assert_eq!(a.state().connection, ConnectionState::SyncSource);
    assert_eq!(b.state().connection, ConnectionState::SyncTarget);
    assert_eq!(b.dirty_blocks(), 2, "received map merged on the target");

    drive_resync(&mut a, &mut b);

    for dev in [&a, &b] {
        assert_eq!(dev.resync_phase(), ResyncPhase::Done);
        assert_eq!(dev.dirty_blocks(), 0);
        assert_eq!(dev.state().connection, ConnectionState::Connected);
        assert_eq!(dev.state().disk, DiskState::UpToDate);
        assert_eq!(dev.state().peer_disk, DiskState::UpToDate);
    }

    // the divergent writes arrived
    let mut buf = [0u8; 4096];
    b.read(0, &mut buf).unwrap();
    assert_eq!(buf, [0xaa; 4096]);
    b.read(8, &mut buf).unwrap();
    assert_eq!(buf, [0xbb; 4096]);

    // the chains rotated and aligned: a fresh comparison finds nothing
    assert_eq!(a.decide_resync().unwrap(), SyncDecision::NoSync);
    assert_eq!(b.decide_resync().unwrap(), SyncDecision::NoSync);
}

#[test]
fn test_crashed_primary_resyncs_despite_equal_generations() {
    let mut a = make_device(0, DiskState::UpToDate);
    let mut b = make_device(1, DiskState::UpToDate);
    seed_generation(&mut b, 0x40, 0);

    // a previous incarnation of A died while Primary; its metadata
    // still carries the crash marker over the shared generation
    {
        let mut template = make_device(0, DiskState::UpToDate);
        seed_generation(&mut template, 0x40, 0);
        template.promote(0).unwrap();
        // overwrite the chain the promotion rotated; the crash marker
        // is what this test is about
        let mut sb = *template.superblock();
        sb.uuids.current = 0x40;
        sb.uuids.bitmap = 0;
        sb.uuids.history = [0, 0];
        a.load_metadata(&sb.encode()).unwrap();
    }

    connect(&mut a, &mut b);
    assert_eq!(
        a.decide_resync().unwrap(),
        SyncDecision::Partial(SyncDirection::Source),
        "a crashed primary may hold writes the peer never saw"
    );
    // the map is empty, so the sync retires immediately and A announces
    // a clean chain; by the time B compares, there is nothing to do
    pump(&mut a, &mut b);
    assert_eq!(b.decide_resync().unwrap(), SyncDecision::NoSync);
    pump(&mut a, &mut b);

    assert_eq!(a.state().connection, ConnectionState::Connected);
    assert_eq!(b.state().connection, ConnectionState::Connected);
    assert_eq!(a.decide_resync().unwrap(), SyncDecision::NoSync, "marker cleared");
}

#[test]
fn test_full_sync_rebuilds_an_inconsistent_replica() {
    let mut a = make_device(0, DiskState::UpToDate);
    let mut b = make_device(1, DiskState::Inconsistent);
    // unrelated chains: B was initialized from scratch
    seed_generation(&mut a, 0x100, 0);
    seed_generation(&mut b, 0x900, 0);

    a.promote(0).unwrap();
    a.submit_write(0, &[0x11; 4096]).unwrap();
    a.submit_write(4088, &[0x22; 4096]).unwrap();
    a.demote().unwrap();

    connect(&mut a, &mut b);
    assert_eq!(
        a.decide_resync().unwrap(),
        SyncDecision::Full(SyncDirection::Source),
        "only the inconsistent side may be overwritten"
    );
    assert_eq!(a.dirty_blocks(), 512, "full sync dirties the whole map");
    assert!(
        a.superblock().has_flag(FLAG_FULL_SYNC_PENDING),
        "a crash from here must redo the whole sync"
    );
    pump(&mut a, &mut b);
    assert_eq!(
        b.decide_resync().unwrap(),
        SyncDecision::Full(SyncDirection::Target)
    );
    assert!(b.superblock().has_flag(FLAG_FULL_SYNC_PENDING));
    pump(&mut a, &mut b);

    drive_resync(&mut a, &mut b);

    assert_eq!(a.dirty_blocks(), 0);
    assert_eq!(b.dirty_blocks(), 0);
    assert!(!a.superblock().has_flag(FLAG_FULL_SYNC_PENDING), "marker retired");
    assert!(!b.superblock().has_flag(FLAG_FULL_SYNC_PENDING));
    assert_eq!(b.state().disk, DiskState::UpToDate, "target ends up to date");

    let mut buf = [0u8; 4096];
    b.read(0, &mut buf).unwrap();
    assert_eq!(buf, [0x11; 4096]);
    b.read(4088, &mut buf).unwrap();
    assert_eq!(buf, [0x22; 4096]);

    assert_eq!(a.decide_resync().unwrap(), SyncDecision::NoSync);
    assert_eq!(b.decide_resync().unwrap(), SyncDecision::NoSync);
}

#[test]
fn test_unrelated_clean_generations_refuse_automatic_sync() {
    let mut a = make_device(0, DiskState::UpToDate);
    let mut b = make_device(1, DiskState::UpToDate);
    seed_generation(&mut a, 0x100, 0);
    seed_generation(&mut b, 0x900, 0);

    connect(&mut a, &mut b);
    assert!(a.decide_resync().is_err(), "an operator must pick a survivor");
    assert!(b.decide_resync().is_err());

    // refusing is not a protocol violation; the link stays up
    assert_eq!(a.state().connection, ConnectionState::Connected);
    assert_eq!(b.state().connection, ConnectionState::Connected);
    assert_eq!(a.resync_phase(), ResyncPhase::Idle);
}

#[test]
fn test_aborted_resync_keeps_remaining_dirt_for_the_next_attempt() {
    let mut a = make_device(0, DiskState::UpToDate);
    let mut b = make_device(1, DiskState::UpToDate);
    seed_generation(&mut a, 0x20, 0);
    seed_generation(&mut b, 0x20, 0);

    a.promote(0).unwrap();
    // two separated runs of four blocks; one chunk moves one run
    for block in [0u64, 1, 2, 3, 100, 101, 102, 103] {
        a.submit_write(block * 8, &[0x33; 4096]).unwrap();
    }
    a.demote().unwrap();
    assert_eq!(a.dirty_blocks(), 8);

    connect(&mut a, &mut b);
    a.decide_resync().unwrap();
    pump(&mut a, &mut b);
    b.decide_resync().unwrap();
    pump(&mut a, &mut b);

    assert!(a.resync_step().unwrap());
    pump(&mut a, &mut b);
    assert_eq!(a.dirty_blocks(), 4, "first run synced");

    a.handle_disconnect(ConnectionState::NetworkFailure);
    b.handle_disconnect(ConnectionState::NetworkFailure);
    assert_eq!(a.resync_phase(), ResyncPhase::Aborted);
    assert_eq!(
        a.dirty_blocks(),
        4,
        "unsynced blocks stay dirty across the disconnect"
    );
    assert_eq!(a.state().peer_role, Role::Unknown);
}
