//! End-to-end scenarios through the client facade.

use ashfile::prelude::*;
use std::sync::Arc;

fn service() -> Arc<Service> {
    Service::start(ServiceConfig::testing())
}

// ============================================================================
// Regions and pinning
// ============================================================================

#[test]
fn test_basic_round_trip() {
    let service = service();
    let client = service.connect().unwrap();

    let fd = client.create("r1", 4096).unwrap();
    client.write(fd, 0, b"hello").unwrap();
    assert_eq!(client.pin(fd, 0, 0).unwrap(), PinOutcome::Pinned);

    let mut buf = [0xaa; 6];
    client.read(fd, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello\0");
}

#[test]
fn test_purge_detection() {
    let service = service();
    let client = service.connect().unwrap();

    let fd = client.create("cache", 4096).unwrap();
    client.pin(fd, 0, 0).unwrap();
    client.write(fd, 0, b"data").unwrap();
    client.unpin(fd, 0, 0).unwrap();

    let id = client.region_id(fd).unwrap();
    assert_eq!(service.force_purge(id).unwrap(), 1);

    assert_eq!(client.pin(fd, 0, 0).unwrap(), PinOutcome::WasPurged);
    let mut buf = [0u8; 4];
    assert!(matches!(client.read(fd, 0, &mut buf), Err(Error::StaleData(_))));

    // Regenerate, then the data reads back.
    client.write(fd, 0, b"data").unwrap();
    client.read(fd, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"data");
}

#[test]
fn test_was_purged_reported_once() {
    let service = service();
    let client = service.connect().unwrap();
    let fd = client.create("once", 2 * 4096).unwrap();

    assert!(!client.unpin(fd, 0, 0).unwrap());
    assert_eq!(service.purge_all(), 2);

    // Unpinning purged memory reports it without consuming the signal.
    assert!(client.unpin(fd, 0, 0).unwrap());
    assert_eq!(client.pin(fd, 0, 0).unwrap(), PinOutcome::WasPurged);
    client.unpin(fd, 0, 0).unwrap();
    assert_eq!(client.pin(fd, 0, 0).unwrap(), PinOutcome::Pinned);
}

#[test]
fn test_pin_unpin_restores_counts() {
    let service = service();
    let client = service.connect().unwrap();
    let fd = client.create("counts", 4 * 4096).unwrap();
    let region = service.store().lookup(client.region_id(fd).unwrap()).unwrap();

    client.pin(fd, 0, 2 * 4096).unwrap();
    let before: Vec<u32> = (0..4).map(|p| region.pin_count(p * 4096)).collect();

    client.pin(fd, 4096, 2 * 4096).unwrap();
    client.unpin(fd, 4096, 2 * 4096).unwrap();

    let after: Vec<u32> = (0..4).map(|p| region.pin_count(p * 4096)).collect();
    assert_eq!(before, after);
    assert_eq!(after, vec![1, 1, 0, 0]);
}

#[test]
fn test_partially_pinned_region_survives_reclaim() {
    let service = service();
    let client = service.connect().unwrap();
    let fd = client.create("partial", 2 * 4096).unwrap();
    client.write(fd, 0, b"keep").unwrap();

    client.unpin(fd, 0, 0).unwrap();
    client.pin(fd, 4096, 4096).unwrap();
    assert_eq!(service.reclaim(usize::MAX), 0);
    assert_eq!(client.pin_status(fd, 0, 4096).unwrap(), PinStatus::Unpinned);
    assert_eq!(client.pin_status(fd, 0, 0).unwrap(), PinStatus::Pinned);

    let mut buf = [0u8; 4];
    client.read(fd, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"keep");
}

#[test]
fn test_reclaim_prefers_least_recently_unpinned() {
    let service = service();
    let client = service.connect().unwrap();
    let first = client.create("first", 4096).unwrap();
    let second = client.create("second", 4096).unwrap();

    client.unpin(first, 0, 0).unwrap();
    client.unpin(second, 0, 0).unwrap();
    assert_eq!(service.reclaim(1), 1);

    assert_eq!(client.pin(first, 0, 0).unwrap(), PinOutcome::WasPurged);
    assert_eq!(client.pin(second, 0, 0).unwrap(), PinOutcome::Pinned);
}

#[test]
fn test_misaligned_pin_rejected() {
    let service = service();
    let client = service.connect().unwrap();
    let fd = client.create("aligned", 2 * 4096).unwrap();

    assert!(matches!(client.pin(fd, 100, 4096), Err(Error::InvalidArgument(_))));
    assert!(matches!(client.pin(fd, 0, 3 * 4096), Err(Error::InvalidArgument(_))));
    assert_eq!(client.pin_status(fd, 0, 0).unwrap(), PinStatus::Unpinned);
}

#[test]
fn test_ids_never_reused() {
    let service = service();
    let client = service.connect().unwrap();

    let fd = client.create("old", 4096).unwrap();
    let old = client.region_id(fd).unwrap();
    client.close(fd).unwrap();

    let fd = client.create("new", 4096).unwrap();
    let new = client.region_id(fd).unwrap();
    assert_ne!(old, new);
    assert!(matches!(service.store().lookup(old), Err(Error::NotFound(_))));
}

#[test]
fn test_region_attributes() {
    let service = service();
    let client = service.connect().unwrap();
    let fd = client.create("", 100).unwrap();

    client.set_name(fd, "renamed").unwrap();
    client.set_size(fd, 3 * 4096).unwrap();
    assert_eq!(client.get_name(fd).unwrap(), "renamed");
    assert_eq!(client.get_size(fd).unwrap(), 3 * 4096);

    let mapping = client.map(fd).unwrap();
    assert_eq!(mapping.len(), 3 * 4096);
    assert!(matches!(client.set_name(fd, "late"), Err(Error::InvalidArgument(_))));
    assert!(matches!(client.set_size(fd, 4096), Err(Error::InvalidArgument(_))));
}

// ============================================================================
// Handoff
// ============================================================================

#[test]
fn test_cross_process_handoff() {
    let service = service();
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();

    let fd = a.create("shared", 4096).unwrap();
    a.write(fd, 0, b"xyz").unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();

    let theirs = b.claim(HandoffKey::DEFAULT).unwrap();
    let mapping = b.map(theirs).unwrap();
    assert_eq!(&mapping.as_slice()[..3], b"xyz");

    let mut buf = [0u8; 3];
    b.read(theirs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"xyz");
}

#[test]
fn test_claim_without_publish() {
    let service = service();
    let client = service.connect().unwrap();
    assert!(matches!(
        client.claim(HandoffKey::DEFAULT),
        Err(Error::NoResourcePublished)
    ));
    assert!(client.process().table().is_empty());
}

#[test]
fn test_every_claim_is_independent() {
    let service = service();
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();
    let fd = a.create("many", 4096).unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();

    let fds: Vec<Fd> = (0..5).map(|_| b.claim(HandoffKey::DEFAULT).unwrap()).collect();
    let id = a.region_id(fd).unwrap();
    for &theirs in &fds {
        assert_eq!(b.region_id(theirs).unwrap(), id);
    }

    // Closing every claimed handle leaves the producer's intact.
    for theirs in fds {
        b.close(theirs).unwrap();
    }
    a.write(fd, 0, b"still mine").unwrap();
}

#[test]
fn test_claimed_handle_outlives_producer() {
    let service = service();
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();

    let fd = a.create("orphan", 4096).unwrap();
    a.write(fd, 0, b"left").unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();
    let theirs = b.claim(HandoffKey::DEFAULT).unwrap();

    a.close(fd).unwrap();
    assert_eq!(a.process().exit(), 0);

    let mut buf = [0u8; 4];
    b.read(theirs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"left");
}

#[test]
fn test_claim_after_producer_closed() {
    let service = service();
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();

    let fd = a.create("gone", 4096).unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();
    a.close(fd).unwrap();

    assert!(matches!(b.claim(HandoffKey::DEFAULT), Err(Error::NotFound(_))));
    assert!(b.process().table().is_empty());
}

#[test]
fn test_handle_table_exhaustion() {
    let service = service();
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();

    let fd = a.create("wanted", 4096).unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();

    b.process().set_open_limit(1);
    b.create("filler", 4096).unwrap();
    let regions = service.store().len();

    assert!(matches!(
        b.claim(HandoffKey::DEFAULT),
        Err(Error::TooManyOpenHandles { limit: 1 })
    ));
    assert_eq!(service.store().len(), regions);
    assert_eq!(b.process().table().len(), 1);

    // Raising the ceiling lets the same claim succeed.
    b.process().set_open_limit(2);
    b.claim(HandoffKey::DEFAULT).unwrap();
}

#[test]
fn test_claim_grows_table_storage() {
    let service = Service::start(ServiceConfig::testing().with_initial_table_capacity(1));
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();
    let fd = a.create("grow", 4096).unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();

    for _ in 0..6 {
        b.claim(HandoffKey::DEFAULT).unwrap();
    }
    assert_eq!(b.process().table().len(), 6);
    assert!(b.process().table().capacity() >= 6);
}

#[test]
fn test_claim_installs_only_into_claimer() {
    let service = service();
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();
    let c = service.connect().unwrap();

    let fd = a.create("private", 4096).unwrap();
    let published = a.region_id(fd).unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();
    let c_first = c.create("c-own", 4096).unwrap();
    c.create("c-own-2", 4096).unwrap();
    let a_before = a.process().table().len();
    let c_before = c.process().table().len();

    let claimed: Vec<Fd> = (0..2).map(|_| b.claim(HandoffKey::DEFAULT).unwrap()).collect();

    assert_eq!(a.process().table().len(), a_before);
    assert_eq!(c.process().table().len(), c_before);
    assert_eq!(b.process().table().len(), claimed.len());
    for fd in &claimed {
        assert_eq!(b.region_id(*fd).unwrap(), published);
    }

    // The same handle number names a different region in each table.
    assert_eq!(claimed[0], c_first);
    assert_ne!(c.region_id(c_first).unwrap(), published);
    assert!(matches!(a.get_size(claimed[1]), Err(Error::BadHandle(_))));
}

#[test]
fn test_readiness_convention() {
    let service = service();
    let producer = service.connect().unwrap();
    let consumer = service.connect().unwrap();

    // Producer writes, pins, then publishes.
    let fd = producer.create("frame", 4096).unwrap();
    producer.write(fd, 0, b"ready").unwrap();
    producer.pin(fd, 0, 0).unwrap();
    producer.publish(fd, HandoffKey::new(7)).unwrap();

    // Memory pressure cannot touch the pinned region.
    assert_eq!(service.reclaim(usize::MAX), 0);

    // Consumer claims, pins, and only then trusts the contents.
    let theirs = consumer.claim(HandoffKey::new(7)).unwrap();
    assert_eq!(consumer.pin(theirs, 0, 0).unwrap(), PinOutcome::Pinned);
    let mut buf = [0u8; 5];
    consumer.read(theirs, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"ready");
}

#[test]
fn test_exec_closes_claimed_handles() {
    let service = service();
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();

    let fd = a.create("cloexec", 4096).unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();
    let claimed = b.claim(HandoffKey::DEFAULT).unwrap();
    let kept = b.claim(HandoffKey::DEFAULT).unwrap();
    b.set_cloexec(kept, false).unwrap();

    assert_eq!(b.process().exec(), 1);
    assert!(matches!(b.get_size(claimed), Err(Error::BadHandle(_))));
    assert_eq!(b.get_size(kept).unwrap(), 4096);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_shutdown_returns_memory() {
    let service = service();
    let a = service.connect().unwrap();
    let b = service.connect().unwrap();
    let fd = a.create("one", 4096).unwrap();
    a.publish(fd, HandoffKey::DEFAULT).unwrap();
    b.claim(HandoffKey::DEFAULT).unwrap();
    b.create("two", 8192).unwrap();
    assert_eq!(service.store().total_bytes(), 3 * 4096);

    service.shutdown();
    assert_eq!(service.store().total_bytes(), 0);
    assert!(a.process().table().is_empty());
    assert!(b.process().table().is_empty());
    assert!(matches!(b.claim(HandoffKey::DEFAULT), Err(Error::ServiceStopped)));
}

#[test]
fn test_memory_quota() {
    let service = Service::start(ServiceConfig::testing().with_memory_quota(2 * 4096));
    let client = service.connect().unwrap();
    let fd = client.create("a", 4096).unwrap();
    client.create("b", 4096).unwrap();

    assert!(matches!(client.create("c", 1), Err(Error::OutOfMemory(_))));
    client.close(fd).unwrap();
    client.create("c", 1).unwrap();
}
