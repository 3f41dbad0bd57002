//! Shared-memory transport: zero-copy payloads, region acknowledgement
//! accounting, session naming and cleanup.

use pipemq::transport::shmem::{cleanup_session, make_shm_id, ShmemFactory};
use pipemq::{
    FactoryConfig, Message, RegionBlock, RegionCallback, RegionConfig, Socket, SocketType,
    TransportFactory, UnmanagedRegion,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(session: &str) -> FactoryConfig {
    FactoryConfig {
        session: session.to_owned(),
        shm_segment_size: 8 << 20,
        ..FactoryConfig::default()
    }
}

fn unique_session(tag: &str) -> String {
    format!("{tag}-{}", uuid::Uuid::new_v4().simple())
}

struct SessionGuard(String);
impl Drop for SessionGuard {
    fn drop(&mut self) {
        cleanup_session(&self.0);
    }
}

#[test]
fn shm_id_is_deterministic_per_session() {
    assert_eq!(make_shm_id("s1"), make_shm_id("s1"));
    assert_ne!(make_shm_id("s1"), make_shm_id("s2"));
}

#[test]
fn push_pull_of_a_million_byte_region_message() {
    let session = unique_session("shmem-s2");
    let _guard = SessionGuard(session.clone());
    cleanup_session(&session);

    let pusher = ShmemFactory::new("pusher", &config(&session)).unwrap();
    let puller = ShmemFactory::new("puller", &config(&session)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let address = format!("ipc://{}", dir.path().join("data").display());

    let push = pusher.new_socket(SocketType::Push, "push").unwrap();
    let pull = puller.new_socket(SocketType::Pull, "pull").unwrap();
    push.bind(&address).unwrap();
    pull.connect(&address).unwrap();

    let acked = Arc::new(Mutex::new(Vec::<RegionBlock>::new()));
    let sink = acked.clone();
    let mut region_config = RegionConfig::new(1 << 20);
    region_config.zero = true;
    let region = pusher
        .new_region(
            region_config,
            RegionCallback::Bulk(Box::new(move |blocks| {
                sink.lock().extend_from_slice(blocks);
            })),
        )
        .unwrap();

    let mut msg = region.new_message(0, 1_000_000).unwrap();
    assert_eq!(msg.len(), 1_000_000);
    assert_eq!(push.send(&mut msg, 5000).unwrap(), 1_000_000);
    assert!(msg.is_empty(), "region message moved out on send");

    let mut incoming = puller.new_message();
    assert_eq!(pull.receive(&mut incoming, 5000).unwrap(), 1_000_000);
    assert_eq!(incoming.len(), 1_000_000);
    // The region was zeroed on creation.
    assert!(incoming.data().iter().all(|b| *b == 0));
    drop(incoming);

    // The release travels back to the creator asynchronously.
    let deadline = Instant::now() + Duration::from_secs(2);
    while region.stats().acked_bytes < 1_000_000 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let stats = region.stats();
    assert_eq!(stats.sent_bytes, 1_000_000);
    assert_eq!(stats.acked_bytes, 1_000_000);
    let blocks = acked.lock();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0], RegionBlock { offset: 0, size: 1_000_000 });

    assert!(pusher.session_event_count() >= 1, "region registered in the session");
}

#[test]
fn region_accounting_ignores_ranges_never_sent() {
    let session = unique_session("shmem-acct");
    let _guard = SessionGuard(session.clone());
    cleanup_session(&session);

    let pusher = ShmemFactory::new("pusher", &config(&session)).unwrap();
    let puller = ShmemFactory::new("puller", &config(&session)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let address = format!("ipc://{}", dir.path().join("acct").display());
    let push = pusher.new_socket(SocketType::Push, "push").unwrap();
    let pull = puller.new_socket(SocketType::Pull, "pull").unwrap();
    push.bind(&address).unwrap();
    pull.connect(&address).unwrap();

    let region = pusher
        .new_region(RegionConfig::new(8192), RegionCallback::PerBlock(Box::new(|_| {})))
        .unwrap();

    // Carve three ranges; only two go out.
    let mut first = region.new_message(0, 1000).unwrap();
    let mut second = region.new_message(1024, 500).unwrap();
    let unsent = region.new_message(2048, 1000).unwrap();

    push.send(&mut first, 5000).unwrap();
    push.send(&mut second, 5000).unwrap();
    drop(unsent);

    for _ in 0..2 {
        let mut incoming = puller.new_message();
        pull.receive(&mut incoming, 5000).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while region.stats().acked_blocks < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let stats = region.stats();
    assert_eq!(stats.sent_blocks, 2);
    assert_eq!(stats.acked_blocks, 2);
    assert_eq!(stats.sent_bytes, 1500);
    assert_eq!(stats.acked_bytes, 1500, "the unsent kilobyte is not reported");
}

#[test]
fn managed_messages_move_by_reference_and_share_on_copy() {
    let session = unique_session("shmem-managed");
    let _guard = SessionGuard(session.clone());
    cleanup_session(&session);

    let sender = ShmemFactory::new("sender", &config(&session)).unwrap();
    let receiver = ShmemFactory::new("receiver", &config(&session)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let address = format!("ipc://{}", dir.path().join("managed").display());
    let push = sender.new_socket(SocketType::Push, "push").unwrap();
    let pull = receiver.new_socket(SocketType::Pull, "pull").unwrap();
    push.bind(&address).unwrap();
    pull.connect(&address).unwrap();

    let free_before = sender.segment_free_memory(0).unwrap();
    let mut msg = sender.new_message_with_size(100_000).unwrap();
    for (i, byte) in msg.data_mut().iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    assert_eq!(push.send(&mut msg, 5000).unwrap(), 100_000);

    let mut incoming = receiver.new_message();
    assert_eq!(pull.receive(&mut incoming, 5000).unwrap(), 100_000);
    assert_eq!(incoming.data()[4999], (4999 % 251) as u8);

    // A same-transport copy shares the buffer by reference count: the
    // original handle can go away first.
    {
        let mut copy = receiver.new_message();
        copy.copy_from(incoming.as_ref()).unwrap();
        drop(incoming);
        assert_eq!(copy.len(), 100_000);
        assert_eq!(copy.data()[77_777], (77_777 % 251) as u8);
    }
    // Last reference gone: the block returns to the segment allocator.
    assert_eq!(sender.segment_free_memory(0).unwrap(), free_before);
}

#[test]
fn resize_in_place_applies_to_shared_memory_messages() {
    let session = unique_session("shmem-resize");
    let _guard = SessionGuard(session.clone());
    cleanup_session(&session);

    let factory = ShmemFactory::new("resize", &config(&session)).unwrap();
    let mut msg = factory.new_message_with_size(1000).unwrap();
    assert!(msg.set_used_size(500));
    assert_eq!(msg.len(), 500);
    assert!(!msg.set_used_size(600), "growing is rejected");

    let mut copy = factory.new_message();
    copy.copy_from(msg.as_ref()).unwrap();
    assert_eq!(copy.len(), 500);
}

#[test]
fn cleanup_removes_session_artefacts() {
    let session = unique_session("shmem-cleanup");
    {
        let factory = ShmemFactory::new("cleanup", &config(&session)).unwrap();
        let _msg = factory.new_message_with_size(128).unwrap();
    }
    cleanup_session(&session);
    // After cleanup a fresh factory starts from an empty registry.
    let factory = ShmemFactory::new("cleanup-2", &config(&session)).unwrap();
    assert_eq!(factory.session_event_count(), 0);
    drop(factory);
    cleanup_session(&session);
}
