//! Multipart transfer: all parts arrive atomically and in order.

use pipemq::transport::create_transport_factory;
use pipemq::{FactoryConfig, Message, Parts, Socket, SocketType, Transport, TransportFactory};

#[test]
fn five_parts_arrive_in_order() {
    let factory = create_transport_factory(
        Transport::Zeromq,
        "multipart",
        &FactoryConfig::default(),
    )
    .unwrap();
    let push = factory.new_socket(SocketType::Push, "push").unwrap();
    let pull = factory.new_socket(SocketType::Pull, "pull").unwrap();
    push.bind("tcp://127.0.0.1:15811").unwrap();
    pull.connect("tcp://127.0.0.1:15811").unwrap();

    let mut parts = Parts::new();
    for label in ["1", "2", "3", "4", "5"] {
        let mut msg = factory.new_message_with_size(1).unwrap();
        msg.data_mut().copy_from_slice(label.as_bytes());
        parts.add_part(msg);
    }
    assert_eq!(push.send_parts(&mut parts, 5000).unwrap(), 5);

    let mut received = Parts::new();
    assert_eq!(pull.receive_parts(&mut received, 5000).unwrap(), 5);
    assert_eq!(received.len(), 5);
    let concatenated: String = received
        .iter()
        .map(|p| String::from_utf8_lossy(p.data()).to_string())
        .collect();
    assert_eq!(concatenated, "12345");
}

#[test]
fn empty_message_transfer_is_legal() {
    let factory = create_transport_factory(
        Transport::Zeromq,
        "multipart-empty",
        &FactoryConfig::default(),
    )
    .unwrap();
    let push = factory.new_socket(SocketType::Push, "push").unwrap();
    let pull = factory.new_socket(SocketType::Pull, "pull").unwrap();
    push.bind("tcp://127.0.0.1:15812").unwrap();
    pull.connect("tcp://127.0.0.1:15812").unwrap();

    let mut msg = factory.new_message();
    assert_eq!(push.send(&mut msg, 5000).unwrap(), 0);
    let mut incoming = factory.new_message();
    assert_eq!(pull.receive(&mut incoming, 5000).unwrap(), 0);
    assert!(incoming.is_empty());
}

#[test]
fn resized_message_transfers_the_used_size() {
    let factory = create_transport_factory(
        Transport::Zeromq,
        "multipart-resize",
        &FactoryConfig::default(),
    )
    .unwrap();
    let push = factory.new_socket(SocketType::Push, "push").unwrap();
    let pull = factory.new_socket(SocketType::Pull, "pull").unwrap();
    push.bind("tcp://127.0.0.1:15813").unwrap();
    pull.connect("tcp://127.0.0.1:15813").unwrap();

    let mut msg = factory.new_message_with_size(1000).unwrap();
    assert!(msg.set_used_size(500));
    assert_eq!(msg.len(), 500);
    assert!(msg.set_used_size(250));

    // A copy constructed from the resized message inherits the used size.
    let mut copy = factory.new_message();
    copy.copy_from(msg.as_ref()).unwrap();
    assert_eq!(copy.len(), 250);

    assert_eq!(push.send(&mut copy, 5000).unwrap(), 250);
    let mut incoming = factory.new_message();
    assert_eq!(pull.receive(&mut incoming, 5000).unwrap(), 250);
    assert_eq!(incoming.len(), 250);
}

#[test]
fn cross_transport_send_is_rejected() {
    let session = format!("xtrans-{}", uuid::Uuid::new_v4().simple());
    pipemq::transport::shmem::cleanup_session(&session);
    let tcp = create_transport_factory(
        Transport::Zeromq,
        "xtrans-tcp",
        &FactoryConfig::default(),
    )
    .unwrap();
    let shm = create_transport_factory(
        Transport::Shmem,
        "xtrans-shm",
        &FactoryConfig {
            session: session.clone(),
            shm_segment_size: 1 << 20,
            ..FactoryConfig::default()
        },
    )
    .unwrap();

    let push = tcp.new_socket(SocketType::Push, "push").unwrap();
    push.bind("tcp://127.0.0.1:15814").unwrap();

    let mut foreign = shm.new_message_with_size(16).unwrap();
    assert_eq!(
        push.send(&mut foreign, 100),
        Err(pipemq::TransferError::Error)
    );
    assert_eq!(foreign.len(), 16, "message untouched by the failed send");

    drop(foreign);
    drop(shm);
    pipemq::transport::shmem::cleanup_session(&session);
}
