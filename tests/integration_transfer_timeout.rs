//! Timeout and interruption semantics of blocking transfers.

use pipemq::transport::create_transport_factory;
use pipemq::{
    FactoryConfig, Message, Poller, Socket, SocketType, TransferError, Transport,
    TransportFactory,
};
use std::time::{Duration, Instant};

#[test]
fn receive_with_no_peer_times_out_within_bounds() {
    let factory = create_transport_factory(
        Transport::Zeromq,
        "timeouts",
        &FactoryConfig::default(),
    )
    .unwrap();
    let pull = factory.new_socket(SocketType::Pull, "pull").unwrap();
    pull.bind("tcp://127.0.0.1:15821").unwrap();

    for timeout_ms in [100u64, 300] {
        let mut msg = factory.new_message();
        let start = Instant::now();
        let result = pull.receive(&mut msg, timeout_ms as i64);
        let elapsed = start.elapsed();
        assert_eq!(result, Err(TransferError::Timeout));
        assert!(
            elapsed >= Duration::from_millis(timeout_ms),
            "returned after {elapsed:?}, before the {timeout_ms} ms deadline"
        );
        assert!(
            elapsed < Duration::from_millis(timeout_ms + 200),
            "returned after {elapsed:?}, too long past the {timeout_ms} ms deadline"
        );
    }
}

#[test]
fn send_with_no_peer_times_out_and_keeps_the_message() {
    let factory = create_transport_factory(
        Transport::Zeromq,
        "timeouts-send",
        &FactoryConfig::default(),
    )
    .unwrap();
    let push = factory.new_socket(SocketType::Push, "push").unwrap();
    push.connect("tcp://127.0.0.1:15822").unwrap(); // nobody listens

    let mut msg = factory.new_message_with_size(64).unwrap();
    assert_eq!(push.send(&mut msg, 150), Err(TransferError::Timeout));
    assert_eq!(msg.len(), 64, "handle stays valid and owned by the caller");
}

#[test]
fn interrupt_aborts_blocking_waits() {
    let factory = create_transport_factory(
        Transport::Zeromq,
        "timeouts-interrupt",
        &FactoryConfig::default(),
    )
    .unwrap();
    let pull = factory.new_socket(SocketType::Pull, "pull").unwrap();
    pull.bind("tcp://127.0.0.1:15823").unwrap();

    let f = factory.clone();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        f.interrupt();
    });

    let mut msg = factory.new_message();
    let start = Instant::now();
    // Infinite timeout, unblocked only by the interrupt.
    assert_eq!(pull.receive(&mut msg, -1), Err(TransferError::Interrupted));
    assert!(start.elapsed() < Duration::from_secs(2));
    interrupter.join().unwrap();

    // Interrupted transports keep failing until resumed.
    assert_eq!(pull.receive(&mut msg, 10), Err(TransferError::Interrupted));
    factory.resume();
    assert_eq!(pull.receive(&mut msg, 10), Err(TransferError::Timeout));
}

#[test]
fn poll_timeout_is_bounded() {
    let factory = create_transport_factory(
        Transport::Zeromq,
        "timeouts-poll",
        &FactoryConfig::default(),
    )
    .unwrap();
    let pull = factory.new_socket(SocketType::Pull, "pull").unwrap();
    pull.bind("tcp://127.0.0.1:15825").unwrap();

    let poller = factory
        .new_poller(&[("data".to_owned(), vec![pull.clone()])])
        .unwrap();
    let start = Instant::now();
    poller.poll(200).unwrap();
    let elapsed = start.elapsed();
    assert!(!poller.check_input(0));
    assert!(!poller.check_input_of("data", 0));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(400));

    // A connecting peer makes the socket writable.
    let push = factory.new_socket(SocketType::Push, "push").unwrap();
    push.connect("tcp://127.0.0.1:15825").unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        poller.poll(50).unwrap();
        if poller.check_output_of("data", 0) {
            break;
        }
        assert!(Instant::now() < deadline, "peer never became visible");
    }
}

#[test]
fn zero_timeout_tries_once() {
    let factory = create_transport_factory(
        Transport::Zeromq,
        "timeouts-zero",
        &FactoryConfig::default(),
    )
    .unwrap();
    let pull = factory.new_socket(SocketType::Pull, "pull").unwrap();
    pull.bind("tcp://127.0.0.1:15824").unwrap();

    let mut msg = factory.new_message();
    let start = Instant::now();
    assert_eq!(pull.receive(&mut msg, 0), Err(TransferError::Timeout));
    assert!(start.elapsed() < Duration::from_millis(100));
}
