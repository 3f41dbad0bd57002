//! Request/reply round trip between two devices over the network
//! transport.

use pipemq::{
    Channel, Device, Message, Method, Parts, Socket, SocketType, State, Transition,
    TransportFactory,
};
use std::thread;
use std::time::Duration;

fn drive_to_running(device: &Device) {
    for transition in [
        Transition::InitDevice,
        Transition::CompleteInit,
        Transition::Bind,
        Transition::Connect,
        Transition::InitTask,
        Transition::Run,
    ] {
        assert!(device.change_state(transition), "{transition} rejected");
    }
    device.wait_for_state(State::Running).unwrap();
}

fn teardown(device: &Device, machine: thread::JoinHandle<Result<(), pipemq::DeviceError>>) {
    pipemq::runner::drive_to_exit(device);
    machine.join().unwrap().unwrap();
}

#[test]
fn request_reply_round_trip() {
    let server = Device::new("rep-server");
    server
        .add_channel(
            "data",
            Channel::new(SocketType::Rep, Method::Bind, "tcp://127.0.0.1:15801"),
        )
        .unwrap();
    server.on_data("data", |dev, parts: &mut Parts| {
        let request = String::from_utf8_lossy(parts.at(0).data()).to_string();
        let reply = format!("Thank you for the \"{request}\"!");
        let mut msg = dev.new_message_for("data", 0, reply.len())?;
        msg.data_mut().copy_from_slice(reply.as_bytes());
        dev.send(&mut msg, "data", 0, -1).ok();
        Ok(true)
    });

    let client = Device::new("req-client");
    client
        .add_channel(
            "data",
            Channel::new(SocketType::Req, Method::Connect, "tcp://127.0.0.1:15801"),
        )
        .unwrap();

    let s = server.clone();
    let server_machine = thread::spawn(move || s.run_state_machine());
    let c = client.clone();
    let client_machine = thread::spawn(move || c.run_state_machine());

    drive_to_running(&server);
    drive_to_running(&client);

    // Send "Hello" and collect the reply on the client.
    let mut request = client.new_message_with_size(5).unwrap();
    request.data_mut().copy_from_slice(b"Hello");
    let sent = client.send(&mut request, "data", 0, 5000).unwrap();
    assert_eq!(sent, 5);
    assert!(request.is_empty(), "payload moved out on successful send");

    let mut reply = client.new_message().unwrap();
    let received = client.receive(&mut reply, "data", 0, 5000).unwrap();
    assert_eq!(received, b"Thank you for the \"Hello\"!".len());
    assert_eq!(reply.data(), b"Thank you for the \"Hello\"!");

    teardown(&client, client_machine);
    teardown(&server, server_machine);
}

#[test]
fn socket_counters_track_transfers() {
    let factory = pipemq::transport::create_transport_factory(
        pipemq::Transport::Zeromq,
        "counters",
        &pipemq::FactoryConfig::default(),
    )
    .unwrap();
    let push = factory.new_socket(SocketType::Push, "push").unwrap();
    let pull = factory.new_socket(SocketType::Pull, "pull").unwrap();
    push.bind("tcp://127.0.0.1:15802").unwrap();
    pull.connect("tcp://127.0.0.1:15802").unwrap();

    let mut msg = factory.new_message_with_size(32).unwrap();
    assert_eq!(push.send(&mut msg, 5000).unwrap(), 32);

    let mut incoming = factory.new_message();
    assert_eq!(pull.receive(&mut incoming, 5000).unwrap(), 32);

    assert_eq!(push.bytes_tx(), 32);
    assert_eq!(push.messages_tx(), 1);
    assert_eq!(pull.bytes_rx(), 32);
    assert_eq!(pull.messages_rx(), 1);
    assert_eq!(push.connected_peers(), 1);

    // Peer withdrawal is eventually observed.
    drop(pull);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while push.connected_peers() > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(push.connected_peers(), 0);
}
