#[allow(dead_code)]
mod common;

use std::net;
use std::time;

use piu::packet::{Packet, PacketType, HELLO_ID};

fn raw_socket() -> net::UdpSocket {
    let socket = net::UdpSocket::bind(common::loopback()).expect("failed to bind raw socket");
    socket
        .set_read_timeout(Some(time::Duration::from_secs(2)))
        .unwrap();
    socket
}

fn raw_recv(socket: &net::UdpSocket) -> Packet {
    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf).expect("no datagram received");
    Packet::decode(&buf[..len]).expect("malformed datagram")
}

fn wait_for_pending(server: &piu::Server, count: usize) {
    let deadline = time::Instant::now() + common::RECV_TIMEOUT;

    while server.pending_count() < count {
        assert!(time::Instant::now() < deadline, "peer never queued");
        std::thread::sleep(time::Duration::from_millis(5));
    }
}

#[test]
fn connect_and_accept() {
    let event_loop = piu::EventLoop::start().expect("failed to start event loop");
    let server = event_loop.bind(common::loopback()).expect("failed to bind server");

    let (client, accepted) = common::connect_pair(&event_loop, &server, server.local_addr());

    assert_eq!(client.peer_addr(), server.local_addr());
    assert_eq!(accepted.peer_port(), client.local_addr().port());
    assert_eq!(accepted.peer_ip(), net::IpAddr::V4(net::Ipv4Addr::LOCALHOST));
    assert_eq!(accepted.local_addr(), server.local_addr());

    assert_eq!(server.pending_count(), 0);
    assert_eq!(server.session_count(), 1);
    assert_eq!(event_loop.endpoint_count(), 2);
}

#[test]
fn hello_is_acknowledged_on_accept() {
    let event_loop = piu::EventLoop::start().expect("failed to start event loop");
    let server = event_loop.bind(common::loopback()).expect("failed to bind server");

    let raw = raw_socket();
    raw.send_to(Packet::hello().as_bytes(), server.local_addr()).unwrap();

    wait_for_pending(&server, 1);

    // Repeated HELLOs from a queued peer do not queue it twice
    raw.send_to(Packet::hello().as_bytes(), server.local_addr()).unwrap();
    std::thread::sleep(time::Duration::from_millis(50));
    assert_eq!(server.pending_count(), 1);

    let session = server.try_accept().unwrap().expect("peer was not pending");
    assert_eq!(session.peer_addr(), raw.local_addr().unwrap());

    let ack = raw_recv(&raw);
    assert_eq!(ack.packet_type(), PacketType::Ack);
    assert_eq!(ack.id(), HELLO_ID);

    // A HELLO from an accepted peer means it missed the acknowledgement
    raw.send_to(Packet::hello().as_bytes(), server.local_addr()).unwrap();

    let ack = raw_recv(&raw);
    assert_eq!(ack.packet_type(), PacketType::Ack);
    assert_eq!(ack.id(), HELLO_ID);

    assert_eq!(server.pending_count(), 0);
    assert_eq!(server.session_count(), 1);
}

#[test]
fn pending_peers_are_accepted_in_order() {
    let event_loop = piu::EventLoop::start().expect("failed to start event loop");
    let server = event_loop.bind(common::loopback()).expect("failed to bind server");

    let first = raw_socket();
    let second = raw_socket();

    first.send_to(Packet::hello().as_bytes(), server.local_addr()).unwrap();
    wait_for_pending(&server, 1);
    second.send_to(Packet::hello().as_bytes(), server.local_addr()).unwrap();
    wait_for_pending(&server, 2);

    let a = server.accept().unwrap();
    let b = server.accept().unwrap();

    assert_eq!(a.peer_addr(), first.local_addr().unwrap());
    assert_eq!(b.peer_addr(), second.local_addr().unwrap());
}

#[test]
fn accept_timeout_expires() {
    let event_loop = piu::EventLoop::start().expect("failed to start event loop");
    let server = event_loop.bind(common::loopback()).expect("failed to bind server");

    let start = time::Instant::now();

    let result = server.accept_timeout(time::Duration::from_millis(100)).unwrap();

    assert!(result.is_none());
    assert!(start.elapsed() >= time::Duration::from_millis(100));
    assert!(server.try_accept().unwrap().is_none());
}

#[test]
fn connect_times_out() {
    let event_loop = piu::EventLoop::start().expect("failed to start event loop");

    // Bound but silent
    let silent = raw_socket();

    let start = time::Instant::now();

    let result = event_loop.connect(silent.local_addr().unwrap());

    let elapsed = start.elapsed();

    assert!(matches!(result, Err(piu::Error::ConnectionTimeout { attempts: 10 })));
    assert!(elapsed >= time::Duration::from_millis(2000));
    assert!(elapsed < time::Duration::from_millis(4000));

    // Ten HELLOs were sent
    let mut count = 0;
    silent
        .set_read_timeout(Some(time::Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 64];
    while let Ok((len, _)) = silent.recv_from(&mut buf) {
        let packet = Packet::decode(&buf[..len]).unwrap();
        assert_eq!(packet.packet_type(), PacketType::Hello);
        assert_eq!(packet.id(), HELLO_ID);
        count += 1;
    }
    assert_eq!(count, 10);

    // The failed attempt leaves nothing registered
    assert_eq!(event_loop.endpoint_count(), 0);
}

#[test]
fn connect_uses_configured_schedule() {
    let config = piu::Config {
        handshake_timeouts_ms: vec![20, 20, 20],
        ..Default::default()
    };
    let event_loop = piu::EventLoop::start_with_config(config).expect("failed to start event loop");

    let silent = raw_socket();

    let start = time::Instant::now();

    let result = event_loop.connect(silent.local_addr().unwrap());

    assert!(matches!(result, Err(piu::Error::ConnectionTimeout { attempts: 3 })));
    assert!(start.elapsed() < time::Duration::from_millis(1000));
}

#[test]
fn connect_ignores_unrelated_replies() {
    let config = piu::Config {
        handshake_timeouts_ms: vec![300],
        ..Default::default()
    };
    let event_loop = piu::EventLoop::start_with_config(config).expect("failed to start event loop");

    let fake_server = raw_socket();
    let fake_addr = fake_server.local_addr().unwrap();

    let responder = std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (_, client_addr) = fake_server.recv_from(&mut buf).unwrap();

        // A data ACK is not a handshake acknowledgement
        fake_server
            .send_to(Packet::ack(0).as_bytes(), client_addr)
            .unwrap();
    });

    let result = event_loop.connect(fake_addr);

    responder.join().unwrap();

    assert!(matches!(result, Err(piu::Error::ConnectionTimeout { attempts: 1 })));
}
