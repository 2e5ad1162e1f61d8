use std::collections::HashSet;
use std::net;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

use rand::{Rng, SeedableRng};

use piu::packet::{Packet, PacketType, HELLO_ID};

pub const RECV_TIMEOUT: time::Duration = time::Duration::from_secs(5);

pub fn loopback() -> net::SocketAddr {
    (net::Ipv4Addr::LOCALHOST, 0).into()
}

pub fn fast_config() -> piu::Config {
    piu::Config {
        retransmit_timeout_ms: Some(50),
        ..Default::default()
    }
}

/// Connects a client to `server` and accepts it on the other side. Returns (client, server-side).
pub fn connect_pair(
    event_loop: &piu::EventLoop,
    server: &piu::Server,
    connect_addr: net::SocketAddr,
) -> (piu::Session, piu::Session) {
    thread::scope(|scope| {
        let connecting = scope.spawn(|| event_loop.connect(connect_addr));

        let accepted = server
            .accept_timeout(RECV_TIMEOUT)
            .expect("accept failed")
            .expect("no session accepted");

        let client = connecting
            .join()
            .unwrap()
            .expect("failed to connect");

        (client, accepted)
    })
}

pub fn recv_string(session: &piu::Session) -> String {
    let mut buf = [0u8; 2048];

    let len = session
        .recv_timeout(&mut buf, RECV_TIMEOUT)
        .expect("recv failed")
        .expect("recv timed out");

    String::from_utf8(buf[..len].to_vec()).unwrap()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    ToServer,
    ToClient,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Forward,
    Drop,
    Duplicate,
    // Held back until the next datagram in the same direction has been forwarded
    Delay,
}

pub type Policy = Box<dyn FnMut(Direction, &Packet) -> Verdict + Send>;

/// Lets everything through.
pub fn passthrough() -> Policy {
    Box::new(|_, _| Verdict::Forward)
}

/// Drops the first copy of the DATA packet with the given id headed to the server.
pub fn drop_data_once(id: u32) -> Policy {
    let mut dropped = false;

    Box::new(move |direction, packet| {
        if !dropped
            && direction == Direction::ToServer
            && packet.packet_type() == PacketType::Data
            && packet.id() == id
        {
            dropped = true;
            Verdict::Drop
        } else {
            Verdict::Forward
        }
    })
}

/// Randomly drops, duplicates and reorders DATA and ACK packets in both directions. Handshake
/// packets pass untouched.
pub fn lossy(seed: u64, drop_rate: f64, duplicate_rate: f64, delay_rate: f64) -> Policy {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    Box::new(move |_, packet| {
        if packet.id() == HELLO_ID {
            return Verdict::Forward;
        }

        let x: f64 = rng.gen();

        if x < drop_rate {
            Verdict::Drop
        } else if x < drop_rate + duplicate_rate {
            Verdict::Duplicate
        } else if x < drop_rate + duplicate_rate + delay_rate {
            Verdict::Delay
        } else {
            Verdict::Forward
        }
    })
}

/// A UDP relay placed between one client and a server, applying a policy to every datagram.
pub struct Relay {
    addr: net::SocketAddr,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
    thread: Option<thread::JoinHandle<()>>,
}

struct Held {
    bytes: Vec<u8>,
    addr: net::SocketAddr,
}

impl Relay {
    pub fn spawn(server_addr: net::SocketAddr, mut policy: Policy) -> Self {
        let socket = net::UdpSocket::bind(loopback()).expect("failed to bind relay socket");
        socket
            .set_read_timeout(Some(time::Duration::from_millis(5)))
            .unwrap();

        let addr = socket.local_addr().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicUsize::new(0));

        let thread = {
            let stop = Arc::clone(&stop);
            let dropped = Arc::clone(&dropped);

            thread::spawn(move || {
                let mut buf = vec![0u8; 65_536];
                let mut client_addr = None;
                let mut held_to_server: Option<Held> = None;
                let mut held_to_client: Option<Held> = None;

                while !stop.load(Ordering::Relaxed) {
                    let (len, sender_addr) = match socket.recv_from(&mut buf) {
                        Ok(x) => x,
                        Err(_) => {
                            // Idle; release anything still held
                            for held in [held_to_server.take(), held_to_client.take()]
                                .into_iter()
                                .flatten()
                            {
                                let _ = socket.send_to(&held.bytes, held.addr);
                            }
                            continue;
                        }
                    };

                    let bytes = &buf[..len];

                    let (direction, dest_addr, held) = if sender_addr == server_addr {
                        match client_addr {
                            Some(client_addr) => {
                                (Direction::ToClient, client_addr, &mut held_to_client)
                            }
                            None => continue,
                        }
                    } else {
                        client_addr = Some(sender_addr);
                        (Direction::ToServer, server_addr, &mut held_to_server)
                    };

                    let verdict = match Packet::decode(bytes) {
                        Ok(packet) => policy(direction, &packet),
                        Err(_) => Verdict::Forward,
                    };

                    match verdict {
                        Verdict::Forward => {
                            let _ = socket.send_to(bytes, dest_addr);
                        }
                        Verdict::Drop => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        Verdict::Duplicate => {
                            let _ = socket.send_to(bytes, dest_addr);
                            let _ = socket.send_to(bytes, dest_addr);
                        }
                        Verdict::Delay => {
                            if let Some(previous) = held.replace(Held {
                                bytes: bytes.to_vec(),
                                addr: dest_addr,
                            }) {
                                let _ = socket.send_to(&previous.bytes, previous.addr);
                            }
                            continue;
                        }
                    }

                    if let Some(previous) = held.take() {
                        let _ = socket.send_to(&previous.bytes, previous.addr);
                    }
                }
            })
        };

        Self {
            addr,
            stop,
            dropped,
            thread: Some(thread),
        }
    }

    /// Address clients should connect to.
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// Collects the DATA ids seen by a policy, for asserting on retransmissions.
pub fn record_data_ids(seen: Arc<std::sync::Mutex<Vec<u32>>>) -> Policy {
    Box::new(move |direction, packet| {
        if direction == Direction::ToServer && packet.packet_type() == PacketType::Data {
            seen.lock().unwrap().push(packet.id());
        }
        Verdict::Forward
    })
}

pub fn distinct(ids: &[u32]) -> HashSet<u32> {
    ids.iter().copied().collect()
}
