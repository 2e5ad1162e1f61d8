use std::collections::HashMap;
use std::collections::VecDeque;
use std::net;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time;

use tracing::{debug, trace, warn};

use crate::packet::{self, Packet, PacketType};
use crate::session::SessionCore;
use crate::socket;

/// Handshake-complete peers waiting to be accepted by a server.
#[derive(Debug, Default)]
pub struct Listener {
    pending: VecDeque<net::SocketAddr>,
}

impl Listener {
    pub fn pop_front(&mut self) -> Option<net::SocketAddr> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Everything guarded by an endpoint's lock.
#[derive(Default)]
pub struct EndpointState {
    // Present while a server owns this endpoint
    pub listener: Option<Listener>,
    // Established sessions sharing this endpoint, by remote address
    pub sessions: HashMap<net::SocketAddr, Arc<SessionCore>>,
}

impl EndpointState {
    pub fn with_listener() -> Self {
        Self {
            listener: Some(Listener::default()),
            sessions: HashMap::new(),
        }
    }

    pub fn with_session(core: Arc<SessionCore>) -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(*core.peer_addr(), core);

        Self {
            listener: None,
            sessions,
        }
    }

    /// True once neither a server nor any session refers to the endpoint.
    pub fn is_unused(&self) -> bool {
        self.listener.is_none() && self.sessions.is_empty()
    }
}

/// A UDP socket registered with an event loop, shared by a server and/or its sessions.
pub struct Endpoint {
    // Registry key, also used as the polling key
    key: usize,
    socket: net::UdpSocket,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    state: Mutex<EndpointState>,
    // Signaled when a peer is appended to the listener queue; paired with `state`
    accept_ready: Condvar,
}

impl Endpoint {
    pub fn new(
        key: usize,
        socket: net::UdpSocket,
        local_addr: net::SocketAddr,
        state: EndpointState,
    ) -> Self {
        Self {
            key,
            socket,
            local_addr,
            state: Mutex::new(state),
            accept_ready: Condvar::new(),
        }
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn socket(&self) -> &net::UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    pub fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap()
    }

    pub fn wait_accept<'a>(
        &self,
        guard: MutexGuard<'a, EndpointState>,
    ) -> MutexGuard<'a, EndpointState> {
        self.accept_ready.wait(guard).unwrap()
    }

    pub fn wait_accept_timeout<'a>(
        &self,
        guard: MutexGuard<'a, EndpointState>,
        timeout: time::Duration,
    ) -> MutexGuard<'a, EndpointState> {
        self.accept_ready.wait_timeout(guard, timeout).unwrap().0
    }

    /// Wakes every thread blocked in accept or recv on this endpoint.
    pub fn wake_all(&self) {
        let state = self.lock();

        self.accept_ready.notify_all();

        for core in state.sessions.values() {
            core.wake_all();
        }
    }

    /// Returns the sessions currently linked to this endpoint.
    pub fn sessions(&self) -> Vec<Arc<SessionCore>> {
        self.lock().sessions.values().cloned().collect()
    }

    fn find_session(&self, addr: &net::SocketAddr) -> Option<Arc<SessionCore>> {
        self.lock().sessions.get(addr).cloned()
    }

    pub fn send_logged(&self, packet: &Packet, addr: &net::SocketAddr) {
        socket::send_packet_logged(&self.socket, packet, addr);
    }

    /// Reads and processes as many datagrams as possible without blocking.
    pub fn drain(&self, recv_buffer: &mut [u8]) {
        loop {
            match socket::try_recv_from(&self.socket, recv_buffer) {
                Ok(Some((len, sender_addr))) => {
                    self.handle_datagram(&recv_buffer[..len], &sender_addr);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(endpoint = %self.local_addr, error = %err, "recvfrom failed");
                    break;
                }
            }
        }
    }

    pub fn handle_datagram(&self, bytes: &[u8], sender_addr: &net::SocketAddr) {
        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(peer = %sender_addr, len = bytes.len(), error = %err, "dropping datagram");
                return;
            }
        };

        trace!(
            peer = %sender_addr,
            id = packet.id(),
            kind = ?packet.packet_type(),
            "received packet"
        );

        match packet.packet_type() {
            PacketType::Hello => self.handle_hello(&packet, sender_addr),
            PacketType::Data => self.handle_data(packet, sender_addr),
            PacketType::Ack => self.handle_ack(&packet, sender_addr),
        }
    }

    fn handle_hello(&self, packet: &Packet, sender_addr: &net::SocketAddr) {
        if packet.id() != packet::HELLO_ID {
            debug!(peer = %sender_addr, id = packet.id(), "hello with data id");
            return;
        }

        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(listener) = state.listener.as_mut() else {
            trace!(peer = %sender_addr, "hello on endpoint without server");
            return;
        };

        if state.sessions.contains_key(sender_addr) {
            drop(guard);

            // The peer missed our acknowledgement; repeat it
            debug!(peer = %sender_addr, "repeating handshake ack");
            self.send_logged(&Packet::ack(packet::HELLO_ID), sender_addr);
            return;
        }

        if listener.pending.contains(sender_addr) {
            trace!(peer = %sender_addr, "hello from pending peer");
            return;
        }

        listener.pending.push_back(*sender_addr);
        self.accept_ready.notify_one();

        debug!(peer = %sender_addr, pending = listener.pending.len(), "queued connection");
    }

    fn handle_data(&self, packet: Packet, sender_addr: &net::SocketAddr) {
        let Some(core) = self.find_session(sender_addr) else {
            trace!(peer = %sender_addr, id = packet.id(), "data from unknown peer");
            return;
        };

        // Acknowledge every copy, duplicates included, so the sender can make progress
        self.send_logged(&Packet::ack(packet.id()), sender_addr);

        core.receive(packet);
    }

    fn handle_ack(&self, packet: &Packet, sender_addr: &net::SocketAddr) {
        if packet.id() == packet::HELLO_ID {
            // Duplicate handshake ack
            return;
        }

        let Some(core) = self.find_session(sender_addr) else {
            trace!(peer = %sender_addr, id = packet.id(), "ack from unknown peer");
            return;
        };

        core.acknowledge(packet.id(), |resend| self.send_logged(resend, sender_addr));
    }
}
