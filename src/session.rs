use std::net;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time;

use tracing::{debug, info, trace};

use crate::buffer::OrderedBuffer;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::event_loop::Context;
use crate::packet::{self, Packet, PacketType};
use crate::socket;

struct Inbound {
    buffer: OrderedBuffer,
    // Id the next call to recv will deliver
    read_id: u32,
}

struct Outbound {
    buffer: OrderedBuffer,
    // Id assigned to the next send
    write_id: u32,
    // Last time the retransmit buffer was empty or made progress
    progress_time: time::Instant,
}

impl Inbound {
    /// Copies the next in-order payload into `buf`, if it has arrived.
    fn take_next(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self.buffer.front() {
            Some(packet) if packet.id() == self.read_id => (),
            _ => return None,
        }

        let packet = self.buffer.pop_front()?;

        let payload = packet.payload();
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);

        if len < payload.len() {
            trace!(id = packet.id(), dropped = payload.len() - len, "payload truncated");
        }

        self.read_id = self.read_id.wrapping_add(1);

        Some(len)
    }
}

/// Session state shared between the event loop and the [`Session`] handle.
pub struct SessionCore {
    peer_addr: net::SocketAddr,
    inbound: Mutex<Inbound>,
    // Signaled when the next in-order packet arrives; paired with `inbound`
    data_ready: Condvar,
    outbound: Mutex<Outbound>,
}

impl SessionCore {
    pub fn new(peer_addr: net::SocketAddr) -> Self {
        Self {
            peer_addr,
            inbound: Mutex::new(Inbound {
                buffer: OrderedBuffer::new(),
                read_id: 0,
            }),
            data_ready: Condvar::new(),
            outbound: Mutex::new(Outbound {
                buffer: OrderedBuffer::new(),
                write_id: 0,
                progress_time: time::Instant::now(),
            }),
        }
    }

    pub fn peer_addr(&self) -> &net::SocketAddr {
        &self.peer_addr
    }

    fn lock_inbound(&self) -> MutexGuard<'_, Inbound> {
        self.inbound.lock().unwrap()
    }

    fn lock_outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap()
    }

    /// Places an inbound DATA packet, waking readers if it is the next one expected.
    pub fn receive(&self, packet: Packet) {
        let ref mut inbound = *self.lock_inbound();

        let id = packet.id();

        if id < inbound.read_id {
            // Behind the read position: a retransmission of something already delivered
            trace!(peer = %self.peer_addr, id, read_id = inbound.read_id, "stale data");
            return;
        }

        if !inbound.buffer.insert_by_id(packet) {
            trace!(peer = %self.peer_addr, id, "duplicate data");
            return;
        }

        if id == inbound.read_id {
            self.data_ready.notify_all();
        }
    }

    /// Applies an inbound ACK to the retransmit buffer.
    pub fn acknowledge<F>(&self, id: u32, resend: F)
    where
        F: FnMut(&Packet),
    {
        let ref mut outbound = *self.lock_outbound();

        match outbound.buffer.acknowledge(id, resend) {
            Some(outcome) => {
                outbound.progress_time = time::Instant::now();

                trace!(peer = %self.peer_addr, id, released = outcome.released, "ack");

                if outcome.resent > 0 {
                    debug!(
                        peer = %self.peer_addr,
                        id,
                        resent = outcome.resent,
                        "gap retransmission"
                    );
                }
            }
            None => {
                trace!(peer = %self.peer_addr, id, "stale ack");
            }
        }
    }

    /// Resends every unacknowledged packet if the retransmit buffer has made no progress for
    /// `timeout`. Returns the number of packets resent.
    pub fn retransmit_expired<F>(&self, now: time::Instant, timeout: time::Duration, resend: F) -> usize
    where
        F: FnMut(&Packet),
    {
        let ref mut outbound = *self.lock_outbound();

        if outbound.buffer.is_empty() || now.duration_since(outbound.progress_time) < timeout {
            return 0;
        }

        outbound.progress_time = now;

        outbound.buffer.resend_unacked(resend)
    }

    /// Wakes every thread blocked in recv.
    pub fn wake_all(&self) {
        let _inbound = self.lock_inbound();
        self.data_ready.notify_all();
    }

    fn release(&self) {
        self.lock_inbound().buffer.release();
        self.lock_outbound().buffer.release();
    }
}

/// One end of a reliable, ordered message channel.
///
/// A session is created by [`EventLoop::connect`](crate::EventLoop::connect) on the client side
/// and by [`Server::accept`](crate::Server::accept) on the server side. Messages passed to
/// [`Session::send`] are delivered by [`Session::recv`] on the peer exactly once and in order.
///
/// All methods take `&self`; a session may be shared between a sending and a receiving thread.
/// Dropping the session closes it.
pub struct Session {
    core: Arc<SessionCore>,
    endpoint: Arc<Endpoint>,
    context: Arc<Context>,
}

impl Session {
    pub(crate) fn new(core: Arc<SessionCore>, endpoint: Arc<Endpoint>, context: Arc<Context>) -> Self {
        Self {
            core,
            endpoint,
            context,
        }
    }

    /// Queues `bytes` as one message and transmits it immediately. Never blocks.
    ///
    /// Fails with [`Error::PayloadTooLarge`] if `bytes` exceeds the configured maximum, in which
    /// case nothing is transmitted.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let max = self.context.config().payload_size_max;

        if bytes.len() > max {
            return Err(Error::PayloadTooLarge {
                len: bytes.len(),
                max,
            });
        }

        if self.context.is_stopped() {
            return Err(Error::Stopped);
        }

        let ref mut outbound = *self.core.lock_outbound();

        let id = outbound.write_id;

        if id == packet::HELLO_ID {
            return Err(Error::ProtocolConsistencyViolation { id });
        }

        let packet = Packet::encode(id, PacketType::Data, bytes);

        socket::send_packet(self.endpoint.socket(), &packet, &self.core.peer_addr)?;

        if outbound.buffer.is_empty() {
            outbound.progress_time = time::Instant::now();
        }

        outbound.buffer.push_back(packet)?;
        outbound.write_id = id.wrapping_add(1);

        trace!(peer = %self.core.peer_addr, id, len = bytes.len(), "sent data");

        Ok(())
    }

    /// Blocks until the next message arrives and copies it into `buf`, returning the number of
    /// bytes copied. A message longer than `buf` is truncated.
    ///
    /// There is no indication that the peer has gone away; a silent peer blocks this call until
    /// the event loop is stopped, after which it fails with [`Error::Stopped`]. Use
    /// [`Session::recv_timeout`] to bound the wait.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.core.lock_inbound();

        loop {
            if let Some(len) = inbound.take_next(buf) {
                return Ok(len);
            }

            if self.context.is_stopped() {
                return Err(Error::Stopped);
            }

            inbound = self.core.data_ready.wait(inbound).unwrap();
        }
    }

    /// Like [`Session::recv`], but gives up after `timeout` and returns `Ok(None)`.
    pub fn recv_timeout(&self, buf: &mut [u8], timeout: time::Duration) -> Result<Option<usize>> {
        let deadline = time::Instant::now() + timeout;

        let mut inbound = self.core.lock_inbound();

        loop {
            if let Some(len) = inbound.take_next(buf) {
                return Ok(Some(len));
            }

            if self.context.is_stopped() {
                return Err(Error::Stopped);
            }

            let remaining = deadline.saturating_duration_since(time::Instant::now());

            if remaining.is_zero() {
                return Ok(None);
            }

            inbound = self.core.data_ready.wait_timeout(inbound, remaining).unwrap().0;
        }
    }

    /// Returns the remote address of this session.
    pub fn peer_addr(&self) -> net::SocketAddr {
        self.core.peer_addr
    }

    pub fn peer_ip(&self) -> net::IpAddr {
        self.core.peer_addr.ip()
    }

    pub fn peer_port(&self) -> u16 {
        self.core.peer_addr.port()
    }

    /// Returns the local address of the underlying UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.endpoint.local_addr()
    }

    /// Number of sent messages not yet acknowledged by the peer.
    pub fn unacked_count(&self) -> usize {
        self.core.lock_outbound().buffer.len()
    }

    /// Closes the session. Equivalent to dropping it.
    pub fn close(self) {}

    fn shutdown(&mut self) {
        let mut state = self.endpoint.lock();

        let linked = state
            .sessions
            .get(&self.core.peer_addr)
            .map_or(false, |core| Arc::ptr_eq(core, &self.core));

        if linked {
            state.sessions.remove(&self.core.peer_addr);
        }

        self.core.release();

        let unused = state.is_unused();

        drop(state);

        info!(peer = %self.core.peer_addr, local = %self.endpoint.local_addr(), "session closed");

        if unused {
            self.context.deregister(&self.endpoint);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_addr", &self.core.peer_addr)
            .field("local_addr", &self.endpoint.local_addr())
            .finish()
    }
}
