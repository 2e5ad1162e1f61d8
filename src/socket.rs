use std::io;
use std::net;
use std::time;

use crate::packet::Packet;

const HANDSHAKE_POLLING_KEY: usize = 0;

/// Largest datagram the receive paths will accept.
pub const DATAGRAM_SIZE_MAX: usize = 65_507;

/// Binds a non-blocking UDP socket suitable for registration with an event loop.
pub fn bind<A>(bind_address: A) -> io::Result<net::UdpSocket>
where
    A: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Sends the serialized packet to `addr`. A full socket buffer is not treated as an error; the
/// packet is simply not on the wire yet.
pub fn send_packet(
    socket: &net::UdpSocket,
    packet: &Packet,
    addr: &net::SocketAddr,
) -> io::Result<()> {
    match socket.send_to(packet.as_bytes(), addr) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            tracing::trace!(peer = %addr, id = packet.id(), "send buffer full");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Like [`send_packet`], but failures are only logged. Used for acknowledgements and
/// retransmissions, which have no caller to report to.
pub fn send_packet_logged(socket: &net::UdpSocket, packet: &Packet, addr: &net::SocketAddr) {
    if let Err(err) = send_packet(socket, packet, addr) {
        tracing::warn!(peer = %addr, id = packet.id(), error = %err, "sendto failed");
    }
}

/// If a datagram can be read from the socket, returns its length and sender. Returns Ok(None)
/// otherwise.
pub fn try_recv_from(
    socket: &net::UdpSocket,
    recv_buffer: &mut [u8],
) -> io::Result<Option<(usize, net::SocketAddr)>> {
    match socket.recv_from(recv_buffer) {
        Ok((len, sender_addr)) => Ok(Some((len, sender_addr))),
        Err(err) => match err.kind() {
            // The only acceptable error is WouldBlock, indicating no datagram
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        },
    }
}

/// Socket used by a connecting client before it is handed to an event loop. Owns a private
/// poller so the handshake can wait with a timeout without involving the loop thread.
pub struct HandshakeSocket {
    socket: net::UdpSocket,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

impl HandshakeSocket {
    pub fn new<A>(bind_address: A) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        let socket = bind(bind_address)?;

        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(&socket, polling::Event::readable(HANDSHAKE_POLLING_KEY))?;
        }

        Ok(Self {
            socket,
            poller,
            poller_events: polling::Events::new(),
            recv_buffer: vec![0; DATAGRAM_SIZE_MAX].into_boxed_slice(),
        })
    }

    pub fn send(&self, packet: &Packet, addr: &net::SocketAddr) -> io::Result<()> {
        send_packet(&self.socket, packet, addr)
    }

    /// Blocks for a duration of up to `timeout` for an incoming datagram and returns it. Returns
    /// Ok(None) if no datagram could be read in the alloted time, or if polling awoke spuriously.
    pub fn wait_for_datagram(
        &mut self,
        timeout: time::Duration,
    ) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
        // Interest is oneshot; re-arm before every wait
        self.poller.modify(
            &self.socket,
            polling::Event::readable(HANDSHAKE_POLLING_KEY),
        )?;

        self.poller_events.clear();

        let n = self.poller.wait(&mut self.poller_events, Some(timeout))?;

        if n == 0 {
            return Ok(None);
        }

        match try_recv_from(&self.socket, &mut self.recv_buffer)? {
            Some((len, sender_addr)) => Ok(Some((&self.recv_buffer[..len], sender_addr))),
            None => Ok(None),
        }
    }

    /// Releases the private poller and returns the underlying non-blocking socket.
    pub fn into_socket(self) -> io::Result<net::UdpSocket> {
        self.poller.delete(&self.socket)?;
        Ok(self.socket)
    }
}
