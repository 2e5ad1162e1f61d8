use std::io;
use std::net;
use std::sync::Arc;
use std::time;

use tracing::{debug, info, trace};

use crate::endpoint::EndpointState;
use crate::error::{Error, Result};
use crate::event_loop::Context;
use crate::packet::{self, Packet, PacketType};
use crate::session::{Session, SessionCore};
use crate::socket::HandshakeSocket;

fn resolve<A>(server_addr: A) -> io::Result<net::SocketAddr>
where
    A: net::ToSocketAddrs,
{
    server_addr
        .to_socket_addrs()?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no IPv4 address to connect to"))
}

fn is_handshake_ack(bytes: &[u8]) -> bool {
    match Packet::decode(bytes) {
        Ok(packet) => packet.packet_type() == PacketType::Ack && packet.id() == packet::HELLO_ID,
        Err(_) => false,
    }
}

/// Waits until `deadline` for the server to acknowledge our HELLO. Datagrams from other
/// addresses, and anything that is not a handshake ack, are discarded.
fn wait_for_ack(
    socket: &mut HandshakeSocket,
    server_addr: &net::SocketAddr,
    deadline: time::Instant,
) -> Result<bool> {
    loop {
        let now = time::Instant::now();

        if now >= deadline {
            return Ok(false);
        }

        match socket.wait_for_datagram(deadline - now)? {
            Some((bytes, sender_addr)) => {
                if sender_addr != *server_addr {
                    trace!(peer = %sender_addr, "ignoring datagram during handshake");
                    continue;
                }

                if is_handshake_ack(bytes) {
                    return Ok(true);
                }
            }
            None => (),
        }
    }
}

pub(crate) fn connect<A>(context: &Arc<Context>, server_addr: A) -> Result<Session>
where
    A: net::ToSocketAddrs,
{
    if context.is_stopped() {
        return Err(Error::Stopped);
    }

    let server_addr = resolve(server_addr)?;

    let mut socket = HandshakeSocket::new((net::Ipv4Addr::UNSPECIFIED, 0))?;

    let hello = Packet::hello();

    let timeouts = &context.config().handshake_timeouts_ms;

    let mut acknowledged = false;

    for (attempt, &timeout_ms) in timeouts.iter().enumerate() {
        debug!(server = %server_addr, attempt = attempt + 1, timeout_ms, "sending hello");

        socket.send(&hello, &server_addr)?;

        let deadline = time::Instant::now() + time::Duration::from_millis(timeout_ms);

        if wait_for_ack(&mut socket, &server_addr, deadline)? {
            acknowledged = true;
            break;
        }
    }

    if !acknowledged {
        return Err(Error::ConnectionTimeout {
            attempts: timeouts.len(),
        });
    }

    let socket = socket.into_socket()?;

    let core = Arc::new(SessionCore::new(server_addr));

    let endpoint = context.register(socket, EndpointState::with_session(Arc::clone(&core)))?;

    info!(server = %server_addr, local = %endpoint.local_addr(), "session connected");

    Ok(Session::new(core, endpoint, Arc::clone(context)))
}
