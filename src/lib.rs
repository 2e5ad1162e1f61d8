/*

PIU layers reliable, ordered, connection-oriented messaging on top of UDP. Each message passed to
send is carried by exactly one datagram, and is delivered to the peer exactly once, in the order it
was sent.

# Packets

Every datagram carries one packet: a 9-byte big-endian header followed by the payload.

  +--------+------+--------+-----------------+
  | id u32 | type | len u32| payload (len)   |
  +--------+------+--------+-----------------+

The type byte is 0 for DATA, 1 for ACK, and 2 for HELLO. ACK and HELLO packets carry no payload.
The id 0x7fffffff is reserved for the handshake; data ids count up from zero and never reach it.

# Handshake

A client sends HELLO(0x7fffffff) and waits for ACK(0x7fffffff), once per entry of the configured
timeout schedule. The server queues the peer on receipt of its HELLO, and sends the ACK when the
peer is accepted. A HELLO from an accepted peer is answered with another ACK, since the previous
one may have been lost.

# Retransmission

Every DATA packet received is acknowledged with an ACK bearing its id, duplicates included. Sent
packets stay in the sender's retransmit buffer, ordered by id, until acknowledged.

When an ACK arrives for the packet at position N of the retransmit buffer, every unacknowledged
packet at positions 0..N-1 is resent, except the one at position N-1, which may simply still be in
flight. The acknowledged packet is then marked, and the acknowledged prefix of the buffer released.

Losses at the tail of a burst produce no later ACK to trigger this, so a retransmit buffer that
has made no progress for one retransmission timeout is resent in full.

# Event loop

All sockets are multiplexed by a single background thread, which receives and acknowledges
packets, queues handshakes, and drives the retransmission timeout. Application threads send
directly on the shared socket, and block on condition variables to accept and receive.

Servers and the sessions they accept share one socket. A socket stays registered until both the
server and all of its sessions are closed.

*/

mod buffer;
mod client;
mod endpoint;
mod error;
mod event_loop;
pub mod packet;
mod registry;
mod server;
mod session;
mod socket;

pub use error::{Error, Result};
pub use event_loop::{Config, EventLoop};
pub use server::Server;
pub use session::Session;
