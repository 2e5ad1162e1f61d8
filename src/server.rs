use std::net;
use std::sync::Arc;
use std::time;

use tracing::{debug, info};

use crate::endpoint::{Endpoint, EndpointState};
use crate::error::{Error, Result};
use crate::event_loop::Context;
use crate::packet::{self, Packet};
use crate::session::{Session, SessionCore};
use crate::socket;

/// A bound endpoint accepting sessions.
///
/// Peers whose HELLO has arrived wait in a FIFO queue until accepted. Accepted sessions share
/// the server's UDP socket and remain usable after the server itself is closed.
pub struct Server {
    endpoint: Arc<Endpoint>,
    context: Arc<Context>,
}

pub(crate) fn bind<A>(context: &Arc<Context>, bind_addr: A) -> Result<Server>
where
    A: net::ToSocketAddrs,
{
    if context.is_stopped() {
        return Err(Error::Stopped);
    }

    let socket = socket::bind(bind_addr)?;

    let endpoint = context.register(socket, EndpointState::with_listener())?;

    info!(local = %endpoint.local_addr(), "server bound");

    Ok(Server {
        endpoint,
        context: Arc::clone(context),
    })
}

impl Server {
    /// Links the next pending peer as an established session and acknowledges its handshake.
    /// Must be called with the endpoint lock held, i.e. with `state` borrowed from it.
    fn establish_next(&self, state: &mut EndpointState) -> Option<Session> {
        let peer_addr = state.listener.as_mut()?.pop_front()?;

        let core = Arc::new(SessionCore::new(peer_addr));

        state.sessions.insert(peer_addr, Arc::clone(&core));

        self.endpoint
            .send_logged(&Packet::ack(packet::HELLO_ID), &peer_addr);

        info!(peer = %peer_addr, local = %self.endpoint.local_addr(), "session accepted");

        Some(Session::new(
            core,
            Arc::clone(&self.endpoint),
            Arc::clone(&self.context),
        ))
    }

    /// Blocks until a peer has completed its handshake and returns the new session.
    ///
    /// Fails with [`Error::Stopped`] once the event loop is stopped.
    pub fn accept(&self) -> Result<Session> {
        let mut state = self.endpoint.lock();

        loop {
            if let Some(session) = self.establish_next(&mut state) {
                return Ok(session);
            }

            if self.context.is_stopped() {
                return Err(Error::Stopped);
            }

            state = self.endpoint.wait_accept(state);
        }
    }

    /// Returns the next pending session if one is ready, `Ok(None)` otherwise.
    pub fn try_accept(&self) -> Result<Option<Session>> {
        if self.context.is_stopped() {
            return Err(Error::Stopped);
        }

        let mut state = self.endpoint.lock();

        Ok(self.establish_next(&mut state))
    }

    /// Like [`Server::accept`], but gives up after `timeout` and returns `Ok(None)`.
    pub fn accept_timeout(&self, timeout: time::Duration) -> Result<Option<Session>> {
        let deadline = time::Instant::now() + timeout;

        let mut state = self.endpoint.lock();

        loop {
            if let Some(session) = self.establish_next(&mut state) {
                return Ok(Some(session));
            }

            if self.context.is_stopped() {
                return Err(Error::Stopped);
            }

            let remaining = deadline.saturating_duration_since(time::Instant::now());

            if remaining.is_zero() {
                return Ok(None);
            }

            state = self.endpoint.wait_accept_timeout(state, remaining);
        }
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.endpoint.local_addr()
    }

    /// Number of peers waiting to be accepted.
    pub fn pending_count(&self) -> usize {
        self.endpoint
            .lock()
            .listener
            .as_ref()
            .map_or(0, |listener| listener.len())
    }

    /// Number of accepted sessions still open on this server's socket.
    pub fn session_count(&self) -> usize {
        self.endpoint.lock().sessions.len()
    }

    /// Closes the server, discarding peers that were never accepted. Equivalent to dropping it.
    pub fn close(self) {}

    fn shutdown(&mut self) {
        let mut state = self.endpoint.lock();

        let discarded = state.listener.take().map_or(0, |listener| listener.len());

        let unused = state.is_unused();

        drop(state);

        info!(local = %self.endpoint.local_addr(), discarded, "server closed");

        if unused {
            self.context.deregister(&self.endpoint);
        } else {
            debug!(local = %self.endpoint.local_addr(), "endpoint kept for open sessions");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.endpoint.local_addr())
            .finish()
    }
}
