use std::io;
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

use tracing::{debug, error, info, trace, warn};

use crate::client;
use crate::endpoint::{Endpoint, EndpointState};
use crate::error::{Error, Result};
use crate::packet;
use crate::registry::Registry;
use crate::server::{self, Server};
use crate::session::Session;
use crate::socket;

const HANDSHAKE_TIMEOUTS_DEFAULT_MS: [u64; 10] = [100, 100, 150, 150, 200, 200, 250, 250, 300, 300];

const PAYLOAD_SIZE_MAX_DEFAULT: usize = 1472 - packet::HEADER_SIZE;
const PAYLOAD_SIZE_MAX_MAX: usize = socket::DATAGRAM_SIZE_MAX - packet::HEADER_SIZE;

const ENDPOINT_COUNT_MAX_DEFAULT: usize = 4096;

const RETRANSMIT_TIMEOUT_DEFAULT_MS: u64 = 250;
const RETRANSMIT_TIMEOUT_MIN_MS: u64 = 10;

/// Configuration for an [`EventLoop`] and everything created through it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time to wait for a handshake acknowledgement after each HELLO, in milliseconds. One HELLO
    /// is sent per entry; connecting fails once the last wait expires.
    ///
    /// Must be non-empty, with every entry ≥ 1 \
    /// Default value: [100, 100, 150, 150, 200, 200, 250, 250, 300, 300]
    pub handshake_timeouts_ms: Vec<u64>,

    /// Maximum number of payload bytes accepted by a single send.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 65,498 \
    /// Default value: 1,463
    pub payload_size_max: usize,

    /// Maximum number of UDP sockets registered with the loop at any given time.
    ///
    /// Minimum value: 1 \
    /// Default value: 4,096
    pub endpoint_count_max: usize,

    /// If set, unacknowledged packets are resent once a session's retransmit buffer has made no
    /// progress for this many milliseconds. If `None`, retransmission is driven by incoming
    /// acknowledgements alone.
    ///
    /// Minimum value: 10 \
    /// Default value: 250
    pub retransmit_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeouts_ms: HANDSHAKE_TIMEOUTS_DEFAULT_MS.to_vec(),
            payload_size_max: PAYLOAD_SIZE_MAX_DEFAULT,
            endpoint_count_max: ENDPOINT_COUNT_MAX_DEFAULT,
            retransmit_timeout_ms: Some(RETRANSMIT_TIMEOUT_DEFAULT_MS),
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            !self.handshake_timeouts_ms.is_empty(),
            "invalid configuration: handshake_timeouts_ms is empty"
        );
        assert!(
            self.handshake_timeouts_ms.iter().all(|&t| t >= 1),
            "invalid configuration: handshake_timeouts_ms contains 0"
        );
        assert!(
            self.payload_size_max >= 1,
            "invalid configuration: payload_size_max == 0"
        );
        assert!(
            self.payload_size_max <= PAYLOAD_SIZE_MAX_MAX,
            "invalid configuration: payload_size_max > {}",
            PAYLOAD_SIZE_MAX_MAX
        );
        assert!(
            self.endpoint_count_max >= 1,
            "invalid configuration: endpoint_count_max == 0"
        );
        if let Some(timeout_ms) = self.retransmit_timeout_ms {
            assert!(
                timeout_ms >= RETRANSMIT_TIMEOUT_MIN_MS,
                "invalid configuration: retransmit_timeout_ms < {}",
                RETRANSMIT_TIMEOUT_MIN_MS
            );
        }
    }
}

/// State shared by the loop thread, sessions and servers.
pub struct Context {
    config: Config,
    poller: polling::Poller,
    registry: Registry<Endpoint>,
    stopped: AtomicBool,
}

impl Context {
    fn new(config: Config) -> io::Result<Self> {
        Ok(Self {
            poller: polling::Poller::new()?,
            registry: Registry::new(config.endpoint_count_max),
            stopped: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Adds a socket to the registry and starts polling it.
    pub fn register(&self, socket: net::UdpSocket, state: EndpointState) -> Result<Arc<Endpoint>> {
        let local_addr = socket.local_addr()?;

        let endpoint = self
            .registry
            .insert_with(|key| Endpoint::new(key, socket, local_addr, state))?;

        let interest = polling::Event::readable(endpoint.key());

        if let Err(err) = unsafe { self.poller.add(endpoint.socket(), interest) } {
            self.registry.remove(endpoint.key());
            return Err(err.into());
        }

        debug!(local = %local_addr, key = endpoint.key(), "endpoint registered");

        Ok(endpoint)
    }

    /// Stops polling a socket and drops it from the registry. The socket closes once the last
    /// reference to the endpoint is gone.
    pub fn deregister(&self, endpoint: &Endpoint) {
        if self.registry.remove(endpoint.key()).is_none() {
            return;
        }

        if let Err(err) = self.poller.delete(endpoint.socket()) {
            warn!(local = %endpoint.local_addr(), error = %err, "failed to stop polling endpoint");
        }

        debug!(local = %endpoint.local_addr(), key = endpoint.key(), "endpoint deregistered");
    }

    /// Sets the stop flag and wakes every blocked accept and recv caller.
    fn halt(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        for endpoint in self.registry.snapshot() {
            endpoint.wake_all();
        }
    }

    fn retransmit_expired(&self, now: time::Instant, timeout: time::Duration) {
        for endpoint in self.registry.snapshot() {
            for core in endpoint.sessions() {
                let peer_addr = *core.peer_addr();

                let resent = core.retransmit_expired(now, timeout, |packet| {
                    endpoint.send_logged(packet, &peer_addr)
                });

                if resent > 0 {
                    debug!(peer = %peer_addr, resent, "retransmission timeout");
                }
            }
        }
    }
}

fn run(context: Arc<Context>) {
    let mut events = polling::Events::new();
    let mut recv_buffer = vec![0u8; socket::DATAGRAM_SIZE_MAX].into_boxed_slice();

    let retransmit_timeout = context
        .config
        .retransmit_timeout_ms
        .map(time::Duration::from_millis);

    // Sessions are checked at twice the retransmit rate
    let tick_interval = retransmit_timeout.map(|timeout| timeout / 2);
    let mut next_tick = time::Instant::now();

    while !context.is_stopped() {
        events.clear();

        let wait_timeout =
            tick_interval.map(|_| next_tick.saturating_duration_since(time::Instant::now()));

        if let Err(err) = context.poller.wait(&mut events, wait_timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            error!(error = %err, "poller wait failed, stopping event loop");
            break;
        }

        for event in events.iter() {
            let Some(endpoint) = context.registry.get(event.key) else {
                trace!(key = event.key, "event for deregistered endpoint");
                continue;
            };

            endpoint.drain(&mut recv_buffer);

            // Interest is oneshot; re-arm for the next datagram
            let interest = polling::Event::readable(endpoint.key());

            if let Err(err) = context.poller.modify(endpoint.socket(), interest) {
                // Deregistered while we were draining it
                trace!(key = endpoint.key(), error = %err, "could not re-arm endpoint");
            }
        }

        if let (Some(timeout), Some(interval)) = (retransmit_timeout, tick_interval) {
            let now = time::Instant::now();

            if now >= next_tick {
                context.retransmit_expired(now, timeout);
                next_tick = now + interval;
            }
        }
    }

    context.halt();

    debug!("event loop exited");
}

/// A background thread multiplexing every session and server created through it.
///
/// Sessions and servers keep working only while the loop that created them runs. Stopping the
/// loop (or dropping it) wakes every blocked [`Server::accept`] and [`Session::recv`] call, which
/// then fail with [`Error::Stopped`].
pub struct EventLoop {
    context: Arc<Context>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Equivalent to calling [`EventLoop::start_with_config`] with default configuration.
    pub fn start() -> Result<Self> {
        Self::start_with_config(Default::default())
    }

    /// Spawns the loop thread.
    pub fn start_with_config(config: Config) -> Result<Self> {
        config.validate();

        let context = Arc::new(Context::new(config)?);

        let thread = {
            let context = Arc::clone(&context);

            thread::Builder::new()
                .name("piu-event-loop".into())
                .spawn(move || run(context))?
        };

        info!("event loop started");

        Ok(Self {
            context,
            thread: Some(thread),
        })
    }

    /// Performs the handshake with a server at `server_addr` and returns the established
    /// session.
    ///
    /// Runs on the calling thread. One HELLO is sent per configured handshake timeout; if none
    /// is acknowledged, fails with [`Error::ConnectionTimeout`].
    pub fn connect<A>(&self, server_addr: A) -> Result<Session>
    where
        A: net::ToSocketAddrs,
    {
        client::connect(&self.context, server_addr)
    }

    /// Binds a UDP socket at `bind_addr` and returns a server accepting sessions on it.
    pub fn bind<A>(&self, bind_addr: A) -> Result<Server>
    where
        A: net::ToSocketAddrs,
    {
        server::bind(&self.context, bind_addr)
    }

    /// Returns `false` once the loop has been stopped or has failed.
    pub fn is_running(&self) -> bool {
        !self.context.is_stopped()
    }

    /// Number of UDP sockets currently registered with the loop.
    pub fn endpoint_count(&self) -> usize {
        self.context.registry.len()
    }

    /// Stops the loop thread and waits for it to exit. Equivalent to dropping the loop, except
    /// that failures are reported.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        self.context.stopped.store(true, Ordering::SeqCst);

        if let Err(err) = self.context.poller.notify() {
            // The thread may still be parked in wait(); wake the callers anyway
            self.context.halt();
            return Err(Error::Transport(err));
        }

        if thread.join().is_err() {
            error!("event loop thread panicked");
            self.context.halt();
        }

        info!("event loop stopped");

        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "failed to stop event loop");
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.is_running())
            .field("endpoint_count", &self.endpoint_count())
            .finish()
    }
}
