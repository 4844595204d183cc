//! Server lifecycle: bind, serve, shut down.
//!
//! ```text
//! Created ──bind──▶ Listening ──shutdown──▶ ShuttingDown ──▶ Stopped
//!    └──────────────shutdown before bind───────────────────────▲
//! ```
//!
//! `Stopped` is terminal. A shutdown request wakes the blocking `accept` by
//! opening a throwaway loopback connection to the listener; the dispatcher
//! sees the new state, drops the listener, and the configured
//! `ShutdownPolicy` decides what happens to sessions still in flight.

use crate::config::Config;
use crate::error::ServerError;
use crate::runtime::{Dispatcher, ServerStats, SessionRegistry, SessionSettings, StatsSnapshot};
use crate::transform::{self, LineTransform};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Listen backlog passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Upper bound on the loopback connect used to wake the accept loop.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// What happens to in-flight sessions when the server shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Leave sessions running; they end with their peers or with the process.
    #[default]
    Detach,
    /// Wait up to the drain timeout for sessions to end on their own.
    Drain,
    /// Close every session's socket, then wait up to the drain timeout.
    Abort,
}

/// Lifecycle state of a `Server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    ShuttingDown,
    Stopped,
}

impl ServerState {
    fn name(self) -> &'static str {
        match self {
            ServerState::Created => "Created",
            ServerState::Listening => "Listening",
            ServerState::ShuttingDown => "ShuttingDown",
            ServerState::Stopped => "Stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Created,
            1 => ServerState::Listening,
            2 => ServerState::ShuttingDown,
            _ => ServerState::Stopped,
        }
    }
}

/// State shared between the server, its dispatcher, and shutdown handles.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    wake_addr: OnceLock<SocketAddr>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ServerState::Created as u8),
            wake_addr: OnceLock::new(),
        }
    }

    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ServerState, to: ServerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set(&self, to: ServerState) {
        self.state.store(to as u8, Ordering::Release);
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        matches!(
            self.state(),
            ServerState::ShuttingDown | ServerState::Stopped
        )
    }

    fn request_shutdown(&self) -> bool {
        if self.transition(ServerState::Created, ServerState::Stopped) {
            return true;
        }
        if !self.transition(ServerState::Listening, ServerState::ShuttingDown) {
            return false;
        }

        if let Some(addr) = self.wake_addr.get() {
            // The dispatcher drops this connection without serving it.
            match TcpStream::connect_timeout(addr, WAKE_TIMEOUT) {
                Ok(_) => debug!(addr = %addr, "Woke accept loop"),
                Err(e) => debug!(addr = %addr, error = %e, "Wake connection failed"),
            }
        }
        true
    }
}

/// Cloneable handle that requests shutdown from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    lifecycle: Arc<Lifecycle>,
}

impl ShutdownHandle {
    /// Stop accepting connections and release the listener.
    ///
    /// Returns `false` if shutdown was already requested.
    pub fn shutdown(&self) -> bool {
        self.lifecycle.request_shutdown()
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }
}

/// A line-transformation server.
pub struct Server {
    config: Config,
    transform: Arc<dyn LineTransform>,
    lifecycle: Arc<Lifecycle>,
    listener: Option<TcpListener>,
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Create a server that applies `transform` to every line.
    pub fn new(config: Config, transform: Arc<dyn LineTransform>) -> Self {
        Server {
            config,
            transform,
            lifecycle: Arc::new(Lifecycle::new()),
            listener: None,
            registry: Arc::new(SessionRegistry::new()),
            stats: Arc::new(ServerStats::new()),
        }
    }

    /// Create a server using the transform and encoding named in `config`.
    pub fn from_config(config: Config) -> Self {
        let transform = transform::build(config.transform, config.encoding);
        Self::new(config, transform)
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Address the listener is bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind the listening socket. `Created → Listening`.
    pub fn bind(&mut self) -> Result<SocketAddr, ServerError> {
        let state = self.state();
        if state != ServerState::Created {
            return Err(ServerError::InvalidState {
                operation: "bind",
                state: state.name(),
            });
        }

        let listener = bind_listener(&self.config)?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr: display_addr(&self.config),
            source: e,
        })?;

        let _ = self.lifecycle.wake_addr.set(wake_addr(local_addr));
        self.listener = Some(listener);

        // A shutdown that raced with bind already moved us to Stopped.
        if !self.lifecycle.transition(ServerState::Created, ServerState::Listening) {
            self.listener = None;
            return Err(ServerError::InvalidState {
                operation: "bind",
                state: self.state().name(),
            });
        }

        info!(
            address = %local_addr,
            reuse_address = self.config.reuse_address,
            max_connections = ?self.config.max_connections,
            "Server listening"
        );
        Ok(local_addr)
    }

    /// Run the accept loop on the calling thread until shutdown.
    ///
    /// Binds first if still `Created`.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        if self.state() == ServerState::Created {
            self.bind()?;
        }

        let result = match (self.state(), self.listener.take()) {
            (ServerState::Listening, Some(listener)) => Dispatcher {
                listener,
                lifecycle: Arc::clone(&self.lifecycle),
                transform: Arc::clone(&self.transform),
                settings: SessionSettings::from(&self.config),
                registry: Arc::clone(&self.registry),
                stats: Arc::clone(&self.stats),
                max_connections: self.config.max_connections,
                keep_control: self.config.shutdown == ShutdownPolicy::Abort,
                next_id: 0,
            }
            .run(),
            // Shutdown requested between bind and serve.
            (ServerState::ShuttingDown, _) => Ok(()),
            (state, _) => {
                return Err(ServerError::InvalidState {
                    operation: "serve",
                    state: state.name(),
                })
            }
        };

        self.lifecycle.set(ServerState::ShuttingDown);
        info!("Stopped accepting connections");
        self.settle_sessions();
        self.lifecycle.set(ServerState::Stopped);
        info!("Server stopped");

        result
    }

    /// Bind if needed and run `serve` on a background thread.
    pub fn spawn(mut self) -> Result<ServerHandle, ServerError> {
        let local_addr = match self.state() {
            ServerState::Created => self.bind()?,
            _ => self.local_addr().ok_or(ServerError::InvalidState {
                operation: "spawn",
                state: self.state().name(),
            })?,
        };

        let shutdown = self.shutdown_handle();
        let stats = Arc::clone(&self.stats);
        let registry = Arc::clone(&self.registry);

        let thread = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || self.serve())
            .map_err(|e| ServerError::Spawn {
                what: "dispatcher",
                source: e,
            })?;

        Ok(ServerHandle {
            local_addr,
            shutdown,
            stats,
            registry,
            thread,
        })
    }

    fn settle_sessions(&self) {
        let in_flight = self.registry.len();
        let timeout = self.config.drain_timeout;

        match self.config.shutdown {
            ShutdownPolicy::Detach => {
                if in_flight > 0 {
                    info!(in_flight, "Leaving in-flight sessions to finish on their own");
                }
            }
            ShutdownPolicy::Drain => {
                info!(in_flight, timeout = ?timeout, "Draining sessions");
                if !self.registry.wait_idle(timeout) {
                    warn!(
                        remaining = ?self.registry.labels(),
                        "Drain timeout elapsed with sessions still running"
                    );
                }
            }
            ShutdownPolicy::Abort => {
                let closed = self.registry.close_all();
                info!(in_flight, closed, "Closed in-flight sessions");
                if !self.registry.wait_idle(timeout) {
                    warn!(
                        remaining = ?self.registry.labels(),
                        "Sessions still running after forced close"
                    );
                }
            }
        }
    }
}

/// Handle to a server running on its own dispatcher thread.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
    stats: Arc<ServerStats>,
    registry: Arc<SessionRegistry>,
    thread: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ServerState {
        self.shutdown.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Sessions currently in flight.
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Request shutdown and wait for the dispatcher to finish.
    pub fn shutdown(self) -> Result<(), ServerError> {
        self.shutdown.shutdown();
        self.join()
    }

    /// Wait for the dispatcher thread to exit.
    pub fn join(self) -> Result<(), ServerError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn display_addr(config: &Config) -> String {
    match config.host.parse::<Ipv6Addr>() {
        Ok(_) => format!("[{}]:{}", config.host, config.port),
        Err(_) => format!("{}:{}", config.host, config.port),
    }
}

fn bind_listener(config: &Config) -> Result<TcpListener, ServerError> {
    let bind_err = |e: io::Error| ServerError::Bind {
        addr: display_addr(config),
        source: e,
    };

    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(bind_err)?;

    let mut last_err = None;
    for addr in addrs {
        match create_listener(addr, config.reuse_address) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }

    Err(bind_err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses")
    })))
}

fn create_listener(addr: SocketAddr, reuse_address: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(reuse_address)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Loopback address that reaches a listener bound to `local`.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}
