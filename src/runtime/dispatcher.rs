//! Accept loop.
//!
//! One blocking `accept` at a time on the calling thread. Every accepted
//! connection gets its own named OS thread running a `ConnectionSession`;
//! the loop never waits for a session. Session outcomes are recorded by the
//! session's ticket and never reach this loop.

use crate::error::ServerError;
use crate::runtime::connection::{SessionInfo, SessionRegistry, SessionTicket};
use crate::runtime::session::{ConnectionSession, SessionSettings};
use crate::runtime::stats::ServerStats;
use crate::server::Lifecycle;
use crate::transform::LineTransform;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Pause after an accept failed for lack of descriptors or memory.
const RESOURCE_BACKOFF: Duration = Duration::from_millis(50);

/// Accept loop state. Owns the listener for as long as it runs.
pub(crate) struct Dispatcher {
    pub listener: TcpListener,
    pub lifecycle: Arc<Lifecycle>,
    pub transform: Arc<dyn LineTransform>,
    pub settings: SessionSettings,
    pub registry: Arc<SessionRegistry>,
    pub stats: Arc<ServerStats>,
    pub max_connections: Option<usize>,
    /// Keep a control handle per session so shutdown can force-close it.
    pub keep_control: bool,
    pub next_id: u64,
}

impl Dispatcher {
    /// Accept until shutdown is requested or the listener fails.
    ///
    /// The listener is dropped on return.
    pub fn run(mut self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.lifecycle.shutdown_requested() {
                        debug!(peer = %peer, "Shutdown requested, leaving accept loop");
                        return Ok(());
                    }
                    self.dispatch(stream, peer);
                }
                Err(_) if self.lifecycle.shutdown_requested() => return Ok(()),
                Err(e) => match classify(&e) {
                    AcceptError::Transient => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                    AcceptError::Exhausted => {
                        warn!(error = %e, "Out of resources accepting connection, backing off");
                        thread::sleep(RESOURCE_BACKOFF);
                    }
                    AcceptError::Fatal => {
                        error!(error = %e, "Listener failed");
                        return Err(ServerError::Accept(e));
                    }
                },
            }
        }
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.next_id += 1;
        let info = SessionInfo::new(self.next_id, peer);

        let control = if self.keep_control {
            match stream.try_clone() {
                Ok(control) => Some(control),
                Err(e) => {
                    warn!(session = %info.label, error = %e, "Cannot clone socket for shutdown control");
                    None
                }
            }
        } else {
            None
        };

        let Some(mut ticket) = SessionTicket::admit(
            &self.registry,
            &self.stats,
            info.clone(),
            control,
            self.max_connections,
        ) else {
            self.stats.record_rejected();
            warn!(
                peer = %peer,
                limit = ?self.max_connections,
                "Connection limit reached, rejecting"
            );
            return;
        };

        let thread_name = info.thread_name();
        let session = ConnectionSession::new(
            stream,
            info,
            Arc::clone(&self.transform),
            self.settings,
            Arc::clone(&self.stats),
        );

        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            if session.run().is_ok() {
                ticket.complete();
            }
        });

        // On failure the closure is dropped, which closes the socket and
        // releases the ticket.
        if let Err(e) = spawned {
            error!(peer = %peer, error = %e, "Failed to spawn session thread");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptError {
    /// The incoming connection went away; keep accepting.
    Transient,
    /// Descriptor or memory pressure; keep accepting after a pause.
    Exhausted,
    /// The listener itself is unusable.
    Fatal,
}

fn classify(err: &io::Error) -> AcceptError {
    match err.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => AcceptError::Exhausted,
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP | libc::EFAULT) => {
            AcceptError::Fatal
        }
        Some(_) => AcceptError::Transient,
        None => match err.kind() {
            io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported => AcceptError::Fatal,
            _ => AcceptError::Transient,
        },
    }
}
