//! Registry of in-flight sessions.
//!
//! The dispatcher registers each accepted connection before its session
//! thread starts; a `SessionTicket` removes the entry when the session ends,
//! on every exit path including panics. Shutdown uses the registry to wait
//! for sessions to drain or to force their sockets closed.

use crate::runtime::stats::ServerStats;
use slab::Slab;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Observability identity of a session. Has no effect on behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub label: String,
}

impl SessionInfo {
    pub fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            label: format!("{peer} on session-{id}"),
        }
    }

    /// Name of the thread running this session.
    pub fn thread_name(&self) -> String {
        format!("session-{}", self.id)
    }
}

#[derive(Debug)]
struct Entry {
    info: SessionInfo,
    /// Cloned socket handle, only kept when sessions may be force-closed.
    control: Option<TcpStream>,
}

/// Slab of in-flight sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<Slab<Entry>>,
    idle: Condvar,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a session.
    ///
    /// Returns `None` if `limit` is set and already reached.
    pub fn insert(
        &self,
        info: SessionInfo,
        control: Option<TcpStream>,
        limit: Option<usize>,
    ) -> Option<usize> {
        let mut sessions = self.lock();
        if limit.is_some_and(|max| sessions.len() >= max) {
            return None;
        }
        Some(sessions.insert(Entry { info, control }))
    }

    /// Remove a session and wake anyone waiting for the registry to empty.
    pub fn remove(&self, key: usize) -> Option<SessionInfo> {
        let mut sessions = self.lock();
        let entry = sessions.try_remove(key)?;
        if sessions.is_empty() {
            self.idle.notify_all();
        }
        Some(entry.info)
    }

    /// Number of in-flight sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Labels of every in-flight session.
    pub fn labels(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|(_, entry)| entry.info.label.clone())
            .collect()
    }

    /// Shut down both directions of every registered socket that has a
    /// control handle. Blocked reads and writes in those sessions return.
    ///
    /// Returns the number of sockets closed.
    pub fn close_all(&self) -> usize {
        let sessions = self.lock();
        let mut closed = 0;
        for (_, entry) in sessions.iter() {
            if let Some(stream) = &entry.control {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    debug!(session = %entry.info.label, error = %e, "Force close failed");
                } else {
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Block until no sessions remain or `timeout` elapses.
    ///
    /// Returns `true` if the registry is empty.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sessions = self.lock();
        while !sessions.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            sessions = self
                .idle
                .wait_timeout(sessions, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Proof of admission for one session.
///
/// Dropping the ticket deregisters the session and records how it ended.
/// A ticket that was never marked clean counts as a failure, which covers
/// panics and sessions that never got a thread.
#[derive(Debug)]
pub struct SessionTicket {
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
    key: usize,
    clean: bool,
}

impl SessionTicket {
    /// Register a session, respecting `limit`.
    pub fn admit(
        registry: &Arc<SessionRegistry>,
        stats: &Arc<ServerStats>,
        info: SessionInfo,
        control: Option<TcpStream>,
        limit: Option<usize>,
    ) -> Option<Self> {
        let key = registry.insert(info, control, limit)?;
        stats.record_accepted();
        Some(Self {
            registry: Arc::clone(registry),
            stats: Arc::clone(stats),
            key,
            clean: false,
        })
    }

    /// Mark the session as ended on a clean EOF.
    pub fn complete(&mut self) {
        self.clean = true;
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.registry.remove(self.key);
        self.stats.record_session_end(self.clean);
    }
}
