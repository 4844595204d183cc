//! Thread-per-connection runtime.
//!
//! - `Dispatcher`: single-threaded blocking accept loop
//! - `ConnectionSession`: one OS thread per accepted connection
//! - `SessionRegistry`: in-flight sessions, used on shutdown
//! - `ServerStats`: process-wide counters

mod connection;
mod dispatcher;
mod session;
mod stats;

pub use connection::{SessionInfo, SessionRegistry, SessionTicket};
pub use session::{ConnectionSession, SessionSettings, SessionSummary};
pub use stats::{ServerStats, StatsSnapshot};

pub(crate) use dispatcher::Dispatcher;
