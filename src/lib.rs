//! linecap: a concurrent line-transformation server over TCP.
//!
//! Clients send `\n`-terminated lines; the server answers each one with the
//! transformed line on the same connection, in order. Every connection runs
//! on its own thread with no shared mutable state beyond atomic counters.
//!
//! The `load` module drives a running server with synthetic users and
//! reports latency and failures.

pub mod config;
pub mod error;
pub mod load;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod transform;

pub use config::Config;
pub use error::{ConfigError, LoadError, ServerError, SessionError, TransformError};
pub use server::{Server, ServerHandle, ServerState, ShutdownHandle, ShutdownPolicy};
pub use transform::{CaseTransform, EncodingPolicy, LineTransform, TransformKind};
