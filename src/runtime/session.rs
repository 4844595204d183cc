//! Per-connection read-transform-write loop.
//!
//! A session owns its `TcpStream` for its whole life. Responses are written
//! and flushed one at a time, so a peer always sees exactly one response line
//! per request line, in request order. When the session is dropped the
//! socket is shut down in both directions, whatever path ended it.

use crate::config::Config;
use crate::error::SessionError;
use crate::protocol::{self, FrameResult, LineDecoder};
use crate::runtime::connection::SessionInfo;
use crate::runtime::stats::ServerStats;
use crate::transform::LineTransform;
use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8 * 1024;

/// Session limits taken from the server config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_line_length: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_line_length: config.max_line_length,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_line_length: protocol::DEFAULT_MAX_LINE_LENGTH,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// What a session did before it ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub lines: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Bytes of an unterminated line dropped at EOF.
    pub discarded: usize,
}

/// One accepted connection and its protocol loop.
pub struct ConnectionSession {
    stream: TcpStream,
    info: SessionInfo,
    transform: Arc<dyn LineTransform>,
    settings: SessionSettings,
    stats: Arc<ServerStats>,
    decoder: LineDecoder,
    buffer: BytesMut,
    output: BytesMut,
    summary: SessionSummary,
}

impl ConnectionSession {
    pub fn new(
        stream: TcpStream,
        info: SessionInfo,
        transform: Arc<dyn LineTransform>,
        settings: SessionSettings,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            stream,
            info,
            transform,
            decoder: LineDecoder::new(settings.max_line_length),
            settings,
            stats,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            output: BytesMut::with_capacity(READ_CHUNK),
            summary: SessionSummary::default(),
        }
    }

    /// Serve lines until the peer closes or an error occurs.
    ///
    /// Consumes the session; the connection is closed on return.
    pub fn run(mut self) -> Result<SessionSummary, SessionError> {
        info!(session = %self.info.label, "Connected");

        match self.serve() {
            Ok(()) => {
                info!(
                    session = %self.info.label,
                    lines = self.summary.lines,
                    bytes_in = self.summary.bytes_in,
                    bytes_out = self.summary.bytes_out,
                    "Closed"
                );
                Ok(self.summary)
            }
            Err(e) => {
                match &e {
                    SessionError::Transform(_) | SessionError::LineTooLong { .. } => {
                        warn!(session = %self.info.label, error = %e, "Closed on bad input")
                    }
                    _ if e.is_timeout() => {
                        info!(session = %self.info.label, "Closed after timeout")
                    }
                    SessionError::Io(_) => {
                        debug!(session = %self.info.label, error = %e, "Closed on I/O error")
                    }
                }
                Err(e)
            }
        }
    }

    fn serve(&mut self) -> Result<(), SessionError> {
        self.stream.set_nodelay(true)?;
        self.stream.set_read_timeout(self.settings.read_timeout)?;
        self.stream.set_write_timeout(self.settings.write_timeout)?;

        loop {
            match self.decoder.decode(&mut self.buffer) {
                FrameResult::Line(line) => {
                    self.respond(&line)?;
                    continue;
                }
                FrameResult::TooLong { limit } => return Err(SessionError::LineTooLong { limit }),
                FrameResult::Incomplete => {}
            }

            if self.fill_buffer()? == 0 {
                if !self.buffer.is_empty() {
                    self.summary.discarded = self.buffer.len();
                    debug!(
                        session = %self.info.label,
                        bytes = self.buffer.len(),
                        "Discarding unterminated line at EOF"
                    );
                }
                return Ok(());
            }
        }
    }

    /// Read once from the socket into the receive buffer.
    ///
    /// Returns 0 on EOF.
    fn fill_buffer(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn respond(&mut self, line: &[u8]) -> Result<(), SessionError> {
        let transformed = self.transform.transform(line)?;

        self.output.clear();
        protocol::encode_line(&transformed, &mut self.output);
        self.stream.write_all(&self.output)?;
        self.stream.flush()?;

        trace!(session = %self.info.label, len = line.len(), "Answered line");

        let bytes_in = line.len() + 1;
        let bytes_out = self.output.len();
        self.summary.lines += 1;
        self.summary.bytes_in += bytes_in as u64;
        self.summary.bytes_out += bytes_out as u64;
        self.stats.record_line(bytes_in, bytes_out);
        Ok(())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        // NotConnected is expected when the peer already went away.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
