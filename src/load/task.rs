//! Simulated user tasks.
//!
//! Each task opens its own connection, sends its lines one at a time and
//! waits for each response line before sending the next.

use crate::error::LoadError;
use crate::transform::{CaseTransform, EncodingPolicy, LineTransform, TransformKind};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// Line sent by the short task.
pub const SHORT_LINE: &str = "this is a short one";

/// The two request shapes a simulated user picks between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    /// One line per connection.
    Short,
    /// Many lines on one connection.
    Long,
}

impl TaskKind {
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::Short => "short",
            TaskKind::Long => "long",
        }
    }

    /// Request lines for this task, delimiter excluded.
    pub fn lines(self, count: usize) -> Vec<String> {
        match self {
            TaskKind::Short => vec![SHORT_LINE.to_string()],
            TaskKind::Long => (0..count)
                .map(|i| format!("this is line {i} from a bunch"))
                .collect(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one task run, as reported to the collector.
#[derive(Debug)]
pub struct RequestEvent {
    pub kind: TaskKind,
    pub response_time: Duration,
    /// Response bytes received on success.
    pub result: Result<usize, LoadError>,
}

impl RequestEvent {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Connection parameters shared by every task of a run.
#[derive(Debug, Clone)]
pub struct TaskTarget {
    /// Candidate server addresses, tried in order on every connect.
    pub addrs: Arc<[SocketAddr]>,
    /// Applies to connect and to each response.
    pub timeout: Duration,
    /// Check every response against this transform.
    pub expect: Option<TransformKind>,
}

/// Run one task and time it.
pub async fn execute(target: &TaskTarget, kind: TaskKind, lines: &[String]) -> RequestEvent {
    let start = Instant::now();
    let result = exchange(target, lines).await;
    RequestEvent {
        kind,
        response_time: start.elapsed(),
        result,
    }
}

async fn exchange(target: &TaskTarget, lines: &[String]) -> Result<usize, LoadError> {
    let limit = target.timeout;
    let stream = connect(target).await?;
    stream.set_nodelay(true).map_err(LoadError::Send)?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let expect = target
        .expect
        .map(|kind| CaseTransform::new(kind, EncodingPolicy::Strict));

    let mut received = 0;
    let mut request = String::new();
    let mut response = String::new();

    for line in lines {
        request.clear();
        request.push_str(line);
        request.push('\n');
        writer
            .write_all(request.as_bytes())
            .await
            .map_err(LoadError::Send)?;

        response.clear();
        let n = timeout(limit, reader.read_line(&mut response))
            .await
            .map_err(|_| LoadError::Timeout(limit))?
            .map_err(LoadError::Receive)?;
        if n == 0 || !response.ends_with('\n') {
            return Err(LoadError::UnexpectedEof);
        }

        if let Some(transform) = &expect {
            check_response(transform, line, &response)?;
        }
        received += n;
    }

    Ok(received)
}

/// Connect to the first candidate address that accepts.
///
/// Reports the error from the last address tried.
async fn connect(target: &TaskTarget) -> Result<TcpStream, LoadError> {
    let limit = target.timeout;
    let mut last_err = None;

    for &addr in target.addrs.iter() {
        match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(LoadError::Connect { addr, source: e }),
            Err(_) => last_err = Some(LoadError::Timeout(limit)),
        }
    }

    Err(last_err.unwrap_or_else(|| LoadError::Resolve("no addresses to connect to".to_string())))
}

fn check_response(transform: &CaseTransform, line: &str, response: &str) -> Result<(), LoadError> {
    let mut expected = transform
        .transform(line.as_bytes())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    expected.push('\n');

    if response == expected {
        Ok(())
    } else {
        Err(LoadError::Mismatch {
            expected,
            actual: response.to_string(),
        })
    }
}
