//! Load driver.
//!
//! Simulates `users` concurrent clients against a running server. Each user
//! repeatedly picks a task by weight, runs it on a fresh connection, reports
//! a `RequestEvent`, then pauses for a random wait:
//!
//! - `short` (default weight 7): one line, one response
//! - `long` (default weight 3): 20 to 100 lines on one connection, each
//!   answered before the next is sent
//!
//! Events flow over a channel to a single collector that builds the
//! `LoadReport`. The driver relies only on the wire contract: one response
//! line per request line, on the same connection.

mod report;
mod task;

pub use report::{LoadReport, TaskStats};
pub use task::{RequestEvent, TaskKind, TaskTarget, SHORT_LINE};

use crate::config::DEFAULT_PORT;
use crate::error::{ConfigError, LoadError};
use crate::transform::TransformKind;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Buffered events between users and the collector.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Command-line arguments for the load driver
#[derive(Parser, Debug)]
#[command(name = "linecap-load")]
#[command(version)]
#[command(about = "Drive a linecap server with synthetic users", long_about = None)]
pub struct LoadArgs {
    /// Server host
    #[arg(short = 'H', long, default_value = "localhost")]
    pub host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Concurrent simulated users
    #[arg(short, long, default_value_t = 10)]
    pub users: usize,

    /// Stop after this many seconds (0 = no time limit)
    #[arg(short, long, default_value_t = 10)]
    pub duration: u64,

    /// Stop each user after this many tasks
    #[arg(short, long)]
    pub iterations: Option<u64>,

    /// Minimum pause between a user's tasks, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub min_wait_ms: u64,

    /// Maximum pause between a user's tasks, in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub max_wait_ms: u64,

    /// Timeout for connect and for each response, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,

    /// Relative weight of the short task
    #[arg(long, default_value_t = 7)]
    pub short_weight: u32,

    /// Relative weight of the long task
    #[arg(long, default_value_t = 3)]
    pub long_weight: u32,

    /// Fewest lines sent by the long task
    #[arg(long, default_value_t = 20)]
    pub min_lines: usize,

    /// Most lines sent by the long task
    #[arg(long, default_value_t = 100)]
    pub max_lines: usize,

    /// Transform the server is expected to apply
    #[arg(long, value_enum, default_value_t = TransformKind::Upper)]
    pub expect: TransformKind,

    /// Do not check response contents
    #[arg(long)]
    pub no_verify: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Resolved load-run parameters.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub host: String,
    pub port: u16,
    pub users: usize,
    pub duration: Option<Duration>,
    pub iterations: Option<u64>,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub timeout: Duration,
    pub short_weight: u32,
    pub long_weight: u32,
    pub min_lines: usize,
    pub max_lines: usize,
    pub expect: Option<TransformKind>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            users: 10,
            duration: Some(Duration::from_secs(10)),
            iterations: None,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(3),
            timeout: Duration::from_secs(5),
            short_weight: 7,
            long_weight: 3,
            min_lines: 20,
            max_lines: 100,
            expect: Some(TransformKind::Upper),
        }
    }
}

impl TryFrom<LoadArgs> for LoadConfig {
    type Error = ConfigError;

    fn try_from(args: LoadArgs) -> Result<Self, Self::Error> {
        let config = LoadConfig {
            host: args.host,
            port: args.port,
            users: args.users,
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            iterations: args.iterations,
            min_wait: Duration::from_millis(args.min_wait_ms),
            max_wait: Duration::from_millis(args.max_wait_ms),
            timeout: Duration::from_millis(args.timeout_ms),
            short_weight: args.short_weight,
            long_weight: args.long_weight,
            min_lines: args.min_lines,
            max_lines: args.max_lines,
            expect: (!args.no_verify).then_some(args.expect),
        };
        config.validate()?;
        Ok(config)
    }
}

impl LoadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.users == 0 {
            return invalid("users", "must be at least 1");
        }
        if self.duration.is_none() && self.iterations.is_none() {
            return invalid("duration", "a duration or an iteration count is required");
        }
        match self.short_weight.checked_add(self.long_weight) {
            Some(0) => return invalid("weights", "at least one task weight must be non-zero"),
            None => return invalid("weights", "task weights must sum to at most u32::MAX"),
            Some(_) => {}
        }
        if self.min_wait > self.max_wait {
            return invalid("min_wait_ms", "must not exceed max_wait_ms");
        }
        if self.min_lines == 0 || self.min_lines > self.max_lines {
            return invalid("min_lines", "must be at least 1 and not exceed max_lines");
        }
        if self.timeout.is_zero() {
            return invalid("timeout_ms", "must be greater than zero");
        }
        Ok(())
    }
}

/// Run until the configured stop condition.
pub async fn run(config: LoadConfig) -> Result<LoadReport, LoadError> {
    let (_stop_tx, stop_rx) = watch::channel(false);
    run_until(config, stop_rx).await
}

/// Run until the configured stop condition or until `stop` turns `true`.
///
/// Tasks already in progress when `stop` fires finish and are reported.
pub async fn run_until(
    config: LoadConfig,
    stop: watch::Receiver<bool>,
) -> Result<LoadReport, LoadError> {
    let addrs = resolve(&config.host, config.port).await?;
    let config = Arc::new(config);
    let target = TaskTarget {
        addrs: Arc::from(addrs),
        timeout: config.timeout,
        expect: config.expect,
    };

    info!(
        server = ?target.addrs,
        users = config.users,
        duration = ?config.duration,
        iterations = ?config.iterations,
        "Starting load run"
    );

    let start = Instant::now();
    let deadline = config.duration.map(|d| start + d);
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    for user in 0..config.users {
        let user_loop = UserLoop {
            user,
            config: Arc::clone(&config),
            target: target.clone(),
            deadline,
            events: tx.clone(),
            stop: stop.clone(),
            rng: fastrand::Rng::new(),
        };
        tokio::spawn(user_loop.run());
    }
    drop(tx);

    let mut report = LoadReport::new(config.users);
    report.collect(rx).await;
    report.finish(start.elapsed());

    info!(
        requests = report.total_requests(),
        failures = report.total_failures(),
        elapsed = ?report.elapsed,
        "Load run finished"
    );
    Ok(report)
}

/// Resolve `host`, IPv4 addresses first.
///
/// The server binds `0.0.0.0` by default, so `localhost` must not land on
/// `::1` first.
async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, LoadError> {
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| LoadError::Resolve(target.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(LoadError::Resolve(target));
    }
    Ok(ipv4_first(addrs))
}

fn ipv4_first(mut addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    addrs.sort_by_key(SocketAddr::is_ipv6);
    addrs
}

/// One simulated user.
struct UserLoop {
    user: usize,
    config: Arc<LoadConfig>,
    target: TaskTarget,
    deadline: Option<Instant>,
    events: mpsc::Sender<RequestEvent>,
    stop: watch::Receiver<bool>,
    rng: fastrand::Rng,
}

impl UserLoop {
    async fn run(mut self) {
        let mut iteration = 0u64;

        while !self.finished(iteration) {
            let kind = self.pick_task();
            let lines = kind.lines(self.rng.usize(self.config.min_lines..=self.config.max_lines));
            let event = task::execute(&self.target, kind, &lines).await;

            if self.events.send(event).await.is_err() {
                break;
            }
            iteration += 1;

            if self.finished(iteration) {
                break;
            }
            self.pause().await;
        }

        debug!(user = self.user, iterations = iteration, "User finished");
    }

    fn finished(&self, iteration: u64) -> bool {
        *self.stop.borrow()
            || self.config.iterations.is_some_and(|max| iteration >= max)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn pick_task(&mut self) -> TaskKind {
        let short = u64::from(self.config.short_weight);
        let total = short + u64::from(self.config.long_weight);
        if self.rng.u64(0..total) < short {
            TaskKind::Short
        } else {
            TaskKind::Long
        }
    }

    /// Sleep for a random wait, cut short by the deadline or a stop request.
    ///
    /// A dropped stop sender disables the stop branch; the sleep still runs.
    async fn pause(&mut self) {
        let min = self.config.min_wait.as_millis() as u64;
        let max = self.config.max_wait.as_millis() as u64;
        let mut until = Instant::now() + Duration::from_millis(self.rng.u64(min..=max));
        if let Some(deadline) = self.deadline {
            until = until.min(deadline);
        }

        tokio::select! {
            _ = tokio::time::sleep_until(until) => {}
            Ok(()) = self.stop.changed() => {}
        }
    }
}
