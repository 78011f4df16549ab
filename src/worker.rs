//! A single tunnel worker: one broker socket, at most one local socket.
//!
//! Lifecycle: dial the broker, announce `open`, dial the local service,
//! pipe bytes both ways, and either survive local-side trouble through the
//! retry policy or die exactly once. The `dead` event has a single emission
//! point - the task wrapper - so no code path can emit it twice.
//!
//! Broker-to-local bytes pass through the [`RequestScanner`] for Host
//! rewriting and request-line observation; chunks carrying the broker's
//! `X-LT-Source: server` marker are control messages and are dropped whole,
//! unforwarded and undumped.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::acquire::Session;
use crate::config::TunnelConfig;
use crate::constants::{
    FAILURE_CAP_ABSOLUTE, FAILURE_WINDOW, LOCAL_RETRY_BACKOFF_FACTOR, LOCAL_RETRY_DELAY_INITIAL,
    LOCAL_RETRY_DELAY_MAX, PIPE_CHUNK_SIZE,
};
use crate::dump::{Direction, DumpHandle};
use crate::error::TunnelError;
use crate::events::{WorkerEvent, WorkerId};
use crate::local::LocalConnector;
use crate::rewrite::RequestScanner;

/// Broker-injected marker identifying a control frame.
const SERVER_FRAME_MARKER: &[u8] = b"\r\nx-lt-source: server\r\n";

/// Everything a worker needs, shared by the pool across spawns.
#[derive(Debug, Clone)]
pub(crate) struct WorkerContext {
    /// Session granted by the broker.
    pub session: Arc<Session>,
    /// Dialer for the local service.
    pub connector: Arc<LocalConnector>,
    /// Hostname to rewrite `Host:` headers to, when configured.
    pub rewrite_host: Option<String>,
    /// Whether a local-side closure may be retried at all.
    pub local_reconnect: bool,
    /// Caps for the local retry policy.
    pub limits: RetryLimits,
    /// Event channel toward the pool.
    pub events: tokio::sync::mpsc::UnboundedSender<WorkerEvent>,
    /// Traffic observer, when dumping is configured.
    pub dump: Option<DumpHandle>,
    /// Pool-wide close signal.
    pub cancel: CancellationToken,
}

/// How a worker task ended.
enum Outcome {
    /// Terminal death; `retriable` tells the pool whether to replace.
    Dead {
        /// Whether the pool may open a replacement.
        retriable: bool,
    },
    /// The pool was closed; nothing to report.
    Cancelled,
}

/// Spawn one worker task.
pub(crate) fn spawn(id: WorkerId, ctx: WorkerContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Sole emission point for `dead`.
        if let Outcome::Dead { retriable } = run(id, &ctx).await {
            let _ = ctx.events.send(WorkerEvent::Dead { id, retriable });
        }
    })
}

async fn run(id: WorkerId, ctx: &WorkerContext) -> Outcome {
    // --- Dialing remote ---------------------------------------------------
    let addr = (ctx.session.dial_host().to_string(), ctx.session.remote_port);
    let remote = tokio::select! {
        _ = ctx.cancel.cancelled() => return Outcome::Cancelled,
        result = TcpStream::connect(addr) => match result {
            Ok(stream) => stream,
            Err(e) => {
                if e.kind() == io::ErrorKind::ConnectionRefused {
                    let _ = ctx.events.send(WorkerEvent::Error {
                        error: TunnelError::BrokerUnreachable {
                            addr: ctx.session.dial_addr(),
                        },
                    });
                } else {
                    warn!("[Worker {id}] Broker dial failed: {e}");
                }
                return Outcome::Dead { retriable: true };
            }
        },
    };
    set_keepalive(&remote, id);

    // --- Open -------------------------------------------------------------
    debug!("[Worker {id}] Connected to broker at {}", ctx.session.dial_addr());
    let _ = ctx.events.send(WorkerEvent::Open { id });

    let (mut remote_read, mut remote_write) = remote.into_split();
    let mut scanner = RequestScanner::new(ctx.rewrite_host.clone());
    let mut retry = RetryPolicy::new(ctx.limits);

    loop {
        // --- Dialing local ------------------------------------------------
        // Reads on the broker socket stay paused until the local side is up.
        let local = loop {
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => return Outcome::Cancelled,
                result = ctx.connector.connect() => result,
            };
            match result {
                Ok(stream) => break stream,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    let decision = if e.kind() == io::ErrorKind::ConnectionRefused {
                        retry.on_refused(Instant::now())
                    } else {
                        retry.on_reset(Instant::now())
                    };
                    match decision {
                        RetryDecision::RetryAfter(delay) => {
                            debug!(
                                "[Worker {id}] Local service not ready ({e}), retrying in {}ms",
                                delay.as_millis()
                            );
                            tokio::select! {
                                _ = ctx.cancel.cancelled() => return Outcome::Cancelled,
                                () = tokio::time::sleep(delay) => {}
                            }
                        }
                        RetryDecision::GiveUp => return give_up(id, ctx, &retry),
                    }
                }
                Err(e) => {
                    warn!("[Worker {id}] Local dial failed: {e}");
                    return Outcome::Dead { retriable: true };
                }
            }
        };
        retry.on_success();
        scanner.reset();
        debug!(
            "[Worker {id}] Piping broker <-> {}:{}",
            ctx.connector.host(),
            ctx.connector.port()
        );

        // --- Piping -------------------------------------------------------
        match pipe(id, ctx, &mut remote_read, &mut remote_write, local, &mut scanner).await {
            PipeEnd::LocalClean => {
                if !ctx.local_reconnect {
                    debug!("[Worker {id}] Local side closed, reconnect disabled");
                    return Outcome::Dead { retriable: false };
                }
                // Clean close: reconnect immediately.
            }
            PipeEnd::LocalError(e) => {
                if !ctx.local_reconnect {
                    debug!("[Worker {id}] Local side failed ({e}), reconnect disabled");
                    return Outcome::Dead { retriable: false };
                }
                match retry.on_dropped(Instant::now()) {
                    RetryDecision::RetryAfter(delay) => {
                        debug!(
                            "[Worker {id}] Local connection dropped ({e}), retrying in {}ms",
                            delay.as_millis()
                        );
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => return Outcome::Cancelled,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    RetryDecision::GiveUp => return give_up(id, ctx, &retry),
                }
            }
            PipeEnd::RemoteClosed => {
                debug!("[Worker {id}] Broker closed the connection");
                return Outcome::Dead { retriable: true };
            }
            PipeEnd::RemoteError(e) => {
                warn!("[Worker {id}] Broker connection error: {e}");
                return Outcome::Dead { retriable: true };
            }
            PipeEnd::Cancelled => return Outcome::Cancelled,
        }
    }
}

/// Local service judged hopeless: log it and die non-retriably.
fn give_up(id: WorkerId, ctx: &WorkerContext, retry: &RetryPolicy) -> Outcome {
    warn!(
        "[Worker {id}] Giving up on local service after {} failures",
        retry.total_failures()
    );
    let _ = ctx.events.send(WorkerEvent::Error {
        error: TunnelError::LocalGone {
            port: ctx.connector.port(),
            failures: retry.total_failures(),
        },
    });
    Outcome::Dead { retriable: false }
}

/// Why one piping session ended.
enum PipeEnd {
    /// Local side closed cleanly (EOF).
    LocalClean,
    /// Local side read or write failed.
    LocalError(io::Error),
    /// Broker side closed cleanly (EOF).
    RemoteClosed,
    /// Broker side read or write failed.
    RemoteError(io::Error),
    /// Pool close signal observed.
    Cancelled,
}

async fn pipe(
    id: WorkerId,
    ctx: &WorkerContext,
    remote_read: &mut OwnedReadHalf,
    remote_write: &mut OwnedWriteHalf,
    local: crate::local::LocalStream,
    scanner: &mut RequestScanner,
) -> PipeEnd {
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let mut remote_buf = vec![0u8; PIPE_CHUNK_SIZE];
    let mut local_buf = vec![0u8; PIPE_CHUNK_SIZE];

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return PipeEnd::Cancelled,

            result = remote_read.read(&mut remote_buf) => match result {
                Ok(0) => return PipeEnd::RemoteClosed,
                Ok(n) => {
                    let chunk = &remote_buf[..n];
                    if contains_server_frame(chunk) {
                        debug!("[Worker {id}] Dropped broker control frame ({n} bytes)");
                        continue;
                    }
                    let (forward, requests) = scanner.feed(chunk);
                    for request in requests {
                        let _ = ctx.events.send(WorkerEvent::Request {
                            method: request.method,
                            path: request.path,
                        });
                    }
                    if !forward.is_empty() {
                        if let Err(e) = local_write.write_all(&forward).await {
                            return PipeEnd::LocalError(e);
                        }
                        if let Some(dump) = &ctx.dump {
                            dump.observe(id, Direction::Request, &forward);
                        }
                    }
                }
                Err(e) => return PipeEnd::RemoteError(e),
            },

            result = local_read.read(&mut local_buf) => match result {
                Ok(0) => return PipeEnd::LocalClean,
                Ok(n) => {
                    if let Err(e) = remote_write.write_all(&local_buf[..n]).await {
                        return PipeEnd::RemoteError(e);
                    }
                    if let Some(dump) = &ctx.dump {
                        dump.observe(id, Direction::Response, &local_buf[..n]);
                    }
                }
                Err(e) => return PipeEnd::LocalError(e),
            },
        }
    }
}

/// True when a read chunk carries the broker's control-frame marker.
fn contains_server_frame(chunk: &[u8]) -> bool {
    if chunk.len() < SERVER_FRAME_MARKER.len() {
        return false;
    }
    chunk
        .windows(SERVER_FRAME_MARKER.len())
        .any(|window| window.eq_ignore_ascii_case(SERVER_FRAME_MARKER))
}

/// Enable TCP keep-alive; the broker holds these sockets open indefinitely.
fn set_keepalive(stream: &TcpStream, id: WorkerId) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_keepalive(true) {
        debug!("[Worker {id}] Cannot enable keep-alive: {e}");
    }
}

/// Caps for the local retry policy, derived from the configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryLimits {
    /// Ceiling on consecutive failures of any kind.
    pub consecutive_max: u32,
    /// Ceiling on connection-refused failures.
    pub refused_max: u32,
    /// Looser ceiling on drops of established connections.
    pub dropped_max: u32,
    /// Failure count within [`FAILURE_WINDOW`] that trips the window.
    pub window_max: u32,
    /// Lifetime failure ceiling.
    pub absolute_max: u32,
}

impl RetryLimits {
    /// Derive the caps from a configuration.
    pub fn from_config(config: &TunnelConfig) -> Self {
        let max = config.effective_local_retry_max();
        Self {
            consecutive_max: max,
            refused_max: max,
            dropped_max: max * 2,
            window_max: max * 3,
            absolute_max: FAILURE_CAP_ABSOLUTE,
        }
    }
}

/// Outcome of recording one local-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// Try again after this delay.
    RetryAfter(Duration),
    /// A cap was reached; the worker must die non-retriably.
    GiveUp,
}

/// Per-worker failure accounting for the local service.
///
/// Three counters distinguish "service not up" (`refused`) from "service
/// flapping" (`dropped`), a sliding window catches flapping that successful
/// connects would otherwise hide from the consecutive counter, and an
/// absolute cap bounds the worker's lifetime failure budget.
#[derive(Debug)]
pub(crate) struct RetryPolicy {
    limits: RetryLimits,
    consecutive_failures: u32,
    refused_count: u32,
    dropped_count: u32,
    total_failures: u32,
    window: VecDeque<Instant>,
    delay: Duration,
}

impl RetryPolicy {
    /// Fresh policy with all counters at zero.
    pub fn new(limits: RetryLimits) -> Self {
        Self {
            limits,
            consecutive_failures: 0,
            refused_count: 0,
            dropped_count: 0,
            total_failures: 0,
            window: VecDeque::new(),
            delay: LOCAL_RETRY_DELAY_INITIAL,
        }
    }

    /// Record a connection-refused failure at dial time.
    pub fn on_refused(&mut self, now: Instant) -> RetryDecision {
        self.refused_count += 1;
        self.record(now)
    }

    /// Record a connection-reset failure at dial time.
    pub fn on_reset(&mut self, now: Instant) -> RetryDecision {
        self.record(now)
    }

    /// Record an error on an established local connection.
    pub fn on_dropped(&mut self, now: Instant) -> RetryDecision {
        self.dropped_count += 1;
        self.record(now)
    }

    /// A connect succeeded: reset the counters and the backoff delay.
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.refused_count = 0;
        self.dropped_count = 0;
        self.delay = LOCAL_RETRY_DELAY_INITIAL;
    }

    /// Lifetime failure count, for diagnostics.
    pub fn total_failures(&self) -> u32 {
        self.total_failures
    }

    fn record(&mut self, now: Instant) -> RetryDecision {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        self.window.push_back(now);
        while let Some(first) = self.window.front() {
            if now.duration_since(*first) > FAILURE_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }

        if self.total_failures >= self.limits.absolute_max
            || self.window.len() as u32 >= self.limits.window_max
            || self.consecutive_failures >= self.limits.consecutive_max
            || self.refused_count >= self.limits.refused_max
            || self.dropped_count >= self.limits.dropped_max
        {
            return RetryDecision::GiveUp;
        }

        let delay = self.delay;
        self.delay = Duration::from_millis(
            ((self.delay.as_millis() as f64 * LOCAL_RETRY_BACKOFF_FACTOR) as u64)
                .min(LOCAL_RETRY_DELAY_MAX.as_millis() as u64),
        );
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: u32) -> RetryLimits {
        RetryLimits {
            consecutive_max: max,
            refused_max: max,
            dropped_max: max * 2,
            window_max: max * 3,
            absolute_max: FAILURE_CAP_ABSOLUTE,
        }
    }

    #[test]
    fn test_server_frame_marker_detected() {
        assert!(contains_server_frame(
            b"GET /ping HTTP/1.1\r\nX-LT-Source: server\r\n\r\n"
        ));
        assert!(contains_server_frame(
            b"GET /ping HTTP/1.1\r\nx-lt-source: SERVER\r\n\r\n"
        ));
        assert!(!contains_server_frame(
            b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n"
        ));
        assert!(!contains_server_frame(b""));
    }

    #[test]
    fn test_gives_up_after_exactly_n_refusals() {
        let mut retry = RetryPolicy::new(limits(3));
        let now = Instant::now();
        assert!(matches!(
            retry.on_refused(now),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            retry.on_refused(now),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(retry.on_refused(now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_sequence_grows_and_caps() {
        let mut retry = RetryPolicy::new(limits(100));
        let now = Instant::now();

        let mut delays = Vec::new();
        for _ in 0..8 {
            match retry.on_reset(now) {
                RetryDecision::RetryAfter(d) => delays.push(d.as_millis() as u64),
                RetryDecision::GiveUp => panic!("Gave up too early"),
            }
        }
        assert_eq!(delays[..6], [1000, 1500, 2250, 3375, 5062, 7593]);
        // Capped from here on.
        assert_eq!(delays[6], 10_000);
        assert_eq!(delays[7], 10_000);
    }

    #[test]
    fn test_success_resets_counters_and_delay() {
        let mut retry = RetryPolicy::new(limits(3));
        let now = Instant::now();
        let _ = retry.on_refused(now);
        let _ = retry.on_refused(now);
        retry.on_success();

        // Counters are back to zero: two more refusals do not give up.
        assert!(matches!(
            retry.on_refused(now),
            RetryDecision::RetryAfter(d) if d == LOCAL_RETRY_DELAY_INITIAL
        ));
        assert!(matches!(
            retry.on_refused(now),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn test_dropped_cap_binds_at_double() {
        let mut retry = RetryPolicy::new(RetryLimits {
            consecutive_max: 100,
            refused_max: 100,
            dropped_max: 3,
            window_max: 100,
            absolute_max: 100,
        });
        let now = Instant::now();
        assert!(matches!(retry.on_dropped(now), RetryDecision::RetryAfter(_)));
        assert!(matches!(retry.on_dropped(now), RetryDecision::RetryAfter(_)));
        assert_eq!(retry.on_dropped(now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_drops_count_toward_consecutive_cap() {
        let mut retry = RetryPolicy::new(limits(2));
        let now = Instant::now();
        assert!(matches!(retry.on_dropped(now), RetryDecision::RetryAfter(_)));
        assert_eq!(retry.on_dropped(now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_absolute_cap_trips_despite_successes() {
        let mut retry = RetryPolicy::new(RetryLimits {
            consecutive_max: 1000,
            refused_max: 1000,
            dropped_max: 1000,
            window_max: 1000,
            absolute_max: FAILURE_CAP_ABSOLUTE,
        });
        let now = Instant::now();
        let mut tripped_at = None;
        for i in 0..(FAILURE_CAP_ABSOLUTE + 1) {
            if retry.on_reset(now) == RetryDecision::GiveUp {
                tripped_at = Some(i + 1);
                break;
            }
            // A success between every failure keeps per-counter caps clear.
            retry.on_success();
        }
        assert_eq!(tripped_at, Some(FAILURE_CAP_ABSOLUTE));
    }

    #[test]
    fn test_window_cap_trips_on_flapping() {
        let max = 4;
        let mut retry = RetryPolicy::new(limits(max));
        let now = Instant::now();
        let mut tripped_at = None;
        for i in 0..(max * 3 + 1) {
            if retry.on_reset(now) == RetryDecision::GiveUp {
                tripped_at = Some(i + 1);
                break;
            }
            retry.on_success();
        }
        assert_eq!(tripped_at, Some(max * 3));
    }
}
