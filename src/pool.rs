//! Worker pool: keeps `max_conn` tunnel workers alive against the broker.
//!
//! A single pool task owns the worker set, so dead-worker handling is
//! serialized by construction: two deaths can never race two replacements
//! past the ceiling. Replacements are paced by a doubling backoff that
//! resets whenever any worker manages to open, and are scheduled through
//! timer tasks whose wakeups re-check the ceiling and the closed flag
//! before anything spawns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::acquire::Session;
use crate::config::TunnelConfig;
use crate::constants::{RECONNECT_DELAY_INITIAL, RECONNECT_DELAY_MAX};
use crate::dump::DumpHandle;
use crate::error::TunnelError;
use crate::events::{WorkerEvent, WorkerId};
use crate::local::LocalConnector;
use crate::worker::{self, RetryLimits, WorkerContext};

/// Events the pool sends to the orchestrator.
#[derive(Debug, Clone)]
pub(crate) enum PoolEvent {
    /// A worker connected to the broker.
    Open {
        /// The worker that opened.
        id: WorkerId,
    },
    /// A request line crossed some worker.
    Request {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
    },
    /// A worker surfaced an error the user should see.
    Error {
        /// The error value.
        error: TunnelError,
    },
    /// All workers died and none may be replaced.
    Exit,
    /// The pool finished closing; sockets and timers are gone.
    Closed,
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub(crate) struct TunnelPool {
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl TunnelPool {
    /// Spawn the pool task and open `session.max_conn` workers.
    pub fn open(
        session: Arc<Session>,
        connector: Arc<LocalConnector>,
        config: &TunnelConfig,
        dump: Option<DumpHandle>,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let task = PoolTask {
            template: WorkerContext {
                session: Arc::clone(&session),
                connector,
                rewrite_host: config.local_host.clone(),
                local_reconnect: config.local_reconnect,
                limits: RetryLimits::from_config(config),
                events: worker_tx,
                dump,
                cancel: cancel.child_token(),
            },
            max_conn: usize::from(session.max_conn),
            workers: HashMap::new(),
            next_id: 0,
            pending_replacements: 0,
            reconnect: ReconnectBackoff::new(),
            worker_rx,
            timer_tx,
            timer_rx,
            events,
            cancel: cancel.clone(),
            closed: Arc::clone(&closed),
        };
        tokio::spawn(task.run());

        Self { cancel, closed }
    }

    /// Close the pool: no new workers, all sockets destroyed, timers
    /// no-op on wake. Safe to call at any time, any number of times.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }
}

struct PoolTask {
    template: WorkerContext,
    max_conn: usize,
    workers: HashMap<WorkerId, JoinHandle<()>>,
    next_id: WorkerId,
    pending_replacements: usize,
    reconnect: ReconnectBackoff,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    timer_tx: mpsc::UnboundedSender<()>,
    timer_rx: mpsc::UnboundedReceiver<()>,
    events: mpsc::UnboundedSender<PoolEvent>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl PoolTask {
    async fn run(mut self) {
        info!("[Pool] Opening {} tunnel connections", self.max_conn);
        for _ in 0..self.max_conn {
            self.spawn_worker();
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = self.worker_rx.recv() => {
                    if self.handle_worker_event(event) {
                        break;
                    }
                }
                Some(()) = self.timer_rx.recv() => self.handle_replacement_wakeup(),
            }
        }

        // Teardown: dropping the broker and local sockets is how they die.
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        for (_, handle) in self.workers.drain() {
            handle.abort();
        }
        debug!("[Pool] Closed");
        let _ = self.events.send(PoolEvent::Closed);
    }

    /// React to one worker event; returns true when the pool must exit.
    fn handle_worker_event(&mut self, event: WorkerEvent) -> bool {
        match event {
            WorkerEvent::Open { id } => {
                debug!("[Pool] Worker {id} open, backoff reset");
                self.reconnect.reset();
                let _ = self.events.send(PoolEvent::Open { id });
            }
            WorkerEvent::Request { method, path } => {
                let _ = self.events.send(PoolEvent::Request { method, path });
            }
            WorkerEvent::Error { error } => {
                let _ = self.events.send(PoolEvent::Error { error });
            }
            WorkerEvent::Dead { id, retriable } => {
                self.workers.remove(&id);
                debug!(
                    "[Pool] Worker {id} dead (retriable: {retriable}), {} remaining",
                    self.workers.len()
                );
                if retriable {
                    self.schedule_replacement();
                } else if self.workers.is_empty() && self.pending_replacements == 0 {
                    info!("[Pool] All tunnels dead, shutting down");
                    let _ = self.events.send(PoolEvent::Exit);
                    return true;
                }
            }
        }
        false
    }

    /// Queue a replacement after the current reconnect delay.
    fn schedule_replacement(&mut self) {
        if self.closed.load(Ordering::SeqCst)
            || self.workers.len() + self.pending_replacements >= self.max_conn
        {
            return;
        }
        let delay = self.reconnect.next();
        debug!("[Pool] Replacement in {}ms", delay.as_millis());
        self.pending_replacements += 1;

        let timer_tx = self.timer_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = timer_tx.send(());
                }
            }
        });
    }

    /// A replacement timer fired: re-check conditions, then spawn.
    fn handle_replacement_wakeup(&mut self) {
        self.pending_replacements = self.pending_replacements.saturating_sub(1);
        if self.closed.load(Ordering::SeqCst) || self.workers.len() >= self.max_conn {
            return;
        }
        self.spawn_worker();
    }

    fn spawn_worker(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let handle = worker::spawn(id, self.template.clone());
        self.workers.insert(id, handle);
    }
}

/// Doubling delay between a worker death and its replacement.
#[derive(Debug)]
struct ReconnectBackoff {
    delay: Duration,
}

impl ReconnectBackoff {
    fn new() -> Self {
        Self {
            delay: RECONNECT_DELAY_INITIAL,
        }
    }

    /// Current delay; doubles (capped) for the next caller.
    fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(RECONNECT_DELAY_MAX);
        delay
    }

    /// Back to the initial delay, called on any successful worker open.
    fn reset(&mut self) {
        self.delay = RECONNECT_DELAY_INITIAL;
    }
}
