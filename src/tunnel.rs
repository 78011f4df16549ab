//! Tunnel orchestration: the public entry point.
//!
//! [`Tunnel::open`] validates credentials, acquires a session from the
//! broker and starts the worker pool. The returned handle exposes the
//! session parameters, a stream of [`TunnelEvent`]s, and a single idempotent
//! [`close`](Tunnel::close) signal.
//!
//! Synchronous failures (bad configuration, broker rejections) come back as
//! the `open` error; everything that happens while the tunnel runs arrives
//! as events.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::acquire::{self, Session};
use crate::config::TunnelConfig;
use crate::dump;
use crate::error::TunnelError;
use crate::events::TunnelEvent;
use crate::local::LocalConnector;
use crate::pool::{PoolEvent, TunnelPool};
use crate::signer::Signer;

/// A running tunnel: a session on the broker plus its worker pool.
#[derive(Debug)]
pub struct Tunnel {
    session: Arc<Session>,
    pool: TunnelPool,
    events: mpsc::UnboundedReceiver<TunnelEvent>,
}

impl Tunnel {
    /// Validate the configuration, acquire a session and start the pool.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` for bad credentials or TLS material,
    /// `ServerRejected` / `ServerThrottled` / `ServerUnavailable` for broker
    /// refusals during acquisition.
    pub async fn open(config: TunnelConfig) -> Result<Self, TunnelError> {
        // Credential and TLS validation first, so errors surface before any
        // network traffic.
        let signer = Signer::from_config(&config)?;
        let connector = Arc::new(LocalConnector::from_config(&config)?);

        let client = reqwest::Client::new();
        let session = Arc::new(acquire::acquire(&client, &config, &signer).await?);

        let dump = config
            .dump_dir
            .clone()
            .map(|dir| dump::spawn(dir, session.id.clone()));

        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let pool = TunnelPool::open(
            Arc::clone(&session),
            connector,
            &config,
            dump,
            pool_tx,
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(relay(Arc::clone(&session), pool_rx, event_tx));

        Ok(Self {
            session,
            pool,
            events: event_rx,
        })
    }

    /// Canonical public URL of this tunnel.
    pub fn url(&self) -> &str {
        &self.session.url
    }

    /// Secondary URL served by a caching front, when the broker has one.
    pub fn cached_url(&self) -> Option<&str> {
        self.session.cached_url.as_deref()
    }

    /// Assigned subdomain / client identifier.
    pub fn id(&self) -> &str {
        &self.session.id
    }

    /// Receive the next lifecycle event. Returns `None` after the
    /// [`TunnelEvent::Close`] event has been delivered.
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        self.events.recv().await
    }

    /// Close the tunnel: tear down every worker and stop all timers.
    /// Idempotent and safe to call at any time; a [`TunnelEvent::Close`]
    /// arrives once teardown completes.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Translate pool events into the public event vocabulary.
async fn relay(
    session: Arc<Session>,
    mut pool_rx: mpsc::UnboundedReceiver<PoolEvent>,
    events: mpsc::UnboundedSender<TunnelEvent>,
) {
    let mut announced = false;
    while let Some(event) = pool_rx.recv().await {
        let mapped = match event {
            PoolEvent::Open { .. } => {
                if announced {
                    None
                } else {
                    announced = true;
                    Some(TunnelEvent::Url {
                        url: session.url.clone(),
                        cached_url: session.cached_url.clone(),
                    })
                }
            }
            PoolEvent::Request { method, path } => Some(TunnelEvent::Request { method, path }),
            PoolEvent::Error { error } => Some(TunnelEvent::Error { error }),
            PoolEvent::Exit => Some(TunnelEvent::all_tunnels_dead()),
            PoolEvent::Closed => {
                let _ = events.send(TunnelEvent::Close);
                break;
            }
        };
        if let Some(event) = mapped {
            if events.send(event).is_err() {
                break;
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.pool.close();
    }
}
