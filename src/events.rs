//! Tunnel lifecycle events.
//!
//! Two layers of events flow through the client:
//!
//! - [`WorkerEvent`] - emitted by individual workers, consumed by the pool
//! - [`TunnelEvent`] - emitted by the orchestrator, consumed by the CLI or
//!   an embedding application
//!
//! Events are sent via `tokio::sync::mpsc` unbounded channels and cross the
//! boundary by value; workers never hand out references into their own state.

use crate::error::TunnelError;

/// Identifier for a worker within its pool.
pub type WorkerId = u32;

/// Events emitted by a single tunnel worker toward the pool.
#[derive(Debug, Clone)]
pub(crate) enum WorkerEvent {
    /// The broker-facing socket connected.
    Open {
        /// Worker that connected.
        id: WorkerId,
    },

    /// The worker reached its terminal state. Emitted exactly once.
    Dead {
        /// Worker that died.
        id: WorkerId,
        /// Whether the pool may open a replacement.
        retriable: bool,
    },

    /// A request line was observed on the broker socket.
    Request {
        /// HTTP method, e.g. `GET`.
        method: String,
        /// Request path, e.g. `/index.html`.
        path: String,
    },

    /// An unrecoverable broker-side error the user should see.
    Error {
        /// The error value.
        error: TunnelError,
    },
}

/// Events emitted by the tunnel toward the library user.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The first worker connected; the tunnel is reachable.
    Url {
        /// Canonical public URL, e.g. `https://abc.example.org`.
        url: String,
        /// Secondary URL served by a caching front, when the broker has one.
        cached_url: Option<String>,
    },

    /// A public request was routed through the tunnel.
    Request {
        /// HTTP method, e.g. `GET`.
        method: String,
        /// Request path, e.g. `/index.html`.
        path: String,
    },

    /// An unrecoverable broker-side error.
    Error {
        /// The error value.
        error: TunnelError,
    },

    /// `close()` completed; no further events will arrive.
    Close,

    /// Every worker died and none may be replaced.
    Exit {
        /// Process-style exit code (non-zero).
        code: i32,
        /// Machine-readable reason, e.g. `all_tunnels_dead`.
        reason: String,
    },
}

impl TunnelEvent {
    /// Create an exit event for a drained pool.
    #[must_use]
    pub fn all_tunnels_dead() -> Self {
        Self::Exit {
            code: 1,
            reason: "all_tunnels_dead".to_string(),
        }
    }

    /// Check if this is a close event.
    #[must_use]
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close)
    }

    /// Check if this is an exit event.
    #[must_use]
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tunnels_dead_shape() {
        match TunnelEvent::all_tunnels_dead() {
            TunnelEvent::Exit { code, reason } => {
                assert_ne!(code, 0);
                assert_eq!(reason, "all_tunnels_dead");
            }
            other => panic!("Expected Exit variant, got {other:?}"),
        }
    }

    #[test]
    fn test_predicates() {
        assert!(TunnelEvent::Close.is_close());
        assert!(!TunnelEvent::Close.is_exit());
        assert!(TunnelEvent::all_tunnels_dead().is_exit());
    }

    #[test]
    fn test_events_cross_channels_by_value() {
        let event = TunnelEvent::Request {
            method: "GET".to_string(),
            path: "/x".to_string(),
        };
        let cloned = event.clone();
        match cloned {
            TunnelEvent::Request { method, path } => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/x");
            }
            other => panic!("Expected Request variant, got {other:?}"),
        }
    }
}
