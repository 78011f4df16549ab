//! Error taxonomy for the tunnel client.
//!
//! Synchronous failures (bad configuration, broker rejections during
//! acquisition) are returned as `Result`s; failures that happen while the
//! tunnel is running cross the event channel by value, so every variant is
//! cheap to clone and carries owned strings rather than source errors.

use thiserror::Error;

/// Errors surfaced by the tunnel client.
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    /// A user-supplied option failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The broker answered with a non-429 4xx during acquisition.
    #[error("broker rejected the request ({status}): {message}")]
    ServerRejected {
        /// HTTP status code returned by the broker.
        status: u16,
        /// Server-provided message, plus guidance for 403/409.
        message: String,
    },

    /// The broker answered 429 during acquisition.
    #[error("broker at capacity: {message}")]
    ServerThrottled {
        /// Server message joined with any capacity detail headers.
        message: String,
    },

    /// The broker kept answering 5xx until the retry budget ran out.
    #[error("broker unavailable after {attempts} retries")]
    ServerUnavailable {
        /// Number of attempts that were made.
        attempts: u32,
    },

    /// TCP connect to the broker's tunnel port was refused.
    #[error("connection refused to broker at {addr}")]
    BrokerUnreachable {
        /// The `host:port` the worker tried to dial.
        addr: String,
    },

    /// The local service stayed unreachable beyond the retry caps.
    #[error("local service on port {port} gave up after {failures} failures")]
    LocalGone {
        /// Configured local port.
        port: u16,
        /// Failure count at the moment the worker gave up.
        failures: u32,
    },

    /// The broker returned something the client could not interpret.
    #[error("unexpected broker response: {0}")]
    UnexpectedResponse(String),
}

impl TunnelError {
    /// Shorthand for a `ConfigInvalid` with a formatted message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid(message.into())
    }
}
