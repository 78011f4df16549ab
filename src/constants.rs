//! Application-wide constants for the tunnel client.
//!
//! This module centralizes all magic numbers and configuration constants
//! to improve maintainability and discoverability. Constants are grouped
//! by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Identity**: User-Agent and default broker
//! - **Acquisition**: retry pacing for the broker HTTP call
//! - **Pool**: reconnect backoff between worker deaths and replacements
//! - **Worker**: local-side retry backoff and failure caps

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// User-Agent header sent with the acquisition request.
///
/// Includes the client version so the broker can track which versions are in
/// the wild and gate compatibility if needed.
pub fn user_agent() -> String {
    format!("localtunnel-rs/{}", env!("CARGO_PKG_VERSION"))
}

/// Default broker base URL when none is configured.
pub const DEFAULT_BROKER_URL: &str = "https://localtunnel.me";

// ============================================================================
// Acquisition
// ============================================================================

/// Delay between acquisition attempts (5xx responses and network failures).
pub const ACQUIRE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Total attempts made against a broker answering 5xx before giving up.
pub const ACQUIRE_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// Pool reconnect backoff
// ============================================================================

/// Initial delay before replacing a dead worker.
pub const RECONNECT_DELAY_INITIAL: Duration = Duration::from_millis(1000);

/// Ceiling for the doubling replacement delay.
pub const RECONNECT_DELAY_MAX: Duration = Duration::from_millis(30_000);

// ============================================================================
// Worker local-side retry
// ============================================================================

/// Initial delay between attempts to reach the local service.
pub const LOCAL_RETRY_DELAY_INITIAL: Duration = Duration::from_millis(1000);

/// Ceiling for the growing local retry delay.
pub const LOCAL_RETRY_DELAY_MAX: Duration = Duration::from_millis(10_000);

/// Growth factor applied to the local retry delay after each failure.
pub const LOCAL_RETRY_BACKOFF_FACTOR: f64 = 1.5;

/// Consecutive/refused failure ceiling when the user does not configure one.
pub const DEFAULT_LOCAL_RETRY_MAX: u32 = 10;

/// Width of the sliding window used to detect a flapping local service.
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Total local failures a worker tolerates over its lifetime.
pub const FAILURE_CAP_ABSOLUTE: u32 = 50;

/// Read buffer size for the piping loops.
pub const PIPE_CHUNK_SIZE: usize = 16384;
