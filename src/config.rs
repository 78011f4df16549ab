//! Tunnel configuration.
//!
//! A [`TunnelConfig`] is built once (by the CLI wrapper or an embedding
//! application) and is immutable afterwards; the engine never mutates it.
//! Validation of credential fields happens in the signer when the tunnel
//! opens, so errors surface synchronously from the acquisition call.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{DEFAULT_BROKER_URL, DEFAULT_LOCAL_RETRY_MAX};

/// Configuration for a tunnel to one local service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TunnelConfig {
    /// TCP port of the local service.
    pub local_port: u16,
    /// Hostname to rewrite the `Host:` header to. `None` leaves headers
    /// untouched.
    pub local_host: Option<String>,
    /// Connect to the local service over TLS.
    pub local_tls: bool,
    /// PEM client certificate for mutual TLS to the local service.
    pub local_cert: Option<PathBuf>,
    /// PEM client key for mutual TLS to the local service.
    pub local_key: Option<PathBuf>,
    /// PEM CA bundle to verify the local service against.
    pub local_ca: Option<PathBuf>,
    /// Skip server-certificate verification on local TLS.
    pub local_insecure: bool,
    /// Base URL of the tunnel broker.
    pub broker_base_url: String,
    /// Requested subdomain; the broker assigns one when unset.
    pub subdomain: Option<String>,
    /// Opaque client identifier token, sent as `X-LT-Client-Token`.
    pub client_token: Option<String>,
    /// Shared key for HMAC request signing. Must be at least 32 bytes.
    pub hmac_secret: Option<String>,
    /// Reconnect to the local service after it closes or fails. When false,
    /// the first local-side closure is terminal for that worker.
    pub local_reconnect: bool,
    /// Per-worker ceiling on consecutive local-side failures. `0` means
    /// "use the default".
    pub local_retry_max: u32,
    /// Optional ceiling on concurrent broker connections, applied below the
    /// server-granted maximum.
    pub max_conn: Option<u8>,
    /// Directory to write request/response dumps into. Dumping is off when
    /// unset.
    pub dump_dir: Option<PathBuf>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            local_host: None,
            local_tls: false,
            local_cert: None,
            local_key: None,
            local_ca: None,
            local_insecure: false,
            broker_base_url: DEFAULT_BROKER_URL.to_string(),
            subdomain: None,
            client_token: None,
            hmac_secret: None,
            local_reconnect: true,
            local_retry_max: 0,
            max_conn: None,
            dump_dir: None,
        }
    }
}

impl TunnelConfig {
    /// Create a configuration for the given local port with all defaults.
    pub fn for_port(local_port: u16) -> Self {
        Self {
            local_port,
            ..Self::default()
        }
    }

    /// Effective consecutive-failure ceiling: the configured value, or the
    /// default when the field is zero.
    pub fn effective_local_retry_max(&self) -> u32 {
        if self.local_retry_max == 0 {
            DEFAULT_LOCAL_RETRY_MAX
        } else {
            self.local_retry_max
        }
    }

    /// Hostname workers dial for the local service.
    pub fn local_dial_host(&self) -> &str {
        self.local_host.as_deref().unwrap_or("localhost")
    }

    /// Acquisition path: `/<subdomain>` when one was requested, `/?new`
    /// otherwise. Also the PATH component of the HMAC signature input.
    pub fn acquire_path(&self) -> String {
        match &self.subdomain {
            Some(sub) => format!("/{sub}"),
            None => "/?new".to_string(),
        }
    }
}
