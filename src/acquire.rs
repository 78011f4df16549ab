//! Session acquisition from the tunnel broker.
//!
//! One signed `GET <broker>/<subdomain>` (or `GET <broker>/?new`) reserves a
//! slot and returns the parameters workers dial. Retry policy by response
//! class:
//!
//! - 2xx: parse and return
//! - 429: no retry; surface the server message plus capacity headers
//! - other 4xx: no retry; surface status and message (403/409 get a hint)
//! - 5xx: retry after 1 s, 3 attempts total
//! - network failure: retry every 1 s until success or the caller cancels
//!
//! HMAC signatures embed a fresh timestamp and nonce, so every attempt is
//! re-signed.

use log::{info, warn};
use serde::Deserialize;

use crate::config::TunnelConfig;
use crate::constants::{user_agent, ACQUIRE_MAX_ATTEMPTS, ACQUIRE_RETRY_DELAY};
use crate::error::TunnelError;
use crate::signer::Signer;

/// Tunnel slot parameters returned by the broker.
#[derive(Debug, Clone)]
pub struct Session {
    /// Assigned subdomain / client identifier.
    pub id: String,
    /// Canonical public URL.
    pub url: String,
    /// Secondary URL served by a caching front, when present.
    pub cached_url: Option<String>,
    /// Broker hostname workers fall back to when no IP was returned.
    pub remote_host: String,
    /// Broker IP, preferred for dialing when present.
    pub remote_ip: Option<String>,
    /// TCP port workers dial.
    pub remote_port: u16,
    /// Upper bound on simultaneous worker connections (at least 1).
    pub max_conn: u16,
}

impl Session {
    /// Host workers dial: the IP when the broker returned one, the broker
    /// hostname otherwise.
    pub fn dial_host(&self) -> &str {
        self.remote_ip.as_deref().unwrap_or(&self.remote_host)
    }

    /// `host:port` string for log and error messages.
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.dial_host(), self.remote_port)
    }
}

/// Success body of the acquisition call.
#[derive(Debug, Deserialize)]
struct AcquireResponse {
    id: String,
    #[serde(default)]
    ip: Option<String>,
    port: u16,
    max_conn_count: u16,
    url: String,
    #[serde(default)]
    cached_url: Option<String>,
}

/// Error body of the acquisition call.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Capacity detail headers a 429 response may carry, in surfacing order.
const CAPACITY_HEADERS: [(&str, &str); 4] = [
    ("X-LT-Max-Sockets", "Max allowed"),
    ("X-LT-Current-Sockets", "Currently connected"),
    ("X-LT-Available-Sockets", "Available"),
    ("X-LT-Waiting-Requests", "Waiting"),
];

/// Acquire a session from the broker, retrying per the policy above.
pub async fn acquire(
    client: &reqwest::Client,
    config: &TunnelConfig,
    signer: &Signer,
) -> Result<Session, TunnelError> {
    let base = config.broker_base_url.trim_end_matches('/');
    let path = config.acquire_path();
    let url = format!("{base}{path}");

    let mut server_errors = 0u32;
    loop {
        let mut request = client.get(&url).header("User-Agent", user_agent());
        // Fresh headers per attempt: the signature captures timestamp+nonce.
        for (name, value) in signer.headers("GET", &path, "") {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("[Acquire] Broker not reachable, retrying in 1s: {e}");
                tokio::time::sleep(ACQUIRE_RETRY_DELAY).await;
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            return parse_session(response, config).await;
        }
        if status.as_u16() == 429 {
            return Err(throttled(response).await);
        }
        if status.is_client_error() {
            return Err(rejected(response).await);
        }

        server_errors += 1;
        if server_errors >= ACQUIRE_MAX_ATTEMPTS {
            return Err(TunnelError::ServerUnavailable {
                attempts: server_errors,
            });
        }
        warn!(
            "[Acquire] Broker returned {status}, attempt {server_errors}/{ACQUIRE_MAX_ATTEMPTS}, retrying in 1s"
        );
        tokio::time::sleep(ACQUIRE_RETRY_DELAY).await;
    }
}

/// Parse a 2xx response into a [`Session`].
async fn parse_session(
    response: reqwest::Response,
    config: &TunnelConfig,
) -> Result<Session, TunnelError> {
    let remote_host = reqwest::Url::parse(&config.broker_base_url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .ok_or_else(|| {
            TunnelError::config(format!(
                "broker base URL {:?} has no host",
                config.broker_base_url
            ))
        })?;

    let body: AcquireResponse = response
        .json()
        .await
        .map_err(|e| TunnelError::UnexpectedResponse(format!("invalid session body: {e}")))?;

    let mut max_conn = body.max_conn_count.max(1);
    if let Some(cap) = config.max_conn {
        max_conn = max_conn.min(u16::from(cap).max(1));
    }

    info!(
        "[Acquire] Session {} granted, up to {} connections to {}:{}",
        body.id,
        max_conn,
        body.ip.as_deref().unwrap_or(&remote_host),
        body.port
    );

    Ok(Session {
        id: body.id,
        url: body.url,
        cached_url: body.cached_url,
        remote_host,
        remote_ip: body.ip,
        remote_port: body.port,
        max_conn,
    })
}

/// Build the no-retry error for a 429 response.
async fn throttled(response: reqwest::Response) -> TunnelError {
    let mut parts = Vec::new();
    for (header, label) in CAPACITY_HEADERS {
        if let Some(value) = response
            .headers()
            .get(header)
            .and_then(|v| v.to_str().ok())
        {
            parts.push(format!("{label}: {value}"));
        }
    }

    let body: ErrorBody = response.json().await.unwrap_or_default();
    let mut message = body
        .message
        .unwrap_or_else(|| "too many connections".to_string());
    if !parts.is_empty() {
        message = format!("{message} | {}", parts.join(" | "));
    }

    TunnelError::ServerThrottled { message }
}

/// Build the no-retry error for a non-429 4xx response.
async fn rejected(response: reqwest::Response) -> TunnelError {
    let status = response.status().as_u16();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    let mut message = body
        .message
        .unwrap_or_else(|| "request rejected".to_string());

    match status {
        403 => {
            message = format!(
                "{message}\nHint: subdomains must be 4-63 lowercase alphanumeric characters or hyphens"
            );
        }
        409 => {
            message = format!("{message}\nHint: the subdomain is already in use, pick another");
        }
        _ => {}
    }

    TunnelError::ServerRejected { status, message }
}
