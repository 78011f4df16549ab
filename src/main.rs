//! localtunnel CLI - exposes a local HTTP service on a public URL.
//!
//! This is the thin binary entry point. See the `localtunnel` library
//! for the tunnel lifecycle engine.

use anyhow::Result;
use clap::Parser;
use localtunnel::{Tunnel, TunnelConfig, TunnelEvent};
use log::{error, info};
use mimalloc::MiMalloc;
use std::path::PathBuf;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Expose a local HTTP service on a public URL.
#[derive(Parser, Debug)]
#[command(name = "lt", version, about, long_about = None)]
struct Args {
    /// Port of the local service to expose.
    #[arg(short, long, env = "LT_PORT")]
    port: u16,

    /// Requested subdomain; the broker assigns one when omitted.
    #[arg(short, long, env = "LT_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Base URL of the tunnel broker.
    #[arg(long, env = "LT_HOST", default_value = "https://localtunnel.me")]
    host: String,

    /// Rewrite the Host header of forwarded requests to this hostname.
    #[arg(short = 'l', long)]
    local_host: Option<String>,

    /// Connect to the local service over HTTPS.
    #[arg(long)]
    local_https: bool,

    /// PEM client certificate for mutual TLS to the local service.
    #[arg(long, requires = "local_key")]
    local_cert: Option<PathBuf>,

    /// PEM client key for mutual TLS to the local service.
    #[arg(long, requires = "local_cert")]
    local_key: Option<PathBuf>,

    /// PEM CA bundle to verify the local service against.
    #[arg(long)]
    local_ca: Option<PathBuf>,

    /// Skip certificate verification on the local HTTPS connection.
    #[arg(long)]
    allow_invalid_cert: bool,

    /// Opaque client identifier token sent to the broker.
    #[arg(long, env = "LT_CLIENT_TOKEN")]
    client_token: Option<String>,

    /// Shared secret for HMAC-signing the acquisition request (min 32 bytes).
    #[arg(long, env = "LT_HMAC_SECRET")]
    hmac_secret: Option<String>,

    /// Directory to dump forwarded requests and responses into.
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Reconnect to the local service after it closes or fails.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    local_reconnect: bool,

    /// Consecutive local failures before a tunnel gives up (0 = default).
    #[arg(long, default_value_t = 0)]
    local_retry_max: u32,

    /// Cap on concurrent broker connections, below the server-granted max.
    #[arg(long)]
    max_conn: Option<u8>,
}

impl Args {
    fn into_config(self) -> TunnelConfig {
        TunnelConfig {
            local_port: self.port,
            local_host: self.local_host,
            local_tls: self.local_https,
            local_cert: self.local_cert,
            local_key: self.local_key,
            local_ca: self.local_ca,
            local_insecure: self.allow_invalid_cert,
            broker_base_url: self.host,
            subdomain: self.subdomain,
            client_token: self.client_token,
            hmac_secret: self.hmac_secret,
            local_reconnect: self.local_reconnect,
            local_retry_max: self.local_retry_max,
            max_conn: self.max_conn,
            dump_dir: self.dump_dir,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    let port = args.port;

    // Acquisition failures surface here and exit non-zero.
    let mut tunnel = Tunnel::open(args.into_config()).await?;
    info!("Tunnel {} forwarding to local port {port}", tunnel.id());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing tunnel");
                tunnel.close();
            }
            event = tunnel.next_event() => match event {
                Some(TunnelEvent::Url { url, cached_url }) => {
                    println!("your url is: {url}");
                    if let Some(cached) = cached_url {
                        println!("your cached url is: {cached}");
                    }
                }
                Some(TunnelEvent::Request { method, path }) => {
                    info!("{method} {path}");
                }
                Some(TunnelEvent::Error { error }) => {
                    error!("{error}");
                }
                Some(TunnelEvent::Exit { code, reason }) => {
                    error!("Tunnel exited: {reason}");
                    std::process::exit(code);
                }
                Some(TunnelEvent::Close) | None => {
                    info!("Tunnel closed");
                    break;
                }
            }
        }
    }

    Ok(())
}
