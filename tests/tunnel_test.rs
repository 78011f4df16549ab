//! End-to-end tunnel scenarios against an in-process fake broker.
//!
//! Acquisition is served by wiremock; the tunnel data path runs against a
//! real TCP listener standing in for the broker's multiplexer and another
//! for the local service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use localtunnel::{Tunnel, TunnelConfig, TunnelEvent};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Fixed response the fake local service answers every read with.
const LOCAL_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

/// Fake broker endpoint: accepts worker sockets, drops the first
/// `drop_first` immediately, and hands the rest to the test.
struct FakeBroker {
    port: u16,
    accepted: Arc<AtomicUsize>,
    conns: mpsc::UnboundedReceiver<TcpStream>,
}

async fn start_broker(drop_first: usize) -> FakeBroker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let Ok((sock, _)) = listener.accept().await else {
                break;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < drop_first {
                drop(sock);
            } else {
                let _ = tx.send(sock);
            }
        }
    });

    FakeBroker {
        port,
        accepted,
        conns: rx,
    }
}

/// Fake local service: streams every received chunk to the test and answers
/// each read with a fixed 200 response.
async fn start_local() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = tx.send(buf[..n].to_vec());
                            if sock.write_all(LOCAL_RESPONSE).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    (port, rx)
}

/// wiremock acquisition endpoint pointing workers at `broker_port`.
async fn mock_acquisition(broker_port: u16, max_conn: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "abc",
            "ip": "127.0.0.1",
            "port": broker_port,
            "max_conn_count": max_conn,
            "url": "https://abc.example.org"
        })))
        .mount(&server)
        .await;
    server
}

async fn next_event(tunnel: &mut Tunnel, ms: u64) -> Option<TunnelEvent> {
    timeout(Duration::from_millis(ms), tunnel.next_event())
        .await
        .ok()
        .flatten()
}

/// Poll a counter until it reaches `want` or `ms` elapses.
async fn wait_for_count(counter: &Arc<AtomicUsize>, want: usize, ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    while tokio::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) >= want {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Collect received chunks until `len` bytes arrived or `ms` elapses.
async fn collect_bytes(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, len: usize, ms: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    while bytes.len() < len && tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(chunk)) => bytes.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(_) => {}
        }
    }
    bytes
}

#[tokio::test(flavor = "multi_thread")]
async fn opens_max_conn_workers_and_announces_url() {
    let (local_port, _local_rx) = start_local().await;
    let broker = start_broker(0).await;
    let server = mock_acquisition(broker.port, 3).await;

    let config = TunnelConfig {
        broker_base_url: server.uri(),
        ..TunnelConfig::for_port(local_port)
    };
    let mut tunnel = Tunnel::open(config).await.unwrap();
    assert_eq!(tunnel.url(), "https://abc.example.org");

    match next_event(&mut tunnel, 2000).await {
        Some(TunnelEvent::Url { url, cached_url }) => {
            assert_eq!(url, "https://abc.example.org");
            assert!(cached_url.is_none());
        }
        other => panic!("Expected Url event, got {other:?}"),
    }

    assert!(wait_for_count(&broker.accepted, 3, 2000).await);
    // The ceiling holds: no fourth connection shows up.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.accepted.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn rewrites_host_header_end_to_end() {
    let (local_port, mut local_rx) = start_local().await;
    let mut broker = start_broker(0).await;
    let server = mock_acquisition(broker.port, 1).await;

    let config = TunnelConfig {
        broker_base_url: server.uri(),
        local_host: Some("localhost".to_string()),
        ..TunnelConfig::for_port(local_port)
    };
    let mut tunnel = Tunnel::open(config).await.unwrap();

    let mut conn = timeout(Duration::from_millis(2000), broker.conns.recv())
        .await
        .unwrap()
        .unwrap();
    conn.write_all(b"GET /x HTTP/1.1\r\nHost: public.example.org\r\n\r\n")
        .await
        .unwrap();

    let expected: &[u8] = b"GET /x HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let received = collect_bytes(&mut local_rx, expected.len(), 2000).await;
    assert_eq!(received, expected);

    // The local service's response travels back unmodified.
    let mut response = vec![0u8; LOCAL_RESPONSE.len()];
    timeout(Duration::from_millis(2000), conn.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, LOCAL_RESPONSE);

    // The request line was observed.
    loop {
        match next_event(&mut tunnel, 2000).await {
            Some(TunnelEvent::Url { .. }) => continue,
            Some(TunnelEvent::Request { method, path }) => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/x");
                break;
            }
            other => panic!("Expected Request event, got {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn server_injected_frame_is_filtered() {
    let dump_dir = tempfile::tempdir().unwrap();
    let (local_port, mut local_rx) = start_local().await;
    let mut broker = start_broker(0).await;
    let server = mock_acquisition(broker.port, 1).await;

    let config = TunnelConfig {
        broker_base_url: server.uri(),
        dump_dir: Some(dump_dir.path().to_path_buf()),
        ..TunnelConfig::for_port(local_port)
    };
    let mut tunnel = Tunnel::open(config).await.unwrap();

    let mut conn = timeout(Duration::from_millis(2000), broker.conns.recv())
        .await
        .unwrap()
        .unwrap();
    conn.write_all(b"GET /ping HTTP/1.1\r\nX-LT-Source: server\r\nHost: abc.example.org\r\n\r\n")
        .await
        .unwrap();
    sleep(Duration::from_millis(400)).await;

    // Nothing reached the local service.
    assert!(local_rx.try_recv().is_err());
    // No request event: only the Url announcement is in the stream.
    match next_event(&mut tunnel, 300).await {
        Some(TunnelEvent::Url { .. }) => {}
        other => panic!("Expected Url event, got {other:?}"),
    }
    assert!(next_event(&mut tunnel, 300).await.is_none());
    // Nothing was dumped.
    let dumped = std::fs::read_dir(dump_dir.path())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(dumped, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_death_triggers_bounded_replacement() {
    let (local_port, _local_rx) = start_local().await;
    let broker = start_broker(3).await;
    let server = mock_acquisition(broker.port, 3).await;

    let config = TunnelConfig {
        broker_base_url: server.uri(),
        ..TunnelConfig::for_port(local_port)
    };
    let _tunnel = Tunnel::open(config).await.unwrap();

    // All three initial sockets get destroyed by the broker on accept.
    assert!(wait_for_count(&broker.accepted, 3, 2000).await);

    // Replacements are paced by the pool backoff (1s, then 2s, then 4s):
    // two seconds in, we expect some but never more than one replacement
    // per death.
    sleep(Duration::from_millis(2200)).await;
    let total = broker.accepted.load(Ordering::SeqCst);
    assert!(
        (4..=6).contains(&total),
        "Expected 4..=6 total connections after 2.2s, got {total}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn hopeless_local_service_drains_the_pool() {
    // Nothing listens on the local port; two refusals per worker trip the cap.
    let broker = start_broker(0).await;
    let server = mock_acquisition(broker.port, 1).await;

    let dead_port = {
        // Bind and drop to find a port that is closed right now.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let config = TunnelConfig {
        broker_base_url: server.uri(),
        local_retry_max: 2,
        ..TunnelConfig::for_port(dead_port)
    };
    let mut tunnel = Tunnel::open(config).await.unwrap();

    let mut saw_local_gone = false;
    loop {
        match next_event(&mut tunnel, 5000).await {
            Some(TunnelEvent::Url { .. }) => continue,
            Some(TunnelEvent::Error { error }) => {
                saw_local_gone = saw_local_gone || error.to_string().contains("gave up");
            }
            Some(TunnelEvent::Exit { code, reason }) => {
                assert_ne!(code, 0);
                assert_eq!(reason, "all_tunnels_dead");
                break;
            }
            other => panic!("Expected Exit event, got {other:?}"),
        }
    }
    assert!(saw_local_gone, "Expected a LocalGone error before exit");

    // The pool closed itself; the close event follows.
    match next_event(&mut tunnel, 2000).await {
        Some(TunnelEvent::Close) => {}
        other => panic!("Expected Close event, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn close_is_idempotent_and_emits_close() {
    let (local_port, _local_rx) = start_local().await;
    let broker = start_broker(0).await;
    let server = mock_acquisition(broker.port, 2).await;

    let config = TunnelConfig {
        broker_base_url: server.uri(),
        ..TunnelConfig::for_port(local_port)
    };
    let mut tunnel = Tunnel::open(config).await.unwrap();
    assert!(wait_for_count(&broker.accepted, 2, 2000).await);

    tunnel.close();
    tunnel.close();

    loop {
        match next_event(&mut tunnel, 2000).await {
            Some(TunnelEvent::Close) => break,
            Some(_) => continue,
            None => panic!("Expected Close event after close()"),
        }
    }

    // Closed pool never replaces workers: the count stays put.
    let before = broker.accepted.load(Ordering::SeqCst);
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(broker.accepted.load(Ordering::SeqCst), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn forwarded_traffic_is_dumped() {
    let dump_dir = tempfile::tempdir().unwrap();
    let (local_port, _local_rx) = start_local().await;
    let mut broker = start_broker(0).await;
    let server = mock_acquisition(broker.port, 1).await;

    let config = TunnelConfig {
        broker_base_url: server.uri(),
        dump_dir: Some(dump_dir.path().to_path_buf()),
        ..TunnelConfig::for_port(local_port)
    };
    let _tunnel = Tunnel::open(config).await.unwrap();

    let mut conn = timeout(Duration::from_millis(2000), broker.conns.recv())
        .await
        .unwrap()
        .unwrap();
    conn.write_all(b"GET /dumped HTTP/1.1\r\nHost: abc.example.org\r\n\r\n")
        .await
        .unwrap();
    let mut response = vec![0u8; LOCAL_RESPONSE.len()];
    timeout(Duration::from_millis(2000), conn.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();

    sleep(Duration::from_millis(500)).await;
    let names: Vec<String> = std::fs::read_dir(dump_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(
        names.iter().any(|n| n.starts_with("abc.") && n.ends_with(".req.yaml")),
        "Expected a request dump, got {names:?}"
    );
    assert!(
        names.iter().any(|n| n.starts_with("abc.") && n.ends_with(".res.yaml")),
        "Expected a response dump, got {names:?}"
    );
}
