//! End-to-end tests for the dispatcher, relay, cache, and operator console.
//!
//! Each test runs the proxy (or console) against loopback listeners bound to
//! ephemeral ports, with scripted origin servers standing in for the web.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use warden_proxy::proxy::{HTTP_200, HTTP_403};
use warden_proxy::{Config, Console, ProxyServer};

const SETTLE: Duration = Duration::from_millis(150);

async fn start_proxy(console: Arc<Console>) -> (std::net::SocketAddr, Arc<ProxyServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = Arc::new(ProxyServer::new(Config::default(), console));
    tokio::spawn(Arc::clone(&proxy).serve(listener));
    (addr, proxy)
}

fn test_console(dir: &TempDir) -> Arc<Console> {
    let (console, _rx) = Console::new(0, dir.path().join("bl.json"), 1);
    console
}

#[tokio::test]
async fn blocked_host_gets_the_fixed_403_body() {
    let dir = TempDir::new().unwrap();
    let console = test_console(&dir);
    console.insert("blocked.example".to_string());
    let (proxy_addr, _proxy) = start_proxy(console).await;

    let mut browser = TcpStream::connect(proxy_addr).await.unwrap();
    browser
        .write_all(b"GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    browser.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, HTTP_403);
}

#[tokio::test]
async fn forwarded_response_is_cached_and_replayed_without_the_origin() {
    let dir = TempDir::new().unwrap();
    let console = test_console(&dir);
    let (proxy_addr, _proxy) = start_proxy(console).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();

    // The origin serves exactly one connection, then goes away entirely.
    tokio::spawn(async move {
        let (mut conn, _) = origin.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = conn.read(&mut buf).await.unwrap();
        assert!(buf[..n].starts_with(b"GET "));
        conn.write_all(
            b"HTTP/1.1 200 OK\r\nCache-Control: max-age=30\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await
        .unwrap();
    });

    let request = format!(
        "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_port
    );

    let mut browser = TcpStream::connect(proxy_addr).await.unwrap();
    browser.write_all(request.as_bytes()).await.unwrap();
    let mut first = Vec::new();
    browser.read_to_end(&mut first).await.unwrap();
    assert!(first.ends_with(b"hello"));

    // Let the relay worker finish its close/unregister sequence.
    tokio::time::sleep(SETTLE).await;

    // The origin listener is gone; only the cache can answer this.
    let mut browser = TcpStream::connect(proxy_addr).await.unwrap();
    browser.write_all(request.as_bytes()).await.unwrap();
    let mut second = Vec::new();
    browser.read_to_end(&mut second).await.unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn connect_tunnel_relays_opaquely_and_caches_nothing() {
    let dir = TempDir::new().unwrap();
    let console = test_console(&dir);
    let (proxy_addr, proxy) = start_proxy(console).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut conn, _) = origin.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"client-hello");
        conn.write_all(b"server-hello").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"more-bytes");
    });

    let mut browser = TcpStream::connect(proxy_addr).await.unwrap();
    browser
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_port).as_bytes())
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let n = browser.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], HTTP_200);

    browser.write_all(b"client-hello").await.unwrap();
    let n = browser.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"server-hello");
    browser.write_all(b"more-bytes").await.unwrap();

    // Origin task exits, its socket closes, and the tunnel tears down.
    let n = browser.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    let url = Bytes::from(format!("127.0.0.1:{}", origin_port));
    assert!(proxy.cache().lookup(&url).is_none());
}

#[tokio::test]
async fn duplicate_in_flight_request_is_dropped_without_a_response() {
    let dir = TempDir::new().unwrap();
    let console = test_console(&dir);
    let (proxy_addr, _proxy) = start_proxy(console).await;

    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin.local_addr().unwrap().port();

    // Accept the one relay connection and sit on it without responding,
    // keeping the first request in flight.
    let origin_task = tokio::spawn(async move {
        let (mut conn, _) = origin.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = conn.read(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let request = format!(
        "GET http://127.0.0.1:{port}/slow HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = origin_port
    );

    let mut first = TcpStream::connect(proxy_addr).await.unwrap();
    first.write_all(request.as_bytes()).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let mut second = TcpStream::connect(proxy_addr).await.unwrap();
    second.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let n = second.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "duplicate request must be dropped silently");

    origin_task.abort();
}

/// Read from `stream` into `collected` until `predicate` says enough has
/// arrived.
async fn read_until<F>(stream: &mut TcpStream, collected: &mut Vec<u8>, predicate: F)
where
    F: Fn(&[u8]) -> bool,
{
    let mut buf = vec![0u8; 4096];
    while !predicate(collected) {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "peer closed before expected data arrived");
        collected.extend_from_slice(&buf[..n]);
    }
}

/// Pull one short server-to-client text frame off the front of `collected`.
fn take_frame(collected: &mut Vec<u8>) -> Option<String> {
    if collected.len() < 2 {
        return None;
    }
    assert_eq!(collected[0], 0x81, "expected a final text frame");
    let len = (collected[1] & 0x7F) as usize;
    if collected.len() < 2 + len {
        return None;
    }
    let payload = String::from_utf8(collected[2..2 + len].to_vec()).unwrap();
    collected.drain(..2 + len);
    Some(payload)
}

/// Next complete frame, reading more from the socket as needed.
async fn next_frame(stream: &mut TcpStream, collected: &mut Vec<u8>) -> String {
    let mut buf = vec![0u8; 4096];
    loop {
        if let Some(frame) = take_frame(collected) {
            return frame;
        }
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "peer closed before a complete frame arrived");
        collected.extend_from_slice(&buf[..n]);
    }
}

fn masked_text_frame(payload: &[u8]) -> Vec<u8> {
    let key = [0x12u8, 0x34, 0x56, 0x78];
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, &b)| b ^ key[i % 4]));
    frame
}

#[tokio::test]
async fn console_pushes_snapshot_and_accepts_operator_domains() {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("bl.json");
    let (console, log_rx) = Console::new(0, store_path.clone(), 1);
    console.insert("seed.example".to_string());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let console_addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&console).serve(listener, log_rx));

    let mut operator = TcpStream::connect(console_addr).await.unwrap();
    operator
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

    // Handshake response, then the blocklist snapshot frame.
    let mut collected = Vec::new();
    read_until(&mut operator, &mut collected, |data| {
        warden_proxy::request::parse_headers(data)
            .contains_key(b"Sec-WebSocket-Accept".as_slice())
    })
    .await;
    let response = String::from_utf8_lossy(&collected).into_owned();
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    let header_end = response.find("\r\n\r\n").unwrap() + 4;
    collected.drain(..header_end);

    let snapshot = next_frame(&mut operator, &mut collected).await;
    assert_eq!(snapshot, "B~seed.example~ ");

    // A level-1 event reaches the connected operator as one frame.
    console.log(1, "N~[http://a/]~Creating new connection".to_string());
    let event = next_frame(&mut operator, &mut collected).await;
    assert_eq!(event, "N~[http://a/]~Creating new connection");

    // Operator sends a domain; the blocklist picks it up.
    operator
        .write_all(&masked_text_frame(b"ads.example.com"))
        .await
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    assert!(console.is_blocked(b"ads.example.com"));

    // Disconnect persists the blocklist.
    drop(operator);
    tokio::time::sleep(SETTLE).await;
    let saved = std::fs::read_to_string(&store_path).unwrap();
    assert!(saved.contains("ads.example.com"));
    assert!(saved.contains("seed.example"));
}
