//! Connection dispatcher and relay engine.
//!
//! The accept loop hands every browser connection to its own task. A
//! connection is either answered directly (blocked host, duplicate request,
//! cache hit) or relayed: the worker opens the origin connection, pumps bytes
//! both ways, and feeds origin chunks to the cache in-line. All failures are
//! contained at the worker boundary; the browser sees either the fixed 403
//! page or a silently closed socket, never an error page.

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::console::Console;
use crate::error::ProxyError;
use crate::request::{parse_headers, parse_request, TargetAddress};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const HTTP_403: &[u8] =
    b"HTTP/1.1 403 Forbidden OK\r\n\r\n<h1>403 Error</h1><p>Website blocked by Proxy</p>";
pub const HTTP_200: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

pub struct ProxyServer {
    config: Config,
    cache: Arc<ResponseCache>,
    console: Arc<Console>,
    in_flight: Arc<Mutex<HashSet<Bytes>>>,
}

/// Membership in the in-flight set, released on drop so that no exit path of
/// a relay worker can leak its entry.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<Bytes>>>,
    url: Bytes,
}

impl InFlightGuard {
    /// Register `url`; `None` when another worker already holds it.
    fn register(set: &Arc<Mutex<HashSet<Bytes>>>, url: Bytes) -> Option<Self> {
        if set.lock().unwrap().insert(url.clone()) {
            Some(Self {
                set: Arc::clone(set),
                url,
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.url);
    }
}

impl ProxyServer {
    pub fn new(config: Config, console: Arc<Console>) -> Self {
        Self {
            config,
            cache: Arc::new(ResponseCache::new()),
            console,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Bind the configured listen address and serve forever. The bind is the
    /// only process-fatal failure in the system.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        log::info!("proxy listening on {}", self.config.listen_addr);
        self.serve(listener).await
    }

    /// Accept loop over an existing listener. Each connection runs on its own
    /// task; worker errors are logged and never reach this loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let (connection, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(connection).await {
                    log::debug!("connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }

    /// Drive one browser connection through the dispatch state machine:
    /// blocked, duplicate, cached, or relayed.
    async fn handle_connection(self: Arc<Self>, mut connection: TcpStream) -> Result<(), ProxyError> {
        let mut buf = vec![0u8; self.config.max_buffer];
        let n = connection.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let request = Bytes::copy_from_slice(&buf[..n]);
        let target = parse_request(&request)?;
        let url_text = target.url_text();

        if self.console.is_blocked(&target.host) {
            log::info!("[{}] blocked", url_text);
            connection.write_all(HTTP_403).await?;
            return Ok(());
        }

        // A second identical request while the first is still relaying is
        // dropped without any response.
        if self.in_flight.lock().unwrap().contains(&target.url) {
            log::debug!("[{}] duplicate in-flight request dropped", url_text);
            return Ok(());
        }

        if let Some(chunks) = self.cache.lookup(&target.url) {
            log::info!("[{}:{}] cached = true", url_text, target.port);
            self.console.log(1, format!("N~[{}] Cached~ ", url_text));
            for chunk in &chunks {
                connection.write_all(chunk).await?;
            }
            self.console
                .log(1, format!("C~[{}]~EXIT connection", url_text));
            return Ok(());
        }
        log::info!("[{}:{}] cached = false", url_text, target.port);

        // Lost the race to another worker between the check above and here.
        let Some(guard) = InFlightGuard::register(&self.in_flight, target.url.clone()) else {
            return Ok(());
        };

        let result = self.relay(connection, request, &target).await;
        self.console
            .log(1, format!("C~[{}]~EXIT connection", url_text));
        log::info!("[{}:{}] EXIT connection", url_text, target.port);
        self.cache.close(&target.url);
        drop(guard);
        result
    }

    /// Relay worker: open the origin connection and pump bytes both ways
    /// until either side closes. Origin chunks on plain-HTTP connections are
    /// fed to the cache in-line; CONNECT traffic is opaque end to end.
    async fn relay(
        &self,
        mut browser: TcpStream,
        request: Bytes,
        target: &TargetAddress,
    ) -> Result<(), ProxyError> {
        let https = request.starts_with(b"CONNECT");
        let url_text = target.url_text();
        let host = target.host_text();

        log::info!("[{}:{}] creating new connection", host, target.port);
        self.console
            .log(1, format!("N~[{}]~Creating new connection", url_text));

        // For a tunnel, acknowledge first and treat the browser's next buffer
        // as the opening bytes for the origin. Nothing after this point is
        // parsed as HTTP on a tunneled connection.
        let mut pending = request;
        if https {
            browser.write_all(HTTP_200).await?;
            let mut buf = vec![0u8; self.config.max_buffer];
            let n = browser.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            pending = Bytes::copy_from_slice(&buf[..n]);
        }

        let mut origin = self.connect_origin(&host, target.port).await?;

        self.console.log(
            3,
            format!("F~{}~ ", String::from_utf8_lossy(&pending)),
        );
        origin.write_all(&pending).await?;

        let (mut browser_read, mut browser_write) = browser.split();
        let (mut origin_read, mut origin_write) = origin.split();
        let mut browser_buf = vec![0u8; self.config.max_buffer];
        let mut origin_buf = vec![0u8; self.config.max_buffer];
        let started = Instant::now();
        let mut sampled = false;

        loop {
            tokio::select! {
                read = browser_read.read(&mut browser_buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    origin_write.write_all(&browser_buf[..n]).await?;
                    self.console.log(
                        3,
                        format!("F~{}~ ", String::from_utf8_lossy(&browser_buf[..n])),
                    );
                }
                read = origin_read.read(&mut origin_buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    browser_write.write_all(&origin_buf[..n]).await?;
                    self.console.log(
                        3,
                        format!("R~{}~ ", String::from_utf8_lossy(&origin_buf[..n])),
                    );
                    if !https {
                        let headers = parse_headers(&origin_buf[..n]);
                        self.cache.store(
                            &target.url,
                            Bytes::copy_from_slice(&origin_buf[..n]),
                            &headers,
                        );
                        if !sampled {
                            sampled = true;
                            let elapsed_ms = started.elapsed().as_millis().max(1);
                            self.console.log(
                                1,
                                format!("W~[{}]~{} bytes in {} ms", url_text, n, elapsed_ms),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn connect_origin(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let connect = TcpStream::connect((host, port));
        let stream = match self.config.connect_timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), connect)
                .await
                .map_err(|_| {
                    ProxyError::Connection(format!("connect to {}:{} timed out", host, port))
                })?,
            None => connect.await,
        };
        stream.map_err(|e| ProxyError::Connection(format!("{}:{}: {}", host, port, e)))
    }
}
