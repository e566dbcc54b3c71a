//! Operator console: a single-client WebSocket server that owns the domain
//! blocklist, pushes structured log events to the connected operator, and
//! accepts new blocked domains from them.
//!
//! Log emission is a queue drained by the connection's single writer task, so
//! frames from the dispatcher and relay workers never interleave on the wire.

use crate::error::ProxyError;
use crate::ws;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Handshake/read buffer for the console socket.
const CONSOLE_BUFFER: usize = 1024;

pub struct Console {
    blocklist: Mutex<HashMap<String, String>>,
    tx: UnboundedSender<String>,
    port: u16,
    store_path: PathBuf,
    verbosity: u8,
}

impl Console {
    /// Create the console and load the persisted blocklist if present.
    /// Returns the receiving end of the log queue; pass it to [`Console::run`].
    pub fn new(
        port: u16,
        store_path: PathBuf,
        verbosity: u8,
    ) -> (Arc<Self>, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let blocklist = load_blocklist(&store_path);
        if !blocklist.is_empty() {
            log::info!("loaded {} blocklist entries", blocklist.len());
        }
        (
            Arc::new(Self {
                blocklist: Mutex::new(blocklist),
                tx,
                port,
                store_path,
                verbosity,
            }),
            rx,
        )
    }

    /// True when any blocklist entry is a substring of `host`.
    pub fn is_blocked(&self, host: &[u8]) -> bool {
        let host = String::from_utf8_lossy(host);
        let blocklist = self.blocklist.lock().unwrap();
        blocklist.keys().any(|domain| host.contains(domain.as_str()))
    }

    /// Add a domain to the blocklist (set semantics, empty value).
    pub fn insert(&self, domain: String) {
        log::info!("blocking domain: {}", domain);
        self.blocklist.lock().unwrap().insert(domain, String::new());
    }

    /// Enqueue a console event. Dropped without error when the event level
    /// exceeds the configured verbosity or no receiver is alive.
    pub fn log(&self, level: u8, message: String) {
        if level <= self.verbosity {
            let _ = self.tx.send(message);
        }
    }

    /// Persist the blocklist. Failures are logged, never fatal.
    pub fn save(&self) {
        let blocklist = self.blocklist.lock().unwrap();
        match serde_json::to_string_pretty(&*blocklist) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.store_path, json) {
                    log::error!("failed to save blocklist to {:?}: {}", self.store_path, e);
                }
            }
            Err(e) => log::error!("failed to serialize blocklist: {}", e),
        }
    }

    /// Bind the console port and serve operators forever. Bind failure is
    /// fatal and propagates to startup.
    pub async fn run(self: Arc<Self>, rx: UnboundedReceiver<String>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        log::info!("management console listening on {}", self.port);
        self.serve(listener, rx).await
    }

    /// Accept one operator at a time; further connect attempts wait in the
    /// listener backlog. While nobody is connected, queued log events are
    /// drained and discarded.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut rx: UnboundedReceiver<String>,
    ) -> Result<(), ProxyError> {
        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => accepted?.0,
                event = rx.recv() => {
                    if event.is_none() {
                        return Ok(());
                    }
                    continue;
                }
            };

            if let Err(e) = Arc::clone(&self).serve_operator(stream, &mut rx).await {
                log::debug!("console connection ended: {}", e);
            }
            self.save();
        }
    }

    async fn serve_operator(
        self: Arc<Self>,
        mut stream: TcpStream,
        rx: &mut UnboundedReceiver<String>,
    ) -> Result<(), ProxyError> {
        ws::handshake(&mut stream, CONSOLE_BUFFER).await?;
        log::info!("operator connected");

        let snapshot = {
            let blocklist = self.blocklist.lock().unwrap();
            blocklist.keys().cloned().collect::<Vec<_>>().join("\n")
        };
        let frame = ws::pack(&format!("B~{}~ ", snapshot), 1, 1)?;
        stream.write_all(&frame).await?;

        let (mut read_half, mut write_half) = stream.into_split();

        // Reader task: each complete text frame is a domain to block. Any
        // decode failure, fragment, or peer close ends the session.
        let console = Arc::clone(&self);
        let mut reader = tokio::spawn(async move {
            loop {
                match ws::unpack(&mut read_half).await {
                    Ok(Some(payload)) => match String::from_utf8(payload) {
                        Ok(domain) => console.insert(domain),
                        Err(e) => {
                            log::debug!("non-UTF-8 operator message: {}", e);
                            break;
                        }
                    },
                    Ok(None) | Err(_) => break,
                }
            }
        });

        // Single writer: drains the shared log queue onto this connection.
        let result = loop {
            tokio::select! {
                _ = &mut reader => break Ok(()),
                event = rx.recv() => {
                    let Some(message) = event else { break Ok(()) };
                    match ws::pack(&message, 1, 1) {
                        Ok(frame) => {
                            if let Err(e) = write_half.write_all(&frame).await {
                                break Err(ProxyError::Io(e));
                            }
                        }
                        Err(e) => log::debug!("dropping unencodable console event: {}", e),
                    }
                }
            }
        };
        reader.abort();
        log::info!("operator disconnected");
        result
    }
}

fn load_blocklist(path: &PathBuf) -> HashMap<String, String> {
    if !path.is_file() {
        return HashMap::new();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(blocklist) => blocklist,
            Err(e) => {
                log::warn!("ignoring corrupt blocklist file {:?}: {}", path, e);
                HashMap::new()
            }
        },
        Err(e) => {
            log::warn!("cannot read blocklist file {:?}: {}", path, e);
            HashMap::new()
        }
    }
}
