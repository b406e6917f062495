//! One live socket to one Electrum peer
//!
//! The reader task owns the read half and completes pending requests by id.
//! Writers share the write half behind an async mutex. Once the socket drops,
//! every pending request fails and the connection never recovers; the client
//! opens a fresh one on next use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, timeout, Instant};

use super::framing::{encode_request, parse_line, Incoming, LineBuffer, Notification};
use super::peers::{Peer, Transport};
use super::tls;
use crate::error::ElectrumError;

/// Protocol version requested in the `server.version` handshake
pub const PROTOCOL_VERSION: &str = "1.4";

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Timings and TLS policy for opening connections
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub tls_verify: bool,
}

struct PendingRequest {
    method: String,
    reply: oneshot::Sender<Result<Value, ElectrumError>>,
}

#[derive(Default)]
struct PendingTable {
    open: bool,
    requests: HashMap<u64, PendingRequest>,
    keepalive: Option<AbortHandle>,
}

/// State shared between request callers and the reader task
struct Shared {
    peer: String,
    table: Mutex<PendingTable>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        // A poisoned table only means a panicking caller; the map is still consistent
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, id: u64, outcome: Result<Value, super::framing::RpcError>) {
        let Some(pending) = self.lock().requests.remove(&id) else {
            log::debug!("Dropping response for unknown request id {} from {}", id, self.peer);
            return;
        };
        let result = outcome.map_err(|e| ElectrumError::Rpc {
            method: pending.method,
            code: e.code,
            message: e.message,
        });
        // Receiver gone means the caller already timed out
        let _ = pending.reply.send(result);
    }

    /// Mark the socket dead, stop the keep-alive and fail everything in flight
    fn close(&self, reason: &str) {
        let (requests, keepalive) = {
            let mut table = self.lock();
            if !table.open {
                return;
            }
            table.open = false;
            (std::mem::take(&mut table.requests), table.keepalive.take())
        };

        if let Some(handle) = keepalive {
            handle.abort();
        }
        if !requests.is_empty() {
            log::warn!(
                "Connection to {} closed ({}), failing {} pending request(s)",
                self.peer,
                reason,
                requests.len()
            );
        } else {
            log::info!("Connection to {} closed ({})", self.peer, reason);
        }
        for (_, pending) in requests {
            let _ = pending.reply.send(Err(ElectrumError::Closed(reason.to_string())));
        }
    }
}

pub struct Connection {
    peer: Peer,
    next_id: AtomicU64,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    shared: Arc<Shared>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Open a socket, complete the `server.version` handshake and start the
    /// keep-alive. Socket setup and handshake share `connect_timeout`.
    pub async fn open(
        peer: &Peer,
        settings: &ConnectionSettings,
        notifications: broadcast::Sender<Notification>,
    ) -> Result<Arc<Self>, ElectrumError> {
        let connection = timeout(settings.connect_timeout, async {
            let stream = open_stream(peer, settings.tls_verify).await?;
            let connection = Arc::new(Self::start(peer.clone(), stream, settings, notifications));

            let version = connection
                .request(
                    "server.version",
                    json!([client_name(), PROTOCOL_VERSION]),
                )
                .await
                .map_err(|e| ElectrumError::transport(peer, format!("handshake failed: {}", e)))?;
            if version.is_null() {
                return Err(ElectrumError::transport(peer, "empty server.version response"));
            }
            log::info!("Connected to {} ({})", peer, version);
            Ok(connection)
        })
        .await
        .map_err(|_| ElectrumError::transport(peer, "connect timed out"))??;

        connection.spawn_keepalive(settings.keepalive_interval);
        Ok(connection)
    }

    fn start(
        peer: Peer,
        stream: BoxedStream,
        settings: &ConnectionSettings,
        notifications: broadcast::Sender<Notification>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            peer: peer.to_string(),
            table: Mutex::new(PendingTable {
                open: true,
                ..Default::default()
            }),
        });

        let reader = tokio::spawn(read_loop(read_half, shared.clone(), notifications));

        Self {
            peer,
            next_id: AtomicU64::new(0),
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            request_timeout: settings.request_timeout,
            reader,
        }
    }

    fn spawn_keepalive(self: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                if !connection.is_connected() {
                    break;
                }
                if let Err(e) = connection.request("server.ping", json!([])).await {
                    log::warn!("Keep-alive ping to {} failed: {}", connection.peer, e);
                }
            }
        });

        let mut table = self.shared.lock();
        if table.open {
            table.keepalive = Some(task.abort_handle());
        } else {
            task.abort();
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().open
    }

    /// Send one request and wait for its response or the request timeout
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ElectrumError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_request(id, method, &params)
            .map_err(|e| ElectrumError::malformed(method, e))?;

        let (reply, response) = oneshot::channel();
        {
            let mut table = self.shared.lock();
            if !table.open {
                return Err(ElectrumError::Closed(format!("{} is disconnected", self.peer)));
            }
            table.requests.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    reply,
                },
            );
        }
        log::debug!("-> {} #{} {}", self.peer, id, method);

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&line).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.shared.lock().requests.remove(&id);
            self.shared.close(&format!("write failed: {}", e));
            return Err(ElectrumError::transport(&self.peer, e));
        }

        match timeout(self.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ElectrumError::Closed(format!("{} dropped request {}", self.peer, id))),
            Err(_) => {
                self.shared.lock().requests.remove(&id);
                log::warn!("{} #{} timed out on {}", method, id, self.peer);
                Err(ElectrumError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Close the socket and fail pending requests
    pub async fn shutdown(&self) {
        self.shared.close("closed by client");
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close("dropped");
        self.reader.abort();
    }
}

fn client_name() -> String {
    format!("trustless-wallet {}", env!("CARGO_PKG_VERSION"))
}

async fn open_stream(peer: &Peer, tls_verify: bool) -> Result<BoxedStream, ElectrumError> {
    let tcp = TcpStream::connect(peer.socket_addr())
        .await
        .map_err(|e| ElectrumError::transport(peer, e))?;
    let _ = tcp.set_nodelay(true);

    match peer.transport {
        Transport::Tcp => Ok(Box::new(tcp)),
        Transport::Tls => {
            let config = tls::client_config(tls_verify)?;
            let stream = tls::connect(tcp, &peer.host, config).await?;
            Ok(Box::new(stream))
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    shared: Arc<Shared>,
    notifications: broadcast::Sender<Notification>,
) {
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; 16 * 1024];

    let reason = loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break "server closed the connection".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read failed: {}", e),
        };
        buffer.extend(&chunk[..n]);

        while let Some(line) = buffer.next_line() {
            let messages = match parse_line(&line) {
                Ok(messages) => messages,
                Err(e) => {
                    log::warn!("Unparseable line from {}: {}", shared.peer, e);
                    continue;
                }
            };
            for message in messages {
                match message {
                    Incoming::Response { id, outcome } => shared.complete(id, outcome),
                    Incoming::Notification(notification) => {
                        log::debug!("<- {} {}", shared.peer, notification.method);
                        // No subscribers is fine
                        let _ = notifications.send(notification);
                    }
                    Incoming::Ignored => {}
                }
            }
        }
    };

    shared.close(&reason);
}
