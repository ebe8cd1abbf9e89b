//! Shared request/response engine for downstream connections.
//!
//! Both transports hand their I/O halves to a [`Connection`], which assigns
//! monotonically increasing request ids, writes request lines, and runs a
//! reader task that demultiplexes response lines back to per-request oneshot
//! channels. A broken read side fails every pending request and poisons the
//! connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use toolgate_error::GatewayError;

use crate::protocol::{read_line, write_line, WireRequest, WireResponse};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Where request lines go.
enum LineSink {
    /// Direct async I/O (child stdin).
    Io(Box<dyn AsyncWrite + Send + Unpin>),
    /// A channel feeding a streaming HTTP request body.
    Channel(mpsc::Sender<Vec<u8>>),
}

impl LineSink {
    async fn send(&mut self, request: &WireRequest) -> Result<(), std::io::Error> {
        match self {
            LineSink::Io(writer) => write_line(writer, request).await,
            LineSink::Channel(tx) => {
                let mut payload = serde_json::to_vec(request)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                payload.push(b'\n');
                tx.send(payload).await.map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "request stream closed")
                })
            }
        }
    }
}

/// One live downstream connection.
pub struct Connection {
    server: String,
    sink: Mutex<LineSink>,
    pending: PendingMap,
    next_id: AtomicU64,
    healthy: Arc<AtomicBool>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Build a connection over a direct I/O pair and start its reader task.
    pub fn over_io<R, W>(server: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(
            server,
            LineSink::Io(Box::new(writer)),
            BufReader::new(reader),
        )
    }

    /// Build a connection whose requests flow into `tx` (a streaming request
    /// body) and whose responses are read from `reader`.
    pub fn over_channel<R>(server: impl Into<String>, tx: mpsc::Sender<Vec<u8>>, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::build(server, LineSink::Channel(tx), BufReader::new(reader))
    }

    fn build<R>(server: impl Into<String>, sink: LineSink, reader: R) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        let server = server.into();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let healthy = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(demux_loop(
            server.clone(),
            reader,
            pending.clone(),
            healthy.clone(),
        ));

        Self {
            server,
            sink: Mutex::new(sink),
            pending,
            next_id: AtomicU64::new(0),
            healthy,
            reader_task,
        }
    }

    /// Whether the connection is still usable.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Issue one request and await its response.
    ///
    /// Requests are written in dispatch order; responses may interleave and
    /// are matched back by id.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        if !self.is_healthy() {
            return Err(GatewayError::Downstream {
                server: self.server.clone(),
                message: "connection is broken".into(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = WireRequest {
            id,
            method: method.to_string(),
            params,
        };

        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(&request).await {
                self.healthy.store(false, Ordering::SeqCst);
                self.pending.lock().await.remove(&id);
                return Err(GatewayError::Downstream {
                    server: self.server.clone(),
                    message: format!("write failed: {e}"),
                });
            }
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(GatewayError::Downstream {
                server: self.server.clone(),
                message,
            }),
            Err(_) => Err(GatewayError::Downstream {
                server: self.server.clone(),
                message: "connection closed before response".into(),
            }),
        }
    }

    /// Tear the connection down, aborting the reader task and failing any
    /// pending requests.
    pub async fn shutdown(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        self.reader_task.abort();
        fail_all_pending(&self.pending, "connection shut down").await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn fail_all_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(reason.to_string()));
    }
}

/// Read response lines and dispatch them to their waiting requests.
///
/// Exits (poisoning the connection) on EOF, an unreadable line, or a
/// protocol violation.
async fn demux_loop<R: AsyncBufRead + Unpin>(
    server: String,
    mut reader: R,
    pending: PendingMap,
    healthy: Arc<AtomicBool>,
) {
    loop {
        match read_line::<WireResponse, _>(&mut reader).await {
            Ok(Some(response)) => {
                let waiter = pending.lock().await.remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let outcome = match (response.result, response.error) {
                            (Some(result), None) => Ok(result),
                            (None, Some(err)) => Err(err.message),
                            (Some(result), Some(_)) => Ok(result),
                            (None, None) => Err("malformed response: no result or error".into()),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => {
                        tracing::warn!(
                            server = %server,
                            id = response.id,
                            "response for unknown request id"
                        );
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(server = %server, "downstream connection reached EOF");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "downstream connection read error");
                break;
            }
        }
    }

    healthy.store(false, Ordering::SeqCst);
    fail_all_pending(&pending, "connection closed").await;
}
