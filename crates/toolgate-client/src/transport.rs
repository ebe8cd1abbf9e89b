//! Downstream transports.
//!
//! Two ways to reach a tool server, both speaking the protocol in
//! [`crate::protocol`]:
//!
//! - **stdio**: spawn the configured command and exchange newline-delimited
//!   JSON over its stdin/stdout.
//! - **streaming HTTP**: one long-lived POST whose request body is a stream
//!   of request lines and whose response body is a stream of response lines,
//!   reconnected with bounded exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use toolgate_error::GatewayError;

use crate::connection::Connection;

/// Configuration for connecting to one downstream server.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Spawn a child process and speak over its stdio.
    Stdio {
        /// Command to execute.
        command: String,
        /// Arguments to the command.
        args: Vec<String>,
        /// Environment overlay for the child.
        env: HashMap<String, String>,
    },
    /// Open a long-lived streaming HTTP connection.
    Http {
        /// URL of the server's streaming endpoint.
        url: String,
        /// HTTP headers (e.g. Authorization).
        headers: HashMap<String, String>,
    },
}

/// A live transport to one downstream server.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Issue one protocol request.
    async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError>;

    /// Whether the transport believes it can serve another request.
    fn is_healthy(&self) -> bool;

    /// Tear the transport down.
    async fn shutdown(&self);
}

/// Connect using a [`TransportConfig`].
pub async fn connect(
    server: &str,
    config: &TransportConfig,
) -> Result<Arc<dyn Transport>, GatewayError> {
    match config {
        TransportConfig::Stdio { command, args, env } => {
            let t = StdioTransport::spawn(server, command, args, env).await?;
            Ok(Arc::new(t))
        }
        TransportConfig::Http { url, headers } => {
            let t = HttpTransport::connect(server, url, headers.clone()).await?;
            Ok(Arc::new(t))
        }
    }
}

/// Line-delimited subprocess transport.
#[derive(Debug)]
pub struct StdioTransport {
    child: Mutex<tokio::process::Child>,
    conn: Connection,
}

impl StdioTransport {
    /// Spawn the configured command and wire its stdio into a connection.
    pub async fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        tracing::info!(
            server = %server,
            command = %command,
            "connecting to downstream server (stdio)"
        );

        let mut child = tokio::process::Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Downstream {
                server: server.to_string(),
                message: format!("failed to spawn '{command}': {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| GatewayError::Downstream {
            server: server.to_string(),
            message: "no stdin on downstream child".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::Downstream {
            server: server.to_string(),
            message: "no stdout on downstream child".into(),
        })?;

        tracing::info!(server = %server, "connected to downstream server (stdio)");

        Ok(Self {
            child: Mutex::new(child),
            conn: Connection::over_io(server, stdout, stdin),
        })
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.conn.request(method, params).await
    }

    fn is_healthy(&self) -> bool {
        self.conn.is_healthy()
    }

    async fn shutdown(&self) {
        self.conn.shutdown().await;
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

/// Streaming HTTP transport.
///
/// Holds at most one live stream; a broken stream is replaced on the next
/// request, with bounded exponential backoff between attempts.
pub struct HttpTransport {
    server: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    conn: Mutex<Option<Arc<Connection>>>,
    backoff_base: Duration,
    max_attempts: u32,
}

impl HttpTransport {
    /// Open the initial stream to the server.
    pub async fn connect(
        server: &str,
        url: &str,
        headers: HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        if url.starts_with("http://") {
            tracing::warn!(
                server = %server,
                "connecting over plain HTTP, consider HTTPS for production"
            );
        }
        for key in headers.keys() {
            if key.eq_ignore_ascii_case("authorization") {
                tracing::debug!(server = %server, "auth header configured (redacted)");
            }
        }

        let transport = Self {
            server: server.to_string(),
            url: url.to_string(),
            headers,
            client: reqwest::Client::new(),
            conn: Mutex::new(None),
            backoff_base: Duration::from_millis(250),
            max_attempts: 5,
        };

        // Establish eagerly so configuration errors surface at startup.
        transport.ensure_conn().await?;
        tracing::info!(server = %server, "connected to downstream server (http)");
        Ok(transport)
    }

    #[cfg(test)]
    fn disconnected(server: &str, url: &str, backoff_base: Duration, max_attempts: u32) -> Self {
        Self {
            server: server.to_string(),
            url: url.to_string(),
            headers: HashMap::new(),
            client: reqwest::Client::new(),
            conn: Mutex::new(None),
            backoff_base,
            max_attempts,
        }
    }

    async fn open_stream(&self) -> Result<Arc<Connection>, GatewayError> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let body_stream = ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);

        let mut request = self
            .client
            .post(&self.url)
            .body(reqwest::Body::wrap_stream(body_stream));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| GatewayError::Downstream {
            server: self.server.clone(),
            message: format!("stream connect failed: {e}"),
        })?;
        if !response.status().is_success() {
            return Err(GatewayError::Downstream {
                server: self.server.clone(),
                message: format!("stream connect failed: HTTP {}", response.status()),
            });
        }

        let byte_stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let reader = StreamReader::new(byte_stream);

        Ok(Arc::new(Connection::over_channel(
            self.server.clone(),
            tx,
            reader,
        )))
    }

    /// Return the live stream, reconnecting with backoff when it is broken.
    async fn ensure_conn(&self) -> Result<Arc<Connection>, GatewayError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_healthy() {
                return Ok(conn.clone());
            }
            tracing::warn!(server = %self.server, "stream broken, reconnecting");
        }

        let mut delay = self.backoff_base;
        let mut last_err = GatewayError::Downstream {
            server: self.server.clone(),
            message: "no connection attempts made".into(),
        };
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(5));
            }
            match self.open_stream().await {
                Ok(conn) => {
                    *guard = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        server = %self.server,
                        attempt = attempt + 1,
                        error = %e,
                        "stream connect attempt failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let conn = self.ensure_conn().await?;
        conn.request(method, params).await
    }

    fn is_healthy(&self) -> bool {
        // A broken stream is recoverable on the next request, so the
        // transport itself reports healthy unless construction failed.
        true
    }

    async fn shutdown(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.shutdown().await;
        }
    }
}
