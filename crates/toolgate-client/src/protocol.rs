//! The downstream wire protocol.
//!
//! Requests and responses are newline-delimited JSON objects addressed by a
//! monotonically increasing integer id within one connection. Two verbs are
//! required of every downstream server: `listTools` and `callTool`. Both
//! transports (line-delimited subprocess and streaming HTTP) speak exactly
//! this shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Verb for listing a server's tools.
pub const METHOD_LIST_TOOLS: &str = "listTools";
/// Verb for invoking a tool.
pub const METHOD_CALL_TOOL: &str = "callTool";

/// Maximum accepted line length: 8 MB.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// One request on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    /// Connection-scoped monotonically increasing id.
    pub id: u64,
    /// The verb (`listTools` or `callTool`).
    pub method: String,
    /// Verb parameters.
    #[serde(default)]
    pub params: Value,
}

/// One response on the wire. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    /// The id of the request being answered.
    pub id: u64,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// A downstream-reported error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// The error message.
    pub message: String,
}

/// A tool entry as returned by `listTools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTool {
    /// Bare tool name on the server.
    pub name: String,
    /// Tool description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
}

/// Write one value as a JSON line.
pub async fn write_line<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &T,
) -> Result<(), std::io::Error> {
    let mut payload = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one JSON line, returning `None` at EOF (clean shutdown).
///
/// Lines past [`MAX_LINE_BYTES`] are a protocol violation and error out.
pub async fn read_line<T: for<'de> Deserialize<'de>, R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("wire line too long: {} bytes (limit {})", line.len(), MAX_LINE_BYTES),
        ));
    }
    let value = serde_json::from_str(line.trim_end())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
