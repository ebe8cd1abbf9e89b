//! Tool descriptors and fully-qualified tool names.

use serde::{Deserialize, Serialize};
use toolgate_error::GatewayError;

/// Immutable descriptor of one downstream tool.
///
/// Created by the schema cache on first fetch and shared by reference;
/// replaced wholesale on refresh, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Fully-qualified tool name (`[prefix.]server.tool`).
    pub name: String,
    /// Tool description from the downstream server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input arguments.
    pub input_schema: serde_json::Value,
}

/// A parsed fully-qualified tool name.
///
/// The wire form is `[prefix.]server.tool` where `prefix` is an optional
/// gateway-wide namespace. The bare tool name may itself contain dots
/// (downstream servers commonly expose names like `symbols.find`), so
/// parsing takes everything after the server segment verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolName {
    /// The configured namespace prefix, when present on the name.
    pub prefix: Option<String>,
    /// The downstream server name.
    pub server: String,
    /// The bare tool identifier on that server.
    pub tool: String,
}

impl ToolName {
    /// Parse a fully-qualified tool name, stripping `prefix` when configured
    /// and present.
    pub fn parse(qualified: &str, prefix: Option<&str>) -> Result<Self, GatewayError> {
        let mut rest = qualified;
        let mut matched_prefix = None;

        if let Some(p) = prefix {
            if let Some(stripped) = rest.strip_prefix(p).and_then(|r| r.strip_prefix('.')) {
                matched_prefix = Some(p.to_string());
                rest = stripped;
            }
        }

        let (server, tool) = rest.split_once('.').ok_or_else(|| {
            GatewayError::Internal(anyhow::anyhow!(
                "malformed tool name '{qualified}', expected '[prefix.]server.tool'"
            ))
        })?;

        if server.is_empty() || tool.is_empty() {
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "malformed tool name '{qualified}', empty server or tool segment"
            )));
        }

        Ok(Self {
            prefix: matched_prefix,
            server: server.to_string(),
            tool: tool.to_string(),
        })
    }

    /// The canonical wire form, `[prefix.]server.tool`.
    pub fn qualified(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}.{}.{}", p, self.server, self.tool),
            None => format!("{}.{}", self.server, self.tool),
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.qualified())
    }
}
