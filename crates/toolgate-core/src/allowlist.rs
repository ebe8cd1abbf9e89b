//! Per-execution tool-name allow-lists.
//!
//! Each execute-request carries glob patterns over fully-qualified tool
//! names (e.g. `"srv-1.*"`, `"files.search"`). A tool call is permitted only
//! when its name matches at least one pattern; an empty list permits
//! nothing.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use toolgate_error::GatewayError;

/// A compiled allow-list of tool-name glob patterns.
#[derive(Debug)]
pub struct ToolAllowList {
    set: GlobSet,
    patterns: Vec<String>,
}

impl ToolAllowList {
    /// Compile the given patterns. Fails on malformed globs.
    pub fn new(patterns: &[String]) -> Result<Self, GatewayError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map_err(|e| {
                    GatewayError::Internal(anyhow::anyhow!(
                        "invalid allow-list pattern '{pattern}': {e}"
                    ))
                })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("invalid allow-list: {e}")))?;
        Ok(Self {
            set,
            patterns: patterns.to_vec(),
        })
    }

    /// Whether the fully-qualified tool name matches the allow-list.
    pub fn allows(&self, qualified_name: &str) -> bool {
        !self.patterns.is_empty() && self.set.is_match(qualified_name)
    }

    /// The source patterns.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}
