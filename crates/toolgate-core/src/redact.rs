//! Content filtering for sandbox-visible text.
//!
//! Every error message that crosses the bridge back into the sandbox is
//! filtered here first: connection endpoints, file paths, credentials, and
//! stack traces are stripped, while actionable content (validation errors,
//! not-found messages, tool names) is preserved.

use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s'")\]}>]+"#).unwrap());

static IP_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?").unwrap());

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(/[\w.\-]+){2,}").unwrap());

static WINDOWS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]:\\[\w.\\\-]+").unwrap());

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|api_key\s*=\s*\S+|token\s*=\s*\S+|password\s*=\s*\S+|secret\s*=\s*\S+)",
    )
    .unwrap()
});

static STACK_TRACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(at\s+.+|Caused by:.*|[\w.$]+Exception.*|\.{3}\s*\d+\s*more)$").unwrap()
});

/// Filter an error message for a specific tool call before it reaches the
/// sandbox. Keeps the server and tool names so the program can route a
/// retry; strips everything sensitive.
pub fn filter_error_for_tool(server: &str, tool: &str, error: &str) -> String {
    let filtered = filter_text(error);
    format!("tool '{}' on server '{}' failed: {}", tool, server, filtered)
}

/// Strip sensitive patterns from a piece of text.
///
/// Removes, in order:
/// - credentials (Bearer tokens, `api_key=`, `token=`, …) → `[REDACTED]`
/// - URLs → `[url]`
/// - IP:port addresses → `[addr]`
/// - Windows and Unix file paths → `[path]`
/// - stack trace lines → dropped entirely
///
/// Credentials are stripped before URLs because a credential may embed one.
pub fn filter_text(input: &str) -> String {
    let mut msg = input.to_string();

    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = URL_RE.replace_all(&msg, "[url]").to_string();
    msg = IP_PORT_RE.replace_all(&msg, "[addr]").to_string();
    msg = WINDOWS_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg = STACK_TRACE_RE.replace_all(&msg, "").to_string();

    let lines: Vec<&str> = msg.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.join("\n")
}
