//! Bounded capture of sandbox output streams.
//!
//! Sandbox programs can print arbitrarily much; capture is cap-and-truncate,
//! never unbounded accumulation. Past the cap the stream is still drained so
//! the child never blocks on a full pipe.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Marker appended to a stream that overflowed its cap.
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// A captured stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    /// The captured text (lossy UTF-8), with [`TRUNCATION_MARKER`] appended
    /// when truncated.
    pub text: String,
    /// Whether the cap was hit.
    pub truncated: bool,
}

/// Read a stream to EOF, keeping at most `cap` bytes.
pub async fn capture_stream<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Captured {
    let mut kept: Vec<u8> = Vec::with_capacity(cap.min(64 * 1024));
    let mut truncated = false;
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let data = &chunk[..n];
                if kept.len() < cap {
                    let room = cap - kept.len();
                    if data.len() <= room {
                        kept.extend_from_slice(data);
                    } else {
                        kept.extend_from_slice(&data[..room]);
                        truncated = true;
                    }
                } else if !data.is_empty() {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    Captured { text, truncated }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn short_stream_is_kept_whole() {
        let captured = capture_stream(Cursor::new(b"hello\n".to_vec()), 1024).await;
        assert_eq!(captured.text, "hello\n");
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn overflow_is_truncated_with_marker() {
        let data = vec![b'x'; 10_000];
        let captured = capture_stream(Cursor::new(data), 100).await;
        assert!(captured.truncated);
        assert!(captured.text.starts_with(&"x".repeat(100)));
        assert!(captured.text.ends_with(TRUNCATION_MARKER));
        assert!(
            captured.text.len() <= 100 + TRUNCATION_MARKER.len(),
            "kept bytes must not exceed the cap"
        );
    }

    #[tokio::test]
    async fn exact_cap_is_not_truncated() {
        let data = vec![b'y'; 100];
        let captured = capture_stream(Cursor::new(data), 100).await;
        assert!(!captured.truncated);
        assert_eq!(captured.text.len(), 100);
    }

    #[tokio::test]
    async fn empty_stream_is_empty() {
        let captured = capture_stream(Cursor::new(Vec::new()), 100).await;
        assert_eq!(captured.text, "");
        assert!(!captured.truncated);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let captured = capture_stream(Cursor::new(vec![0xff, 0xfe, b'a']), 100).await;
        assert!(captured.text.ends_with('a'));
    }
}
