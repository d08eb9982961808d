//! Extraction of the tunnel target from an HTTP CONNECT request head.
//!
//! The scanner does not validate the request line, method or HTTP version
//! and does not bound the number of lines it reads. Callers wrap the reader
//! with their own size and time limits.

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

pub const HOST_MARKER: &str = "Host: ";

/// Scans `reader` line by line for the first `Host: ` marker and returns the
/// remainder of that line, trimmed.
///
/// Returns `None` when the stream ends (cleanly or with an error) before a
/// marker is seen, or when the marker carries an empty value. Never returns
/// an error.
pub async fn read_connect_target<R>(mut reader: R) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let read_error = match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return None,
            Ok(_) => None,
            Err(e) if line.is_empty() => {
                trace!("Request head ended with error before host: {}", e);
                return None;
            }
            Err(e) => Some(e),
        };

        if let Some(host) = host_from_line(&line) {
            return if host.is_empty() { None } else { Some(host) };
        }

        if let Some(e) = read_error {
            trace!("Request head ended with error before host: {}", e);
            return None;
        }
    }
}

/// Consumes the rest of the request head, up to and including the first
/// empty line, so header bytes are never relayed to the destination.
pub async fn discard_request_head<R>(mut reader: R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "request head not terminated",
            ));
        }
        if line.iter().all(|b| matches!(b, b'\r' | b'\n')) {
            return Ok(());
        }
    }
}

fn host_from_line(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    text.find(HOST_MARKER)
        .map(|start| text[start + HOST_MARKER.len()..].trim().to_string())
}
