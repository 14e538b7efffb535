// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Newline-delimited JSON framing.
//!
//! One JSON value per line, UTF-8, `\n` terminated.  Malformed lines are
//! discarded with a warning and the connection stays open; only I/O errors
//! end a stream.

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::protocol::Envelope;

/// Read the next well-formed envelope, skipping malformed lines.
/// `Ok(None)` means the peer closed the stream.
pub async fn read_frame<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<Envelope>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(trimmed) {
            Ok(envelope) => return Ok(Some(envelope)),
            Err(e) => {
                warn!(error = %e, "discarding malformed frame");
                continue;
            }
        }
    }
}

/// Serialise one envelope and append the terminating newline.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(envelope)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_one_envelope_per_line() {
        let input = b"{\"id\":\"1\",\"method\":\"daemon.ping\"}\n{\"method\":\"log\"}\n";
        let mut reader = BufReader::new(&input[..]);

        let first = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.id.as_deref(), Some("1"));
        let second = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.method.as_deref(), Some("log"));
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let input = b"this is not json\n{\"id\":\"2\",\"method\":\"daemon.ping\"}\n";
        let mut reader = BufReader::new(&input[..]);

        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let input = b"\n\n{\"id\":\"3\",\"method\":\"daemon.ping\"}\n";
        let mut reader = BufReader::new(&input[..]);
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.id.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn write_appends_newline() {
        let mut out: Vec<u8> = Vec::new();
        let env = Envelope::response_ok("r-1", serde_json::json!({"pong": true}));
        write_frame(&mut out, &env).await.unwrap();
        assert_eq!(out, b"{\"id\":\"r-1\",\"result\":{\"pong\":true}}\n");
    }
}
