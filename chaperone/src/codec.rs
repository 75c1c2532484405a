//! Wire codec for the varnishadm management protocol.
//!
//! Frame layout (13-byte header + body + trailing newline):
//!
//! ```text
//! bytes 0..2   status code, right-aligned, space-padded
//! byte  3      0x20
//! bytes 4..11  body length, right-aligned, space-padded
//! byte  12     0x0A
//! bytes 13..   body (N bytes)
//! byte  13+N   0x0A
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Body length above which a frame is rejected outright.
pub const MAX_BODY_LEN: usize = 10 * 1024 * 1024;

const HEADER_LEN: usize = 13;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("comms error: {0}")]
    Comms(#[from] std::io::Error),
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("body length {0} exceeds the {1} byte cap")]
    BodyTooLarge(usize, usize),
    #[error("missing trailing newline")]
    MissingTrailingNewline,
}

/// A decoded varnishadm response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    pub status: i16,
    pub payload: String,
}

impl AdminResponse {
    pub fn new(status: i16, payload: impl Into<String>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    /// `ok ⇔ status == 200`.
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Status 400, the comms-failure sentinel surfaced on I/O/protocol errors.
    pub fn comms_error(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// Encode this response into the wire format and write it to `w`.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CodecError> {
        let body = self.payload.as_bytes();
        if body.len() > MAX_BODY_LEN {
            return Err(CodecError::BodyTooLarge(body.len(), MAX_BODY_LEN));
        }
        let header = format!("{:3} {:8}\n", self.status, body.len());
        debug_assert_eq!(header.len(), HEADER_LEN);
        w.write_all(header.as_bytes()).await?;
        w.write_all(body).await?;
        w.write_all(b"\n").await?;
        w.flush().await?;
        Ok(())
    }

    /// Read and decode one response frame from `r`.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CodecError> {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header).await?;

        if header[3] != b' ' || header[12] != b'\n' {
            return Err(CodecError::MalformedHeader(
                "unexpected whitespace byte at position 3 or 12".to_string(),
            ));
        }

        let status: i16 = std::str::from_utf8(&header[0..3])
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| CodecError::MalformedHeader("non-numeric status code".to_string()))?;

        let body_len: usize = std::str::from_utf8(&header[4..12])
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| CodecError::MalformedHeader("non-numeric body length".to_string()))?;

        if body_len > MAX_BODY_LEN {
            return Err(CodecError::BodyTooLarge(body_len, MAX_BODY_LEN));
        }

        let mut body = vec![0u8; body_len];
        r.read_exact(&mut body).await?;

        let mut trailing = [0u8; 1];
        r.read_exact(&mut trailing).await?;
        if trailing[0] != b'\n' {
            return Err(CodecError::MissingTrailingNewline);
        }

        let payload = String::from_utf8_lossy(&body).into_owned();
        Ok(Self { status, payload })
    }
}

/// Encode a command line to be written in the reverse direction (`<line>\n`).
pub fn encode_command(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_empty_body() {
        let resp = AdminResponse::new(200, "");
        let mut buf = Vec::new();
        resp.write_to(&mut buf).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = AdminResponse::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, resp);
    }

    #[tokio::test]
    async fn round_trips_nonempty_body() {
        let resp = AdminResponse::new(200, "PONG\nextra line");
        let mut buf = Vec::new();
        resp.write_to(&mut buf).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = AdminResponse::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, resp);
    }

    #[tokio::test]
    async fn round_trips_negative_style_unknown_status_forward_compat() {
        // codec does not validate against the enum; any 3-digit-ish value round-trips.
        let resp = AdminResponse::new(999, "whatever");
        let mut buf = Vec::new();
        resp.write_to(&mut buf).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = AdminResponse::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, resp);
    }

    #[tokio::test]
    async fn rejects_body_too_large_on_write() {
        let huge = "x".repeat(MAX_BODY_LEN + 1);
        let resp = AdminResponse::new(200, huge);
        let mut buf = Vec::new();
        let err = resp.write_to(&mut buf).await.unwrap_err();
        assert!(matches!(err, CodecError::BodyTooLarge(_, _)));
    }

    #[tokio::test]
    async fn rejects_malformed_whitespace() {
        let mut buf = b"200X       8\nXXXXXXXX\n".to_vec();
        buf[3] = b'X';
        let mut cursor = Cursor::new(buf);
        let err = AdminResponse::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CodecError::MalformedHeader(_)));
    }

    #[tokio::test]
    async fn rejects_missing_trailing_newline() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"200      4\n");
        buf.extend_from_slice(b"ABCDX"); // wrong trailing byte instead of \n
        let mut cursor = Cursor::new(buf);
        let err = AdminResponse::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CodecError::MissingTrailingNewline));
    }

    #[tokio::test]
    async fn rejects_oversized_declared_body_len() {
        let header = format!("200 {:8}\n", MAX_BODY_LEN + 1);
        let mut cursor = Cursor::new(header.into_bytes());
        let err = AdminResponse::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CodecError::BodyTooLarge(_, _)));
    }

    #[tokio::test]
    async fn short_read_maps_to_comms_error() {
        let mut cursor = Cursor::new(b"200 ".to_vec());
        let err = AdminResponse::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CodecError::Comms(_)));
    }
}
