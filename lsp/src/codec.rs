//! JSON-RPC framing codec for the analysis server transport.
//!
//! Both the stdio and the socket transport carry `Content-Length: N\r\n\r\n{json}`
//! frames. [`FrameReader`] and [`FrameWriter`] work over any async byte
//! stream, so the same code serves a spawned child process, a TCP socket,
//! and the in-memory pipes used by tests.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Failure while reading or writing a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected EOF while reading headers")]
    TruncatedHeaders,
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {max}", max = MAX_FRAME_BYTES)]
    Oversized(usize),
    #[error("frame body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { context, source }
    }
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(FrameError::Oversized(content_length));
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(FrameError::io("reading frame body"))?;

        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(FrameError::io("reading header line"))?;

            if bytes_read == 0 {
                // EOF is only clean before the first header byte of a frame.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(FrameError::TruncatedHeaders);
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                let len = value
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .ok_or(FrameError::MissingContentLength)
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg` and write it with its `Content-Length` header.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), FrameError> {
        let body = serde_json::to_string(msg)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .map_err(FrameError::io("writing frame header"))?;
        self.writer
            .write_all(body.as_bytes())
            .await
            .map_err(FrameError::io("writing frame body"))?;
        self.writer
            .flush()
            .await
            .map_err(FrameError::io("flushing frame"))?;

        Ok(())
    }

    /// Flush and shut down the underlying writer.
    pub async fn close(&mut self) -> Result<(), FrameError> {
        self.writer
            .shutdown()
            .await
            .map_err(FrameError::io("closing writer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_frame_survives_write_and_read() {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "$/progress",
            "params": { "token": "GLS-SERVER-SETUP", "value": { "kind": "end" } }
        });

        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&msg).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_headers_is_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 10\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::TruncatedHeaders)
        ));
    }

    #[tokio::test]
    async fn missing_content_length_is_error() {
        let mut reader = FrameReader::new(&b"Content-Type: application/json\r\n\r\n{}"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::MissingContentLength)
        ));
    }

    #[tokio::test]
    async fn invalid_content_length_is_error() {
        let mut reader = FrameReader::new(&b"Content-Length: lots\r\n\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::InvalidContentLength(v)) if v == "lots"
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive_and_extra_headers_ignored() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len(),
        );
        let mut reader = FrameReader::new(frame.as_bytes());
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn invalid_json_body_is_error() {
        let body = "not json";
        let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
        let mut reader = FrameReader::new(frame.as_bytes());
        assert!(matches!(reader.read_frame().await, Err(FrameError::Json(_))));
    }

    #[tokio::test]
    async fn content_length_counts_bytes() {
        let msg = serde_json::json!({"message": "Compilação"});
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&msg).await.unwrap();

        let body = serde_json::to_string(&msg).unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(output.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
    }
}
