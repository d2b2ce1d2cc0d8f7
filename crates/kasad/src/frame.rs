//! Line-delimited JSON framing shared by every TCP connection.
//!
//! One JSON object per line, in both directions. Reads are bounded by a
//! maximum frame size; writes are bounded by [`WRITE_TIMEOUT`].

use std::time::Duration;

use kasa_protocol::ProtocolVersion;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::time::timeout;

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur on a framed connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: peer {peer}, local {local}")]
    VersionMismatch {
        peer: ProtocolVersion,
        local: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Reads JSON frames from a byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_size: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_size,
        }
    }

    /// Reads the next frame, skipping blank lines.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<T, ConnectionError> {
        loop {
            let mut line = String::new();
            let limit = u64::try_from(self.max_size)
                .unwrap_or(u64::MAX)
                .saturating_add(1);

            let bytes_read = (&mut self.reader)
                .take(limit)
                .read_line(&mut line)
                .await
                .map_err(|e| ConnectionError::Io(e.to_string()))?;

            if bytes_read == 0 {
                return Err(ConnectionError::Eof);
            }

            if line.trim_end_matches(|c| c == '\r' || c == '\n').len() > self.max_size {
                return Err(ConnectionError::MessageTooLarge {
                    size: line.len(),
                    max: self.max_size,
                });
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return serde_json::from_str(trimmed)
                .map_err(|e| ConnectionError::ParseError(e.to_string()));
        }
    }
}

/// Writes JSON frames to a byte stream.
pub struct FrameWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::new(inner),
        }
    }

    /// Serializes `msg` and writes it as one line.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        let writer = &mut self.writer;
        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Checks a peer's protocol version against ours.
pub fn check_version(peer: ProtocolVersion) -> Result<(), ConnectionError> {
    ProtocolVersion::check_peer(peer).map_err(|_| ConnectionError::VersionMismatch {
        peer,
        local: ProtocolVersion::CURRENT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasa_protocol::{ClientMessage, ClientMessageType};

    #[tokio::test]
    async fn test_frames_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server, 1024);

        writer.send(&ClientMessage::ping(3)).await.unwrap();
        writer.send(&ClientMessage::request("GATT active")).await.unwrap();

        let first: ClientMessage = reader.next().await.unwrap();
        assert_eq!(first.message, ClientMessageType::Ping { seq: 3 });
        let second: ClientMessage = reader.next().await.unwrap();
        assert_eq!(
            second.message,
            ClientMessageType::Request {
                payload: "GATT active".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server, 16);

        client.write_all(&[b'x'; 64]).await.unwrap();
        client.write_all(b"\n").await.unwrap();

        let err = reader.next::<ClientMessage>().await.unwrap_err();
        assert!(matches!(err, ConnectionError::MessageTooLarge { max: 16, .. }));
    }

    #[tokio::test]
    async fn test_eof_and_garbage() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server, 1024);

        client.write_all(b"\n{not json}\n").await.unwrap();
        drop(client);

        let err = reader.next::<ClientMessage>().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ParseError(_)));
        let err = reader.next::<ClientMessage>().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Eof));
    }

    #[test]
    fn test_version_check() {
        assert!(check_version(ProtocolVersion::new(1, 4)).is_ok());
        let err = check_version(ProtocolVersion::new(2, 0)).unwrap_err();
        assert!(err.to_string().contains("2.0"));
    }
}
