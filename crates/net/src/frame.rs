//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte big-endian length][JSON payload]
//! Maximum frame size: 1MB (sanity limit)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::Packet;

/// Maximum allowed frame size (1MB)
const MAX_FRAME_SIZE: u32 = 1024 * 1024;

fn map_read_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read a length-prefixed frame from a stream.
///
/// A frame whose payload is not a valid packet yields `Error::Malformed`;
/// its bytes have been consumed, so the stream is still aligned and the
/// caller may keep reading. Any other error leaves the stream unusable.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_read_error)?;

    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
        return Err(Error::Protocol("Empty frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(map_read_error)?;

    Packet::from_bytes(&payload).map_err(|e| Error::Malformed(e.to_string()))
}

/// Write a length-prefixed frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let payload = packet
        .to_bytes()
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;

    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Packet too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use std::io::Cursor;
    use tally_core::PeerId;

    fn raw_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let peer_id = PeerId::new();
        let mut buf = Vec::new();
        write_frame(&mut buf, &Packet::Hello { peer_id }).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, Packet::Hello { peer_id });
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_stream_aligned() {
        let mut buf = raw_frame(br#"{"kind":"data","envelope":{"type":"NOPE","payload":{}}}"#);
        write_frame(
            &mut buf,
            &Packet::Data {
                envelope: Envelope::Reset {},
            },
        )
        .await
        .unwrap();

        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::Malformed(_))
        ));
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Packet::Data {
                envelope: Envelope::Reset {}
            }
        );
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 0]);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let mut cursor = Cursor::new(vec![0, 0]);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
