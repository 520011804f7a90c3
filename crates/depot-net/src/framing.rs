//! Length-prefixed frame I/O
//!
//! Every message on a depot connection is one frame: a little-endian `u32`
//! payload length followed by the payload bytes. The payload itself is a
//! self-describing archive (see `depot-wire`), so this module never inspects
//! it.

use crate::error::{Error, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame's payload.
///
/// A length prefix above this limit is treated as a protocol error rather
/// than an allocation request; the receiving side closes the connection.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one `[u32 length][payload]` frame and flush it.
///
/// Nothing is written if the payload exceeds [`MAX_FRAME_LEN`].
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
///
/// EOF in the middle of a frame, or a length prefix above
/// [`MAX_FRAME_LEN`], is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();
        write_frame(&mut buf, b"world!").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), &b""[..]);
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), &b"world!"[..]);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"complete").await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_length_prefix_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        buf.extend_from_slice(b"junk");

        let mut cursor = std::io::Cursor::new(buf);
        match read_frame(&mut cursor).await {
            Err(Error::FrameTooLarge { .. }) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversize_payload_not_written() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let mut buf = Vec::new();
        assert!(write_frame(&mut buf, &payload).await.is_err());
        assert!(buf.is_empty());
    }
}
