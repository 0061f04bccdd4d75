//! Length-prefixed framing shared by the broker and every client.
//!
//! A frame is a 4-byte little-endian `u32` length followed by exactly that many
//! bytes of UTF-8 JSON. Frames are never empty and never exceed
//! [`MAX_FRAME_LEN`]; a peer announcing anything else is treated as broken.

use std::io::ErrorKind;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single payload (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("zero-length frame")]
    Empty,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("transport is not connected")]
    NotConnected,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// `true` when the peer went away, as opposed to sending something invalid.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Truncated | FrameError::NotConnected => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

fn check_len(len: usize) -> Result<(), FrameError> {
    // A signed length from a foreign peer shows up here as > MAX_FRAME_LEN.
    match len {
        0 => Err(FrameError::Empty),
        n if n > MAX_FRAME_LEN => Err(FrameError::TooLarge(n)),
        _ => Ok(()),
    }
}

/// Reads one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_le_bytes(header) as usize;
    check_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

/// Writes one frame and flushes it. Header and payload go out in a single
/// `write_all` so a concurrent writer can never split them.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    check_len(payload.len())?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut a, mut b) = duplex(4 * MAX_FRAME_LEN);

        let small = br#"{"type":"ACK"}"#.to_vec();
        let max = vec![b'x'; MAX_FRAME_LEN];

        write_frame(&mut a, &small).await.unwrap();
        write_frame(&mut a, &max).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), small);
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap().len(), MAX_FRAME_LEN);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_length_header_is_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&0u32.to_le_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Empty));
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_reading_payload() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes()).await.unwrap();
        // no payload follows; the reader must bail on the header alone

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(n) if n == MAX_FRAME_LEN + 1));
    }

    #[tokio::test]
    async fn negative_length_from_signed_peer_is_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&(-5i32).to_le_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut b).await.unwrap_err(),
            FrameError::TooLarge(_)
        ));
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_truncation() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn writer_refuses_invalid_payloads() {
        let (mut a, _b) = duplex(64);
        assert!(matches!(write_frame(&mut a, b"").await, Err(FrameError::Empty)));

        let too_big = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            write_frame(&mut a, &too_big).await,
            Err(FrameError::TooLarge(_))
        ));
    }
}
