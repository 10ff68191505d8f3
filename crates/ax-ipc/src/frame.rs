//! Length-prefixed framing: 4-byte big-endian payload length, then UTF-8
//! JSON. Both sides drain their read buffer into complete frames; an
//! incomplete tail stays pending until more bytes arrive.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{IpcError, Result};

/// Maximum payload size. A peer announcing more is protocol abuse and the
/// connection is torn down rather than buffered.
pub const MAX_FRAME: usize = 4 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Incremental decoder over a growing byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, or `None` while the tail is incomplete.
    ///
    /// Errors when the announced length exceeds [`MAX_FRAME`]; the caller
    /// must drop the connection since the stream can no longer be trusted
    /// to be frame-aligned.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_FRAME {
            return Err(IpcError::Validation(format!(
                "frame length {len} exceeds maximum {MAX_FRAME}"
            )));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX);
        let payload = self.buf.split_to(len).to_vec();
        Ok(Some(payload))
    }

    /// Bytes buffered but not yet consumed as frames.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME {
        return Err(IpcError::Validation(format!(
            "frame length {} exceeds maximum {MAX_FRAME}",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a JSON value and write it as one frame.
pub async fn write_json<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &serde_json::Value,
) -> Result<()> {
    let payload = serde_json::to_vec(value).map_err(|e| IpcError::Internal(e.to_string()))?;
    write_frame(writer, &payload).await
}

/// Blocking-read one frame. `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        return Err(IpcError::Validation(format!(
            "frame length {len} exceeds maximum {MAX_FRAME}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_a_complete_frame() {
        let mut dec = FrameDecoder::new();
        dec.extend(&frame_bytes(b"{\"ok\":true}"));
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame, b"{\"ok\":true}");
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn partial_tail_stays_pending() {
        let mut dec = FrameDecoder::new();
        let bytes = frame_bytes(b"hello world");

        dec.extend(&bytes[..6]);
        assert!(dec.next_frame().unwrap().is_none());
        assert_eq!(dec.pending(), 6);

        dec.extend(&bytes[6..]);
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"hello world");
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut dec = FrameDecoder::new();
        let bytes = frame_bytes(b"abc");
        for b in &bytes[..bytes.len() - 1] {
            dec.extend(std::slice::from_ref(b));
            assert!(dec.next_frame().unwrap().is_none());
        }
        dec.extend(std::slice::from_ref(bytes.last().unwrap()));
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"abc");
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut dec = FrameDecoder::new();
        let mut bytes = frame_bytes(b"first");
        bytes.extend(frame_bytes(b"second"));
        dec.extend(&bytes);

        assert_eq!(dec.next_frame().unwrap().unwrap(), b"first");
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"second");
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn zero_length_frame_is_valid_framing() {
        let mut dec = FrameDecoder::new();
        dec.extend(&frame_bytes(b""));
        let frame = dec.next_frame().unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn one_byte_frame() {
        let mut dec = FrameDecoder::new();
        dec.extend(&frame_bytes(b"x"));
        assert_eq!(dec.next_frame().unwrap().unwrap(), b"x");
    }

    #[test]
    fn max_frame_accepted() {
        let payload = vec![b'a'; MAX_FRAME];
        let mut dec = FrameDecoder::new();
        dec.extend(&frame_bytes(&payload));
        assert_eq!(dec.next_frame().unwrap().unwrap().len(), MAX_FRAME);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut dec = FrameDecoder::new();
        dec.extend(&((MAX_FRAME as u32 + 1).to_be_bytes()));
        assert!(dec.next_frame().is_err());
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_json(&mut a, &serde_json::json!({"action": "noop"}))
            .await
            .unwrap();

        let frame = read_frame(&mut b).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["action"], "noop");
    }

    #[tokio::test]
    async fn eof_at_boundary_is_none() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
