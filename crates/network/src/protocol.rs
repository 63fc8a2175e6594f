//! Length-prefixed framing for token streams
//!
//! Frame layout: `[len: u32 big-endian][payload: len bytes]`, payload is JSON.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{NetworkError, Result};

/// Largest accepted frame payload (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Read one frame payload
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::ProtocolViolation(format!(
            "frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one frame payload and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::ProtocolViolation(format!(
            "frame of {} bytes exceeds limit of {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame and decode it as JSON
pub async fn read_json_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| NetworkError::ProtocolViolation(format!("malformed frame: {}", e)))
}

/// Encode a value as JSON and write it as one frame
pub async fn write_json_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)
        .map_err(|e| NetworkError::ProtocolViolation(format!("unencodable frame: {}", e)))?;
    write_frame(writer, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use infermesh_core::{StreamMessage, StreamOpen, TokenFrame};

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let mut buf = Cursor::new(Vec::new());
        write_json_frame(&mut buf, &StreamOpen { job_id: "job-1".to_string(), resume_from: 4 })
            .await
            .unwrap();
        write_json_frame(&mut buf, &StreamMessage::Token(TokenFrame::token(4, "hi")))
            .await
            .unwrap();

        buf.set_position(0);
        let open: StreamOpen = read_json_frame(&mut buf).await.unwrap();
        assert_eq!(open.resume_from, 4);
        let msg: StreamMessage = read_json_frame(&mut buf).await.unwrap();
        assert!(matches!(msg, StreamMessage::Token(ref f) if f.index == 4 && f.content == "hi"));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Cursor::new(((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec());
        let err = read_frame(&mut buf).await.unwrap_err();
        assert!(matches!(err, NetworkError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let mut data = 10u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"abc");
        let mut buf = Cursor::new(data);
        assert!(matches!(read_frame(&mut buf).await, Err(NetworkError::Io(_))));
    }

    #[tokio::test]
    async fn test_malformed_json_is_violation() {
        let mut buf = Cursor::new(Vec::new());
        write_frame(&mut buf, b"{oops").await.unwrap();
        buf.set_position(0);
        let result: Result<StreamOpen> = read_json_frame(&mut buf).await;
        assert!(matches!(result, Err(NetworkError::ProtocolViolation(_))));
    }
}
