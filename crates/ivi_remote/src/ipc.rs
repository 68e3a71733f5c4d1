//! Framed transport between a source and its replicas
//!
//! Each frame is a 4-byte big-endian length, one message type byte and the
//! JSON payload. The length covers the type byte and the payload.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{RemoteError, RemoteResult};
use crate::protocol::MessageType;

/// Largest accepted frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One message on the wire
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Parse payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> RemoteResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Writing half of a framed stream
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, frame: &Frame) -> RemoteResult<()> {
        let len = 1 + frame.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(RemoteError::FrameTooLarge(len));
        }
        self.inner.write_all(&(len as u32).to_be_bytes()).await?;
        self.inner.write_all(&[frame.msg_type as u8]).await?;
        self.inner.write_all(&frame.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a message with JSON payload
    pub async fn send_json<T: Serialize>(&mut self, msg_type: MessageType, data: &T) -> RemoteResult<()> {
        let payload = serde_json::to_vec(data)?;
        self.send(&Frame::new(msg_type, payload)).await
    }
}

/// Reading half of a framed stream
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive the next frame; `None` on a clean end of stream
    pub async fn recv(&mut self) -> RemoteResult<Option<Frame>> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(RemoteError::EmptyFrame);
        }
        if len > MAX_FRAME_LEN {
            return Err(RemoteError::FrameTooLarge(len));
        }

        // Read message type (1 byte)
        let mut type_buf = [0u8; 1];
        self.inner.read_exact(&mut type_buf).await?;
        let msg_type = MessageType::try_from(type_buf[0])?;

        // Read payload
        let mut payload = vec![0u8; len - 1];
        if !payload.is_empty() {
            self.inner.read_exact(&mut payload).await?;
        }

        Ok(Some(Frame::new(msg_type, payload)))
    }
}

/// Split a bidirectional stream into framed halves
pub fn split<S>(stream: S) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (FrameReader::new(read), FrameWriter::new(write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut writer) = split(client);
        let (mut reader, _) = split(server);

        writer
            .send_json(MessageType::PropertyChanged, &json!({ "name": "frequency", "value": 87_500 }))
            .await
            .unwrap();
        writer.send(&Frame::new(MessageType::Ready, Vec::new())).await.unwrap();

        let first = reader.recv().await.unwrap().unwrap();
        assert_eq!(first.msg_type, MessageType::PropertyChanged);
        let body: serde_json::Value = first.parse_json().unwrap();
        assert_eq!(body["value"], 87_500);

        let second = reader.recv().await.unwrap().unwrap();
        assert_eq!(second.msg_type, MessageType::Ready);
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn test_eof_is_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_oversized_and_unknown_frames() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        client.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        assert!(matches!(reader.recv().await, Err(RemoteError::FrameTooLarge(_))));

        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        client.write_all(&1u32.to_be_bytes()).await.unwrap();
        client.write_all(&[99]).await.unwrap();
        assert!(matches!(reader.recv().await, Err(RemoteError::UnknownMessageType(99))));
    }
}
