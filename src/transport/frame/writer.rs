use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use super::{
    FRAME_HEADER_BYTES, FRAME_LENGTH_BYTES, MAX_MESSAGE_BYTES, TAG_END_OF_STREAM, TAG_FRAME,
    WireMessage,
};
use crate::error::TransportError;

pub struct FramedAsyncBufferedWriter<T>
where
    T: AsyncWrite + Unpin + Send,
{
    writer: BufWriter<T>,
}

impl<T: AsyncWrite + Unpin + Send> FramedAsyncBufferedWriter<T> {
    pub fn new(writer: T) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub async fn write(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        let bytes = encode(message)?;
        self.writer
            .write_all(&bytes)
            .await
            .map_err(TransportError::Write)?;
        self.writer.flush().await.map_err(TransportError::Write)
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await.map_err(TransportError::Write)
    }
}

/// Serializes one message including its length prefix.
pub fn encode(message: &WireMessage) -> Result<Bytes, TransportError> {
    match message {
        WireMessage::EndOfStream => {
            let mut buffer = BytesMut::with_capacity(FRAME_LENGTH_BYTES + 1);
            buffer.put_u32_le(1);
            buffer.put_u8(TAG_END_OF_STREAM);
            Ok(buffer.freeze())
        }
        WireMessage::Frame(frame) => {
            let metadata = if frame.data().is_empty() {
                Vec::new()
            } else {
                serde_json::to_vec(frame.data())?
            };
            let pixels = frame.image().as_raw();
            let length = 1 + FRAME_HEADER_BYTES + metadata.len() + pixels.len();
            if length > MAX_MESSAGE_BYTES {
                return Err(TransportError::InvalidFrameLength(MAX_MESSAGE_BYTES, length));
            }

            let mut buffer = BytesMut::with_capacity(FRAME_LENGTH_BYTES + length);
            buffer.put_u32_le(length as u32);
            buffer.put_u8(TAG_FRAME);
            buffer.put_u32_le(frame.width());
            buffer.put_u32_le(frame.height());
            buffer.put_u8(frame.format().tag());
            buffer.put_u32_le(metadata.len() as u32);
            buffer.put_slice(&metadata);
            buffer.put_slice(pixels);
            Ok(buffer.freeze())
        }
    }
}
