use image::RgbImage;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::debug;

use super::{
    FRAME_HEADER_BYTES, FRAME_LENGTH_BYTES, MAX_MESSAGE_BYTES, TAG_END_OF_STREAM, TAG_FRAME,
    WireMessage,
};
use crate::common::{Frame, Metadata, PixelFormat};
use crate::error::TransportError;

pub struct FramedAsyncBufferedReader<T>
where
    T: AsyncRead + Unpin + Send,
{
    reader: BufReader<T>,
}

impl<T: AsyncRead + Unpin + Send> FramedAsyncBufferedReader<T> {
    pub fn new(stream: T) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Reads the next message. `None` means the stream ended cleanly on a
    /// message boundary.
    pub async fn read(&mut self) -> Result<Option<WireMessage>, TransportError> {
        let Some(expected_length) = self.read_frame_length().await? else {
            return Ok(None);
        };
        self.read_frame_data(expected_length).await.map(Some)
    }

    async fn read_frame_length(&mut self) -> Result<Option<usize>, TransportError> {
        let mut length_buffer = [0u8; FRAME_LENGTH_BYTES];
        let first = self
            .reader
            .read(&mut length_buffer)
            .await
            .map_err(TransportError::Read)?;
        if first == 0 {
            debug!("Stream closed between messages");
            return Ok(None);
        }
        self.reader
            .read_exact(&mut length_buffer[first..])
            .await
            .map_err(TransportError::Read)?;

        let length = u32::from_le_bytes(length_buffer) as usize;
        if length == 0 || length > MAX_MESSAGE_BYTES {
            return Err(TransportError::InvalidFrameLength(MAX_MESSAGE_BYTES, length));
        }
        Ok(Some(length))
    }

    async fn read_frame_data(&mut self, expected_length: usize) -> Result<WireMessage, TransportError> {
        let tag = self.reader.read_u8().await.map_err(TransportError::Read)?;
        match tag {
            TAG_END_OF_STREAM => {
                if expected_length != 1 {
                    return Err(TransportError::InvalidFrameLength(1, expected_length));
                }
                Ok(WireMessage::EndOfStream)
            }
            TAG_FRAME => self.read_frame(expected_length).await.map(WireMessage::Frame),
            _ => Err(TransportError::InvalidFrameTag(tag)),
        }
    }

    async fn read_frame(&mut self, expected_length: usize) -> Result<Frame, TransportError> {
        let width = self.reader.read_u32_le().await.map_err(TransportError::Read)?;
        let height = self.reader.read_u32_le().await.map_err(TransportError::Read)?;
        let format = PixelFormat::try_from(self.reader.read_u8().await.map_err(TransportError::Read)?)?;
        let metadata_length = self.reader.read_u32_le().await.map_err(TransportError::Read)? as usize;

        let pixel_bytes = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(3))
            .ok_or(TransportError::InvalidFrameLength(MAX_MESSAGE_BYTES, usize::MAX))?;
        let total = (1 + FRAME_HEADER_BYTES)
            .checked_add(metadata_length)
            .and_then(|n| n.checked_add(pixel_bytes))
            .ok_or(TransportError::InvalidFrameLength(expected_length, usize::MAX))?;
        if total != expected_length {
            return Err(TransportError::InvalidFrameLength(expected_length, total));
        }

        let mut metadata_buffer = vec![0u8; metadata_length];
        self.reader
            .read_exact(&mut metadata_buffer)
            .await
            .map_err(TransportError::Read)?;
        let data: Metadata = if metadata_buffer.is_empty() {
            Metadata::new()
        } else {
            serde_json::from_slice(&metadata_buffer)?
        };

        let mut pixels = vec![0u8; pixel_bytes];
        self.reader
            .read_exact(&mut pixels)
            .await
            .map_err(TransportError::Read)?;
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or(TransportError::InvalidFrameLength(expected_length, total))?;

        debug!("Read {}x{} frame ({} bytes)", width, height, expected_length);
        Ok(Frame::new(image, data, format))
    }
}
