pub mod address;
pub mod fanout;
pub mod file;
pub mod frame;
pub mod memory;
pub mod tcp;

pub use address::{Address, TcpHost};
pub use memory::ChannelHub;

use serde::Deserialize;

use crate::common::Frame;
use crate::error::TransportError;
use file::{FileInput, FileOutput};
use memory::{MemoryInput, MemoryOutput};
use tcp::{TcpInput, TcpListenerOutput, TcpOutput};

/// Tuning shared by every endpoint of a process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Frames buffered per consumer before the producer blocks.
    pub queue_depth: usize,
    pub connect_backoff_ms: u64,
    pub connect_backoff_max_ms: u64,
    /// Give up connecting after this many attempts, retry forever when unset.
    pub connect_attempts: Option<u32>,
    /// Hold frames until the first consumer attaches instead of dropping them.
    pub wait_for_subscriber: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_depth: 2,
            connect_backoff_ms: 100,
            connect_backoff_max_ms: 2000,
            connect_attempts: None,
            wait_for_subscriber: true,
        }
    }
}

/// Everything needed to open endpoints inside one process.
#[derive(Clone, Default)]
pub struct TransportContext {
    pub config: TransportConfig,
    pub hub: ChannelHub,
}

impl TransportContext {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            hub: ChannelHub::new(),
        }
    }
}

/// Where a stage receives frames from.
pub enum InputEndpoint {
    Tcp(TcpInput),
    File(FileInput),
    Memory(MemoryInput),
}

impl InputEndpoint {
    pub async fn open(address: Address, context: &TransportContext) -> Result<Self, TransportError> {
        match &address {
            Address::Tcp { .. } => Ok(InputEndpoint::Tcp(
                TcpInput::open(address, &context.config).await?,
            )),
            Address::File { path, looping } => {
                let (path, looping) = (path.clone(), *looping);
                Ok(InputEndpoint::File(FileInput::open(address, path, looping).await?))
            }
            Address::Memory { name } => {
                let name = name.clone();
                Ok(InputEndpoint::Memory(MemoryInput::open(
                    address,
                    &name,
                    &context.hub,
                    &context.config,
                )))
            }
        }
    }

    /// Waits for the next frame. `EndOfStream` means the producer finished;
    /// every other error means the endpoint is unusable.
    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        match self {
            InputEndpoint::Tcp(input) => input.receive().await,
            InputEndpoint::File(input) => input.receive().await,
            InputEndpoint::Memory(input) => input.receive().await,
        }
    }

    pub fn address(&self) -> &Address {
        match self {
            InputEndpoint::Tcp(input) => input.address(),
            InputEndpoint::File(input) => input.address(),
            InputEndpoint::Memory(input) => input.address(),
        }
    }
}

/// Where a stage sends frames to.
pub enum OutputEndpoint {
    TcpListener(TcpListenerOutput),
    Tcp(TcpOutput),
    File(FileOutput),
    Memory(MemoryOutput),
}

impl OutputEndpoint {
    pub async fn open(address: Address, context: &TransportContext) -> Result<Self, TransportError> {
        match &address {
            Address::Tcp { .. } if address.is_listener() => Ok(OutputEndpoint::TcpListener(
                TcpListenerOutput::bind(address, &context.config).await?,
            )),
            Address::Tcp { .. } => Ok(OutputEndpoint::Tcp(TcpOutput::open(
                address,
                &context.config,
            )?)),
            Address::File { looping: true, .. } => Err(TransportError::InvalidAddress(
                address.to_string(),
                "!loop only applies to sources",
            )),
            Address::File { path, .. } => {
                let path = path.clone();
                Ok(OutputEndpoint::File(FileOutput::create(address, &path).await?))
            }
            Address::Memory { name } => {
                let name = name.clone();
                Ok(OutputEndpoint::Memory(MemoryOutput::open(
                    address,
                    &name,
                    &context.hub,
                    &context.config,
                )))
            }
        }
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match self {
            OutputEndpoint::TcpListener(output) => output.send(frame).await,
            OutputEndpoint::Tcp(output) => output.send(frame).await,
            OutputEndpoint::File(output) => output.send(frame).await,
            OutputEndpoint::Memory(output) => output.send(frame).await,
        }
    }

    /// Ends the stream so consumers stop cleanly.
    pub async fn close(&mut self) {
        match self {
            OutputEndpoint::TcpListener(output) => output.close().await,
            OutputEndpoint::Tcp(output) => output.close().await,
            OutputEndpoint::File(output) => output.close().await,
            OutputEndpoint::Memory(output) => output.close().await,
        }
    }

    pub fn address(&self) -> &Address {
        match self {
            OutputEndpoint::TcpListener(output) => output.address(),
            OutputEndpoint::Tcp(output) => output.address(),
            OutputEndpoint::File(output) => output.address(),
            OutputEndpoint::Memory(output) => output.address(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[tokio::test]
    async fn looping_file_output_is_rejected() {
        let context = TransportContext::default();
        let address: Address = "file:///tmp/never.vfr!loop".parse().unwrap();
        assert!(matches!(
            OutputEndpoint::open(address, &context).await,
            Err(TransportError::InvalidAddress(_, _))
        ));
    }

    #[tokio::test]
    async fn memory_endpoints_share_the_context_hub() {
        let context = TransportContext::default();
        let mut input = InputEndpoint::open("mem://frames".parse().unwrap(), &context)
            .await
            .unwrap();
        let mut output = OutputEndpoint::open("mem://frames".parse().unwrap(), &context)
            .await
            .unwrap();
        output
            .send(Frame::from_image(RgbImage::new(3, 1)))
            .await
            .unwrap();
        assert_eq!(input.receive().await.unwrap().width(), 3);
        output.close().await;
        assert!(input.receive().await.unwrap_err().is_end_of_stream());
    }
}
