use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::fanout::FanOut;
use super::frame::WireMessage;
use super::{Address, TransportConfig};
use crate::common::Frame;
use crate::error::TransportError;

/// Registry of `mem://` channels shared by every stage of one process.
#[derive(Clone, Default)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, Arc<FanOut>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel called `name`, creating it on first use so that
    /// consumers may attach before their producer exists.
    pub fn channel(&self, name: &str, queue_depth: usize) -> Arc<FanOut> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FanOut::new(queue_depth)))
            .clone()
    }
}

pub struct MemoryInput {
    address: Address,
    rx: mpsc::Receiver<WireMessage>,
    finished: bool,
}

impl MemoryInput {
    pub fn open(address: Address, name: &str, hub: &ChannelHub, config: &TransportConfig) -> Self {
        let rx = hub.channel(name, config.queue_depth).subscribe();
        debug!("Subscribed to {}", address);
        Self {
            address,
            rx,
            finished: false,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        if self.finished {
            return Err(TransportError::EndOfStream);
        }
        match self.rx.recv().await {
            Some(WireMessage::Frame(frame)) => Ok(frame),
            Some(WireMessage::EndOfStream) => {
                self.finished = true;
                Err(TransportError::EndOfStream)
            }
            None => Err(TransportError::Closed(self.address.to_string())),
        }
    }
}

pub struct MemoryOutput {
    address: Address,
    fanout: Arc<FanOut>,
    wait_for_subscriber: bool,
}

impl MemoryOutput {
    pub fn open(address: Address, name: &str, hub: &ChannelHub, config: &TransportConfig) -> Self {
        let fanout = hub.channel(name, config.queue_depth);
        Self {
            address,
            fanout,
            wait_for_subscriber: config.wait_for_subscriber,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.wait_for_subscriber && self.fanout.subscriber_count() == 0 {
            info!("Waiting for a consumer on {}", self.address);
            self.fanout.wait_for_subscriber().await;
        }
        if self.fanout.publish(WireMessage::Frame(frame)).await == 0 {
            debug!("No consumer on {}, frame dropped", self.address);
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        self.fanout.close().await;
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        // consumers see a hang-up unless close() already ended the stream
        self.fanout.disconnect();
    }
}
