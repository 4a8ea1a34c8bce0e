use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fanout::FanOut;
use super::frame::{FramedAsyncBufferedReader, FramedAsyncBufferedWriter, WireMessage};
use super::{Address, TransportConfig};
use crate::common::Frame;
use crate::error::TransportError;

/// Exponential back-off used while the other side is not up yet.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: Option<u32>,
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.connect_backoff_ms.max(1)),
            max: Duration::from_millis(config.connect_backoff_max_ms.max(config.connect_backoff_ms)),
            attempts: config.connect_attempts,
        }
    }
}

impl RetryPolicy {
    pub async fn connect(&self, socket: &str) -> Result<TcpStream, TransportError> {
        let mut delay = self.initial;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match TcpStream::connect(socket).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    info!("Connected to {} after {} attempt(s)", socket, attempt);
                    return Ok(stream);
                }
                Err(e) => {
                    if self.attempts.is_some_and(|max| attempt >= max) {
                        return Err(TransportError::Connect(e, socket.to_string()));
                    }
                    if attempt == 1 {
                        info!("Waiting for {} to come up: {}", socket, e);
                    } else {
                        debug!("Connect attempt {} to {} failed: {}", attempt, socket, e);
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max);
                }
            }
        }
    }
}

fn socket_of(address: &Address) -> Result<String, TransportError> {
    address
        .socket_addr()
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string(), "not a tcp address"))
}

async fn bind(address: &Address) -> Result<TcpListener, TransportError> {
    let socket = socket_of(address)?;
    TcpListener::bind(&socket)
        .await
        .map_err(|e| TransportError::Bind(e, socket))
}

enum Origin {
    Connect { socket: String, retry: RetryPolicy },
    Listen(TcpListener),
}

/// Consumer side of a tcp link. Connects (or accepts) lazily on first receive.
pub struct TcpInput {
    address: Address,
    origin: Origin,
    reader: Option<FramedAsyncBufferedReader<TcpStream>>,
    finished: bool,
}

impl TcpInput {
    pub async fn open(address: Address, config: &TransportConfig) -> Result<Self, TransportError> {
        let origin = if address.is_listener() {
            let listener = bind(&address).await?;
            info!("Listening for a producer on {}", address);
            Origin::Listen(listener)
        } else {
            Origin::Connect {
                socket: socket_of(&address)?,
                retry: RetryPolicy::from(config),
            }
        };
        Ok(Self {
            address,
            origin,
            reader: None,
            finished: false,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    async fn establish(&self) -> Result<FramedAsyncBufferedReader<TcpStream>, TransportError> {
        let stream = match &self.origin {
            Origin::Connect { socket, retry } => retry.connect(socket).await?,
            Origin::Listen(listener) => {
                let (stream, peer) = listener.accept().await.map_err(TransportError::Read)?;
                info!("Producer {} connected to {}", peer, self.address);
                stream
            }
        };
        Ok(FramedAsyncBufferedReader::new(stream))
    }

    pub async fn receive(&mut self) -> Result<Frame, TransportError> {
        if self.finished {
            return Err(TransportError::EndOfStream);
        }
        if self.reader.is_none() {
            self.reader = Some(self.establish().await?);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Err(TransportError::Closed(self.address.to_string()));
        };
        match reader.read().await {
            Ok(Some(WireMessage::Frame(frame))) => Ok(frame),
            Ok(Some(WireMessage::EndOfStream)) => {
                info!("Producer on {} finished", self.address);
                self.finished = true;
                self.reader = None;
                Err(TransportError::EndOfStream)
            }
            Ok(None) => {
                self.reader = None;
                Err(TransportError::Closed(self.address.to_string()))
            }
            Err(e) => {
                self.reader = None;
                Err(e)
            }
        }
    }
}

/// Producer side that listens and fans frames out to every connected consumer.
pub struct TcpListenerOutput {
    address: Address,
    local_addr: SocketAddr,
    fanout: Arc<FanOut>,
    accept_task: JoinHandle<()>,
    wait_for_subscriber: bool,
}

impl TcpListenerOutput {
    pub async fn bind(address: Address, config: &TransportConfig) -> Result<Self, TransportError> {
        let listener = bind(&address).await?;
        let local_addr = listener.local_addr().map_err(TransportError::Read)?;
        let fanout = Arc::new(FanOut::new(config.queue_depth));
        let accept_task = tokio::spawn(accept_consumers(listener, fanout.clone()));
        info!("Publishing on {} ({})", address, local_addr);
        Ok(Self {
            address,
            local_addr,
            fanout,
            accept_task,
            wait_for_subscriber: config.wait_for_subscriber,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
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
        self.accept_task.abort();
        self.fanout.close().await;
    }
}

impl Drop for TcpListenerOutput {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.fanout.disconnect();
    }
}

async fn accept_consumers(listener: TcpListener, fanout: Arc<FanOut>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                info!("Consumer {} connected", peer);
                let rx = fanout.subscribe();
                tokio::spawn(write_to_consumer(stream, rx, peer));
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn write_to_consumer(stream: TcpStream, mut rx: mpsc::Receiver<WireMessage>, peer: SocketAddr) {
    let mut writer = FramedAsyncBufferedWriter::new(stream);
    while let Some(message) = rx.recv().await {
        let last = matches!(message, WireMessage::EndOfStream);
        if let Err(e) = writer.write(&message).await {
            warn!("Consumer {} went away: {}", peer, e);
            return;
        }
        if last {
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("Stopped writing to {}", peer);
}

/// Producer side that connects to a listening consumer.
pub struct TcpOutput {
    address: Address,
    socket: String,
    retry: RetryPolicy,
    writer: Option<FramedAsyncBufferedWriter<TcpStream>>,
}

impl TcpOutput {
    pub fn open(address: Address, config: &TransportConfig) -> Result<Self, TransportError> {
        Ok(Self {
            socket: socket_of(&address)?,
            address,
            retry: RetryPolicy::from(config),
            writer: None,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.writer.is_none() {
            let stream = self.retry.connect(&self.socket).await?;
            self.writer = Some(FramedAsyncBufferedWriter::new(stream));
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(TransportError::Closed(self.address.to_string()));
        };
        if let Err(e) = writer.write(&WireMessage::Frame(frame)).await {
            self.writer = None;
            return Err(e);
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.write(&WireMessage::EndOfStream).await {
                debug!("Could not send end of stream to {}: {}", self.address, e);
            }
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn quick_config() -> TransportConfig {
        TransportConfig {
            connect_backoff_ms: 10,
            connect_backoff_max_ms: 50,
            ..TransportConfig::default()
        }
    }

    fn frame(value: u8) -> Frame {
        Frame::from_image(RgbImage::from_pixel(2, 2, Rgb([value, value, value])))
    }

    fn consumer_address(port: u16) -> Address {
        format!("tcp://127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn listener_output_feeds_connecting_input() {
        let config = quick_config();
        let mut output = TcpListenerOutput::bind("tcp://*:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let port = output.local_addr().port();
        let mut input = TcpInput::open(consumer_address(port), &config).await.unwrap();

        let consumer = tokio::spawn(async move {
            let first = input.receive().await.unwrap();
            let second = input.receive().await.unwrap();
            let end = input.receive().await.unwrap_err();
            (first, second, end)
        });

        output.send(frame(1)).await.unwrap();
        output.send(frame(2)).await.unwrap();
        output.close().await;

        let (first, second, end) = consumer.await.unwrap();
        assert_eq!(first.image().get_pixel(0, 0), &Rgb([1, 1, 1]));
        assert_eq!(second.image().get_pixel(0, 0), &Rgb([2, 2, 2]));
        assert!(end.is_end_of_stream());
    }

    #[tokio::test]
    async fn consumer_started_first_eventually_connects() {
        let config = quick_config();
        // reserve a free port, then release it so the consumer has to retry
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut input = TcpInput::open(consumer_address(port), &config).await.unwrap();
        let consumer = tokio::spawn(async move { input.receive().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut output = TcpListenerOutput::bind(format!("tcp://*:{port}").parse().unwrap(), &config)
            .await
            .unwrap();
        output.send(frame(7)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.image().get_pixel(1, 1), &Rgb([7, 7, 7]));
    }

    #[tokio::test]
    async fn abrupt_disconnect_is_closed_not_end_of_stream() {
        let config = quick_config();
        let mut output = TcpListenerOutput::bind("tcp://*:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let port = output.local_addr().port();
        let mut input = TcpInput::open(consumer_address(port), &config).await.unwrap();

        let consumer = tokio::spawn(async move {
            let first = input.receive().await;
            let second = input.receive().await;
            (first, second)
        });
        output.send(frame(3)).await.unwrap();
        drop(output);

        let (first, second) = consumer.await.unwrap();
        assert!(first.is_ok());
        assert!(matches!(second, Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn bounded_retries_give_up() {
        let config = TransportConfig {
            connect_attempts: Some(2),
            ..quick_config()
        };
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut input = TcpInput::open(consumer_address(port), &config).await.unwrap();
        assert!(matches!(
            input.receive().await,
            Err(TransportError::Connect(_, _))
        ));
    }

    #[tokio::test]
    async fn connecting_output_reaches_listening_input() {
        let config = quick_config();
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut input = TcpInput::open(format!("tcp://*:{port}").parse().unwrap(), &config)
            .await
            .unwrap();
        let mut output = TcpOutput::open(consumer_address(port), &config).unwrap();

        let consumer = tokio::spawn(async move {
            let frame = input.receive().await.unwrap();
            let end = input.receive().await.unwrap_err();
            (frame, end)
        });
        output.send(frame(5)).await.unwrap();
        output.close().await;

        let (received, end) = consumer.await.unwrap();
        assert_eq!(received.image().get_pixel(0, 1), &Rgb([5, 5, 5]));
        assert!(end.is_end_of_stream());
    }
}
