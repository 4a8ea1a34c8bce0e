use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use super::frame::WireMessage;

/// Delivers every published message to each subscriber through its own
/// bounded queue. A full queue makes `publish` wait, which is how a slow
/// consumer pushes back on its producer.
pub struct FanOut {
    subscribers: Mutex<Vec<mpsc::Sender<WireMessage>>>,
    joined: Notify,
    closed: AtomicBool,
    queue_depth: usize,
}

impl FanOut {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            joined: Notify::new(),
            closed: AtomicBool::new(false),
            queue_depth: queue_depth.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::Sender<WireMessage>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> mpsc::Receiver<WireMessage> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        if !self.closed.load(Ordering::Acquire) {
            self.lock().push(tx);
            self.joined.notify_one();
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Waits until at least one subscriber is attached.
    pub async fn wait_for_subscriber(&self) {
        loop {
            let joined = self.joined.notified();
            if self.subscriber_count() > 0 {
                return;
            }
            joined.await;
        }
    }

    /// Sends `message` to every live subscriber and returns how many accepted it.
    pub async fn publish(&self, message: WireMessage) -> usize {
        let senders: Vec<_> = self.lock().clone();
        if senders.is_empty() {
            return 0;
        }
        let results = join_all(senders.iter().map(|tx| tx.send(message.clone()))).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        if delivered < senders.len() {
            let mut subscribers = self.lock();
            subscribers.retain(|tx| !tx.is_closed());
            debug!(
                "Dropped {} closed subscriber(s), {} left",
                senders.len() - delivered,
                subscribers.len()
            );
        }
        delivered
    }

    /// Tells subscribers the stream is over and lets go of them.
    pub async fn close(&self) {
        self.publish(WireMessage::EndOfStream).await;
        self.disconnect();
    }

    /// Drops every subscriber without an end-of-stream marker.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Frame;
    use image::RgbImage;
    use std::time::Duration;

    fn message() -> WireMessage {
        WireMessage::Frame(Frame::from_image(RgbImage::new(1, 1)))
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_message() {
        let fanout = FanOut::new(4);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();
        assert_eq!(fanout.publish(message()).await, 2);
        assert!(matches!(a.recv().await, Some(WireMessage::Frame(_))));
        assert!(matches!(b.recv().await, Some(WireMessage::Frame(_))));
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let fanout = FanOut::new(4);
        let _kept = fanout.subscribe();
        drop(fanout.subscribe());
        assert_eq!(fanout.publish(message()).await, 1);
        assert_eq!(fanout.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn full_queue_applies_back_pressure() {
        let fanout = FanOut::new(1);
        let mut rx = fanout.subscribe();
        fanout.publish(message()).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), fanout.publish(message())).await;
        assert!(blocked.is_err(), "second publish should wait for the consumer");

        rx.recv().await.unwrap();
        let freed = tokio::time::timeout(Duration::from_millis(500), fanout.publish(message())).await;
        assert_eq!(freed.unwrap(), 1);
    }

    #[tokio::test]
    async fn wait_for_subscriber_wakes_on_join() {
        let fanout = std::sync::Arc::new(FanOut::new(1));
        let waiter = {
            let fanout = fanout.clone();
            tokio::spawn(async move { fanout.wait_for_subscriber().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _rx = fanout.subscribe();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn close_sends_end_of_stream_then_hangs_up() {
        let fanout = FanOut::new(2);
        let mut rx = fanout.subscribe();
        fanout.close().await;
        assert!(matches!(rx.recv().await, Some(WireMessage::EndOfStream)));
        assert!(rx.recv().await.is_none());

        // late subscribers see a closed channel
        let mut late = fanout.subscribe();
        assert!(late.recv().await.is_none());
    }
}
