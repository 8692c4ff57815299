use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;
use webcam_stream_common::frame::EncodedFrame;

/// The single shared slot. Superseded frames are dropped, never queued.
#[derive(Debug, Default)]
struct Slot {
    frame: Option<EncodedFrame>,
    seq: u64,
    closed: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("frame broker is closed")]
    Closed,
}

/// Latest-wins broadcast of encoded frames.
///
/// The producer calls [`publish`](Self::publish), which swaps the current
/// frame and wakes every waiting reader without ever waiting on them. Each
/// [`FrameReader`] tracks the last sequence number it returned, so a reader
/// that falls behind skips straight to the newest frame; frames published in
/// between are never observed by it.
///
/// A new reader starts at sequence 0, so its first `next()` returns the
/// current frame right away if one has been published.
pub struct FrameBroker {
    tx: watch::Sender<Slot>,
}

impl FrameBroker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Slot::default());
        Self { tx }
    }

    /// Replace the current frame. Returns the sequence number assigned to it.
    pub fn publish(
        &self,
        jpeg_data: impl Into<Bytes>,
        captured_at_ms: i64,
    ) -> Result<u64, BrokerError> {
        let mut assigned = None;
        let jpeg_data = jpeg_data.into();
        self.tx.send_if_modified(|slot| {
            if slot.closed {
                return false;
            }
            slot.seq += 1;
            slot.frame = Some(EncodedFrame::new(jpeg_data, captured_at_ms, slot.seq));
            assigned = Some(slot.seq);
            true
        });
        assigned.ok_or(BrokerError::Closed)
    }

    pub fn subscribe(&self) -> Result<FrameReader, BrokerError> {
        if self.tx.borrow().closed {
            return Err(BrokerError::Closed);
        }
        // A close racing with this call leaves the reader already terminal:
        // its first next() sees `closed` and returns None.
        let reader = FrameReader {
            rx: self.tx.subscribe(),
            last_seen: 0,
        };
        debug!(subscribers = self.subscriber_count(), "reader subscribed");
        Ok(reader)
    }

    /// Close the broker, waking every waiting reader with the end-of-stream
    /// signal. Idempotent.
    pub fn close(&self) {
        let was_open = self.tx.send_if_modified(|slot| {
            if slot.closed {
                return false;
            }
            slot.closed = true;
            slot.frame = None;
            true
        });
        if was_open {
            debug!(subscribers = self.subscriber_count(), "frame broker closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn latest(&self) -> Option<EncodedFrame> {
        self.tx.borrow().frame.clone()
    }

    /// Sequence number of the most recent publish, 0 before the first one.
    pub fn last_seq(&self) -> u64 {
        self.tx.borrow().seq
    }
}

impl Default for FrameBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One viewer's subscription. Dropping it deregisters it from the broker.
pub struct FrameReader {
    rx: watch::Receiver<Slot>,
    last_seen: u64,
}

impl FrameReader {
    /// Wait for a frame newer than the last one returned.
    ///
    /// Returns `None` once the broker has been closed (or dropped).
    pub async fn next(&mut self) -> Option<EncodedFrame> {
        loop {
            {
                let slot = self.rx.borrow_and_update();
                if slot.closed {
                    return None;
                }
                if slot.seq > self.last_seen {
                    if let Some(frame) = &slot.frame {
                        self.last_seen = slot.seq;
                        return Some(frame.clone());
                    }
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Deregister from the broker. Equivalent to dropping the reader.
    pub fn close(self) {}
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        debug!(last_seen = self.last_seen, "reader closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn latest_frame_wins() {
        let broker = FrameBroker::new();
        let mut reader = broker.subscribe().unwrap();

        broker.publish(&b"f1"[..], 1).unwrap();
        broker.publish(&b"f2"[..], 2).unwrap();

        let frame = timeout(WAIT, reader.next()).await.unwrap().unwrap();
        assert_eq!(frame.jpeg_data(), b"f2");
        assert_eq!(frame.seq, 2);

        // f1 is gone for good: nothing newer is pending.
        assert!(timeout(Duration::from_millis(50), reader.next()).await.is_err());
    }

    #[tokio::test]
    async fn new_reader_receives_current_frame() {
        let broker = FrameBroker::new();
        broker.publish(&b"current"[..], 0).unwrap();

        let mut reader = broker.subscribe().unwrap();
        let frame = timeout(WAIT, reader.next()).await.unwrap().unwrap();
        assert_eq!(frame.jpeg_data(), b"current");
        assert_eq!(reader.last_seen(), 1);
    }

    #[tokio::test]
    async fn reader_waits_for_publish() {
        let broker = Arc::new(FrameBroker::new());
        let mut reader = broker.subscribe().unwrap();

        let waiter = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        broker.publish(&b"wake"[..], 0).unwrap();
        let frame = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(frame.jpeg_data(), b"wake");
    }

    #[tokio::test]
    async fn every_reader_sees_final_frame_once() {
        const READERS: usize = 8;
        const PUBLISHES: u64 = 50;

        let broker = Arc::new(FrameBroker::new());
        let mut tasks = Vec::new();
        for _ in 0..READERS {
            let mut reader = broker.subscribe().unwrap();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(frame) = reader.next().await {
                    seen.push(frame.seq);
                    if frame.seq == PUBLISHES {
                        break;
                    }
                }
                seen
            }));
        }

        for i in 1..=PUBLISHES {
            broker.publish(i.to_be_bytes().to_vec(), i as i64).unwrap();
            if i % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }

        for task in tasks {
            let seen = timeout(WAIT, task).await.unwrap().unwrap();
            assert_eq!(seen.iter().filter(|&&s| s == PUBLISHES).count(), 1);
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
        }
    }

    #[tokio::test]
    async fn close_wakes_waiting_readers() {
        let broker = Arc::new(FrameBroker::new());
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let mut reader = broker.subscribe().unwrap();
            waiters.push(tokio::spawn(async move { reader.next().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        broker.close();
        for waiter in waiters {
            assert!(timeout(WAIT, waiter).await.unwrap().unwrap().is_none());
        }
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn closed_broker_rejects_publish_and_subscribe() {
        let broker = FrameBroker::new();
        broker.publish(&b"x"[..], 0).unwrap();
        broker.close();
        broker.close();

        assert_eq!(broker.publish(&b"y"[..], 0), Err(BrokerError::Closed));
        assert!(matches!(broker.subscribe(), Err(BrokerError::Closed)));
        assert!(broker.latest().is_none());
        assert_eq!(broker.last_seq(), 1);
    }

    #[tokio::test]
    async fn closed_or_dropped_reader_deregisters() {
        let broker = FrameBroker::new();
        let a = broker.subscribe().unwrap();
        let b = broker.subscribe().unwrap();
        assert_eq!(broker.subscriber_count(), 2);

        a.close();
        assert_eq!(broker.subscriber_count(), 1);
        drop(b);
        assert_eq!(broker.subscriber_count(), 0);

        // Publishing with nobody listening still updates the slot.
        assert_eq!(broker.publish(&b"z"[..], 0), Ok(1));
        assert_eq!(broker.latest().unwrap().jpeg_data(), b"z");
    }

    #[tokio::test]
    async fn dropping_broker_ends_readers() {
        let broker = FrameBroker::new();
        let mut reader = broker.subscribe().unwrap();
        drop(broker);
        assert!(timeout(WAIT, reader.next()).await.unwrap().is_none());
    }
}
