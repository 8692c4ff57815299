use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use webcam_stream_common::planes::{yuv420_to_nv21, ConvertError, RawFrame};

use crate::broker::{BrokerError, FrameBroker};
use crate::encoder::{EncodeError, FrameEncoder};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("conversion failed: {0}")]
    Convert(#[from] ConvertError),
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("publish failed: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub published: u64,
    pub dropped: u64,
}

/// Producer side of the stream: raw frame in, JPEG published to the broker.
///
/// Runs synchronously on the frame source's thread. Nothing here touches the
/// network; the only shared state it writes is the broker slot.
pub struct FramePipeline {
    encoder: Box<dyn FrameEncoder>,
    broker: Arc<FrameBroker>,
    quality: u8,
    received: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl FramePipeline {
    pub fn new(encoder: Box<dyn FrameEncoder>, broker: Arc<FrameBroker>, quality: u8) -> Self {
        Self {
            encoder,
            broker,
            quality: quality.min(100),
            received: AtomicU64::new(0),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Convert, encode and publish one frame. Returns the published sequence number.
    pub fn on_frame(&self, frame: &RawFrame<'_>) -> Result<u64, PipelineError> {
        let captured_at_ms = Utc::now().timestamp_millis();
        let nv21 = yuv420_to_nv21(frame)?;
        let jpeg = self.encoder.encode(&nv21, self.quality)?;
        let seq = self.broker.publish(jpeg, captured_at_ms)?;
        Ok(seq)
    }

    /// Frame-source callback: like [`on_frame`](Self::on_frame) but a bad frame
    /// is logged and dropped instead of returned.
    pub fn push(&self, frame: &RawFrame<'_>) -> Option<u64> {
        let received = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        match self.on_frame(frame) {
            Ok(seq) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                if received % 100 == 0 {
                    debug!(
                        received,
                        seq,
                        bytes = self.broker.latest().map_or(0, |f| f.len()),
                        dropped = self.dropped.load(Ordering::Relaxed),
                        viewers = self.broker.subscriber_count(),
                        "frames processed"
                    );
                }
                Some(seq)
            }
            Err(PipelineError::Broker(e)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "broker closed, dropping frame");
                None
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %e,
                    encoder = self.encoder.name(),
                    width = frame.width(),
                    height = frame.height(),
                    "dropping frame"
                );
                None
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
