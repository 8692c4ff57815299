use std::io;

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::info;
use webcam_stream_common::frame::EncodedFrame;
use webcam_stream_common::multipart;

use crate::broker::FrameReader;

/// Why a writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The broker was closed; the stream ended normally.
    BrokerClosed,
    /// The body was dropped before it ended, which is how a viewer
    /// disconnect shows up.
    ClientGone,
    /// The server asked the writer to stop.
    Stopped,
}

/// Serializes frames from one broker subscription as multipart parts.
///
/// Parts are produced on demand: a part is only built when the HTTP body is
/// polled for more data, and it always carries the newest frame at that
/// moment. A viewer that stops reading holds at most the part in flight,
/// never a backlog of older frames.
pub struct StreamWriter {
    /// `None` once the writer has ended.
    reader: Option<FrameReader>,
    boundary: String,
    stop: CancellationToken,
    viewer: String,
    frames_sent: u64,
    last_seq: u64,
    exit: Option<WriterExit>,
    _tracked: Option<TaskTrackerToken>,
}

impl StreamWriter {
    pub fn new(
        reader: FrameReader,
        boundary: impl Into<String>,
        stop: CancellationToken,
        viewer: impl Into<String>,
    ) -> Self {
        Self {
            reader: Some(reader),
            boundary: boundary.into(),
            stop,
            viewer: viewer.into(),
            frames_sent: 0,
            last_seq: 0,
            exit: None,
            _tracked: None,
        }
    }

    /// Keep `tracker.wait()` pending until this writer is dropped.
    pub fn tracked_by(mut self, tracker: &TaskTracker) -> Self {
        self._tracked = Some(tracker.token());
        self
    }

    /// Wait for a frame newer than the last one sent and frame it as a part.
    /// `None` once the broker closes or the stop token fires.
    async fn next_part(&mut self) -> Option<[Bytes; 3]> {
        let reader = self.reader.as_mut()?;
        let next = tokio::select! {
            _ = self.stop.cancelled() => Err(WriterExit::Stopped),
            frame = reader.next() => frame.ok_or(WriterExit::BrokerClosed),
        };
        match next {
            Ok(frame) => {
                self.frames_sent += 1;
                self.last_seq = reader.last_seen();
                Some(part_chunks(&self.boundary, &frame))
            }
            Err(exit) => {
                self.exit = Some(exit);
                if let Some(reader) = self.reader.take() {
                    reader.close();
                }
                None
            }
        }
    }

    /// Body stream for this viewer. Ends when the broker closes or the stop
    /// token fires; dropping it deregisters the subscription.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::unfold(self, |mut writer| async move {
            let chunks = writer.next_part().await?;
            Some((chunks, writer))
        })
        .flat_map(|chunks| stream::iter(chunks.map(Ok::<_, io::Error>)))
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        let exit = self.exit.unwrap_or(WriterExit::ClientGone);
        info!(
            viewer = self.viewer,
            frames_sent = self.frames_sent,
            last_seq = self.last_seq,
            exit = ?exit,
            "stream writer finished"
        );
    }
}

/// Header, payload and trailing CRLF of one part. The payload is shared with
/// the broker's frame, not copied.
fn part_chunks(boundary: &str, frame: &EncodedFrame) -> [Bytes; 3] {
    [
        Bytes::from(multipart::part_header(boundary, frame.len())),
        frame.bytes(),
        Bytes::from_static(b"\r\n"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FrameBroker;
    use std::pin::pin;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use webcam_stream_common::multipart::MultipartParser;

    const WAIT: Duration = Duration::from_secs(2);

    fn writer(broker: &FrameBroker, stop: &CancellationToken) -> StreamWriter {
        StreamWriter::new(broker.subscribe().unwrap(), "frameboundary", stop.clone(), "test")
    }

    /// Pull chunks from `body` until `parser` yields a complete part.
    async fn read_part<S>(body: &mut S, parser: &mut MultipartParser) -> Bytes
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        loop {
            if let Some(part) = parser.next_part().unwrap() {
                return part;
            }
            let chunk = timeout(WAIT, body.next())
                .await
                .unwrap()
                .expect("stream ended early")
                .unwrap();
            parser.push(&chunk);
        }
    }

    #[tokio::test]
    async fn writes_parts_with_exact_content_length() {
        let broker = FrameBroker::new();
        let stop = CancellationToken::new();
        let mut body = pin!(writer(&broker, &stop).into_stream());

        let payloads: [&[u8]; 3] = [b"\xFF\xD8one\xFF\xD9", b"\xFF\xD8\r\n--frameboundary\xFF\xD9", b""];
        let mut parser = MultipartParser::new("frameboundary");
        for payload in payloads {
            broker.publish(payload.to_vec(), 0).unwrap();
            let part = read_part(&mut body, &mut parser).await;
            assert_eq!(&part[..], payload);
        }

        broker.close();
        assert!(timeout(WAIT, body.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wire_format_of_one_part() {
        let broker = FrameBroker::new();
        let stop = CancellationToken::new();
        broker.publish(&b"JPEG"[..], 0).unwrap();

        let mut body = pin!(writer(&broker, &stop).into_stream());
        let mut wire = Vec::new();
        for _ in 0..3 {
            let chunk = timeout(WAIT, body.next()).await.unwrap().unwrap().unwrap();
            wire.extend_from_slice(&chunk);
        }
        assert_eq!(
            wire,
            b"--frameboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG\r\n"
        );
    }

    #[test]
    fn part_payload_shares_frame_buffer() {
        let frame = EncodedFrame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 0, 1);
        let [header, payload, trailer] = part_chunks("b", &frame);
        assert_eq!(&header[..], b"--b\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n");
        assert_eq!(payload.as_ptr(), frame.jpeg_data().as_ptr());
        assert_eq!(&trailer[..], b"\r\n");
    }

    #[tokio::test]
    async fn paused_viewer_resumes_at_latest_frame() {
        let broker = Arc::new(FrameBroker::new());
        let stop = CancellationToken::new();
        let mut body = pin!(writer(&broker, &stop).into_stream());
        let mut parser = MultipartParser::new("frameboundary");

        // The viewer reads nothing while 20 frames go by.
        for i in 1..=20u8 {
            broker.publish(vec![i; 16 * 1024], 0).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.last_seq(), 20);

        let part = read_part(&mut body, &mut parser).await;
        assert_eq!(part.len(), 16 * 1024);
        assert!(part.iter().all(|&b| b == 20));
    }

    #[tokio::test]
    async fn dropping_body_deregisters_reader() {
        let broker = FrameBroker::new();
        let stop = CancellationToken::new();
        let body = writer(&broker, &stop).into_stream();
        assert_eq!(broker.subscriber_count(), 1);

        drop(body);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stop_token_ends_idle_stream() {
        let broker = FrameBroker::new();
        let stop = CancellationToken::new();
        let mut body = pin!(writer(&broker, &stop).into_stream());

        stop.cancel();
        assert!(timeout(WAIT, body.next()).await.unwrap().is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn exit_reason_is_recorded() {
        let broker = FrameBroker::new();
        let stop = CancellationToken::new();
        let mut stopped = writer(&broker, &stop);
        stop.cancel();
        assert!(stopped.next_part().await.is_none());
        assert_eq!(stopped.exit, Some(WriterExit::Stopped));

        let mut closed = writer(&broker, &CancellationToken::new());
        broker.close();
        assert!(closed.next_part().await.is_none());
        assert_eq!(closed.exit, Some(WriterExit::BrokerClosed));
        // Terminal: later polls do not touch the reader again.
        assert!(closed.next_part().await.is_none());
    }

    #[tokio::test]
    async fn tracker_waits_for_writer() {
        let broker = FrameBroker::new();
        let tracker = TaskTracker::new();
        let body = writer(&broker, &CancellationToken::new()).tracked_by(&tracker);
        tracker.close();
        assert!(timeout(Duration::from_millis(20), tracker.wait()).await.is_err());

        drop(body);
        timeout(WAIT, tracker.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn slow_viewer_does_not_block_publisher() {
        let broker = FrameBroker::new();
        let stop = CancellationToken::new();
        let _body = writer(&broker, &stop).into_stream();

        for i in 0..1000u32 {
            broker.publish(i.to_be_bytes().to_vec(), 0).unwrap();
        }
        assert_eq!(broker.last_seq(), 1000);
    }
}
