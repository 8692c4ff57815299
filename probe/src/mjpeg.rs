use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use webcam_stream_common::config::ProbeConfig;
use webcam_stream_common::frame::EncodedFrame;
use webcam_stream_common::multipart::{self, MultipartParser};

use crate::ProbeError;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Running totals across reconnects.
#[derive(Debug)]
pub struct ProbeStats {
    pub frames: u64,
    pub bytes: u64,
    pub undecodable: u64,
    pub reconnects: u64,
    started: Instant,
    last_report: Instant,
}

impl ProbeStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            frames: 0,
            bytes: 0,
            undecodable: 0,
            reconnects: 0,
            started: now,
            last_report: now,
        }
    }

    /// Average frames per second since the probe started.
    pub fn fps(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }

    fn maybe_report(&mut self) {
        if self.last_report.elapsed() >= STATS_INTERVAL {
            self.last_report = Instant::now();
            info!(
                frames = self.frames,
                bytes = self.bytes,
                undecodable = self.undecodable,
                fps = format!("{:.1}", self.fps()),
                "stream stats"
            );
        }
    }
}

impl Default for ProbeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// How a single connection ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    /// The server closed the stream.
    Closed,
    /// `max_frames` parts have been received.
    LimitReached,
}

/// Watch the MJPEG stream until `max_frames` parts arrive.
/// Reconnects with exponential backoff on failure. Without a frame limit this
/// only returns on a setup error.
pub async fn run_probe(
    config: &ProbeConfig,
    fallback_boundary: &str,
) -> Result<ProbeStats, ProbeError> {
    if let Some(dir) = &config.output_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(ProbeError::HttpConnect)?;

    let mut stats = ProbeStats::new();
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url = config.url, "connecting to MJPEG stream");
        match consume_stream(&client, config, fallback_boundary, &mut stats).await {
            Ok(StreamEnd::LimitReached) => return Ok(stats),
            Ok(StreamEnd::Closed) => {
                info!(frames = stats.frames, "stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        stats.reconnects += 1;
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(
    client: &reqwest::Client,
    config: &ProbeConfig,
    fallback_boundary: &str,
    stats: &mut ProbeStats,
) -> Result<StreamEnd, ProbeError> {
    let response = client
        .get(&config.url)
        .send()
        .await
        .map_err(ProbeError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(ProbeError::HttpStatus(response.status().as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let boundary = resolve_boundary(content_type, fallback_boundary);
    info!(status = %response.status(), boundary, "connected to MJPEG stream");

    let mut parser = MultipartParser::new(&boundary);
    let mut byte_stream = response.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(ProbeError::HttpStream)?;
        parser.push(&chunk);

        loop {
            let part = match parser.next_part() {
                Ok(Some(part)) => part,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, buffered = parser.buffered(), "malformed part, skipping");
                    continue;
                }
            };
            handle_part(part, config.output_dir.as_deref(), stats).await?;
            if config.max_frames.is_some_and(|max| stats.frames >= max) {
                return Ok(StreamEnd::LimitReached);
            }
        }
        stats.maybe_report();
    }

    Ok(StreamEnd::Closed)
}

/// Boundary announced by the server, or the configured one if it sent none.
fn resolve_boundary(content_type: Option<&str>, fallback: &str) -> String {
    match content_type.and_then(multipart::boundary_from_content_type) {
        Some(boundary) => boundary.to_string(),
        None => {
            warn!(
                content_type = ?content_type,
                fallback,
                "no boundary in response Content-Type, using configured one"
            );
            fallback.to_string()
        }
    }
}

async fn handle_part(
    part: Bytes,
    output_dir: Option<&str>,
    stats: &mut ProbeStats,
) -> Result<(), ProbeError> {
    stats.frames += 1;
    stats.bytes += part.len() as u64;
    let frame = EncodedFrame::new(part, Utc::now().timestamp_millis(), stats.frames);

    match jpeg_dimensions(frame.jpeg_data()) {
        Ok((width, height)) => {
            debug!(seq = frame.seq, bytes = frame.len(), width, height, "frame received");
        }
        Err(e) => {
            stats.undecodable += 1;
            warn!(seq = frame.seq, bytes = frame.len(), error = %e, "part is not a readable image");
        }
    }

    if let Some(dir) = output_dir {
        let path = frame_path(Path::new(dir), &frame);
        tokio::fs::write(&path, frame.jpeg_data()).await?;
    }
    Ok(())
}

fn frame_path(dir: &Path, frame: &EncodedFrame) -> PathBuf {
    dir.join(frame.file_name(""))
}

/// Width and height from the image header, without decoding pixels.
fn jpeg_dimensions(data: &[u8]) -> Result<(u32, u32), image::ImageError> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .into_dimensions()
}
