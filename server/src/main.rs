mod broker;
mod encoder;
mod pipeline;
mod server;
mod source;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use broker::FrameBroker;
use encoder::JpegEncoder;
use pipeline::FramePipeline;
use server::StreamServer;
use source::TestPatternSource;
use tracing::{error, info, warn};
use webcam_stream_common::config::Config;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        port = config.server.port,
        boundary = config.server.boundary,
        quality = config.encoder.quality,
        width = config.source.width,
        height = config.source.height,
        fps = config.source.fps,
        "starting webcam-stream server"
    );

    let broker = Arc::new(FrameBroker::new());

    // A failed bind only disables streaming; the producer keeps running.
    let server = match StreamServer::start(&config.server, Arc::clone(&broker)).await {
        Ok(s) => {
            info!(
                url = format!("http://{}/stream.mjpeg", s.local_addr()),
                "streaming"
            );
            Some(s)
        }
        Err(e) => {
            error!(error = %e, "failed to start MJPEG server; continuing without streaming");
            None
        }
    };

    let pipeline = Arc::new(FramePipeline::new(
        Box::new(JpegEncoder),
        Arc::clone(&broker),
        config.encoder.quality,
    ));
    let producer = Arc::clone(&pipeline);
    let source = match TestPatternSource::new(&config.source).spawn(move |frame| {
        producer.push(frame);
    }) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start frame source");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown requested");

    if let Err(e) = tokio::task::spawn_blocking(move || source.stop()).await {
        warn!(error = %e, "frame source did not stop cleanly");
    }
    if let Some(server) = server {
        if let Err(e) = server.shutdown().await {
            error!(error = %e, "MJPEG server shutdown failed");
        }
    }
    broker.close();

    let stats = pipeline.stats();
    info!(
        received = stats.received,
        published = stats.published,
        dropped = stats.dropped,
        last_seq = broker.last_seq(),
        "webcam-stream server stopped"
    );
}
