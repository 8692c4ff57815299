mod mjpeg;

use std::path::PathBuf;
use tracing::{error, info};
use webcam_stream_common::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

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
        url = config.probe.url,
        output_dir = ?config.probe.output_dir,
        max_frames = ?config.probe.max_frames,
        "starting webcam-stream probe"
    );

    tokio::select! {
        result = mjpeg::run_probe(&config.probe, &config.server.boundary) => match result {
            Ok(stats) => info!(
                frames = stats.frames,
                bytes = stats.bytes,
                undecodable = stats.undecodable,
                reconnects = stats.reconnects,
                fps = format!("{:.1}", stats.fps()),
                "probe finished"
            ),
            Err(e) => {
                error!(error = %e, "probe failed");
                std::process::exit(1);
            }
        },
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
}
