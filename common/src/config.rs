use serde::Deserialize;
use std::path::Path;

use crate::multipart;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_boundary")]
    pub boundary: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_quality")]
    pub quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Luma rows are padded up to a multiple of this many bytes, like most
    /// camera HALs do.
    #[serde(default = "default_row_alignment")]
    pub row_alignment: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_url")]
    pub url: String,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub max_frames: Option<u64>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            boundary: default_boundary(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            row_alignment: default_row_alignment(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: default_probe_url(),
            output_dir: None,
            max_frames: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "encoder.quality must be 0-100, got {}",
                self.encoder.quality
            )));
        }
        let (w, h) = (self.source.width, self.source.height);
        if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "source dimensions must be even and non-zero, got {w}x{h}"
            )));
        }
        if !(self.source.fps > 0.0 && self.source.fps.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "source.fps must be positive, got {}",
                self.source.fps
            )));
        }
        if !multipart::is_valid_boundary(&self.server.boundary) {
            return Err(ConfigError::Invalid(format!(
                "server.boundary {:?} is not a valid multipart boundary",
                self.server.boundary
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_boundary() -> String {
    "frameboundary".into()
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_quality() -> u8 {
    80
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> f64 {
    15.0
}
fn default_row_alignment() -> usize {
    64
}
fn default_probe_url() -> String {
    "http://127.0.0.1:8080/stream.mjpeg".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".into()
}
