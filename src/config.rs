//! Configuration surface: every option in the external-interfaces table,
//! loadable from an optional TOML file and overridable by CLI flags of the
//! same name, with config-time validation ahead of any GStreamer element
//! construction.
use crate::error::AppError;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Raw,
    H264,
    H265,
    Vp8,
    Vp9,
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Codec::Raw => "raw",
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Vp8 => "vp8",
            Codec::Vp9 => "vp9",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Rtp,
    Mpegts,
    Shm,
    Raw,
    File,
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Container::Rtp => "rtp",
            Container::Mpegts => "mpegts",
            Container::Shm => "shm",
            Container::Raw => "raw",
            Container::File => "file",
        };
        write!(f, "{s}")
    }
}

/// Full configuration for a synchronizer session.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default = "default_input_port")]
    pub input_port: u16,

    #[serde(default = "default_udp_buffer")]
    pub udp_buffer: usize,

    #[serde(default = "default_jitter_buffer_ms")]
    pub jitter_buffer_ms: u64,

    #[serde(default = "default_max_queue_ms")]
    pub max_queue_ms: u64,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_output_port")]
    pub output_port: u16,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    #[serde(default = "default_keyframe")]
    pub keyframe: u32,

    #[serde(default = "default_codec")]
    pub codec: Codec,

    #[serde(default = "default_container")]
    pub container: Container,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_path: Option<String>,

    #[serde(default = "default_shm_size")]
    pub shm_size: usize,

    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

fn default_input_port() -> u16 {
    5000
}
fn default_udp_buffer() -> usize {
    64 * 1024 * 1024
}
fn default_jitter_buffer_ms() -> u64 {
    1_000
}
fn default_max_queue_ms() -> u64 {
    5_000
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_output_port() -> u16 {
    5004
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    30
}
fn default_bitrate() -> u32 {
    2_000
}
fn default_keyframe() -> u32 {
    30
}
fn default_codec() -> Codec {
    Codec::Vp8
}
fn default_container() -> Container {
    Container::Rtp
}
fn default_shm_size() -> usize {
    20 * 1024 * 1024
}
fn default_stats_interval() -> u64 {
    5
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let config: Config = toml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    /// Default output file name for the configured codec, used when
    /// `container = file` and no explicit `file` path was given.
    pub fn default_file_name(&self) -> PathBuf {
        let ext = match self.codec {
            Codec::H264 | Codec::H265 => "mp4",
            Codec::Vp8 | Codec::Vp9 => "mkv",
            Codec::Raw => "avi",
        };
        PathBuf::from(format!("output.{ext}"))
    }

    /// Config-time validation: unknown/incompatible combinations are
    /// rejected before any GStreamer element is built.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.width == 0 || self.height == 0 {
            return Err(AppError::Config(
                "width and height must be positive".into(),
            ));
        }
        if self.fps == 0 {
            return Err(AppError::Config("fps must be positive".into()));
        }
        match self.container {
            Container::Shm => {
                if self.shm_path.is_none() {
                    return Err(AppError::Config(
                        "container=shm requires shm-path".into(),
                    ));
                }
            }
            Container::Rtp | Container::Mpegts | Container::Raw => {
                if self.host.is_empty() {
                    return Err(AppError::Config(format!(
                        "container={} requires host",
                        self.container
                    )));
                }
                if self.output_port == 0 {
                    return Err(AppError::Config(format!(
                        "container={} requires output-port",
                        self.container
                    )));
                }
            }
            Container::File => {
                // file path defaults per-codec when absent; nothing to reject.
            }
        }
        Ok(())
    }

    /// Resolved output path for the `file` container.
    pub fn output_file_path(&self) -> PathBuf {
        self.file.clone().unwrap_or_else(|| self.default_file_name())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input_port: default_input_port(),
            udp_buffer: default_udp_buffer(),
            jitter_buffer_ms: default_jitter_buffer_ms(),
            max_queue_ms: default_max_queue_ms(),
            host: default_host(),
            output_port: default_output_port(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            bitrate: default_bitrate(),
            keyframe: default_keyframe(),
            codec: default_codec(),
            container: default_container(),
            file: None,
            shm_path: None,
            shm_size: default_shm_size(),
            stats_interval: default_stats_interval(),
        }
    }
}

/// Command-line arguments, mirroring the configuration option table.
/// Any flag present overrides the corresponding field loaded from
/// `--config`.
#[derive(Debug, Parser)]
#[command(name = "sync_core", about = "Clock-driven MPEG-TS frame synchronizer and KLV demultiplexer")]
pub struct CliArgs {
    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub input_port: Option<u16>,

    #[arg(long)]
    pub udp_buffer: Option<usize>,

    #[arg(long)]
    pub jitter_buffer: Option<u64>,

    #[arg(long)]
    pub max_queue: Option<u64>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub output_port: Option<u16>,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    #[arg(long)]
    pub fps: Option<u32>,

    #[arg(long)]
    pub bitrate: Option<u32>,

    #[arg(long)]
    pub keyframe: Option<u32>,

    #[arg(long, value_enum)]
    pub codec: Option<Codec>,

    #[arg(long, value_enum)]
    pub container: Option<Container>,

    #[arg(long)]
    pub file: Option<PathBuf>,

    #[arg(long)]
    pub shm_path: Option<String>,

    #[arg(long)]
    pub shm_size: Option<usize>,

    #[arg(long)]
    pub stats_interval: Option<u64>,
}

impl CliArgs {
    /// Build a `Config` by starting from the file (or defaults) and
    /// applying every CLI override that was actually supplied.
    pub fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(v) = self.input_port {
            config.input_port = v;
        }
        if let Some(v) = self.udp_buffer {
            config.udp_buffer = v;
        }
        if let Some(v) = self.jitter_buffer {
            config.jitter_buffer_ms = v;
        }
        if let Some(v) = self.max_queue {
            config.max_queue_ms = v;
        }
        if let Some(v) = &self.host {
            config.host = v.clone();
        }
        if let Some(v) = self.output_port {
            config.output_port = v;
        }
        if let Some(v) = self.width {
            config.width = v;
        }
        if let Some(v) = self.height {
            config.height = v;
        }
        if let Some(v) = self.fps {
            config.fps = v;
        }
        if let Some(v) = self.bitrate {
            config.bitrate = v;
        }
        if let Some(v) = self.keyframe {
            config.keyframe = v;
        }
        if let Some(v) = self.codec {
            config.codec = v;
        }
        if let Some(v) = self.container {
            config.container = v;
        }
        if self.file.is_some() {
            config.file = self.file.clone();
            config.container = Container::File;
        }
        if let Some(v) = &self.shm_path {
            config.shm_path = Some(v.clone());
        }
        if let Some(v) = self.shm_size {
            config.shm_size = v;
        }
        if let Some(v) = self.stats_interval {
            config.stats_interval = v;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.input_port, 5000);
        assert_eq!(config.fps, 30);
        assert_eq!(config.codec, Codec::Vp8);
        assert_eq!(config.container, Container::Rtp);
    }

    #[test]
    fn shm_without_path_fails_validation() {
        let mut config = Config::default();
        config.container = Container::Shm;
        config.shm_path = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn shm_with_path_passes_validation() {
        let mut config = Config::default();
        config.container = Container::Shm;
        config.shm_path = Some("/tmp/sync_core.sock".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rtp_without_host_fails_validation() {
        let mut config = Config::default();
        config.container = Container::Rtp;
        config.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_fps_fails_validation() {
        let mut config = Config::default();
        config.fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_file_name_follows_codec() {
        let mut config = Config::default();
        config.codec = Codec::H264;
        assert_eq!(config.default_file_name(), PathBuf::from("output.mp4"));
        config.codec = Codec::Vp9;
        assert_eq!(config.default_file_name(), PathBuf::from("output.mkv"));
        config.codec = Codec::Raw;
        assert_eq!(config.default_file_name(), PathBuf::from("output.avi"));
    }
}
