// src/config.rs

//! Manages bridge configuration: loading from TOML, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// What a session does with frames that lack an `action` before `init` set its private topic.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EarlyFramePolicy {
    /// Fail the frame with a protocol error. It is dropped and logged.
    #[default]
    Reject,
    /// Discard the frame quietly.
    Drop,
    /// Hold the frame until `init`, then publish it to the new private topic.
    Buffer,
}

/// Per-session behavior.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(default)]
    pub early_frames: EarlyFramePolicy,
    /// Capacity of the per-session queue used by `EarlyFramePolicy::Buffer`.
    #[serde(default = "default_early_frame_buffer")]
    pub early_frame_buffer: usize,
    /// Send `{"type":"error",...}` frames for dropped frames instead of staying silent.
    #[serde(default)]
    pub error_replies: bool,
    /// Largest inbound WebSocket message accepted, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            early_frames: EarlyFramePolicy::default(),
            early_frame_buffer: default_early_frame_buffer(),
            error_replies: false,
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_early_frame_buffer() -> usize {
    64
}
fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MB
}

/// Settings for the in-process broker.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LocalBackboneConfig {
    /// Messages buffered per topic before slow subscribers start lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How often topics without subscribers are dropped.
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
}

impl Default for LocalBackboneConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            purge_interval: default_purge_interval(),
        }
    }
}

fn default_channel_capacity() -> usize {
    128
}
fn default_purge_interval() -> Duration {
    Duration::from_secs(300)
}

/// Settings for a Redis-compatible pub/sub server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RespBackboneConfig {
    #[serde(default = "default_resp_host")]
    pub host: String,
    #[serde(default = "default_resp_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_backbone_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default = "default_backbone_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,
}

impl Default for RespBackboneConfig {
    fn default() -> Self {
        Self {
            host: default_resp_host(),
            port: default_resp_port(),
            password: None,
            connect_timeout: default_backbone_timeout(),
            reply_timeout: default_backbone_timeout(),
        }
    }
}

fn default_resp_host() -> String {
    "127.0.0.1".to_string()
}
fn default_resp_port() -> u16 {
    6379
}
fn default_backbone_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Which backbone sessions are bridged onto.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackboneConfig {
    Local(LocalBackboneConfig),
    Resp(RespBackboneConfig),
}

impl Default for BackboneConfig {
    fn default() -> Self {
        BackboneConfig::Local(LocalBackboneConfig::default())
    }
}

/// Configuration for TLS on the client listener (`wss://`).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

fn default_cert_path() -> String {
    "topicbridge.crt".to_string()
}
fn default_key_path() -> String {
    "topicbridge.key".to_string()
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server exposes `/metrics` and `/sessions`.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9464
}

/// The complete, validated bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Destination for frames whose action the bridge does not interpret.
    #[serde(default = "default_system_topic")]
    pub system_topic: String,
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub backbone: BackboneConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10000
}
fn default_system_topic() -> String {
    "/system".to_string()
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            system_topic: default_system_topic(),
            handshake_timeout: default_handshake_timeout(),
            session: SessionConfig::default(),
            backbone: BackboneConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config in '{path}'"))
    }

    /// Parses and validates TOML configuration text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.system_topic.is_empty() {
            return Err(anyhow!("system_topic cannot be empty"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(anyhow!("handshake_timeout cannot be 0"));
        }

        if self.session.max_message_size == 0 {
            return Err(anyhow!("session.max_message_size cannot be 0"));
        }
        if self.session.early_frames == EarlyFramePolicy::Buffer
            && self.session.early_frame_buffer == 0
        {
            return Err(anyhow!(
                "session.early_frame_buffer must be greater than 0 when early_frames = \"buffer\""
            ));
        }

        match &self.backbone {
            BackboneConfig::Local(local) => {
                if local.channel_capacity == 0 {
                    return Err(anyhow!("backbone.channel_capacity cannot be 0"));
                }
                if local.purge_interval.is_zero() {
                    return Err(anyhow!("backbone.purge_interval cannot be 0"));
                }
            }
            BackboneConfig::Resp(resp) => {
                if resp.host.trim().is_empty() {
                    return Err(anyhow!("backbone.host cannot be empty"));
                }
                if resp.port == 0 {
                    return Err(anyhow!("backbone.port cannot be 0"));
                }
                if resp.connect_timeout.is_zero() || resp.reply_timeout.is_zero() {
                    return Err(anyhow!("backbone timeouts cannot be 0"));
                }
                if resp.password.is_none() && resp.host != "127.0.0.1" && resp.host != "localhost"
                {
                    warn!(
                        "RESP backbone at {} is used without a password.",
                        resp.host
                    );
                }
            }
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }

        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}
