pub mod codec;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod source;
pub mod transport;
pub mod utils;

use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::transport::PayloadEncoding;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_ENV: &str = "FRAMECAST_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "framecast.toml";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub emitter: EmitterConfig,
    pub transport: TransportConfig,
    pub consumer: ConsumerConfig,
}

/// Where the producer finds its video
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directory the filesystem provider resolves locators against
    pub root: String,
    pub bucket: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Fixed key attached to every message of a stream
    pub ordering_key: String,
    /// JPEG quality, 1-100
    pub quality: u8,
    /// Publishes that may be awaiting acknowledgement at once
    pub in_flight_limit: usize,
    pub retry: RetryConfig,
    /// Consecutive lost frames after which the transport counts as down
    pub failure_threshold: u32,
    pub payload_encoding: PayloadEncoding,
}

/// Bounded exponential backoff for publishes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Link conditions of the in-memory transport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Probability a published message silently never arrives
    pub drop_rate: f64,
    /// Probability a published message is delivered twice
    pub duplicate_rate: f64,
    /// Messages held back and released in random order
    pub reorder_window: usize,
    /// Seed for reproducible link behaviour
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Frames the reorder buffer may hold
    pub capacity: usize,
    /// No-progress time after which a missing frame counts as lost
    pub stall_timeout_ms: u64,
    /// Deliveries queued between the transport and the ingestion task
    pub queue_capacity: usize,
    /// Playback rate until the first frame advertises the real one
    pub default_rate: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: ".".into(),
            bucket: String::new(),
            path: "sample.y4m".into(),
        }
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            ordering_key: "video-stream".into(),
            quality: codec::DEFAULT_QUALITY,
            in_flight_limit: 16,
            retry: RetryConfig::default(),
            failure_threshold: 30,
            payload_encoding: PayloadEncoding::Binary,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            stall_timeout_ms: 2000,
            queue_capacity: 64,
            default_rate: 30.0,
        }
    }
}

impl ConsumerConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Config {
    /// Layer `framecast.toml` (or `$FRAMECAST_CONFIG`) under `FRAMECAST__*`
    /// environment variables, on top of the defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_owned());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("FRAMECAST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
