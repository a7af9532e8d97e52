//! Muxer configuration
//!
//! Deserializable configuration plus builder-style setters. A uniform
//! configuration applies one shared secret to every destination address.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::connection::Target;
use crate::error::MuxerError;

/// Default capacity for the entry and batch channels
pub const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Wait between reconnect attempts after a transient connection failure
pub const DEFAULT_RETRY_TIME: Duration = Duration::from_secs(10);

/// Verbosity of the muxer's own diagnostic stream
///
/// Diagnostics are always emitted through `tracing`; this level additionally
/// gates injection of diagnostic entries into the muxer itself under the
/// reserved tag. `Off` suppresses injection entirely; `Info` injects
/// everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Off,
    #[default]
    Error,
    Warn,
    Info,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Off => "OFF",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    // Unknown or empty inputs fall back to the default level
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "ERROR" => Ok(Self::Error),
            "OFF" => Ok(Self::Off),
            "WARN" => Ok(Self::Warn),
            "INFO" => Ok(Self::Info),
            _ => Ok(Self::Error),
        }
    }
}

/// TLS material handed to the connection layer
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM-encoded public key or certificate path
    pub public_key: String,

    /// PEM-encoded private key or key path
    pub private_key: String,

    /// Whether the remote certificate chain must verify
    pub verify_cert: bool,
}

/// Configuration for the ingest muxer
///
/// # Example
///
/// ```
/// use ingest_muxer::MuxerConfig;
///
/// let config = MuxerConfig::uniform(
///     vec!["tcp://indexer0:4023".into(), "tcp://indexer1:4023".into()],
///     "shared-secret",
/// )
/// .unwrap()
/// .with_tags(vec!["default".into()])
/// .with_channel_size(128);
/// assert_eq!(config.destinations.len(), 2);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    /// Destination indexers; fixed for the lifetime of the muxer
    pub destinations: Vec<Target>,

    /// Initial tag names; each must pass `check_tag`
    pub tags: Vec<String>,

    /// TLS material for the connection layer
    pub tls: TlsConfig,

    /// Capacity of the entry and batch channels; non-positive is coerced to
    /// the default
    pub channel_size: i64,

    /// Whether the spool cache is enabled
    pub enable_cache: bool,

    /// Spool cache configuration
    pub cache_config: CacheConfig,

    /// Diagnostic-stream verbosity
    pub log_level: LogLevel,

    /// Ingester name sent during identification
    pub ingester_name: String,

    /// Ingester version sent during identification
    pub ingester_version: String,

    /// Ingester UUID sent during identification
    pub ingester_uuid: String,

    /// Token-bucket rate limit in bytes per second; zero or negative
    /// disables limiting
    pub rate_limit_bps: i64,

    /// Wait between reconnect attempts after a transient connection failure
    pub retry_interval: Duration,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            tags: Vec::new(),
            tls: TlsConfig::default(),
            channel_size: 0,
            enable_cache: false,
            cache_config: CacheConfig::default(),
            log_level: LogLevel::default(),
            ingester_name: String::new(),
            ingester_version: String::new(),
            ingester_uuid: String::new(),
            rate_limit_bps: 0,
            retry_interval: DEFAULT_RETRY_TIME,
        }
    }
}

impl MuxerConfig {
    /// Create a configuration with explicit per-destination secrets
    pub fn new(destinations: Vec<Target>) -> Self {
        Self {
            destinations,
            ..Self::default()
        }
    }

    /// Create a uniform configuration: one shared secret for every address
    ///
    /// # Errors
    ///
    /// Returns `EmptyAuth` if the secret is empty and `NoTargets` if the
    /// address list is empty.
    pub fn uniform(
        destinations: Vec<String>,
        secret: impl Into<String>,
    ) -> Result<Self, MuxerError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(MuxerError::EmptyAuth);
        }
        if destinations.is_empty() {
            return Err(MuxerError::NoTargets);
        }
        let destinations = destinations
            .into_iter()
            .map(|address| Target {
                address,
                secret: secret.clone(),
            })
            .collect();
        Ok(Self::new(destinations))
    }

    /// Set the initial tag list
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set the channel capacity
    #[must_use]
    pub fn with_channel_size(mut self, size: i64) -> Self {
        self.channel_size = size;
        self
    }

    /// Set TLS material
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Enable the spool cache
    #[must_use]
    pub fn with_cache(mut self, cache_config: CacheConfig) -> Self {
        self.enable_cache = true;
        self.cache_config = cache_config;
        self
    }

    /// Set the diagnostic-stream verbosity
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Set the identification triple sent to every indexer
    #[must_use]
    pub fn with_identity(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Self {
        self.ingester_name = name.into();
        self.ingester_version = version.into();
        self.ingester_uuid = uuid.into();
        self
    }

    /// Set the per-connection rate limit in bytes per second
    #[must_use]
    pub fn with_rate_limit_bps(mut self, bps: i64) -> Self {
        self.rate_limit_bps = bps;
        self
    }

    /// Set the reconnect retry interval
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Effective channel capacity after coercion
    pub(crate) fn effective_channel_size(&self) -> usize {
        if self.channel_size <= 0 {
            DEFAULT_CHANNEL_SIZE
        } else {
            self.channel_size as usize
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
