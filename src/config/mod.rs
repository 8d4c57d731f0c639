//! Configuration management
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML
//! file, `BEOWULF__SECTION__KEY` environment variables, command line flags.

use crate::infrastructure::protocols::sip::SipTimers;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

const ENV_PREFIX: &str = "BEOWULF";

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// How INVITEs are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteMode {
    /// Answer locally through the media gateway
    #[default]
    Answer,
    /// Route through the relay loop like any other request
    Relay,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub sip: SipConfig,
    pub relay: RelayConfig,
    pub timers: TimersConfig,
    pub media: MediaConfig,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    /// Empty means "discover the first non-loopback IPv4 address"
    pub unicast_address: String,
    pub port: u16,
    pub user_agent: String,
    pub invite_mode: InviteMode,
    /// Destination for users that are not registered; empty for none
    pub fallback_destination: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            unicast_address: String::new(),
            port: 5060,
            user_agent: "Beowulf".to_string(),
            invite_mode: InviteMode::Answer,
            fallback_destination: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 0 leaves the number of concurrent exchanges unbounded
    pub max_concurrent_exchanges: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimersConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4000,
            t4_ms: 5000,
        }
    }
}

impl TimersConfig {
    pub fn sip_timers(&self) -> SipTimers {
        SipTimers::from_millis(self.t1_ms, self.t2_ms, self.t4_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub bind_address: String,
    pub track_capacity: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            track_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus listener address; empty disables the exporter
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Values given on the command line; they win over every other layer
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub unicast_address: Option<String>,
    pub sip_port: Option<u16>,
    pub proxy_dst: Option<String>,
}

impl Config {
    /// Load and validate the layered configuration
    pub fn load(file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = file {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("sip.unicast_address", overrides.unicast_address.clone())?
            .set_override_option("sip.port", overrides.sip_port.map(i64::from))?
            .set_override_option("sip.fallback_destination", overrides.proxy_dst.clone())?
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sip.port == 0 {
            return Err(invalid("sip.port", "must not be 0"));
        }
        if !self.sip.unicast_address.is_empty() {
            self.sip
                .unicast_address
                .parse::<IpAddr>()
                .map_err(|e| invalid("sip.unicast_address", e))?;
        }
        if self.timers.t1_ms == 0 || self.timers.t2_ms < self.timers.t1_ms {
            return Err(invalid("timers", "t1_ms must be positive and not above t2_ms"));
        }
        self.media_bind_address()?;
        self.metrics_listen()?;
        if !VALID_LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(invalid(
                "log.level",
                format!("expected one of {:?}", VALID_LOG_LEVELS),
            ));
        }
        Ok(())
    }

    pub fn media_bind_address(&self) -> Result<IpAddr, ConfigError> {
        self.media
            .bind_address
            .parse()
            .map_err(|e| invalid("media.bind_address", e))
    }

    /// `None` when the exporter is disabled
    pub fn metrics_listen(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if self.metrics.listen.trim().is_empty() {
            return Ok(None);
        }
        self.metrics
            .listen
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid("metrics.listen", e))
    }
}

fn invalid(field: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
