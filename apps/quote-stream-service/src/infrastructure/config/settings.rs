//! Service Configuration Settings
//!
//! Configuration types for the quote service, loaded from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::application::ports::{FileQuoteSource, QuoteSource, StaticQuoteSource};
use crate::application::services::{
    DEFAULT_EMISSION_INTERVAL, DEFAULT_STREAM_BUFFER, DeliveryConfig,
};
use crate::infrastructure::transport::TransportConfig;
use crate::infrastructure::transport::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::infrastructure::transport::server::{DEFAULT_INPUT_BUFFER, DEFAULT_OUTBOUND_BUFFER};

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// WebSocket transport port.
    pub port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
    /// Largest accepted inbound frame.
    pub max_frame_bytes: usize,
    /// Unread channel input elements allowed per stream, at least 1.
    pub channel_input_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 7000,
            health_port: 8083,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            channel_input_buffer: DEFAULT_INPUT_BUFFER,
        }
    }
}

impl ServerSettings {
    /// Address the WebSocket transport binds to.
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }
}

/// Paced delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Delay before each streamed quote.
    pub emission_interval: Duration,
    /// Per-stream buffer, at least 1.
    pub stream_buffer: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            emission_interval: DEFAULT_EMISSION_INTERVAL,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl From<&DeliverySettings> for DeliveryConfig {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            emission_interval: settings.emission_interval,
            stream_buffer: settings.stream_buffer,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Paced delivery settings.
    pub delivery: DeliverySettings,
    /// Quote file; the bundled set is used when absent.
    pub quotes_file: Option<PathBuf>,
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `QUOTE_SERVICE_QUOTES_FILE` is set but empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `QUOTE_SERVICE_QUOTES_FILE` is set but empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let quotes_file = match lookup("QUOTE_SERVICE_QUOTES_FILE") {
            Some(path) if path.trim().is_empty() => {
                return Err(ConfigError::EmptyValue(
                    "QUOTE_SERVICE_QUOTES_FILE".to_string(),
                ));
            }
            Some(path) => Some(PathBuf::from(path)),
            None => None,
        };

        let server = ServerSettings {
            port: parse_var(&lookup, "QUOTE_SERVICE_PORT", ServerSettings::default().port),
            health_port: parse_var(
                &lookup,
                "QUOTE_SERVICE_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
            max_frame_bytes: parse_var(
                &lookup,
                "QUOTE_SERVICE_MAX_FRAME_BYTES",
                ServerSettings::default().max_frame_bytes,
            ),
            channel_input_buffer: parse_var(
                &lookup,
                "QUOTE_SERVICE_CHANNEL_INPUT_BUFFER",
                ServerSettings::default().channel_input_buffer,
            )
            .max(1),
        };

        let delivery = DeliverySettings {
            emission_interval: parse_var_duration_millis(
                &lookup,
                "QUOTE_SERVICE_EMISSION_INTERVAL_MS",
                DeliverySettings::default().emission_interval,
            ),
            stream_buffer: parse_var(
                &lookup,
                "QUOTE_SERVICE_STREAM_BUFFER",
                DeliverySettings::default().stream_buffer,
            )
            .max(1),
        };

        Ok(Self {
            server,
            delivery,
            quotes_file,
        })
    }

    /// Engine-facing delivery configuration.
    #[must_use]
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig::from(&self.delivery)
    }

    /// Transport configuration.
    #[must_use]
    pub const fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_frame_bytes: self.server.max_frame_bytes,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            input_buffer: self.server.channel_input_buffer,
        }
    }

    /// Source the catalog is loaded from.
    #[must_use]
    pub fn quote_source(&self) -> Box<dyn QuoteSource> {
        match &self.quotes_file {
            Some(path) => Box::new(FileQuoteSource::new(path)),
            None => Box::new(StaticQuoteSource::zippy()),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_var_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
