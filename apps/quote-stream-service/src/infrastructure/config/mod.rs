//! Configuration Module
//!
//! Configuration loading and dependency injection for the quote service.

mod settings;

pub use settings::{ConfigError, DeliverySettings, ServerSettings, ServiceConfig};
