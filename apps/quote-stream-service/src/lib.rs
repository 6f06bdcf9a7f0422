#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Quote Stream Service - Subscription-Based Quote Distribution
//!
//! A WebSocket service that holds a fixed catalog of quotes and hands
//! them out over four interaction patterns: request/response,
//! fire-and-forget, request/stream and bidirectional channel.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core quote and subscription types
//!   - `quote`: Quote catalog with id-based lookup
//!   - `subscription`: Concurrent subscription registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Quote sources the catalog is loaded from
//!   - `services`: Delivery engine and route dispatcher
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `transport`: WebSocket frame codec, server and client
//!   - `config`: Configuration and dependency injection
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing subscriber and OTLP export
//!
//! # Data Flow
//!
//! ```text
//!               ┌────────────┐     ┌────────────┐     ┌──────────────┐
//! Client 1 ◄───►│            │     │            │     │   Delivery   │
//! Client 2 ◄───►│ WebSocket  │────►│ Dispatcher │────►│    Engine    │
//! Client N ◄───►│   Server   │     │  (routes)  │     │ catalog+regs │
//!               └────────────┘     └────────────┘     └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Quote catalog and subscription registry.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::quote::{CatalogError, Quote, QuoteCatalog, QuoteId};
pub use domain::subscription::{
    RequestId, SubscribeOutcome, Subscription, SubscriptionRegistry, SubscriptionStatus,
};

// Quote sources
pub use application::ports::{FileQuoteSource, QuoteSource, SourceError, StaticQuoteSource};

// Delivery and dispatch
pub use application::services::{
    DeliveryConfig, DeliveryEngine, DeliveryError, DispatchError, Dispatcher, Interaction,
    Payload, QuoteStream, Route,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, DeliverySettings, ServerSettings, ServiceConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// WebSocket transport
pub use infrastructure::transport::{
    ClientError, QuoteClient, QuoteServer, RemoteStream, ServerError, TransportConfig,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
