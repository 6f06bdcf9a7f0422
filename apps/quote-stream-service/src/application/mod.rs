//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (quote seed data).
pub mod ports;

/// Application services for quote delivery and route dispatch.
pub mod services;
