//! Domain Layer - Core quote and subscription types.
//!
//! This layer holds the two pieces of state the service owns: the
//! read-only quote catalog and the concurrent subscription registry.
//! Neither references the other; the delivery engine mediates.

/// Quote catalog and quote types.
pub mod quote;

/// Subscription registry and status types.
pub mod subscription;
