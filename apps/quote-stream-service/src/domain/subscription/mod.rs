//! Subscription Registry
//!
//! Domain types for tracking which callers hold an active subscription.
//!
//! # Design
//!
//! The registry stores nothing but the set of active request ids. A
//! subscription's status is only ever `CONFIRMED` while stored; the
//! `CANCELLED` and `ERROR` statuses are report values handed back to the
//! caller and never persisted.
//!
//! The set is a sharded concurrent map, so every mutation locks only the
//! shard owning the key. Check-and-remove on one id is atomic with respect
//! to any other operation on the same id, and operations on unrelated ids
//! never queue behind a registry-wide lock.

use std::fmt;
use std::str::FromStr;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Types
// =============================================================================

/// Opaque identifier of a subscription, supplied by the caller or generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Status reported for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// Registered and active.
    Confirmed,
    /// Removed by a successful cancel.
    Cancelled,
    /// Cancel attempted on an id that was not active.
    Error,
}

impl SubscriptionStatus {
    /// Get the wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller's subscription together with the status of the last operation on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier.
    pub request_id: RequestId,
    /// Reported status.
    pub status: SubscriptionStatus,
}

impl Subscription {
    /// Create a subscription record.
    #[must_use]
    pub const fn new(request_id: RequestId, status: SubscriptionStatus) -> Self {
        Self { request_id, status }
    }

    /// Create a confirmed subscription record.
    #[must_use]
    pub const fn confirmed(request_id: RequestId) -> Self {
        Self::new(request_id, SubscriptionStatus::Confirmed)
    }
}

/// Result of registering a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The id was not active and has been added.
    Registered(Subscription),
    /// The id was already active; no second entry was created.
    AlreadyActive(Subscription),
}

impl SubscribeOutcome {
    /// Check if this call created the entry.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Registered(_))
    }

    /// Get the confirmed subscription.
    #[must_use]
    pub const fn subscription(&self) -> Subscription {
        match self {
            Self::Registered(s) | Self::AlreadyActive(s) => *s,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Concurrent set of active subscriptions.
///
/// # Example
///
/// ```rust
/// use quote_stream_service::domain::subscription::{
///     RequestId, SubscriptionRegistry, SubscriptionStatus,
/// };
///
/// let registry = SubscriptionRegistry::new();
/// let id = RequestId::generate();
///
/// let outcome = registry.subscribe(id);
/// assert_eq!(outcome.subscription().status, SubscriptionStatus::Confirmed);
/// assert!(registry.is_active(id));
///
/// assert_eq!(registry.cancel_confirmed(id).status, SubscriptionStatus::Cancelled);
/// assert_eq!(registry.cancel_confirmed(id).status, SubscriptionStatus::Error);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    active: DashSet<RequestId>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: DashSet::new(),
        }
    }

    /// Register `request_id` as active.
    ///
    /// Re-subscribing an active id confirms it again without creating a
    /// second entry.
    pub fn subscribe(&self, request_id: RequestId) -> SubscribeOutcome {
        let subscription = Subscription::confirmed(request_id);
        if self.active.insert(request_id) {
            SubscribeOutcome::Registered(subscription)
        } else {
            SubscribeOutcome::AlreadyActive(subscription)
        }
    }

    /// Check if `request_id` has an active subscription.
    #[must_use]
    pub fn is_active(&self, request_id: RequestId) -> bool {
        self.active.contains(&request_id)
    }

    /// Remove `request_id` and report the outcome.
    ///
    /// Returns `CANCELLED` if the id was active, `ERROR` otherwise. The
    /// registry is left unchanged on `ERROR`.
    pub fn cancel_confirmed(&self, request_id: RequestId) -> Subscription {
        let status = if self.active.remove(&request_id).is_some() {
            SubscriptionStatus::Cancelled
        } else {
            SubscriptionStatus::Error
        };

        Subscription::new(request_id, status)
    }

    /// Remove `request_id` without reporting the outcome to the caller.
    ///
    /// Success and failure are logged. Returns `true` if the id was active.
    pub fn cancel_unconfirmed(&self, request_id: RequestId) -> bool {
        let outcome = self.cancel_confirmed(request_id);
        match outcome.status {
            SubscriptionStatus::Cancelled => {
                tracing::info!(request_id = %request_id, status = %outcome.status, "Unconfirmed cancel succeeded");
                true
            }
            _ => {
                tracing::warn!(request_id = %request_id, status = %outcome.status, "Unconfirmed cancel failed");
                false
            }
        }
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Check if there are no active subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
