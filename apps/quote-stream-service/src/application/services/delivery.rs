//! Delivery Engine
//!
//! Implements the quote operations on top of the catalog and the
//! subscription registry, one response pattern per operation:
//!
//! | Operation              | Pattern                          |
//! |------------------------|----------------------------------|
//! | `subscribe`            | request/response, never fails    |
//! | `cancel_unconfirmed`   | fire-and-forget                  |
//! | `cancel_confirmed`     | request/response with status     |
//! | `get_all_quotes`       | request/stream, paced, finite    |
//! | `get_random_quotes`    | channel, paced, order-preserving |
//! | `get_number_of_quotes` | request/response                 |
//!
//! # Streams
//!
//! Each stream is produced by a spawned task that waits one emission
//! interval before every item and pushes into a bounded channel. The wait
//! is a timer, so the runtime keeps serving other calls in between. The
//! producer watches for the consumer going away and stops as soon as the
//! receiving half is dropped, including in the middle of a wait.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domain::quote::{CatalogError, Quote, QuoteCatalog, QuoteId};
use crate::domain::subscription::{
    RequestId, Subscription, SubscriptionRegistry, SubscriptionStatus,
};
use crate::infrastructure::metrics::{self, CancelPath};

// =============================================================================
// Types
// =============================================================================

/// Paced sequence of quotes produced by a streaming operation.
pub type QuoteStream = Pin<Box<dyn Stream<Item = Result<Quote, DeliveryError>> + Send>>;

/// Default delay before each streamed quote.
pub const DEFAULT_EMISSION_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of quotes buffered per stream.
pub const DEFAULT_STREAM_BUFFER: usize = 32;

/// Tunables for streamed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Delay before each emitted quote.
    pub emission_interval: Duration,
    /// Bounded channel capacity per stream.
    pub stream_buffer: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            emission_interval: DEFAULT_EMISSION_INTERVAL,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

/// Errors surfaced by delivery operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Quotes were requested for a subscription that is not active.
    #[error("subscription {0} is not active")]
    AccessDenied(RequestId),

    /// Quote lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl DeliveryError {
    /// Stable machine-readable code for the error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::Catalog(CatalogError::OutOfRange { .. }) => "OUT_OF_RANGE",
            Self::Catalog(_) => "CATALOG_UNAVAILABLE",
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Composes the catalog and the registry into the quote operations.
///
/// Streaming operations spawn onto the current Tokio runtime.
#[derive(Debug, Clone)]
pub struct DeliveryEngine {
    catalog: Arc<QuoteCatalog>,
    registry: Arc<SubscriptionRegistry>,
    config: DeliveryConfig,
}

impl DeliveryEngine {
    /// Create a new delivery engine.
    #[must_use]
    pub const fn new(
        catalog: Arc<QuoteCatalog>,
        registry: Arc<SubscriptionRegistry>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            catalog,
            registry,
            config,
        }
    }

    /// Get the quote catalog.
    #[must_use]
    pub fn catalog(&self) -> &QuoteCatalog {
        &self.catalog
    }

    /// Get the subscription registry.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Get the delivery configuration.
    #[must_use]
    pub const fn config(&self) -> DeliveryConfig {
        self.config
    }

    /// Register a subscription. Always confirms.
    pub fn subscribe(&self, request_id: RequestId) -> Subscription {
        let outcome = self.registry.subscribe(request_id);
        let subscription = outcome.subscription();

        tracing::info!(
            request_id = %request_id,
            status = %subscription.status,
            new = outcome.is_new(),
            "subscribe"
        );
        metrics::set_active_subscriptions(self.registry.len());

        subscription
    }

    /// Cancel a subscription without reporting the outcome.
    pub fn cancel_unconfirmed(&self, request_id: RequestId) {
        let cancelled = self.registry.cancel_unconfirmed(request_id);
        metrics::record_cancellation(CancelPath::Unconfirmed, cancelled);
        metrics::set_active_subscriptions(self.registry.len());
    }

    /// Cancel a subscription and report `CANCELLED` or `ERROR`.
    pub fn cancel_confirmed(&self, request_id: RequestId) -> Subscription {
        let result = self.registry.cancel_confirmed(request_id);
        let cancelled = result.status == SubscriptionStatus::Cancelled;

        if cancelled {
            tracing::info!(request_id = %request_id, status = %result.status, "Confirmed cancel succeeded");
        } else {
            tracing::warn!(request_id = %request_id, status = %result.status, "Confirmed cancel failed");
        }
        metrics::record_cancellation(CancelPath::Confirmed, cancelled);
        metrics::set_active_subscriptions(self.registry.len());

        result
    }

    /// Stream the whole catalog in index order, one quote per interval.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::AccessDenied` if `request_id` has no active
    /// subscription. No stream is produced in that case.
    pub fn get_all_quotes(&self, request_id: RequestId) -> Result<QuoteStream, DeliveryError> {
        if !self.registry.is_active(request_id) {
            tracing::warn!(request_id = %request_id, "get_all_quotes denied: not subscribed");
            return Err(DeliveryError::AccessDenied(request_id));
        }

        let (pacer, stream) = self.paced_channel();
        let catalog = Arc::clone(&self.catalog);

        tokio::spawn(async move {
            tracing::debug!(request_id = %request_id, count = catalog.count(), "get_all_quotes started");

            for quote in catalog.iter() {
                if !pacer.emit(quote.clone()).await {
                    tracing::debug!(request_id = %request_id, "get_all_quotes consumer dropped");
                    return;
                }
            }

            tracing::debug!(request_id = %request_id, "get_all_quotes completed");
        });

        Ok(stream)
    }

    /// Look up each requested id and stream the results in request order.
    ///
    /// Stops after emitting the first lookup error.
    pub fn get_random_quotes<S>(&self, quote_ids: S) -> QuoteStream
    where
        S: Stream<Item = QuoteId> + Send + 'static,
    {
        let (pacer, stream) = self.paced_channel();
        let catalog = Arc::clone(&self.catalog);

        tokio::spawn(async move {
            let mut quote_ids = Box::pin(quote_ids);
            let mut emitted = 0usize;

            loop {
                let next = tokio::select! {
                    () = pacer.closed() => {
                        tracing::debug!(emitted, "get_random_quotes consumer dropped");
                        return;
                    }
                    next = quote_ids.next() => next,
                };

                let Some(quote_id) = next else {
                    break;
                };

                match catalog.get(quote_id) {
                    Ok(quote) => {
                        if !pacer.emit(quote).await {
                            tracing::debug!(emitted, "get_random_quotes consumer dropped");
                            return;
                        }
                        emitted += 1;
                    }
                    Err(err) => {
                        tracing::warn!(quote_id, error = %err, "get_random_quotes lookup failed");
                        pacer.fail(err.into()).await;
                        return;
                    }
                }
            }

            tracing::debug!(emitted, "get_random_quotes completed");
        });

        stream
    }

    /// Number of quotes in the catalog.
    #[must_use]
    pub fn get_number_of_quotes(&self) -> usize {
        self.catalog.count()
    }

    fn paced_channel(&self) -> (Pacer, QuoteStream) {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let pacer = Pacer {
            tx,
            interval: self.config.emission_interval,
        };
        (pacer, Box::pin(ReceiverStream::new(rx)))
    }
}

// =============================================================================
// Pacer
// =============================================================================

/// Producer half of a paced stream.
struct Pacer {
    tx: mpsc::Sender<Result<Quote, DeliveryError>>,
    interval: Duration,
}

impl Pacer {
    /// Wait one interval, then send `quote`.
    ///
    /// Returns `false` once the consumer is gone.
    async fn emit(&self, quote: Quote) -> bool {
        tokio::select! {
            () = self.tx.closed() => return false,
            () = tokio::time::sleep(self.interval) => {}
        }

        self.tx.send(Ok(quote)).await.is_ok()
    }

    /// Send a terminal error without delay.
    async fn fail(&self, err: DeliveryError) {
        let _ = self.tx.send(Err(err)).await;
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn engine(texts: &[&str]) -> DeliveryEngine {
        DeliveryEngine::new(
            Arc::new(QuoteCatalog::from_texts(texts.iter().copied())),
            Arc::new(SubscriptionRegistry::new()),
            DeliveryConfig {
                emission_interval: INTERVAL,
                stream_buffer: 4,
            },
        )
    }

    async fn collect_ok(stream: QuoteStream) -> Vec<String> {
        stream
            .map(|item| item.unwrap().text)
            .collect::<Vec<_>>()
            .await
    }

    #[test]
    fn subscribe_always_confirms() {
        let engine = engine(&["Q0"]);
        let id = RequestId::generate();

        assert_eq!(engine.subscribe(id).status, SubscriptionStatus::Confirmed);
        assert_eq!(engine.subscribe(id).status, SubscriptionStatus::Confirmed);
        assert_eq!(engine.registry().len(), 1);
    }

    #[test]
    fn cancel_confirmed_reports_status() {
        let engine = engine(&["Q0"]);
        let id = RequestId::generate();
        engine.subscribe(id);

        assert_eq!(engine.cancel_confirmed(id).status, SubscriptionStatus::Cancelled);
        assert_eq!(engine.cancel_confirmed(id).status, SubscriptionStatus::Error);
    }

    #[test]
    fn cancel_unconfirmed_removes_subscription() {
        let engine = engine(&["Q0"]);
        let id = RequestId::generate();
        engine.subscribe(id);

        engine.cancel_unconfirmed(id);

        assert!(!engine.registry().is_active(id));
    }

    #[tokio::test]
    async fn get_all_quotes_requires_subscription() {
        let engine = engine(&["Q0", "Q1"]);
        let id = RequestId::generate();

        let err = engine.get_all_quotes(id).err().unwrap();

        assert_eq!(err, DeliveryError::AccessDenied(id));
        assert_eq!(err.code(), "ACCESS_DENIED");
    }

    #[tokio::test(start_paused = true)]
    async fn get_all_quotes_emits_catalog_in_order() {
        let engine = engine(&["Q0", "Q1", "Q2"]);
        let id = RequestId::generate();
        engine.subscribe(id);

        let quotes = collect_ok(engine.get_all_quotes(id).unwrap()).await;

        assert_eq!(quotes, vec!["Q0", "Q1", "Q2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn get_all_quotes_is_paced() {
        let engine = engine(&["Q0", "Q1", "Q2"]);
        let id = RequestId::generate();
        engine.subscribe(id);

        let start = Instant::now();
        let mut stream = engine.get_all_quotes(id).unwrap();
        let mut arrivals = vec![];
        while let Some(item) = stream.next().await {
            item.unwrap();
            arrivals.push(Instant::now());
        }

        assert_eq!(arrivals.len(), 3);
        assert!(arrivals[0] - start >= INTERVAL);
        for pair in arrivals.windows(2) {
            assert!(pair[1] - pair[0] >= INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_quote_waits_one_interval() {
        let engine = engine(&["Q0"]);
        let id = RequestId::generate();
        engine.subscribe(id);

        let start = Instant::now();
        let mut stream = engine.get_all_quotes(id).unwrap();

        tokio::time::sleep(INTERVAL / 2).await;
        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());
        drop(next);

        let quote = stream.next().await.unwrap().unwrap();
        assert_eq!(quote.text, "Q0");
        assert!(start.elapsed() >= INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn get_random_quotes_preserves_request_order() {
        let engine = engine(&["Q0", "Q1", "Q2", "Q3", "Q4", "Q5"]);

        let stream = engine.get_random_quotes(futures::stream::iter(vec![3, 1, 4, 1, 5]));
        let quotes = collect_ok(stream).await;

        assert_eq!(quotes, vec!["Q3", "Q1", "Q4", "Q1", "Q5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn get_random_quotes_stops_at_invalid_id() {
        let engine = engine(&["Q0", "Q1"]);

        let stream = engine.get_random_quotes(futures::stream::iter(vec![1, 7, 0]));
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text, "Q1");
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(
            *err,
            DeliveryError::Catalog(CatalogError::OutOfRange { id: 7, count: 2 })
        );
        assert_eq!(err.code(), "OUT_OF_RANGE");
    }

    #[tokio::test(start_paused = true)]
    async fn get_random_quotes_empty_input_completes() {
        let engine = engine(&["Q0"]);

        let stream = engine.get_random_quotes(futures::stream::iter(Vec::<QuoteId>::new()));
        let items: Vec<_> = stream.collect().await;

        assert!(items.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_consumer_stops_producer() {
        let engine = engine(&["Q0", "Q1", "Q2", "Q3"]);
        let (tx, rx) = mpsc::channel::<QuoteId>(8);

        let mut stream = engine.get_random_quotes(ReceiverStream::new(rx));
        tx.send(0).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().text, "Q0");

        drop(stream);
        tokio::time::sleep(INTERVAL).await;

        // Producer has exited and released the input side
        tx.closed().await;
        assert!(tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_all_quotes_stream_stops_producer() {
        let engine = engine(&["Q0", "Q1", "Q2", "Q3"]);
        let id = RequestId::generate();
        engine.subscribe(id);

        let mut stream = engine.get_all_quotes(id).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().text, "Q0");

        // The producer holds the only other handle on the catalog
        assert_eq!(Arc::strong_count(&engine.catalog), 2);

        drop(stream);
        tokio::time::sleep(INTERVAL).await;

        assert_eq!(Arc::strong_count(&engine.catalog), 1);
    }

    #[test]
    fn number_of_quotes_matches_catalog() {
        let engine = engine(&["a", "b", "c"]);

        assert_eq!(engine.get_number_of_quotes(), 3);
        assert_eq!(engine.get_number_of_quotes(), 3);
    }

    #[test]
    fn default_config() {
        let config = DeliveryConfig::default();
        assert_eq!(config.emission_interval, Duration::from_secs(1));
        assert_eq!(config.stream_buffer, 32);
    }
}
