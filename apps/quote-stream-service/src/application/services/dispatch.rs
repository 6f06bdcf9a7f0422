//! Route Dispatch
//!
//! Maps route names to delivery operations. Each route declares exactly one
//! interaction pattern; a request arriving with the wrong pattern is
//! rejected before any payload is decoded.
//!
//! Payloads cross this boundary as JSON values. The dispatcher decodes them
//! into domain types, calls the engine and encodes the results, so a
//! transport only has to move `serde_json::Value`s around.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use futures::{Stream, StreamExt, future};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::delivery::{DeliveryEngine, DeliveryError, QuoteStream};
use crate::domain::quote::QuoteId;
use crate::domain::subscription::{RequestId, SubscriptionStatus};

// =============================================================================
// Types
// =============================================================================

/// Opaque JSON payload carried by every request and response.
pub type Payload = serde_json::Value;

/// Inbound payload sequence of a channel.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Payload> + Send>>;

/// Outbound payload sequence of a stream or channel.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Payload, DispatchError>> + Send>>;

/// Interaction pattern of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interaction {
    /// One request, one response.
    RequestResponse,
    /// One request, no response.
    FireAndForget,
    /// One request, a finite response stream.
    RequestStream,
    /// A request stream answered by a response stream.
    Channel,
}

impl Interaction {
    /// Get the wire name of the interaction.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResponse => "request_response",
            Self::FireAndForget => "fire_and_forget",
            Self::RequestStream => "request_stream",
            Self::Channel => "request_channel",
        }
    }
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named entry point of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Register a subscription.
    Subscribe,
    /// Cancel a subscription without a reply.
    CancelUnconfirmed,
    /// Cancel a subscription and report the outcome.
    CancelConfirmed,
    /// Stream every quote to a subscriber.
    GetAllQuotes,
    /// Look up a stream of quote ids.
    GetRandomQuotes,
    /// Report the catalog size.
    GetNumberOfQuotes,
}

impl Route {
    /// Every route, in table order.
    pub const ALL: [Self; 6] = [
        Self::Subscribe,
        Self::CancelUnconfirmed,
        Self::CancelConfirmed,
        Self::GetAllQuotes,
        Self::GetRandomQuotes,
        Self::GetNumberOfQuotes,
    ];

    /// Get the wire name of the route.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::CancelUnconfirmed => "cancel-unconfirmed",
            Self::CancelConfirmed => "cancel-confirmed",
            Self::GetAllQuotes => "get-all-quotes",
            Self::GetRandomQuotes => "get-random-quotes",
            Self::GetNumberOfQuotes => "get-number-of-quotes",
        }
    }

    /// Interaction pattern the route is served with.
    #[must_use]
    pub const fn interaction(&self) -> Interaction {
        match self {
            Self::Subscribe | Self::CancelConfirmed | Self::GetNumberOfQuotes => {
                Interaction::RequestResponse
            }
            Self::CancelUnconfirmed => Interaction::FireAndForget,
            Self::GetAllQuotes => Interaction::RequestStream,
            Self::GetRandomQuotes => Interaction::Channel,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|route| route.as_str() == s)
            .ok_or_else(|| DispatchError::UnknownRoute(s.to_string()))
    }
}

/// Typed entry of the route table.
#[derive(Clone, Copy)]
pub enum Handler {
    /// Single payload in, single payload out.
    RequestResponse(fn(&DeliveryEngine, Payload) -> Result<Payload, DispatchError>),
    /// Single payload in, nothing out.
    FireAndForget(fn(&DeliveryEngine, Payload) -> Result<(), DispatchError>),
    /// Single payload in, payload stream out.
    RequestStream(fn(&DeliveryEngine, Payload) -> Result<ResponseStream, DispatchError>),
    /// Payload stream in, payload stream out.
    Channel(fn(&DeliveryEngine, PayloadStream) -> ResponseStream),
}

impl Handler {
    /// Interaction pattern this handler serves.
    #[must_use]
    pub const fn interaction(&self) -> Interaction {
        match self {
            Self::RequestResponse(_) => Interaction::RequestResponse,
            Self::FireAndForget(_) => Interaction::FireAndForget,
            Self::RequestStream(_) => Interaction::RequestStream,
            Self::Channel(_) => Interaction::Channel,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.interaction()).finish()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while routing a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No route with this name exists.
    #[error("unknown route: {0}")]
    UnknownRoute(String),

    /// The route exists but is served with another interaction pattern.
    #[error("route {route} expects {expected}, got {actual}")]
    InteractionMismatch {
        /// Requested route.
        route: Route,
        /// Pattern the route is served with.
        expected: Interaction,
        /// Pattern the caller used.
        actual: Interaction,
    },

    /// The payload did not match the route's input type.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The delivery operation failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl DispatchError {
    /// Stable machine-readable code for the error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownRoute(_) => "UNKNOWN_ROUTE",
            Self::InteractionMismatch { .. } => "INTERACTION_MISMATCH",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::Delivery(err) => err.code(),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Subscription as sent by callers; the status is ignored on input.
#[derive(Debug, Deserialize)]
struct SubscriptionRequest {
    request_id: RequestId,
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<SubscriptionStatus>,
}

fn decode<T: DeserializeOwned>(data: Payload) -> Result<T, DispatchError> {
    serde_json::from_value(data).map_err(|e| DispatchError::InvalidPayload(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Payload, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::InvalidPayload(e.to_string()))
}

fn encode_quotes(quotes: QuoteStream) -> ResponseStream {
    Box::pin(quotes.map(|item| item.map_err(DispatchError::from).and_then(|q| encode(&q))))
}

// =============================================================================
// Handlers
// =============================================================================

fn subscribe(engine: &DeliveryEngine, data: Payload) -> Result<Payload, DispatchError> {
    let request: SubscriptionRequest = decode(data)?;
    encode(&engine.subscribe(request.request_id))
}

fn cancel_unconfirmed(engine: &DeliveryEngine, data: Payload) -> Result<(), DispatchError> {
    let request: SubscriptionRequest = decode(data)?;
    engine.cancel_unconfirmed(request.request_id);
    Ok(())
}

fn cancel_confirmed(engine: &DeliveryEngine, data: Payload) -> Result<Payload, DispatchError> {
    let request: SubscriptionRequest = decode(data)?;
    encode(&engine.cancel_confirmed(request.request_id))
}

fn get_all_quotes(engine: &DeliveryEngine, data: Payload) -> Result<ResponseStream, DispatchError> {
    let request: SubscriptionRequest = decode(data)?;
    let quotes = engine.get_all_quotes(request.request_id)?;
    Ok(encode_quotes(quotes))
}

fn get_number_of_quotes(engine: &DeliveryEngine, _data: Payload) -> Result<Payload, DispatchError> {
    encode(&engine.get_number_of_quotes())
}

/// Decodes channel input lazily. A malformed element ends the input and is
/// reported after the quotes already looked up.
fn get_random_quotes(engine: &DeliveryEngine, input: PayloadStream) -> ResponseStream {
    let (invalid_tx, invalid_rx) = oneshot::channel::<DispatchError>();
    let mut invalid_tx = Some(invalid_tx);

    let quote_ids = input.scan((), move |_, payload| {
        let next = match decode::<QuoteId>(payload) {
            Ok(id) => Some(id),
            Err(err) => {
                if let Some(tx) = invalid_tx.take() {
                    let _ = tx.send(err);
                }
                None
            }
        };
        future::ready(next)
    });

    let trailing = futures::stream::once(invalid_rx)
        .filter_map(|received| future::ready(received.ok().map(Err)));

    Box::pin(encode_quotes(engine.get_random_quotes(quote_ids)).chain(trailing))
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Route table over a delivery engine.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    engine: DeliveryEngine,
    routes: HashMap<Route, Handler>,
}

impl Dispatcher {
    /// Build the route table.
    #[must_use]
    pub fn new(engine: DeliveryEngine) -> Self {
        let routes = HashMap::from([
            (Route::Subscribe, Handler::RequestResponse(subscribe)),
            (Route::CancelUnconfirmed, Handler::FireAndForget(cancel_unconfirmed)),
            (Route::CancelConfirmed, Handler::RequestResponse(cancel_confirmed)),
            (Route::GetAllQuotes, Handler::RequestStream(get_all_quotes)),
            (Route::GetRandomQuotes, Handler::Channel(get_random_quotes)),
            (Route::GetNumberOfQuotes, Handler::RequestResponse(get_number_of_quotes)),
        ]);

        Self { engine, routes }
    }

    /// Get the underlying engine.
    #[must_use]
    pub const fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Serve a request/response route.
    ///
    /// # Errors
    ///
    /// Returns an error if the route is unknown, is not request/response,
    /// the payload is malformed, or the operation fails.
    pub fn request_response(&self, route: &str, data: Payload) -> Result<Payload, DispatchError> {
        match self.lookup(route)? {
            (_, Handler::RequestResponse(handler)) => handler(&self.engine, data),
            (route, other) => Err(mismatch(route, other, Interaction::RequestResponse)),
        }
    }

    /// Serve a fire-and-forget route.
    ///
    /// # Errors
    ///
    /// Returns an error if the route is unknown, is not fire-and-forget or
    /// the payload is malformed. Callers drop it after logging.
    pub fn fire_and_forget(&self, route: &str, data: Payload) -> Result<(), DispatchError> {
        match self.lookup(route)? {
            (_, Handler::FireAndForget(handler)) => handler(&self.engine, data),
            (route, other) => Err(mismatch(route, other, Interaction::FireAndForget)),
        }
    }

    /// Serve a request/stream route.
    ///
    /// # Errors
    ///
    /// Returns an error if the route is unknown, is not request/stream, the
    /// payload is malformed, or the operation is refused up front.
    pub fn request_stream(&self, route: &str, data: Payload) -> Result<ResponseStream, DispatchError> {
        match self.lookup(route)? {
            (_, Handler::RequestStream(handler)) => handler(&self.engine, data),
            (route, other) => Err(mismatch(route, other, Interaction::RequestStream)),
        }
    }

    /// Serve a channel route.
    ///
    /// # Errors
    ///
    /// Returns an error if the route is unknown or is not a channel.
    pub fn request_channel(
        &self,
        route: &str,
        input: PayloadStream,
    ) -> Result<ResponseStream, DispatchError> {
        match self.lookup(route)? {
            (_, Handler::Channel(handler)) => Ok(handler(&self.engine, input)),
            (route, other) => Err(mismatch(route, other, Interaction::Channel)),
        }
    }

    fn lookup(&self, route: &str) -> Result<(Route, Handler), DispatchError> {
        let parsed: Route = route.parse()?;
        self.routes
            .get(&parsed)
            .map(|handler| (parsed, *handler))
            .ok_or_else(|| DispatchError::UnknownRoute(route.to_string()))
    }
}

const fn mismatch(route: Route, handler: Handler, actual: Interaction) -> DispatchError {
    DispatchError::InteractionMismatch {
        route,
        expected: handler.interaction(),
        actual,
    }
}

// =============================================================================
// Tests
// =============================================================================
