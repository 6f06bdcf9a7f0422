//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `DeliveryEngine`: Quote operations and paced streams
//! - `Dispatcher`: Route table mapping named routes to engine operations

pub mod delivery;
pub mod dispatch;

pub use delivery::{
    DEFAULT_EMISSION_INTERVAL, DEFAULT_STREAM_BUFFER, DeliveryConfig, DeliveryEngine,
    DeliveryError, QuoteStream,
};
pub use dispatch::{
    DispatchError, Dispatcher, Handler, Interaction, Payload, PayloadStream, ResponseStream, Route,
};
