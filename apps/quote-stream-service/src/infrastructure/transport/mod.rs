//! WebSocket Transport
//!
//! Carries the four interaction patterns over a single WebSocket per
//! client using JSON text frames.
//!
//! - `frame`: Frame types and codec
//! - `server`: Accept loop and per-connection sessions
//! - `client`: Typed client used by tests and tools

pub mod client;
pub mod frame;
pub mod server;

pub use client::{ClientError, QuoteClient, RemoteStream};
pub use frame::{ClientFrame, CodecError, FrameCodec, INVALID_FRAME, ServerFrame, StreamId};
pub use server::{ConnectionCounter, QuoteServer, ServerError, TransportConfig};
