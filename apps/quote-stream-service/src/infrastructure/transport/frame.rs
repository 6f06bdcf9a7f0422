//! Frame Protocol
//!
//! JSON text frames exchanged over the WebSocket, tagged by `"type"`.
//!
//! # Client → Server
//!
//! ```json
//! {"type":"request_response","stream_id":1,"route":"subscribe","data":{"request_id":"..."}}
//! {"type":"fire_and_forget","route":"cancel-unconfirmed","data":{"request_id":"..."}}
//! {"type":"request_stream","stream_id":2,"route":"get-all-quotes","data":{"request_id":"..."}}
//! {"type":"request_channel","stream_id":3,"route":"get-random-quotes"}
//! {"type":"next","stream_id":3,"data":4}
//! {"type":"complete","stream_id":3}
//! {"type":"cancel","stream_id":2}
//! ```
//!
//! # Server → Client
//!
//! ```json
//! {"type":"next","stream_id":2,"data":{"id":0,"text":"..."}}
//! {"type":"complete","stream_id":2}
//! {"type":"error","stream_id":2,"code":"ACCESS_DENIED","message":"..."}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::application::services::{DispatchError, Payload};

/// Client-chosen identifier of a stream, unique per connection while live.
pub type StreamId = u32;

/// Error code for frames that cannot be decoded or violate the protocol.
pub const INVALID_FRAME: &str = "INVALID_FRAME";

/// Default upper bound on an inbound frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

// =============================================================================
// Frames
// =============================================================================

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Single request, single reply.
    RequestResponse {
        /// Stream the reply is sent on.
        stream_id: StreamId,
        /// Route name.
        route: String,
        /// Request payload.
        #[serde(default)]
        data: Payload,
    },
    /// Single request, no reply.
    FireAndForget {
        /// Route name.
        route: String,
        /// Request payload.
        #[serde(default)]
        data: Payload,
    },
    /// Single request opening a response stream.
    RequestStream {
        /// Stream the responses are sent on.
        stream_id: StreamId,
        /// Route name.
        route: String,
        /// Request payload.
        #[serde(default)]
        data: Payload,
    },
    /// Open a channel; inputs follow as `next` frames.
    RequestChannel {
        /// Stream both directions are sent on.
        stream_id: StreamId,
        /// Route name.
        route: String,
    },
    /// Channel input element.
    Next {
        /// Target channel.
        stream_id: StreamId,
        /// Input payload.
        data: Payload,
    },
    /// No more channel input.
    Complete {
        /// Target channel.
        stream_id: StreamId,
    },
    /// Stop a live stream or channel.
    Cancel {
        /// Target stream.
        stream_id: StreamId,
    },
}

impl ClientFrame {
    /// Stream addressed by the frame, if any.
    #[must_use]
    pub const fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::FireAndForget { .. } => None,
            Self::RequestResponse { stream_id, .. }
            | Self::RequestStream { stream_id, .. }
            | Self::RequestChannel { stream_id, .. }
            | Self::Next { stream_id, .. }
            | Self::Complete { stream_id }
            | Self::Cancel { stream_id } => Some(*stream_id),
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Response element.
    Next {
        /// Stream the element belongs to.
        stream_id: StreamId,
        /// Response payload.
        data: Payload,
    },
    /// Successful end of a stream.
    Complete {
        /// Finished stream.
        stream_id: StreamId,
    },
    /// Terminal failure of a stream, or of an undecodable frame.
    Error {
        /// Failed stream, absent when the frame could not be attributed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<StreamId>,
        /// Machine-readable error code.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl ServerFrame {
    /// Error frame for a failed dispatch.
    #[must_use]
    pub fn dispatch_error(stream_id: StreamId, err: &DispatchError) -> Self {
        Self::Error {
            stream_id: Some(stream_id),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Error frame for a protocol violation.
    #[must_use]
    pub fn invalid_frame(stream_id: Option<StreamId>, message: impl Into<String>) -> Self {
        Self::Error {
            stream_id,
            code: INVALID_FRAME.to_string(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Frame codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame exceeds the configured size limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

impl CodecError {
    /// Wire error code reported for the failure.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        INVALID_FRAME
    }
}

/// JSON codec for both frame directions.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    /// Create a codec that rejects frames larger than `max_frame_bytes`.
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Get the frame size limit.
    #[must_use]
    pub const fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or is not a valid frame.
    pub fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, CodecError> {
        if text.len() > self.max_frame_bytes {
            return Err(CodecError::TooLarge {
                size: text.len(),
                limit: self.max_frame_bytes,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Encode a frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode<T: Serialize>(&self, frame: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(frame)?)
    }
}

// =============================================================================
// Tests
// =============================================================================
