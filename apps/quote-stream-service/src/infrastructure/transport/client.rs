//! WebSocket Client
//!
//! Typed client for the quote routes. One connection carries any number of
//! concurrent requests; replies are routed back to their caller by stream
//! id.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use quote_stream_service::domain::subscription::RequestId;
//! use quote_stream_service::infrastructure::transport::QuoteClient;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = QuoteClient::connect("ws://127.0.0.1:7000").await?;
//! let id = RequestId::generate();
//!
//! client.subscribe(id).await?;
//! let mut quotes = client.get_all_quotes(id)?;
//! while let Some(quote) = quotes.next().await {
//!     println!("{}", quote?.text);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use futures_util::SinkExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::frame::{ClientFrame, CodecError, FrameCodec, ServerFrame, StreamId};
use crate::application::services::{Payload, Route};
use crate::domain::quote::{Quote, QuoteId};
use crate::domain::subscription::{RequestId, Subscription};

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the quote client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Reply payload did not match the expected type.
    #[error("unexpected payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The server reported an error.
    #[error("{code}: {message}")]
    Remote {
        /// Machine-readable error code.
        code: String,
        /// Human-readable description.
        message: String,
    },

    /// The server replied out of protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl ClientError {
    /// Error code reported by the server, if this is a remote error.
    #[must_use]
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

type PendingStreams = Arc<Mutex<HashMap<StreamId, mpsc::UnboundedSender<ServerFrame>>>>;

// =============================================================================
// Client
// =============================================================================

/// Client for a quote stream server.
pub struct QuoteClient {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingStreams,
    next_stream_id: AtomicU32,
    codec: FrameCodec,
    reader: JoinHandle<()>,
}

impl QuoteClient {
    /// Connect to the server at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the WebSocket handshake fails.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let codec = FrameCodec::default();
        let pending: PendingStreams = Arc::new(Mutex::new(HashMap::new()));
        let routes = Arc::clone(&pending);

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match codec.decode::<ServerFrame>(&text) {
                        Ok(frame) => route_frame(&routes, frame),
                        Err(e) => tracing::warn!(error = %e, "Failed to decode server frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            // Dropping the senders ends every open reply stream
            routes.lock().clear();
        });

        Ok(Self {
            outbound,
            pending,
            next_stream_id: AtomicU32::new(1),
            codec,
            reader,
        })
    }

    /// Register a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn subscribe(&self, request_id: RequestId) -> Result<Subscription, ClientError> {
        self.request(Route::Subscribe, json!({ "request_id": request_id }))
            .await
    }

    /// Cancel a subscription without waiting for an outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be sent.
    pub fn cancel_unconfirmed(&self, request_id: RequestId) -> Result<(), ClientError> {
        self.send(&ClientFrame::FireAndForget {
            route: Route::CancelUnconfirmed.as_str().to_string(),
            data: json!({ "request_id": request_id }),
        })
    }

    /// Cancel a subscription and return the reported status.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn cancel_confirmed(&self, request_id: RequestId) -> Result<Subscription, ClientError> {
        self.request(Route::CancelConfirmed, json!({ "request_id": request_id }))
            .await
    }

    /// Stream every quote for an active subscription.
    ///
    /// Access errors arrive as the first stream item.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent.
    pub fn get_all_quotes(&self, request_id: RequestId) -> Result<RemoteStream<Quote>, ClientError> {
        let (stream_id, replies) = self.open();
        self.send(&ClientFrame::RequestStream {
            stream_id,
            route: Route::GetAllQuotes.as_str().to_string(),
            data: json!({ "request_id": request_id }),
        })?;

        Ok(self.remote_stream(stream_id, replies, None))
    }

    /// Look up quotes for a stream of ids.
    ///
    /// Ids are forwarded as they arrive; dropping the returned stream stops
    /// forwarding and cancels the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent.
    ///
    /// Must be called within a Tokio runtime.
    pub fn get_random_quotes<S>(&self, quote_ids: S) -> Result<RemoteStream<Quote>, ClientError>
    where
        S: Stream<Item = QuoteId> + Send + 'static,
    {
        let (stream_id, replies) = self.open();
        self.send(&ClientFrame::RequestChannel {
            stream_id,
            route: Route::GetRandomQuotes.as_str().to_string(),
        })?;

        let stop = CancellationToken::new();
        let forward_stop = stop.clone();
        let outbound = self.outbound.clone();
        let codec = self.codec;

        tokio::spawn(async move {
            let mut quote_ids = Box::pin(quote_ids);
            loop {
                let next = tokio::select! {
                    () = forward_stop.cancelled() => return,
                    next = quote_ids.next() => next,
                };

                let frame = match next {
                    Some(id) => ClientFrame::Next {
                        stream_id,
                        data: json!(id),
                    },
                    None => ClientFrame::Complete { stream_id },
                };
                let done = matches!(frame, ClientFrame::Complete { .. });

                let Ok(text) = codec.encode(&frame) else {
                    return;
                };
                if outbound.send(Message::Text(text.into())).is_err() || done {
                    return;
                }
            }
        });

        Ok(self.remote_stream(stream_id, replies, Some(stop)))
    }

    /// Get the catalog size.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn get_number_of_quotes(&self) -> Result<usize, ClientError> {
        self.request(Route::GetNumberOfQuotes, Payload::Null).await
    }

    /// `count` random quote ids in `[0, bound)`, for channel input.
    ///
    /// Returns an empty list if `bound` is zero.
    #[must_use]
    pub fn random_quote_ids(count: usize, bound: QuoteId) -> Vec<QuoteId> {
        if bound == 0 {
            return Vec::new();
        }
        let mut rng = rand::rng();
        (0..count).map(|_| rng.random_range(0..bound)).collect()
    }

    /// Send a close frame and stop reading.
    pub fn close(self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    async fn request<T: DeserializeOwned>(&self, route: Route, data: Payload) -> Result<T, ClientError> {
        let (stream_id, mut replies) = self.open();
        self.send(&ClientFrame::RequestResponse {
            stream_id,
            route: route.as_str().to_string(),
            data,
        })?;

        match replies.recv().await {
            Some(ServerFrame::Next { data, .. }) => Ok(serde_json::from_value(data)?),
            Some(ServerFrame::Error { code, message, .. }) => Err(ClientError::Remote { code, message }),
            Some(ServerFrame::Complete { .. }) => {
                Err(ClientError::Protocol(format!("{route} completed without a reply")))
            }
            None => Err(ClientError::ConnectionClosed),
        }
    }

    fn open(&self) -> (StreamId, mpsc::UnboundedReceiver<ServerFrame>) {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(stream_id, tx);
        (stream_id, rx)
    }

    fn send(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let text = self.codec.encode(frame)?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| ClientError::ConnectionClosed)
    }

    fn remote_stream<T>(
        &self,
        stream_id: StreamId,
        replies: mpsc::UnboundedReceiver<ServerFrame>,
        forwarder: Option<CancellationToken>,
    ) -> RemoteStream<T> {
        RemoteStream {
            stream_id,
            replies,
            outbound: self.outbound.clone(),
            pending: Arc::clone(&self.pending),
            codec: self.codec,
            forwarder,
            done: false,
            _item: PhantomData,
        }
    }
}

impl Drop for QuoteClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.pending.lock().clear();
    }
}

fn route_frame(pending: &PendingStreams, frame: ServerFrame) {
    let (stream_id, terminal) = match &frame {
        ServerFrame::Next { stream_id, .. } => (*stream_id, false),
        ServerFrame::Complete { stream_id } => (*stream_id, true),
        ServerFrame::Error {
            stream_id: Some(stream_id),
            ..
        } => (*stream_id, true),
        ServerFrame::Error {
            stream_id: None,
            code,
            message,
        } => {
            tracing::warn!(%code, %message, "Server rejected a frame");
            return;
        }
    };

    let mut pending = pending.lock();
    if let Some(tx) = pending.get(&stream_id) {
        let _ = tx.send(frame);
    }
    if terminal {
        pending.remove(&stream_id);
    }
}

// =============================================================================
// Remote Stream
// =============================================================================

/// Reply stream of a request/stream or channel call.
///
/// Yields decoded items until the server completes the stream or reports an
/// error. Dropping it early sends `cancel` to the server.
pub struct RemoteStream<T> {
    stream_id: StreamId,
    replies: mpsc::UnboundedReceiver<ServerFrame>,
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingStreams,
    codec: FrameCodec,
    forwarder: Option<CancellationToken>,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T> RemoteStream<T> {
    /// Stream id used on the wire.
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl<T: DeserializeOwned> Stream for RemoteStream<T> {
    type Item = Result<T, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.replies.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(ServerFrame::Next { data, .. })) => {
                Poll::Ready(Some(serde_json::from_value(data).map_err(ClientError::from)))
            }
            Poll::Ready(Some(ServerFrame::Complete { .. })) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(ServerFrame::Error { code, message, .. })) => {
                this.done = true;
                Poll::Ready(Some(Err(ClientError::Remote { code, message })))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(ClientError::ConnectionClosed)))
            }
        }
    }
}

impl<T> Drop for RemoteStream<T> {
    fn drop(&mut self) {
        if let Some(forwarder) = &self.forwarder {
            forwarder.cancel();
        }
        if self.done {
            return;
        }

        self.pending.lock().remove(&self.stream_id);
        if let Ok(text) = self.codec.encode(&ClientFrame::Cancel {
            stream_id: self.stream_id,
        }) {
            let _ = self.outbound.send(Message::Text(text.into()));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
