//! WebSocket Server
//!
//! Accepts WebSocket connections and serves the frame protocol on top of
//! the route dispatcher.
//!
//! # Connection Model
//!
//! Each connection runs a reader loop and one writer task. The reader
//! decodes client frames and dispatches them; every live stream or channel
//! gets its own pump task that forwards responses into the writer's queue.
//! Cancelling a stream, closing the connection or shutting the server down
//! cancels the pump, which drops the response stream and with it the
//! producer behind it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::frame::{
    ClientFrame, DEFAULT_MAX_FRAME_BYTES, FrameCodec, INVALID_FRAME, ServerFrame, StreamId,
};
use crate::application::services::{Dispatcher, Payload, PayloadStream, ResponseStream, Route};
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the WebSocket server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Listener I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Configuration
// =============================================================================

/// Default number of outbound frames queued per connection.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default number of unread channel input elements per stream.
pub const DEFAULT_INPUT_BUFFER: usize = 256;

/// Configuration for the WebSocket server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Largest accepted inbound text frame.
    pub max_frame_bytes: usize,
    /// Outbound frames queued per connection before producers wait.
    pub outbound_buffer: usize,
    /// Unread channel input elements held per stream before it is failed.
    pub input_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            input_buffer: DEFAULT_INPUT_BUFFER,
        }
    }
}

// =============================================================================
// Connection Tracking
// =============================================================================

/// Shared count of open WebSocket connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounter(Arc<AtomicUsize>);

impl ConnectionCounter {
    /// Number of open connections.
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn open(&self) -> ConnectionGuard {
        let count = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_connections(count);
        ConnectionGuard(self.clone())
    }
}

struct ConnectionGuard(ConnectionCounter);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.0.0.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_connections(count);
    }
}

// =============================================================================
// Server
// =============================================================================

/// WebSocket server for the quote routes.
pub struct QuoteServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: TransportConfig,
    connections: ConnectionCounter,
}

impl QuoteServer {
    /// Bind the server to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Dispatcher,
        config: TransportConfig,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
            config,
            connections: ConnectionCounter::default(),
        })
    }

    /// Get the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Get the open connection counter.
    #[must_use]
    pub fn connections(&self) -> ConnectionCounter {
        self.connections.clone()
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Cancelling `shutdown` also closes every open connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener address cannot be read.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "WebSocket server listening");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("WebSocket server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let connections = self.connections.clone();
                        let token = shutdown.child_token();
                        let config = self.config;
                        tokio::spawn(async move {
                            serve_connection(stream, peer, dispatcher, config, connections, token).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: TransportConfig,
    connections: ConnectionCounter,
    shutdown: CancellationToken,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let _guard = connections.open();
    tracing::info!(%peer, "Client connected");

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(config.outbound_buffer.max(1));

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let session = Session {
        dispatcher,
        outbox: Outbox {
            tx,
            codec: FrameCodec::new(config.max_frame_bytes),
        },
        streams: Arc::new(StreamTable::default()),
        input_buffer: config.input_buffer.max(1),
    };

    loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => break,
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
            Some(Ok(Message::Ping(data))) => {
                let _ = session.outbox.tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Binary(_))) => {
                session
                    .outbox
                    .send(&ServerFrame::invalid_frame(None, "binary frames are not supported"))
                    .await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(%peer, error = %e, "WebSocket error");
                break;
            }
        }
    }

    let cancelled = session.streams.cancel_all();
    drop(session);
    let _ = writer.await;

    tracing::info!(%peer, cancelled, "Client disconnected");
}

// =============================================================================
// Session
// =============================================================================

/// Encodes frames into a connection's outbound queue.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::Sender<Message>,
    codec: FrameCodec,
}

impl Outbox {
    /// Queue `frame`. Returns `false` once the connection is gone.
    async fn send(&self, frame: &ServerFrame) -> bool {
        match self.codec.encode(frame) {
            Ok(text) => self.tx.send(Message::Text(text.into())).await.is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode frame");
                true
            }
        }
    }
}

struct LiveStream {
    serial: u64,
    route: &'static str,
    cancel: CancellationToken,
    input: Option<mpsc::Sender<Payload>>,
}

/// Live streams of one connection, keyed by client stream id.
#[derive(Default)]
struct StreamTable {
    streams: Mutex<HashMap<StreamId, LiveStream>>,
    next_serial: AtomicU64,
}

impl StreamTable {
    fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.lock().contains_key(&stream_id)
    }

    /// Register a stream. Returns `None` if the id is already live.
    fn register(
        &self,
        stream_id: StreamId,
        route: &'static str,
        input: Option<mpsc::Sender<Payload>>,
    ) -> Option<(u64, CancellationToken)> {
        let mut streams = self.streams.lock();
        match streams.entry(stream_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                slot.insert(LiveStream {
                    serial,
                    route,
                    cancel: cancel.clone(),
                    input,
                });
                Some((serial, cancel))
            }
        }
    }

    /// Remove a stream that ended on its own.
    ///
    /// Leaves the entry alone if the id has since been reused.
    fn finish(&self, stream_id: StreamId, serial: u64) {
        let mut streams = self.streams.lock();
        if streams.get(&stream_id).is_some_and(|s| s.serial == serial) {
            streams.remove(&stream_id);
        }
    }

    /// Remove and cancel a stream. Returns its route label if it was live.
    fn cancel(&self, stream_id: StreamId) -> Option<&'static str> {
        let removed = self.streams.lock().remove(&stream_id)?;
        removed.cancel.cancel();
        Some(removed.route)
    }

    /// Cancel every live stream and return how many there were.
    fn cancel_all(&self) -> usize {
        let drained: Vec<LiveStream> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in &drained {
            stream.cancel.cancel();
        }
        drained.len()
    }

    fn input(&self, stream_id: StreamId) -> Option<mpsc::Sender<Payload>> {
        self.streams
            .lock()
            .get(&stream_id)
            .and_then(|s| s.input.clone())
    }

    /// Drop the input side of a channel. Returns `false` if there was none.
    fn close_input(&self, stream_id: StreamId) -> bool {
        self.streams
            .lock()
            .get_mut(&stream_id)
            .and_then(|s| s.input.take())
            .is_some()
    }
}

struct Session {
    dispatcher: Arc<Dispatcher>,
    outbox: Outbox,
    streams: Arc<StreamTable>,
    input_buffer: usize,
}

impl Session {
    async fn handle_text(&self, text: &str) {
        match self.outbox.codec.decode::<ClientFrame>(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode client frame");
                self.outbox
                    .send(&ServerFrame::invalid_frame(None, e.to_string()))
                    .await;
            }
        }
    }

    async fn handle_frame(&self, frame: ClientFrame) {
        match frame {
            ClientFrame::RequestResponse {
                stream_id,
                route,
                data,
            } => {
                if self.reject_duplicate(stream_id).await {
                    return;
                }
                metrics::record_operation(route_label(&route));

                match self.dispatcher.request_response(&route, data) {
                    Ok(reply) => {
                        self.outbox
                            .send(&ServerFrame::Next {
                                stream_id,
                                data: reply,
                            })
                            .await;
                        self.outbox.send(&ServerFrame::Complete { stream_id }).await;
                    }
                    Err(err) => {
                        tracing::warn!(stream_id, %route, error = %err, "Request failed");
                        self.outbox
                            .send(&ServerFrame::dispatch_error(stream_id, &err))
                            .await;
                    }
                }
            }

            ClientFrame::FireAndForget { route, data } => {
                metrics::record_operation(route_label(&route));
                if let Err(err) = self.dispatcher.fire_and_forget(&route, data) {
                    tracing::warn!(%route, error = %err, "Fire-and-forget request dropped");
                }
            }

            ClientFrame::RequestStream {
                stream_id,
                route,
                data,
            } => {
                if self.reject_duplicate(stream_id).await {
                    return;
                }
                let label = route_label(&route);
                metrics::record_operation(label);

                match self.dispatcher.request_stream(&route, data) {
                    Ok(responses) => self.spawn_pump(stream_id, label, responses, None),
                    Err(err) => {
                        tracing::warn!(stream_id, %route, error = %err, "Stream refused");
                        metrics::record_stream_error(label, err.code());
                        self.outbox
                            .send(&ServerFrame::dispatch_error(stream_id, &err))
                            .await;
                    }
                }
            }

            ClientFrame::RequestChannel { stream_id, route } => {
                if self.reject_duplicate(stream_id).await {
                    return;
                }
                let label = route_label(&route);
                metrics::record_operation(label);

                let (input_tx, input_rx) = mpsc::channel(self.input_buffer);
                let input: PayloadStream = Box::pin(ReceiverStream::new(input_rx));

                match self.dispatcher.request_channel(&route, input) {
                    Ok(responses) => self.spawn_pump(stream_id, label, responses, Some(input_tx)),
                    Err(err) => {
                        tracing::warn!(stream_id, %route, error = %err, "Channel refused");
                        metrics::record_stream_error(label, err.code());
                        self.outbox
                            .send(&ServerFrame::dispatch_error(stream_id, &err))
                            .await;
                    }
                }
            }

            ClientFrame::Next { stream_id, data } => match self.streams.input(stream_id) {
                Some(input) => match input.try_send(data) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => self.overflow(stream_id).await,
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!(stream_id, "Channel input after producer exit, ignored");
                    }
                },
                None => {
                    tracing::debug!(stream_id, "Input for unknown or closed channel, ignored");
                }
            },

            ClientFrame::Complete { stream_id } => {
                if !self.streams.close_input(stream_id) {
                    tracing::debug!(stream_id, "Complete for unknown or closed channel, ignored");
                }
            }

            ClientFrame::Cancel { stream_id } => {
                if self.streams.cancel(stream_id).is_some() {
                    tracing::debug!(stream_id, "Stream cancelled by client");
                } else {
                    tracing::debug!(stream_id, "Cancel for unknown stream, ignored");
                }
            }
        }
    }

    /// Fail a channel whose client sends input faster than it is consumed.
    async fn overflow(&self, stream_id: StreamId) {
        let Some(route) = self.streams.cancel(stream_id) else {
            return;
        };

        tracing::warn!(
            stream_id,
            route,
            limit = self.input_buffer,
            "Channel input overflow, stream cancelled"
        );
        metrics::record_stream_error(route, INVALID_FRAME);
        self.outbox
            .send(&ServerFrame::invalid_frame(
                Some(stream_id),
                "channel input overflow",
            ))
            .await;
    }

    async fn reject_duplicate(&self, stream_id: StreamId) -> bool {
        if !self.streams.contains(stream_id) {
            return false;
        }

        tracing::warn!(stream_id, "Request on a stream id that is still live");
        self.outbox
            .send(&ServerFrame::invalid_frame(
                Some(stream_id),
                format!("stream {stream_id} is already live"),
            ))
            .await;
        true
    }

    fn spawn_pump(
        &self,
        stream_id: StreamId,
        route: &'static str,
        responses: ResponseStream,
        input: Option<mpsc::Sender<Payload>>,
    ) {
        let Some((serial, cancel)) = self.streams.register(stream_id, route, input) else {
            return;
        };

        let pump = Pump {
            stream_id,
            serial,
            route,
            cancel,
            outbox: self.outbox.clone(),
            streams: Arc::clone(&self.streams),
        };
        tokio::spawn(pump.run(responses));
    }
}

fn route_label(route: &str) -> &'static str {
    route.parse::<Route>().map_or("unknown", |r| r.as_str())
}

// =============================================================================
// Pump
// =============================================================================

/// Forwards one response stream into the connection's outbound queue.
struct Pump {
    stream_id: StreamId,
    serial: u64,
    route: &'static str,
    cancel: CancellationToken,
    outbox: Outbox,
    streams: Arc<StreamTable>,
}

impl Pump {
    async fn run(self, mut responses: ResponseStream) {
        let started = Instant::now();
        let stream_id = self.stream_id;

        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::debug!(stream_id, route = self.route, "Stream abandoned");
                    metrics::record_stream_abandoned(self.route);
                    break;
                }
                item = responses.next() => item,
            };

            match item {
                Some(Ok(data)) => {
                    if !self.outbox.send(&ServerFrame::Next { stream_id, data }).await {
                        metrics::record_stream_abandoned(self.route);
                        break;
                    }
                    metrics::record_quote_emitted(self.route);
                }
                Some(Err(err)) => {
                    self.streams.finish(stream_id, self.serial);
                    metrics::record_stream_error(self.route, err.code());
                    tracing::warn!(stream_id, route = self.route, error = %err, "Stream failed");
                    self.outbox
                        .send(&ServerFrame::dispatch_error(stream_id, &err))
                        .await;
                    break;
                }
                None => {
                    self.streams.finish(stream_id, self.serial);
                    self.outbox.send(&ServerFrame::Complete { stream_id }).await;
                    break;
                }
            }
        }

        metrics::record_stream_duration(self.route, started.elapsed());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::application::services::{DeliveryConfig, DeliveryEngine};
    use crate::domain::quote::QuoteCatalog;
    use crate::domain::subscription::SubscriptionRegistry;

    fn session(input_buffer: usize) -> (Session, mpsc::Receiver<Message>) {
        let engine = DeliveryEngine::new(
            Arc::new(QuoteCatalog::from_texts(["Q0", "Q1"])),
            Arc::new(SubscriptionRegistry::new()),
            DeliveryConfig {
                emission_interval: Duration::from_secs(60),
                stream_buffer: 1,
            },
        );
        let (tx, rx) = mpsc::channel(64);
        let session = Session {
            dispatcher: Arc::new(Dispatcher::new(engine)),
            outbox: Outbox {
                tx,
                codec: FrameCodec::default(),
            },
            streams: Arc::new(StreamTable::default()),
            input_buffer,
        };
        (session, rx)
    }

    fn frame_json(msg: &Message) -> serde_json::Value {
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    async fn open_channel(session: &Session, stream_id: StreamId) {
        session
            .handle_frame(ClientFrame::RequestChannel {
                stream_id,
                route: "get-random-quotes".to_string(),
            })
            .await;
    }

    async fn push_input(session: &Session, stream_id: StreamId, count: usize) {
        for _ in 0..count {
            session
                .handle_frame(ClientFrame::Next {
                    stream_id,
                    data: json!(1),
                })
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flooded_channel_input_fails_stream() {
        let (session, mut rx) = session(2);
        open_channel(&session, 3).await;

        push_input(&session, 3, 10).await;

        let frame = frame_json(&rx.recv().await.unwrap());
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["stream_id"], 3);
        assert_eq!(frame["code"], INVALID_FRAME);
        assert!(!session.streams.contains(3));

        // Input after the failure is ignored without further replies
        push_input(&session, 3, 5).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_input_within_limit_is_queued() {
        let (session, mut rx) = session(4);
        open_channel(&session, 5).await;

        push_input(&session, 5, 3).await;

        assert!(session.streams.contains(5));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stream_table_rejects_live_duplicate() {
        let table = StreamTable::default();

        assert!(table.register(1, "get-all-quotes", None).is_some());
        assert!(table.register(1, "get-all-quotes", None).is_none());
        assert!(table.contains(1));
    }

    #[test]
    fn finish_ignores_reused_id() {
        let table = StreamTable::default();
        let (first, _) = table.register(1, "get-all-quotes", None).unwrap();
        assert!(table.cancel(1).is_some());

        let (second, _) = table.register(1, "get-all-quotes", None).unwrap();
        table.finish(1, first);
        assert!(table.contains(1));

        table.finish(1, second);
        assert!(!table.contains(1));
    }

    #[test]
    fn cancel_trips_token() {
        let table = StreamTable::default();
        let (_, token) = table.register(7, "get-all-quotes", None).unwrap();

        assert_eq!(table.cancel(7), Some("get-all-quotes"));
        assert!(token.is_cancelled());
        assert!(table.cancel(7).is_none());
    }

    #[test]
    fn cancel_all_drains_table() {
        let table = StreamTable::default();
        let (_, a) = table.register(1, "get-all-quotes", None).unwrap();
        let (_, b) = table.register(2, "get-all-quotes", None).unwrap();

        assert_eq!(table.cancel_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(!table.contains(1));
    }

    #[test]
    fn close_input_drops_sender() {
        let table = StreamTable::default();
        let (tx, mut rx) = mpsc::channel(4);
        table.register(3, "get-random-quotes", Some(tx)).unwrap();

        assert!(table.input(3).is_some());
        assert!(table.close_input(3));
        assert!(table.input(3).is_none());
        assert!(!table.close_input(3));
        assert!(rx.try_recv().is_err());
        assert!(rx.is_closed());
    }

    #[test]
    fn connection_counter_tracks_guards() {
        let counter = ConnectionCounter::default();
        let first = counter.open();
        let second = counter.open();
        assert_eq!(counter.get(), 2);

        drop(first);
        drop(second);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn route_labels() {
        assert_eq!(route_label("get-all-quotes"), "get-all-quotes");
        assert_eq!(route_label("nope"), "unknown");
    }
}
