//! WebSocket Transport Integration Tests
//!
//! Runs a real server on a random port and exercises every route through
//! the typed client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures_util::SinkExt;
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use quote_stream_service::infrastructure::transport::ConnectionCounter;
use quote_stream_service::{
    DeliveryConfig, DeliveryEngine, Dispatcher, Quote, QuoteCatalog, QuoteClient, QuoteServer,
    RequestId, SubscriptionRegistry, SubscriptionStatus, TransportConfig,
};

const QUOTES: [&str; 6] = ["Q0", "Q1", "Q2", "Q3", "Q4", "Q5"];

/// Upper bound for any single test step.
const STEP: Duration = Duration::from_secs(5);

struct TestServer {
    url: String,
    registry: Arc<SubscriptionRegistry>,
    connections: ConnectionCounter,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start a quote server on a random port.
async fn setup_test_server() -> TestServer {
    setup_server_with(Duration::from_millis(5), TransportConfig::default()).await
}

/// Start a quote server with a custom pacing interval and transport limits.
async fn setup_server_with(interval: Duration, transport: TransportConfig) -> TestServer {
    let registry = Arc::new(SubscriptionRegistry::new());
    let engine = DeliveryEngine::new(
        Arc::new(QuoteCatalog::from_texts(QUOTES)),
        Arc::clone(&registry),
        DeliveryConfig {
            emission_interval: interval,
            stream_buffer: 4,
        },
    );

    let server = QuoteServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Dispatcher::new(engine),
        transport,
    )
    .await
    .unwrap();

    let addr = server.local_addr().unwrap();
    let connections = server.connections();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        server.run(token).await.unwrap();
    });

    TestServer {
        url: format!("ws://{addr}"),
        registry,
        connections,
        shutdown,
    }
}

async fn connect(server: &TestServer) -> QuoteClient {
    timeout(STEP, QuoteClient::connect(&server.url))
        .await
        .expect("connect timed out")
        .unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(STEP, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

type RawSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn send_raw(ws: &mut RawSocket, frame: serde_json::Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, or `None` if nothing arrives within `wait`.
async fn recv_raw(ws: &mut RawSocket, wait: Duration) -> Option<serde_json::Value> {
    loop {
        let msg = timeout(wait, ws.next()).await.ok()?.unwrap().unwrap();
        if let Message::Text(text) = msg {
            return Some(serde_json::from_str(&text).unwrap());
        }
    }
}

fn texts(quotes: &[Quote]) -> Vec<&str> {
    quotes.iter().map(|q| q.text.as_str()).collect()
}

// =============================================================================
// Request/Response and Fire-and-Forget
// =============================================================================

#[tokio::test]
async fn subscribe_then_cancel() {
    let server = setup_test_server().await;
    let client = connect(&server).await;
    let id = RequestId::generate();

    let subscription = timeout(STEP, client.subscribe(id)).await.unwrap().unwrap();
    assert_eq!(subscription.request_id, id);
    assert_eq!(subscription.status, SubscriptionStatus::Confirmed);
    assert!(server.registry.is_active(id));

    let cancelled = timeout(STEP, client.cancel_confirmed(id)).await.unwrap().unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

    let again = timeout(STEP, client.cancel_confirmed(id)).await.unwrap().unwrap();
    assert_eq!(again.status, SubscriptionStatus::Error);
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn unconfirmed_cancel_removes_subscription() {
    let server = setup_test_server().await;
    let client = connect(&server).await;
    let id = RequestId::generate();

    timeout(STEP, client.subscribe(id)).await.unwrap().unwrap();
    client.cancel_unconfirmed(id).unwrap();

    let registry = Arc::clone(&server.registry);
    wait_for(|| !registry.is_active(id)).await;

    // Cancelling an unknown id is silent too
    client.cancel_unconfirmed(RequestId::generate()).unwrap();
    let count = timeout(STEP, client.get_number_of_quotes()).await.unwrap().unwrap();
    assert_eq!(count, QUOTES.len());
}

#[tokio::test]
async fn number_of_quotes() {
    let server = setup_test_server().await;
    let client = connect(&server).await;

    for _ in 0..2 {
        let count = timeout(STEP, client.get_number_of_quotes()).await.unwrap().unwrap();
        assert_eq!(count, 6);
    }
}

// =============================================================================
// Request/Stream
// =============================================================================

#[tokio::test]
async fn subscribe_for_quotes() {
    let server = setup_test_server().await;
    let client = connect(&server).await;
    let id = RequestId::generate();

    timeout(STEP, client.subscribe(id)).await.unwrap().unwrap();

    let stream = client.get_all_quotes(id).unwrap();
    let quotes: Vec<Quote> = timeout(STEP, stream.map(Result::unwrap).collect())
        .await
        .unwrap();

    assert_eq!(texts(&quotes), QUOTES);
}

#[tokio::test]
async fn quotes_without_subscription_are_denied() {
    let server = setup_test_server().await;
    let client = connect(&server).await;

    let mut stream = client.get_all_quotes(RequestId::generate()).unwrap();
    let first = timeout(STEP, stream.next()).await.unwrap().unwrap();

    assert_eq!(first.unwrap_err().remote_code(), Some("ACCESS_DENIED"));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn quotes_after_cancel_are_denied() {
    let server = setup_test_server().await;
    let client = connect(&server).await;
    let id = RequestId::generate();

    timeout(STEP, client.subscribe(id)).await.unwrap().unwrap();
    timeout(STEP, client.cancel_confirmed(id)).await.unwrap().unwrap();

    let mut stream = client.get_all_quotes(id).unwrap();
    let first = timeout(STEP, stream.next()).await.unwrap().unwrap();
    assert_eq!(first.unwrap_err().remote_code(), Some("ACCESS_DENIED"));
}

#[tokio::test]
async fn dropping_stream_keeps_connection_usable() {
    let server = setup_test_server().await;
    let client = connect(&server).await;
    let id = RequestId::generate();

    timeout(STEP, client.subscribe(id)).await.unwrap().unwrap();

    let mut stream = client.get_all_quotes(id).unwrap();
    let first = timeout(STEP, stream.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first.text, "Q0");
    drop(stream);

    let count = timeout(STEP, client.get_number_of_quotes()).await.unwrap().unwrap();
    assert_eq!(count, 6);
}

// =============================================================================
// Channel
// =============================================================================

#[tokio::test]
async fn random_quotes_channel() {
    let server = setup_test_server().await;
    let client = connect(&server).await;

    let ids = QuoteClient::random_quote_ids(10, 6);
    let stream = client
        .get_random_quotes(futures::stream::iter(ids.clone()))
        .unwrap();
    let quotes: Vec<Quote> = timeout(STEP, stream.map(Result::unwrap).collect())
        .await
        .unwrap();

    let received: Vec<_> = quotes.iter().map(|q| q.id).collect();
    assert_eq!(received, ids);
    for quote in &quotes {
        assert_eq!(quote.text, QUOTES[quote.id as usize]);
    }
}

#[tokio::test]
async fn random_quotes_out_of_range() {
    let server = setup_test_server().await;
    let client = connect(&server).await;

    let stream = client
        .get_random_quotes(futures::stream::iter([3, 1, 40, 2]))
        .unwrap();
    let items: Vec<_> = timeout(STEP, stream.collect()).await.unwrap();

    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap().text, "Q3");
    assert_eq!(items[1].as_ref().unwrap().text, "Q1");
    assert_eq!(
        items[2].as_ref().unwrap_err().remote_code(),
        Some("OUT_OF_RANGE")
    );
}

#[tokio::test]
async fn concurrent_requests_share_a_connection() {
    let server = setup_test_server().await;
    let client = connect(&server).await;
    let id = RequestId::generate();
    timeout(STEP, client.subscribe(id)).await.unwrap().unwrap();

    let all = client.get_all_quotes(id).unwrap();
    let random = client
        .get_random_quotes(futures::stream::iter([5, 4]))
        .unwrap();

    let (all, random): (Vec<Quote>, Vec<Quote>) = timeout(
        STEP,
        futures::future::join(
            all.map(Result::unwrap).collect(),
            random.map(Result::unwrap).collect(),
        ),
    )
    .await
    .unwrap();

    assert_eq!(texts(&all), QUOTES);
    assert_eq!(texts(&random), ["Q5", "Q4"]);
}

// =============================================================================
// Protocol Errors and Lifecycle
// =============================================================================

#[tokio::test]
async fn unknown_route_is_reported() {
    let server = setup_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();

    ws.send(Message::Text(
        r#"{"type":"request_response","stream_id":1,"route":"get-quote-of-the-day","data":null}"#
            .into(),
    ))
    .await
    .unwrap();

    let reply = timeout(STEP, ws.next()).await.unwrap().unwrap().unwrap();
    let frame: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["stream_id"], 1);
    assert_eq!(frame["code"], "UNKNOWN_ROUTE");
}

#[tokio::test]
async fn malformed_frame_is_reported() {
    let server = setup_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();

    ws.send(Message::Text("not json".into())).await.unwrap();

    let reply = timeout(STEP, ws.next()).await.unwrap().unwrap().unwrap();
    let frame: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "INVALID_FRAME");
}

#[tokio::test]
async fn connection_count_tracks_clients() {
    let server = setup_test_server().await;

    let client = connect(&server).await;
    timeout(STEP, client.get_number_of_quotes()).await.unwrap().unwrap();
    assert_eq!(server.connections.get(), 1);

    client.close();

    let connections = server.connections.clone();
    wait_for(|| connections.get() == 0).await;
}

#[tokio::test]
async fn cancel_frame_stops_emissions() {
    let interval = Duration::from_millis(100);
    let server = setup_server_with(interval, TransportConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();
    let id = RequestId::generate();

    send_raw(
        &mut ws,
        json!({ "type": "request_response", "stream_id": 1, "route": "subscribe", "data": { "request_id": id } }),
    )
    .await;
    assert_eq!(recv_raw(&mut ws, STEP).await.unwrap()["type"], "next");
    assert_eq!(recv_raw(&mut ws, STEP).await.unwrap()["type"], "complete");

    send_raw(
        &mut ws,
        json!({ "type": "request_stream", "stream_id": 2, "route": "get-all-quotes", "data": { "request_id": id } }),
    )
    .await;
    let first = recv_raw(&mut ws, STEP).await.unwrap();
    assert_eq!(first["type"], "next");
    assert_eq!(first["stream_id"], 2);

    send_raw(&mut ws, json!({ "type": "cancel", "stream_id": 2 })).await;

    // The remaining quotes would all have arrived by now
    assert!(recv_raw(&mut ws, interval * 8).await.is_none());

    send_raw(
        &mut ws,
        json!({ "type": "request_response", "stream_id": 3, "route": "get-number-of-quotes", "data": null }),
    )
    .await;
    let reply = recv_raw(&mut ws, STEP).await.unwrap();
    assert_eq!(reply["stream_id"], 3);
    assert_eq!(reply["data"], 6);
}

#[tokio::test]
async fn flooded_channel_input_is_rejected() {
    let transport = TransportConfig {
        input_buffer: 4,
        ..TransportConfig::default()
    };
    let server = setup_server_with(Duration::from_millis(200), transport).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url.as_str()).await.unwrap();

    send_raw(
        &mut ws,
        json!({ "type": "request_channel", "stream_id": 3, "route": "get-random-quotes" }),
    )
    .await;
    for _ in 0..64 {
        send_raw(&mut ws, json!({ "type": "next", "stream_id": 3, "data": 1 })).await;
    }

    let error = timeout(STEP, async {
        loop {
            let frame = recv_raw(&mut ws, STEP).await.expect("no error frame");
            if frame["type"] == "error" {
                return frame;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(error["stream_id"], 3);
    assert_eq!(error["code"], "INVALID_FRAME");
    assert_eq!(error["message"], "channel input overflow");

    // The channel is gone: nothing more arrives for it
    assert!(recv_raw(&mut ws, Duration::from_millis(500)).await.is_none());
}
