//! Tests for the executor core: caching, cancellation, protocol safety.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fetchq::cache::CacheConfig;
use fetchq::error::{Error, Result};
use fetchq::executor::ExecutorCore;
use fetchq::model::{HttpMethod, RequestOptions};
use fetchq::protocol::{Command, Reply, ReplyKind, Request};
use fetchq::transport::{Transport, TransportFuture};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Counting transport double. Each call sleeps `delay`, then returns the
/// canned response or the configured failure.
struct MockTransport {
    calls: AtomicUsize,
    text_calls: AtomicUsize,
    response: Value,
    delay: Duration,
    fail_status: Option<u16>,
}

impl MockTransport {
    fn json(response: Value) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
            response,
            delay: Duration::ZERO,
            fail_status: None,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn text_call_count(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    async fn respond(delay: Duration, outcome: Result<Value>) -> Result<Value> {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

impl Transport for MockTransport {
    fn execute(
        &self,
        _endpoint: String,
        _options: RequestOptions,
        _cancel: CancellationToken,
    ) -> TransportFuture<'_, Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = match self.fail_status {
            Some(status) => Err(Error::Network {
                status: Some(status),
                message: format!("HTTP error, status {status}"),
            }),
            None => Ok(self.response.clone()),
        };
        Box::pin(Self::respond(self.delay, outcome))
    }

    fn fetch_text(&self, url: String, _cancel: CancellationToken) -> TransportFuture<'_, String> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(format!("text:{url}"))
        })
    }
}

fn core_with(transport: MockTransport) -> (Arc<ExecutorCore>, Arc<MockTransport>) {
    let transport = Arc::new(transport);
    let core = Arc::new(ExecutorCore::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        CacheConfig::default(),
    ));
    (core, transport)
}

fn fetch_request(endpoint: &str, options: RequestOptions) -> Request {
    Request {
        id: Uuid::new_v4(),
        command: Command::Fetch {
            endpoint: endpoint.to_string(),
            options,
        },
    }
}

// ---------------------------------------------------------------------------
// Fetch and cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_returns_transport_data() {
    let (core, _) = core_with(MockTransport::json(json!({"id": 1})));

    let reply = core.handle(fetch_request("/users/1", RequestOptions::new())).await;
    assert_eq!(reply.kind, ReplyKind::FetchResponse);
    assert_eq!(reply.data, Some(json!({"id": 1})));
}

#[tokio::test]
async fn second_get_is_served_from_cache() {
    let (core, transport) = core_with(MockTransport::json(json!({"id": 1})));

    let first = core.handle(fetch_request("/users/1", RequestOptions::new())).await;
    let second = core.handle(fetch_request("/users/1", RequestOptions::new())).await;

    assert_eq!(first.data, second.data);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn non_idempotent_calls_bypass_the_cache() {
    let (core, transport) = core_with(MockTransport::json(json!({"ok": true})));
    let options = RequestOptions::new().method(HttpMethod::Post).body("{}");

    core.handle(fetch_request("/users", options.clone())).await;
    core.handle(fetch_request("/users", options)).await;

    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn transport_failure_becomes_typed_envelope() {
    let (core, _) = core_with(MockTransport::json(json!(null)).failing(502));

    let reply = core.handle(fetch_request("/down", RequestOptions::new())).await;
    assert_eq!(reply.kind, ReplyKind::FetchError);
    let envelope = reply.error.expect("error envelope");
    assert_eq!(envelope.kind, "network");
    assert_eq!(envelope.cause.as_deref(), Some("status 502"));
}

// ---------------------------------------------------------------------------
// Loads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn load_one_returns_text() {
    let (core, _) = core_with(MockTransport::json(json!(null)));

    let reply = core
        .handle(Request {
            id: Uuid::new_v4(),
            command: Command::LoadOne("a.png".to_string()),
        })
        .await;
    assert_eq!(reply.data, Some(json!("text:a.png")));
}

#[tokio::test]
async fn load_batch_preserves_input_order() {
    let (core, transport) = core_with(MockTransport::json(json!(null)));

    let reply = core
        .handle(Request {
            id: Uuid::new_v4(),
            command: Command::LoadBatch(vec!["b.png".to_string(), "a.png".to_string()]),
        })
        .await;
    assert_eq!(reply.data, Some(json!(["text:b.png", "text:a.png"])));
    assert_eq!(transport.text_call_count(), 2);
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_cancels_matching_inflight_fetch() {
    let (core, _) =
        core_with(MockTransport::json(json!({"id": 1})).delayed(Duration::from_millis(300)));

    let fetching = Arc::clone(&core);
    let fetch = tokio::spawn(async move {
        fetching
            .handle(fetch_request("/slow", RequestOptions::new()))
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let abort_reply = core
        .handle(Request {
            id: Uuid::new_v4(),
            command: Command::Abort {
                endpoint: "/slow".to_string(),
                options: RequestOptions::default(),
            },
        })
        .await;
    assert_eq!(abort_reply.kind, ReplyKind::AbortResponse);

    let fetch_reply = fetch.await.unwrap();
    assert_eq!(fetch_reply.kind, ReplyKind::FetchError);
    assert_eq!(fetch_reply.error.expect("envelope").kind, "abort");
}

#[tokio::test]
async fn abort_with_no_matching_inflight_is_harmless() {
    let (core, _) = core_with(MockTransport::json(json!(null)));

    let reply = core
        .handle(Request {
            id: Uuid::new_v4(),
            command: Command::Abort {
                endpoint: "/idle".to_string(),
                options: RequestOptions::default(),
            },
        })
        .await;
    assert_eq!(reply.kind, ReplyKind::AbortResponse);
    assert_eq!(reply.data, Some(json!("aborted 0 request(s)")));
}

// ---------------------------------------------------------------------------
// Protocol safety
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_message_yields_protocol_error_reply() {
    let (core, _) = core_with(MockTransport::json(json!(null)));

    let reply_value = core.handle_value(json!({"nonsense": true})).await;
    let reply: Reply = serde_json::from_value(reply_value).unwrap();
    assert_eq!(reply.kind, ReplyKind::Error);
    assert_eq!(reply.error.expect("envelope").kind, "protocol");
}

#[tokio::test]
async fn unknown_message_type_salvages_the_id() {
    let (core, _) = core_with(MockTransport::json(json!(null)));
    let id = Uuid::new_v4();

    let reply_value = core
        .handle_value(json!({"id": id, "type": "explode", "data": null}))
        .await;
    let reply: Reply = serde_json::from_value(reply_value).unwrap();
    assert_eq!(reply.id, id);
    assert_eq!(reply.kind, ReplyKind::Error);
}

#[tokio::test]
async fn well_formed_value_messages_round_trip() {
    let (core, _) = core_with(MockTransport::json(json!({"id": 7})));

    let request = fetch_request("/users/7", RequestOptions::new());
    let reply_value = core
        .handle_value(serde_json::to_value(&request).unwrap())
        .await;
    let reply: Reply = serde_json::from_value(reply_value).unwrap();
    assert_eq!(reply.id, request.id);
    assert_eq!(reply.data, Some(json!({"id": 7})));
}
