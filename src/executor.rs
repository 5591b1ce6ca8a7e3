//! Background executor: performs the network calls the dispatcher hands off.
//!
//! In worker mode a long-lived task decodes serialized messages and handles
//! each one concurrently, so a slow call never blocks the queue. The same
//! [`ExecutorCore`] also serves as the in-process fallback: the dispatcher
//! calls [`ExecutorCore::handle`] directly, skipping the serialization
//! boundary, which means error values reach callers unchanged.
//!
//! All executor state — transport, result cache, in-flight cancellation
//! tokens — lives on the core instance, indexed by request id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, ResultCache};
use crate::error::{Error, Result};
use crate::key::RequestKey;
use crate::model::RequestOptions;
use crate::protocol::{Command, Reply, ReplyKind, Request};
use crate::transport::Transport;

struct Inflight {
    key: RequestKey,
    token: CancellationToken,
}

/// Executor-side state and operation handlers.
pub struct ExecutorCore {
    transport: Arc<dyn Transport>,
    cache: ResultCache,
    inflight: Mutex<HashMap<Uuid, Inflight>>,
}

impl ExecutorCore {
    pub fn new(transport: Arc<dyn Transport>, cache_config: CacheConfig) -> Self {
        Self {
            transport,
            cache: ResultCache::new(cache_config),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// The result cache, exposed for explicit invalidation.
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Handle one serialized message.
    ///
    /// Never panics on bad input: a message that does not decode produces a
    /// generic protocol-error reply instead of taking the executor down.
    pub async fn handle_value(&self, message: Value) -> Value {
        // Salvage the id even from a message that fails full decoding, so
        // the sender can at least correlate the protocol error.
        let id = message
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or(Uuid::nil());
        let reply = match serde_json::from_value::<Request>(message) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, "malformed executor message");
                Reply::failure(
                    id,
                    ReplyKind::Error,
                    &Error::Protocol(format!("invalid message: {e}")),
                )
            }
        };
        reply_to_value(&reply)
    }

    /// Typed entry point, shared by worker mode and the inline fallback.
    pub async fn handle(&self, request: Request) -> Reply {
        let Request { id, command } = request;
        let response_kind = command.response_kind();
        let error_kind = command.error_kind();
        let result = match command {
            Command::Fetch { endpoint, options } => self.fetch(id, &endpoint, options).await,
            Command::LoadBatch(urls) => self.load_batch(id, urls).await,
            Command::LoadOne(url) => self.load_one(id, url).await,
            Command::Abort { endpoint, options } => self.abort(&endpoint, &options),
        };
        match result {
            Ok(data) => Reply::success(id, response_kind, data),
            Err(error) => {
                debug!(%id, error = %error, "executor operation failed");
                Reply::failure(id, error_kind, &error)
            }
        }
    }

    async fn fetch(&self, id: Uuid, endpoint: &str, options: RequestOptions) -> Result<Value> {
        let key = RequestKey::normalize(endpoint, &options);
        let cacheable = options.method.is_idempotent();
        if cacheable {
            if let Some(hit) = self.cache.get(key.as_str()) {
                debug!(key = %key, "cache hit, skipping transport");
                return Ok(hit);
            }
        }

        let token = self.register_inflight(id, key.clone());
        let result = tokio::select! {
            _ = token.cancelled() => Err(Error::Aborted),
            result = self.transport.execute(endpoint.to_string(), options, token.clone()) => result,
        };
        self.unregister_inflight(id);

        let value = result?;
        if cacheable {
            self.cache.set(key.as_str(), value.clone(), None);
        }
        Ok(value)
    }

    async fn load_batch(&self, id: Uuid, urls: Vec<String>) -> Result<Value> {
        let key = RequestKey::for_batch(&urls);
        let token = self.register_inflight(id, key);

        let load_all = async {
            let mut set = tokio::task::JoinSet::new();
            for (index, url) in urls.iter().enumerate() {
                let transport = Arc::clone(&self.transport);
                let url = url.clone();
                let token = token.clone();
                set.spawn(async move { (index, transport.fetch_text(url, token).await) });
            }
            let mut texts: Vec<Option<String>> = vec![None; urls.len()];
            while let Some(joined) = set.join_next().await {
                let (index, result) =
                    joined.map_err(|e| Error::Other(format!("load task failed: {e}")))?;
                texts[index] = Some(result?);
            }
            Ok(Value::Array(
                texts.into_iter().flatten().map(Value::String).collect(),
            ))
        };
        let result = tokio::select! {
            _ = token.cancelled() => Err(Error::Aborted),
            result = load_all => result,
        };
        self.unregister_inflight(id);
        result
    }

    async fn load_one(&self, id: Uuid, url: String) -> Result<Value> {
        let key = RequestKey::for_single(&url);
        let token = self.register_inflight(id, key);
        let result = tokio::select! {
            _ = token.cancelled() => Err(Error::Aborted),
            result = self.transport.fetch_text(url, token.clone()) => result,
        };
        self.unregister_inflight(id);
        result.map(Value::String)
    }

    /// Cancel every in-flight request whose key matches the given call.
    /// Best-effort: a call that already completed is unaffected and its
    /// reply will be dropped by the dispatcher as an orphan.
    fn abort(&self, endpoint: &str, options: &RequestOptions) -> Result<Value> {
        let key = RequestKey::normalize(endpoint, options);
        let cancelled = {
            let inflight = self.inflight.lock().expect("inflight lock poisoned");
            let mut cancelled = 0;
            for entry in inflight.values() {
                if entry.key == key {
                    entry.token.cancel();
                    cancelled += 1;
                }
            }
            cancelled
        };
        debug!(key = %key, cancelled, "abort requested");
        Ok(Value::String(format!("aborted {cancelled} request(s)")))
    }

    fn register_inflight(&self, id: Uuid, key: RequestKey) -> CancellationToken {
        let token = CancellationToken::new();
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .insert(
                id,
                Inflight {
                    key,
                    token: token.clone(),
                },
            );
        token
    }

    fn unregister_inflight(&self, id: Uuid) {
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(&id);
    }
}

fn reply_to_value(reply: &Reply) -> Value {
    serde_json::to_value(reply).unwrap_or_else(|_| {
        serde_json::json!({
            "id": reply.id,
            "type": "error",
            "error": {
                "kind": "protocol",
                "message": "reply serialization failed",
            },
        })
    })
}

/// Handle to a running worker task.
pub struct WorkerHandle {
    /// Sending half of the message channel into the worker. Dropping it
    /// shuts the worker down once in-flight messages finish.
    pub tx: mpsc::UnboundedSender<Value>,
    pub join: JoinHandle<()>,
}

/// Spawn the background worker: decodes each incoming message and handles it
/// in its own task, sending replies on `reply_tx`.
pub fn spawn_worker(core: Arc<ExecutorCore>, reply_tx: mpsc::UnboundedSender<Value>) -> WorkerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let join = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let core = Arc::clone(&core);
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let reply = core.handle_value(message).await;
                if reply_tx.send(reply).is_err() {
                    debug!("reply channel closed, dropping executor reply");
                }
            });
        }
        debug!("executor worker shutting down");
    });
    WorkerHandle { tx, join }
}
