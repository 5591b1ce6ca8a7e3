//! Request dispatcher: dedup, correlation, timeouts, telemetry.
//!
//! The dispatcher is the engine façade. It normalizes every call into a
//! dedup key, shares one in-flight future among identical concurrent calls,
//! hands the work to the background executor (or the in-process fallback),
//! correlates the asynchronous reply back by message id, and settles the
//! registered future exactly once.
//!
//! One dispatcher instance is created at application start and passed by
//! reference to consumers; tests build isolated instances with mock
//! transports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::event::{TelemetryBus, TelemetryEvent, TelemetryKind, TelemetrySubscription};
use crate::executor::{ExecutorCore, spawn_worker};
use crate::key::RequestKey;
use crate::model::{PendingInfo, RequestOptions};
use crate::protocol::{Command, Reply, Request};
use crate::registry::{FutureRegistry, RegistryStats};
use crate::transport::Transport;

/// How dispatched work reaches the executor.
enum Mode {
    /// Background worker task; requests cross a serialized message channel.
    Worker {
        tx: mpsc::UnboundedSender<Value>,
        worker: JoinHandle<()>,
        pump: JoinHandle<()>,
    },
    /// In-process fallback for environments without a worker task. Same
    /// executor logic, no serialization boundary: error values reach
    /// callers unchanged.
    Inline { core: Arc<ExecutorCore> },
}

struct Correlation {
    key: String,
}

type Correlations = Arc<Mutex<HashMap<Uuid, Correlation>>>;

pub struct Dispatcher {
    registry: Arc<FutureRegistry<Value>>,
    correlations: Correlations,
    telemetry: Arc<TelemetryBus>,
    config: Config,
    mode: Mode,
    shutdown: Arc<Notify>,
    sweeper: JoinHandle<()>,
}

impl Dispatcher {
    /// Create a dispatcher backed by a background worker task.
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        Self::build(transport, config, true)
    }

    /// Create a dispatcher that executes calls in-process, without a worker
    /// task. This is the documented fallback, not a silent behavior change:
    /// functionally identical, minus thread isolation.
    pub fn new_inline(transport: Arc<dyn Transport>, config: Config) -> Self {
        Self::build(transport, config, false)
    }

    fn build(transport: Arc<dyn Transport>, config: Config, worker: bool) -> Self {
        let registry = Arc::new(FutureRegistry::new(config.registry.clone()));
        let telemetry = Arc::new(TelemetryBus::new());
        let correlations: Correlations = Arc::new(Mutex::new(HashMap::new()));
        let core = Arc::new(ExecutorCore::new(transport, config.cache.clone()));
        let shutdown = Arc::new(Notify::new());
        let sweeper = registry.spawn_sweeper(Arc::clone(&shutdown));

        let mode = if worker {
            let (reply_tx, reply_rx) = mpsc::unbounded_channel();
            let handle = spawn_worker(core, reply_tx);
            let pump = Self::spawn_reply_pump(
                reply_rx,
                Arc::clone(&registry),
                Arc::clone(&correlations),
                Arc::clone(&shutdown),
            );
            Mode::Worker {
                tx: handle.tx,
                worker: handle.join,
                pump,
            }
        } else {
            info!("no worker execution context, executor runs in-process");
            Mode::Inline { core }
        };

        Self {
            registry,
            correlations,
            telemetry,
            config,
            mode,
            shutdown,
            sweeper,
        }
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Fetch an endpoint, deduplicating against any identical in-flight
    /// call, and wait for the result.
    pub async fn fetch(&self, endpoint: &str, options: RequestOptions) -> Result<Value> {
        self.fetch_deferred(endpoint, options)?.wait().await
    }

    /// Like [`fetch`](Self::fetch), but hands back the shared future so the
    /// caller controls when (and whether) to wait.
    pub fn fetch_deferred(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Deferred<Value>> {
        let key = RequestKey::normalize(endpoint, &options);
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);
        let command = Command::Fetch {
            endpoint: endpoint.to_string(),
            options,
        };
        self.dispatch(key, endpoint.to_string(), command, timeout)
    }

    /// Load several text resources; the key ignores input order, so two
    /// batches over the same URLs share one in-flight call.
    pub async fn load_batch(&self, urls: Vec<String>) -> Result<Vec<String>> {
        let key = RequestKey::for_batch(&urls);
        let endpoint = urls.join(",");
        let deferred = self.dispatch(
            key,
            endpoint,
            Command::LoadBatch(urls),
            self.config.default_timeout,
        )?;
        let value = deferred.wait().await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("batch reply was not a string array: {e}")))
    }

    /// Load a single text resource.
    pub async fn load_one(&self, url: &str) -> Result<String> {
        let key = RequestKey::for_single(url);
        let deferred = self.dispatch(
            key,
            url.to_string(),
            Command::LoadOne(url.to_string()),
            self.config.default_timeout,
        )?;
        let value = deferred.wait().await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("load reply was not a string: {e}")))
    }

    /// Abort the in-flight call for the matching key.
    ///
    /// The local future is rejected and removed immediately; waiters see
    /// `Error::Aborted` right away and a subsequent call under the same key
    /// starts fresh. The executor is asked to cancel the remote operation,
    /// but that is best-effort only — a call that already completed simply
    /// has its reply dropped as an orphan.
    pub fn abort(&self, endpoint: &str, options: Option<RequestOptions>) {
        let options = options.unwrap_or_default();
        let key = RequestKey::normalize(endpoint, &options);
        if !self.registry.has(key.as_str()) {
            debug!(key = %key, "abort for unknown key, nothing to do");
            return;
        }

        // Drop correlations first: a reply arriving mid-abort must not be
        // able to settle anything under this key.
        self.correlations
            .lock()
            .expect("correlation lock poisoned")
            .retain(|_, correlation| correlation.key != key.as_str());
        match self.registry.reject(key.as_str(), Error::Aborted) {
            Ok(_) => {}
            Err(Error::UnknownKey(_)) => {}
            Err(e) => warn!(key = %key, error = %e, "abort failed to reject future"),
        }
        self.registry.remove(key.as_str());
        info!(key = %key, "request aborted locally");

        let request = Request {
            id: Uuid::new_v4(),
            command: Command::Abort {
                endpoint: endpoint.to_string(),
                options,
            },
        };
        self.forward_abort(request);
    }

    /// Is there an in-flight call for this endpoint/options pair?
    pub fn is_already_running(&self, endpoint: &str, options: Option<&RequestOptions>) -> bool {
        let default = RequestOptions::default();
        let key = RequestKey::normalize(endpoint, options.unwrap_or(&default));
        self.registry.has(key.as_str())
    }

    /// Register a telemetry observer. Subscriber panics are isolated.
    pub fn subscribe_telemetry<F>(&self, f: F) -> TelemetrySubscription
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        self.telemetry.subscribe(f)
    }

    /// Snapshot of outstanding request keys.
    pub fn pending_info(&self) -> PendingInfo {
        let keys = self.registry.keys();
        PendingInfo {
            count: keys.len(),
            keys,
        }
    }

    /// Registry counters, for debugging and operator surfaces.
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Shut the engine down: every outstanding future is rejected with
    /// `Error::Aborted`, then the worker, reply pump and sweeper stop. The
    /// dispatcher must not be used afterwards.
    pub fn terminate(&self) {
        for key in self.registry.keys() {
            let _ = self.registry.reject(&key, Error::Aborted);
        }
        let cleared = self.registry.clear();
        self.correlations
            .lock()
            .expect("correlation lock poisoned")
            .clear();
        self.shutdown.notify_waiters();
        if let Mode::Worker { worker, pump, .. } = &self.mode {
            worker.abort();
            pump.abort();
        }
        self.sweeper.abort();
        info!(cleared, "dispatcher terminated");
    }

    // -----------------------------------------------------------------------
    // Dispatch internals
    // -----------------------------------------------------------------------

    /// Core dispatch: join the in-flight future for `key` or create one,
    /// send the command, and arrange settlement plus telemetry.
    fn dispatch(
        &self,
        key: RequestKey,
        endpoint: String,
        command: Command,
        timeout: Duration,
    ) -> Result<Deferred<Value>> {
        let (deferred, created) = self.registry.get_or_create(key.as_str(), Some(timeout))?;
        if !created {
            debug!(key = %key, "joining in-flight request");
            return Ok(deferred);
        }

        let id = Uuid::new_v4();
        self.correlations
            .lock()
            .expect("correlation lock poisoned")
            .insert(
                id,
                Correlation {
                    key: key.to_string(),
                },
            );
        self.telemetry.emit(TelemetryKind::Start {
            key: key.to_string(),
            endpoint: endpoint.clone(),
        });
        self.spawn_watcher(id, key.to_string(), endpoint, deferred.clone());

        let request = Request { id, command };
        match &self.mode {
            Mode::Worker { tx, .. } => {
                let message = serde_json::to_value(&request)
                    .map_err(|e| Error::Protocol(format!("failed to serialize request: {e}")))?;
                if tx.send(message).is_err() {
                    // Worker is gone; fail the future rather than hang the caller.
                    let _ = self.registry.reject(
                        key.as_str(),
                        Error::Other("executor worker is not running".into()),
                    );
                }
            }
            Mode::Inline { core } => {
                let core = Arc::clone(core);
                let registry = Arc::clone(&self.registry);
                let correlations = Arc::clone(&self.correlations);
                tokio::spawn(async move {
                    let reply = core.handle(request).await;
                    Self::settle(&registry, &correlations, reply);
                });
            }
        }
        Ok(deferred)
    }

    /// One watcher per dispatched request: emits the terminal telemetry pair
    /// on every path (reply, timeout, abort) and retires the correlation.
    fn spawn_watcher(&self, id: Uuid, key: String, endpoint: String, deferred: Deferred<Value>) {
        let telemetry = Arc::clone(&self.telemetry);
        let correlations = Arc::clone(&self.correlations);
        tokio::spawn(async move {
            let started = deferred.created_at();
            let result = deferred.wait().await;
            correlations
                .lock()
                .expect("correlation lock poisoned")
                .remove(&id);
            let duration_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(_) => telemetry.emit(TelemetryKind::Success {
                    key: key.clone(),
                    endpoint: endpoint.clone(),
                    duration_ms,
                }),
                Err(error) => telemetry.emit(TelemetryKind::Error {
                    key: key.clone(),
                    endpoint: endpoint.clone(),
                    duration_ms,
                    message: error.to_string(),
                }),
            }
            telemetry.emit(TelemetryKind::Complete { key, endpoint });
        });
    }

    fn spawn_reply_pump(
        mut rx: mpsc::UnboundedReceiver<Value>,
        registry: Arc<FutureRegistry<Value>>,
        correlations: Correlations,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("reply pump shutting down");
                        return;
                    }
                    reply = rx.recv() => {
                        match reply {
                            Some(value) => Self::settle_from_value(&registry, &correlations, value),
                            None => return,
                        }
                    }
                }
            }
        })
    }

    fn settle_from_value(
        registry: &Arc<FutureRegistry<Value>>,
        correlations: &Correlations,
        value: Value,
    ) {
        match serde_json::from_value::<Reply>(value) {
            Ok(reply) => Self::settle(registry, correlations, reply),
            Err(e) => warn!(error = %e, "undecodable reply from executor, dropping"),
        }
    }

    /// Correlate a reply back to its key and settle the registered future.
    fn settle(
        registry: &Arc<FutureRegistry<Value>>,
        correlations: &Correlations,
        reply: Reply,
    ) {
        let correlation = correlations
            .lock()
            .expect("correlation lock poisoned")
            .remove(&reply.id);
        let Some(correlation) = correlation else {
            debug!(id = %reply.id, "orphaned reply (aborted or already settled), dropping");
            return;
        };
        let outcome = match reply.error {
            Some(envelope) => registry.reject(&correlation.key, envelope.into_error()),
            None => registry.resolve(&correlation.key, reply.data.unwrap_or(Value::Null)),
        };
        match outcome {
            Ok(_) => {}
            Err(Error::UnknownKey(_)) => {
                debug!(key = %correlation.key, "reply for evicted future, dropping");
            }
            Err(e) => warn!(key = %correlation.key, error = %e, "failed to settle future"),
        }
    }

    fn forward_abort(&self, request: Request) {
        match &self.mode {
            Mode::Worker { tx, .. } => {
                if let Ok(message) = serde_json::to_value(&request) {
                    let _ = tx.send(message);
                }
            }
            Mode::Inline { core } => {
                let core = Arc::clone(core);
                tokio::spawn(async move {
                    // Reply is informational; there is no future waiting on it.
                    let _ = core.handle(request).await;
                });
            }
        }
    }
}
