//! Keyed registry of deferred futures.
//!
//! At most one live future per key — this is the dedup guarantee. Settled
//! entries linger for `cleanup_delay` (so late observers can still inspect
//! them) and are then reclaimed, either by the per-key cleanup scheduled at
//! settlement or by the background sweeper that bounds memory when nothing
//! else runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deferred::{Deferred, DeferredState};
use crate::error::{Error, Result};

/// Tuning knobs for a registry instance.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a settled future lingers before cleanup removes it.
    pub cleanup_delay: Duration,
    /// Maximum number of outstanding futures.
    pub max_pending: usize,
    /// Schedule per-key cleanup on settlement.
    pub auto_cleanup: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_delay: Duration::from_secs(60),
            max_pending: 1000,
            auto_cleanup: true,
        }
    }
}

/// Counts by state plus the oldest/newest keys. Debugging surface only.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub resolved: usize,
    pub rejected: usize,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

pub struct FutureRegistry<T> {
    futures: Mutex<HashMap<String, Deferred<T>>>,
    scheduled: Mutex<HashMap<String, JoinHandle<()>>>,
    config: RegistryConfig,
}

impl<T: Clone + Send + 'static> FutureRegistry<T> {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            futures: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Protocol("key must be a non-empty string".into()));
        }
        Ok(())
    }

    /// Register a new future under `key`, arming a timeout if given.
    ///
    /// If a future already exists for the key it is returned as-is (with a
    /// warning): concurrent identical calls must share one future, never
    /// race two. Capacity overflow is an error; one settled entry may be
    /// reclaimed early to make room.
    pub fn create(self: &Arc<Self>, key: &str, timeout: Option<Duration>) -> Result<Deferred<T>> {
        Self::validate_key(key)?;
        let mut futures = self.futures.lock().expect("registry lock poisoned");

        if let Some(existing) = futures.get(key) {
            warn!(key, "future already registered, returning in-flight instance");
            return Ok(existing.clone());
        }

        self.insert_locked(&mut futures, key, timeout)
    }

    /// Insert a fresh future under an absent key. Caller holds the futures
    /// lock and has already ruled out an existing entry.
    fn insert_locked(
        &self,
        futures: &mut HashMap<String, Deferred<T>>,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Deferred<T>> {
        if futures.len() >= self.config.max_pending {
            let settled = futures
                .iter()
                .find(|(_, d)| d.is_settled())
                .map(|(k, _)| k.clone());
            match settled {
                Some(stale) => {
                    futures.remove(&stale);
                    if let Some(task) = self
                        .scheduled
                        .lock()
                        .expect("cleanup lock poisoned")
                        .remove(&stale)
                    {
                        task.abort();
                    }
                    debug!(key = %stale, "reclaimed settled future to stay under capacity");
                }
                None => return Err(Error::Capacity(self.config.max_pending)),
            }
        }

        let deferred = Deferred::new();
        if let Some(duration) = timeout {
            deferred.start_timeout(duration);
        }
        futures.insert(key.to_string(), deferred.clone());
        debug!(key, ?timeout, total = futures.len(), "future created");
        Ok(deferred)
    }

    pub fn get(&self, key: &str) -> Option<Deferred<T>> {
        self.futures
            .lock()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    /// Lookup-or-create. Returns the future plus whether it was freshly
    /// created, atomically — callers use the flag to decide whether to
    /// dispatch work or just join the in-flight call.
    ///
    /// A settled entry still awaiting cleanup does not satisfy the lookup:
    /// it is replaced with a fresh pending future.
    pub fn get_or_create(
        self: &Arc<Self>,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<(Deferred<T>, bool)> {
        Self::validate_key(key)?;
        let mut futures = self.futures.lock().expect("registry lock poisoned");

        if let Some(existing) = futures.get(key) {
            if existing.is_pending() {
                return Ok((existing.clone(), false));
            }
            // Settled and lingering; replace with a fresh pending future.
            futures.remove(key);
            if let Some(task) = self
                .scheduled
                .lock()
                .expect("cleanup lock poisoned")
                .remove(key)
            {
                task.abort();
            }
        }

        let deferred = self.insert_locked(&mut futures, key, timeout)?;
        Ok((deferred, true))
    }

    pub fn has(&self, key: &str) -> bool {
        self.futures
            .lock()
            .expect("registry lock poisoned")
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.futures
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.futures.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the future registered under `key`.
    ///
    /// Unknown keys are a programmer error and fail loudly. A future that
    /// already settled is left untouched (Ok(false), with a warning) —
    /// concurrent replies for a settled key must not corrupt state.
    pub fn resolve(self: &Arc<Self>, key: &str, value: T) -> Result<bool> {
        let deferred = self
            .get(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
        if !deferred.resolve(value) {
            warn!(key, "future already settled, ignoring resolve");
            return Ok(false);
        }
        debug!(key, "future resolved");
        if self.config.auto_cleanup {
            self.schedule_cleanup(key);
        }
        Ok(true)
    }

    /// Reject the future registered under `key`. Same contract as `resolve`.
    pub fn reject(self: &Arc<Self>, key: &str, error: Error) -> Result<bool> {
        let deferred = self
            .get(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
        let message = error.to_string();
        if !deferred.reject(error) {
            warn!(key, "future already settled, ignoring reject");
            return Ok(false);
        }
        debug!(key, error = %message, "future rejected");
        if self.config.auto_cleanup {
            self.schedule_cleanup(key);
        }
        Ok(true)
    }

    /// Evict a future and cancel any cleanup scheduled for it.
    pub fn remove(&self, key: &str) -> bool {
        let existed = self
            .futures
            .lock()
            .expect("registry lock poisoned")
            .remove(key)
            .is_some();
        if let Some(task) = self
            .scheduled
            .lock()
            .expect("cleanup lock poisoned")
            .remove(key)
        {
            task.abort();
        }
        if existed {
            debug!(key, "future removed");
        }
        existed
    }

    /// Drop every future. Pending ones are left unsettled — callers that
    /// need waiters released must reject them first.
    pub fn clear(&self) -> usize {
        let count = {
            let mut futures = self.futures.lock().expect("registry lock poisoned");
            let count = futures.len();
            futures.clear();
            count
        };
        let mut scheduled = self.scheduled.lock().expect("cleanup lock poisoned");
        for (_, task) in scheduled.drain() {
            task.abort();
        }
        info!(cleared = count, "registry cleared");
        count
    }

    pub fn stats(&self) -> RegistryStats {
        let futures = self.futures.lock().expect("registry lock poisoned");
        let mut stats = RegistryStats {
            total: futures.len(),
            pending: 0,
            resolved: 0,
            rejected: 0,
            oldest: None,
            newest: None,
        };
        let mut oldest = None;
        let mut newest = None;
        for (key, deferred) in futures.iter() {
            match deferred.state() {
                DeferredState::Pending => stats.pending += 1,
                DeferredState::Resolved => stats.resolved += 1,
                DeferredState::Rejected => stats.rejected += 1,
            }
            let created = deferred.created_at();
            if oldest.is_none_or(|at| created < at) {
                oldest = Some(created);
                stats.oldest = Some(key.clone());
            }
            if newest.is_none_or(|at| created > at) {
                newest = Some(created);
                stats.newest = Some(key.clone());
            }
        }
        stats
    }

    /// Wait for all listed futures, preserving input order. Fails fast on an
    /// unknown key; an optional overall timeout bounds the whole wait.
    pub async fn wait_for_all(&self, keys: &[&str], timeout: Option<Duration>) -> Result<Vec<T>> {
        let mut deferreds = Vec::with_capacity(keys.len());
        for key in keys {
            deferreds.push(
                self.get(key)
                    .ok_or_else(|| Error::UnknownKey(key.to_string()))?,
            );
        }
        let wait_all = async {
            let mut values = Vec::with_capacity(deferreds.len());
            for deferred in &deferreds {
                values.push(deferred.wait().await?);
            }
            Ok(values)
        };
        match timeout {
            Some(duration) => tokio::time::timeout(duration, wait_all)
                .await
                .map_err(|_| Error::Timeout(duration.as_millis() as u64))?,
            None => wait_all.await,
        }
    }

    /// Wait for whichever listed future settles first.
    pub async fn wait_for_any(&self, keys: &[&str], timeout: Option<Duration>) -> Result<T> {
        if keys.is_empty() {
            return Err(Error::Protocol("keys must be a non-empty list".into()));
        }
        let mut set = tokio::task::JoinSet::new();
        for key in keys {
            let deferred = self
                .get(key)
                .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
            set.spawn(async move { deferred.wait().await });
        }
        let first = async {
            match set.join_next().await {
                Some(Ok(outcome)) => outcome,
                Some(Err(e)) => Err(Error::Other(format!("wait task failed: {e}"))),
                None => Err(Error::Other("no futures to wait on".into())),
            }
        };
        match timeout {
            Some(duration) => tokio::time::timeout(duration, first)
                .await
                .map_err(|_| Error::Timeout(duration.as_millis() as u64))?,
            None => first.await,
        }
    }

    fn schedule_cleanup(self: &Arc<Self>, key: &str) {
        let registry = Arc::clone(self);
        let owned = key.to_string();
        let delay = self.config.cleanup_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.remove_if_settled(&owned);
        });
        if let Some(previous) = self
            .scheduled
            .lock()
            .expect("cleanup lock poisoned")
            .insert(key.to_string(), task)
        {
            previous.abort();
        }
    }

    fn remove_if_settled(&self, key: &str) {
        let removed = {
            let mut futures = self.futures.lock().expect("registry lock poisoned");
            match futures.get(key) {
                Some(deferred) if deferred.is_settled() => {
                    futures.remove(key);
                    true
                }
                _ => false,
            }
        };
        self.scheduled
            .lock()
            .expect("cleanup lock poisoned")
            .remove(key);
        if removed {
            debug!(key, "settled future cleaned up");
        }
    }

    /// Remove every entry settled longer ago than `cleanup_delay`. Pending
    /// futures are never touched.
    pub fn sweep_settled(&self) -> usize {
        let stale: Vec<String> = {
            let futures = self.futures.lock().expect("registry lock poisoned");
            futures
                .iter()
                .filter(|(_, d)| {
                    d.settled_for()
                        .is_some_and(|age| age > self.config.cleanup_delay)
                })
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &stale {
            self.remove(key);
        }
        stale.len()
    }

    /// Spawn the background sweeper: a recurring pass that reclaims settled
    /// entries, bounding memory even when per-key cleanup never ran.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.cleanup_delay);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("registry sweeper shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        let removed = registry.sweep_settled();
                        if removed > 0 {
                            debug!(removed, "sweeper reclaimed settled futures");
                        }
                    }
                }
            }
        })
    }
}
