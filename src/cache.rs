//! In-memory get-or-compute cache guarded by registry authorization.
//!
//! Every access re-checks the caller's authorization for the entry's scope
//! before anything is returned, including cache hits, so a revoked
//! credential never serves data cached while it was still valid.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use layerlens_oci::{Authorizer, LockGuard, Locker};
use tracing::{debug, warn};

use crate::error::{Error, Result};

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    expires: Instant,
}

pub struct ObjectCache {
    authorizer: Arc<dyn Authorizer>,
    locker: Arc<dyn Locker>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ObjectCache {
    pub fn new(authorizer: Arc<dyn Authorizer>, locker: Arc<dyn Locker>) -> Self {
        Self {
            authorizer,
            locker,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the value cached under `key`, computing and caching it for
    /// `ttl` on a miss. Fails with [`Error::Unauthorized`] when `scope` is
    /// not authorized, whether or not a cached value exists.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        scope: &str,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.authorizer.authorize(scope).await {
            warn!(scope, key, "access denied");
            return Err(Error::Unauthorized(scope.to_string()));
        }

        if let Some(hit) = self.peek::<T>(key) {
            debug!(key, "cache hit");
            return Ok(hit);
        }

        let value = compute().await?;
        self.insert(key, value.clone(), ttl);
        Ok(value)
    }

    /// Cached value without an authorization check. For use inside a
    /// `compute` closure that already passed the gate.
    pub fn peek<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let mut entries = self.entries();
        let entry = entries.get(key)?;
        if entry.expires <= Instant::now() {
            entries.remove(key);
            return None;
        }
        match entry.value.downcast_ref::<T>() {
            Some(v) => Some(v.clone()),
            None => {
                warn!(key, "cached value has a different type; ignoring");
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`. Expired entries are swept on
    /// every insert, so keys that are never read again do not accumulate.
    pub fn insert<T: Send + Sync + 'static>(&self, key: &str, value: T, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.expires > now);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired cache entries");
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Arc::new(value),
                expires: now + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until the named lock is ours or `timeout` elapses. The lock is
    /// considered stale after `hold` unless extended through the guard.
    pub async fn take_lock(&self, key: &str, hold: Duration, timeout: Duration) -> Result<LockGuard> {
        Ok(self.locker.take_lock(key, hold, timeout).await?)
    }
}
