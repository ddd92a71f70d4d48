//! In-process TTL cache shared by the engine: archive handles, download sessions and
//! upload callback sessions live here under prefixed keys.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult};

/// Key prefixes used across the engine.
pub mod keys {
    pub const ARCHIVE: &str = "archive_";
    pub const DOWNLOAD: &str = "download_";
    pub const CALLBACK: &str = "callback_";
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Str(String),
    Json(JsonValue),
    Bytes(Vec<u8>),
}

#[derive(Clone)]
struct Entry {
    value: CacheValue,
    /// Optional expiry time
    expires_at: Option<Instant>,
}

#[derive(Clone, Default)]
pub struct Cache {
    map: Arc<parking_lot::RwLock<StdHashMap<String, Entry>>>,
}

impl Cache {
    pub fn new() -> Self { Self::default() }

    /// Set a key with optional TTL. A zero TTL is treated as no expiry.
    pub fn set(&self, key: impl Into<String>, value: CacheValue, ttl: Option<Duration>) {
        let expires_at = ttl.filter(|d| !d.is_zero()).map(|d| Instant::now() + d);
        self.map.write().insert(key.into(), Entry { value, expires_at });
    }

    pub fn set_json<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Option<Duration>) -> AppResult<()> {
        let v = serde_json::to_value(value).map_err(|e| AppError::cache("cache_encode", e.to_string()))?;
        self.set(key, CacheValue::Json(v), ttl);
        Ok(())
    }

    /// Get a key. If expired, removes it and returns None.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        {
            let r = self.map.read();
            match r.get(key) {
                None => return None,
                Some(ent) => match ent.expires_at {
                    Some(exp) if Instant::now() >= exp => {}
                    _ => return Some(ent.value.clone()),
                },
            }
        }
        // Re-check under the write lock; a concurrent set may have refreshed the key.
        let mut w = self.map.write();
        match w.get(key) {
            Some(ent) if ent.expires_at.map(|exp| Instant::now() < exp).unwrap_or(true) => Some(ent.value.clone()),
            Some(_) => { w.remove(key); None }
            None => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(CacheValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get(key) {
            Some(CacheValue::Json(v)) => serde_json::from_value(v).ok(),
            _ => None,
        }
    }

    /// Atomically read and remove a key; used for one-time handles.
    pub fn take(&self, key: &str) -> Option<CacheValue> {
        let ent = self.map.write().remove(key)?;
        match ent.expires_at {
            Some(exp) if Instant::now() >= exp => None,
            _ => Some(ent.value),
        }
    }

    pub fn delete(&self, key: &str) -> bool { self.map.write().remove(key).is_some() }
    pub fn len(&self) -> usize { self.map.read().len() }
    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

    /// Delete keys that start with the provided prefix. Returns number of removed keys.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|k, _| !k.starts_with(prefix));
        before - w.len()
    }

    /// Remove expired keys. Returns number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|_, v| v.expires_at.map(|exp| now < exp).unwrap_or(true));
        before - w.len()
    }

    /// Start the background sweeper on the current tokio runtime.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let removed = this.sweep();
                if removed > 0 { tracing::debug!(removed = removed, "cache_sweep"); }
            }
        })
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod cache_tests;
