//! TTL'd key/value store for job records. Every write refreshes the TTL;
//! expired entries are evicted lazily on read plus by a coarse sweeper.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Abstract single-key-atomic store with per-entry TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Stores `value` under `key`, replacing any prior value and
    /// refreshing the TTL.
    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    async fn len(&self) -> usize;
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-process implementation backed by a concurrent map.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evicts every expired entry; returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    /// Spawns a background task that sweeps on a fixed interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let evicted = store.sweep();
                if evicted > 0 {
                    info!(
                        target: "store::kv",
                        evicted,
                        remaining = store.entries.len(),
                        "Swept expired records"
                    );
                }
            }
        })
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        // Expired: evict and report absent.
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        debug!(target: "store::kv", key = %key, "Evicted expired record on read");
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.expires_at > now && entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn len(&self) -> usize {
        self.entries.len()
    }
}
