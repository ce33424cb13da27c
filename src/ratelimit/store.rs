//! Shared counter stores for the fixed-window limiter.
//!
//! The store is the only place fixed-window counts live; every gateway
//! instance increments the same record for a `(key, window)` pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::window::CounterKey;
use crate::error::Result;

/// Increment a counter and give it a TTL in one server-side step.
///
/// The TTL is only set while the record has none, so the first writer in a
/// window sets it and a crash can never leave a counter without one.
const INCR_WITH_EXPIRY: &str = r"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('TTL', KEYS[1]) == -1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return count
";

/// A store holding fixed-window counter records.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `n` to the record and make sure it expires after `ttl`.
    /// Returns the post-increment count.
    async fn incr_with_expiry(&self, key: &CounterKey, n: u64, ttl: Duration) -> Result<u64>;

    /// Read a record without modifying it.
    async fn get(&self, key: &CounterKey) -> Result<Option<u64>>;
}

/// Redis-backed counter store with automatic reconnection.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// Supports both redis:// and rediss:// (TLS) URLs.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis counter store");
        Ok(Self {
            conn,
            script: redis::Script::new(INCR_WITH_EXPIRY),
        })
    }

    /// Check the connection with PING.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_expiry(&self, key: &CounterKey, n: u64, ttl: Duration) -> Result<u64> {
        let store_key = key.to_store_key();
        let mut conn = self.conn.clone();

        let count: u64 = self
            .script
            .key(&store_key)
            .arg(n)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %store_key, count = count, "Incremented counter record");
        Ok(count)
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(key.to_store_key()).await?;
        Ok(count)
    }
}

/// Increments between full sweeps of expired in-memory records.
const PURGE_INTERVAL: u64 = 1024;

/// A counter record held in memory.
#[derive(Debug, Clone, Copy)]
struct MemoryRecord {
    count: u64,
    expires_at: Instant,
}

/// Single-process counter store with the same TTL semantics as Redis.
///
/// Useful for local runs and tests; it does not coordinate across processes.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    records: Mutex<HashMap<String, MemoryRecord>>,
    /// Increments since the last full purge
    increments: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        records.retain(|_, record| record.expires_at > now);
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn stored_records(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_expiry(&self, key: &CounterKey, n: u64, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut records = self.records.lock();

        if self.increments.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            records.retain(|_, record| record.expires_at > now);
        }

        let fresh = MemoryRecord {
            count: 0,
            expires_at: now + ttl,
        };
        let record = records.entry(key.to_store_key()).or_insert(fresh);
        // An expired record is replaced on access, like Redis does
        if record.expires_at <= now {
            *record = fresh;
        }
        record.count += n;
        Ok(record.count)
    }

    async fn get(&self, key: &CounterKey) -> Result<Option<u64>> {
        let now = Instant::now();
        let records = self.records.lock();
        Ok(records
            .get(&key.to_store_key())
            .filter(|record| record.expires_at > now)
            .map(|record| record.count))
    }
}
