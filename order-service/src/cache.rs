//! Fast stock cache: per-product `{available, reserved}` counters mutated
//! by atomic server-side operations.
//!
//! The cache is the low-latency decision point for reservations; the
//! durable store remains the authoritative record. A missing key is a
//! cache miss (error), never an insufficient-stock verdict, so callers
//! fall back to the database.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;

const OP_TIMEOUT: Duration = Duration::from_secs(1);

/// Conditional decrement of `available` with matching increment of
/// `reserved`. Returns -1 on a missing key, 0 when stock is short, 1 on
/// success.
const RESERVE_SCRIPT: &str = r#"
local available = redis.call('HGET', KEYS[1], 'available')
if not available then
    return -1
end
local qty = tonumber(ARGV[1])
if tonumber(available) < qty then
    return 0
end
redis.call('HINCRBY', KEYS[1], 'available', -qty)
redis.call('HINCRBY', KEYS[1], 'reserved', qty)
return 1
"#;

/// Unconditional compensation of an earlier reserve.
const RELEASE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local qty = tonumber(ARGV[1])
redis.call('HINCRBY', KEYS[1], 'available', qty)
redis.call('HINCRBY', KEYS[1], 'reserved', -qty)
return 1
"#;

/// Conditional deduction of `reserved` (final commit).
const COMMIT_SCRIPT: &str = r#"
local reserved = redis.call('HGET', KEYS[1], 'reserved')
if not reserved then
    return -1
end
local qty = tonumber(ARGV[1])
if tonumber(reserved) < qty then
    return 0
end
redis.call('HINCRBY', KEYS[1], 'reserved', -qty)
return 1
"#;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cached inventory for product {0}")]
    Missing(i64),

    #[error("cache operation timed out")]
    Timeout,

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

#[async_trait]
pub trait StockCache: Send + Sync {
    /// Returns `Ok(true)` when the reservation was taken, `Ok(false)` when
    /// stock is insufficient.
    async fn reserve(&self, product_id: i64, quantity: i32) -> Result<bool, CacheError>;

    async fn release(&self, product_id: i64, quantity: i32) -> Result<(), CacheError>;

    /// Returns `Ok(false)` when fewer than `quantity` units are reserved.
    async fn commit(&self, product_id: i64, quantity: i32) -> Result<bool, CacheError>;

    /// Seeds (or resets) the counters from the durable record.
    async fn init(&self, product_id: i64, available: i32, reserved: i32)
        -> Result<(), CacheError>;

    async fn get(&self, product_id: i64) -> Result<(i32, i32), CacheError>;
}

fn inventory_key(product_id: i64) -> String {
    format!("inventory:{}", product_id)
}

/// Redis-backed cache. Each operation runs as a single Lua script so
/// concurrent callers never observe a torn `{available, reserved}` pair.
pub struct RedisStockCache {
    conn: ConnectionManager,
    reserve: Script,
    release: Script,
    commit: Script,
}

impl RedisStockCache {
    pub async fn connect(
        addr: &str,
        password: Option<String>,
        db: i64,
    ) -> Result<Self, CacheError> {
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse::<u16>().unwrap_or(6379)),
            None => (addr.to_string(), 6379),
        };
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db,
                password,
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            reserve: Script::new(RESERVE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            commit: Script::new(COMMIT_SCRIPT),
        })
    }

    async fn run_script(
        &self,
        script: &Script,
        product_id: i64,
        quantity: i32,
    ) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let mut invocation = script.key(inventory_key(product_id));
        invocation.arg(quantity);
        let result: i64 = tokio::time::timeout(OP_TIMEOUT, invocation.invoke_async(&mut conn))
            .await
            .map_err(|_| CacheError::Timeout)??;
        if result == -1 {
            return Err(CacheError::Missing(product_id));
        }
        Ok(result)
    }
}

#[async_trait]
impl StockCache for RedisStockCache {
    async fn reserve(&self, product_id: i64, quantity: i32) -> Result<bool, CacheError> {
        Ok(self.run_script(&self.reserve, product_id, quantity).await? == 1)
    }

    async fn release(&self, product_id: i64, quantity: i32) -> Result<(), CacheError> {
        self.run_script(&self.release, product_id, quantity).await?;
        Ok(())
    }

    async fn commit(&self, product_id: i64, quantity: i32) -> Result<bool, CacheError> {
        Ok(self.run_script(&self.commit, product_id, quantity).await? == 1)
    }

    async fn init(
        &self,
        product_id: i64,
        available: i32,
        reserved: i32,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = inventory_key(product_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&key, "available", available)
            .hset(&key, "reserved", reserved);
        let _: () = tokio::time::timeout(OP_TIMEOUT, pipe.query_async(&mut conn))
            .await
            .map_err(|_| CacheError::Timeout)??;
        Ok(())
    }

    async fn get(&self, product_id: i64) -> Result<(i32, i32), CacheError> {
        let mut conn = self.conn.clone();
        let key = inventory_key(product_id);
        let values: HashMap<String, i32> = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("HGETALL").arg(&key).query_async(&mut conn),
        )
        .await
        .map_err(|_| CacheError::Timeout)??;
        if values.is_empty() {
            return Err(CacheError::Missing(product_id));
        }
        Ok((
            values.get("available").copied().unwrap_or(0),
            values.get("reserved").copied().unwrap_or(0),
        ))
    }
}

/// Process-local cache with the same atomicity contract, used in tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockCache {
    state: Arc<RwLock<HashMap<i64, (i32, i32)>>>,
}

impl InMemoryStockCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StockCache for InMemoryStockCache {
    async fn reserve(&self, product_id: i64, quantity: i32) -> Result<bool, CacheError> {
        let mut state = self.state.write().unwrap();
        let (available, reserved) = state
            .get_mut(&product_id)
            .ok_or(CacheError::Missing(product_id))?;
        if *available < quantity {
            return Ok(false);
        }
        *available -= quantity;
        *reserved += quantity;
        Ok(true)
    }

    async fn release(&self, product_id: i64, quantity: i32) -> Result<(), CacheError> {
        let mut state = self.state.write().unwrap();
        let (available, reserved) = state
            .get_mut(&product_id)
            .ok_or(CacheError::Missing(product_id))?;
        *available += quantity;
        *reserved -= quantity;
        Ok(())
    }

    async fn commit(&self, product_id: i64, quantity: i32) -> Result<bool, CacheError> {
        let mut state = self.state.write().unwrap();
        let (_, reserved) = state
            .get_mut(&product_id)
            .ok_or(CacheError::Missing(product_id))?;
        if *reserved < quantity {
            return Ok(false);
        }
        *reserved -= quantity;
        Ok(true)
    }

    async fn init(
        &self,
        product_id: i64,
        available: i32,
        reserved: i32,
    ) -> Result<(), CacheError> {
        self.state
            .write()
            .unwrap()
            .insert(product_id, (available, reserved));
        Ok(())
    }

    async fn get(&self, product_id: i64) -> Result<(i32, i32), CacheError> {
        self.state
            .read()
            .unwrap()
            .get(&product_id)
            .copied()
            .ok_or(CacheError::Missing(product_id))
    }
}
