//! `BucketStore` backed by a shared Redis instance (spec §6), so bucket
//! state is consistent across gateway replicas. Grounded on the teacher's
//! own `RedisClientTrait`/`RedisClient` split (`src/redis/client.rs`): a
//! concrete struct wrapping a connection, with the seam for testability
//! supplied by the `BucketStore` trait itself (`InMemoryBucketStore` is the
//! fake; this crate has no direct need for a mocking library on top of it).

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use common::error::AppError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::store::{BucketParams, BucketStore, ConsumeOutcome};

/// Performs the refill-then-conditionally-consume operation as one atomic
/// Lua script (spec §4.J: "a single atomic operation against the shared
/// store (e.g. a server-side script)").
const CONSUME_SCRIPT: &str = r"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local amount = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local content_length = ARGV[6]

local data = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(data[1])
if tokens == nil then tokens = capacity end
local last_refill_ms = tonumber(data[2])
if last_refill_ms == nil then last_refill_ms = now_ms end

local delta_secs = math.max(0, now_ms - last_refill_ms) / 1000.0
tokens = math.min(capacity, tokens + delta_secs * rate)

local allowed = 1
if amount > 0 and tokens < amount then
  allowed = 0
else
  tokens = tokens - amount
end

if content_length ~= '' then
  redis.call('HSET', key, 'tokens', tokens, 'last_refill_ms', now_ms, 'content_length', content_length)
else
  redis.call('HSET', key, 'tokens', tokens, 'last_refill_ms', now_ms)
end
redis.call('EXPIRE', key, ttl)

return {allowed, tostring(tokens)}
";

pub struct RedisBucketStore {
    manager: ConnectionManager,
    script: Script,
}

impl RedisBucketStore {
    /// `redis_url` as accepted by `redis::Client::open` (e.g.
    /// `redis://127.0.0.1/`).
    pub async fn connect(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url).map_err(|e| AppError::Internal(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(Self {
            manager,
            script: Script::new(CONSUME_SCRIPT),
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn consume(
        &self,
        key: &str,
        amount: i64,
        params: BucketParams,
        content_length: Option<u64>,
    ) -> Result<ConsumeOutcome, AppError> {
        let mut conn = self.manager.clone();
        let content_length_arg = content_length.map(|v| v.to_string()).unwrap_or_default();

        let (allowed, tokens): (i64, String) = self
            .script
            .key(key)
            .arg(params.capacity)
            .arg(params.refill_rate_per_sec)
            .arg(amount)
            .arg(now_millis())
            .arg(params.ttl_seconds)
            .arg(content_length_arg)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(ConsumeOutcome {
            allowed: allowed == 1,
            tokens_remaining: tokens.parse().unwrap_or(0.0),
        })
    }

    async fn record_content_length(&self, key: &str, content_length: u64) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        conn.hset::<_, _, _, ()>(key, "content_length", content_length)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn cached_content_length(&self, key: &str) -> Result<Option<u64>, AppError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn
            .hget(key, "content_length")
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(value.and_then(|v| v.parse().ok()))
    }
}
