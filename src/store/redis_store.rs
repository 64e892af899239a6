//! Redis-backed store.
//!
//! Single-field operations map onto native Redis commands. Everything that
//! reads and then writes (counter expiry, the log, the token bucket, the leaky
//! bucket queue) runs as one Lua script so concurrent callers on different
//! processes can never interleave inside an update.
//!
//! Timestamps cross into Lua as microseconds: Lua numbers are doubles and
//! nanoseconds since the epoch no longer fit in the 53-bit mantissa.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use tracing::{info, warn};

use super::{leak_interval_nanos, Store, StoreError, StoreResult};

/// Default bound on a single Redis command.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(250);
/// Default expiry for leaky bucket queues.
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

const RECORD_IN_LOG_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return redis.call('ZCARD', KEYS[1])
"#;

const TAKE_TOKEN_SCRIPT: &str = r#"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local data = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = tonumber(data[1])
local last = tonumber(data[2])
if tokens == nil or last == nil then
    tokens = burst
    last = now
end

local elapsed = math.max(0, now - last)
tokens = math.min(burst, tokens + elapsed * rate / 1000000)

local granted = 0
if tokens >= 1 then
    tokens = tokens - 1
    granted = 1
end

redis.call('HSET', KEYS[1], 'tokens', string.format('%.17g', tokens), 'last', string.format('%.17g', math.max(now, last)))
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return granted
"#;

// KEYS: queue, leak marker. ARGV: now, burst, minimum ttl in ms.
const ENQUEUE_SCRIPT: &str = r#"
local len = redis.call('LLEN', KEYS[1])
if len >= tonumber(ARGV[2]) then
    return 0
end
redis.call('RPUSH', KEYS[1], ARGV[1])

local ttl = tonumber(ARGV[3])
local interval = tonumber(redis.call('HGET', KEYS[2], 'interval'))
if interval then
    ttl = math.max(ttl, math.ceil((len + 1) * interval / 1000))
end
if redis.call('PTTL', KEYS[1]) < ttl then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
if redis.call('EXISTS', KEYS[2]) == 1 and redis.call('PTTL', KEYS[2]) < ttl then
    redis.call('PEXPIRE', KEYS[2], ttl)
end
return 1
"#;

// KEYS: queue, leak marker. ARGV: now, interval, minimum ttl in ms.
// The marker hash keeps the last leak time and the cadence, so the queue
// can always be kept alive until it has fully drained.
const DEQUEUE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
redis.call('HSET', KEYS[2], 'interval', ARGV[2])

local leaked = 0
local head = redis.call('LINDEX', KEYS[1], 0)
if head then
    local base = tonumber(head)
    local last = tonumber(redis.call('HGET', KEYS[2], 'last'))
    if last and last > base then
        base = last
    end
    if now - base >= interval then
        redis.call('LPOP', KEYS[1])
        redis.call('HSET', KEYS[2], 'last', string.format('%.17g', base + interval))
        leaked = 1
    end
end

local len = redis.call('LLEN', KEYS[1])
local ttl = math.max(tonumber(ARGV[3]), math.ceil((len + 1) * interval / 1000))
redis.call('PEXPIRE', KEYS[2], ttl)
if len > 0 then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return leaked
"#;

/// Connection settings for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Upper bound on each command, including reconnects.
    pub command_timeout: Duration,
    /// Minimum expiry of leaky bucket queues, refreshed on every write.
    /// Queues that take longer to drain live until they have drained.
    pub idle_ttl: Duration,
}

impl RedisStoreConfig {
    /// Settings with default timeouts for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }
}

struct Scripts {
    increment: Script,
    record_in_log: Script,
    take_token: Script,
    enqueue: Script,
    dequeue: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            increment: Script::new(INCREMENT_SCRIPT),
            record_in_log: Script::new(RECORD_IN_LOG_SCRIPT),
            take_token: Script::new(TAKE_TOKEN_SCRIPT),
            enqueue: Script::new(ENQUEUE_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
        }
    }
}

/// A [`Store`] shared across processes through Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    command_timeout: Duration,
    idle_ttl: Duration,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .field("idle_ttl", &self.idle_ttl)
            .finish()
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl RedisStore {
    /// Connect to Redis. The connection reconnects on its own after failures.
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = match tokio::time::timeout(
            config.command_timeout,
            ConnectionManager::new(client),
        )
        .await
        {
            Ok(conn) => conn?,
            Err(_) => {
                warn!(url = %config.url, "Timed out connecting to Redis");
                return Err(StoreError::Timeout(config.command_timeout));
            }
        };

        info!(
            command_timeout = ?config.command_timeout,
            idle_ttl = ?config.idle_ttl,
            "Connected to Redis"
        );

        Ok(Self {
            conn,
            command_timeout: config.command_timeout,
            idle_ttl: config.idle_ttl,
            scripts: Scripts::new(),
        })
    }

    /// Run one Redis round trip under the command timeout.
    async fn run<T, F>(&self, op: &'static str, key: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, key = %key, error = %e, "Redis command failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(op, key = %key, timeout = ?self.command_timeout, "Redis command timed out");
                Err(StoreError::Timeout(self.command_timeout))
            }
        }
    }
}

fn to_micros(nanos: u64) -> u64 {
    nanos / 1_000
}

fn millis(d: Duration) -> u64 {
    (d.as_millis() as u64).max(1)
}

/// Sorted set member for a log entry. The suffix keeps equal timestamps
/// from collapsing into one member.
fn log_member(timestamp: u64) -> String {
    format!("{}-{}", timestamp, uuid::Uuid::new_v4().simple())
}

/// Time for an empty bucket to refill completely, doubled.
fn bucket_ttl_millis(rate: f64, burst: u64) -> u64 {
    ((burst as f64 / rate).ceil() * 2_000.0).max(1.0) as u64
}

/// Companion key holding a queue's last leak time and cadence. Caller keys
/// escape `:` in identities, so no caller's queue can land on it.
fn leak_key(key: &str) -> String {
    format!("{}:leak", key)
}

/// Leak cadence in whole microseconds, rounded up and never zero.
fn leak_interval_micros(rate: f64) -> u64 {
    leak_interval_nanos(rate).div_ceil(1_000).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .run(
                "increment",
                key,
                self.scripts
                    .increment
                    .key(key)
                    .arg(millis(window))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = self.run("get", key, conn.get(key)).await?;
        Ok(value.unwrap_or(0))
    }

    async fn get_with_ttl(&self, key: &str) -> StoreResult<(u64, Option<Duration>)> {
        let mut conn = self.conn.clone();
        let (value, pttl): (Option<u64>, i64) = self
            .run(
                "get_with_ttl",
                key,
                redis::pipe().get(key).pttl(key).query_async(&mut conn),
            )
            .await?;

        // -2 means no key, -1 means no expiry.
        let ttl = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
        Ok((value.unwrap_or(0), ttl))
    }

    async fn add_to_list(&self, key: &str, timestamp: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .run(
                "add_to_list",
                key,
                conn.zadd(key, log_member(timestamp), to_micros(timestamp)),
            )
            .await?;
        Ok(())
    }

    async fn trim_list(&self, key: &str, min_timestamp: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let max = format!("({}", to_micros(min_timestamp));
        let _: i64 = self
            .run("trim_list", key, conn.zrembyscore(key, "-inf", max))
            .await?;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = self.run("list_len", key, conn.zcard(key)).await?;
        Ok(len)
    }

    async fn record_in_log(&self, key: &str, now: u64, window: Duration) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let min = now.saturating_sub(window.as_nanos() as u64);
        let len: u64 = self
            .run(
                "record_in_log",
                key,
                self.scripts
                    .record_in_log
                    .key(key)
                    .arg(to_micros(min))
                    .arg(to_micros(now))
                    .arg(log_member(now))
                    .arg(millis(window))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(len)
    }

    async fn take_token(&self, key: &str, rate: f64, burst: u64, now: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let granted: i64 = self
            .run(
                "take_token",
                key,
                self.scripts
                    .take_token
                    .key(key)
                    .arg(rate)
                    .arg(burst)
                    .arg(to_micros(now))
                    .arg(bucket_ttl_millis(rate, burst))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(granted == 1)
    }

    async fn enqueue(&self, key: &str, burst: u64, now: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let accepted: i64 = self
            .run(
                "enqueue",
                key,
                self.scripts
                    .enqueue
                    .key(key)
                    .key(leak_key(key))
                    .arg(to_micros(now))
                    .arg(burst)
                    .arg(millis(self.idle_ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(accepted == 1)
    }

    async fn dequeue(&self, key: &str, rate: f64, now: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .run(
                "dequeue",
                key,
                self.scripts
                    .dequeue
                    .key(key)
                    .key(leak_key(key))
                    .arg(to_micros(now))
                    .arg(leak_interval_micros(rate))
                    .arg(millis(self.idle_ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}
