//! Shared per-minute rate limiter for the model provider, backed by two
//! counters in Redis. The minute window resets and the conditional
//! decrement both run as server-side scripts, so any number of worker
//! processes share one budget without racing. Optional: workers run
//! without it when the provider's own quotas are enough.

use std::time;

use redis::aio::MultiplexedConnection;
use redis::RedisError;
use thiserror::Error;
use tracing::debug;

const TOKEN_BUCKET_KEY: &str = "rate_limiter:token_bucket";
const REQUEST_COUNT_KEY: &str = "rate_limiter:request_count";
const LAST_RESET_KEY: &str = "rate_limiter:last_reset_time";

const POLL_INTERVAL: time::Duration = time::Duration::from_millis(100);

const RESET_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[3])
local last_reset = tonumber(redis.call('get', KEYS[1]) or '0')

if (now - last_reset) >= window then
    redis.call('set', KEYS[2], ARGV[2])
    redis.call('set', KEYS[3], '0')
    redis.call('set', KEYS[1], now)
    return 1
end
return 0
"#;

const ACQUIRE_SCRIPT: &str = r#"
local current_tokens = tonumber(redis.call('get', KEYS[1]) or '0')
local current_requests = tonumber(redis.call('get', KEYS[2]) or '0')
local tokens_needed = tonumber(ARGV[1])
local max_requests = tonumber(ARGV[2])

if current_tokens >= tokens_needed and current_requests < max_requests then
    redis.call('decrby', KEYS[1], tokens_needed)
    redis.call('incr', KEYS[2])
    return 1
end
return 0
"#;

#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("token count must be greater than zero")]
    NonPositive,
    #[error("requested {requested} tokens, over the per-minute cap of {cap}")]
    OverCap { requested: u64, cap: u64 },
    #[error("rate limiter operation failed: {0}")]
    Redis(#[from] RedisError),
}

pub struct RateLimiter {
    client: redis::Client,
    max_requests: u64,
    max_tokens: u64,
    window_secs: i64,
}

impl RateLimiter {
    pub fn new(url: &str, max_requests: u64, max_tokens: u64) -> Result<Self, LimiterError> {
        Ok(Self {
            client: redis::Client::open(url).map_err(LimiterError::Redis)?,
            max_requests,
            max_tokens,
            window_secs: 60,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RedisError> {
        self.client.get_multiplexed_tokio_connection().await
    }

    /// Seed the counters if no window exists yet. SET NX keeps concurrent
    /// workers from clobbering a live window.
    async fn ensure_state(&self, connection: &mut MultiplexedConnection) -> Result<(), RedisError> {
        redis::pipe()
            .cmd("SET")
            .arg(TOKEN_BUCKET_KEY)
            .arg(self.max_tokens)
            .arg("NX")
            .ignore()
            .cmd("SET")
            .arg(REQUEST_COUNT_KEY)
            .arg(0)
            .arg("NX")
            .ignore()
            .cmd("SET")
            .arg(LAST_RESET_KEY)
            .arg(chrono::Utc::now().timestamp())
            .arg("NX")
            .ignore()
            .query_async::<_, ()>(connection)
            .await
    }

    /// Block until both the request count and the token budget admit this
    /// call, then atomically take the tokens and count the request.
    pub async fn acquire(&self, tokens: u64) -> Result<(), LimiterError> {
        if tokens == 0 {
            return Err(LimiterError::NonPositive);
        }
        if tokens > self.max_tokens {
            return Err(LimiterError::OverCap {
                requested: tokens,
                cap: self.max_tokens,
            });
        }

        let mut connection = self.connection().await.map_err(LimiterError::Redis)?;
        self.ensure_state(&mut connection).await?;

        let reset_script = redis::Script::new(RESET_WINDOW_SCRIPT);
        let acquire_script = redis::Script::new(ACQUIRE_SCRIPT);

        loop {
            reset_script
                .key(LAST_RESET_KEY)
                .key(TOKEN_BUCKET_KEY)
                .key(REQUEST_COUNT_KEY)
                .arg(chrono::Utc::now().timestamp())
                .arg(self.max_tokens)
                .arg(self.window_secs)
                .invoke_async::<_, i64>(&mut connection)
                .await?;

            let granted: i64 = acquire_script
                .key(TOKEN_BUCKET_KEY)
                .key(REQUEST_COUNT_KEY)
                .arg(tokens)
                .arg(self.max_requests)
                .invoke_async(&mut connection)
                .await?;

            if granted == 1 {
                return Ok(());
            }

            debug!(tokens, "rate limiter saturated, waiting for the window");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new("redis://localhost:6379", 2000, 4_000_000)
            .expect("failed to build limiter")
    }

    #[tokio::test]
    async fn test_rejects_zero_tokens() {
        // Input validation happens before any connection is made.
        let err = limiter().acquire(0).await.unwrap_err();
        assert!(matches!(err, LimiterError::NonPositive));
    }

    #[tokio::test]
    async fn test_rejects_over_cap_request() {
        let err = limiter().acquire(4_000_001).await.unwrap_err();
        assert!(matches!(
            err,
            LimiterError::OverCap {
                requested: 4_000_001,
                cap: 4_000_000
            }
        ));
    }

    #[tokio::test]
    #[ignore = "requires a local redis on 6379"]
    async fn test_acquire_within_budget() {
        limiter().acquire(1000).await.expect("acquire should pass");
    }
}
