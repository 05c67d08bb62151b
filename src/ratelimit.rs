
use crate::config::RateLimitConfig;
use crate::state::AppState;
use crate::store::RedisHandle;
use hyper::{Body, Response};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const STORE_DEADLINE: Duration = Duration::from_secs(2);

/// GCRA over a single shared-store key. Stores the theoretical arrival time
/// and returns `{allowed, retry_after_seconds}`; retry_after is stringified
/// because script replies truncate Lua floats.
const GCRA_SCRIPT: &str = r#"
local key = KEYS[1]
local burst = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local period = tonumber(ARGV[3])

local emission_interval = period / rate
local burst_offset = emission_interval * burst

local t = redis.call("TIME")
local now = tonumber(t[1]) + (tonumber(t[2]) / 1000000)

local tat = redis.call("GET", key)
if not tat then
  tat = now
else
  tat = tonumber(tat)
end
if tat < now then
  tat = now
end

local new_tat = tat + emission_interval
local allow_at = new_tat - burst_offset

if now < allow_at then
  return {0, tostring(allow_at - now)}
end

local reset_after = new_tat - now
redis.call("SET", key, tostring(new_tat), "EX", math.ceil(reset_after))
return {1, "-1"}
"#;

/// Token-bucket parameters handed to the distributed backend. For rps below
/// one the period stretches to whole seconds so the bucket still refills in
/// integral steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub rate: u64,
    pub period_secs: u64,
    pub burst: u32,
}

pub fn build_limit(rps: f64, burst: u32) -> Option<Limit> {
    if rps <= 0.0 {
        return None;
    }
    let burst = burst.max(1);
    if rps < 1.0 {
        let period_secs = (1.0 / rps).ceil() as u64;
        Some(Limit {
            rate: 1,
            period_secs,
            burst,
        })
    } else {
        Some(Limit {
            rate: rps.ceil() as u64,
            period_secs: 1,
            burst,
        })
    }
}

/// Rate limiter with a backend fixed at startup. Parameters are re-read from
/// the live snapshot on every request.
pub enum RateLimiter {
    Redis(RedisRateLimiter),
    Memory(MemoryRateLimiter),
}

impl RateLimiter {
    pub fn redis(handle: RedisHandle) -> Self {
        RateLimiter::Redis(RedisRateLimiter {
            redis: handle,
            script: redis::Script::new(GCRA_SCRIPT),
        })
    }

    pub fn memory() -> Self {
        RateLimiter::Memory(MemoryRateLimiter {
            bucket: Mutex::new(None),
        })
    }

    /// Returns the 429 response when the request is denied; `None` admits.
    pub async fn check(&self, cfg: &RateLimitConfig, client_key: &str) -> Option<Response<Body>> {
        if !cfg.enabled {
            return None;
        }
        match self {
            RateLimiter::Redis(limiter) => limiter.check(cfg, client_key).await,
            RateLimiter::Memory(limiter) => limiter.check(cfg),
        }
    }
}

pub struct RedisRateLimiter {
    redis: RedisHandle,
    script: redis::Script,
}

impl RedisRateLimiter {
    async fn check(&self, cfg: &RateLimitConfig, client_key: &str) -> Option<Response<Body>> {
        let Some(limit) = build_limit(cfg.rps, cfg.burst) else {
            return Some(too_many_requests(None));
        };

        let key = format!("ratelimit:{client_key}");
        let mut con = self.redis.connection();
        let invocation = async {
            let reply: redis::RedisResult<(i64, String)> = self
                .script
                .key(&key)
                .arg(limit.burst)
                .arg(limit.rate)
                .arg(limit.period_secs)
                .invoke_async(&mut con)
                .await;
            reply
        };

        match tokio::time::timeout(STORE_DEADLINE, invocation).await {
            Ok(Ok((allowed, retry_after))) => {
                if allowed > 0 {
                    return None;
                }
                let retry_secs = retry_after
                    .parse::<f64>()
                    .ok()
                    .filter(|s| *s > 0.0)
                    .map(|s| s.ceil() as u64);
                Some(too_many_requests(retry_secs))
            }
            Ok(Err(e)) => {
                // Fail open: the shared store being down must not take the
                // gateway down with it.
                tracing::warn!(error = %e, "rate limit store error; admitting request");
                None
            }
            Err(_) => {
                tracing::warn!("rate limit store deadline exceeded; admitting request");
                None
            }
        }
    }
}

pub struct MemoryRateLimiter {
    bucket: Mutex<Option<Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rps: f64,
    burst: u32,
}

impl MemoryRateLimiter {
    fn check(&self, cfg: &RateLimitConfig) -> Option<Response<Body>> {
        if cfg.rps <= 0.0 {
            return Some(too_many_requests(None));
        }
        let burst = cfg.burst.max(1);

        let mut guard = self.bucket.lock().unwrap();
        let rebuild = match guard.as_ref() {
            Some(b) => b.rps != cfg.rps || b.burst != burst,
            None => true,
        };
        if rebuild {
            // Accumulated tokens are dropped on parameter change.
            *guard = Some(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
                rps: cfg.rps,
                burst,
            });
        }

        let bucket = guard.as_mut().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.rps).min(bucket.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            Some(too_many_requests(None))
        }
    }
}

fn too_many_requests(retry_after_secs: Option<u64>) -> Response<Body> {
    let mut resp = AppState::json_error(
        http::StatusCode::TOO_MANY_REQUESTS,
        "too many requests",
        "rate_limited",
    );
    if let Some(secs) = retry_after_secs {
        if let Ok(v) = hyper::header::HeaderValue::from_str(&secs.to_string()) {
            resp.headers_mut().insert(hyper::header::RETRY_AFTER, v);
        }
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit_cfg(enabled: bool, rps: f64, burst: u32) -> RateLimitConfig {
        RateLimitConfig { enabled, rps, burst }
    }

    #[test]
    fn build_limit_stretches_period_for_fractional_rps() {
        let l = build_limit(0.2, 1).unwrap();
        assert_eq!(l, Limit { rate: 1, period_secs: 5, burst: 1 });
    }

    #[test]
    fn build_limit_ceils_whole_rps() {
        let l = build_limit(2.5, 4).unwrap();
        assert_eq!(l, Limit { rate: 3, period_secs: 1, burst: 4 });
    }

    #[test]
    fn build_limit_rejects_zero_rps_and_floors_burst() {
        assert!(build_limit(0.0, 5).is_none());
        assert_eq!(build_limit(1.0, 0).unwrap().burst, 1);
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::memory();
        let cfg = limit_cfg(false, 0.0, 0);
        for _ in 0..100 {
            assert!(limiter.check(&cfg, "c").await.is_none());
        }
    }

    #[tokio::test]
    async fn memory_bucket_allows_burst_then_denies() {
        let limiter = RateLimiter::memory();
        let cfg = limit_cfg(true, 2.0, 2);

        assert!(limiter.check(&cfg, "c").await.is_none());
        assert!(limiter.check(&cfg, "c").await.is_none());
        for _ in 0..4 {
            let denied = limiter.check(&cfg, "c").await.expect("expected 429");
            assert_eq!(denied.status(), http::StatusCode::TOO_MANY_REQUESTS);
            assert!(denied.headers().get(hyper::header::RETRY_AFTER).is_none());
        }
    }

    #[tokio::test]
    async fn memory_bucket_rebuilds_on_parameter_change() {
        let limiter = RateLimiter::memory();

        let cfg = limit_cfg(true, 1.0, 1);
        assert!(limiter.check(&cfg, "c").await.is_none());
        assert!(limiter.check(&cfg, "c").await.is_some());

        // Changing burst rebuilds the bucket full.
        let cfg = limit_cfg(true, 1.0, 3);
        assert!(limiter.check(&cfg, "c").await.is_none());
        assert!(limiter.check(&cfg, "c").await.is_none());
        assert!(limiter.check(&cfg, "c").await.is_none());
        assert!(limiter.check(&cfg, "c").await.is_some());
    }

    #[tokio::test]
    async fn memory_denies_on_nonpositive_rps() {
        let limiter = RateLimiter::memory();
        let cfg = limit_cfg(true, 0.0, 1);
        assert!(limiter.check(&cfg, "c").await.is_some());
    }
}
