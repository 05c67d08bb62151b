
use crate::state::AppState;
use crate::store::RedisHandle;
use crate::util::now_ms;
use hyper::{Body, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const STORE_DEADLINE: Duration = Duration::from_secs(2);
pub const KEY_PREFIX: &str = "relay_";

/// API key record stored at `apikey:<key>`. Written by the admin plane; the
/// request path only reads it and bumps the usage counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub user_id: String,
    /// Per-key requests per second (informational; enforced limits come from
    /// the gateway-wide limiter).
    #[serde(default)]
    pub rate_limit: f64,
    #[serde(default)]
    pub burst: u32,
    /// Total requests allowed; 0 means unlimited.
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub used: i64,
    pub active: bool,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[inline]
pub fn record_key(key: &str) -> String {
    format!("apikey:{key}")
}

/// Validates the bearer key against the shared store and enforces
/// activation, expiry and quota. Success bumps the usage counter off the
/// request path.
pub async fn authenticate(
    state: &AppState,
    parts: &http::request::Parts,
) -> Result<ApiKey, Response<Body>> {
    let token = match bearer_token(&parts.headers) {
        Some(token) => token,
        None => {
            return Err(AppState::json_error(
                http::StatusCode::UNAUTHORIZED,
                "missing or malformed Authorization header",
                "unauthorized",
            ));
        }
    };
    if !token.starts_with(KEY_PREFIX) {
        return Err(AppState::json_error(
            http::StatusCode::UNAUTHORIZED,
            "invalid API key format",
            "unauthorized",
        ));
    }

    let Some(redis) = &state.redis else {
        return Err(AppState::json_error(
            http::StatusCode::UNAUTHORIZED,
            "authentication store unavailable",
            "unauthorized",
        ));
    };

    let record = match tokio::time::timeout(STORE_DEADLINE, redis.get(&record_key(token))).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(AppState::json_error(
                http::StatusCode::UNAUTHORIZED,
                "invalid API key",
                "unauthorized",
            ));
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "api key lookup failed");
            return Err(AppState::json_error(
                http::StatusCode::UNAUTHORIZED,
                "invalid API key",
                "unauthorized",
            ));
        }
        Err(_) => {
            tracing::warn!("api key lookup deadline exceeded");
            return Err(AppState::json_error(
                http::StatusCode::UNAUTHORIZED,
                "invalid API key",
                "unauthorized",
            ));
        }
    };

    let api_key: ApiKey = match serde_json::from_slice(&record) {
        Ok(key) => key,
        Err(_) => {
            return Err(AppState::json_error(
                http::StatusCode::UNAUTHORIZED,
                "corrupted key record",
                "unauthorized",
            ));
        }
    };

    if let Err(resp) = check_key(&api_key, now_ms()) {
        return Err(resp);
    }

    // Monotonic counter bump; read-modify-write with last-writer-wins is the
    // documented consistency level.
    let redis = redis.clone();
    let token = token.to_string();
    tokio::spawn(async move {
        if let Err(e) = increment_usage(&redis, &token).await {
            tracing::debug!(error = %e, "usage increment failed");
        }
    });

    Ok(api_key)
}

/// Activation, expiry and quota gates, in that order.
pub fn check_key(key: &ApiKey, now_ms: u64) -> Result<(), Response<Body>> {
    if !key.active {
        return Err(AppState::json_error(
            http::StatusCode::FORBIDDEN,
            "API key is inactive",
            "key_inactive",
        ));
    }
    if let Some(expires_at) = key.expires_at_ms {
        if now_ms >= expires_at {
            return Err(AppState::json_error(
                http::StatusCode::FORBIDDEN,
                "API key has expired",
                "key_expired",
            ));
        }
    }
    if key.quota > 0 && key.used >= key.quota {
        return Err(AppState::json_error(
            http::StatusCode::TOO_MANY_REQUESTS,
            "API key quota exceeded",
            "quota_exceeded",
        ));
    }
    Ok(())
}

fn bearer_token(headers: &hyper::HeaderMap) -> Option<&str> {
    let raw = headers
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .trim();
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

async fn increment_usage(redis: &RedisHandle, key: &str) -> anyhow::Result<()> {
    let record = record_key(key);
    let Some(data) = redis.get(&record).await? else {
        return Ok(());
    };
    let mut api_key: ApiKey = serde_json::from_slice(&data)?;
    api_key.used += 1;
    api_key.last_used_at_ms = Some(now_ms());
    let updated = serde_json::to_vec(&api_key)?;
    redis.set(&record, &updated).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn key(active: bool, quota: i64, used: i64, expires_at_ms: Option<u64>) -> ApiKey {
        ApiKey {
            key: "relay_test".to_string(),
            name: "test".to_string(),
            user_id: "u1".to_string(),
            rate_limit: 0.0,
            burst: 0,
            quota,
            used,
            active,
            created_at_ms: 0,
            expires_at_ms,
            last_used_at_ms: None,
            description: String::new(),
        }
    }

    #[test]
    fn bearer_extraction_accepts_case_insensitive_scheme() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("bearer relay_abc"),
        );
        assert_eq!(bearer_token(&headers), Some("relay_abc"));

        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic xyz"),
        );
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn inactive_key_is_forbidden() {
        let resp = check_key(&key(false, 0, 0, None), 1_000).unwrap_err();
        assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
    }

    #[test]
    fn expired_key_is_forbidden() {
        let resp = check_key(&key(true, 0, 0, Some(500)), 1_000).unwrap_err();
        assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
        assert!(check_key(&key(true, 0, 0, Some(5_000)), 1_000).is_ok());
    }

    #[test]
    fn exhausted_quota_is_rate_limited() {
        let resp = check_key(&key(true, 10, 10, None), 1_000).unwrap_err();
        assert_eq!(resp.status(), http::StatusCode::TOO_MANY_REQUESTS);
        // Zero quota means unlimited.
        assert!(check_key(&key(true, 0, 999, None), 1_000).is_ok());
    }

    #[test]
    fn record_roundtrips_through_json() {
        let original = key(true, 100, 3, Some(9_999));
        let encoded = serde_json::to_vec(&original).unwrap();
        let decoded: ApiKey = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.key, original.key);
        assert_eq!(decoded.quota, 100);
        assert_eq!(decoded.expires_at_ms, Some(9_999));
    }
}
