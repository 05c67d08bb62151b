
use crate::metrics;
use crate::pipeline;
use crate::store::RedisHandle;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Response};
use sha2::{Digest, Sha256};
use std::time::Duration;

const STORE_DEADLINE: Duration = Duration::from_secs(2);
const ENTRY_TTL_SECS: u64 = 60 * 60;

/// Responses larger than this are never cached; capture stops and the write
/// is skipped while the client keeps streaming.
const MAX_CACHEABLE_BYTES: usize = 1024 * 1024;

#[inline]
pub fn cache_key(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("cache:{:x}", hasher.finalize())
}

/// Looks up a stored response. `None` falls through to the upstream; store
/// errors and deadline expiry degrade to a miss.
pub async fn lookup(redis: &RedisHandle, key: &str) -> Option<Response<Body>> {
    match tokio::time::timeout(STORE_DEADLINE, redis.get(key)).await {
        Ok(Ok(Some(stored))) => {
            metrics::CACHE_HITS.inc();
            tracing::debug!(key = %&key[..key.len().min(14)], "cache hit");
            Some(hit_response(stored))
        }
        Ok(Ok(None)) => {
            metrics::CACHE_MISSES.inc();
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "cache lookup failed; proceeding to upstream");
            metrics::CACHE_MISSES.inc();
            None
        }
        Err(_) => {
            tracing::warn!("cache lookup deadline exceeded; proceeding to upstream");
            metrics::CACHE_MISSES.inc();
            None
        }
    }
}

/// Tees a miss response to the client while capturing its bytes; 200
/// responses within the size ceiling are written back asynchronously under
/// their own deadline.
pub fn capture(redis: RedisHandle, key: String, resp: Response<Body>) -> Response<Body> {
    if resp.status() != http::StatusCode::OK {
        return resp;
    }

    let (resp, captured) = pipeline::tee_response(resp, MAX_CACHEABLE_BYTES);
    tokio::spawn(async move {
        let Ok(captured) = captured.await else {
            return;
        };
        if captured.truncated {
            tracing::debug!(key = %&key[..key.len().min(14)], "response too large to cache");
            return;
        }
        match tokio::time::timeout(STORE_DEADLINE, redis.set_ex(&key, &captured.bytes, ENTRY_TTL_SECS))
            .await
        {
            Ok(Ok(())) => {
                tracing::debug!(key = %&key[..key.len().min(14)], bytes = captured.bytes.len(), "cached response");
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "cache write failed"),
            Err(_) => tracing::warn!("cache write deadline exceeded"),
        }
    });
    resp
}

fn hit_response(stored: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::OK)
        .header("x-cache", "HIT")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(stored))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_prefixed_hex_sha256_of_body() {
        let key = cache_key(b"hello");
        assert!(key.starts_with("cache:"));
        assert_eq!(key.len(), "cache:".len() + 64);
        // Same body, same key; different body, different key.
        assert_eq!(key, cache_key(b"hello"));
        assert_ne!(key, cache_key(b"hello "));
    }

    #[test]
    fn key_matches_known_digest() {
        // sha256("") is a fixed vector.
        assert_eq!(
            cache_key(b""),
            "cache:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn hit_response_carries_marker_headers() {
        let resp = hit_response(b"{\"id\":\"a\"}".to_vec());
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(resp.headers().get("x-cache").unwrap(), "HIT");
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"{\"id\":\"a\"}");
    }
}
