
use crate::config::ConfigStore;
use crate::dispatch::{Dispatcher, HttpClient};
use crate::keys::KeyManager;
use crate::ratelimit::RateLimiter;
use crate::storage::LogStore;
use crate::store::{self, RedisHandle};
use crate::transform::Transformer;
use hyper::{Body, Client, Response};
use hyper_rustls::HttpsConnectorBuilder;
use std::sync::Arc;
use std::time::Duration;

/// Wired-up gateway. Layer presence (auth, cache, recorder, transformer,
/// dispatcher mode, limiter backend) is fixed here from the startup
/// snapshot; per-request parameters come from the live snapshot.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub redis: Option<RedisHandle>,
    pub limiter: RateLimiter,
    pub dispatcher: Dispatcher,
    pub log_store: LogStore,
    pub keys: Option<KeyManager>,
    pub transformer: Option<Transformer>,
    pub auth_enabled: bool,
    pub recording_enabled: bool,
}

impl AppState {
    pub async fn new(config: Arc<ConfigStore>) -> anyhow::Result<Self> {
        let cfg = config.get();
        let client = build_http_client();

        let redis = if cfg.redis.enabled {
            let handle = store::connect(&cfg.redis).await?;
            tracing::info!(address = %cfg.redis.address, "connected to redis");
            Some(handle)
        } else {
            None
        };

        if cfg.auth.enabled && redis.is_none() {
            anyhow::bail!("authentication requires redis to be enabled");
        }

        let log_store = match (&redis, cfg.logging.enabled) {
            (Some(handle), true) => {
                tracing::info!(
                    retention_days = cfg.retention().as_secs() / 86_400,
                    "request logging enabled"
                );
                LogStore::redis(handle.clone(), cfg.retention())
            }
            (None, true) => {
                tracing::warn!("request logging requires redis; disabled");
                LogStore::Null
            }
            _ => LogStore::Null,
        };

        let limiter = match &redis {
            Some(handle) => RateLimiter::redis(handle.clone()),
            None => RateLimiter::memory(),
        };
        if cfg.ratelimit.enabled {
            tracing::info!(
                rps = cfg.ratelimit.rps,
                burst = cfg.ratelimit.burst,
                distributed = redis.is_some(),
                "rate limiting enabled"
            );
        }

        let dispatcher = Dispatcher::from_config(&cfg, client.clone())?;
        dispatcher.spawn_health_probe();

        let transformer = if cfg.transform.enabled {
            tracing::info!("request transformation enabled");
            Some(Transformer::new(&cfg.transform)?)
        } else {
            None
        };

        let keys = redis.clone().map(KeyManager::new);
        let recording_enabled = log_store.is_enabled();

        Ok(Self {
            config,
            redis,
            limiter,
            dispatcher,
            log_store,
            keys,
            transformer,
            auth_enabled: cfg.auth.enabled,
            recording_enabled,
        })
    }

    /// Standardized JSON error envelope.
    pub fn json_error(status: http::StatusCode, message: &str, code: &str) -> Response<Body> {
        let body = format!(
            r#"{{"error":{{"message":"{}","type":"relay_error","code":"{}"}}}}"#,
            escape_json(message),
            escape_json(code)
        );
        Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("relay_error")))
    }
}

pub fn build_http_client() -> HttpClient {
    let https = HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(64)
        .build::<_, Body>(https)
}

#[inline]
fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_error_is_well_formed() {
        let resp = AppState::json_error(
            http::StatusCode::FORBIDDEN,
            "path \"x\" not allowed",
            "path_blocked",
        );
        assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"]["code"], "path_blocked");
        assert_eq!(parsed["error"]["message"], "path \"x\" not allowed");
    }
}
