
use crate::pipeline::{self, RequestContext};
use crate::storage::{LogStore, RequestLog};
use crate::util::now_ms;
use bytes::Bytes;
use hyper::{Body, Method, Response};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const PERSIST_DEADLINE: Duration = Duration::from_secs(5);

/// Largest response body the recorder will keep for the persisted entry.
const MAX_RECORDED_BODY_BYTES: usize = 1024 * 1024;

/// Request recorder: captures the request shape up front and finishes the
/// entry once the response body has fully streamed, then persists it
/// fire-and-forget.
pub struct Recorder {
    start: Instant,
    method: String,
    path: String,
    user_agent: String,
    remote_addr: String,
    request_body: Option<Value>,
    model: Option<String>,
}

impl Recorder {
    pub fn begin(parts: &http::request::Parts, client_addr: SocketAddr, body: &Bytes) -> Self {
        let request_body = if parts.method == Method::POST || parts.method == Method::PUT {
            serde_json::from_slice::<Value>(body)
                .ok()
                .filter(Value::is_object)
        } else {
            None
        };
        let model = request_body
            .as_ref()
            .and_then(|v| v.get("model"))
            .and_then(|m| m.as_str())
            .map(str::to_string);

        Self {
            start: Instant::now(),
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            user_agent: parts
                .headers
                .get(http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            remote_addr: client_addr.to_string(),
            request_body,
            model,
        }
    }

    /// Tees the response and spawns the persistence task. Duration is
    /// measured to response-body completion.
    pub fn finish(self, store: LogStore, ctx: &RequestContext, resp: Response<Body>) -> Response<Body> {
        let status = resp.status().as_u16();
        let cache_hit = ctx.cache_hit
            || resp
                .headers()
                .get("x-cache")
                .map(|v| v == "HIT")
                .unwrap_or(false);

        let api_key = ctx.api_key.as_ref().map(|k| truncate_key(&k.key));
        let user_id = ctx
            .api_key
            .as_ref()
            .map(|k| k.user_id.clone())
            .unwrap_or_default();
        let tokens_used = ctx.token_count;
        let cost_usd = ctx.cost_usd;

        let (resp, captured) = pipeline::tee_response(resp, MAX_RECORDED_BODY_BYTES);
        tokio::spawn(async move {
            let response_body = match captured.await {
                Ok(captured) if !captured.truncated => {
                    serde_json::from_slice::<Value>(&captured.bytes)
                        .ok()
                        .filter(Value::is_object)
                }
                _ => None,
            };

            let entry = RequestLog {
                id: generate_log_id(),
                ts_ms: now_ms(),
                method: self.method,
                path: self.path,
                user_agent: self.user_agent,
                remote_addr: self.remote_addr,
                api_key,
                user_id,
                request_body: self.request_body,
                response_body,
                status,
                duration_ms: self.start.elapsed().as_millis() as u64,
                tokens_used,
                model: self.model,
                cost_usd,
                cache_hit,
            };

            let id = entry.id.clone();
            match tokio::time::timeout(PERSIST_DEADLINE, store.save(&entry)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(id = %id, error = %e, "request log persist failed"),
                Err(_) => tracing::warn!(id = %id, "request log persist deadline exceeded"),
            }
        });
        resp
    }
}

fn generate_log_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("log_{nanos}")
}

fn truncate_key(key: &str) -> String {
    if key.len() <= 12 {
        key.to_string()
    } else {
        format!("{}...", &key[..12])
    }
}
