
use crate::keys::{CreateKeyParams, KeyManager};
use crate::state::AppState;
use crate::storage::LogFilters;
use crate::util::query_get;
use hyper::body::HttpBody;
use hyper::{Body, Method, Request, Response};
use serde::Deserialize;
use std::sync::Arc;

const MAX_ADMIN_BODY_BYTES: usize = 256 * 1024;

pub async fn handle_admin(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let cfg = state.config.get();

    // An empty admin key disables the control plane entirely.
    if cfg.auth.admin_key.is_empty() {
        return not_found();
    }
    let authorized = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == cfg.auth.admin_key)
        .unwrap_or(false);
    if !authorized {
        return AppState::json_error(
            http::StatusCode::UNAUTHORIZED,
            "missing or invalid admin key",
            "admin_unauthorized",
        );
    }

    let path = req.uri().path().to_string();
    let method = req.method().clone();

    match (&method, path.as_str()) {
        (&Method::POST, "/admin/api/v1/keys") => api_create_key(req, state).await,
        (&Method::GET, "/admin/api/v1/keys") => api_list_keys(req, state).await,
        (&Method::GET, "/admin/api/v1/logs") => api_list_logs(req, state).await,
        (&Method::GET, "/admin/api/v1/stats/usage") => api_usage_stats(req, state).await,
        (&Method::GET, "/admin/api/v1/stats/cost") => api_cost_stats(req, state).await,
        (&Method::GET, "/admin/api/v1/targets") => json_ok(&state.dispatcher.targets_status()),
        (&Method::GET, "/admin/api/v1/ping") => api_ping(state).await,
        _ => {
            if let Some(rest) = path.strip_prefix("/admin/api/v1/keys/") {
                return handle_key_subroutes(req, state, rest).await;
            }
            if let Some(id) = path.strip_prefix("/admin/api/v1/logs/") {
                if method == Method::GET && !id.is_empty() {
                    return api_get_log(state, id).await;
                }
            }
            not_found()
        }
    }
}

async fn handle_key_subroutes(
    req: Request<Body>,
    state: Arc<AppState>,
    rest: &str,
) -> Response<Body> {
    let mut parts = rest.split('/');
    let key = match parts.next() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            return AppState::json_error(
                http::StatusCode::BAD_REQUEST,
                "missing key",
                "bad_request",
            )
        }
    };
    let action = parts.next().unwrap_or("");

    match (req.method(), action) {
        (&Method::GET, "") => api_get_key(state, &key).await,
        (&Method::DELETE, "") => api_delete_key(state, &key).await,
        (&Method::POST, "revoke") => api_revoke_key(state, &key).await,
        (&Method::POST, "rotate") => api_rotate_key(state, &key).await,
        _ => not_found(),
    }
}

#[derive(Deserialize)]
struct CreateKeyBody {
    name: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    rate_limit: f64,
    #[serde(default)]
    burst: u32,
    #[serde(default)]
    quota: i64,
    #[serde(default)]
    expires_in_secs: Option<u64>,
}

async fn api_create_key(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let Some(km) = key_manager(&state) else {
        return store_unavailable();
    };
    let body = match read_body_limit(req, MAX_ADMIN_BODY_BYTES).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let payload: CreateKeyBody = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return AppState::json_error(
                http::StatusCode::BAD_REQUEST,
                &format!("invalid json: {e}"),
                "bad_request",
            )
        }
    };
    if payload.name.trim().is_empty() {
        return AppState::json_error(
            http::StatusCode::BAD_REQUEST,
            "name must not be empty",
            "bad_request",
        );
    }

    match km
        .create(CreateKeyParams {
            name: payload.name,
            user_id: payload.user_id,
            description: payload.description,
            rate_limit: payload.rate_limit,
            burst: payload.burst,
            quota: payload.quota,
            expires_in_secs: payload.expires_in_secs,
        })
        .await
    {
        Ok(api_key) => json_ok(&api_key),
        Err(e) => internal_error("create key failed", e),
    }
}

async fn api_list_keys(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let Some(km) = key_manager(&state) else {
        return store_unavailable();
    };
    let Some(user_id) = query_get(req.uri(), "user_id") else {
        return AppState::json_error(
            http::StatusCode::BAD_REQUEST,
            "user_id query parameter required",
            "bad_request",
        );
    };
    match km.list(user_id).await {
        Ok(keys) => json_ok(&keys),
        Err(e) => internal_error("list keys failed", e),
    }
}

async fn api_get_key(state: Arc<AppState>, key: &str) -> Response<Body> {
    let Some(km) = key_manager(&state) else {
        return store_unavailable();
    };
    match km.get(key).await {
        Ok(Some(api_key)) => json_ok(&api_key),
        Ok(None) => key_not_found(),
        Err(e) => internal_error("get key failed", e),
    }
}

async fn api_delete_key(state: Arc<AppState>, key: &str) -> Response<Body> {
    let Some(km) = key_manager(&state) else {
        return store_unavailable();
    };
    match km.delete(key).await {
        Ok(true) => json_ok(&serde_json::json!({ "deleted": true })),
        Ok(false) => key_not_found(),
        Err(e) => internal_error("delete key failed", e),
    }
}

async fn api_revoke_key(state: Arc<AppState>, key: &str) -> Response<Body> {
    let Some(km) = key_manager(&state) else {
        return store_unavailable();
    };
    match km.revoke(key).await {
        Ok(true) => json_ok(&serde_json::json!({ "revoked": true })),
        Ok(false) => key_not_found(),
        Err(e) => internal_error("revoke key failed", e),
    }
}

async fn api_rotate_key(state: Arc<AppState>, key: &str) -> Response<Body> {
    let Some(km) = key_manager(&state) else {
        return store_unavailable();
    };
    match km.rotate(key).await {
        Ok(Some(api_key)) => json_ok(&api_key),
        Ok(None) => key_not_found(),
        Err(e) => internal_error("rotate key failed", e),
    }
}

async fn api_list_logs(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let uri = req.uri();
    let filters = LogFilters {
        user_id: query_get(uri, "user_id").map(str::to_string),
        model: query_get(uri, "model").map(str::to_string),
        status: query_get(uri, "status").and_then(|s| s.parse().ok()),
        from_secs: query_get(uri, "from").and_then(|s| s.parse().ok()),
        to_secs: query_get(uri, "to").and_then(|s| s.parse().ok()),
        limit: query_get(uri, "limit")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        offset: query_get(uri, "offset")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    };
    match state.log_store.list(&filters).await {
        Ok(logs) => json_ok(&logs),
        Err(e) => internal_error("list logs failed", e),
    }
}

async fn api_get_log(state: Arc<AppState>, id: &str) -> Response<Body> {
    match state.log_store.get(id).await {
        Ok(Some(log)) => json_ok(&log),
        Ok(None) => AppState::json_error(
            http::StatusCode::NOT_FOUND,
            "log not found",
            "log_not_found",
        ),
        Err(e) => internal_error("get log failed", e),
    }
}

async fn api_usage_stats(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let uri = req.uri();
    let user_id = query_get(uri, "user_id");
    let from = query_get(uri, "from").and_then(|s| s.parse().ok());
    let to = query_get(uri, "to").and_then(|s| s.parse().ok());
    match state.log_store.usage_stats(user_id, from, to).await {
        Ok(stats) => json_ok(&stats),
        Err(e) => internal_error("usage stats failed", e),
    }
}

async fn api_cost_stats(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
    let uri = req.uri();
    let user_id = query_get(uri, "user_id");
    let from = query_get(uri, "from").and_then(|s| s.parse().ok());
    let to = query_get(uri, "to").and_then(|s| s.parse().ok());
    match state.log_store.cost_stats(user_id, from, to).await {
        Ok(stats) => json_ok(&stats),
        Err(e) => internal_error("cost stats failed", e),
    }
}

async fn api_ping(state: Arc<AppState>) -> Response<Body> {
    match state.log_store.ping().await {
        Ok(()) => json_ok(&serde_json::json!({ "status": "ok" })),
        Err(e) => AppState::json_error(
            http::StatusCode::SERVICE_UNAVAILABLE,
            &format!("store unreachable: {e}"),
            "store_unreachable",
        ),
    }
}

fn key_manager(state: &AppState) -> Option<&KeyManager> {
    state.keys.as_ref()
}

async fn read_body_limit(req: Request<Body>, limit: usize) -> Result<Vec<u8>, Response<Body>> {
    let mut body = req.into_body();
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(chunk) => {
                if buf.len().saturating_add(chunk.len()) > limit {
                    return Err(AppState::json_error(
                        http::StatusCode::PAYLOAD_TOO_LARGE,
                        "request body too large",
                        "body_too_large",
                    ));
                }
                buf.extend_from_slice(&chunk);
            }
            Err(e) => {
                return Err(AppState::json_error(
                    http::StatusCode::BAD_REQUEST,
                    &format!("read body: {e}"),
                    "bad_request",
                ));
            }
        }
    }
    Ok(buf)
}

fn json_ok<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(http::StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(e) => internal_error("encode response failed", e.into()),
    }
}

fn internal_error(context: &str, e: anyhow::Error) -> Response<Body> {
    tracing::warn!(error = %e, "{context}");
    AppState::json_error(
        http::StatusCode::INTERNAL_SERVER_ERROR,
        context,
        "internal_error",
    )
}

fn store_unavailable() -> Response<Body> {
    AppState::json_error(
        http::StatusCode::SERVICE_UNAVAILABLE,
        "key management requires redis",
        "store_unavailable",
    )
}

fn key_not_found() -> Response<Body> {
    AppState::json_error(http::StatusCode::NOT_FOUND, "key not found", "key_not_found")
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::NOT_FOUND)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"error":"not_found"}"#))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
