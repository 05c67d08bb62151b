
use crate::state::AppState;
use crate::{auth, cache, cost, recorder, util};
use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::{Body, Method, Request, Response};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Per-request carrier from producer layers to the recorder. Fields are
/// written once by the layer that owns them and read after the inner layers
/// return.
#[derive(Default)]
pub struct RequestContext {
    pub api_key: Option<auth::ApiKey>,
    pub token_count: Option<usize>,
    pub cost_usd: Option<f64>,
    pub cache_hit: bool,
}

/// Pipeline entry. The outermost layer is the request logger: it stamps the
/// start time and emits the completion line once the chain returns.
pub async fn handle(
    req: Request<Body>,
    state: Arc<AppState>,
    client_addr: SocketAddr,
) -> Response<Body> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let resp = run(&state, req, client_addr).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        remote = %client_addr,
        latency_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

async fn run(state: &AppState, req: Request<Body>, client_addr: SocketAddr) -> Response<Body> {
    let (parts, body) = req.into_parts();

    // The body is read exactly once; every layer below sees these bytes.
    let body_bytes = match read_request_body(body).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    // One snapshot pointer per request; no layer observes a mix of two
    // configurations.
    let cfg = state.config.get();
    let mut ctx = RequestContext::default();

    cost::tag_request(&cfg, &body_bytes, &mut ctx);

    let rec = state
        .recording_enabled
        .then(|| recorder::Recorder::begin(&parts, client_addr, &body_bytes));

    let resp = inner(state, &cfg, parts, body_bytes, &mut ctx, client_addr).await;

    match rec {
        Some(rec) => rec.finish(state.log_store.clone(), &ctx, resp),
        None => resp,
    }
}

async fn inner(
    state: &AppState,
    cfg: &crate::config::Config,
    mut parts: http::request::Parts,
    mut body_bytes: Bytes,
    ctx: &mut RequestContext,
    client_addr: SocketAddr,
) -> Response<Body> {
    if state.auth_enabled {
        match auth::authenticate(state, &parts).await {
            Ok(key) => ctx.api_key = Some(key),
            Err(resp) => return resp,
        }
    }

    // Cache: the body is the query, so only POST is keyed.
    let cache_key = match &state.redis {
        Some(_) if cfg.redis.enabled && parts.method == Method::POST => {
            Some(cache::cache_key(&body_bytes))
        }
        _ => None,
    };
    if let (Some(redis), Some(key)) = (&state.redis, &cache_key) {
        if let Some(hit) = cache::lookup(redis, key).await {
            ctx.cache_hit = true;
            return hit;
        }
    }

    let client_key = util::client_key(&parts.headers, client_addr);
    if let Some(denied) = state.limiter.check(&cfg.ratelimit, &client_key).await {
        return denied;
    }

    if let Some(transformer) = &state.transformer {
        match transformer.apply_request(&cfg.transform, &mut parts, body_bytes) {
            Ok(rewritten) => body_bytes = rewritten,
            Err(resp) => return resp,
        }
    }

    let resp = state.dispatcher.dispatch(parts, body_bytes).await;

    let resp = match &state.transformer {
        Some(transformer) => transformer.apply_response(&cfg.transform, resp).await,
        None => resp,
    };

    match (&state.redis, cache_key) {
        (Some(redis), Some(key)) => cache::capture(redis.clone(), key, resp),
        _ => resp,
    }
}

async fn read_request_body(mut body: Body) -> Result<Bytes, Response<Body>> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(chunk) => {
                if buf.len().saturating_add(chunk.len()) > MAX_REQUEST_BODY_BYTES {
                    return Err(AppState::json_error(
                        http::StatusCode::PAYLOAD_TOO_LARGE,
                        "request body too large",
                        "body_too_large",
                    ));
                }
                buf.extend_from_slice(&chunk);
            }
            Err(_) => {
                return Err(AppState::json_error(
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to read body",
                    "body_read_error",
                ));
            }
        }
    }
    Ok(Bytes::from(buf))
}

/// Bytes observed by a response tee. `truncated` means capture stopped (size
/// ceiling or client disconnect) and the bytes must not be trusted as a
/// complete response.
pub struct CapturedBody {
    pub bytes: Bytes,
    pub truncated: bool,
}

/// Streams a response body through to the client while accumulating a copy
/// up to `cap` bytes. The receiver resolves once the body finishes.
pub fn tee_response(
    resp: Response<Body>,
    cap: usize,
) -> (Response<Body>, tokio::sync::oneshot::Receiver<CapturedBody>) {
    let (parts, mut body) = resp.into_parts();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(32);
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = body.data().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(_) => {
                    truncated = true;
                    break;
                }
            };
            if !truncated {
                if buf.len().saturating_add(chunk.len()) > cap {
                    truncated = true;
                    buf.clear();
                } else {
                    buf.extend_from_slice(&chunk);
                }
            }
            if tx.send(Ok(chunk)).await.is_err() {
                // Client went away mid-stream; the copy is incomplete.
                truncated = true;
                break;
            }
        }
        let _ = done_tx.send(CapturedBody {
            bytes: Bytes::from(buf),
            truncated,
        });
    });

    (
        Response::from_parts(parts, Body::wrap_stream(ReceiverStream::new(rx))),
        done_rx,
    )
}

/// Result of buffering a body with a ceiling.
pub enum Buffered {
    Complete(Bytes),
    /// Ceiling exceeded: the prefix re-chained with the rest of the stream.
    Overflow(Body),
}

/// Reads a body fully up to `cap` bytes. On overflow the already-read prefix
/// is replayed ahead of the remaining stream so nothing is lost.
pub async fn buffer_body(mut body: Body, cap: usize) -> Buffered {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            // Mid-body stream error: forward what we have.
            Err(_) => return Buffered::Complete(Bytes::from(buf)),
        };
        if buf.len().saturating_add(chunk.len()) > cap {
            let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(32);
            tokio::spawn(async move {
                if !buf.is_empty() && tx.send(Ok(Bytes::from(buf))).await.is_err() {
                    return;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
                while let Some(chunk) = body.data().await {
                    match chunk {
                        Ok(chunk) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
            return Buffered::Overflow(Body::wrap_stream(ReceiverStream::new(rx)));
        }
        buf.extend_from_slice(&chunk);
    }
    Buffered::Complete(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_body_roundtrips() {
        let body = Body::from("hello body");
        let bytes = read_request_body(body).await.unwrap();
        assert_eq!(&bytes[..], b"hello body");
    }

    #[tokio::test]
    async fn oversized_request_body_is_rejected() {
        let big = vec![0u8; MAX_REQUEST_BODY_BYTES + 1];
        let resp = read_request_body(Body::from(big)).await.unwrap_err();
        assert_eq!(resp.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn tee_preserves_the_client_stream() {
        let resp = Response::new(Body::from("payload bytes"));
        let (resp, captured) = tee_response(resp, 1024);
        let client_view = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&client_view[..], b"payload bytes");

        let captured = captured.await.unwrap();
        assert!(!captured.truncated);
        assert_eq!(captured.bytes, client_view);
    }

    #[tokio::test]
    async fn tee_truncates_past_the_ceiling_without_breaking_the_stream() {
        let resp = Response::new(Body::from(vec![7u8; 100]));
        let (resp, captured) = tee_response(resp, 10);
        let client_view = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(client_view.len(), 100);

        let captured = captured.await.unwrap();
        assert!(captured.truncated);
        assert!(captured.bytes.is_empty());
    }

    #[tokio::test]
    async fn buffer_body_completes_under_cap() {
        match buffer_body(Body::from("short"), 1024).await {
            Buffered::Complete(bytes) => assert_eq!(&bytes[..], b"short"),
            Buffered::Overflow(_) => panic!("unexpected overflow"),
        }
    }

    #[tokio::test]
    async fn buffer_body_overflow_replays_everything() {
        let payload = vec![3u8; 4096];
        match buffer_body(Body::from(payload.clone()), 16).await {
            Buffered::Complete(_) => panic!("expected overflow"),
            Buffered::Overflow(body) => {
                let all = hyper::body::to_bytes(body).await.unwrap();
                assert_eq!(&all[..], &payload[..]);
            }
        }
    }
}
