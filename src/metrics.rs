
use hyper::{Body, Response};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_histogram, Counter, Encoder, Histogram, HistogramOpts, TextEncoder,
};

lazy_static! {
    pub static ref CACHE_HITS: Counter = register_counter!(
        "relay_cache_hits_total",
        "Number of cache hits served from the shared store"
    )
    .unwrap();
    pub static ref CACHE_MISSES: Counter = register_counter!(
        "relay_cache_misses_total",
        "Number of cache misses that required an upstream fetch"
    )
    .unwrap();
    pub static ref REQUEST_TOKENS: Histogram = register_histogram!(HistogramOpts::new(
        "relay_request_tokens",
        "Token count per request payload"
    )
    .buckets(vec![
        1.0, 10.0, 50.0, 100.0, 500.0, 1_000.0, 2_000.0, 4_000.0, 8_000.0, 16_000.0
    ]))
    .unwrap();
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(HistogramOpts::new(
        "relay_upstream_latency_seconds",
        "Time spent proxying requests to upstream targets"
    ))
    .unwrap();
}

/// Text exposition of the default registry for the `/metrics` scrape endpoint.
pub fn render() -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %e, "metrics encode failed");
        return Response::builder()
            .status(http::StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty()));
    }
    Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buf))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
