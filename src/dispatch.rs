
use crate::breaker::{CircuitBreaker, State};
use crate::config::Config;
use crate::metrics;
use crate::state::AppState;
use crate::util::now_ms;
use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use hyper::client::HttpConnector;
use hyper::header::{
    HeaderValue, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Body, Client, Method, Request, Response, Uri};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(5);
const LATENCY_WINDOW: usize = 100;
const DEFAULT_LATENCY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Weighted,
    LeastLatency,
    Random,
}

impl Strategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "weighted" => Strategy::Weighted,
            "least-latency" => Strategy::LeastLatency,
            "random" => Strategy::Random,
            _ => Strategy::RoundRobin,
        }
    }
}

/// One upstream replica: parsed origin, selection weight, health flag,
/// breaker and latency window.
pub struct Target {
    pub url: String,
    scheme: Scheme,
    authority: Authority,
    pub weight: usize,
    pub healthy: AtomicBool,
    pub breaker: CircuitBreaker,
    latency: LatencyTracker,
    pub last_check_ms: AtomicU64,
}

impl Target {
    fn parse(url: &str, weight: usize) -> anyhow::Result<Arc<Self>> {
        let (scheme, authority) = parse_origin(url)?;
        Ok(Arc::new(Target {
            url: url.to_string(),
            scheme,
            authority,
            weight: weight.max(1),
            healthy: AtomicBool::new(true),
            breaker: CircuitBreaker::new(),
            latency: LatencyTracker::new(LATENCY_WINDOW),
            last_check_ms: AtomicU64::new(0),
        }))
    }

    #[inline]
    fn selectable(&self) -> bool {
        self.healthy.load(Ordering::Relaxed) && self.breaker.state() != State::Open
    }

    pub fn average_latency(&self) -> Duration {
        self.latency.average()
    }
}

/// Bounded FIFO window of upstream latency samples.
pub struct LatencyTracker {
    samples: Mutex<VecDeque<Duration>>,
    cap: usize,
}

impl LatencyTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    pub fn add(&self, sample: Duration) {
        let mut samples = self.samples.lock().unwrap();
        while samples.len() >= self.cap {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Average over the window; an empty window reads as the default so new
    /// targets are neither favored nor starved under least-latency.
    pub fn average(&self) -> Duration {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return DEFAULT_LATENCY;
        }
        let total: Duration = samples.iter().sum();
        total / samples.len() as u32
    }
}

#[derive(Debug, serde::Serialize)]
pub struct TargetStatus {
    pub url: String,
    pub weight: usize,
    pub healthy: bool,
    pub breaker_state: String,
    pub avg_latency_ms: u64,
    pub last_check_ms: u64,
}

/// Upstream dispatcher, picked at startup from the snapshot.
pub enum Dispatcher {
    Single(SingleTarget),
    LoadBalanced(LoadBalancer),
}

pub struct SingleTarget {
    client: HttpClient,
    scheme: Scheme,
    authority: Authority,
    breaker: CircuitBreaker,
}

pub struct LoadBalancer {
    client: HttpClient,
    targets: Vec<Arc<Target>>,
    strategy: Strategy,
    rr: AtomicUsize,
}

impl Dispatcher {
    pub fn from_config(cfg: &Config, client: HttpClient) -> anyhow::Result<Self> {
        if cfg.loadbalancer.enabled && !cfg.loadbalancer.targets.is_empty() {
            let mut targets = Vec::with_capacity(cfg.loadbalancer.targets.len());
            for t in &cfg.loadbalancer.targets {
                targets.push(Target::parse(&t.url, t.weight)?);
            }
            let strategy = Strategy::parse(&cfg.loadbalancer.strategy);
            tracing::info!(
                targets = targets.len(),
                strategy = ?strategy,
                "load balancer configured"
            );
            Ok(Dispatcher::LoadBalanced(LoadBalancer {
                client,
                targets,
                strategy,
                rr: AtomicUsize::new(0),
            }))
        } else {
            let (scheme, authority) = parse_origin(&cfg.proxy.target)?;
            tracing::info!(target = %cfg.proxy.target, "single-target proxy configured");
            Ok(Dispatcher::Single(SingleTarget {
                client,
                scheme,
                authority,
                breaker: CircuitBreaker::new(),
            }))
        }
    }

    pub async fn dispatch(&self, parts: http::request::Parts, body: Bytes) -> Response<Body> {
        match self {
            Dispatcher::Single(single) => single.dispatch(parts, body).await,
            Dispatcher::LoadBalanced(lb) => lb.dispatch(parts, body).await,
        }
    }

    /// Snapshot of per-target state for the admin plane.
    pub fn targets_status(&self) -> Vec<TargetStatus> {
        match self {
            Dispatcher::Single(_) => Vec::new(),
            Dispatcher::LoadBalanced(lb) => lb
                .targets
                .iter()
                .map(|t| TargetStatus {
                    url: t.url.clone(),
                    weight: t.weight,
                    healthy: t.healthy.load(Ordering::Relaxed),
                    breaker_state: format!("{:?}", t.breaker.state()),
                    avg_latency_ms: t.average_latency().as_millis() as u64,
                    last_check_ms: t.last_check_ms.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    /// Starts the background health-probe loop for load-balanced targets.
    pub fn spawn_health_probe(&self) {
        let Dispatcher::LoadBalanced(lb) = self else {
            return;
        };
        let targets = lb.targets.clone();
        let client = lb.client.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                tick.tick().await;
                for target in &targets {
                    tokio::spawn(check_health(client.clone(), target.clone()));
                }
            }
        });
    }
}

impl SingleTarget {
    async fn dispatch(&self, parts: http::request::Parts, body: Bytes) -> Response<Body> {
        if self.breaker.try_acquire().is_err() {
            return circuit_open();
        }

        let start = Instant::now();
        let result = forward(&self.client, &self.scheme, &self.authority, parts, body).await;
        metrics::UPSTREAM_LATENCY.observe(start.elapsed().as_secs_f64());

        settle(&self.breaker, result)
    }
}

impl LoadBalancer {
    async fn dispatch(&self, parts: http::request::Parts, body: Bytes) -> Response<Body> {
        let Some(target) = self.select() else {
            return AppState::json_error(
                http::StatusCode::SERVICE_UNAVAILABLE,
                "no healthy backends available",
                "no_backends",
            );
        };

        if target.breaker.try_acquire().is_err() {
            return circuit_open();
        }

        let start = Instant::now();
        let result = forward(&self.client, &target.scheme, &target.authority, parts, body).await;
        let elapsed = start.elapsed();
        target.latency.add(elapsed);
        metrics::UPSTREAM_LATENCY.observe(elapsed.as_secs_f64());

        settle(&target.breaker, result)
    }

    fn select(&self) -> Option<Arc<Target>> {
        let healthy: Vec<Arc<Target>> = self
            .targets
            .iter()
            .filter(|t| t.selectable())
            .cloned()
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let picked = match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.rr.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[idx].clone()
            }
            Strategy::Weighted => {
                let total: usize = healthy.iter().map(|t| t.weight).sum();
                let roll = rand::rng().random_range(0..total);
                weighted_pick(&healthy, roll).clone()
            }
            Strategy::LeastLatency => least_latency_pick(&healthy).clone(),
            Strategy::Random => {
                let idx = rand::rng().random_range(0..healthy.len());
                healthy[idx].clone()
            }
        };
        Some(picked)
    }
}

/// Subtract-walk over the weights; `roll` must be in `[0, total)`.
fn weighted_pick(targets: &[Arc<Target>], roll: usize) -> &Arc<Target> {
    let mut remaining = roll as i64;
    for target in targets {
        remaining -= target.weight as i64;
        if remaining < 0 {
            return target;
        }
    }
    &targets[0]
}

fn least_latency_pick(targets: &[Arc<Target>]) -> &Arc<Target> {
    targets
        .iter()
        .min_by_key(|t| t.average_latency())
        .unwrap_or(&targets[0])
}

async fn forward(
    client: &HttpClient,
    scheme: &Scheme,
    authority: &Authority,
    parts: http::request::Parts,
    body: Bytes,
) -> anyhow::Result<Response<Body>> {
    let pq = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    let mut uri_parts = http::uri::Parts::default();
    uri_parts.scheme = Some(scheme.clone());
    uri_parts.authority = Some(authority.clone());
    uri_parts.path_and_query = Some(pq);
    let uri = Uri::from_parts(uri_parts)?;

    let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name.clone(), value.clone());
    }
    let mut req = builder.body(Body::from(body))?;

    sanitize_hop_headers(req.headers_mut());
    req.headers_mut()
        .insert("x-relay", HeaderValue::from_static("True"));

    Ok(client.request(req).await?)
}

/// Applies breaker accounting to the forward outcome. 5xx counts as a
/// failure but the upstream's status is still returned to the client.
fn settle(breaker: &CircuitBreaker, result: anyhow::Result<Response<Body>>) -> Response<Body> {
    match result {
        Ok(resp) if resp.status().is_server_error() => {
            breaker.on_failure();
            resp
        }
        Ok(resp) => {
            breaker.on_success();
            resp
        }
        Err(e) => {
            breaker.on_failure();
            tracing::warn!(error = %e, "upstream request failed");
            AppState::json_error(
                http::StatusCode::BAD_GATEWAY,
                "upstream error",
                "upstream_error",
            )
        }
    }
}

fn circuit_open() -> Response<Body> {
    AppState::json_error(
        http::StatusCode::SERVICE_UNAVAILABLE,
        "service unavailable (circuit open)",
        "circuit_open",
    )
}

async fn check_health(client: HttpClient, target: Arc<Target>) {
    let healthy = probe(&client, &target).await;
    let was = target.healthy.swap(healthy, Ordering::Relaxed);
    target.last_check_ms.store(now_ms(), Ordering::Relaxed);
    if was != healthy {
        if healthy {
            tracing::info!(target = %target.url, "target is healthy again");
        } else {
            tracing::warn!(target = %target.url, "target marked unhealthy");
        }
    }
}

async fn probe(client: &HttpClient, target: &Target) -> bool {
    let uri = match format!("{}://{}/health", target.scheme, target.authority).parse::<Uri>() {
        Ok(uri) => uri,
        Err(_) => return false,
    };
    let req = match Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
    {
        Ok(req) => req,
        Err(_) => return false,
    };

    match tokio::time::timeout(HEALTH_CHECK_DEADLINE, client.request(req)).await {
        // Anything short of a server error counts as alive; 404 just means
        // no health endpoint.
        Ok(Ok(resp)) => resp.status().as_u16() < 500,
        _ => false,
    }
}

fn parse_origin(url: &str) -> anyhow::Result<(Scheme, Authority)> {
    let uri: Uri = url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid target URL {url:?}: {e}"))?;
    let scheme = uri
        .scheme()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("target {url:?} missing scheme"))?;
    let authority = uri
        .authority()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("target {url:?} missing authority"))?;
    Ok((scheme, authority))
}

/// Removes hop-by-hop headers that must not cross the proxy.
#[inline]
pub fn sanitize_hop_headers(headers: &mut hyper::HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove(HOST);
    headers.remove("proxy-connection");
    headers.remove(PROXY_AUTHENTICATE);
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(TE);
    headers.remove(TRAILER);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
    headers.remove("x-admin-key");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str, weight: usize) -> Arc<Target> {
        Target::parse(url, weight).unwrap()
    }

    #[test]
    fn parse_origin_requires_scheme_and_host() {
        assert!(parse_origin("http://backend:9000").is_ok());
        assert!(parse_origin("backend:9000").is_err());
        assert!(parse_origin("/just/a/path").is_err());
    }

    #[test]
    fn weight_is_clamped_to_one() {
        assert_eq!(target("http://a", 0).weight, 1);
        assert_eq!(target("http://a", 7).weight, 7);
    }

    #[test]
    fn weighted_pick_walks_the_weights() {
        let targets = vec![target("http://a", 3), target("http://b", 1)];
        // rolls 0..=2 land on a, roll 3 lands on b
        for roll in 0..3 {
            assert_eq!(weighted_pick(&targets, roll).url, "http://a");
        }
        assert_eq!(weighted_pick(&targets, 3).url, "http://b");
    }

    #[test]
    fn least_latency_prefers_the_fast_target() {
        let fast = target("http://fast", 1);
        let slow = target("http://slow", 1);
        fast.latency.add(Duration::from_millis(10));
        slow.latency.add(Duration::from_millis(500));
        let targets = vec![slow.clone(), fast.clone()];
        assert_eq!(least_latency_pick(&targets).url, "http://fast");
    }

    #[test]
    fn empty_latency_window_reads_as_default() {
        let t = target("http://a", 1);
        assert_eq!(t.average_latency(), DEFAULT_LATENCY);
    }

    #[test]
    fn latency_window_overwrites_oldest() {
        let tracker = LatencyTracker::new(3);
        for ms in [100u64, 200, 300, 400] {
            tracker.add(Duration::from_millis(ms));
        }
        // Window holds 200/300/400 after the first sample fell out.
        assert_eq!(tracker.average(), Duration::from_millis(300));
    }

    #[test]
    fn unhealthy_and_open_targets_are_not_selectable() {
        let t = target("http://a", 1);
        assert!(t.selectable());

        t.healthy.store(false, Ordering::Relaxed);
        assert!(!t.selectable());

        t.healthy.store(true, Ordering::Relaxed);
        for _ in 0..5 {
            t.breaker.on_failure();
        }
        assert!(!t.selectable());
    }

    #[test]
    fn round_robin_starts_at_zero_and_cycles() {
        let client = crate::state::build_http_client();
        let lb = LoadBalancer {
            client,
            targets: vec![target("http://a", 1), target("http://b", 1)],
            strategy: Strategy::RoundRobin,
            rr: AtomicUsize::new(0),
        };
        assert_eq!(lb.select().unwrap().url, "http://a");
        assert_eq!(lb.select().unwrap().url, "http://b");
        assert_eq!(lb.select().unwrap().url, "http://a");
    }

    #[test]
    fn selection_skips_tripped_targets() {
        let client = crate::state::build_http_client();
        let a = target("http://a", 1);
        let b = target("http://b", 1);
        for _ in 0..5 {
            a.breaker.on_failure();
        }
        let lb = LoadBalancer {
            client,
            targets: vec![a, b],
            strategy: Strategy::RoundRobin,
            rr: AtomicUsize::new(0),
        };
        for _ in 0..4 {
            assert_eq!(lb.select().unwrap().url, "http://b");
        }
    }

    #[test]
    fn no_selectable_targets_yields_none() {
        let client = crate::state::build_http_client();
        let a = target("http://a", 1);
        a.healthy.store(false, Ordering::Relaxed);
        let lb = LoadBalancer {
            client,
            targets: vec![a],
            strategy: Strategy::Random,
            rr: AtomicUsize::new(0),
        };
        assert!(lb.select().is_none());
    }

    #[test]
    fn strategy_parsing_defaults_to_round_robin() {
        assert_eq!(Strategy::parse("weighted"), Strategy::Weighted);
        assert_eq!(Strategy::parse("least-latency"), Strategy::LeastLatency);
        assert_eq!(Strategy::parse("random"), Strategy::Random);
        assert_eq!(Strategy::parse(""), Strategy::RoundRobin);
        assert_eq!(Strategy::parse("unknown"), Strategy::RoundRobin);
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(HOST, HeaderValue::from_static("relay.local"));
        headers.insert("x-admin-key", HeaderValue::from_static("secret"));
        headers.insert("x-keep", HeaderValue::from_static("yes"));
        sanitize_hop_headers(&mut headers);
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get(HOST).is_none());
        assert!(headers.get("x-admin-key").is_none());
        assert_eq!(headers.get("x-keep").unwrap(), "yes");
    }
}
