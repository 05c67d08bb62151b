
use hyper::HeaderMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Very small query parser for `?a=b&c=d`.
/// Returns value for `key` if present. No percent-decoding (filter values are expected to be simple).
#[inline]
pub fn query_get<'a>(uri: &'a http::Uri, key: &'a str) -> Option<&'a str> {
    let q = uri.query()?;
    for part in q.split('&') {
        let mut it = part.splitn(2, '=');
        let k = it.next()?;
        if k == key {
            return it.next();
        }
    }
    None
}

/// Stable per-client identifier for rate limiting: first `X-Forwarded-For`
/// hop if present, else the peer IP.
pub fn client_key(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    if let Some(fwd) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = fwd.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    remote_addr.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn addr() -> SocketAddr {
        "10.1.2.3:50000".parse().unwrap()
    }

    #[test]
    fn client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_key(&headers, addr()), "203.0.113.7");
    }

    #[test]
    fn client_key_falls_back_to_peer_ip() {
        assert_eq!(client_key(&HeaderMap::new(), addr()), "10.1.2.3");
    }

    #[test]
    fn query_get_finds_values() {
        let uri: http::Uri = "/admin/api/v1/logs?user_id=u1&limit=10".parse().unwrap();
        assert_eq!(query_get(&uri, "user_id"), Some("u1"));
        assert_eq!(query_get(&uri, "limit"), Some("10"));
        assert_eq!(query_get(&uri, "model"), None);
    }
}
