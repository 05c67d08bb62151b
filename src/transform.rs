
use crate::config::{RuleKind, TransformConfig, TransformRule};
use crate::pipeline;
use crate::state::AppState;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Method, Response};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

const MASKED: &str = "***MASKED***";

/// Largest JSON response body the transformer will buffer for rewriting.
/// Anything larger streams through untouched.
const MAX_RESPONSE_REWRITE_BYTES: usize = 4 * 1024 * 1024;

lazy_static! {
    static ref SENSITIVE_PATTERNS: Vec<Regex> = vec![
        // email
        Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap(),
        // US phone
        Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap(),
        // SSN
        Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
        // credit-card-like 16 digits
        Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap(),
        // API-key-like long alphanumeric run
        Regex::new(r"\b[a-zA-Z0-9_-]{32,}\b").unwrap(),
    ];
}

/// Request/response transformer. Path-filter patterns are compiled once at
/// startup; header mutations, body rules and the masking flag are read from
/// the live snapshot on every request.
pub struct Transformer {
    allowed: Vec<Regex>,
    blocked: Vec<Regex>,
}

impl Transformer {
    pub fn new(cfg: &TransformConfig) -> anyhow::Result<Self> {
        Ok(Self {
            allowed: compile_patterns(&cfg.allowed_paths)?,
            blocked: compile_patterns(&cfg.blocked_paths)?,
        })
    }

    /// Request phase: path filter, header mutation, body rules, sensitive
    /// masking, Content-Length rewrite. Returns the (possibly rewritten)
    /// body, or the 403 short-circuit response for filtered paths.
    pub fn apply_request(
        &self,
        cfg: &TransformConfig,
        parts: &mut http::request::Parts,
        body: Bytes,
    ) -> Result<Bytes, Response<Body>> {
        if !self.path_allowed(parts.uri.path()) {
            return Err(AppState::json_error(
                http::StatusCode::FORBIDDEN,
                "path not allowed",
                "path_blocked",
            ));
        }

        apply_headers(cfg, &mut parts.headers);

        if parts.method != Method::POST && parts.method != Method::PUT {
            return Ok(body);
        }
        if cfg.request_rules.is_empty() && !cfg.mask_sensitive_data {
            return Ok(body);
        }

        // Only JSON objects are rewritten; anything else passes through.
        let Ok(mut data) = serde_json::from_slice::<Value>(&body) else {
            return Ok(body);
        };
        if !data.is_object() {
            return Ok(body);
        }

        for rule in &cfg.request_rules {
            apply_rule(&mut data, rule);
        }
        if cfg.mask_sensitive_data {
            mask_sensitive(&mut data);
        }

        let Ok(rewritten) = serde_json::to_vec(&data) else {
            return Ok(body);
        };
        if let Ok(len) = HeaderValue::from_str(&rewritten.len().to_string()) {
            parts.headers.insert(CONTENT_LENGTH, len);
        }
        Ok(Bytes::from(rewritten))
    }

    /// Response phase: JSON responses get response rules + sensitive masking
    /// applied; parse or marshal failures pass the original bytes through.
    pub async fn apply_response(
        &self,
        cfg: &TransformConfig,
        resp: Response<Body>,
    ) -> Response<Body> {
        if cfg.response_rules.is_empty() && !cfg.mask_sensitive_data {
            return resp;
        }
        let is_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        if !is_json {
            return resp;
        }

        let (mut parts, body) = resp.into_parts();
        let buffered = match pipeline::buffer_body(body, MAX_RESPONSE_REWRITE_BYTES).await {
            pipeline::Buffered::Complete(bytes) => bytes,
            // Too large to rewrite: reassemble the stream untouched.
            pipeline::Buffered::Overflow(resume) => {
                return Response::from_parts(parts, resume);
            }
        };

        let rewritten = rewrite_json(cfg, &buffered);
        let out = match rewritten {
            Some(bytes) => {
                if let Ok(len) = HeaderValue::from_str(&bytes.len().to_string()) {
                    parts.headers.insert(CONTENT_LENGTH, len);
                }
                bytes
            }
            None => buffered,
        };
        Response::from_parts(parts, Body::from(out))
    }

    fn path_allowed(&self, path: &str) -> bool {
        if self.allowed.is_empty() && self.blocked.is_empty() {
            return true;
        }
        if self.blocked.iter().any(|re| re.is_match(path)) {
            return false;
        }
        if !self.allowed.is_empty() {
            return self.allowed.iter().any(|re| re.is_match(path));
        }
        true
    }
}

fn rewrite_json(cfg: &TransformConfig, body: &Bytes) -> Option<Bytes> {
    let mut data: Value = serde_json::from_slice(body).ok()?;
    if !data.is_object() {
        return None;
    }
    for rule in &cfg.response_rules {
        apply_rule(&mut data, rule);
    }
    if cfg.mask_sensitive_data {
        mask_sensitive(&mut data);
    }
    serde_json::to_vec(&data).ok().map(Bytes::from)
}

fn compile_patterns(patterns: &[String]) -> anyhow::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| anyhow::anyhow!("invalid path pattern {p:?}: {e}")))
        .collect()
}

fn apply_headers(cfg: &TransformConfig, headers: &mut hyper::HeaderMap) {
    for name in &cfg.remove_headers {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }
    for (name, value) in &cfg.add_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    for (name, value) in &cfg.replace_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

fn apply_rule(data: &mut Value, rule: &TransformRule) {
    match rule.kind {
        RuleKind::Add => {
            set_path(data, &rule.path, rule.value.clone().unwrap_or(Value::Null));
        }
        RuleKind::Remove => remove_path(data, &rule.path),
        RuleKind::Replace => {
            if resolve(data, &rule.path).map(|v| !v.is_null()).unwrap_or(false) {
                set_path(data, &rule.path, rule.value.clone().unwrap_or(Value::Null));
            }
        }
        RuleKind::Mask => {
            let masked = match resolve(data, &rule.path) {
                Some(Value::String(s)) => Some(mask_string(s, rule.pattern.as_deref())),
                _ => None,
            };
            if let Some(masked) = masked {
                set_path(data, &rule.path, Value::String(masked));
            }
        }
    }
}

/// Walks a dotted path. Numeric segments index into arrays.
fn resolve<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets `value` at `path`, creating intermediate objects for missing keys.
/// Array segments must already exist; out-of-range indexes are a no-op.
fn set_path(data: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, ancestors)) = parts.split_last() else {
        return;
    };

    let mut current = data;
    for part in ancestors {
        match current {
            Value::Object(map) => {
                current = map
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
            Value::Array(items) => {
                let Some(next) = part.parse::<usize>().ok().and_then(|i| items.get_mut(i)) else {
                    return;
                };
                current = next;
            }
            _ => return,
        }
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        Value::Array(items) => {
            if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *slot = value;
            }
        }
        _ => {}
    }
}

fn remove_path(data: &mut Value, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, ancestors)) = parts.split_last() else {
        return;
    };

    let mut current = data;
    for part in ancestors {
        match current {
            Value::Object(map) => match map.get_mut(*part) {
                Some(next) => current = next,
                None => return,
            },
            Value::Array(items) => {
                let Some(next) = part.parse::<usize>().ok().and_then(|i| items.get_mut(i)) else {
                    return;
                };
                current = next;
            }
            _ => return,
        }
    }

    match current {
        Value::Object(map) => {
            map.remove(*last);
        }
        Value::Array(items) => {
            if let Some(i) = last.parse::<usize>().ok().filter(|&i| i < items.len()) {
                items.remove(i);
            }
        }
        _ => {}
    }
}

fn mask_string(s: &str, pattern: Option<&str>) -> String {
    match pattern.filter(|p| !p.is_empty()) {
        None => {
            // Reveal first and last 4 characters of long values.
            if s.chars().count() <= 8 {
                "***".to_string()
            } else {
                let chars: Vec<char> = s.chars().collect();
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("{head}***{tail}")
            }
        }
        Some(pattern) => match Regex::new(pattern) {
            Ok(re) => re.replace_all(s, "***").to_string(),
            Err(_) => s.to_string(),
        },
    }
}

/// Masks values under sensitive key names and scrubs string leaves matching
/// the fixed pattern set. Key-name matches do not recurse into the subtree.
fn mask_sensitive(data: &mut Value) {
    match data {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                let key = key.to_ascii_lowercase();
                if key.contains("password")
                    || key.contains("secret")
                    || key.contains("token")
                    || key.contains("key")
                {
                    *value = Value::String(MASKED.to_string());
                    continue;
                }
                mask_sensitive(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_sensitive(item);
            }
        }
        Value::String(s) => {
            for re in SENSITIVE_PATTERNS.iter() {
                if re.is_match(s) {
                    *s = re.replace_all(s, MASKED).to_string();
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(kind: RuleKind, path: &str, value: Option<Value>, pattern: Option<&str>) -> TransformRule {
        TransformRule {
            kind,
            path: path.to_string(),
            value,
            pattern: pattern.map(str::to_string),
        }
    }

    fn transformer(allowed: &[&str], blocked: &[&str]) -> Transformer {
        let cfg = TransformConfig {
            allowed_paths: allowed.iter().map(|s| s.to_string()).collect(),
            blocked_paths: blocked.iter().map(|s| s.to_string()).collect(),
            ..TransformConfig::default()
        };
        Transformer::new(&cfg).unwrap()
    }

    #[test]
    fn empty_filters_admit_everything() {
        assert!(transformer(&[], &[]).path_allowed("/anything"));
    }

    #[test]
    fn blocked_wins_over_allowed() {
        let t = transformer(&["^/v1/.*"], &["^/v1/internal"]);
        assert!(t.path_allowed("/v1/chat/completions"));
        assert!(!t.path_allowed("/v1/internal/debug"));
    }

    #[test]
    fn allowed_list_excludes_unlisted_paths() {
        let t = transformer(&["^/v1/.*"], &[]);
        assert!(!t.path_allowed("/v2/other"));
    }

    #[test]
    fn header_mutation_applies_in_order() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("x-debug", HeaderValue::from_static("1"));
        headers.insert("x-env", HeaderValue::from_static("dev"));

        let mut cfg = TransformConfig::default();
        cfg.remove_headers.push("x-debug".to_string());
        cfg.add_headers.insert("x-extra".to_string(), "a".to_string());
        cfg.replace_headers.insert("x-env".to_string(), "prod".to_string());

        apply_headers(&cfg, &mut headers);
        assert!(headers.get("x-debug").is_none());
        assert_eq!(headers.get("x-extra").unwrap(), "a");
        assert_eq!(headers.get("x-env").unwrap(), "prod");
    }

    #[test]
    fn add_creates_intermediate_objects() {
        let mut data = json!({});
        apply_rule(&mut data, &rule(RuleKind::Add, "a.b.c", Some(json!(7)), None));
        assert_eq!(data, json!({"a": {"b": {"c": 7}}}));
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let mut data = json!({"a": 1});
        apply_rule(&mut data, &rule(RuleKind::Remove, "b.c", None, None));
        assert_eq!(data, json!({"a": 1}));
        apply_rule(&mut data, &rule(RuleKind::Remove, "a", None, None));
        assert_eq!(data, json!({}));
    }

    #[test]
    fn replace_only_touches_non_null_values() {
        let mut data = json!({"present": "x", "nothing": null});
        apply_rule(&mut data, &rule(RuleKind::Replace, "present", Some(json!("y")), None));
        apply_rule(&mut data, &rule(RuleKind::Replace, "nothing", Some(json!("y")), None));
        apply_rule(&mut data, &rule(RuleKind::Replace, "absent", Some(json!("y")), None));
        assert_eq!(data, json!({"present": "y", "nothing": null}));
    }

    #[test]
    fn mask_descends_array_indexes() {
        let mut data = json!({"messages": [{"content": "abcd1234efgh"}]});
        apply_rule(&mut data, &rule(RuleKind::Mask, "messages.0.content", None, None));
        assert_eq!(data["messages"][0]["content"], "abcd***efgh");
    }

    #[test]
    fn default_mask_collapses_short_strings() {
        assert_eq!(mask_string("12345678", None), "***");
        assert_eq!(mask_string("123456789", None), "1234***6789");
    }

    #[test]
    fn pattern_mask_replaces_occurrences() {
        assert_eq!(mask_string("id-123 and id-456", Some(r"id-\d+")), "*** and ***");
        // Invalid patterns leave the value alone.
        assert_eq!(mask_string("x", Some("([")), "x");
    }

    #[test]
    fn sensitive_keys_are_masked_without_recursion() {
        let mut data = json!({
            "api_key": "sk_live_abc",
            "password": {"plain": "hunter2"},
            "safe": "ok"
        });
        mask_sensitive(&mut data);
        assert_eq!(data["api_key"], MASKED);
        assert_eq!(data["password"], MASKED);
        assert_eq!(data["safe"], "ok");
    }

    #[test]
    fn sensitive_string_leaves_are_scrubbed() {
        let mut data = json!({
            "messages": [
                {"content": "mail me at alice@example.com"},
                {"content": "card 4111-1111-1111-1111"},
                {"content": "ssn 123-45-6789"},
                {"content": "call 555-123-4567"},
                {"content": "k: abcdefghijklmnopqrstuvwxyz0123456789"}
            ]
        });
        mask_sensitive(&mut data);
        for item in data["messages"].as_array().unwrap() {
            let content = item["content"].as_str().unwrap();
            assert!(content.contains(MASKED), "unmasked: {content}");
            assert!(!content.contains("alice@example.com"));
            assert!(!content.contains("4111-1111-1111-1111"));
        }
    }

    #[test]
    fn request_body_passthrough_for_non_json() {
        let t = transformer(&[], &[]);
        let cfg = TransformConfig {
            mask_sensitive_data: true,
            ..TransformConfig::default()
        };
        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();
        let body = Bytes::from_static(b"not json at all");
        let out = t.apply_request(&cfg, &mut parts, body.clone()).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn request_body_rules_rewrite_and_content_length() {
        let t = transformer(&[], &[]);
        let cfg = TransformConfig {
            request_rules: vec![rule(RuleKind::Mask, "messages.0.content", None, None)],
            ..TransformConfig::default()
        };
        let req = http::Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .header(CONTENT_LENGTH, "999")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();
        let body = Bytes::from(
            serde_json::to_vec(&json!({"messages": [{"content": "abcd1234efgh"}]})).unwrap(),
        );
        let out = t.apply_request(&cfg, &mut parts, body).unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["messages"][0]["content"], "abcd***efgh");
        assert_eq!(
            parts.headers.get(CONTENT_LENGTH).unwrap().to_str().unwrap(),
            out.len().to_string()
        );
    }

    #[test]
    fn blocked_path_short_circuits_with_403() {
        let t = transformer(&[], &["^/internal"]);
        let cfg = TransformConfig::default();
        let req = http::Request::builder()
            .method(Method::GET)
            .uri("/internal/debug")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();
        let err = t
            .apply_request(&cfg, &mut parts, Bytes::new())
            .expect_err("blocked path must short-circuit");
        assert_eq!(err.status(), http::StatusCode::FORBIDDEN);
    }
}
