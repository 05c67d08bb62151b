
use crate::config::Config;
use crate::pipeline::RequestContext;
use crate::{metrics, tokens};
use bytes::Bytes;
use serde::Deserialize;

#[derive(Deserialize)]
struct ChatRequest {
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Cost tagger: parses the request payload once and attaches the token count
/// and estimated USD cost to the request context. Non-JSON bodies and
/// requests outside the pricing map pass through untagged.
pub fn tag_request(cfg: &Config, body: &Bytes, ctx: &mut RequestContext) {
    if body.is_empty() || cfg.models.is_empty() {
        return;
    }
    let Ok(payload) = serde_json::from_slice::<ChatRequest>(body) else {
        return;
    };

    let text: String = payload
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    let count = tokens::count_tokens(&payload.model, &text);
    let price_per_1k = cfg.models.get(&payload.model).copied().unwrap_or(0.0);
    let cost = (count as f64 / 1000.0) * price_per_1k;

    ctx.token_count = Some(count);
    ctx.cost_usd = Some(cost);
    metrics::REQUEST_TOKENS.observe(count as f64);
    tracing::debug!(
        model = %payload.model,
        tokens = count,
        cost_usd = cost,
        "tagged request cost"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn cfg_with_pricing() -> Config {
        let mut models = BTreeMap::new();
        models.insert("gpt-4".to_string(), 0.03);
        Config {
            models,
            ..Config::default()
        }
    }

    #[test]
    fn tags_token_count_and_cost() {
        let cfg = cfg_with_pricing();
        let body = Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .unwrap(),
        );
        let mut ctx = RequestContext::default();
        tag_request(&cfg, &body, &mut ctx);

        let count = ctx.token_count.expect("token count");
        assert!(count > 0);
        assert_eq!(ctx.cost_usd, Some(count as f64 / 1000.0 * 0.03));
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let cfg = cfg_with_pricing();
        let body = Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "model": "other",
                "messages": [{"content": "hello there"}]
            }))
            .unwrap(),
        );
        let mut ctx = RequestContext::default();
        tag_request(&cfg, &body, &mut ctx);
        assert!(ctx.token_count.is_some());
        assert_eq!(ctx.cost_usd, Some(0.0));
    }

    #[test]
    fn non_json_bodies_skip_tagging() {
        let cfg = cfg_with_pricing();
        let mut ctx = RequestContext::default();
        tag_request(&cfg, &Bytes::from_static(b"plain text"), &mut ctx);
        assert!(ctx.token_count.is_none());
        assert!(ctx.cost_usd.is_none());
    }

    #[test]
    fn empty_pricing_map_skips_tagging() {
        let cfg = Config::default();
        let body = Bytes::from_static(b"{\"model\":\"gpt-4\",\"messages\":[]}");
        let mut ctx = RequestContext::default();
        tag_request(&cfg, &body, &mut ctx);
        assert!(ctx.token_count.is_none());
    }
}
