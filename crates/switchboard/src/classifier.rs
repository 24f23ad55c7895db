//! Intent classification.
//!
//! Calls a small router model over the recent user turns and maps its reply
//! to a tier. The contract is total: every error path degrades to a tier and
//! a trace event, never an error to the caller.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{AppConfig, DisabledTierPolicy, Tier};
use crate::http::HttpClientPool;
use crate::trace::{Stage, TraceRecorder, TraceStatus};

/// How many trailing user turns feed the router prompt.
const HISTORY_TURNS: usize = 3;

/// Generation budget for the router call.
const ROUTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Tier reported when the router reply cannot be parsed or the call fails.
const FALLBACK_TIER: Tier = Tier::T2;

pub struct IntentClassifier {
    clients: Arc<HttpClientPool>,
}

impl IntentClassifier {
    pub fn new(clients: Arc<HttpClientPool>) -> Self {
        Self { clients }
    }

    /// Classify the request into a tier. Never fails.
    pub async fn classify(
        &self,
        config: &AppConfig,
        messages: &[Value],
        trace: &TraceRecorder,
    ) -> Tier {
        if !config.router.enabled {
            return match config.router.disabled_tier_policy {
                DisabledTierPolicy::FixedT1 => Tier::T1,
                DisabledTierPolicy::LegacyRandom => *Tier::ALL
                    .choose(&mut rand::thread_rng())
                    .unwrap_or(&Tier::T1),
            };
        }

        trace.mark(Stage::RouterStart, TraceStatus::Info);
        match self.call_router(config, messages).await {
            Ok(reply) => match parse_tier(&reply) {
                Some(tier) => {
                    trace.record(
                        Stage::RouterEnd,
                        TraceStatus::Success,
                        Some(&config.router.model),
                        None,
                        Some(tier.as_str().to_string()),
                        0,
                    );
                    tier
                }
                None => {
                    debug!("router reply had no tier label: {reply:?}");
                    trace.record(
                        Stage::RouterEnd,
                        TraceStatus::Info,
                        Some(&config.router.model),
                        None,
                        Some(format!("unrecognized reply, defaulting to {FALLBACK_TIER}")),
                        0,
                    );
                    FALLBACK_TIER
                }
            },
            Err(reason) => {
                trace.record(
                    Stage::RouterFail,
                    TraceStatus::Fail,
                    Some(&config.router.model),
                    None,
                    Some(reason),
                    0,
                );
                FALLBACK_TIER
            }
        }
    }

    async fn call_router(&self, config: &AppConfig, messages: &[Value]) -> Result<String, String> {
        let history = recent_user_history(messages, HISTORY_TURNS);
        let prompt = config.router.prompt_template.replace("{history}", &history);

        let client = self.clients.get(config.router.verify_ssl);
        let request = client
            .post(format!(
                "{}/chat/completions",
                config.router.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&config.router.api_key)
            .json(&json!({
                "model": config.router.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": 10,
                "temperature": 0.0,
                "stream": false,
            }));

        let response = tokio::time::timeout(ROUTER_TIMEOUT, request.send())
            .await
            .map_err(|_| "router call timed out".to_string())?
            .map_err(|e| format!("router call failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("router returned HTTP {}", response.status()));
        }

        let body: Value = tokio::time::timeout(ROUTER_TIMEOUT, response.json())
            .await
            .map_err(|_| "router body timed out".to_string())?
            .map_err(|e| format!("router body unreadable: {e}"))?;

        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "router reply had no content".to_string())
    }
}

/// First `t1`/`t2`/`t3` label occurring in the reply, case-insensitive.
fn parse_tier(reply: &str) -> Option<Tier> {
    let lower = reply.trim().to_lowercase();
    Tier::ALL
        .iter()
        .filter_map(|tier| lower.find(tier.as_str()).map(|at| (at, *tier)))
        .min_by_key(|(at, _)| *at)
        .map(|(_, tier)| tier)
}

fn recent_user_history(messages: &[Value], turns: usize) -> String {
    let user_turns: Vec<String> = messages
        .iter()
        .filter(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .filter_map(message_text)
        .collect();
    user_turns
        .iter()
        .rev()
        .take(turns)
        .rev()
        .map(|text| format!("User: {text}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plain text of a chat message, flattening part arrays.
pub fn message_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(parts)) => {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn router_config(base_url: &str, enabled: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.router.enabled = enabled;
        config.router.base_url = base_url.to_string();
        config.router.model = "router-mini".to_string();
        config
    }

    fn user(text: &str) -> Value {
        json!({"role": "user", "content": text})
    }

    #[test]
    fn test_parse_tier_first_occurrence_wins() {
        assert_eq!(parse_tier("T2"), Some(Tier::T2));
        assert_eq!(parse_tier("  t3\n"), Some(Tier::T3));
        assert_eq!(parse_tier("the answer is T1, not T3"), Some(Tier::T1));
        assert_eq!(parse_tier("no label here"), None);
    }

    #[test]
    fn test_history_takes_last_user_turns() {
        let messages = vec![
            user("one"),
            json!({"role": "assistant", "content": "ack"}),
            user("two"),
            user("three"),
            user("four"),
        ];
        let history = recent_user_history(&messages, 3);
        assert_eq!(history, "User: two\nUser: three\nUser: four");
    }

    #[tokio::test]
    async fn test_disabled_router_is_fixed_t1() {
        let classifier = IntentClassifier::new(Arc::new(HttpClientPool::new().unwrap()));
        let config = router_config("http://unused", false);
        let trace = TraceRecorder::new(Uuid::new_v4());
        let tier = classifier.classify(&config, &[user("hi")], &trace).await;
        assert_eq!(tier, Tier::T1);
        assert!(trace.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_router_reply_maps_to_tier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"model": "router-mini", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "T3"}}]
            })))
            .mount(&server)
            .await;

        let classifier = IntentClassifier::new(Arc::new(HttpClientPool::new().unwrap()));
        let config = router_config(&server.uri(), true);
        let trace = TraceRecorder::new(Uuid::new_v4());
        let tier = classifier.classify(&config, &[user("do it all")], &trace).await;
        assert_eq!(tier, Tier::T3);

        let events = trace.snapshot();
        assert_eq!(events[0].stage, Stage::RouterStart);
        assert_eq!(events[1].stage, Stage::RouterEnd);
        assert_eq!(events[1].status, TraceStatus::Success);
    }

    #[tokio::test]
    async fn test_router_error_falls_back_to_t2() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let classifier = IntentClassifier::new(Arc::new(HttpClientPool::new().unwrap()));
        let config = router_config(&server.uri(), true);
        let trace = TraceRecorder::new(Uuid::new_v4());
        let tier = classifier.classify(&config, &[user("hi")], &trace).await;
        assert_eq!(tier, Tier::T2);

        let events = trace.snapshot();
        assert_eq!(events.last().unwrap().stage, Stage::RouterFail);
        assert_eq!(events.last().unwrap().status, TraceStatus::Fail);
    }

    #[tokio::test]
    async fn test_unrecognized_reply_falls_back_to_t2() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "maybe?"}}]
            })))
            .mount(&server)
            .await;

        let classifier = IntentClassifier::new(Arc::new(HttpClientPool::new().unwrap()));
        let config = router_config(&server.uri(), true);
        let trace = TraceRecorder::new(Uuid::new_v4());
        let tier = classifier.classify(&config, &[user("hi")], &trace).await;
        assert_eq!(tier, Tier::T2);
        assert_eq!(trace.snapshot().last().unwrap().stage, Stage::RouterEnd);
    }
}
