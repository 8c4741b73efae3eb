use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::json_extract::extract_json;

/// Requested output shape for a completion call.
#[derive(Debug, Clone)]
pub enum OutputContract {
    /// Free text, returned verbatim.
    Text,
    /// A JSON object, loosely requested via `json_object` response format.
    JsonObject,
    /// A JSON object under a named schema; strict mode is preferred and
    /// downgraded to `json_object` if the backend rejects it.
    JsonSchema { name: &'static str, schema: Value },
}

#[derive(Debug, Clone)]
pub enum GatewayReply {
    Text(String),
    Json(Value),
}

impl GatewayReply {
    pub fn into_json(self) -> Option<Value> {
        match self {
            GatewayReply::Json(v) => Some(v),
            GatewayReply::Text(_) => None,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            GatewayReply::Text(t) => t,
            GatewayReply::Json(v) => v.to_string(),
        }
    }
}

/// Caller-visible gateway failures. Degrade paths in callers match on
/// these instead of catching blanket errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("model backend exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("JSON required but none found in model reply")]
    MalformedOutput,
    #[error("no usable model candidate: {0}")]
    NoModel(String),
    #[error("model backend rejected request: {0}")]
    Rejected(String),
}

// Internal per-call outcomes, folded into the retry loop.
enum CallFailure {
    ModelNotFound(String),
    SchemaUnsupported,
    Retryable(String),
    Fatal(String),
}

// ─── OpenAI-style wire types ───

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Wraps the chat-completions backend with retry/backoff and ordered
/// multi-model fallback. Exhaustion is a hard, caller-visible failure.
pub struct ModelGateway {
    client: Client,
    api_url: String,
    api_key: String,
    models: Vec<String>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    // Flips off for the rest of the run once the backend rejects
    // strict json_schema response format.
    strict_schema: AtomicBool,
}

impl ModelGateway {
    pub fn new(config: &Config, models: &[String]) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build gateway HTTP client: {e}"))?;

        Ok(ModelGateway {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            models: models.to_vec(),
            max_attempts: config.gateway_max_attempts,
            base_delay: Duration::from_millis(config.gateway_base_delay_ms),
            max_delay: Duration::from_millis(config.gateway_max_delay_ms),
            strict_schema: AtomicBool::new(true),
        })
    }

    /// One completion under the given contract.
    ///
    /// Transient failures (429, 5xx, transport, empty reply) consume the
    /// retry budget with exponential backoff plus jitter. A missing model
    /// advances to the next candidate without consuming the budget.
    pub async fn complete(
        &self,
        prompt: &str,
        contract: &OutputContract,
        max_tokens: u32,
    ) -> Result<GatewayReply, GatewayError> {
        let mut model_idx = 0usize;
        let mut attempt = 0u32;
        let mut delay = self.base_delay;
        let mut last = String::from("no attempts made");

        while attempt < self.max_attempts {
            let model = self
                .models
                .get(model_idx)
                .ok_or_else(|| GatewayError::NoModel(last.clone()))?;

            match self.call_once(model, prompt, contract, max_tokens).await {
                Ok(text) => return Self::finalize(contract, text),
                Err(CallFailure::ModelNotFound(msg)) => {
                    warn!("Model '{}' unavailable, advancing candidate: {}", model, msg);
                    last = msg;
                    model_idx += 1;
                }
                Err(CallFailure::SchemaUnsupported) => {
                    warn!("Backend rejected strict schema mode, downgrading to json_object");
                    self.strict_schema.store(false, Ordering::Relaxed);
                }
                Err(CallFailure::Retryable(msg)) => {
                    attempt += 1;
                    last = msg;
                    if attempt >= self.max_attempts {
                        break;
                    }
                    let jitter = rand::thread_rng().gen_range(0..250);
                    let wait = delay + Duration::from_millis(jitter);
                    warn!(
                        "Gateway call failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.max_attempts, wait, last
                    );
                    tokio::time::sleep(wait).await;
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(CallFailure::Fatal(msg)) => return Err(GatewayError::Rejected(msg)),
            }
        }

        Err(GatewayError::Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }

    fn finalize(contract: &OutputContract, text: String) -> Result<GatewayReply, GatewayError> {
        match contract {
            OutputContract::Text => Ok(GatewayReply::Text(text)),
            OutputContract::JsonObject | OutputContract::JsonSchema { .. } => extract_json(&text)
                .map(GatewayReply::Json)
                .ok_or(GatewayError::MalformedOutput),
        }
    }

    fn response_format(&self, contract: &OutputContract) -> Option<Value> {
        match contract {
            OutputContract::Text => None,
            OutputContract::JsonObject => Some(serde_json::json!({"type": "json_object"})),
            OutputContract::JsonSchema { name, schema } => {
                if self.strict_schema.load(Ordering::Relaxed) {
                    Some(serde_json::json!({
                        "type": "json_schema",
                        "json_schema": {"name": name, "schema": schema, "strict": true}
                    }))
                } else {
                    Some(serde_json::json!({"type": "json_object"}))
                }
            }
        }
    }

    async fn call_once(
        &self,
        model: &str,
        prompt: &str,
        contract: &OutputContract,
        max_tokens: u32,
    ) -> Result<String, CallFailure> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_completion_tokens: max_tokens,
            response_format: self.response_format(contract),
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| CallFailure::Retryable(format!("transport error: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let body: ChatResponse = response
                .json()
                .await
                .map_err(|e| CallFailure::Retryable(format!("bad response body: {e}")))?;
            let text = body
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default();
            if text.trim().is_empty() {
                return Err(CallFailure::Retryable("empty model reply".to_string()));
            }
            debug!("Gateway reply from {}: {} chars", model, text.len());
            return Ok(text);
        }

        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        if code == 404 || body.contains("model_not_found") {
            return Err(CallFailure::ModelNotFound(format!("{code}: {body}")));
        }
        if code == 429 || code >= 500 {
            return Err(CallFailure::Retryable(format!("{code}: {body}")));
        }
        if code == 400
            && body.contains("response_format")
            && self.strict_schema.load(Ordering::Relaxed)
            && matches!(contract, OutputContract::JsonSchema { .. })
        {
            return Err(CallFailure::SchemaUnsupported);
        }
        Err(CallFailure::Fatal(format!("{code}: {body}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_gateway(uri: &str, models: &[&str]) -> ModelGateway {
        let mut config = Config::from_env().unwrap();
        config.api_url = uri.to_string();
        config.api_key = "test-key".to_string();
        config.gateway_max_attempts = 3;
        config.gateway_base_delay_ms = 1;
        config.gateway_max_delay_ms = 4;
        let models: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        ModelGateway::new(&config, &models).unwrap()
    }

    fn chat_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-test",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        })
    }

    #[tokio::test]
    async fn test_text_contract_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("hello world")))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gpt-5-mini"]);
        let reply = gateway
            .complete("say hi", &OutputContract::Text, 50)
            .await
            .unwrap();
        assert_eq!(reply.into_text(), "hello world");
    }

    #[tokio::test]
    async fn test_json_contract_extracts_fenced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(
                "Sure:\n```json\n{\"mapping\": [{\"i\": 1, \"sector\": \"Energy\"}]}\n```",
            )))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gpt-5-mini"]);
        let reply = gateway
            .complete("classify", &OutputContract::JsonObject, 200)
            .await
            .unwrap();
        let json = reply.into_json().unwrap();
        assert_eq!(json["mapping"][0]["sector"], "Energy");
    }

    #[tokio::test]
    async fn test_retries_on_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gpt-5-mini"]);
        let reply = gateway
            .complete("p", &OutputContract::Text, 50)
            .await
            .unwrap();
        assert_eq!(reply.into_text(), "ok");
    }

    #[tokio::test]
    async fn test_model_fallback_preserves_retry_budget() {
        let server = MockServer::start().await;
        // Primary model is gone; fallback answers.
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-5-mini"})))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_string(r#"{"error": {"code": "model_not_found"}}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-5"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("from fallback")))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gpt-5-mini", "gpt-5"]);
        let reply = gateway
            .complete("p", &OutputContract::Text, 50)
            .await
            .unwrap();
        assert_eq!(reply.into_text(), "from fallback");
    }

    #[tokio::test]
    async fn test_all_candidates_missing_is_hard_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_string(r#"{"error": {"code": "model_not_found"}}"#),
            )
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gone-1", "gone-2"]);
        let err = gateway
            .complete("p", &OutputContract::Text, 50)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoModel(_)));
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gpt-5-mini"]);
        let err = gateway
            .complete("p", &OutputContract::Text, 50)
            .await
            .unwrap_err();
        match err {
            GatewayError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_json_is_caller_visible_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("no json here")))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gpt-5-mini"]);
        let err = gateway
            .complete("p", &OutputContract::JsonObject, 50)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedOutput));
    }

    #[tokio::test]
    async fn test_strict_schema_downgrades_on_rejection() {
        let server = MockServer::start().await;
        // Reject strict json_schema mode once, then accept json_object.
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(
                serde_json::json!({"response_format": {"type": "json_schema"}}),
            ))
            .respond_with(
                ResponseTemplate::new(400).set_body_string("unsupported response_format"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(
                serde_json::json!({"response_format": {"type": "json_object"}}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(r#"{"ok": 1}"#)))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gpt-5-mini"]);
        let contract = OutputContract::JsonSchema {
            name: "mapping",
            schema: serde_json::json!({"type": "object"}),
        };
        let reply = gateway.complete("p", &contract, 50).await.unwrap();
        assert_eq!(reply.into_json().unwrap()["ok"], 1);
    }

    #[tokio::test]
    async fn test_non_retryable_client_error_rejects() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri(), &["gpt-5-mini"]);
        let err = gateway
            .complete("p", &OutputContract::Text, 50)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
    }
}
