//! OpenAI adapter
//!
//! The `gpt-5.2` family goes through the Responses API with medium reasoning
//! effort; every other model uses chat completions. No tool path.

use super::wire::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ResponsesApiResponse};
use super::{call_with_ladder, classify, Attempt, ModelEndpoint, ProviderAdapter, RequestPath, RetryPolicy};
use crate::config::Credentials;
use crate::models::{CallRequest, Provider, ProviderCallResult};
use crate::transport::{HttpRequest, HttpTransport};
use crate::usage::UsageLedger;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Fallbacks never cost more than `gpt-5.2`. `gpt-5.2-pro` is only used when asked for.
pub const OPENAI_DEFAULT_MODELS: &[&str] = &[
    "gpt-5.2",
    "gpt-5.2-2025-12-11",
    "gpt-4o",
    "gpt-3.5-turbo",
];

pub const RESPONSES_API_MODELS: &[&str] = &[
    "gpt-5.2",
    "gpt-5.2-2025-12-11",
    "gpt-5.2-pro",
    "gpt-5.2-pro-2025-12-11",
];

const MAX_OUTPUT_TOKENS: u32 = 16000;
const TEMPERATURE: f32 = 0.7;

pub fn uses_responses_api(model: &str) -> bool {
    RESPONSES_API_MODELS.contains(&model)
}

pub struct OpenAiAdapter {
    transport: Arc<dyn HttpTransport>,
    api_key: String,
    base_url: String,
    ledger: UsageLedger,
    retry: RetryPolicy,
}

impl OpenAiAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, credentials: &Credentials, ledger: UsageLedger) -> Self {
        Self {
            transport,
            api_key: credentials.openai_api_key.clone(),
            base_url: OPENAI_BASE_URL.to_string(),
            ledger,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn responses_request(&self, model: &str, request: &CallRequest, reasoning: bool) -> HttpRequest {
        let mut body = json!({
            "model": model,
            "input": request.prompt,
            "max_output_tokens": MAX_OUTPUT_TOKENS,
        });
        if !request.system.trim().is_empty() {
            body["instructions"] = json!(request.system);
        }
        if reasoning {
            body["reasoning"] = json!({ "effort": "medium" });
        }

        HttpRequest::post_json(format!("{}/responses", self.base_url), body).bearer(&self.api_key)
    }

    fn chat_request(&self, model: &str, request: &CallRequest) -> crate::Result<HttpRequest> {
        let body = ChatCompletionRequest {
            model,
            messages: vec![
                ChatMessage::system(&request.system),
                ChatMessage::user(&request.prompt),
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_OUTPUT_TOKENS,
        };

        Ok(HttpRequest::post_json(
            format!("{}/chat/completions", self.base_url),
            serde_json::to_value(body)?,
        )
        .bearer(&self.api_key))
    }

    async fn attempt_responses(&self, model: &str, request: &CallRequest) -> Attempt {
        let mut result = self
            .transport
            .send(self.responses_request(model, request, true))
            .await;

        // Some models reject the reasoning block; one retry without it.
        if matches!(&result, Ok(response) if response.status == 400) {
            debug!(model = %model, "Responses API rejected reasoning, retrying without it");
            result = self
                .transport
                .send(self.responses_request(model, request, false))
                .await;
        }

        classify(result, |response| {
            response
                .json::<ResponsesApiResponse>()
                .ok()
                .and_then(ResponsesApiResponse::into_completion)
        })
    }

    async fn attempt_chat(&self, model: &str, request: &CallRequest) -> Attempt {
        let http = match self.chat_request(model, request) {
            Ok(http) => http,
            Err(e) => return Attempt::Terminal(e.to_string()),
        };

        classify(self.transport.send(http).await, |response| {
            response
                .json::<ChatCompletionResponse>()
                .ok()
                .and_then(ChatCompletionResponse::into_completion)
        })
    }
}

#[async_trait]
impl ModelEndpoint for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn attempt(&self, model: &str, request: &CallRequest, _path: RequestPath) -> Attempt {
        if uses_responses_api(model) {
            self.attempt_responses(model, request).await
        } else {
            self.attempt_chat(model, request).await
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn call(&self, request: &CallRequest) -> ProviderCallResult {
        call_with_ladder(self, OPENAI_DEFAULT_MODELS, false, request, &self.retry, &self.ledger).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, ScriptedTransport};

    fn credentials() -> Credentials {
        Credentials {
            openai_api_key: "sk-openai".into(),
            grok_api_key: "xai-key".into(),
            gemini_api_key: "gem-key".into(),
            fx_api_key: None,
        }
    }

    fn adapter(transport: Arc<ScriptedTransport>) -> OpenAiAdapter {
        OpenAiAdapter::new(transport, &credentials(), UsageLedger::new())
            .with_retry(RetryPolicy::immediate())
    }

    fn request(preferred: &str) -> CallRequest {
        CallRequest {
            prompt: "Decide the final CAGR".into(),
            system: "You are the chief manager".into(),
            preferred_model: preferred.into(),
            use_tools: true,
        }
    }

    const RESPONSES_OK: &str = r#"{"output":[{"type":"message","role":"assistant",
        "content":[{"type":"output_text","text":"Final report"}]}],
        "usage":{"input_tokens":900,"output_tokens":300}}"#;

    #[test]
    fn test_responses_api_routing() {
        assert!(uses_responses_api("gpt-5.2"));
        assert!(uses_responses_api("gpt-5.2-pro"));
        assert!(!uses_responses_api("gpt-4o"));
    }

    #[tokio::test]
    async fn test_reasoning_dropped_after_400() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            let body = req.body.as_ref().unwrap();
            if body.get("reasoning").is_some() {
                Ok(HttpResponse::new(400, "reasoning not supported"))
            } else {
                Ok(HttpResponse::new(200, RESPONSES_OK))
            }
        }));

        let result = adapter(transport.clone()).call(&request("")).await;

        assert_eq!(result.text.as_deref(), Some("Final report"));
        assert_eq!(result.model_used.as_deref(), Some("gpt-5.2"));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let first = requests[0].body.as_ref().unwrap();
        assert_eq!(first["reasoning"]["effort"], "medium");
        assert_eq!(first["instructions"], "You are the chief manager");
        assert_eq!(first["max_output_tokens"], 16000);
        assert!(requests[1].body.as_ref().unwrap().get("reasoning").is_none());
    }

    #[tokio::test]
    async fn test_chat_model_uses_chat_completions() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            assert!(req.url.ends_with("/chat/completions"));
            Ok(HttpResponse::new(
                200,
                r#"{"choices":[{"message":{"content":"Chat final"}}]}"#,
            ))
        }));

        let result = adapter(transport.clone()).call(&request("gpt-4o")).await;

        assert_eq!(result.model_used.as_deref(), Some("gpt-4o"));
        let body = transport.requests()[0].body.clone().unwrap();
        assert_eq!(body["max_tokens"], 16000);
        assert_eq!(body["messages"][1]["content"], "Decide the final CAGR");
    }

    #[tokio::test]
    async fn test_responses_failure_falls_through_to_chat_models() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            if req.url.ends_with("/responses") {
                Ok(HttpResponse::new(404, "no access"))
            } else {
                Ok(HttpResponse::new(
                    200,
                    r#"{"choices":[{"message":{"content":"From 4o"}}]}"#,
                ))
            }
        }));

        let result = adapter(transport.clone()).call(&request("")).await;

        assert_eq!(result.model_used.as_deref(), Some("gpt-4o"));
        assert_eq!(
            transport.models_requested(),
            vec!["gpt-5.2", "gpt-5.2-2025-12-11", "gpt-4o"]
        );
    }
}
