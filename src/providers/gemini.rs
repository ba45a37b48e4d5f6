//! Google Gemini adapter
//!
//! One `generateContent` call per candidate. With tools enabled the request
//! carries `google_search` grounding; the plain path drops it.

use super::{call_with_ladder, classify, Attempt, Completion, ModelEndpoint, ProviderAdapter, RequestPath, RetryPolicy};
use crate::config::Credentials;
use crate::models::{CallRequest, Provider, ProviderCallResult};
use crate::transport::{HttpRequest, HttpTransport};
use crate::usage::UsageLedger;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Fallbacks never cost more than the default tier.
pub const GEMINI_DEFAULT_MODELS: &[&str] = &[
    "gemini-3-flash-preview",
    "gemini-3-flash",
    "gemini-2.5-flash",
    "gemini-pro",
];

pub struct GeminiAdapter {
    transport: Arc<dyn HttpTransport>,
    api_key: String,
    base_url: String,
    ledger: UsageLedger,
    retry: RetryPolicy,
}

impl GeminiAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, credentials: &Credentials, ledger: UsageLedger) -> Self {
        Self {
            transport,
            api_key: credentials.gemini_api_key.clone(),
            base_url: GEMINI_BASE_URL.to_string(),
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

    fn build_request(&self, model: &str, request: &CallRequest, path: RequestPath) -> crate::Result<HttpRequest> {
        let body = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.7,
                max_output_tokens: 8000,
            },
            system_instruction: (!request.system.trim().is_empty()).then(|| Content {
                parts: vec![Part {
                    text: request.system.clone(),
                }],
            }),
            tools: match path {
                RequestPath::Tools => Some(vec![json!({ "google_search": {} })]),
                RequestPath::Plain => None,
            },
        };

        // Key travels in the query string; logs use the redacted URL.
        let url = format!("{}/{}:generateContent?key={}", self.base_url, model, self.api_key);
        Ok(HttpRequest::post_json(url, serde_json::to_value(body)?))
    }
}

#[async_trait]
impl ModelEndpoint for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn attempt(&self, model: &str, request: &CallRequest, path: RequestPath) -> Attempt {
        let http = match self.build_request(model, request, path) {
            Ok(http) => http,
            Err(e) => return Attempt::Terminal(e.to_string()),
        };

        classify(self.transport.send(http).await, |response| {
            response
                .json::<GeminiResponse>()
                .ok()
                .and_then(GeminiResponse::into_completion)
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn call(&self, request: &CallRequest) -> ProviderCallResult {
        call_with_ladder(self, GEMINI_DEFAULT_MODELS, true, request, &self.retry, &self.ledger).await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

impl GeminiResponse {
    /// Text parts of the first candidate, joined. Grounded answers can be split
    /// over several parts.
    fn into_completion(self) -> Option<Completion> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().map(|p| p.text).collect();

        let (input, output) = self
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
            .unwrap_or((None, None));
        Completion::new(text, input, output)
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

    fn adapter(transport: Arc<ScriptedTransport>, ledger: UsageLedger) -> GeminiAdapter {
        GeminiAdapter::new(transport, &credentials(), ledger).with_retry(RetryPolicy::immediate())
    }

    fn request(use_tools: bool) -> CallRequest {
        CallRequest {
            prompt: "Audit the draft".into(),
            system: "You are the auditor".into(),
            preferred_model: String::new(),
            use_tools,
        }
    }

    const OK_BODY: &str = r#"{"candidates":[{"content":{"parts":[{"text":"Audit "},{"text":"done"}]}}],
        "usageMetadata":{"promptTokenCount":300,"candidatesTokenCount":40}}"#;

    #[test]
    fn test_request_serialization() {
        let adapter = GeminiAdapter::new(
            Arc::new(ScriptedTransport::unreachable()),
            &credentials(),
            UsageLedger::new(),
        );
        let http = adapter
            .build_request("gemini-pro", &request(true), RequestPath::Tools)
            .unwrap();
        let body = http.body.unwrap();

        assert!(http.url.ends_with("/gemini-pro:generateContent?key=gem-key"));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8000);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are the auditor");
        assert!(body["tools"][0].get("google_search").is_some());

        let plain = adapter
            .build_request("gemini-pro", &request(true), RequestPath::Plain)
            .unwrap();
        assert!(plain.body.unwrap().get("tools").is_none());
    }

    #[tokio::test]
    async fn test_grounded_success_reports_usage() {
        let transport = Arc::new(ScriptedTransport::always(200, OK_BODY));
        let ledger = UsageLedger::new();

        let result = adapter(transport.clone(), ledger.clone()).call(&request(true)).await;

        assert_eq!(result.text.as_deref(), Some("Audit done"));
        assert_eq!(result.model_used.as_deref(), Some("gemini-3-flash-preview"));

        let summary = ledger.summarize(None).await;
        assert_eq!(summary.total_input_tokens, 300);
        assert_eq!(summary.total_output_tokens, 40);
    }

    #[tokio::test]
    async fn test_missing_model_advances_ladder() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            if req.url.contains("/gemini-3-flash-preview:") {
                Ok(HttpResponse::new(404, "model not found"))
            } else {
                Ok(HttpResponse::new(200, OK_BODY))
            }
        }));

        let result = adapter(transport.clone(), UsageLedger::new()).call(&request(false)).await;

        assert_eq!(result.model_used.as_deref(), Some("gemini-3-flash"));
        assert_eq!(
            transport.models_requested(),
            vec!["gemini-3-flash-preview", "gemini-3-flash"]
        );
    }

    #[tokio::test]
    async fn test_empty_candidates_is_terminal_then_plain_path() {
        let transport = Arc::new(ScriptedTransport::new(|req| {
            let grounded = req.body.as_ref().map(|b| b.get("tools").is_some()).unwrap_or(false);
            if grounded {
                Ok(HttpResponse::new(200, r#"{"candidates":[]}"#))
            } else {
                Ok(HttpResponse::new(200, OK_BODY))
            }
        }));

        let result = adapter(transport.clone(), UsageLedger::new()).call(&request(true)).await;

        assert!(result.is_success());
        assert_eq!(transport.call_count(), GEMINI_DEFAULT_MODELS.len() + 1);
    }

    #[tokio::test]
    async fn test_service_unavailable_retried() {
        let transport = Arc::new(ScriptedTransport::always(503, "overloaded"));

        let result = adapter(transport.clone(), UsageLedger::new()).call(&request(false)).await;

        assert!(!result.is_success());
        assert_eq!(transport.call_count(), GEMINI_DEFAULT_MODELS.len() * 3);
    }
}
