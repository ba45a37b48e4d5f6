//! xAI Grok adapter
//!
//! Tool path: `/v1/responses` with the `web_search` tool.
//! Plain path: `/v1/chat/completions`.

use super::wire::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ResponsesApiResponse};
use super::{call_with_ladder, classify, Attempt, ModelEndpoint, ProviderAdapter, RequestPath, RetryPolicy};
use crate::config::Credentials;
use crate::models::{CallRequest, Provider, ProviderCallResult};
use crate::transport::{HttpRequest, HttpTransport};
use crate::usage::UsageLedger;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub const GROK_BASE_URL: &str = "https://api.x.ai/v1";

/// Fallbacks never cost more than the default tier.
pub const GROK_DEFAULT_MODELS: &[&str] = &[
    "grok-4-1-fast-reasoning",
    "grok-4-1-fast-non-reasoning",
    "grok-4-fast-reasoning",
    "grok-4-fast-non-reasoning",
];

const TEMPERATURE: f32 = 0.2;
const MAX_OUTPUT_TOKENS: u32 = 8000;

pub struct GrokAdapter {
    transport: Arc<dyn HttpTransport>,
    api_key: String,
    base_url: String,
    ledger: UsageLedger,
    retry: RetryPolicy,
}

impl GrokAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, credentials: &Credentials, ledger: UsageLedger) -> Self {
        Self {
            transport,
            api_key: credentials.grok_api_key.clone(),
            base_url: GROK_BASE_URL.to_string(),
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

    fn responses_request(&self, model: &str, request: &CallRequest) -> HttpRequest {
        let body = json!({
            "model": model,
            "input": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt }
            ],
            "max_output_tokens": MAX_OUTPUT_TOKENS,
            "temperature": TEMPERATURE,
            "tools": [{ "type": "web_search" }]
        });

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
}

#[async_trait]
impl ModelEndpoint for GrokAdapter {
    fn provider(&self) -> Provider {
        Provider::Grok
    }

    async fn attempt(&self, model: &str, request: &CallRequest, path: RequestPath) -> Attempt {
        match path {
            RequestPath::Tools => {
                let http = self.responses_request(model, request);
                classify(self.transport.send(http).await, |response| {
                    response
                        .json::<ResponsesApiResponse>()
                        .ok()
                        .and_then(ResponsesApiResponse::into_completion)
                })
            }
            RequestPath::Plain => {
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
    }
}

#[async_trait]
impl ProviderAdapter for GrokAdapter {
    fn provider(&self) -> Provider {
        Provider::Grok
    }

    async fn call(&self, request: &CallRequest) -> ProviderCallResult {
        call_with_ladder(self, GROK_DEFAULT_MODELS, true, request, &self.retry, &self.ledger).await
    }
}
