//! HTTP transport seam
//!
//! Every outward call (AI providers, market data) goes through `HttpTransport`.
//! Production uses a reqwest-backed client; tests script the responses.

use crate::error::ConsensusError;
use crate::Result;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Per-request timeout. Agentic calls with web search can be slow.
const REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    /// URL safe for logs: query string (which may carry an API key) removed.
    pub fn redacted_url(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Trait for outward HTTP calls
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        // No idle connections are kept between calls, so nothing stays open
        // while the debug shell waits on the operator.
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("portfolio-consensus/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!(url = %request.redacted_url(), method = ?request.method, "HTTP request");

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(HttpResponse { status, body })
    }
}

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>;

/// Scripted transport for development & testing.
/// Answers every request through a closure and keeps a log of what was sent.
pub struct ScriptedTransport {
    responder: Responder,
    log: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Every request answered with the same status and body.
    pub fn always(status: u16, body: &str) -> Self {
        let body = body.to_string();
        Self::new(move |_| Ok(HttpResponse::new(status, body.clone())))
    }

    /// Every request fails at the network level.
    pub fn unreachable() -> Self {
        Self::new(|_| Err(ConsensusError::TransportError("connection refused".to_string())))
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or(0)
    }

    /// `model` field of every JSON body sent, in order.
    pub fn models_requested(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| {
                r.body
                    .as_ref()
                    .and_then(|b| b.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| gemini_model_from_url(&r.url))
            })
            .collect()
    }
}

fn gemini_model_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next()?;
    let tail = path.rsplit('/').next()?;
    tail.split(':').next().map(str::to_string)
}

#[async_trait::async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        if let Ok(mut log) = self.log.lock() {
            log.push(request.clone());
        }
        (self.responder)(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_url_drops_query() {
        let request = HttpRequest::get("https://example.com/v1/models/x:generateContent?key=secret");
        assert_eq!(
            request.redacted_url(),
            "https://example.com/v1/models/x:generateContent"
        );
    }

    #[tokio::test]
    async fn test_scripted_transport_logs_models() {
        let transport = ScriptedTransport::always(200, "{}");
        transport
            .send(HttpRequest::post_json(
                "https://api.x.ai/v1/chat/completions",
                serde_json::json!({ "model": "grok-3" }),
            ))
            .await
            .unwrap();
        transport
            .send(HttpRequest::post_json(
                "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent?key=k",
                serde_json::json!({ "contents": [] }),
            ))
            .await
            .unwrap();

        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.models_requested(), vec!["grok-3", "gemini-pro"]);
    }
}
