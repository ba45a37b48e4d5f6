//! Provider adapters
//!
//! Each adapter turns `(prompt, system, preferred_model, use_tools)` into
//! `(text?, model_used?)`. Model fallback, retry with backoff, tool degradation
//! and usage recording all happen in here; callers only see the final outcome.

use crate::models::{CallRequest, Provider, ProviderCallResult};
use crate::transport::HttpResponse;
use crate::usage::UsageLedger;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

pub mod gemini;
pub mod grok;
pub mod openai;
mod wire;

pub use gemini::GeminiAdapter;
pub use grok::GrokAdapter;
pub use openai::OpenAiAdapter;

/// Trait for one AI provider
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Never fails: total exhaustion is `ProviderCallResult::failed()`.
    async fn call(&self, request: &CallRequest) -> ProviderCallResult;
}

/// `[preferred] + (defaults - preferred)`; an empty preferred model means defaults only.
pub fn build_ladder(preferred: &str, defaults: &[&str]) -> Vec<String> {
    let preferred = preferred.trim();
    let mut ladder = Vec::with_capacity(defaults.len() + 1);

    if !preferred.is_empty() {
        ladder.push(preferred.to_string());
    }

    for model in defaults {
        if *model != preferred && !ladder.iter().any(|m| m == model) {
            ladder.push(model.to_string());
        }
    }

    ladder
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Tries per model for transient failures
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_step,
        }
    }

    /// Same attempt count, no waiting between tries.
    pub fn immediate() -> Self {
        Self::new(3, Duration::ZERO)
    }

    /// Linear backoff: `(attempt + 1) * backoff_step`
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_step * (attempt + 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Usable text plus whatever usage metadata the provider reported
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl Completion {
    pub fn new(text: String, input_tokens: Option<u64>, output_tokens: Option<u64>) -> Option<Self> {
        if text.trim().is_empty() {
            return None;
        }
        Some(Self {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

/// Outcome of one HTTP attempt against one model
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Success(Completion),
    /// Retry the same model
    Transient(String),
    /// Move on to the next model
    Terminal(String),
}

/// Request shape for a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPath {
    /// Web search / grounding enabled
    Tools,
    Plain,
}

/// 429 and 5xx are worth retrying; every other failure status is not.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Turn a transport result into an attempt outcome.
pub(crate) fn classify<F>(result: Result<HttpResponse>, parse: F) -> Attempt
where
    F: FnOnce(&HttpResponse) -> Option<Completion>,
{
    let response = match result {
        Ok(response) => response,
        Err(e) if e.is_transient() => return Attempt::Transient(e.to_string()),
        Err(e) => return Attempt::Terminal(e.to_string()),
    };

    if response.is_success() {
        return match parse(&response) {
            Some(completion) => Attempt::Success(completion),
            None => Attempt::Terminal("response carried no usable text".to_string()),
        };
    }

    let reason = format!("HTTP {}: {}", response.status, snippet(&response.body));
    if is_transient_status(response.status) {
        Attempt::Transient(reason)
    } else {
        Attempt::Terminal(reason)
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// One candidate request against a provider API
#[async_trait]
pub(crate) trait ModelEndpoint: Send + Sync {
    fn provider(&self) -> Provider;

    async fn attempt(&self, model: &str, request: &CallRequest, path: RequestPath) -> Attempt;
}

/// Walk the ladder until a candidate yields usable text.
pub(crate) async fn run_ladder(
    endpoint: &dyn ModelEndpoint,
    ladder: &[String],
    request: &CallRequest,
    path: RequestPath,
    policy: &RetryPolicy,
) -> Option<(Completion, String)> {
    let provider = endpoint.provider();

    for model in ladder {
        for attempt in 0..policy.max_attempts {
            match endpoint.attempt(model, request, path).await {
                Attempt::Success(completion) => return Some((completion, model.clone())),
                Attempt::Terminal(reason) => {
                    warn!(provider = %provider, model = %model, path = ?path, reason = %reason, "Model unavailable, trying next");
                    break;
                }
                Attempt::Transient(reason) => {
                    warn!(
                        provider = %provider,
                        model = %model,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        reason = %reason,
                        "Transient failure"
                    );
                    if attempt + 1 < policy.max_attempts {
                        tokio::time::sleep(policy.delay(attempt)).await;
                    }
                }
            }
        }
    }

    None
}

/// Full adapter flow: tool ladder, plain ladder, usage recording.
pub(crate) async fn call_with_ladder(
    endpoint: &dyn ModelEndpoint,
    defaults: &[&str],
    supports_tools: bool,
    request: &CallRequest,
    policy: &RetryPolicy,
    ledger: &UsageLedger,
) -> ProviderCallResult {
    let provider = endpoint.provider();
    let ladder = build_ladder(&request.preferred_model, defaults);

    let mut outcome = None;

    if request.use_tools && supports_tools {
        outcome = run_ladder(endpoint, &ladder, request, RequestPath::Tools, policy).await;
        if outcome.is_none() {
            warn!(provider = %provider, "Tool-augmented path exhausted, retrying without tools");
        }
    }

    if outcome.is_none() {
        outcome = run_ladder(endpoint, &ladder, request, RequestPath::Plain, policy).await;
    }

    match outcome {
        Some((completion, model)) => {
            match (completion.input_tokens, completion.output_tokens) {
                (Some(input), Some(output)) => {
                    ledger.record(provider.as_str(), &model, input, output).await;
                }
                _ => {
                    let prompt = format!("{}\n{}", request.system, request.prompt);
                    ledger
                        .record_estimated(provider.as_str(), &model, &prompt, &completion.text)
                        .await;
                }
            }

            info!(provider = %provider, model = %model, chars = completion.text.len(), "Provider call succeeded");
            ProviderCallResult::success(completion.text, model)
        }
        None => {
            error!(provider = %provider, candidates = ?ladder, "All models exhausted");
            ProviderCallResult::failed()
        }
    }
}

/// Scripted adapter for development & testing.
/// Replies from a queue, then falls back to a fixed reply.
pub struct ScriptedAdapter {
    provider: Provider,
    queue: Mutex<VecDeque<ProviderCallResult>>,
    default_reply: ProviderCallResult,
    calls: Mutex<Vec<CallRequest>>,
}

impl ScriptedAdapter {
    /// Fails every call once the queue is empty
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            queue: Mutex::new(VecDeque::new()),
            default_reply: ProviderCallResult::failed(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with the same text
    pub fn replying(provider: Provider, text: &str, model: &str) -> Self {
        Self {
            default_reply: ProviderCallResult::success(text, model),
            ..Self::new(provider)
        }
    }

    pub fn then_reply(self, text: &str, model: &str) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(ProviderCallResult::success(text, model));
        }
        self
    }

    pub fn then_fail(self) -> Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(ProviderCallResult::failed());
        }
        self
    }

    pub fn calls(&self) -> Vec<CallRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn call(&self, request: &CallRequest) -> ProviderCallResult {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }

        self.queue
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_else(|| self.default_reply.clone())
    }
}
