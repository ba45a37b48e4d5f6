//! Diagnostic modes
//!
//! One-shot checks that exercise single adapters or only the market fetcher,
//! without running the pipeline or writing a report.

use crate::market::MarketDataFetcher;
use crate::models::{CallRequest, MarketSnapshot, Provider};
use crate::providers::ProviderAdapter;
use std::fmt::Write;
use std::sync::Arc;
use tracing::info;

pub const PING_PROMPT: &str = "Reply with exactly: OK";
pub const PRICE_TICKER: &str = "TSLA";

/// One adapter under test, with the model the operator asked for
pub struct CheckTarget {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub requested_model: String,
}

impl CheckTarget {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, requested_model: impl Into<String>) -> Self {
        Self {
            adapter,
            requested_model: requested_model.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub provider: Provider,
    pub requested_model: String,
    pub model_used: Option<String>,
    pub reply: Option<String>,
}

impl CheckResult {
    pub fn answered(&self) -> bool {
        self.reply.is_some()
    }

    /// The ladder moved off the requested model
    pub fn fell_back(&self) -> bool {
        match &self.model_used {
            Some(used) => !self.requested_model.is_empty() && used != &self.requested_model,
            None => false,
        }
    }
}

async fn run_check(target: &CheckTarget, request: CallRequest) -> CheckResult {
    let provider = target.adapter.provider();
    let result = target.adapter.call(&request).await;

    info!(
        provider = %provider,
        requested = %target.requested_model,
        used = ?result.model_used,
        ok = result.is_success(),
        "Model check finished"
    );

    CheckResult {
        provider,
        requested_model: target.requested_model.clone(),
        model_used: result.model_used,
        reply: result.text.map(|t| t.trim().to_string()),
    }
}

/// Ping every adapter and report which model actually answered
pub async fn test_models(targets: &[CheckTarget]) -> Vec<CheckResult> {
    let mut results = Vec::with_capacity(targets.len());

    for target in targets {
        let request = CallRequest {
            prompt: PING_PROMPT.to_string(),
            system: String::new(),
            preferred_model: target.requested_model.clone(),
            use_tools: false,
        };
        results.push(run_check(target, request).await);
    }

    results
}

/// Ask every adapter for a live quote, tools enabled where supported
pub async fn test_stock_price(targets: &[CheckTarget], ticker: &str) -> Vec<CheckResult> {
    let mut results = Vec::with_capacity(targets.len());

    for target in targets {
        let request = CallRequest {
            prompt: format!(
                "What is the latest {} share price in USD? Search if you can. \
                 Answer with the price and its timestamp only.",
                ticker
            ),
            system: "You are a concise market data assistant.".to_string(),
            preferred_model: target.requested_model.clone(),
            use_tools: true,
        };
        results.push(run_check(target, request).await);
    }

    results
}

/// FX rate and equity quotes only, no AI calls
pub async fn test_data_fetch(fetcher: &MarketDataFetcher, tickers: &[String]) -> MarketSnapshot {
    fetcher.snapshot(tickers).await
}

pub fn render_checks(title: &str, results: &[CheckResult]) -> String {
    let mut out = format!("== {}\n", title);

    for r in results {
        let requested = if r.requested_model.is_empty() {
            "(default)"
        } else {
            r.requested_model.as_str()
        };
        let used = r.model_used.as_deref().unwrap_or("N/A");
        let marker = if r.fell_back() { " (fallback)" } else { "" };

        let _ = writeln!(out, "{:<7} requested: {} | used: {}{}", r.provider, requested, used, marker);
        match &r.reply {
            Some(reply) => {
                let _ = writeln!(out, "        reply: {}", reply);
            }
            None => {
                let _ = writeln!(out, "        FAILED: all models exhausted");
            }
        }
    }

    out
}

pub fn render_snapshot(snapshot: &MarketSnapshot, tickers: &[String]) -> String {
    let mut out = String::from("== Market data fetch\n");

    match snapshot.usd_krw_rate {
        Some(rate) => {
            let _ = writeln!(out, "USD/KRW: {:.2}", rate);
        }
        None => out.push_str("USD/KRW: unavailable\n"),
    }

    for ticker in tickers {
        match snapshot.us_prices.get(ticker) {
            Some(p) => {
                let fmt = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".into());
                let _ = writeln!(
                    out,
                    "{:<6} pre {} | regular {} | post {}",
                    ticker,
                    fmt(p.pre),
                    fmt(p.regular),
                    fmt(p.post)
                );
            }
            None => {
                let _ = writeln!(out, "{:<6} unavailable", ticker);
            }
        }
    }

    out
}
