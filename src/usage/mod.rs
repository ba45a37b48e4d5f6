//! Usage and cost accounting
//!
//! Adapters append one record per successful call; the totals are only read
//! once, at the end of a run.

pub mod pricing;

use crate::models::{estimate_tokens, UsageRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Append-only usage ledger (cheap to clone; clones share the records)
#[derive(Clone, Default)]
pub struct UsageLedger {
    records: Arc<RwLock<Vec<UsageRecord>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub per_provider_cost_usd: BTreeMap<String, f64>,
    pub total_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_krw: Option<f64>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub calls: usize,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record provider-reported token counts
    pub async fn record(&self, provider: &str, model: &str, input_tokens: u64, output_tokens: u64) {
        self.push(UsageRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            estimated: false,
        })
        .await;
    }

    /// Record counts estimated from prompt and response text
    pub async fn record_estimated(&self, provider: &str, model: &str, prompt: &str, response: &str) {
        self.push(UsageRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: estimate_tokens(prompt),
            output_tokens: estimate_tokens(response),
            estimated: true,
        })
        .await;
    }

    async fn push(&self, record: UsageRecord) {
        debug!(
            provider = %record.provider,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            estimated = record.estimated,
            "Usage recorded"
        );
        self.records.write().await.push(record);
    }

    /// Aggregate cost over every record so far
    pub async fn summarize(&self, usd_krw_rate: Option<f64>) -> UsageSummary {
        let records = self.records.read().await;

        let mut per_provider_cost_usd: BTreeMap<String, f64> = BTreeMap::new();
        let mut total_input_tokens = 0;
        let mut total_output_tokens = 0;

        for record in records.iter() {
            let cost = pricing::lookup(&record.provider, &record.model)
                .calculate_cost(record.input_tokens, record.output_tokens);
            *per_provider_cost_usd
                .entry(record.provider.clone())
                .or_insert(0.0) += cost;
            total_input_tokens += record.input_tokens;
            total_output_tokens += record.output_tokens;
        }

        let total_usd: f64 = per_provider_cost_usd.values().sum();

        UsageSummary {
            per_provider_cost_usd,
            total_usd,
            total_krw: usd_krw_rate.map(|rate| (total_usd * rate).round()),
            total_input_tokens,
            total_output_tokens,
            calls: records.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_is_idempotent() {
        let ledger = UsageLedger::new();
        tokio_test::block_on(ledger.record("grok", "grok-3", 1_000, 2_000));
        tokio_test::block_on(ledger.record_estimated("gemini", "gemini-pro", "abcd", "abcdefgh"));

        let first = tokio_test::block_on(ledger.summarize(Some(1400.0)));
        let second = tokio_test::block_on(ledger.summarize(Some(1400.0)));
        assert_eq!(first, second);
        assert_eq!(first.calls, 2);
    }

    #[tokio::test]
    async fn test_summary_aggregates_per_provider() {
        let ledger = UsageLedger::new();
        ledger.record("openai", "gpt-4o", 1_000_000, 0).await;
        ledger.record("openai", "gpt-4o", 0, 1_000_000).await;
        ledger.record("grok", "grok-3-mini", 1_000_000, 1_000_000).await;

        let summary = ledger.summarize(None).await;
        assert!((summary.per_provider_cost_usd["openai"] - 12.5).abs() < 1e-9);
        assert!((summary.per_provider_cost_usd["grok"] - 0.8).abs() < 1e-9);
        assert!((summary.total_usd - 13.3).abs() < 1e-9);
        assert_eq!(summary.total_krw, None);
        assert_eq!(summary.total_input_tokens, 2_000_000);
        assert_eq!(summary.total_output_tokens, 2_000_000);
    }

    #[tokio::test]
    async fn test_estimated_and_reported_counts_mix() {
        let ledger = UsageLedger::new();
        ledger.record_estimated("grok", "grok-3", "x".repeat(400).as_str(), "").await;
        ledger.record("grok", "grok-3", 100, 0).await;

        let summary = ledger.summarize(Some(1000.0)).await;
        assert_eq!(summary.total_input_tokens, 200);
        assert!(summary.total_krw.is_some());
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let ledger = UsageLedger::new();
        let handle = ledger.clone();
        handle.record("gemini", "gemini-3-flash", 10, 10).await;
        assert_eq!(ledger.summarize(None).await.calls, 1);
    }
}
