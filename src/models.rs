//! Core data models shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

//
// ================= Providers =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Grok,
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Grok, Provider::Gemini, Provider::OpenAi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Grok => "grok",
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provider::Grok => "Grok",
            Provider::Gemini => "Gemini",
            Provider::OpenAi => "OpenAI",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Adapter I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub prompt: String,
    pub system: String,
    /// Empty means "provider default ladder only".
    pub preferred_model: String,
    pub use_tools: bool,
}

/// Outcome of one adapter call. `text == None` means every model was exhausted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCallResult {
    pub text: Option<String>,
    pub model_used: Option<String>,
}

impl ProviderCallResult {
    pub fn success(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            model_used: Some(model.into()),
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.text.is_some()
    }
}

//
// ================= Market Data =================
//

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regular: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<f64>,
}

impl PriceSet {
    pub fn is_empty(&self) -> bool {
        self.pre.is_none() && self.regular.is_none() && self.post.is_none()
    }

    /// Valuation price: regular session, then post-market, then pre-market.
    pub fn best(&self) -> Option<f64> {
        self.regular.or(self.post).or(self.pre)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub usd_krw_rate: Option<f64>,
    pub us_prices: BTreeMap<String, PriceSet>,
    pub fetched_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn empty() -> Self {
        Self {
            usd_krw_rate: None,
            us_prices: BTreeMap::new(),
            fetched_at: Utc::now(),
        }
    }
}

//
// ================= Usage =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// True when counts came from the character-length estimate.
    pub estimated: bool,
}

/// Coarse token estimate for providers that do not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() + 3) / 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_price_priority() {
        let all = PriceSet {
            pre: Some(1.0),
            regular: Some(2.0),
            post: Some(3.0),
        };
        assert_eq!(all.best(), Some(2.0));

        let no_regular = PriceSet {
            pre: Some(1.0),
            regular: None,
            post: Some(3.0),
        };
        assert_eq!(no_regular.best(), Some(3.0));

        let pre_only = PriceSet {
            pre: Some(1.0),
            ..Default::default()
        };
        assert_eq!(pre_only.best(), Some(1.0));
        assert_eq!(PriceSet::default().best(), None);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_provider_serialization() {
        let json = serde_json::to_string(&Provider::OpenAi).unwrap();
        assert_eq!(json, "\"openai\"");
        assert_eq!(Provider::Grok.as_str(), "grok");
        assert_eq!(Provider::OpenAi.to_string(), "OpenAI");
    }
}
