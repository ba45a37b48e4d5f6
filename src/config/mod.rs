//! Startup configuration
//!
//! API credentials come from the environment (after `.env` is loaded), the
//! portfolio layout from `<prompts_dir>/config.json`.

use crate::error::ConsensusError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const GROK_API_KEY: &str = "GROK_API_KEY";
pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const FX_API_KEY: &str = "FX_API_KEY";

pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_PROMPT_FILE: &str = "portfolio_prompt.txt";
pub const DEFAULT_TICKERS: [&str; 6] = ["TSLA", "MAGS", "SMH", "MSTR", "MELI", "NU"];

/// API keys, read once at startup
#[derive(Clone)]
pub struct Credentials {
    pub openai_api_key: String,
    pub grok_api_key: String,
    pub gemini_api_key: String,
    pub fx_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup; a missing or blank mandatory key is fatal.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConsensusError::MissingCredential(name))
        };

        Ok(Self {
            openai_api_key: required(OPENAI_API_KEY)?,
            grok_api_key: required(GROK_API_KEY)?,
            gemini_api_key: required(GEMINI_API_KEY)?,
            fx_api_key: lookup(FX_API_KEY)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("openai_api_key", &"<redacted>")
            .field("grok_api_key", &"<redacted>")
            .field("gemini_api_key", &"<redacted>")
            .field("fx_api_key", &self.fx_api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Portfolio layout from `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub tickers: Vec<String>,
    /// Ticker -> share count, used for valuation in the market block
    pub holdings: BTreeMap<String, f64>,
    pub portfolio_prompt_file: String,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            tickers: DEFAULT_TICKERS.iter().map(|t| t.to_string()).collect(),
            holdings: BTreeMap::new(),
            portfolio_prompt_file: DEFAULT_PROMPT_FILE.to_string(),
        }
    }
}

impl PortfolioConfig {
    /// Missing file means defaults; a file that does not parse is an error.
    pub fn load(prompts_dir: &Path) -> Result<Self> {
        let path = prompts_dir.join(CONFIG_FILE);

        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)?;
        let mut config: PortfolioConfig = serde_json::from_str(&raw).map_err(|e| {
            ConsensusError::ConfigError(format!("{}: {}", path.display(), e))
        })?;

        config.tickers = config
            .tickers
            .iter()
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();

        // Holdings must key the same symbols the price lookup returns
        let mut holdings = BTreeMap::new();
        for (ticker, quantity) in std::mem::take(&mut config.holdings) {
            let ticker = ticker.trim().to_uppercase();
            if !ticker.is_empty() {
                *holdings.entry(ticker).or_insert(0.0) += quantity;
            }
        }
        config.holdings = holdings;

        if config.tickers.is_empty() {
            warn!("Config lists no tickers, using defaults");
            config.tickers = Self::default().tickers;
        }

        info!(
            tickers = ?config.tickers,
            holdings = config.holdings.len(),
            "Config loaded"
        );

        Ok(config)
    }

    /// Relative prompt paths resolve against the prompts directory.
    pub fn prompt_path(&self, prompts_dir: &Path) -> PathBuf {
        let path = Path::new(&self.portfolio_prompt_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            prompts_dir.join(path)
        }
    }
}

/// Read the portfolio context injected into every first-round prompt
pub fn read_portfolio_prompt(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path).map_err(|e| {
        ConsensusError::PromptError(format!("cannot read {}: {}", path.display(), e))
    })?;

    if text.trim().is_empty() {
        return Err(ConsensusError::PromptError(format!(
            "{} is empty",
            path.display()
        )));
    }

    Ok(text)
}
