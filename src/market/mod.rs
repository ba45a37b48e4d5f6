//! Market data fetcher
//!
//! USD/KRW rate and US equity quotes. Nothing in here fails the run: every
//! lookup degrades to "unknown" and the models are told to search instead.

use crate::models::{MarketSnapshot, PriceSet};
use crate::transport::{HttpRequest, HttpTransport};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

pub const FX_PRIMARY_URL: &str = "https://open.er-api.com/v6/latest/USD";
pub const FX_SECONDARY_URL: &str = "https://api.exchangerate.host/live";
pub const QUOTE_URL: &str = "https://query1.finance.yahoo.com/v7/finance/quote";

pub struct MarketDataFetcher {
    transport: Arc<dyn HttpTransport>,
    fx_api_key: Option<String>,
}

impl MarketDataFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, fx_api_key: Option<String>) -> Self {
        Self {
            transport,
            fx_api_key,
        }
    }

    /// USD/KRW, primary provider first, then the keyed one if configured
    pub async fn fetch_fx_rate(&self) -> Option<f64> {
        if let Some(rate) = self.fetch_primary_fx().await {
            return Some(rate);
        }

        let key = match &self.fx_api_key {
            Some(key) => key,
            None => {
                warn!("FX primary failed and no FX_API_KEY configured");
                return None;
            }
        };

        let rate = self.fetch_secondary_fx(key).await;
        if rate.is_none() {
            warn!("FX secondary provider failed, rate unknown");
        }
        rate
    }

    async fn fetch_primary_fx(&self) -> Option<f64> {
        let response = match self.transport.send(HttpRequest::get(FX_PRIMARY_URL)).await {
            Ok(r) if r.is_success() => r,
            Ok(r) => {
                warn!(status = r.status, "FX primary returned an error status");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "FX primary request failed");
                return None;
            }
        };

        match response.json::<PrimaryFxResponse>() {
            Ok(body) => body.rates.get("KRW").copied().and_then(valid_rate),
            Err(e) => {
                warn!(error = %e, "FX primary body malformed");
                None
            }
        }
    }

    async fn fetch_secondary_fx(&self, key: &str) -> Option<f64> {
        let url = query_url(
            FX_SECONDARY_URL,
            &[("access_key", key), ("source", "USD"), ("currencies", "KRW")],
        )?;

        let response = match self.transport.send(HttpRequest::get(url)).await {
            Ok(r) if r.is_success() => r,
            Ok(r) => {
                warn!(status = r.status, "FX secondary returned an error status");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "FX secondary request failed");
                return None;
            }
        };

        response
            .json::<SecondaryFxResponse>()
            .ok()
            .and_then(|body| body.quotes.get("USDKRW").copied())
            .and_then(valid_rate)
    }

    /// Quotes per ticker; tickers without any price are left out.
    pub async fn fetch_equity_prices(&self, tickers: &[String]) -> BTreeMap<String, PriceSet> {
        let mut prices = BTreeMap::new();

        for ticker in tickers {
            match self.fetch_quote(ticker).await {
                Some(set) if !set.is_empty() => {
                    prices.insert(ticker.clone(), set);
                }
                _ => warn!(ticker = %ticker, "No price available"),
            }
        }

        prices
    }

    async fn fetch_quote(&self, ticker: &str) -> Option<PriceSet> {
        let url = query_url(QUOTE_URL, &[("symbols", ticker)])?;

        let response = match self.transport.send(HttpRequest::get(url)).await {
            Ok(r) if r.is_success() => r,
            Ok(r) => {
                warn!(ticker = %ticker, status = r.status, "Quote request rejected");
                return None;
            }
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "Quote request failed");
                return None;
            }
        };

        let body: QuoteEnvelope = match response.json() {
            Ok(body) => body,
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "Quote body malformed");
                return None;
            }
        };

        let quote = body
            .quote_response
            .result
            .into_iter()
            .find(|q| q.symbol.eq_ignore_ascii_case(ticker))?;

        Some(PriceSet {
            pre: quote.pre_market_price.and_then(valid_price),
            regular: quote
                .regular_market_price
                .and_then(valid_price)
                .or_else(|| quote.current_price.and_then(valid_price)),
            post: quote.post_market_price.and_then(valid_price),
        })
    }

    /// FX and prices, fetched once per run
    pub async fn snapshot(&self, tickers: &[String]) -> MarketSnapshot {
        let usd_krw_rate = self.fetch_fx_rate().await;
        let us_prices = self.fetch_equity_prices(tickers).await;

        info!(
            usd_krw = ?usd_krw_rate,
            priced = us_prices.len(),
            requested = tickers.len(),
            "Market snapshot ready"
        );

        MarketSnapshot {
            usd_krw_rate,
            us_prices,
            fetched_at: Utc::now(),
        }
    }
}

/// `base` with percent-encoded query parameters
fn query_url(base: &str, params: &[(&str, &str)]) -> Option<String> {
    match Url::parse_with_params(base, params) {
        Ok(url) => Some(url.into()),
        Err(e) => {
            warn!(base = %base, error = %e, "Cannot build request URL");
            None
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn valid_rate(rate: f64) -> Option<f64> {
    (rate.is_finite() && rate > 0.0).then(|| round2(rate))
}

fn valid_price(price: f64) -> Option<f64> {
    (price.is_finite() && price > 0.0).then(|| round2(price))
}

/// Market data section for the first-round prompt.
/// Unknown values tell the model to look them up itself.
pub fn render_market_block(
    snapshot: &MarketSnapshot,
    holdings: &BTreeMap<String, f64>,
    reference_date: &str,
) -> String {
    let mut out = String::from("## Live market data (use these values as given)\n\n");

    match snapshot.usd_krw_rate {
        Some(rate) => {
            let _ = writeln!(out, "USD/KRW ({}): {:.2}", reference_date, rate);
        }
        None => {
            let _ = writeln!(
                out,
                "USD/KRW: lookup failed; search for the {} rate.",
                reference_date
            );
        }
    }
    out.push('\n');

    if snapshot.us_prices.is_empty() {
        out.push_str("US equity prices: lookup failed; search for them.\n");
    } else {
        out.push_str("US equity prices:\n");
        for (ticker, prices) in &snapshot.us_prices {
            let _ = write!(out, "- {}:", ticker);
            if let Some(p) = prices.pre {
                let _ = write!(out, " pre-market ${:.2}", p);
            }
            if let Some(p) = prices.regular {
                let _ = write!(out, " regular ${:.2}", p);
            }
            if let Some(p) = prices.post {
                let _ = write!(out, " after-hours ${:.2}", p);
            }
            out.push('\n');
        }
    }

    let valuation = holdings_valuation(snapshot, holdings);
    if !valuation.is_empty() {
        out.push_str("\nHoldings valuation:\n");
        out.push_str(&valuation);
    }

    out
}

fn holdings_valuation(snapshot: &MarketSnapshot, holdings: &BTreeMap<String, f64>) -> String {
    let mut out = String::new();
    let mut total_usd = 0.0;

    for (ticker, quantity) in holdings {
        let price = match snapshot.us_prices.get(ticker).and_then(PriceSet::best) {
            Some(p) => p,
            None => {
                let _ = writeln!(out, "- {} x {}: price unknown", ticker, quantity);
                continue;
            }
        };

        let value = quantity * price;
        total_usd += value;
        match snapshot.usd_krw_rate {
            Some(rate) => {
                let _ = writeln!(
                    out,
                    "- {} x {} @ ${:.2} = ${:.2} (KRW {:.0})",
                    ticker,
                    quantity,
                    price,
                    value,
                    value * rate
                );
            }
            None => {
                let _ = writeln!(out, "- {} x {} @ ${:.2} = ${:.2}", ticker, quantity, price, value);
            }
        }
    }

    if total_usd > 0.0 {
        match snapshot.usd_krw_rate {
            Some(rate) => {
                let _ = writeln!(out, "Total US holdings: ${:.2} (KRW {:.0})", total_usd, total_usd * rate);
            }
            None => {
                let _ = writeln!(out, "Total US holdings: ${:.2}", total_usd);
            }
        }
    }

    out
}

#[derive(Debug, Deserialize)]
struct PrimaryFxResponse {
    #[serde(default)]
    rates: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct SecondaryFxResponse {
    #[serde(default)]
    quotes: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteEnvelope {
    quote_response: QuoteResult,
}

#[derive(Debug, Deserialize)]
struct QuoteResult {
    #[serde(default)]
    result: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Quote {
    symbol: String,
    pre_market_price: Option<f64>,
    regular_market_price: Option<f64>,
    current_price: Option<f64>,
    post_market_price: Option<f64>,
}
