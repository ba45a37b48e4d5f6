//! Structured-output extraction
//!
//! Models are asked to end their answer with a JSON blob. This module finds it
//! in otherwise free-form text and returns the requested keys. It never fails:
//! the worst case is a map where every key is `None`.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

lazy_static! {
    /// Fenced block holding one JSON object, one level of nested braces allowed.
    static ref FENCED_JSON: Regex =
        Regex::new(r"(?s)```(?:json)?\s*(\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\})\s*```")
            .expect("fenced JSON pattern");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    FencedJson,
    BareJson,
    NumericFallback,
    Nothing,
}

#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    /// Every expected key is present; missing values are `None`.
    pub fields: BTreeMap<String, Option<Value>>,
    pub source: ExtractionSource,
}

impl Extraction {
    fn empty(expected_keys: &[&str]) -> Self {
        Self {
            fields: expected_keys
                .iter()
                .map(|k| (k.to_string(), None))
                .collect(),
            source: ExtractionSource::Nothing,
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).and_then(Option::as_ref)
    }

    /// Numeric field; numeric strings like "17.5" or "17.5%" are accepted.
    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.value(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.value(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Extract `expected_keys` from the trailing JSON blob in `text`
pub fn extract(text: &str, expected_keys: &[&str]) -> Extraction {
    let mut extraction = Extraction::empty(expected_keys);

    if text.trim().is_empty() || expected_keys.is_empty() {
        return extraction;
    }

    if let Some((object, source)) = find_json_object(text, expected_keys[0]) {
        for key in expected_keys {
            let value = object.get(*key).filter(|v| !v.is_null()).cloned();
            extraction.fields.insert(key.to_string(), value);
        }
        extraction.source = source;
        return extraction;
    }

    if let Some(number) = numeric_fallback(text, expected_keys[0]) {
        extraction
            .fields
            .insert(expected_keys[0].to_string(), Some(number));
        extraction.source = ExtractionSource::NumericFallback;
    }

    extraction
}

fn find_json_object(text: &str, first_key: &str) -> Option<(Map<String, Value>, ExtractionSource)> {
    // Trailing blob wins, so walk fenced blocks from the end.
    let fenced: Vec<&str> = FENCED_JSON
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    for candidate in fenced.iter().rev() {
        if let Some(object) = parse_object(candidate) {
            return Some((object, ExtractionSource::FencedJson));
        }
    }

    let bare = Regex::new(&format!(
        r#"(?s)(\{{\s*"{}"\s*:\s*[^}}]+\}})"#,
        regex::escape(first_key)
    ))
    .ok()?;

    let candidates: Vec<&str> = bare
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    candidates
        .iter()
        .rev()
        .find_map(|candidate| parse_object(candidate))
        .map(|object| (object, ExtractionSource::BareJson))
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn numeric_fallback(text: &str, key: &str) -> Option<Value> {
    let pattern = Regex::new(&format!(
        r#""?{}"?\s*:\s*(-?\d+(?:\.\d+)?)"#,
        regex::escape(key)
    ))
    .ok()?;

    let raw = pattern.captures(text)?.get(1)?.as_str();
    let number: f64 = raw.parse().ok()?;
    serde_json::Number::from_f64(number).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHA_KEYS: &[&str] = &["alpha_cagr", "current_total_krw", "market_data"];

    #[test]
    fn test_fenced_json_round_trip() {
        let text = "Draft report...\n\n```json\n{\"alpha_cagr\": 17.5, \"current_total_krw\": 123}\n```\n";
        let result = extract(text, &["alpha_cagr", "current_total_krw"]);

        assert_eq!(result.source, ExtractionSource::FencedJson);
        assert_eq!(result.f64("alpha_cagr"), Some(17.5));
        assert_eq!(
            result.value("current_total_krw").and_then(Value::as_i64),
            Some(123)
        );
    }

    #[test]
    fn test_fence_without_language_tag_and_nested_object() {
        let text = r#"Summary
```
{"alpha_cagr": 12.0, "market_data": {"usd_krw": 1450.5}}
```"#;
        let result = extract(text, ALPHA_KEYS);

        assert_eq!(result.f64("alpha_cagr"), Some(12.0));
        assert_eq!(
            result
                .value("market_data")
                .and_then(|v| v.get("usd_krw"))
                .and_then(Value::as_f64),
            Some(1450.5)
        );
        assert!(result.value("current_total_krw").is_none());
    }

    #[test]
    fn test_trailing_fenced_block_preferred() {
        let text = "```json\n{\"alpha_cagr\": 1.0}\n```\nlater\n```json\n{\"alpha_cagr\": 2.0}\n```";
        assert_eq!(extract(text, ALPHA_KEYS).f64("alpha_cagr"), Some(2.0));
    }

    #[test]
    fn test_bare_json_pattern() {
        let text = r#"Final answer {"beta_cagr": 9.25, "risk_level": "mid"} end"#;
        let result = extract(text, &["beta_cagr", "risk_level", "audit_notes"]);

        assert_eq!(result.source, ExtractionSource::BareJson);
        assert_eq!(result.f64("beta_cagr"), Some(9.25));
        assert_eq!(result.string("risk_level").as_deref(), Some("mid"));
        assert!(result.value("audit_notes").is_none());
    }

    #[test]
    fn test_numeric_fallback_on_broken_json() {
        let text = r#"```json
{"alpha_cagr": 14.2, "market_data": {broken
```"#;
        let result = extract(text, ALPHA_KEYS);

        assert_eq!(result.source, ExtractionSource::NumericFallback);
        assert_eq!(result.f64("alpha_cagr"), Some(14.2));
        assert!(result.value("current_total_krw").is_none());
    }

    #[test]
    fn test_negative_number_fallback() {
        let result = extract(r#"estimate "alpha_cagr": -3.5 (bearish"#, ALPHA_KEYS);
        assert_eq!(result.f64("alpha_cagr"), Some(-3.5));
    }

    #[test]
    fn test_string_percentages_are_numbers() {
        let text = r#"```json
{"beta_cagr": "11.5%"}
```"#;
        assert_eq!(extract(text, &["beta_cagr"]).f64("beta_cagr"), Some(11.5));
    }

    #[test]
    fn test_malformed_inputs_keep_every_key() {
        let inputs = [
            "",
            "   ",
            "no json at all",
            "```json\n{\n```",
            "```json\n[1, 2, 3]\n```",
            "{\"alpha_cagr\": }",
            "{{{{}}}}",
            "\"alpha_cagr\": \"not a number\"",
            "```json\n{\"alpha_cagr\": null}\n```",
            "🚀 유니코드 텍스트 {\"alpha_cagr\"",
        ];

        for input in inputs {
            let result = extract(input, ALPHA_KEYS);
            assert_eq!(result.fields.len(), ALPHA_KEYS.len(), "input: {:?}", input);
            for key in ALPHA_KEYS {
                assert!(result.fields.contains_key(*key), "input: {:?}", input);
            }
            assert!(result.f64("alpha_cagr").is_none(), "input: {:?}", input);
        }
    }

    #[test]
    fn test_no_expected_keys() {
        let result = extract("```json\n{\"a\": 1}\n```", &[]);
        assert!(result.fields.is_empty());
        assert_eq!(result.source, ExtractionSource::Nothing);
    }
}
