//! Consensus state
//!
//! Every field is written exactly once, in step order. A second write is a
//! `StateError`; later stages only read.

use crate::error::ConsensusError;
use crate::models::Provider;
use crate::prompts::Role;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    R1Grok,
    R1Gemini,
    R2GrokRebut,
    R2GeminiRebut,
    FinalOpenai,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::R1Grok,
        Stage::R1Gemini,
        Stage::R2GrokRebut,
        Stage::R2GeminiRebut,
        Stage::FinalOpenai,
    ];

    /// 1-based step number, as used by `--debug-step`
    pub fn number(&self) -> u8 {
        match self {
            Stage::R1Grok => 1,
            Stage::R1Gemini => 2,
            Stage::R2GrokRebut => 3,
            Stage::R2GeminiRebut => 4,
            Stage::FinalOpenai => 5,
        }
    }

    pub fn from_number(n: u8) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.number() == n)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::R1Grok => "R1_GROK",
            Stage::R1Gemini => "R1_GEMINI",
            Stage::R2GrokRebut => "R2_GROK_REBUT",
            Stage::R2GeminiRebut => "R2_GEMINI_REBUT",
            Stage::FinalOpenai => "FINAL_OPENAI",
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Stage::R1Grok => Role::Grok,
            Stage::R1Gemini => Role::Gemini,
            Stage::R2GrokRebut => Role::GrokRebuttal,
            Stage::R2GeminiRebut => Role::GeminiRebuttal,
            Stage::FinalOpenai => Role::OpenAi,
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Stage::R1Grok | Stage::R2GrokRebut => Provider::Grok,
            Stage::R1Gemini | Stage::R2GeminiRebut => Provider::Gemini,
            Stage::FinalOpenai => Provider::OpenAi,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Completed,
    /// Provider failed; a placeholder stands in for its output
    Degraded,
    /// Not executed, no API call made
    Skipped,
    /// Provider failed and the run cannot continue
    Failed,
}

/// One executed (or skipped) stage
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub stage: Stage,
    pub role: Role,
    pub provider: Provider,
    pub system_prompt: String,
    pub prompt: String,
    pub response: Option<String>,
    pub model_used: Option<String>,
    pub outcome: StepOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Cell that accepts exactly one value
pub struct WriteOnce<T> {
    name: &'static str,
    cell: OnceLock<T>,
}

impl<T> WriteOnce<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: OnceLock::new(),
        }
    }

    pub fn set(&self, value: T) -> Result<()> {
        self.cell.set(value).map_err(|_| {
            ConsensusError::StateError(format!("{} already written for this run", self.name))
        })
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: fmt::Debug> fmt::Debug for WriteOnce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteOnce").field(&self.cell.get()).finish()
    }
}

impl<T: Serialize> Serialize for WriteOnce<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.cell.get().serialize(serializer)
    }
}

#[derive(Debug, Serialize)]
pub struct ConsensusState {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,

    pub draft_report: WriteOnce<String>,
    pub alpha_cagr: WriteOnce<Option<f64>>,
    pub current_total_krw: WriteOnce<Option<Value>>,
    pub grok_model: WriteOnce<String>,

    pub audit_comments: WriteOnce<String>,
    pub beta_cagr: WriteOnce<Option<f64>>,
    pub risk_level: WriteOnce<Option<String>>,
    pub audit_notes: WriteOnce<Option<String>>,
    pub gemini_model: WriteOnce<String>,

    pub grok_r2: WriteOnce<String>,
    pub gemini_r2: WriteOnce<String>,

    pub final_report: WriteOnce<String>,
    pub openai_model_final: WriteOnce<String>,

    steps: Vec<StepRecord>,
}

impl ConsensusState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            draft_report: WriteOnce::new("draft_report"),
            alpha_cagr: WriteOnce::new("alpha_cagr"),
            current_total_krw: WriteOnce::new("current_total_krw"),
            grok_model: WriteOnce::new("grok_model"),
            audit_comments: WriteOnce::new("audit_comments"),
            beta_cagr: WriteOnce::new("beta_cagr"),
            risk_level: WriteOnce::new("risk_level"),
            audit_notes: WriteOnce::new("audit_notes"),
            gemini_model: WriteOnce::new("gemini_model"),
            grok_r2: WriteOnce::new("grok_r2"),
            gemini_r2: WriteOnce::new("gemini_r2"),
            final_report: WriteOnce::new("final_report"),
            openai_model_final: WriteOnce::new("openai_model_final"),
            steps: Vec::new(),
        }
    }

    pub fn record_step(&mut self, record: StepRecord) {
        self.steps.push(record);
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    /// Stages that did not complete normally
    pub fn degraded_stages(&self) -> Vec<Stage> {
        self.steps
            .iter()
            .filter(|s| s.outcome != StepOutcome::Completed)
            .map(|s| s.stage)
            .collect()
    }

    pub fn alpha(&self) -> Option<f64> {
        self.alpha_cagr.get().copied().flatten()
    }

    pub fn beta(&self) -> Option<f64> {
        self.beta_cagr.get().copied().flatten()
    }
}

impl Default for ConsensusState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_once_rejects_second_write() {
        let state = ConsensusState::new();
        state.draft_report.set("first".to_string()).unwrap();

        let err = state.draft_report.set("second".to_string()).unwrap_err();
        assert!(matches!(err, ConsensusError::StateError(msg) if msg.contains("draft_report")));
        assert_eq!(state.draft_report.get().map(String::as_str), Some("first"));
    }

    #[test]
    fn test_none_counts_as_written() {
        let state = ConsensusState::new();
        state.alpha_cagr.set(None).unwrap();

        assert!(state.alpha_cagr.is_set());
        assert_eq!(state.alpha(), None);
        assert!(state.alpha_cagr.set(Some(1.0)).is_err());
    }

    #[test]
    fn test_serializes_unset_fields_as_null() {
        let state = ConsensusState::new();
        state.beta_cagr.set(Some(9.5)).unwrap();

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["beta_cagr"], 9.5);
        assert!(json["final_report"].is_null());
        assert_eq!(json["steps"], serde_json::json!([]));
    }

    #[test]
    fn test_stage_numbering() {
        assert_eq!(Stage::from_number(1), Some(Stage::R1Grok));
        assert_eq!(Stage::from_number(5), Some(Stage::FinalOpenai));
        assert_eq!(Stage::from_number(0), None);
        assert_eq!(Stage::from_number(6), None);
        assert_eq!(Stage::R2GeminiRebut.role(), Role::GeminiRebuttal);
        assert_eq!(Stage::R2GrokRebut.provider(), Provider::Grok);
        assert_eq!(
            serde_json::to_value(Stage::R2GrokRebut).unwrap(),
            serde_json::json!("R2_GROK_REBUT")
        );
    }
}
