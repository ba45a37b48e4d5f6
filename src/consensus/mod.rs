//! Consensus orchestrator
//!
//! Drives the five-stage negotiation:
//! START → R1_GROK → R1_GEMINI → R2_GROK_REBUT → R2_GEMINI_REBUT → FINAL_OPENAI → DONE
//!
//! Only R1_GROK can abort the run. Every later failure is replaced by an
//! explicit placeholder and the run continues. No averaging happens here; the
//! final call arbitrates between the two forecasts.

pub mod state;

pub use state::{ConsensusState, Stage, StepOutcome, StepRecord, WriteOnce};

use crate::error::ConsensusError;
use crate::extract::extract;
use crate::market::render_market_block;
use crate::models::{CallRequest, MarketSnapshot, ProviderCallResult};
use crate::prompts::{PromptBook, Role};
use crate::providers::ProviderAdapter;
use crate::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const NOT_PROVIDED: &str = "(not provided)";
pub const REVIEW_UNAVAILABLE: &str = "(review unavailable)";
pub const NONE_MARKER: &str = "(none)";
pub const MODEL_NOT_AVAILABLE: &str = "N/A";

pub const ALPHA_KEYS: &[&str] = &["alpha_cagr", "current_total_krw", "market_data"];
pub const BETA_KEYS: &[&str] = &["beta_cagr", "risk_level", "audit_notes"];

/// Portfolio context handed to the auditor is cut to this many characters.
const PORTFOLIO_EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Continue,
    Halt,
}

/// Hook consulted after every executed stage
#[async_trait]
pub trait StepGate: Send + Sync {
    async fn after_step(&self, stage: Stage, state: &ConsensusState) -> Result<GateDecision>;
}

/// Gate that never stops the run
pub struct NoopGate;

#[async_trait]
impl StepGate for NoopGate {
    async fn after_step(&self, _stage: Stage, _state: &ConsensusState) -> Result<GateDecision> {
        Ok(GateDecision::Continue)
    }
}

/// Per-run model preferences and tool switches
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOptions {
    pub grok_model: String,
    pub gemini_model: String,
    pub openai_model: String,
    pub grok_web_search: bool,
    pub gemini_search: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            grok_model: String::new(),
            gemini_model: String::new(),
            openai_model: String::new(),
            grok_web_search: true,
            gemini_search: true,
        }
    }
}

pub struct PipelineInput {
    pub portfolio_prompt: String,
    pub snapshot: MarketSnapshot,
    pub holdings: BTreeMap<String, f64>,
    /// Date the report is written for; prices are as of the day before.
    pub run_date: NaiveDate,
}

impl PipelineInput {
    pub fn new(portfolio_prompt: String, snapshot: MarketSnapshot, holdings: BTreeMap<String, f64>) -> Self {
        Self {
            portfolio_prompt,
            snapshot,
            holdings,
            run_date: Utc::now().date_naive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "after")]
pub enum RunOutcome {
    /// Every stage completed
    Completed,
    /// Finished with at least one placeholder
    Degraded,
    /// Operator stopped the run after this stage
    Halted(Stage),
}

#[derive(Debug)]
pub struct RunReport {
    pub state: ConsensusState,
    pub outcome: RunOutcome,
}

pub struct ConsensusOrchestrator {
    grok: Arc<dyn ProviderAdapter>,
    gemini: Arc<dyn ProviderAdapter>,
    openai: Arc<dyn ProviderAdapter>,
    prompts: PromptBook,
    options: PipelineOptions,
}

impl ConsensusOrchestrator {
    pub fn new(
        grok: Arc<dyn ProviderAdapter>,
        gemini: Arc<dyn ProviderAdapter>,
        openai: Arc<dyn ProviderAdapter>,
        prompts: PromptBook,
        options: PipelineOptions,
    ) -> Self {
        Self {
            grok,
            gemini,
            openai,
            prompts,
            options,
        }
    }

    /// Run every stage in order. `Err(Aborted)` only when the first draft fails.
    pub async fn run(&self, input: &PipelineInput, gate: &dyn StepGate) -> Result<RunReport> {
        let mut state = ConsensusState::new();

        info!(run_id = %state.run_id, "Consensus run started");

        // ================= R1_GROK =================
        let stage = Stage::R1Grok;
        let reference_date = input.run_date - Duration::days(1);
        let market_block = render_market_block(
            &input.snapshot,
            &input.holdings,
            &reference_date.format("%Y-%m-%d").to_string(),
        );
        let prompt = self.prompts.render_user(
            Role::Grok,
            &[
                ("date", &input.run_date.format("%Y-%m-%d").to_string()),
                ("reference_date", &reference_date.format("%Y-%m-%d").to_string()),
                ("market_data", &market_block),
                ("portfolio", &input.portfolio_prompt),
            ],
        );
        let request = self.request(stage, prompt, &self.options.grok_model, self.options.grok_web_search);
        let result = self.grok.call(&request).await;

        let (draft, model) = match (&result.text, &result.model_used) {
            (Some(text), Some(model)) => (text.clone(), model.clone()),
            _ => {
                record(&mut state, stage, &request, &result, StepOutcome::Failed);
                error!(stage = %stage, "No draft from any Grok model, aborting");
                return Err(ConsensusError::Aborted {
                    stage: stage.name().to_string(),
                    reason: "Grok returned no draft after exhausting every model".to_string(),
                });
            }
        };

        let alpha = extract(&draft, ALPHA_KEYS);
        state.alpha_cagr.set(alpha.f64("alpha_cagr"))?;
        state.current_total_krw.set(alpha.value("current_total_krw").cloned())?;
        state.draft_report.set(draft)?;
        state.grok_model.set(model)?;
        record(&mut state, stage, &request, &result, StepOutcome::Completed);

        info!(
            stage = %stage,
            alpha_cagr = ?state.alpha(),
            source = ?alpha.source,
            "Draft received"
        );

        if self.halted(stage, &state, gate).await? {
            return Ok(RunReport::halted(state, stage));
        }

        // ================= R1_GEMINI =================
        let stage = Stage::R1Gemini;
        let alpha_text = format_cagr(state.alpha());
        let excerpt: String = input
            .portfolio_prompt
            .chars()
            .take(PORTFOLIO_EXCERPT_CHARS)
            .collect();
        let prompt = self.prompts.render_user(
            Role::Gemini,
            &[
                ("draft_report", text_of(&state.draft_report)),
                ("alpha_cagr", &alpha_text),
                ("portfolio_excerpt", &excerpt),
            ],
        );
        let request = self.request(stage, prompt, &self.options.gemini_model, self.options.gemini_search);
        let result = self.gemini.call(&request).await;

        match (&result.text, &result.model_used) {
            (Some(text), Some(model)) => {
                let beta = extract(text, BETA_KEYS);
                state.beta_cagr.set(beta.f64("beta_cagr"))?;
                state.risk_level.set(beta.string("risk_level"))?;
                state.audit_notes.set(beta.string("audit_notes"))?;
                state.audit_comments.set(text.clone())?;
                state.gemini_model.set(model.clone())?;
                record(&mut state, stage, &request, &result, StepOutcome::Completed);
                info!(stage = %stage, beta_cagr = ?state.beta(), source = ?beta.source, "Audit received");
            }
            _ => {
                state.beta_cagr.set(None)?;
                state.risk_level.set(None)?;
                state.audit_notes.set(None)?;
                state.audit_comments.set(REVIEW_UNAVAILABLE.to_string())?;
                record(&mut state, stage, &request, &result, StepOutcome::Degraded);
                warn!(stage = %stage, "Audit unavailable, continuing without Beta forecast");
            }
        }

        if self.halted(stage, &state, gate).await? {
            return Ok(RunReport::halted(state, stage));
        }

        // ================= R2_GROK_REBUT =================
        let stage = Stage::R2GrokRebut;
        let prompt = self.prompts.render_user(
            Role::GrokRebuttal,
            &[("critique", text_of(&state.audit_comments))],
        );
        let request = self.request(stage, prompt, &self.options.grok_model, false);
        let result = self.grok.call(&request).await;

        match &result.text {
            Some(text) => {
                state.grok_r2.set(text.clone())?;
                record(&mut state, stage, &request, &result, StepOutcome::Completed);
                info!(stage = %stage, chars = text.len(), "Rebuttal received");
            }
            None => {
                state.grok_r2.set(String::new())?;
                record(&mut state, stage, &request, &result, StepOutcome::Degraded);
                warn!(stage = %stage, "No rebuttal, continuing");
            }
        }

        if self.halted(stage, &state, gate).await? {
            return Ok(RunReport::halted(state, stage));
        }

        // ================= R2_GEMINI_REBUT =================
        let stage = Stage::R2GeminiRebut;
        let grok_rebuttal = text_of(&state.grok_r2).to_string();

        if grok_rebuttal.trim().is_empty() {
            state.gemini_r2.set(String::new())?;
            let request = self.request(stage, String::new(), &self.options.gemini_model, false);
            record(
                &mut state,
                stage,
                &request,
                &ProviderCallResult::failed(),
                StepOutcome::Skipped,
            );
            info!(stage = %stage, "Skipped: no rebuttal to answer");
        } else {
            let prompt = self
                .prompts
                .render_user(Role::GeminiRebuttal, &[("rebuttal", &grok_rebuttal)]);
            let request = self.request(stage, prompt, &self.options.gemini_model, false);
            let result = self.gemini.call(&request).await;

            match &result.text {
                Some(text) => {
                    state.gemini_r2.set(text.clone())?;
                    record(&mut state, stage, &request, &result, StepOutcome::Completed);
                    info!(stage = %stage, chars = text.len(), "Response to rebuttal received");
                }
                None => {
                    state.gemini_r2.set(String::new())?;
                    record(&mut state, stage, &request, &result, StepOutcome::Degraded);
                    warn!(stage = %stage, "No response to rebuttal, continuing");
                }
            }

            if self.halted(stage, &state, gate).await? {
                return Ok(RunReport::halted(state, stage));
            }
        }

        // ================= FINAL_OPENAI =================
        let stage = Stage::FinalOpenai;
        let beta_text = format_cagr(state.beta());
        let prompt = self.prompts.render_user(
            Role::OpenAi,
            &[
                ("alpha_cagr", &alpha_text),
                ("beta_cagr", &beta_text),
                ("draft_report", text_of(&state.draft_report)),
                ("audit_comments", text_of(&state.audit_comments)),
                ("grok_rebuttal", or_none(text_of(&state.grok_r2))),
                ("gemini_rebuttal", or_none(text_of(&state.gemini_r2))),
                ("portfolio", &input.portfolio_prompt),
            ],
        );
        let request = self.request(stage, prompt, &self.options.openai_model, false);
        let result = self.openai.call(&request).await;

        match (&result.text, &result.model_used) {
            (Some(text), Some(model)) => {
                state.final_report.set(text.clone())?;
                state.openai_model_final.set(model.clone())?;
                record(&mut state, stage, &request, &result, StepOutcome::Completed);
                info!(stage = %stage, model = %model, "Final report received");
            }
            _ => {
                let draft = text_of(&state.draft_report).to_string();
                state.final_report.set(draft)?;
                state.openai_model_final.set(MODEL_NOT_AVAILABLE.to_string())?;
                record(&mut state, stage, &request, &result, StepOutcome::Degraded);
                warn!(stage = %stage, "Final arbitration failed, using the draft as the report");
            }
        }

        if self.halted(stage, &state, gate).await? {
            return Ok(RunReport::halted(state, stage));
        }

        let outcome = if state.degraded_stages().is_empty() {
            RunOutcome::Completed
        } else {
            RunOutcome::Degraded
        };

        info!(run_id = %state.run_id, outcome = ?outcome, "Consensus run finished");

        Ok(RunReport { state, outcome })
    }

    fn request(&self, stage: Stage, prompt: String, preferred: &str, use_tools: bool) -> CallRequest {
        CallRequest {
            prompt,
            system: self.prompts.system(stage.role()).to_string(),
            preferred_model: preferred.to_string(),
            use_tools,
        }
    }

    async fn halted(&self, stage: Stage, state: &ConsensusState, gate: &dyn StepGate) -> Result<bool> {
        let decision = gate.after_step(stage, state).await?;
        if decision == GateDecision::Halt {
            info!(stage = %stage, "Run halted by operator");
        }
        Ok(decision == GateDecision::Halt)
    }
}

impl RunReport {
    fn halted(state: ConsensusState, stage: Stage) -> Self {
        Self {
            state,
            outcome: RunOutcome::Halted(stage),
        }
    }
}

fn record(
    state: &mut ConsensusState,
    stage: Stage,
    request: &CallRequest,
    result: &ProviderCallResult,
    outcome: StepOutcome,
) {
    state.record_step(StepRecord {
        stage,
        role: stage.role(),
        provider: stage.provider(),
        system_prompt: request.system.clone(),
        prompt: request.prompt.clone(),
        response: result.text.clone(),
        model_used: result.model_used.clone(),
        outcome,
        recorded_at: Utc::now(),
    });
}

fn text_of(field: &WriteOnce<String>) -> &str {
    field.get().map(String::as_str).unwrap_or("")
}

fn or_none(text: &str) -> &str {
    if text.trim().is_empty() {
        NONE_MARKER
    } else {
        text
    }
}

/// `17.5%`, or the placeholder when no number was extracted
pub fn format_cagr(value: Option<f64>) -> String {
    value
        .map(|v| format!("{}%", v))
        .unwrap_or_else(|| NOT_PROVIDED.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;
    use crate::providers::ScriptedAdapter;
    use std::sync::Mutex;

    const DRAFT: &str = "Draft report\n```json\n{\"alpha_cagr\": 17.5, \"current_total_krw\": 123}\n```";
    const AUDIT: &str = "Audit\n```json\n{\"beta_cagr\": 11.0, \"risk_level\": \"mid\"}\n```";

    struct Harness {
        grok: Arc<ScriptedAdapter>,
        gemini: Arc<ScriptedAdapter>,
        openai: Arc<ScriptedAdapter>,
    }

    impl Harness {
        fn new(grok: ScriptedAdapter, gemini: ScriptedAdapter, openai: ScriptedAdapter) -> Self {
            Self {
                grok: Arc::new(grok),
                gemini: Arc::new(gemini),
                openai: Arc::new(openai),
            }
        }

        fn healthy() -> Self {
            Self::new(
                ScriptedAdapter::new(Provider::Grok)
                    .then_reply(DRAFT, "grok-4-1-fast-reasoning")
                    .then_reply("I accept point 1, rebut point 2", "grok-4-1-fast-reasoning"),
                ScriptedAdapter::new(Provider::Gemini)
                    .then_reply(AUDIT, "gemini-3-flash-preview")
                    .then_reply("I maintain my position", "gemini-3-flash-preview"),
                ScriptedAdapter::replying(Provider::OpenAi, "Final report: 14%", "gpt-5.2"),
            )
        }

        fn orchestrator(&self) -> ConsensusOrchestrator {
            ConsensusOrchestrator::new(
                self.grok.clone(),
                self.gemini.clone(),
                self.openai.clone(),
                PromptBook::fallback(),
                PipelineOptions::default(),
            )
        }

        fn total_calls(&self) -> usize {
            self.grok.call_count() + self.gemini.call_count() + self.openai.call_count()
        }
    }

    fn input() -> PipelineInput {
        PipelineInput {
            portfolio_prompt: "Holdings: TSLA 10 shares".to_string(),
            snapshot: MarketSnapshot::empty(),
            holdings: BTreeMap::new(),
            run_date: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_full_run_makes_five_calls() {
        let harness = Harness::healthy();
        let report = harness.orchestrator().run(&input(), &NoopGate).await.unwrap();
        let state = &report.state;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(harness.total_calls(), 5);
        assert_eq!(state.alpha(), Some(17.5));
        assert_eq!(state.beta(), Some(11.0));
        assert_eq!(state.risk_level.get().cloned().flatten().as_deref(), Some("mid"));
        assert_eq!(text_of(&state.final_report), "Final report: 14%");
        assert_eq!(text_of(&state.openai_model_final), "gpt-5.2");
        assert_eq!(state.steps().len(), 5);

        // Stage order
        let stages: Vec<Stage> = state.steps().iter().map(|s| s.stage).collect();
        assert_eq!(stages, Stage::ALL.to_vec());

        // Tool flags per stage
        let grok_calls = harness.grok.calls();
        assert!(grok_calls[0].use_tools);
        assert!(!grok_calls[1].use_tools);
        assert!(harness.gemini.calls()[0].use_tools);
        assert!(!harness.gemini.calls()[1].use_tools);

        // Final prompt carries both forecasts and both rebuttals
        let final_prompt = &harness.openai.calls()[0].prompt;
        assert!(final_prompt.contains("17.5%"));
        assert!(final_prompt.contains("11%"));
        assert!(final_prompt.contains("I accept point 1"));
        assert!(final_prompt.contains("I maintain my position"));
    }

    #[tokio::test]
    async fn test_r1_prompt_carries_dates_and_market_data() {
        let harness = Harness::healthy();
        harness.orchestrator().run(&input(), &NoopGate).await.unwrap();

        let first = &harness.grok.calls()[0];
        assert!(first.prompt.contains("2026-01-06"));
        assert!(first.prompt.contains("2026-01-05"));
        assert!(first.prompt.contains("USD/KRW: lookup failed"));
        assert!(first.prompt.contains("Holdings: TSLA 10 shares"));
        assert_eq!(first.system, PromptBook::fallback().system(Role::Grok));
    }

    #[tokio::test]
    async fn test_grok_failure_aborts_before_gemini() {
        let harness = Harness::new(
            ScriptedAdapter::new(Provider::Grok),
            ScriptedAdapter::replying(Provider::Gemini, AUDIT, "gemini-pro"),
            ScriptedAdapter::replying(Provider::OpenAi, "final", "gpt-4o"),
        );

        let err = harness.orchestrator().run(&input(), &NoopGate).await.unwrap_err();

        assert!(matches!(err, ConsensusError::Aborted { ref stage, .. } if stage == "R1_GROK"));
        assert_eq!(harness.gemini.call_count(), 0);
        assert_eq!(harness.openai.call_count(), 0);
    }

    #[tokio::test]
    async fn test_gemini_failure_degrades() {
        let harness = Harness::new(
            ScriptedAdapter::replying(Provider::Grok, DRAFT, "grok-3"),
            ScriptedAdapter::new(Provider::Gemini),
            ScriptedAdapter::replying(Provider::OpenAi, "final", "gpt-4o"),
        );

        let report = harness.orchestrator().run(&input(), &NoopGate).await.unwrap();
        let state = &report.state;

        assert_eq!(report.outcome, RunOutcome::Degraded);
        assert_eq!(text_of(&state.audit_comments), REVIEW_UNAVAILABLE);
        assert_eq!(state.beta(), None);

        // Rebuttal still runs against the placeholder critique
        assert!(harness.grok.calls()[1].prompt.contains(REVIEW_UNAVAILABLE));

        let final_prompt = &harness.openai.calls()[0].prompt;
        assert!(final_prompt.contains(NOT_PROVIDED));
        assert!(final_prompt.contains(REVIEW_UNAVAILABLE));
        assert_eq!(state.degraded_stages(), vec![Stage::R1Gemini, Stage::R2GeminiRebut]);
    }

    #[tokio::test]
    async fn test_empty_grok_rebuttal_skips_gemini_rebuttal() {
        let harness = Harness::new(
            ScriptedAdapter::new(Provider::Grok).then_reply(DRAFT, "grok-3").then_fail(),
            ScriptedAdapter::replying(Provider::Gemini, AUDIT, "gemini-pro"),
            ScriptedAdapter::replying(Provider::OpenAi, "final", "gpt-4o"),
        );

        let report = harness.orchestrator().run(&input(), &NoopGate).await.unwrap();
        let state = &report.state;

        assert_eq!(harness.gemini.call_count(), 1);
        assert_eq!(text_of(&state.gemini_r2), "");
        let skipped = &state.steps()[3];
        assert_eq!(skipped.stage, Stage::R2GeminiRebut);
        assert_eq!(skipped.outcome, StepOutcome::Skipped);

        let final_prompt = &harness.openai.calls()[0].prompt;
        assert_eq!(final_prompt.matches(NONE_MARKER).count(), 2);
    }

    #[tokio::test]
    async fn test_final_failure_falls_back_to_draft() {
        let harness = Harness::new(
            ScriptedAdapter::replying(Provider::Grok, DRAFT, "grok-3"),
            ScriptedAdapter::replying(Provider::Gemini, AUDIT, "gemini-pro"),
            ScriptedAdapter::new(Provider::OpenAi),
        );

        let report = harness.orchestrator().run(&input(), &NoopGate).await.unwrap();

        assert_eq!(text_of(&report.state.final_report), DRAFT);
        assert_eq!(text_of(&report.state.openai_model_final), MODEL_NOT_AVAILABLE);
        assert_eq!(report.outcome, RunOutcome::Degraded);
    }

    #[tokio::test]
    async fn test_unparseable_alpha_is_not_provided() {
        let harness = Harness::new(
            ScriptedAdapter::replying(Provider::Grok, "Draft without any JSON", "grok-3"),
            ScriptedAdapter::replying(Provider::Gemini, AUDIT, "gemini-pro"),
            ScriptedAdapter::replying(Provider::OpenAi, "final", "gpt-4o"),
        );

        let report = harness.orchestrator().run(&input(), &NoopGate).await.unwrap();

        assert_eq!(report.state.alpha(), None);
        assert!(harness.gemini.calls()[0].prompt.contains(NOT_PROVIDED));
    }

    /// Halts once the given stage has run and remembers what it saw
    struct HaltAt {
        stage: Stage,
        seen: Mutex<Vec<Stage>>,
    }

    #[async_trait]
    impl StepGate for HaltAt {
        async fn after_step(&self, stage: Stage, _state: &ConsensusState) -> Result<GateDecision> {
            self.seen.lock().unwrap().push(stage);
            Ok(if stage >= self.stage {
                GateDecision::Halt
            } else {
                GateDecision::Continue
            })
        }
    }

    #[tokio::test]
    async fn test_gate_halts_with_partial_state() {
        let harness = Harness::healthy();
        let gate = HaltAt {
            stage: Stage::R1Gemini,
            seen: Mutex::new(Vec::new()),
        };

        let report = harness.orchestrator().run(&input(), &gate).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Halted(Stage::R1Gemini));
        assert_eq!(harness.total_calls(), 2);
        assert_eq!(report.state.steps().len(), 2);
        assert!(report.state.final_report.get().is_none());
        assert_eq!(*gate.seen.lock().unwrap(), vec![Stage::R1Grok, Stage::R1Gemini]);
    }

    #[tokio::test]
    async fn test_skipped_stage_is_not_gated() {
        let harness = Harness::new(
            ScriptedAdapter::new(Provider::Grok).then_reply(DRAFT, "grok-3").then_fail(),
            ScriptedAdapter::replying(Provider::Gemini, AUDIT, "gemini-pro"),
            ScriptedAdapter::replying(Provider::OpenAi, "final", "gpt-4o"),
        );
        let gate = HaltAt {
            stage: Stage::R2GeminiRebut,
            seen: Mutex::new(Vec::new()),
        };

        let report = harness.orchestrator().run(&input(), &gate).await.unwrap();

        // Stage 4 never ran, so the gate first fires at stage 5
        assert_eq!(report.outcome, RunOutcome::Halted(Stage::FinalOpenai));
        assert!(!gate.seen.lock().unwrap().contains(&Stage::R2GeminiRebut));
    }

    #[test]
    fn test_format_cagr() {
        assert_eq!(format_cagr(Some(17.5)), "17.5%");
        assert_eq!(format_cagr(None), NOT_PROVIDED);
    }
}
