//! Interactive debug shell
//!
//! With `--debug-step N` the pipeline pauses after the first executed stage
//! numbered N or later. The operator can inspect the step, question the
//! stage's provider, resume with `/continue` or stop with `/quit`. A stopped
//! run is persisted with whatever state it reached.

use crate::consensus::{ConsensusState, GateDecision, Stage, StepGate, StepRecord};
use crate::error::ConsensusError;
use crate::models::{CallRequest, Provider};
use crate::providers::ProviderAdapter;
use crate::Result;
use async_trait::async_trait;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const HELP: &str = "Commands:
  /show      print the full response of this step
  /prompt    print the prompt sent for this step
  /continue  resume the pipeline (no further pauses)
  /quit      stop here and write the partial report
Anything else is sent to this step's provider.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Continue,
    Quit,
    Show,
    Prompt,
    Help,
    Empty,
    Ask(String),
}

impl ShellCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => ShellCommand::Empty,
            "/continue" | "/c" => ShellCommand::Continue,
            "/quit" | "/q" | "/exit" => ShellCommand::Quit,
            "/show" => ShellCommand::Show,
            "/prompt" => ShellCommand::Prompt,
            "/help" | "/?" => ShellCommand::Help,
            other => ShellCommand::Ask(other.to_string()),
        }
    }
}

pub struct DebugShell {
    cutoff: Stage,
    armed: AtomicBool,
    grok: Arc<dyn ProviderAdapter>,
    gemini: Arc<dyn ProviderAdapter>,
    openai: Arc<dyn ProviderAdapter>,
    /// Operator Q&A of the current session, replayed to the provider
    transcript: Mutex<Vec<(String, String)>>,
}

impl DebugShell {
    pub fn new(
        cutoff: Stage,
        grok: Arc<dyn ProviderAdapter>,
        gemini: Arc<dyn ProviderAdapter>,
        openai: Arc<dyn ProviderAdapter>,
    ) -> Self {
        Self {
            cutoff,
            armed: AtomicBool::new(true),
            grok,
            gemini,
            openai,
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    fn adapter(&self, provider: Provider) -> &Arc<dyn ProviderAdapter> {
        match provider {
            Provider::Grok => &self.grok,
            Provider::Gemini => &self.gemini,
            Provider::OpenAi => &self.openai,
        }
    }

    /// Apply one command. `Some` ends the session with that decision.
    pub async fn handle(&self, command: ShellCommand, step: &StepRecord) -> Option<GateDecision> {
        match command {
            ShellCommand::Continue => {
                self.armed.store(false, Ordering::SeqCst);
                Some(GateDecision::Continue)
            }
            ShellCommand::Quit => Some(GateDecision::Halt),
            ShellCommand::Show => {
                println!("{}", step.response.as_deref().unwrap_or("(no response)"));
                None
            }
            ShellCommand::Prompt => {
                println!("{}", step.prompt);
                None
            }
            ShellCommand::Help => {
                println!("{}", HELP);
                None
            }
            ShellCommand::Empty => None,
            ShellCommand::Ask(question) => {
                let answer = self.ask(step, &question).await;
                println!("{}", answer.as_deref().unwrap_or("(no answer from provider)"));
                None
            }
        }
    }

    /// Send an operator question to the step's provider, with the step output
    /// and earlier questions as context.
    pub async fn ask(&self, step: &StepRecord, question: &str) -> Option<String> {
        let mut prompt = format!(
            "Your output for step {}:\n\n{}\n\n---\n",
            step.stage,
            step.response.as_deref().unwrap_or("(no response)")
        );

        if let Ok(transcript) = self.transcript.lock() {
            for (q, a) in transcript.iter() {
                prompt.push_str(&format!("Operator: {}\nYou: {}\n\n", q, a));
            }
        }
        prompt.push_str(&format!("Operator: {}", question));

        let request = CallRequest {
            prompt,
            system: step.system_prompt.clone(),
            preferred_model: step.model_used.clone().unwrap_or_default(),
            use_tools: false,
        };

        debug!(stage = %step.stage, provider = %step.provider, "Debug shell question");
        let answer = self.adapter(step.provider).call(&request).await.text?;

        if let Ok(mut transcript) = self.transcript.lock() {
            transcript.push((question.to_string(), answer.clone()));
        }
        Some(answer)
    }

    async fn session(&self, stage: Stage, state: &ConsensusState) -> Result<GateDecision> {
        let step = match state.last_step() {
            Some(step) => step.clone(),
            None => return Ok(GateDecision::Continue),
        };

        if let Ok(mut transcript) = self.transcript.lock() {
            transcript.clear();
        }

        println!(
            "\n== Paused after step {} ({}) | provider {} | model {} | outcome {:?}",
            stage.number(),
            stage,
            step.provider,
            step.model_used.as_deref().unwrap_or("N/A"),
            step.outcome
        );
        println!("{}", HELP);

        let prompt = format!("[{}] > ", stage);
        let mut history: Vec<String> = Vec::new();

        loop {
            let line = match read_line(&prompt, &history)? {
                Some(line) => line,
                None => {
                    info!(stage = %stage, "Debug shell input closed, halting");
                    return Ok(GateDecision::Halt);
                }
            };

            if !line.trim().is_empty() {
                history.push(line.clone());
            }
            if let Some(decision) = self.handle(ShellCommand::parse(&line), &step).await {
                info!(stage = %stage, decision = ?decision, "Debug shell closed");
                return Ok(decision);
            }
        }
    }
}

/// Read one line. `None` on Ctrl-C or EOF. The editor never outlives the call.
fn read_line(prompt: &str, history: &[String]) -> Result<Option<String>> {
    let mut editor = DefaultEditor::new().map_err(|e| ConsensusError::ShellError(e.to_string()))?;
    for entry in history {
        let _ = editor.add_history_entry(entry.as_str());
    }

    match editor.readline(prompt) {
        Ok(line) => Ok(Some(line)),
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(None),
        Err(e) => Err(ConsensusError::ShellError(e.to_string())),
    }
}

#[async_trait]
impl StepGate for DebugShell {
    async fn after_step(&self, stage: Stage, state: &ConsensusState) -> Result<GateDecision> {
        if !self.is_armed() || stage < self.cutoff {
            return Ok(GateDecision::Continue);
        }
        self.session(stage, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::StepOutcome;
    use crate::providers::ScriptedAdapter;
    use chrono::Utc;

    fn shell(gemini: Arc<ScriptedAdapter>) -> DebugShell {
        DebugShell::new(
            Stage::R1Gemini,
            Arc::new(ScriptedAdapter::new(Provider::Grok)),
            gemini,
            Arc::new(ScriptedAdapter::new(Provider::OpenAi)),
        )
    }

    fn gemini_step() -> StepRecord {
        StepRecord {
            stage: Stage::R1Gemini,
            role: Stage::R1Gemini.role(),
            provider: Provider::Gemini,
            system_prompt: "auditor system".into(),
            prompt: "audit this".into(),
            response: Some("Beta is 9%".into()),
            model_used: Some("gemini-2.5-flash".into()),
            outcome: StepOutcome::Completed,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ShellCommand::parse(" /continue "), ShellCommand::Continue);
        assert_eq!(ShellCommand::parse("/q"), ShellCommand::Quit);
        assert_eq!(ShellCommand::parse(""), ShellCommand::Empty);
        assert_eq!(
            ShellCommand::parse("why 9%?"),
            ShellCommand::Ask("why 9%?".into())
        );
    }

    #[tokio::test]
    async fn test_earlier_stages_pass_through() {
        let shell = shell(Arc::new(ScriptedAdapter::new(Provider::Gemini)));
        let state = ConsensusState::new();

        let decision = shell.after_step(Stage::R1Grok, &state).await.unwrap();
        assert_eq!(decision, GateDecision::Continue);
    }

    #[tokio::test]
    async fn test_continue_disarms_and_quit_halts() {
        let shell = shell(Arc::new(ScriptedAdapter::new(Provider::Gemini)));
        let step = gemini_step();

        assert_eq!(shell.handle(ShellCommand::Show, &step).await, None);
        assert_eq!(
            shell.handle(ShellCommand::Quit, &step).await,
            Some(GateDecision::Halt)
        );
        assert!(shell.is_armed());

        assert_eq!(
            shell.handle(ShellCommand::Continue, &step).await,
            Some(GateDecision::Continue)
        );
        assert!(!shell.is_armed());

        // Disarmed: later stages never open a session
        let state = ConsensusState::new();
        let decision = shell.after_step(Stage::FinalOpenai, &state).await.unwrap();
        assert_eq!(decision, GateDecision::Continue);
    }

    #[tokio::test]
    async fn test_questions_go_to_the_step_provider() {
        let gemini = Arc::new(
            ScriptedAdapter::new(Provider::Gemini)
                .then_reply("Because of rate risk", "gemini-2.5-flash")
                .then_reply("Yes", "gemini-2.5-flash"),
        );
        let shell = shell(gemini.clone());
        let step = gemini_step();

        let first = shell.ask(&step, "why 9%?").await;
        let second = shell.ask(&step, "final answer?").await;

        assert_eq!(first.as_deref(), Some("Because of rate risk"));
        assert_eq!(second.as_deref(), Some("Yes"));

        let calls = gemini.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].preferred_model, "gemini-2.5-flash");
        assert_eq!(calls[0].system, "auditor system");
        assert!(!calls[0].use_tools);
        assert!(calls[0].prompt.contains("Beta is 9%"));
        // Second question carries the first exchange
        assert!(calls[1].prompt.contains("Operator: why 9%?\nYou: Because of rate risk"));
    }
}
