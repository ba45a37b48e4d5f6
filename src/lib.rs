//! Portfolio Consensus
//!
//! Produces a 12-month portfolio forecast by putting three AI providers
//! through a fixed deliberation:
//! - Grok drafts the report and an Alpha CAGR with live market data
//! - Gemini audits the draft and gives a Beta CAGR
//! - Grok and Gemini each answer the other once
//! - OpenAI synthesizes the final consensus
//!
//! PIPELINE:
//! R1_GROK → R1_GEMINI → R2_GROK_REBUT → R2_GEMINI_REBUT → FINAL_OPENAI

pub mod audit;
pub mod config;
pub mod consensus;
pub mod debug_shell;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod market;
pub mod models;
pub mod prompts;
pub mod providers;
pub mod transport;
pub mod usage;

pub use error::{ConsensusError, Result};

// Re-export common types
pub use consensus::{ConsensusOrchestrator, PipelineInput, PipelineOptions, RunOutcome, Stage};
pub use models::*;
