//! Report and audit writer
//!
//! A run leaves three things on disk: the report markdown, an audit directory
//! with every step's prompt and response, and a `manifest.json` that pins each
//! audit file by SHA-256.

use crate::consensus::{
    format_cagr, ConsensusState, RunOutcome, RunReport, StepRecord, MODEL_NOT_AVAILABLE, NONE_MARKER,
};
use crate::error::ConsensusError;
use crate::models::MarketSnapshot;
use crate::usage::UsageSummary;
use crate::Result;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const STATE_FILE: &str = "state.json";

/// `portfolio_report_<YYYYmmdd>_<HHMM>_<model parts>.md`
pub fn report_filename(
    at: DateTime<Local>,
    openai_model: Option<&str>,
    grok_model: Option<&str>,
    gemini_model: Option<&str>,
) -> String {
    fn usable(model: Option<&str>) -> Option<&str> {
        model.filter(|m| !m.is_empty() && *m != MODEL_NOT_AVAILABLE)
    }

    let mut parts = Vec::new();
    if let Some(model) = usable(openai_model) {
        parts.push(format!("openai-{}", model.replace(['-', '_'], "")));
    }
    if let Some(model) = usable(grok_model) {
        parts.push(format!("grok-{}", model.replace('_', "-")));
    }
    if let Some(model) = usable(gemini_model) {
        parts.push(format!("gemini-{}", model.replace('_', "-")));
    }

    let suffix = if parts.is_empty() {
        "3ai".to_string()
    } else {
        parts.join("_")
    };

    format!(
        "portfolio_report_{}_{}.md",
        at.format("%Y%m%d_%H%M"),
        suffix
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditFile {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Serialize)]
pub struct Manifest {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report_file: String,
    pub models: ModelsUsed,
    pub alpha_cagr: Option<f64>,
    pub beta_cagr: Option<f64>,
    pub risk_level: Option<String>,
    pub degraded_stages: Vec<String>,
    pub market: MarketSnapshot,
    pub usage: UsageSummary,
    pub report_sha256: String,
    pub files: Vec<AuditFile>,
}

#[derive(Debug, Serialize)]
pub struct ModelsUsed {
    pub grok: Option<String>,
    pub gemini: Option<String>,
    pub openai: Option<String>,
}

/// Paths of everything written for one run
#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub report_path: PathBuf,
    pub audit_dir: PathBuf,
    pub manifest_path: PathBuf,
}

pub struct ReportWriter {
    output_dir: PathBuf,
    output_file: Option<PathBuf>,
}

impl ReportWriter {
    /// `output_file`, when given, overrides the generated name. Relative
    /// paths resolve against `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>, output_file: Option<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            output_file,
        }
    }

    pub fn report_path(&self, state: &ConsensusState) -> PathBuf {
        match &self.output_file {
            Some(file) if file.is_absolute() => file.clone(),
            Some(file) => self.output_dir.join(file),
            None => self.output_dir.join(report_filename(
                Local::now(),
                state.openai_model_final.get().map(String::as_str),
                state.grok_model.get().map(String::as_str),
                state.gemini_model.get().map(String::as_str),
            )),
        }
    }

    /// Persist a finished, degraded or halted run
    pub fn write(
        &self,
        report: &RunReport,
        snapshot: &MarketSnapshot,
        usage: &UsageSummary,
    ) -> Result<WrittenReport> {
        let state = &report.state;
        let report_path = self.report_path(state);

        if report_path.is_dir() {
            return Err(ConsensusError::ReportError(format!(
                "{} is a directory",
                report_path.display()
            )));
        }
        if let Some(parent) = report_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if report_path.exists() {
            warn!(path = %report_path.display(), "Report file exists, overwriting");
        }

        let markdown = render_report(report, snapshot, usage);
        fs::write(&report_path, markdown)?;
        let report_sha256 = hash_file(&report_path)?;

        let audit_dir = audit_dir_for(&report_path);
        fs::create_dir_all(&audit_dir)?;

        let mut files = Vec::new();
        for (index, step) in state.steps().iter().enumerate() {
            let stem = format!("{:02}_{}", index + 1, step.stage.name().to_lowercase());

            files.push(write_audit_file(
                &audit_dir,
                &format!("{}_prompt.md", stem),
                &render_prompt(step),
            )?);

            if let Some(response) = &step.response {
                files.push(write_audit_file(
                    &audit_dir,
                    &format!("{}_response.md", stem),
                    response,
                )?);
            }
        }

        files.push(write_audit_file(
            &audit_dir,
            STATE_FILE,
            &serde_json::to_string_pretty(state)?,
        )?);

        let manifest = Manifest {
            run_id: state.run_id,
            outcome: report.outcome,
            started_at: state.started_at,
            finished_at: Utc::now(),
            report_file: report_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            models: ModelsUsed {
                grok: state.grok_model.get().cloned(),
                gemini: state.gemini_model.get().cloned(),
                openai: state.openai_model_final.get().cloned(),
            },
            alpha_cagr: state.alpha(),
            beta_cagr: state.beta(),
            risk_level: state.risk_level.get().cloned().flatten(),
            degraded_stages: state
                .degraded_stages()
                .iter()
                .map(|s| s.name().to_string())
                .collect(),
            market: snapshot.clone(),
            usage: usage.clone(),
            report_sha256,
            files,
        };

        let manifest_path = audit_dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;

        info!(
            report = %report_path.display(),
            audit_dir = %audit_dir.display(),
            files = manifest.files.len(),
            "Report written"
        );

        Ok(WrittenReport {
            report_path,
            audit_dir,
            manifest_path,
        })
    }
}

/// `foo.md` -> `foo_audit/`
fn audit_dir_for(report_path: &Path) -> PathBuf {
    let stem = report_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report".to_string());
    report_path.with_file_name(format!("{}_audit", stem))
}

fn write_audit_file(dir: &Path, name: &str, contents: &str) -> Result<AuditFile> {
    let path = dir.join(name);
    fs::write(&path, contents)?;

    Ok(AuditFile {
        name: name.to_string(),
        bytes: contents.len() as u64,
        sha256: hash_file(&path)?,
    })
}

/// SHA-256 of a file, streamed from disk into the hasher
pub fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut HashWriter(&mut hasher))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn render_prompt(step: &StepRecord) -> String {
    format!(
        "# {} ({})\n\nOutcome: {:?}\nModel: {}\n\n## System\n\n{}\n\n## User\n\n{}\n",
        step.stage,
        step.provider,
        step.outcome,
        step.model_used.as_deref().unwrap_or(MODEL_NOT_AVAILABLE),
        step.system_prompt,
        step.prompt
    )
}

fn render_report(report: &RunReport, snapshot: &MarketSnapshot, usage: &UsageSummary) -> String {
    let state = &report.state;
    let model = |m: Option<&String>| m.cloned().unwrap_or_else(|| MODEL_NOT_AVAILABLE.to_string());
    let text = |m: Option<&String>| m.cloned().unwrap_or_default();
    let mut out = String::new();

    let _ = writeln!(out, "# Portfolio Report (3-AI consensus)");
    let _ = writeln!(
        out,
        "**Written: {}** | run `{}`\n",
        Local::now().format("%Y-%m-%d %H:%M"),
        state.run_id
    );

    if let RunOutcome::Halted(stage) = report.outcome {
        let _ = writeln!(out, "> Run halted by the operator after {}.\n", stage);
    }

    if let Some(rate) = snapshot.usd_krw_rate {
        let _ = writeln!(out, "- USD/KRW: {:.2}", rate);
    }
    if !snapshot.us_prices.is_empty() {
        let tickers: Vec<&str> = snapshot.us_prices.keys().map(String::as_str).collect();
        let _ = writeln!(out, "- US prices: {}", tickers.join(", "));
    }

    let _ = writeln!(
        out,
        "\n**Growth consensus:** Alpha (Grok) {} -> Beta (Gemini) {} -> final decision (OpenAI)\n",
        format_cagr(state.alpha()),
        format_cagr(state.beta())
    );
    let _ = writeln!(out, "**Models:**");
    let _ = writeln!(out, "- Grok (draft): `{}`", model(state.grok_model.get()));
    let _ = writeln!(out, "- Gemini (audit): `{}`", model(state.gemini_model.get()));
    let _ = writeln!(out, "- OpenAI (final): `{}`\n", model(state.openai_model_final.get()));
    let _ = writeln!(
        out,
        "**Cost:** ${:.4} over {} calls{}\n",
        usage.total_usd,
        usage.calls,
        usage
            .total_krw
            .map(|krw| format!(" (KRW {:.0})", krw))
            .unwrap_or_default()
    );

    let body = state
        .final_report
        .get()
        .or_else(|| state.draft_report.get())
        .cloned()
        .unwrap_or_default();
    let _ = writeln!(out, "---\n\n## Final report\n\n{}\n", body);

    let _ = writeln!(out, "---\n\n## Deliberation\n");
    let _ = writeln!(out, "### Draft (Grok)\n\n{}\n", text(state.draft_report.get()));
    let _ = writeln!(out, "### Audit (Gemini)\n\n{}\n", text(state.audit_comments.get()));

    let rebuttal = |m: Option<&String>| {
        m.filter(|t| !t.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| NONE_MARKER.to_string())
    };
    let _ = writeln!(out, "### Rebuttal (Grok)\n\n{}\n", rebuttal(state.grok_r2.get()));
    let _ = writeln!(out, "### Response (Gemini)\n\n{}", rebuttal(state.gemini_r2.get()));

    out
}
