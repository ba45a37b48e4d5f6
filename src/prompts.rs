//! Role prompts
//!
//! Each role owns a `(system_prompt, user_template)` pair. Either half can be
//! overridden by a file in the prompts directory; otherwise the built-in
//! fallback is used. The table is built once at startup.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Data analyst: first draft and the Alpha forecast
    Grok,
    /// Risk auditor: critique and the Beta forecast
    Gemini,
    /// Chief manager: final arbitration
    #[serde(rename = "openai")]
    OpenAi,
    /// Grok's answer to the audit
    GrokRebuttal,
    /// Gemini's answer to Grok's rebuttal
    GeminiRebuttal,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Grok,
        Role::Gemini,
        Role::OpenAi,
        Role::GrokRebuttal,
        Role::GeminiRebuttal,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Role::Grok => "grok",
            Role::Gemini => "gemini",
            Role::OpenAi => "openai",
            Role::GrokRebuttal => "grok_r2",
            Role::GeminiRebuttal => "gemini_r2",
        }
    }

    /// Placeholders a user template must carry. A template without one of
    /// them would drop that input from the stage's prompt.
    pub fn required_placeholders(&self) -> &'static [&'static str] {
        match self {
            Role::Grok => &["date", "reference_date", "market_data", "portfolio"],
            Role::Gemini => &["alpha_cagr", "draft_report", "portfolio_excerpt"],
            Role::OpenAi => &[
                "alpha_cagr",
                "beta_cagr",
                "draft_report",
                "audit_comments",
                "grok_rebuttal",
                "gemini_rebuttal",
                "portfolio",
            ],
            Role::GrokRebuttal => &["critique"],
            Role::GeminiRebuttal => &["rebuttal"],
        }
    }

    fn index(&self) -> usize {
        match self {
            Role::Grok => 0,
            Role::Gemini => 1,
            Role::OpenAi => 2,
            Role::GrokRebuttal => 3,
            Role::GeminiRebuttal => 4,
        }
    }

    fn fallback_system(&self) -> &'static str {
        match self {
            Role::Grok => FALLBACK_GROK_SYSTEM,
            Role::Gemini => FALLBACK_GEMINI_SYSTEM,
            Role::OpenAi => FALLBACK_OPENAI_SYSTEM,
            Role::GrokRebuttal => FALLBACK_GROK_R2_SYSTEM,
            Role::GeminiRebuttal => FALLBACK_GEMINI_R2_SYSTEM,
        }
    }

    fn fallback_user(&self) -> &'static str {
        match self {
            Role::Grok => FALLBACK_GROK_USER,
            Role::Gemini => FALLBACK_GEMINI_USER,
            Role::OpenAi => FALLBACK_OPENAI_USER,
            Role::GrokRebuttal => FALLBACK_GROK_R2_USER,
            Role::GeminiRebuttal => FALLBACK_GEMINI_R2_USER,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptSource {
    File,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleConfig {
    pub system_prompt: String,
    pub user_template: String,
    pub system_source: PromptSource,
    pub user_source: PromptSource,
}

/// Resolved prompts for every role
#[derive(Debug, Clone)]
pub struct PromptBook {
    roles: [RoleConfig; 5],
}

impl PromptBook {
    /// Built-in prompts only
    pub fn fallback() -> Self {
        Self {
            roles: Role::ALL.map(|role| RoleConfig {
                system_prompt: role.fallback_system().to_string(),
                user_template: role.fallback_user().to_string(),
                system_source: PromptSource::Fallback,
                user_source: PromptSource::Fallback,
            }),
        }
    }

    /// Load `<dir>/<role>_system.md` and `<dir>/<role>_user.md` for every role
    pub fn load(dir: &Path) -> Self {
        let roles = Role::ALL.map(|role| {
            let (system_prompt, system_source) = read_override(dir, role, "system")
                .map(|text| (text, PromptSource::File))
                .unwrap_or_else(|| (role.fallback_system().to_string(), PromptSource::Fallback));

            let (user_template, user_source) = read_override(dir, role, "user")
                .filter(|text| {
                    let missing = missing_placeholders(role, text);
                    if !missing.is_empty() {
                        warn!(
                            role = role.key(),
                            missing = ?missing,
                            "User template lacks required placeholders, using built-in prompt"
                        );
                    }
                    missing.is_empty()
                })
                .map(|text| (text, PromptSource::File))
                .unwrap_or_else(|| (role.fallback_user().to_string(), PromptSource::Fallback));

            debug!(
                role = role.key(),
                system_source = ?system_source,
                user_source = ?user_source,
                "Role prompts resolved"
            );

            RoleConfig {
                system_prompt,
                user_template,
                system_source,
                user_source,
            }
        });

        Self { roles }
    }

    pub fn get(&self, role: Role) -> &RoleConfig {
        &self.roles[role.index()]
    }

    pub fn system(&self, role: Role) -> &str {
        &self.get(role).system_prompt
    }

    /// Render the role's user template with `{{name}}` placeholders filled in
    pub fn render_user(&self, role: Role, vars: &[(&str, &str)]) -> String {
        render(&self.get(role).user_template, vars)
    }
}

pub fn override_path(dir: &Path, role: Role, kind: &str) -> PathBuf {
    dir.join(format!("{}_{}.md", role.key(), kind))
}

fn read_override(dir: &Path, role: Role, kind: &str) -> Option<String> {
    let path = override_path(dir, role, kind);
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Ok(_) => {
            warn!(path = %path.display(), "Prompt file is empty, using built-in prompt");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Prompt file unreadable, using built-in prompt");
            None
        }
    }
}

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{(\w+)\}\}").expect("placeholder pattern");
}

/// Required placeholders of `role` that `template` does not contain
pub fn missing_placeholders(role: Role, template: &str) -> Vec<&'static str> {
    role.required_placeholders()
        .iter()
        .copied()
        .filter(|name| !template.contains(&format!("{{{{{}}}}}", name)))
        .collect()
}

/// Replace `{{name}}` placeholders in one pass over the template, so text
/// inside inserted values is never expanded. Unknown placeholders are left as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

//
// ================= Built-in prompts =================
//

const FALLBACK_GROK_SYSTEM: &str = "You are the data analyst of the portfolio committee. \
Tabulate every holding without omission, use live FX and closing prices, and estimate an \
Alpha CAGR backed by data. End your answer with a JSON block: \
{\"alpha_cagr\": 0.0, \"current_total_krw\": 0, \"market_data\": {}}";

const FALLBACK_GEMINI_SYSTEM: &str = "You are the risk auditor of the portfolio committee. \
Review the analyst's draft and Alpha CAGR, check macro risks with search, and produce an \
independent, more conservative Beta CAGR. End your answer with a JSON block: \
{\"beta_cagr\": 0.0, \"risk_level\": \"low/mid/high\", \"audit_notes\": \"...\"}";

const FALLBACK_OPENAI_SYSTEM: &str = "You are the chief portfolio manager. Compare the Alpha \
and Beta forecasts and the rebuttal round, then settle on one final CAGR. Include every \
holding. Use plain markdown; no HTML. End your answer with a JSON block: \
{\"final_cagr\": 0.0}";

const FALLBACK_GROK_R2_SYSTEM: &str = "You are the data analyst of the portfolio committee. \
The risk auditor has critiqued your draft. For each point, state clearly whether you accept \
it or rebut it, with evidence.";

const FALLBACK_GEMINI_R2_SYSTEM: &str = "You are the risk auditor of the portfolio committee. \
The analyst has answered your critique. For each point, state whether you accept the \
rebuttal or maintain your position, with evidence.";

const FALLBACK_GROK_USER: &str = "[Step 1 - Data analyst] Tabulate every holding in the \
portfolio below, apply the live data provided, and estimate the Alpha CAGR.

Date: {{date}} (closing prices as of {{reference_date}})

{{market_data}}

---
Portfolio and operating guidelines:
{{portfolio}}
---

Draft structure: 1) portfolio objectives 2) market overview 3) holdings table (all \
positions) 4) roadmap check 5) closing comments. Markdown, all sections included.
End with: {\"alpha_cagr\": 0.0, \"current_total_krw\": 0, \"market_data\": {...}}";

const FALLBACK_GEMINI_USER: &str = "[Step 2 - Risk auditor] Review the analyst's draft and \
Alpha CAGR ({{alpha_cagr}}). Check macro indicators and black-swan risks, then produce an \
independent Beta CAGR that is more conservative than the analyst's.

End with: {\"beta_cagr\": 0.0, \"risk_level\": \"low/mid/high\", \"audit_notes\": \"...\"}

---
Analyst draft:
{{draft_report}}

---
Portfolio reference (excerpt):
{{portfolio_excerpt}}";

const FALLBACK_GROK_R2_USER: &str = "[Round 2 - Analyst rebuttal] Here is the risk \
auditor's critique of your draft. For each point, state ACCEPT or REBUT and why.

---
{{critique}}";

const FALLBACK_GEMINI_R2_USER: &str = "[Round 2 - Auditor response] Here is the analyst's \
rebuttal to your critique. For each point, state whether you ACCEPT the rebuttal or \
MAINTAIN your position, and whether your Beta CAGR changes.

---
{{rebuttal}}";

const FALLBACK_OPENAI_USER: &str = "[Final - Chief manager] Compare Alpha ({{alpha_cagr}}) \
and Beta ({{beta_cagr}}) and decide the final strategic CAGR. Explain the decision with \
reference to the auditor's critique and the rebuttal round. Include every holding and \
rebuild the roadmap with the final CAGR.

---
Analyst draft (Alpha):
{{draft_report}}

---
Auditor review (Beta):
{{audit_comments}}

---
Analyst rebuttal:
{{grok_rebuttal}}

---
Auditor response:
{{gemini_rebuttal}}

---
Portfolio reference:
{{portfolio}}";
