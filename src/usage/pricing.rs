//! Static price table for cost estimation
//!
//! Prices are USD per 1M tokens (input, output).

/// Cost per million tokens (input, output)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    const fn new(input: f64, output: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64) * self.input_per_million / 1_000_000.0
            + (output_tokens as f64) * self.output_per_million / 1_000_000.0
    }
}

/// Rate used when the provider itself is not recognised.
pub const GENERIC_PRICING: ModelPricing = ModelPricing::new(10.00, 30.00);

const GROK_DEFAULT: ModelPricing = ModelPricing::new(0.20, 0.50);
const GEMINI_DEFAULT: ModelPricing = ModelPricing::new(0.50, 3.00);
const OPENAI_DEFAULT: ModelPricing = ModelPricing::new(1.75, 14.00);

/// Pricing for a provider/model pair. Unknown models fall back to the
/// provider's default tier; unknown providers to `GENERIC_PRICING`.
pub fn lookup(provider: &str, model: &str) -> ModelPricing {
    match provider {
        "grok" => grok_pricing(model).unwrap_or(GROK_DEFAULT),
        "gemini" => gemini_pricing(model).unwrap_or(GEMINI_DEFAULT),
        "openai" => openai_pricing(model).unwrap_or(OPENAI_DEFAULT),
        _ => GENERIC_PRICING,
    }
}

fn grok_pricing(model: &str) -> Option<ModelPricing> {
    match model {
        "grok-4-1-fast-reasoning"
        | "grok-4-1-fast-non-reasoning"
        | "grok-4-1-fast"
        | "grok-4-fast-reasoning"
        | "grok-4-fast-non-reasoning"
        | "grok-4-fast" => Some(GROK_DEFAULT),
        "grok-4" | "grok-4-0709" => Some(ModelPricing::new(3.00, 15.00)),
        "grok-3" => Some(ModelPricing::new(3.00, 15.00)),
        "grok-3-mini" => Some(ModelPricing::new(0.30, 0.50)),
        _ => None,
    }
}

fn gemini_pricing(model: &str) -> Option<ModelPricing> {
    match model {
        "gemini-3-flash-preview" | "gemini-3-flash" => Some(GEMINI_DEFAULT),
        "gemini-3-pro-preview" | "gemini-3-pro" => Some(ModelPricing::new(2.00, 12.00)),
        "gemini-2.5-pro" => Some(ModelPricing::new(1.25, 10.00)),
        "gemini-2.5-flash" => Some(ModelPricing::new(0.30, 2.50)),
        "gemini-pro" => Some(ModelPricing::new(0.50, 1.50)),
        _ => None,
    }
}

fn openai_pricing(model: &str) -> Option<ModelPricing> {
    match model {
        "gpt-5.2" | "gpt-5.2-2025-12-11" => Some(OPENAI_DEFAULT),
        "gpt-5.2-pro" | "gpt-5.2-pro-2025-12-11" => Some(ModelPricing::new(21.00, 168.00)),
        "gpt-4o" => Some(ModelPricing::new(2.50, 10.00)),
        "gpt-4-turbo" => Some(ModelPricing::new(10.00, 30.00)),
        "gpt-4" => Some(ModelPricing::new(30.00, 60.00)),
        "gpt-3.5-turbo" => Some(ModelPricing::new(0.50, 1.50)),
        _ => None,
    }
}
