use clap::Parser;
use dotenv::dotenv;
use portfolio_consensus::{
    audit::ReportWriter,
    config::{read_portfolio_prompt, Credentials, PortfolioConfig, FX_API_KEY},
    consensus::{format_cagr, NoopGate, StepGate},
    debug_shell::DebugShell,
    diagnostics::{self, CheckTarget, PRICE_TICKER},
    market::MarketDataFetcher,
    prompts::PromptBook,
    providers::{GeminiAdapter, GrokAdapter, OpenAiAdapter, ProviderAdapter},
    transport::{HttpTransport, ReqwestTransport},
    usage::UsageLedger,
    ConsensusError, ConsensusOrchestrator, PipelineInput, PipelineOptions, RunOutcome, Stage,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Multi-AI portfolio consensus report
#[derive(Parser, Debug)]
#[command(name = "consensus", version, about)]
struct Args {
    /// Preferred OpenAI model for the final synthesis
    #[arg(long)]
    openai_model: Option<String>,

    /// Preferred Grok model for the draft and rebuttal
    #[arg(long)]
    grok_model: Option<String>,

    /// Preferred Gemini model for the audit and rebuttal
    #[arg(long)]
    gemini_model: Option<String>,

    /// Directory holding config.json and prompt overrides
    #[arg(long, default_value = "prompts")]
    prompts_dir: PathBuf,

    /// Portfolio prompt file (overrides config.json)
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Report file name (overrides the generated one)
    #[arg(long)]
    output_file: Option<PathBuf>,

    #[arg(long)]
    no_grok_web_search: bool,

    #[arg(long)]
    no_gemini_search: bool,

    /// Pause in the debug shell after this step (1-5)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    debug_step: Option<u8>,

    /// Ping every provider and show which model answered
    #[arg(long)]
    test_models: bool,

    /// Ask every provider for a live TSLA quote
    #[arg(long)]
    test_stock_price: bool,

    /// Fetch FX and equity prices only
    #[arg(long)]
    test_data_fetch: bool,
}

/// A failure tagged with the step that produced it
struct Failure {
    step: &'static str,
    error: ConsensusError,
}

fn at(step: &'static str) -> impl FnOnce(ConsensusError) -> Failure {
    move |error| Failure { step, error }
}

struct Adapters {
    grok: Arc<dyn ProviderAdapter>,
    gemini: Arc<dyn ProviderAdapter>,
    openai: Arc<dyn ProviderAdapter>,
}

impl Adapters {
    fn new(transport: &Arc<dyn HttpTransport>, credentials: &Credentials, ledger: &UsageLedger) -> Self {
        Self {
            grok: Arc::new(GrokAdapter::new(transport.clone(), credentials, ledger.clone())),
            gemini: Arc::new(GeminiAdapter::new(transport.clone(), credentials, ledger.clone())),
            openai: Arc::new(OpenAiAdapter::new(transport.clone(), credentials, ledger.clone())),
        }
    }

    fn check_targets(&self, args: &Args) -> Vec<CheckTarget> {
        vec![
            CheckTarget::new(self.grok.clone(), args.grok_model.clone().unwrap_or_default()),
            CheckTarget::new(self.gemini.clone(), args.gemini_model.clone().unwrap_or_default()),
            CheckTarget::new(self.openai.clone(), args.openai_model.clone().unwrap_or_default()),
        ]
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!(step = failure.step, error = %failure.error, "Run failed");
            eprintln!("\nFAILED at {}: {}", failure.step, failure.error);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Failure> {
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new().map_err(at("http client"))?);

    // Market-only check needs no AI credentials
    if args.test_data_fetch {
        let config = PortfolioConfig::load(&args.prompts_dir).map_err(at("config"))?;
        let fx_key = std::env::var(FX_API_KEY).ok().filter(|k| !k.trim().is_empty());
        let fetcher = MarketDataFetcher::new(transport, fx_key);

        let snapshot = diagnostics::test_data_fetch(&fetcher, &config.tickers).await;
        println!("{}", diagnostics::render_snapshot(&snapshot, &config.tickers));
        return Ok(());
    }

    let credentials = Credentials::from_env().map_err(at("credentials"))?;
    let ledger = UsageLedger::new();
    let adapters = Adapters::new(&transport, &credentials, &ledger);

    if args.test_models || args.test_stock_price {
        let targets = adapters.check_targets(&args);

        if args.test_models {
            let results = diagnostics::test_models(&targets).await;
            println!("{}", diagnostics::render_checks("Model check", &results));
        }
        if args.test_stock_price {
            let results = diagnostics::test_stock_price(&targets, PRICE_TICKER).await;
            println!("{}", diagnostics::render_checks("Stock price check", &results));
        }

        let usage = ledger.summarize(None).await;
        println!("Diagnostic cost: ${:.4} over {} calls", usage.total_usd, usage.calls);
        return Ok(());
    }

    // Startup
    let config = PortfolioConfig::load(&args.prompts_dir).map_err(at("config"))?;
    let prompt_path = args
        .prompt_file
        .clone()
        .unwrap_or_else(|| config.prompt_path(&args.prompts_dir));
    let portfolio_prompt = read_portfolio_prompt(&prompt_path).map_err(at("portfolio prompt"))?;
    let prompts = PromptBook::load(&args.prompts_dir);

    let options = PipelineOptions {
        grok_model: args.grok_model.clone().unwrap_or_default(),
        gemini_model: args.gemini_model.clone().unwrap_or_default(),
        openai_model: args.openai_model.clone().unwrap_or_default(),
        grok_web_search: !args.no_grok_web_search,
        gemini_search: !args.no_gemini_search,
    };

    info!(
        prompts_dir = %args.prompts_dir.display(),
        prompt_file = %prompt_path.display(),
        tickers = ?config.tickers,
        options = ?options,
        "Portfolio consensus starting"
    );

    // Market data, fetched once
    let fetcher = MarketDataFetcher::new(transport.clone(), credentials.fx_api_key.clone());
    let snapshot = fetcher.snapshot(&config.tickers).await;

    let gate: Box<dyn StepGate> = match args.debug_step.and_then(Stage::from_number) {
        Some(cutoff) => {
            info!(cutoff = %cutoff, "Debug shell armed");
            Box::new(DebugShell::new(
                cutoff,
                adapters.grok.clone(),
                adapters.gemini.clone(),
                adapters.openai.clone(),
            ))
        }
        None => Box::new(NoopGate),
    };

    let orchestrator = ConsensusOrchestrator::new(
        adapters.grok.clone(),
        adapters.gemini.clone(),
        adapters.openai.clone(),
        prompts,
        options,
    );

    let input = PipelineInput::new(portfolio_prompt, snapshot.clone(), config.holdings.clone());
    let report = orchestrator.run(&input, gate.as_ref()).await.map_err(at("pipeline"))?;

    // Persist
    let usage = ledger.summarize(snapshot.usd_krw_rate).await;
    let writer = ReportWriter::new(args.output_dir.clone(), args.output_file.clone());
    let written = writer.write(&report, &snapshot, &usage).map_err(at("report"))?;

    match report.outcome {
        RunOutcome::Completed => println!("\nConsensus complete."),
        RunOutcome::Degraded => println!(
            "\nConsensus complete with placeholders at: {:?}",
            report.state.degraded_stages()
        ),
        RunOutcome::Halted(stage) => println!("\nRun halted by operator after {}.", stage),
    }
    println!(
        "Alpha CAGR: {} | Beta CAGR: {}",
        format_cagr(report.state.alpha()),
        format_cagr(report.state.beta())
    );
    match usage.total_krw {
        Some(krw) => println!("Cost: ${:.4} (≈ ₩{:.0})", usage.total_usd, krw),
        None => println!("Cost: ${:.4}", usage.total_usd),
    }
    println!("Report:   {}", written.report_path.display());
    println!("Audit:    {}", written.audit_dir.display());
    println!("Manifest: {}", written.manifest_path.display());

    Ok(())
}
