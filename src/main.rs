use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use conductor_core::settings::{self, ConductorSettings};
use conductor_engine::skills::loader;
use conductor_engine::{
    ContinuationPolicy, ConversationContext, OutputMode, Runner, RunnerConfig, StopOnMarker,
};
use conductor_llm::pricing;
use conductor_llm::ProviderRegistry;
use conductor_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Multi-turn LLM conversation runner")]
struct Cli {
    /// Settings file (defaults to ~/.conductor/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one prompt through the turn loop, streaming the reply to stdout
    Run {
        prompt: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Keep taking turns until a reply contains --until, at most this many
        #[arg(long)]
        max_turns: Option<u32>,
        /// Completion marker that ends a multi-turn run
        #[arg(long, default_value = "TASK COMPLETE", requires = "max_turns")]
        until: String,
        /// Skill directory; repeatable, earlier directories win name clashes
        #[arg(long = "skills-dir")]
        skills_dir: Vec<PathBuf>,
        /// System prompt prepended to the conversation
        #[arg(long)]
        system: Option<String>,
    },
    /// List the models a provider serves
    Models {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Estimate tokens and cost for a piece of text
    Estimate {
        text: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        /// Expected completion size
        #[arg(long, default_value_t = 0)]
        output_tokens: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => settings::load_settings_from_path(path),
        None => settings::load_settings(),
    }
    .context("failed to load settings")?;

    let telemetry = TelemetryConfig::from_level_str(&settings.logging.level, settings.logging.json)?;
    init_telemetry(&telemetry)?;

    match cli.command {
        Command::Run {
            prompt,
            provider,
            model,
            max_turns,
            until,
            skills_dir,
            system,
        } => {
            run(
                settings,
                RunArgs {
                    prompt,
                    provider,
                    model,
                    max_turns,
                    until,
                    skills_dir,
                    system,
                },
            )
            .await
        }
        Command::Models { provider } => models(&settings, provider).await,
        Command::Estimate {
            text,
            model,
            provider,
            output_tokens,
        } => {
            estimate(&settings, &text, model, provider, output_tokens);
            Ok(())
        }
    }
}

struct RunArgs {
    prompt: String,
    provider: Option<String>,
    model: Option<String>,
    max_turns: Option<u32>,
    until: String,
    skills_dir: Vec<PathBuf>,
    system: Option<String>,
}

async fn run(settings: ConductorSettings, args: RunArgs) -> anyhow::Result<()> {
    let registry = ProviderRegistry::from_settings(&settings)?;
    let provider_name = args
        .provider
        .unwrap_or_else(|| settings.default_provider.clone());
    let provider = registry.get(&provider_name)?;

    let mut config = RunnerConfig::from_settings(&settings);
    if let Some(model) = args.model {
        config.model = model;
    }
    // without --max-turns the run is a single pass
    let policy = args.max_turns.map(|max_turns| {
        config.max_turns = max_turns;
        StopOnMarker::new(args.until)
    });
    if args.system.is_some() {
        config.system_prompt = args.system;
    }

    let skill_dirs = if args.skills_dir.is_empty() {
        settings::settings_path()
            .parent()
            .map(|dir| vec![dir.join("skills")])
            .unwrap_or_default()
    } else {
        args.skills_dir
    };
    let skills = Arc::new(loader::load_dirs(&skill_dirs));
    tracing::debug!(count = skills.len(), "skills available");

    let context = ConversationContext::new(Arc::new(settings), skills);
    let mut runner = Runner::new(provider, config, OutputMode::Stdout);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = runner
        .run_with_cancel(
            context,
            &args.prompt,
            policy.as_ref().map(|p| p as &dyn ContinuationPolicy),
            &cancel,
        )
        .await?;
    println!();

    let usage = runner.usage();
    eprintln!(
        "{} turn(s), {}; {} in / {} out, {}",
        outcome.turns,
        outcome.stop,
        pricing::format_tokens(usage.total_input_tokens()),
        pricing::format_tokens(usage.total_output_tokens()),
        pricing::format_cost(usage.total_cost()),
    );
    Ok(())
}

async fn models(settings: &ConductorSettings, provider: Option<String>) -> anyhow::Result<()> {
    let registry = ProviderRegistry::from_settings(settings)?;
    let name = provider.unwrap_or_else(|| settings.default_provider.clone());
    let models = registry
        .get(&name)?
        .list_models()
        .await
        .with_context(|| format!("failed to list models for {name}"))?;
    for model in models {
        println!("{model}");
    }
    Ok(())
}

fn estimate(
    settings: &ConductorSettings,
    text: &str,
    model: Option<String>,
    provider: Option<String>,
    output_tokens: u64,
) {
    let model = model.unwrap_or_else(|| settings.default_model.clone());
    let provider = provider.unwrap_or_else(|| settings.default_provider.clone());
    let input_tokens = u64::from(conductor_engine::tokens::estimate_tokens(text, &model));
    let cost = pricing::calculate_cost(input_tokens, output_tokens, &model, Some(&provider));
    let limit = pricing::context_limit(&model);

    println!("model:   {model} ({provider})");
    println!(
        "tokens:  {} input, {} output, {:.1}% of {} context",
        pricing::format_tokens(input_tokens),
        pricing::format_tokens(output_tokens),
        input_tokens as f64 * 100.0 / f64::from(limit),
        pricing::format_tokens(u64::from(limit)),
    );
    if cost.is_local {
        println!("cost:    free (local model)");
    } else {
        println!(
            "cost:    {} ({} input + {} output)",
            pricing::format_cost(cost.total),
            pricing::format_cost(cost.input_cost),
            pricing::format_cost(cost.output_cost),
        );
    }
}
