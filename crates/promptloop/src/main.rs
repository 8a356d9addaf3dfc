use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use promptloop_agent::{create_generator, Generator, RetryingGenerator};
use promptloop_core::{
    EvaluationHarness, HarnessConfig, IterationManager, PersonaSuite, PipelineRunner,
    PromptImprover, PromptValidator, RiskLevel,
};
use promptloop_db::Database;
use promptloop_judge::Judge;
use promptloop_logging::{init_tracing, LogFormat, Logger};

mod commands;
mod config;

use config::{ProjectConfig, Role};

#[derive(Parser, Debug)]
#[command(
    name = "promptloop",
    about = "Self-improving prompt pipeline for a collections voice agent",
    version,
    author
)]
struct Cli {
    /// Config file (default: ./promptloop.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    log_format: LogFormatChoice,

    /// Diagnostic log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Also write logs under this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json_output: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the improvement pipeline for one call
    Run {
        /// Call id as stored by `import-call`
        call_id: String,
    },

    /// Show the Active iteration and pending work
    Status,

    /// List calls that can drive an improvement
    Calls {
        /// Show at most this many calls
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Create the first Active iteration
    Seed {
        /// Prompt file (default: built-in collections prompt)
        #[arg(long)]
        prompt_file: Option<PathBuf>,
    },

    /// List all iterations with the score trend
    History,

    /// Store a call from a JSON file
    ImportCall {
        file: PathBuf,
    },

    /// Run the pipeline for every unprocessed call
    ProcessPending,

    /// Print the persona catalogue
    Personas {
        /// Only personas at this risk level
        #[arg(long, value_enum)]
        risk: Option<RiskChoice>,

        #[arg(long, default_value_t = 0.0)]
        min_difficulty: f64,

        #[arg(long, default_value_t = 1.0)]
        max_difficulty: f64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RiskChoice {
    Low,
    Medium,
    High,
}

impl From<RiskChoice> for RiskLevel {
    fn from(choice: RiskChoice) -> Self {
        match choice {
            RiskChoice::Low => RiskLevel::Low,
            RiskChoice::Medium => RiskLevel::Medium,
            RiskChoice::High => RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatChoice {
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatChoice> for LogFormat {
    fn from(choice: LogFormatChoice) -> Self {
        match choice {
            LogFormatChoice::Pretty => LogFormat::Pretty,
            LogFormatChoice::Json => LogFormat::Json,
            LogFormatChoice::Compact => LogFormat::Compact,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_format: LogFormat = cli.log_format.into();
    let _guard = init_tracing(&cli.log_level, log_format, cli.log_dir.as_deref());

    let config = match &cli.config {
        Some(path) => ProjectConfig::load_from(path)?,
        None => {
            let working_dir =
                std::env::current_dir().context("Failed to get current directory")?;
            ProjectConfig::load(&working_dir)?.unwrap_or_default()
        }
    };

    let db_path = cli
        .db
        .clone()
        .or_else(|| config.database.clone())
        .unwrap_or_else(Database::default_path);
    let db = Arc::new(
        Database::open_at(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
    );
    debug!(path = %db_path.display(), "Opened database");

    match cli.command {
        Commands::Personas {
            risk,
            min_difficulty,
            max_difficulty,
        } => {
            let filter = commands::PersonaFilter {
                risk: risk.map(RiskLevel::from),
                min_difficulty,
                max_difficulty,
            };
            commands::personas(&PersonaSuite::default_catalogue(), &filter, cli.json_output)
        }
        Commands::ImportCall { ref file } => commands::import_call(&db, file, cli.json_output),
        Commands::Seed { ref prompt_file } => {
            let manager = IterationManager::new(db.clone(), config.pipeline.tolerance);
            commands::seed(&manager, prompt_file.as_deref(), cli.json_output).await
        }
        Commands::History => {
            let manager = IterationManager::new(db.clone(), config.pipeline.tolerance);
            commands::history(&manager, cli.json_output)
        }
        Commands::Status => {
            let runner = build_runner(&config, db, &cli)?;
            commands::status(&runner, cli.json_output)
        }
        Commands::Calls { limit } => {
            let runner = build_runner(&config, db, &cli)?;
            commands::calls(&runner, limit, cli.json_output)
        }
        Commands::Run { ref call_id } => {
            let runner = build_runner(&config, db, &cli)?;
            ensure_available(&config).await?;
            install_interrupt(&runner)?;

            let result = runner.run(call_id).await;
            commands::print_result(&result, cli.json_output)?;
            std::process::exit(result.outcome.exit_code());
        }
        Commands::ProcessPending => {
            let runner = Arc::new(build_runner(&config, db, &cli)?);
            ensure_available(&config).await?;
            install_interrupt(&runner)?;

            let code = commands::process_pending(
                runner,
                config.pipeline.max_concurrent_runs,
                cli.json_output,
            )
            .await?;
            std::process::exit(code);
        }
    }
}

fn build_generator(config: &ProjectConfig, role: Role) -> Result<Arc<dyn Generator>> {
    let inner: Arc<dyn Generator> = Arc::from(create_generator(config.generator_type(role)?));
    Ok(Arc::new(RetryingGenerator::new(inner, config.retry_policy())))
}

fn build_runner(config: &ProjectConfig, db: Arc<Database>, cli: &Cli) -> Result<PipelineRunner> {
    let logger = match &cli.log_dir {
        Some(dir) => Logger::with_file(cli.log_format.into(), &dir.join("events.jsonl"))
            .with_context(|| format!("Failed to open event log in {}", dir.display()))?,
        None => Logger::new(cli.log_format.into()),
    };

    let judge = Judge::new(
        build_generator(config, Role::Judge)?,
        config.generation_config(Role::Judge),
    )
    .with_samples(config.pipeline.judge_samples);
    let rubric = judge.rubric().clone();

    let harness = EvaluationHarness::new(
        build_generator(config, Role::Agent)?,
        Arc::new(judge),
        HarnessConfig {
            turn_cap: config.turn_cap(),
            generation: config.generation_config(Role::Agent),
        },
    );
    let improver = PromptImprover::new(
        build_generator(config, Role::Improver)?,
        config.generation_config(Role::Improver),
    );
    let manager = IterationManager::new(db.clone(), config.pipeline.tolerance);

    Ok(PipelineRunner::new(
        db,
        Arc::new(manager),
        Arc::new(harness),
        Arc::new(improver),
        Arc::new(logger),
    )
    .with_validator(PromptValidator::new(config.validator_config()))
    .with_rubric(rubric)
    .with_settings(config.pipeline_settings()))
}

/// Verify every configured backend is installed before spending a run.
async fn ensure_available(config: &ProjectConfig) -> Result<()> {
    for role in [Role::Agent, Role::Judge, Role::Improver] {
        let generator = create_generator(config.generator_type(role)?);
        if !generator.is_available().await {
            anyhow::bail!(
                "{} backend '{}' is not available. Make sure it's installed and in PATH.",
                role,
                generator.name()
            );
        }
    }
    Ok(())
}

fn install_interrupt(runner: &PipelineRunner) -> Result<()> {
    let interrupt_handle = runner.interrupt_handle();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Cancelling before the next promotion decision...");
        interrupt_handle.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")
}
