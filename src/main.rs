use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loopflow_core::config::AppConfig;
use loopflow_core::traits::{NullStore, RunStore};
use loopflow_core::types::WorkflowEvent;
use loopflow_engine::WorkflowEngine;
use loopflow_gateway::GatewayServer;
use loopflow_steps::code_review::CODE_FIELD;
use loopflow_steps::code_review_workflow;
use loopflow_store::SqliteRunStore;

const DEFAULT_CONFIG: &str = "loopflow.toml";

#[derive(Parser)]
#[command(name = "loopflow", version, about = "Graph workflow engine with a code-review loop")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG, env = "LOOPFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway server
    Serve,
    /// Review a source file locally and print the final state
    Run {
        /// File to review, or `-` for stdin
        file: PathBuf,
        /// Quality score the review loop aims for
        #[arg(long)]
        threshold: Option<i64>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("loopflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "loopflow", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Run { file, threshold }) => {
            let code = read_source(&file)?;
            let engine = WorkflowEngine::new(config.engine.clone(), open_store(&config)?);
            let threshold = threshold.unwrap_or(config.workflow.default_threshold);
            run_once(&engine, threshold, code).await?;
        }
        Some(Commands::Serve) | None => {
            let engine = Arc::new(WorkflowEngine::new(
                config.engine.clone(),
                open_store(&config)?,
            ));
            info!(bind = %config.gateway.bind, "Starting gateway");
            let server = GatewayServer::new(
                config.gateway.clone(),
                config.workflow.clone(),
                engine.clone(),
            );

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;

            info!(in_flight = engine.in_flight(), "Waiting for in-flight runs");
            engine.drain().await;
        }
        // Handled before config loading
        Some(Commands::Completions { .. }) => {}
    }

    Ok(())
}

/// Load the config file. The default path is optional; an explicit one is not.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if path == Path::new(DEFAULT_CONFIG) {
        info!("No {} found, using defaults", DEFAULT_CONFIG);
        return Ok(AppConfig::default());
    }
    anyhow::bail!("Config file not found: {}", path.display())
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RunStore>> {
    if !config.store.enabled {
        warn!("Run store disabled, runs will not be persisted");
        return Ok(Arc::new(NullStore));
    }
    let path = config.store_path();
    info!(path = %path.display(), "Opening run store");
    Ok(Arc::new(SqliteRunStore::open(&path)?))
}

fn read_source(file: &Path) -> anyhow::Result<String> {
    if file == Path::new("-") {
        let mut code = String::new();
        io::stdin().read_to_string(&mut code)?;
        return Ok(code);
    }
    std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))
}

/// Run the code-review workflow once, streaming log lines to stdout.
async fn run_once(engine: &WorkflowEngine, threshold: i64, code: String) -> anyhow::Result<()> {
    let graph_id = engine.register_graph(code_review_workflow(threshold))?;

    // Subscribe before the run exists so no line is missed
    let mut rx = engine.event_bus().subscribe();

    let mut fields = Map::new();
    fields.insert(CODE_FIELD.to_string(), Value::String(code));
    let run_id = engine.start_run(&graph_id, fields)?;

    let mut failed = None;
    loop {
        match rx.recv().await {
            Ok(WorkflowEvent::Log { run_id: id, line }) if id == run_id => println!("{}", line),
            Ok(WorkflowEvent::RunFinished { run_id: id, failed: f }) if id == run_id => {
                failed = Some(f);
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "Log output lagged");
                // The finish event may have been among the skipped ones
                if engine.registry().is_finished(&run_id) {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }

    engine.drain().await;

    let snapshot = engine.get_run(&run_id)?;
    println!("{}", serde_json::to_string_pretty(&snapshot.state)?);

    let failed = failed.unwrap_or_else(|| {
        snapshot
            .logs
            .last()
            .is_some_and(|line| line.starts_with("error-in-"))
    });
    if failed {
        anyhow::bail!("Run {} failed", run_id);
    }
    Ok(())
}
