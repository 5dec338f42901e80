//! CLI entry point. Three subcommands, mirroring the Singer tap contract:
//! `check` validates credentials, `discover` emits a catalog, `sync` runs
//! the export-and-emit loop and writes Singer messages to stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use tap_zuora::catalog::Catalog;
use tap_zuora::config::Config;
use tap_zuora::error::TransportError;
use tap_zuora::orchestrator::Orchestrator;
use tap_zuora::state::State;
use tap_zuora::{build_driver, discovery, resolver};

#[derive(Debug, Parser)]
#[command(name = "tap-zuora", version, about = "Singer tap for Zuora's AQuA and REST export APIs")]
struct Cli {
    #[command(flatten)]
    logging: LogArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// Passed straight through to `tracing_subscriber::EnvFilter`; e.g.
    /// `tap_zuora=debug`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
    /// Structured (ndjson) logs instead of the default human-readable
    /// format; use in production, leave off for local debugging.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Verify the configured credentials are accepted by Zuora.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print a Singer catalog describing every discoverable object.
    Discover {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run a sync, writing SCHEMA/RECORD/STATE messages to stdout.
    Sync {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

fn init_logging(args: &LogArgs) {
    let filter = tracing_subscriber::EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.logging);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            exit_code_for(&err)
        }
    }
}

/// Mirrors the upstream's top-level exception handler: bad credentials
/// get their own exit code so an orchestrating platform can tell "fix
/// your config" apart from "something broke".
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    if err.downcast_ref::<TransportError>().map(TransportError::is_retry_exhausted) == Some(true)
        || matches!(err.downcast_ref::<TransportError>(), Some(TransportError::BadCredentials))
    {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Check { config } => run_check(config).await,
        Command::Discover { config } => run_discover(config).await,
        Command::Sync { config, catalog, state } => run_sync(config, catalog, state).await,
    }
}

fn read_config(path: PathBuf) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading config file {}", path.display()))?;
    Config::parse(&raw).context("parsing config")
}

async fn run_check(config_path: PathBuf) -> anyhow::Result<()> {
    let config = read_config(config_path)?;
    let transport = resolver::build_transport(&config);
    resolver::check_credentials(&config, &transport).await?;
    println!("{}", serde_json::json!({ "ok": true }));
    Ok(())
}

async fn run_discover(config_path: PathBuf) -> anyhow::Result<()> {
    let config = read_config(config_path)?;
    let transport = Arc::new(resolver::build_transport(&config));
    let driver = build_driver(&config, transport.clone());
    let discoverer = discovery::Discoverer::new(transport, driver, config.partner_id().to_string(), !config.is_aqua());
    let catalog = discoverer.discover().await.context("discovering catalog")?;
    serde_json::to_writer(std::io::stdout().lock(), &catalog).context("writing catalog")?;
    println!();
    Ok(())
}

async fn run_sync(config_path: PathBuf, catalog_path: PathBuf, state_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = read_config(config_path)?;

    let catalog_raw =
        std::fs::read_to_string(&catalog_path).with_context(|| format!("reading catalog file {}", catalog_path.display()))?;
    let catalog: Catalog = serde_json::from_str(&catalog_raw).context("parsing catalog")?;

    let state = match state_path {
        Some(path) if path.exists() => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading state file {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw).context("parsing state")?;
            State::parse(&value)
        }
        _ => State::default(),
    };

    let transport = Arc::new(resolver::build_transport(&config));
    let driver = build_driver(&config, transport);

    let mut orchestrator = Orchestrator::new(
        driver,
        config.is_aqua(),
        config.partner_id().to_string(),
        config.start_date,
        state,
        std::io::stdout().lock(),
    );

    orchestrator.run(&catalog).await.context("running sync")
}
