//! Labflow - lab result inbox ingester

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use labflow_common::logging::{init_logging, LogConfig, LogLevel};
use labflow_ingest::{
    config::IngestConfig,
    db::create_pool,
    ledger::Ledger,
    normalizer::parse_timestamp,
    queries::{fetch_results, summarize, ResultQuery, SummaryGrouping},
    service::IngestService,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "labflow")]
#[command(author, version, about = "Loads instrument result files into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Inbox directories, comma-separated
    #[arg(long, global = true, env = "LABFLOW_INBOX", value_delimiter = ',')]
    inbox: Vec<PathBuf>,

    /// Directory for rejected files
    #[arg(long, global = true, env = "LABFLOW_QUARANTINE")]
    quarantine: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process the backlog, then watch the inboxes until interrupted
    Run,

    /// Process the current backlog once and exit
    Backlog,

    /// List committed files, newest first
    Ledger {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },

    /// Print committed rows as JSON lines
    Query(Window),

    /// Print test counts by status per lot, chip or batch
    Summary {
        #[command(flatten)]
        window: Window,

        /// Break counts down by: lot, chip, lot-chip or lot-batch-chip
        #[arg(long, default_value = "lot")]
        group: SummaryGrouping,
    },
}

#[derive(Args, Debug)]
struct Window {
    /// Start of the test-time window (inclusive)
    #[arg(long, value_parser = parse_datetime)]
    from: NaiveDateTime,

    /// End of the test-time window (inclusive)
    #[arg(long, value_parser = parse_datetime)]
    to: NaiveDateTime,

    /// Lot to include; repeat for several
    #[arg(long = "lot", required = true)]
    lots: Vec<String>,
}

impl Window {
    fn into_query(self) -> Result<ResultQuery> {
        if self.from > self.to {
            bail!("--from {} is after --to {}", self.from, self.to);
        }
        Ok(ResultQuery {
            from: self.from,
            to: self.to,
            lots: self.lots,
        })
    }
}

fn parse_datetime(raw: &str) -> std::result::Result<NaiveDateTime, String> {
    parse_timestamp(raw).ok_or_else(|| format!("unrecognized date/time '{raw}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::default()
        .level(level)
        .log_file_prefix("labflow")
        .filter_directives("sqlx=warn");

    // Environment variables take precedence
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);

    let _log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        },
    };

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "labflow failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn load_config(cli: &Cli) -> Result<IngestConfig> {
    dotenvy::dotenv().ok();
    let mut config = IngestConfig::from_env()?;

    if !cli.inbox.is_empty() {
        config.inbox_paths = cli.inbox.clone();
    }
    if let Some(ref quarantine) = cli.quarantine {
        config.quarantine_path = quarantine.clone();
    }
    if let Some(ref url) = cli.database_url {
        config.database.url = url.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn execute(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Run => {
            info!(inboxes = ?config.inbox_paths, "Starting labflow");
            let service = IngestService::connect(config).await?;
            service.run(shutdown_token()).await?;
            info!("labflow shut down gracefully");
        },
        Command::Backlog => {
            let service = IngestService::connect(config).await?;
            let outcomes = service.run_backlog(shutdown_token()).await?;
            print_json_lines(&outcomes)?;
        },
        Command::Ledger { limit } => {
            let pool = create_pool(&config.database).await?;
            let entries = Ledger::new(pool, config.tables.ledger.clone())
                .list(limit)
                .await
                .context("Failed to read the ledger")?;
            print_json_lines(&entries)?;
        },
        Command::Query(window) => {
            let query = window.into_query()?;
            let pool = create_pool(&config.database).await?;
            let rows = fetch_results(&pool, &config.tables.results, &query)
                .await
                .context("Failed to query results")?;
            print_json_lines(&rows)?;
        },
        Command::Summary { window, group } => {
            let query = window.into_query()?;
            let pool = create_pool(&config.database).await?;
            let summary = summarize(&pool, &config.tables.results, &query, group)
                .await
                .context("Failed to summarize results")?;
            print_json_lines(&summary)?;
        },
    }

    Ok(())
}

fn print_json_lines<T: Serialize>(items: &[T]) -> Result<()> {
    let mut out = std::io::stdout().lock();
    for item in items {
        serde_json::to_writer(&mut out, item)?;
        writeln!(out)?;
    }
    Ok(())
}

/// Token cancelled on Ctrl+C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    token
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight files");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing in-flight files");
        },
    }
}
