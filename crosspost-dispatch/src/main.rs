//! crosspost-dispatch - Trigger dispatch cycles for the crosspost queue
//!
//! Either serves the HTTP trigger that an external scheduler calls, or runs
//! a single cycle and prints its report.

use clap::{Parser, Subcommand};
use libcrosspost::logging::{env_level, LogFormat, LoggingConfig};
use libcrosspost::server::{router, AppState};
use libcrosspost::{Config, CrosspostError, Database, Dispatcher, Result};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "crosspost-dispatch")]
#[command(version)]
#[command(about = "Trigger dispatch cycles for scheduled posts")]
#[command(long_about = "\
crosspost-dispatch - Trigger dispatch cycles for scheduled posts

DESCRIPTION:
    crosspost-dispatch publishes posts whose scheduled time has passed.
    It keeps no timers of its own: every cycle is started from outside,
    either by an HTTP request or by running `once` from cron.

    Each cycle recovers expired leases, claims due posts one at a time,
    publishes them to X, note or WordPress, and records the outcome with
    retry and backoff bookkeeping.

USAGE:
    # Serve the trigger endpoint (call it every minute from a scheduler)
    crosspost-dispatch serve --bind 0.0.0.0:8787
    curl -X POST -H \"Authorization: Bearer $CRON_SECRET\" \\
        http://localhost:8787/api/cron/dispatch

    # Run one cycle and print the JSON report
    crosspost-dispatch once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes in-flight requests)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml
    Database location: ~/.local/share/crosspost/posts.db

    Override with environment variables:
        CROSSPOST_CONFIG   - Path to config file
        CROSSPOST_DB_PATH  - Path to database file
        CRON_SECRET        - Bearer secret required on /api routes

EXIT CODES:
    0 - Cycle completed (or clean shutdown)
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, global = true, env = "CROSSPOST_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP dispatch trigger
    Serve {
        /// Address to listen on (overrides config)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Run one dispatch cycle and print the report as JSON
    Once {
        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(cli.log_format, env_level("info"), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let db = Database::new(&config.database.path).await?;
    let dispatcher = Dispatcher::from_config(db, &config)?;

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            serve(dispatcher, &bind, config.server.cron_secret.clone()).await
        }
        Commands::Once { pretty } => once(&dispatcher, pretty).await,
    }
}

async fn serve(dispatcher: Dispatcher, bind: &str, cron_secret: Option<String>) -> Result<()> {
    if cron_secret.is_none() {
        tracing::warn!("CRON_SECRET is not set; /api routes accept unauthenticated requests");
    }
    let configured = dispatcher.publishers().configured();
    let app = router(AppState::new(dispatcher, cron_secret));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, platforms = ?configured, "crosspost-dispatch listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal()?)
        .await?;

    info!("crosspost-dispatch stopped");
    Ok(())
}

async fn once(dispatcher: &Dispatcher, pretty: bool) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let report = dispatcher.run_cycle(now).await?;

    let json = if pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    }
    .map_err(|e| CrosspostError::InvalidInput(format!("cannot encode report: {}", e)))?;

    println!("{}", json);
    Ok(())
}

/// Resolves once SIGINT or SIGTERM arrives
#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    Ok(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "Received shutdown signal, stopping gracefully...");
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
        }
    })
}
