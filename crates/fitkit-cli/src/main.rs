//! FitKit CLI - a command-line client for the FitKit API.
//!
//! This binary is the composition root: it loads the configuration, builds
//! the persisted credential store, and hands both to `FitkitClient`.

mod commands;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fitkit_core::{Config, FitkitClient};

#[derive(Parser, Debug)]
#[command(name = "fitkit", version, about = "Command-line client for the FitKit API")]
struct Cli {
    /// Override the API base URL
    #[arg(long, env = "FITKIT_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Also write logs to a daily rotating file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the session
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Create an account and log in
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        email: String,
    },
    /// Reset the password with a one-time recovery code
    ResetPassword {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        code: String,
    },
    /// Forget the stored session
    Logout,
    /// Show whether a session is stored
    Status,
    /// Show the logged-in user's profile
    Me,
    /// Show the number of logbook entries
    Stats,
    /// Show the logbook for a date (YYYY-MM-DD, default today)
    Log { date: Option<chrono::NaiveDate> },
    /// List recent journal entries
    Journals {
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        size: u32,
    },
    /// Show the audit trail for a date
    Audit {
        date: chrono::NaiveDate,
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
    },
    /// Generate new account recovery codes
    RecoveryCodes,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fitkit.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref());
    info!("FitKit CLI starting");

    let mut config = Config::load()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    debug!(base_url = %config.base_url, persistence = ?config.persistence, "Config loaded");

    let store = Arc::new(config.credential_store()?);
    let restored = store.restore();
    debug!(restored, "Session restored");

    let client = FitkitClient::new(&config, store)?;
    commands::run(cli.command, &client, &mut config).await
}
