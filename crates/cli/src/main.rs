mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};
use tradesync_brokers_common::{LoopbackProfile, SimulatedConfig, SimulatedConnector};
use tradesync_brokers_deriv::DerivConnector;
use tradesync_core::*;
use tradesync_data::{clear_credentials, persist_profile, FileStore, MemoryStore};
use tradesync_engine::{SessionConfig, SessionDriver, SessionHandle};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "tradesync")]
#[command(about = "Copy-trading session manager: authorize, watch the balance, mirror a trader")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// TOML config file
    #[arg(short, long, env = "TRADESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Credential store file
    #[arg(long, env = "TRADESYNC_STORE", default_value = ".tradesync/store.json")]
    store: PathBuf,

    /// Override the registered application id
    #[arg(long, env = "TRADESYNC_APP_ID")]
    app_id: Option<u32>,

    /// Talk to an in-process loopback back-end instead of the network
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session and read commands from stdin
    Run,

    /// Open a session and expose it over HTTP
    Serve {
        /// Bind address
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        bind: String,
    },

    /// Save an access token to the credential store
    Login {
        /// Access token issued by the trading back-end
        token: String,
    },

    /// Remove the access token and cached profile
    Logout,

    /// Check a trader token without sending anything
    CheckToken { token: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run => {
            let app = AppConfig::load(cli.config.as_deref())?;
            let config = app.session_config(cli.app_id);
            let mut store = FileStore::open(&cli.store)?;
            let (handle, driver) = mount(&config, &store, cli.offline);
            run_interactive(handle.clone()).await?;
            finish(handle, driver, &mut store).await?;
        }
        Commands::Serve { bind } => {
            let app = AppConfig::load(cli.config.as_deref())?;
            let config = app.session_config(cli.app_id);
            let mut store = FileStore::open(&cli.store)?;
            let (handle, driver) = mount(&config, &store, cli.offline);
            tokio::select! {
                result = tradesync_api::start_server(handle.clone(), &bind) => result?,
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
            }
            finish(handle, driver, &mut store).await?;
        }
        Commands::Login { token } => {
            let token = token.trim();
            if token.is_empty() {
                anyhow::bail!("Access token must not be empty");
            }
            let mut store = FileStore::open(&cli.store)?;
            store.set(keys::ACTIVE_TOKEN, token)?;
            println!("Logged in; token saved to {}", store.path().display());
        }
        Commands::Logout => {
            let mut store = FileStore::open(&cli.store)?;
            clear_credentials(&mut store)?;
            println!("Logged out");
        }
        Commands::CheckToken { token } => {
            let token = TraderToken::parse(&token)?;
            println!("Valid trader token: {}", token.redacted());
        }
    }

    Ok(())
}

/// Start a session on its own task.
fn mount(
    config: &SessionConfig,
    store: &FileStore,
    offline: bool,
) -> (SessionHandle, tokio::task::JoinHandle<()>) {
    let (driver, handle) = if offline {
        let (connector, _server) =
            SimulatedConnector::new(SimulatedConfig::loopback(LoopbackProfile::default()));
        tracing::info!("Offline mode: using the loopback back-end");
        if store.active_token().is_some() {
            SessionDriver::new(config, store, &connector)
        } else {
            SessionDriver::new(config, &MemoryStore::with_token("offline-demo"), &connector)
        }
    } else {
        SessionDriver::new(config, store, &DerivConnector::new())
    };
    (handle, tokio::spawn(driver.run()))
}

/// Stop the session and cache what it learned about the account.
async fn finish(
    handle: SessionHandle,
    driver: tokio::task::JoinHandle<()>,
    store: &mut FileStore,
) -> Result<()> {
    let last = handle.snapshot();
    handle.shutdown().await;
    driver.await?;
    if last.auth == AuthState::Authorized {
        persist_profile(store, &last)?;
        tracing::info!("Cached profile saved");
    }
    Ok(())
}

async fn run_interactive(handle: SessionHandle) -> Result<()> {
    println!("Commands: start <trader token> | stop | status | quit");
    let printer = tokio::spawn(print_notices(handle.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        match (parts.next().unwrap_or(""), parts.next()) {
            ("", _) => continue,
            ("start", token) => {
                let handle = handle.clone();
                let token = token.unwrap_or("").trim().to_string();
                // The answer can take a while; keep reading commands meanwhile.
                tokio::spawn(async move {
                    if let Err(e) = handle.start_copy(token).await {
                        println!("start: {e}");
                    }
                });
            }
            ("stop", _) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.stop_copy().await {
                        println!("stop: {e}");
                    }
                });
            }
            ("status", _) => println!("{}", render_status(&handle.snapshot())),
            ("quit" | "exit", _) => break,
            (other, _) => println!("Unknown command: {other}"),
        }
    }

    printer.abort();
    Ok(())
}

/// Print every new status message and status change.
async fn print_notices(handle: SessionHandle) {
    let mut rx = handle.subscribe();
    let mut last_notice: Option<StatusMessage> = None;
    let mut last_status = None;
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(notice) = &snapshot.notice {
            if last_notice.as_ref() != Some(notice) {
                println!("{notice}");
                last_notice = Some(notice.clone());
            }
        }
        if last_status != Some(snapshot.status) {
            println!("{}", render_status(&snapshot));
            last_status = Some(snapshot.status);
        }
    }
}

fn render_status(snapshot: &SessionSnapshot) -> String {
    let balance = match (&snapshot.balance, snapshot.loading) {
        (_, true) => "loading…".to_string(),
        (Some(balance), false) => balance.to_string(),
        (None, false) => "-".to_string(),
    };
    let account = if snapshot.is_virtual { "demo" } else { "real" };
    format!(
        "[{:?}] {} ({}) {} | {} account | balance {} | copy {:?} | ~{} copied (estimate)",
        snapshot.status,
        snapshot.display_name.as_deref().unwrap_or(PLACEHOLDER_LOGIN_ID),
        snapshot.initials(),
        snapshot.login_id.as_deref().unwrap_or(PLACEHOLDER_LOGIN_ID),
        account,
        balance,
        snapshot.copy,
        snapshot.copied_trades_estimate,
    )
}
