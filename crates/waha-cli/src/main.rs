//! WAHA CLI - drive WhatsApp sessions over a JSON line protocol
//!
//! `waha serve` reads one request per line on stdin, for example
//! `{"method": "GET", "path": "/api/default/auth/qr?format=raw"}`, routes it
//! through the core router table and writes one `{status, body}` response per
//! line on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use waha_core::config::{Config, ConfigManager};
use waha_core::{
    ApiContext, ApiRequest, ApiResponse, HealthAggregator, LoopbackFactory, LoopbackOptions,
    SessionManager,
};

#[derive(Parser)]
#[command(name = "waha")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WhatsApp session orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to <config_dir>/waha/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// OTP code the loopback engine accepts
    #[arg(long, default_value = "123456")]
    otp_code: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the session API as JSON lines on stdin/stdout
    Serve,

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    }
    .context("Failed to load configuration")?;

    // stdout carries responses, so logs go to stderr
    let filter = if cli.verbose {
        "info,waha_core=debug".to_string()
    } else {
        config_manager.config().general.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Config { init }) => show_config(&config_manager, init)?,
        Some(Commands::Serve) | None => serve(config_manager.config(), &cli.otp_code).await?,
    }

    Ok(())
}

fn show_config(config_manager: &ConfigManager, init: bool) -> anyhow::Result<()> {
    if init {
        config_manager.save().context("Failed to write configuration")?;
        eprintln!("Wrote {}", config_manager.path().display());
    }
    eprintln!("Config file: {}", config_manager.path().display());
    println!("{}", serde_json::to_string_pretty(config_manager.config())?);
    Ok(())
}

async fn serve(config: &Config, otp_code: &str) -> anyhow::Result<()> {
    let engines = Arc::new(LoopbackFactory::new(
        LoopbackOptions::default()
            .with_emit_qr(true)
            .with_otp_code(otp_code),
    ));
    let manager = Arc::new(SessionManager::new(engines));

    let mut health = HealthAggregator::new(Arc::clone(&manager), config.health.policy);
    if let Some(stale_after) = config.health.stale_after() {
        health = health.with_stale_after(stale_after);
    }
    let api = ApiContext::new(Arc::clone(&manager), health).with_auth_policy(config.auth.policy());

    for entry in config.autostart_sessions() {
        manager
            .start_session(&entry.name, config.session_config(entry))
            .await
            .with_context(|| format!("Failed to start session '{}'", entry.name))?;
    }
    info!(sessions = manager.session_count().await, "Serving session API on stdin/stdout");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ApiRequest>(line) {
            Ok(request) => api.dispatch(&request).await,
            Err(e) => {
                warn!(error = %e, "Malformed request line");
                ApiResponse::error(400, format!("Malformed request: {}", e))
            }
        };

        let json = serde_json::to_string(&response)?;
        stdout.write_all(json.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    manager.shutdown().await;
    Ok(())
}
