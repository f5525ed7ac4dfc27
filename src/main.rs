use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::{GatekeeperConfig, Registry, RequestMeta};

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Fixed-window request admission control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a configuration and report the limiters it defines
    Validate {
        /// Path to the YAML configuration
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Decide newline-delimited JSON requests read from stdin
    Run {
        /// Path to the YAML configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Only apply this limiter instead of all of them
        #[arg(short, long)]
        limiter: Option<String>,
    },
}

/// One request read from stdin.
#[derive(Debug, Deserialize)]
struct RequestRecord {
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl From<RequestRecord> for RequestMeta {
    fn from(record: RequestRecord) -> Self {
        let mut meta = RequestMeta::new();
        if let Some(ip) = record.ip {
            meta = meta.with_remote_addr(ip);
        }
        for (name, value) in record.headers {
            meta.insert_header(name, value);
        }
        meta
    }
}

/// One decision written to stdout.
#[derive(Debug, Serialize)]
struct Verdict {
    allow: bool,
    retry_after_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries decisions.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Run { config, limiter } => run(config, limiter).await,
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = GatekeeperConfig::from_file(&path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;

    println!(
        "{} limiter(s), sweep every {}s (decay factor {})",
        config.limiters.len(),
        config.cache.sweep_interval_secs,
        config.cache.decay_factor
    );
    for limiter in &config.limiters {
        println!("  {}: {} keyed by {:?}", limiter.name, limiter.rate, limiter.key);
    }
    Ok(())
}

async fn run(path: PathBuf, only: Option<String>) -> anyhow::Result<()> {
    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatekeeperConfig::from_file(&path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    let registry = Registry::from_config(&config).context("failed to start limiters")?;
    if let Some(name) = &only {
        registry.require(name)?;
    }
    info!(limiters = registry.len(), "Limiters ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            info!("End of input");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let verdict = match serde_json::from_str::<RequestRecord>(&line) {
            Ok(record) => {
                let meta = RequestMeta::from(record);
                let outcome = match &only {
                    Some(name) => registry.require(name)?.check(&meta),
                    None => registry.check(&meta),
                };
                match outcome {
                    Ok(()) => Verdict {
                        allow: true,
                        retry_after_secs: 0.0,
                        body: None,
                        error: None,
                    },
                    Err(rejection) => Verdict {
                        allow: false,
                        retry_after_secs: rejection.retry_after.as_secs_f64(),
                        body: Some(rejection.body),
                        error: None,
                    },
                }
            }
            Err(e) => {
                warn!(error = %e, "Skipping malformed request record");
                Verdict {
                    allow: false,
                    retry_after_secs: 0.0,
                    body: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let mut out = serde_json::to_vec(&verdict)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    registry.shutdown().await;
    info!("Gatekeeper stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
