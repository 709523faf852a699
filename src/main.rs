//! media-bridge daemon.
//!
//! Reads commands from stdin, one per line: `<command> [payload]`, e.g.
//! `source_tv_set_volume 30`, plus `tv_power on|off` and `state` (publish
//! everything). Published state goes to the log. Ctrl-C or end of input stops
//! the bridge.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use media_bridge::{BridgeConfig, LogPublisher, MediaBridge, Session};

#[derive(Debug, Parser)]
#[command(name = "media-bridge")]
#[command(about = "Multi-source audio mixing bridge")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = BridgeConfig::load(cli.config.as_deref())?;

    let level = if cli.verbose { "debug" } else { config.log.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let session = MediaBridge::builder()
        .config(config)
        .publisher(LogPublisher::new())
        .start()
        .await?;
    session.publish_full_state().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&session, &line).await,
                Ok(None) => {
                    info!("end of input");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    break;
                }
            },
        }
    }

    session.stop().await;
    Ok(())
}

async fn handle_line(session: &Session, line: &str) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return;
    }
    let (command, payload) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let payload = payload.trim();

    match command {
        "tv_power" => {
            let on = matches!(payload, "on" | "true" | "1");
            if let Err(e) = session.set_tv_power(on).await {
                warn!(error = %e, "tv power not applied");
            }
        }
        "state" => session.publish_full_state().await,
        // The router logs its own failures.
        _ => {
            let _ = session.handle_command(command, payload).await;
        }
    }
}
