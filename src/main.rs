use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;

use perpbot::bot::Bot;
use perpbot::client::BinanceFuturesClient;
use perpbot::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "Automated perpetual-futures position manager")]
struct Args {
    /// Path to the bot configuration file
    #[arg(short, long, default_value = "bots.toml")]
    config: PathBuf,

    /// Only start bots whose name contains this substring
    #[arg(long)]
    only: Option<String>,
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perpbot=info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();
    let args = Args::parse();

    tracing::info!("🚀 perpbot starting");
    let app = AppConfig::load(&args.config)?;

    let mut bots = Vec::new();
    let mut shutdown_flags = Vec::new();
    for bot_config in app.bots {
        if !bot_config.enabled {
            tracing::info!("Skipping disabled bot '{}'", bot_config.bot_name);
            continue;
        }
        if let Some(ref filter) = args.only {
            if !bot_config.bot_name.contains(filter.as_str()) {
                continue;
            }
        }

        let config = Arc::new(bot_config);
        let client = Arc::new(BinanceFuturesClient::new(config.wait_max_secs)?);
        let bot = Bot::new(config.clone(), client).await?;
        shutdown_flags.push(bot.shutdown_handle());
        bots.push((config.bot_name.clone(), tokio::spawn(bot.run())));
    }
    if bots.is_empty() {
        bail!("no bots to run (all disabled or filtered out)");
    }
    tracing::info!("✅ {} bot(s) running", bots.len());

    // Ctrl-C flips every running flag; each bot stops after its current
    // tick, so no order or ledger write gets interrupted mid-flight.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, stopping after current ticks");
            for flag in &shutdown_flags {
                flag.store(false, Ordering::Relaxed);
            }
        }
    });

    for (name, handle) in bots {
        match handle.await {
            Ok(Ok(())) => tracing::info!("Bot '{}' finished", name),
            Ok(Err(e)) => tracing::error!("Bot '{}' stopped with fatal error: {e:#}", name),
            Err(e) => tracing::error!("Bot '{}' task panicked: {e}", name),
        }
    }
    Ok(())
}
