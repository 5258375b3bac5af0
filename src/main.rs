use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use crypto_exchange::config::{self, Config};
use crypto_exchange::db::{InMemoryOrderRepository, InMemoryTradeRepository};
use crypto_exchange::models::NewOrder;
use crypto_exchange::trading_engine::{MatchingEngineManager, TradingEngine};
use crypto_exchange::utils;
use crypto_exchange::wallet::InMemoryWallet;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Feed a file of JSON orders (one per line) through the engine and
    /// print the resulting books
    Replay {
        /// Order script, one NewOrder JSON object per line
        #[arg(short, long)]
        input: PathBuf,

        /// Levels per side to print, defaults to the configured depth
        #[arg(short, long)]
        depth: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    utils::logging::init_logger();

    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config()?;
    utils::logging::set_level(&config.log_level);

    match cli.command {
        Command::Replay { input, depth } => {
            info!("Replaying {}", input.display());
            replay(&config, &input, depth.unwrap_or(config.default_depth)).await?;
        }
    }

    Ok(())
}

async fn replay(config: &Config, input: &Path, depth: usize) -> Result<()> {
    let manager = Arc::new(MatchingEngineManager::new(config.matching()));
    for symbol in &config.trading_pairs {
        manager.add_symbol(symbol.clone())?;
    }
    let engine = TradingEngine::new(
        manager.clone(),
        Arc::new(InMemoryOrderRepository::new()),
        Arc::new(InMemoryTradeRepository::new()),
        Arc::new(InMemoryWallet::unlimited()),
    );

    let file = File::open(input)
        .with_context(|| format!("Failed to open order script {}", input.display()))?;
    let mut placed = 0;
    let mut rejected = 0;
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("Failed to read order script")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let request: NewOrder = serde_json::from_str(line)
            .with_context(|| format!("Invalid order on line {}", number + 1))?;
        match engine.place_order(request).await {
            Ok(receipt) => {
                placed += 1;
                for trade in &receipt.trades {
                    info!(
                        "{} {} @ {} = {} (buyer {}, seller {})",
                        trade.symbol,
                        trade.quantity,
                        trade.price,
                        utils::format_decimal(trade.notional(), 2),
                        trade.buyer_order_id,
                        trade.seller_order_id
                    );
                }
            }
            Err(e) => {
                rejected += 1;
                warn!("Line {}: {}", number + 1, e);
            }
        }
    }
    info!("Replay done: {} placed, {} rejected", placed, rejected);

    for symbol in manager.symbols() {
        let book = manager.get_engine(&symbol)?;
        let depth = book.depth(depth);
        println!(
            "{}",
            serde_json::to_string_pretty(&depth).context("Failed to serialize depth")?
        );
    }

    Ok(())
}
