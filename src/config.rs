// src/config.rs
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;

use crate::models::Symbol;
use crate::trading_engine::{MarketRemainderPolicy, MatchingConfig};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Symbols that get a book at startup
    pub trading_pairs: Vec<Symbol>,
    pub log_level: String,
    /// Levels per side when printing depth
    pub default_depth: usize,
    /// Trades kept per book for `recent_trades`
    pub trade_history_limit: usize,
    pub market_remainder: MarketRemainderPolicy,
    pub extra: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            trading_pairs: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            log_level: "info".to_string(),
            default_depth: 20,
            trade_history_limit: 1000,
            market_remainder: MarketRemainderPolicy::default(),
            extra: HashMap::new(),
        }
    }
}

impl Config {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    /// The part of the configuration each matching engine needs
    pub fn matching(&self) -> MatchingConfig {
        MatchingConfig {
            market_remainder: self.market_remainder,
            trade_history_limit: self.trade_history_limit,
        }
    }
}

/// Load configuration from defaults, an optional TOML file named by
/// `CONFIG_FILE`, a `.env` file and the process environment, in that order.
pub fn load_config() -> Result<Config> {
    let mut config = match env::var("CONFIG_FILE") {
        Ok(path) => load_from_file(Path::new(&path))?,
        Err(_) => Config::default(),
    };

    // A missing .env file is fine
    dotenv::dotenv().ok();

    apply_env_vars(&mut config, env::vars());
    Ok(config)
}

/// Load configuration from a file
fn load_from_file(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to open configuration file {}", path.display()))?;
    Config::from_toml_str(&content)
}

fn apply_env_vars<I>(config: &mut Config, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        match key.as_str() {
            "TRADING_PAIRS" => {
                config.trading_pairs = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "LOG_LEVEL" => config.log_level = value,
            "DEFAULT_DEPTH" => match value.parse() {
                Ok(depth) => config.default_depth = depth,
                Err(_) => warn!("Ignoring invalid DEFAULT_DEPTH: {}", value),
            },
            "TRADE_HISTORY_LIMIT" => match value.parse() {
                Ok(limit) => config.trade_history_limit = limit,
                Err(_) => warn!("Ignoring invalid TRADE_HISTORY_LIMIT: {}", value),
            },
            "MARKET_REMAINDER" => match value.parse() {
                Ok(policy) => config.market_remainder = policy,
                Err(e) => warn!("Ignoring MARKET_REMAINDER: {}", e),
            },
            _ => {
                if let Some(config_key) = key.strip_prefix("CONFIG_") {
                    if config_key != "FILE" {
                        config.extra.insert(config_key.to_string(), value);
                    }
                }
            }
        }
    }
}
