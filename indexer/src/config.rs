//! Configuration for the indexer service

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mixscope::consts::{
    BPS, DEFAULT_BATCH_DELAY_MS, DEFAULT_BATCH_SIZE, DEFAULT_EXPECTED_FEE_BPS,
    DEFAULT_MAX_FEE_BPS, DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_INTERVAL_MS,
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_SPEND_CONFIDENCE, MS_PER_DAY,
};
use mixscope::{ConfigError, CorrelationConfig, IndexerSettings, ProtocolRegistry, RetryPolicy};

/// Privacy-pool indexer and linkability analyzer
#[derive(Parser, Debug, Clone)]
#[command(name = "mixscope-indexer")]
#[command(about = "Indexes privacy-pool activity and scores withdrawal linkability", long_about = None)]
pub struct Config {
    /// RPC URL (HTTP, JSON-RPC 2.0)
    #[arg(long, env = "RPC_URL", default_value = "https://api.mainnet-beta.solana.com")]
    pub rpc_url: String,

    /// Database path
    #[arg(long, env = "DATABASE_PATH", default_value = "mixscope.db")]
    pub db_path: PathBuf,

    /// Protocol registry (TOML)
    #[arg(long, env = "PROTOCOLS_PATH", default_value = "protocols.toml")]
    pub protocols_path: PathBuf,

    /// Only index these protocol ids (comma separated)
    #[arg(long, env = "PROTOCOLS", value_delimiter = ',')]
    pub protocols: Vec<String>,

    /// Minimum spacing between RPC requests in milliseconds
    #[arg(long, env = "REQUEST_INTERVAL_MS", default_value_t = DEFAULT_REQUEST_INTERVAL_MS)]
    pub request_interval_ms: u64,

    /// First rate-limit backoff in milliseconds (doubles per retry)
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = DEFAULT_RETRY_BASE_DELAY_MS)]
    pub retry_base_delay_ms: u64,

    /// Retries after a rate-limited request
    #[arg(long, env = "MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Transactions fetched concurrently per batch
    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Delay between batches in milliseconds
    #[arg(long, env = "BATCH_DELAY_MS", default_value_t = DEFAULT_BATCH_DELAY_MS)]
    pub batch_delay_ms: u64,

    /// Signatures fetched per protocol per run
    #[arg(long, env = "SIGNATURE_LIMIT", default_value = "100")]
    pub signature_limit: usize,

    /// Stored deposits and withdrawals loaded into the correlation engine
    #[arg(long, env = "HISTORY_LIMIT", default_value = "10000")]
    pub history_limit: usize,

    /// Poll interval in seconds (watch mode)
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "60")]
    pub poll_interval_secs: u64,

    /// Correlation window in days
    #[arg(long, env = "WINDOW_DAYS", default_value = "30")]
    pub window_days: u64,

    /// Largest plausible fee, in basis points of the deposit
    #[arg(long, env = "MAX_FEE_BPS", default_value_t = DEFAULT_MAX_FEE_BPS)]
    pub max_fee_bps: u64,

    /// Assumed fee when none was observed, in basis points
    #[arg(long, env = "EXPECTED_FEE_BPS", default_value_t = DEFAULT_EXPECTED_FEE_BPS)]
    pub expected_fee_bps: u64,

    /// Confidence needed to mark a uniquely linked deposit spent
    #[arg(long, env = "SPEND_CONFIDENCE", default_value_t = DEFAULT_SPEND_CONFIDENCE)]
    pub spend_confidence: f64,

    /// Gateway port (watch mode)
    #[arg(long, env = "PORT", default_value = "3000")]
    pub port: u16,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Single pass over all active protocols
    Once,

    /// Poll continuously and serve the gateway
    Watch,

    /// Page one protocol back through its history
    Backfill {
        /// Protocol id
        protocol: String,

        /// Signatures per page
        #[arg(long, default_value = "1000")]
        page_size: usize,

        /// Stop after this many pages
        #[arg(long)]
        max_pages: Option<usize>,
    },

    /// Load stored events, run correlation, print results
    Analyze,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_retries: self.max_retries,
            request_interval: Duration::from_millis(self.request_interval_ms),
        }
    }

    pub fn indexer_settings(&self) -> IndexerSettings {
        IndexerSettings {
            batch_size: self.batch_size.max(1),
            batch_delay: Duration::from_millis(self.batch_delay_ms),
        }
    }

    pub fn correlation(&self) -> Result<CorrelationConfig, ConfigError> {
        if self.window_days == 0 {
            return Err(invalid("window_days", "must be at least one day"));
        }
        if self.max_fee_bps > BPS || self.expected_fee_bps > BPS {
            return Err(invalid("max_fee_bps", "fee ratios are at most 10000 bps"));
        }
        if !(0.0..=1.0).contains(&self.spend_confidence) {
            return Err(invalid("spend_confidence", "must be within [0, 1]"));
        }
        Ok(CorrelationConfig {
            max_window_ms: self.window_days as i64 * MS_PER_DAY,
            max_fee_bps: self.max_fee_bps,
            expected_fee_bps: self.expected_fee_bps,
            spend_confidence: self.spend_confidence,
        })
    }

    /// Reads the registry and narrows it to `--protocols` when given.
    pub fn load_registry(&self) -> Result<ProtocolRegistry, ConfigError> {
        let registry = ProtocolRegistry::load(&self.protocols_path)?;
        if self.protocols.is_empty() {
            Ok(registry)
        } else {
            registry.with_only(&self.protocols)
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        protocol: "*".to_string(),
        field,
        reason: reason.to_string(),
    }
}
