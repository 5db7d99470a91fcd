use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;

/// Scroll Sepolia
fn default_chain_id() -> u64 {
    534351
}

/// 0.5%, the rate the deployed factory charges
fn default_fee_bps() -> u64 {
    50
}

fn default_receipt_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_output_dir() -> String {
    "invoices".to_string()
}

/// Configuration for the application
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database connection URL; the off-chain mirror is skipped without it
    pub database_url: Option<String>,

    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub rpc_url: Option<String>,
    /// Hex private key of the wallet that signs transactions and user operations
    pub private_key: Option<String>,

    pub invoice_factory_address: Option<String>,
    pub usdc_address: Option<String>,
    pub entry_point_address: Option<String>,
    pub account_factory_address: Option<String>,
    /// Fee the local simulation charges; the deployed factory reports its own
    #[serde(default = "default_fee_bps")]
    pub platform_fee_bps: u64,

    pub bundler_url: Option<String>,
    pub paymaster_url: Option<String>,
    pub paymaster_policy_id: Option<String>,
    /// Fixed `paymasterAndData` for a verifying paymaster that needs no RPC
    pub paymaster_and_data: Option<String>,
    #[serde(default)]
    pub account_salt: u64,

    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_output_dir")]
    pub invoice_output_dir: String,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Variables from a `.env` file are loaded first when one exists.
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let config = envy::from_env::<Config>()?;

        Ok(config)
    }

    /// Build a configuration from explicit key/value pairs
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::from_iter(pairs)?)
    }

    /// Get a direct reference to the database URL
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Initialize environment variables and load configuration
pub fn init() -> Result<Config> {
    let config = Config::load()?;

    if config.log_format != "text" && config.log_format != "json" {
        anyhow::bail!("LOG_FORMAT must be `text` or `json`, got `{}`", config.log_format);
    }

    Ok(config)
}
