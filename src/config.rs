use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub ledger: Ledger,
    pub payment: Payment,
    #[serde(default)]
    pub replay: Replay,
    pub service: Service,
    #[serde(default)]
    pub metrics: Metrics,
    pub storage: Storage,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Ledger {
    pub rpc_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Recipient {
    pub address: String,
    pub percent: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Payment {
    /// Analysis fee in whole settlement tokens (e.g. 0.30 USDC).
    #[serde(default = "default_fee")]
    pub fee: f64,
    #[serde(default = "default_mint")]
    pub mint: String,
    /// Ordered split recipients; percents must sum to 100. The last entry
    /// absorbs the rounding remainder.
    pub recipients: Vec<Recipient>,
    #[serde(default = "default_referral_percent")]
    pub referral_percent: u64,
    /// A claimed payment older than this is rejected.
    #[serde(default = "default_recency")]
    pub recency_secs: u64,
    /// Underpayment tolerance in percent of the expected total.
    #[serde(default = "default_tolerance")]
    pub tolerance_percent: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Replay {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for Replay {
    fn default() -> Self {
        Replay { capacity: default_capacity() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Service {
    #[serde(default = "default_service_bind")]
    pub bind: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Honored only when environment = "development": allows settlement
    /// without a payment signature. Never enable outside local testing.
    #[serde(default)]
    pub allow_unverified: bool,
    /// External endpoint the paid action is forwarded to once payment is
    /// verified. When unset the service only acknowledges the unlock.
    #[serde(default)]
    pub action_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics { bind: default_metrics_bind() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Storage {
    pub path: String,
}

fn default_timeout() -> u64 { 15 }
fn default_fee() -> f64 { 0.30 }
// USDC mint on Solana mainnet
fn default_mint() -> String { "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".into() }
fn default_referral_percent() -> u64 { 10 }
fn default_recency() -> u64 { 300 }
fn default_tolerance() -> u64 { 1 }
fn default_capacity() -> usize { 10_000 }
fn default_service_bind() -> String { "127.0.0.1:8780".into() }
fn default_environment() -> String { "production".into() }
fn default_metrics_bind() -> String { "0.0.0.0:9100".into() }

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    toml::from_str(text).with_context(|| "📝  invalid TOML in config file".to_string())
}
