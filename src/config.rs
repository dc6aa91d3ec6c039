//! Harvester Configuration
//!
//! Loaded from environment variables (and `.env`), or from a TOML file.
//! Every numeric knob falls back to its default when unset or unparseable.

use alloy_primitives::Address;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::cache::MAX_LOOKUP_CHUNK;
use crate::harvester::{CrawlSettings, FetcherConfig, SchedulerConfig};

/// Highest token id minted when the harvester was written
pub const DEFAULT_MAX_TOKEN_ID: u64 = 126_100;

// ============================================
// MAIN CONFIGURATION
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ========== Network Settings ==========
    /// JSON-RPC endpoint
    pub rpc_url: String,

    /// Claim contract to read from
    pub contract_address: Option<String>,

    // ========== Storage ==========
    pub cache_db_path: String,
    pub checkpoint_path: String,

    /// Upper end of the identifier space when a job is given no bound
    pub max_token_id: u64,

    // ========== Rate Limiting ==========
    /// Starting and ceiling concurrency bound
    pub max_concurrent_requests: usize,

    /// Concurrency floor under sustained rate limiting
    pub min_concurrent_requests: usize,

    /// Minimum gap between request starts
    pub request_spacing_ms: u64,

    /// Pause after each structural call in a fetch
    pub call_pause_ms: u64,

    // ========== Crawl ==========
    pub batch_size: usize,
    pub gap_scan_batch_size: usize,
    pub batch_pause_ms: u64,

    /// Parameter ceiling for batch cache lookups
    pub cache_chunk_size: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            rpc_url: env::var("RPC_URL").unwrap_or(defaults.rpc_url),
            contract_address: env::var("CONTRACT_ADDRESS")
                .ok()
                .filter(|s| !s.trim().is_empty()),

            cache_db_path: env::var("CACHE_DB_PATH").unwrap_or(defaults.cache_db_path),
            checkpoint_path: env::var("CHECKPOINT_PATH").unwrap_or(defaults.checkpoint_path),
            max_token_id: env_or("MAX_TOKEN_ID", defaults.max_token_id),

            max_concurrent_requests: env_or(
                "MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            ),
            min_concurrent_requests: env_or(
                "MIN_CONCURRENT_REQUESTS",
                defaults.min_concurrent_requests,
            ),
            request_spacing_ms: env_or("REQUEST_SPACING_MS", defaults.request_spacing_ms),
            call_pause_ms: env_or("CALL_PAUSE_MS", defaults.call_pause_ms),

            batch_size: env_or("BATCH_SIZE", defaults.batch_size),
            gap_scan_batch_size: env_or("GAP_SCAN_BATCH_SIZE", defaults.gap_scan_batch_size),
            batch_pause_ms: env_or("BATCH_PAUSE_MS", defaults.batch_pause_ms),
            cache_chunk_size: env_or("CACHE_CHUNK_SIZE", defaults.cache_chunk_size),
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Parsed contract address
    pub fn contract(&self) -> Result<Address> {
        let raw = self
            .contract_address
            .as_deref()
            .ok_or_else(|| eyre::eyre!("CONTRACT_ADDRESS is not set"))?;
        Address::from_str(raw.trim())
            .map_err(|e| eyre::eyre!("Invalid CONTRACT_ADDRESS {:?}: {}", raw, e))
    }

    /// Validate configuration before starting a job
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() || self.rpc_url.contains("YOUR_API_KEY") {
            return Err(eyre::eyre!("Invalid RPC_URL - please set a reachable JSON-RPC endpoint"));
        }

        self.contract()?;

        if self.max_concurrent_requests == 0 {
            return Err(eyre::eyre!("MAX_CONCURRENT_REQUESTS must be at least 1"));
        }
        if self.min_concurrent_requests > self.max_concurrent_requests {
            return Err(eyre::eyre!(
                "MIN_CONCURRENT_REQUESTS ({}) exceeds MAX_CONCURRENT_REQUESTS ({})",
                self.min_concurrent_requests,
                self.max_concurrent_requests
            ));
        }
        if self.batch_size == 0 || self.gap_scan_batch_size == 0 {
            return Err(eyre::eyre!("BATCH_SIZE and GAP_SCAN_BATCH_SIZE must be non-zero"));
        }
        if self.cache_chunk_size == 0 || self.cache_chunk_size > MAX_LOOKUP_CHUNK {
            return Err(eyre::eyre!(
                "CACHE_CHUNK_SIZE must be between 1 and {} (currently {})",
                MAX_LOOKUP_CHUNK,
                self.cache_chunk_size
            ));
        }

        Ok(())
    }

    pub fn cache_db_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_db_path)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        PathBuf::from(&self.checkpoint_path)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent_requests,
            min_concurrent: self.min_concurrent_requests,
            min_spacing: Duration::from_millis(self.request_spacing_ms),
            ..SchedulerConfig::default()
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            call_pause: Duration::from_millis(self.call_pause_ms),
            ..FetcherConfig::default()
        }
    }

    pub fn crawl_settings(&self, show_progress: bool) -> CrawlSettings {
        CrawlSettings {
            batch_size: self.batch_size,
            gap_scan_batch_size: self.gap_scan_batch_size,
            batch_pause: Duration::from_millis(self.batch_pause_ms),
            show_progress,
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let contract = self.contract_address.as_deref().unwrap_or("✗ Not Set");
        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║             CLAIM HARVESTER - CONFIGURATION                ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ RPC:               {:<40} ║", truncate(&self.rpc_url, 40));
        println!("║ Contract:          {:<40} ║", truncate(contract, 40));
        println!("║ Max Token ID:      {:<40} ║", self.max_token_id);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ STORAGE                                                    ║");
        println!("║ • Cache DB:        {:<40} ║", truncate(&self.cache_db_path, 40));
        println!("║ • Checkpoint:      {:<40} ║", truncate(&self.checkpoint_path, 40));
        println!("║ • Lookup Chunk:    {:<40} ║", self.cache_chunk_size);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ RATE LIMITING                                              ║");
        println!(
            "║ • Concurrency:     {:<40} ║",
            format!("{} (floor {})", self.max_concurrent_requests, self.min_concurrent_requests)
        );
        println!("║ • Spacing:         {:<40} ║", format!("{}ms", self.request_spacing_ms));
        println!("║ • Call Pause:      {:<40} ║", format!("{}ms", self.call_pause_ms));
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ CRAWL                                                      ║");
        println!("║ • Batch Size:      {:<40} ║", self.batch_size);
        println!("║ • Gap Scan Batch:  {:<40} ║", self.gap_scan_batch_size);
        println!("║ • Batch Pause:     {:<40} ║", format!("{}ms", self.batch_pause_ms));
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", head)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "https://eth.llamarpc.com".to_string(),
            contract_address: None,
            cache_db_path: "./data/claims.db".to_string(),
            checkpoint_path: "./data/crawl_checkpoint.json".to_string(),
            max_token_id: DEFAULT_MAX_TOKEN_ID,
            max_concurrent_requests: 15,
            min_concurrent_requests: 5,
            request_spacing_ms: 50,
            call_pause_ms: 50,
            batch_size: 100,
            gap_scan_batch_size: 1_000,
            batch_pause_ms: 200,
            cache_chunk_size: MAX_LOOKUP_CHUNK,
        }
    }
}

// ============================================
// TESTS
// ============================================
