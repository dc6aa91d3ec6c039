//! Diagnostic tool - Check harvester status
//!
//! Run with: cargo run --bin diagnose [-- --probe <token_id>]

use std::env;

use clap::Parser;
use color_eyre::eyre::Result;

use claim_harvester::cache::{ClaimCache, ClaimRecord};
use claim_harvester::chain::{ChainReadClient, ChainReader};
use claim_harvester::config::Config;
use claim_harvester::harvester::{read_checkpoint, CrawlStatus};

#[derive(Parser)]
#[command(name = "diagnose", about = "Inspect configuration, checkpoint and cache")]
struct Args {
    /// Read one token straight from the node and compare it with the cache
    #[arg(long)]
    probe: Option<u64>,
}

fn section(title: &str) {
    println!("\n═══════════════════════════════════════════════════");
    println!("  {}", title);
    println!("═══════════════════════════════════════════════════\n");
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    println!("🔍 HARVESTER DIAGNOSTIC CHECK");

    let config = Config::from_env()?;

    section("CONFIGURATION");
    let checks = [
        ("RPC_URL", "Node endpoint"),
        ("CONTRACT_ADDRESS", "Claim contract"),
        ("CACHE_DB_PATH", "SQLite cache file"),
        ("CHECKPOINT_PATH", "Progress checkpoint"),
        ("MAX_TOKEN_ID", "Default upper bound"),
        ("MAX_CONCURRENT_REQUESTS", "Concurrency ceiling"),
        ("BATCH_SIZE", "Tokens per batch"),
    ];
    for (key, desc) in checks {
        let marker = if env::var(key).is_ok() { "(from .env)" } else { "(default)" };
        println!("  {} {}", key, marker);
        println!("    └─ {}", desc);
    }
    println!();
    config.print_summary();

    match config.validate() {
        Ok(()) => println!("\n  ✅ Configuration valid"),
        Err(e) => println!("\n  ❌ Configuration invalid: {}", e),
    }

    section("CHECKPOINT");
    match read_checkpoint(config.checkpoint_path()) {
        Ok(Some(cp)) => {
            let icon = match cp.status {
                CrawlStatus::Running => "⏳",
                CrawlStatus::Completed => "✅",
                CrawlStatus::Error => "❌",
            };
            println!("  {} {} at token {}", icon, cp.status, cp.current_token_id);
            if let Some(job) = cp.stats.get("job").and_then(|v| v.as_str()) {
                println!("     → Job: {}", job);
            }
            let failed = cp.failed_token_ids();
            if !failed.is_empty() {
                println!("     → {} failed tokens pending retry", failed.len());
            }
            if cp.status == CrawlStatus::Running {
                println!("     → A job is running, or the last one was killed mid-run");
            }
        }
        Ok(None) => println!("  📭 No checkpoint yet"),
        Err(e) => println!("  ❌ Unreadable checkpoint: {}", e),
    }

    section("CACHE");
    let cache = if config.cache_db_path().exists() {
        let cache = ClaimCache::open(config.cache_db_path())?;
        let stats = cache.stats().await?;
        println!("  Records:   {}", stats.total_count);
        println!(
            "  Coverage:  {:.2}% of 1..={}",
            stats.coverage(config.max_token_id) * 100.0,
            config.max_token_id
        );
        if let Some(ts) = stats.last_updated_at() {
            println!("  Updated:   {}", ts.to_rfc3339());
        }
        Some(cache)
    } else {
        println!("  📭 No cache at {}", config.cache_db_path);
        None
    };

    if let Some(token_id) = args.probe {
        section("PROBE");
        let client = ChainReadClient::new(&config.rpc_url, config.contract()?)?;
        match client.read_snapshot(token_id).await {
            Ok(raw) => {
                let live = ClaimRecord::from_raw(token_id, &raw, 0);
                println!("  Live:   {}", serde_json::to_string(&live)?);

                let cached = match &cache {
                    Some(cache) => cache.get(token_id).await?,
                    None => None,
                };
                match cached {
                    Some(record) if record.same_values(&live) => {
                        println!("  Cached: ✅ matches");
                    }
                    Some(record) => {
                        println!("  Cached: ⚠️  differs: {}", serde_json::to_string(&record)?);
                    }
                    None => println!("  Cached: 📭 not cached"),
                }
            }
            Err(e) => println!("  ❌ Probe failed: {:#}", e),
        }
    }

    println!("\n✅ Diagnostic complete!\n");
    Ok(())
}
