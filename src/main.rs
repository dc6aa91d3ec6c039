//! Claim Harvester - builds and maintains the local claim cache
//!
//! Run with: cargo run -- <job> [max_token_id]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use console::style;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use claim_harvester::cache::ClaimCache;
use claim_harvester::chain::ChainReadClient;
use claim_harvester::config::Config;
use claim_harvester::harvester::{
    read_checkpoint, AdaptiveScheduler, CrawlOrchestrator, CrawlReport, FileCheckpointSink,
    RecordFetcher, ValidationRepair,
};

#[derive(Parser)]
#[command(name = "harvester", version, about = "Harvest per-token claim data into a local cache")]
struct Cli {
    /// TOML config file (environment variables are used otherwise)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Never draw a progress bar
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sweep 1..=MAX_TOKEN_ID, skipping tokens already cached
    Build { max_token_id: Option<u64> },

    /// Fetch only the tokens missing from the cache
    FillGaps { max_token_id: Option<u64> },

    /// Re-fetch tokens the last run failed to store
    RetryFailed { max_token_id: Option<u64> },

    /// Check every cached record and re-fetch invalid or missing ones
    Validate {
        max_token_id: Option<u64>,

        /// Report counts without fetching anything
        #[arg(long)]
        scan_only: bool,
    },

    /// Force re-fetch of specific tokens (space or comma separated)
    Refresh {
        #[arg(required = true, num_args = 1.., value_delimiter = ',')]
        token_ids: Vec<u64>,
    },

    /// Print cache statistics and the latest checkpoint
    Stats,
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!("{}", style(" 🌾 CLAIM HARVESTER").cyan().bold());
    println!(
        "{}",
        style("    Adaptive RPC Crawl | SQLite Cache | Self-Repair").cyan()
    );
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}

fn build_orchestrator(config: &Config, show_progress: bool) -> Result<Arc<CrawlOrchestrator>> {
    let client = ChainReadClient::new(&config.rpc_url, config.contract()?)?;
    let scheduler = AdaptiveScheduler::new(config.scheduler_config());
    let fetcher = Arc::new(RecordFetcher::new(
        Arc::new(client),
        scheduler,
        config.fetcher_config(),
    ));
    let cache = ClaimCache::open(config.cache_db_path())?.with_chunk_size(config.cache_chunk_size);
    let sink = Arc::new(FileCheckpointSink::new(config.checkpoint_path()));

    Ok(Arc::new(CrawlOrchestrator::new(
        fetcher,
        cache,
        sink,
        config.crawl_settings(show_progress),
    )))
}

fn print_crawl_report(title: &str, report: &CrawlReport) {
    println!();
    println!("{}", style(format!("═══ {} ═══", title)).green().bold());
    println!("   Targets:  {}", report.targets);
    println!("   Fetched:  {}", report.fetched);
    println!("   Skipped:  {}", report.skipped);
    println!("   Failed:   {}", report.failed);
    println!(
        "   Elapsed:  {:.1}s ({:.1} tokens/s)",
        report.elapsed.as_secs_f64(),
        report.rate_per_second()
    );
    if !report.failed_token_ids.is_empty() {
        println!(
            "{} {} tokens failed to store, run `harvester retry-failed`",
            style("⚠").yellow(),
            report.failed_token_ids.len()
        );
    }
}

async fn print_stats(config: &Config) -> Result<()> {
    let cache = ClaimCache::open(config.cache_db_path())?.with_chunk_size(config.cache_chunk_size);
    let stats = cache.stats().await?;

    println!("{}", style("═══ CACHE ═══").blue().bold());
    println!("   Records:       {}", stats.total_count);
    println!("   Lookup chunk:  {} ids per query", cache.chunk_size());
    println!(
        "   Token range:   {} - {}",
        stats.min_token_id.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        stats.max_token_id.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
    );
    println!(
        "   Coverage:      {:.2}% of 1..={}",
        stats.coverage(config.max_token_id) * 100.0,
        config.max_token_id
    );
    println!(
        "   Last updated:  {}",
        stats
            .last_updated_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into())
    );

    println!();
    println!("{}", style("═══ CHECKPOINT ═══").blue().bold());
    match read_checkpoint(config.checkpoint_path())? {
        Some(cp) => {
            println!("   Status:        {}", cp.status);
            println!("   Token:         {}", cp.current_token_id);
            println!("   Written:       {}", cp.timestamp);
            println!("   Stats:         {}", serde_json::to_string_pretty(&cp.stats)?);
        }
        None => println!("   No checkpoint at {}", config.checkpoint_path),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("claim_harvester=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    print_banner();

    let config = load_config(cli.config.as_ref())?;

    if let Command::Stats = cli.command {
        return print_stats(&config).await;
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        error!("Please check your .env file");
        return Err(e);
    }
    config.print_summary();
    println!();

    let orchestrator = build_orchestrator(&config, !cli.no_progress)?;
    let max = |arg: Option<u64>| arg.unwrap_or(config.max_token_id);

    match cli.command {
        Command::Build { max_token_id } => {
            let report = orchestrator.run_full(max(max_token_id)).await?;
            print_crawl_report("BUILD COMPLETE", &report);
        }
        Command::FillGaps { max_token_id } => {
            let report = orchestrator.fill_gaps(max(max_token_id)).await?;
            print_crawl_report("GAP FILL COMPLETE", &report);
        }
        Command::RetryFailed { max_token_id } => {
            let previous = read_checkpoint(config.checkpoint_path())?;
            let report = orchestrator
                .retry_failed(max(max_token_id), previous.as_ref())
                .await?;
            print_crawl_report("RETRY COMPLETE", &report);
        }
        Command::Validate {
            max_token_id,
            scan_only,
        } => {
            let repair = ValidationRepair::new(Arc::clone(&orchestrator));
            if scan_only {
                let scan = repair.scan(max(max_token_id)).await?;
                println!("{}", style("═══ VALIDATION SCAN ═══").green().bold());
                println!("   Scanned:  {}", scan.scanned);
                println!("   Valid:    {}", scan.valid);
                println!("   Invalid:  {}", scan.invalid());
                println!("   Missing:  {}", scan.missing_ids.len());
            } else {
                let report = repair.run(max(max_token_id)).await?;
                println!("{}", style("═══ REPAIR COMPLETE ═══").green().bold());
                println!("   Scanned:  {}", report.scan.scanned);
                println!("   Valid:    {}", report.scan.valid);
                println!("   Invalid:  {}", report.scan.invalid());
                println!("   Missing:  {}", report.scan.missing_ids.len());
                println!("   Repaired: {}", report.repaired);
                println!("   Failed:   {}", report.failed);
            }
        }
        Command::Refresh { token_ids } => {
            let report = orchestrator.refresh(&token_ids).await?;
            print_crawl_report("REFRESH COMPLETE", &report);
        }
        Command::Stats => {}
    }

    info!("👋 Done");
    Ok(())
}
