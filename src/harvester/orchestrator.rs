//! Crawl Orchestrator
//!
//! Sweeps identifier ranges in fixed-size batches. Inside a batch every
//! fetch runs concurrently; the scheduler decides how many actually hit the
//! node at once. Between batches a checkpoint is written and the job pauses
//! briefly.
//!
//! Jobs:
//! - `run_full`: `1..=max`, skipping anything already cached
//! - `fill_gaps`: scan the cache for missing ids, then fetch only those
//! - `refresh`: forced re-fetch of an explicit id list
//! - `retry_failed`: forced re-fetch of ids whose write failed last run

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::checkpoint::{CheckpointSink, CrawlCheckpoint, CrawlStatus};
use super::fetcher::RecordFetcher;
use crate::cache::ClaimCache;

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub batch_size: usize,
    pub gap_scan_batch_size: usize,
    pub batch_pause: Duration,
    /// Draw a progress bar when stderr is a terminal
    pub show_progress: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            gap_scan_batch_size: 1_000,
            batch_pause: Duration::from_millis(200),
            show_progress: false,
        }
    }
}

/// Outcome of one pass over a target list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlReport {
    pub targets: usize,
    pub fetched: u64,
    pub skipped: u64,
    pub failed: u64,
    pub failed_token_ids: Vec<u64>,
    pub elapsed: Duration,
}

impl CrawlReport {
    pub fn processed(&self) -> u64 {
        self.fetched + self.skipped + self.failed
    }

    pub fn rate_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed() as f64 / secs
        } else {
            0.0
        }
    }
}

pub struct CrawlOrchestrator {
    fetcher: Arc<RecordFetcher>,
    cache: ClaimCache,
    sink: Arc<dyn CheckpointSink>,
    settings: CrawlSettings,
    /// Last identifier a batch finished on, for error checkpoints
    position: AtomicU64,
}

impl CrawlOrchestrator {
    pub fn new(
        fetcher: Arc<RecordFetcher>,
        cache: ClaimCache,
        sink: Arc<dyn CheckpointSink>,
        settings: CrawlSettings,
    ) -> Self {
        Self {
            fetcher,
            cache,
            sink,
            settings,
            position: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &ClaimCache {
        &self.cache
    }

    // ============================================
    // JOBS
    // ============================================

    /// Build the cache over `1..=max_token_id`
    pub async fn run_full(&self, max_token_id: u64) -> Result<CrawlReport> {
        info!("🚀 Full build over tokens 1..={}", max_token_id);
        let targets: Vec<u64> = (1..=max_token_id).collect();

        let result = self.run_batches("build", &targets, false).await;
        let report = self.finish("build", result).await?;
        self.log_report("Build", &report);
        Ok(report)
    }

    /// Identifiers in `1..=max_token_id` with no cached record, ascending
    pub async fn find_missing(&self, max_token_id: u64) -> Result<Vec<u64>> {
        let chunk = self.settings.gap_scan_batch_size.max(1) as u64;
        let mut missing = Vec::new();
        let mut start = 1u64;

        while start <= max_token_id {
            let end = start.saturating_add(chunk - 1).min(max_token_id);
            let ids: Vec<u64> = (start..=end).collect();

            let present: HashSet<u64> = self
                .cache
                .get_batch(&ids)
                .await?
                .iter()
                .filter_map(|r| r.numeric_token_id())
                .collect();
            missing.extend(ids.into_iter().filter(|id| !present.contains(id)));

            debug!("Gap scan {}..={}: {} missing so far", start, end, missing.len());
            if end == max_token_id {
                break;
            }
            start = end + 1;
        }

        info!(
            "🔍 Gap scan: {} of {} tokens missing",
            missing.len(),
            max_token_id
        );
        Ok(missing)
    }

    /// Fetch only the identifiers the cache lacks
    pub async fn fill_gaps(&self, max_token_id: u64) -> Result<CrawlReport> {
        let result = async {
            let missing = self.find_missing(max_token_id).await?;
            if missing.is_empty() {
                info!("✅ No gaps in 1..={}", max_token_id);
            }
            self.run_batches("fill-gaps", &missing, false).await
        }
        .await;

        let report = self.finish("fill-gaps", result).await?;
        self.log_report("Gap fill", &report);
        Ok(report)
    }

    /// Re-fetch and overwrite the given identifiers regardless of cache state
    pub async fn refresh(&self, token_ids: &[u64]) -> Result<CrawlReport> {
        let mut targets = token_ids.to_vec();
        targets.sort_unstable();
        targets.dedup();
        info!("🔄 Refreshing {} tokens", targets.len());

        let result = self.run_batches("refresh", &targets, true).await;
        let report = self.finish("refresh", result).await?;
        self.log_report("Refresh", &report);
        Ok(report)
    }

    /// Re-fetch the ids a previous run failed to store.
    ///
    /// With no previous checkpoint, or one that lists no failures, this is a
    /// gap fill over `1..=max_token_id`.
    pub async fn retry_failed(
        &self,
        max_token_id: u64,
        previous: Option<&CrawlCheckpoint>,
    ) -> Result<CrawlReport> {
        let mut failed = previous.map(|cp| cp.failed_token_ids()).unwrap_or_default();
        failed.sort_unstable();
        failed.dedup();

        if failed.is_empty() {
            info!("📭 No failed tokens recorded, falling back to gap fill");
            return self.fill_gaps(max_token_id).await;
        }

        info!("🔁 Retrying {} previously failed tokens", failed.len());
        let result = self.run_batches("retry-failed", &failed, true).await;
        let report = self.finish("retry-failed", result).await?;
        self.log_report("Retry", &report);
        Ok(report)
    }

    // ============================================
    // BATCH ENGINE
    // ============================================

    /// Fetch and store `targets` batch by batch, writing a running
    /// checkpoint after each one. With `force` unset, cached ids are skipped.
    pub(crate) async fn run_batches(
        &self,
        job: &str,
        targets: &[u64],
        force: bool,
    ) -> Result<CrawlReport> {
        let started = Instant::now();
        let mut report = CrawlReport {
            targets: targets.len(),
            ..Default::default()
        };
        let progress = self.progress_bar(job, targets.len() as u64);

        for (index, batch) in targets.chunks(self.settings.batch_size.max(1)).enumerate() {
            let cached: HashSet<u64> = if force {
                HashSet::new()
            } else {
                self.cache
                    .get_batch(batch)
                    .await?
                    .iter()
                    .filter_map(|r| r.numeric_token_id())
                    .collect()
            };

            let pending: Vec<u64> = batch
                .iter()
                .copied()
                .filter(|id| !cached.contains(id))
                .collect();
            report.skipped += (batch.len() - pending.len()) as u64;

            let outcomes = join_all(pending.iter().map(|&token_id| async move {
                let record = self.fetcher.fetch(token_id).await;
                (token_id, self.cache.put(token_id, &record).await)
            }))
            .await;

            for (token_id, outcome) in outcomes {
                match outcome {
                    Ok(()) => report.fetched += 1,
                    Err(e) => {
                        warn!("❌ Failed to store token {}: {:#}", token_id, e);
                        report.failed += 1;
                        report.failed_token_ids.push(token_id);
                    }
                }
            }

            let last = batch.last().copied().unwrap_or_default();
            self.position.store(last, Ordering::Relaxed);
            report.elapsed = started.elapsed();
            progress.inc(batch.len() as u64);

            let checkpoint =
                CrawlCheckpoint::new(last, CrawlStatus::Running, self.stats_json(job, &report));
            self.sink.write(&checkpoint).await?;

            debug!(
                "Batch {} done at token {}: {} fetched, {} skipped, {} failed",
                index + 1,
                last,
                report.fetched,
                report.skipped,
                report.failed
            );
            if (index + 1) % 10 == 0 {
                info!(
                    "📦 {}/{} processed ({:.1}/s)",
                    report.processed(),
                    report.targets,
                    report.rate_per_second()
                );
                self.fetcher.scheduler().log_state();
            }

            sleep(self.settings.batch_pause).await;
        }

        report.elapsed = started.elapsed();
        progress.finish_and_clear();
        Ok(report)
    }

    /// Counters shared by running and final checkpoints
    pub(crate) fn stats_json(&self, job: &str, report: &CrawlReport) -> Value {
        json!({
            "job": job,
            "total": report.targets,
            "processed": report.processed(),
            "fetched": report.fetched,
            "skipped": report.skipped,
            "failed": report.failed,
            "failedTokenIds": report.failed_token_ids,
            "elapsedSeconds": report.elapsed.as_secs_f64(),
            "ratePerSecond": report.rate_per_second(),
            "scheduler": self.fetcher.scheduler().snapshot(),
            "fetcher": self.fetcher.metrics(),
        })
    }

    /// Write the terminal checkpoint for a job: `completed` on success,
    /// `error` otherwise. The job's own error wins over a sink failure.
    async fn finish(&self, job: &str, result: Result<CrawlReport>) -> Result<CrawlReport> {
        match result {
            Ok(report) => {
                let checkpoint = CrawlCheckpoint::new(
                    self.position.load(Ordering::Relaxed),
                    CrawlStatus::Completed,
                    self.stats_json(job, &report),
                );
                self.sink.write(&checkpoint).await?;
                Ok(report)
            }
            Err(e) => {
                self.record_error(job, &e).await;
                Err(e)
            }
        }
    }

    /// Terminal checkpoint for jobs that report their own counters
    pub(crate) async fn write_completed(&self, stats: Value) -> Result<()> {
        let checkpoint = CrawlCheckpoint::new(
            self.position.load(Ordering::Relaxed),
            CrawlStatus::Completed,
            stats,
        );
        self.sink.write(&checkpoint).await
    }

    pub(crate) async fn record_error(&self, job: &str, error: &eyre::Report) {
        let checkpoint = CrawlCheckpoint::new(
            self.position.load(Ordering::Relaxed),
            CrawlStatus::Error,
            json!({ "job": job, "error": format!("{:#}", error) }),
        );
        if let Err(e) = self.sink.write(&checkpoint).await {
            warn!("Failed to write error checkpoint: {:#}", e);
        }
    }

    fn progress_bar(&self, job: &str, len: u64) -> ProgressBar {
        if !self.settings.show_progress || !console::Term::stderr().is_term() {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({per_sec}, eta {eta})",
        ) {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        pb.set_message(job.to_string());
        pb
    }

    fn log_report(&self, label: &str, report: &CrawlReport) {
        info!(
            "🏁 {} complete: {} fetched, {} skipped, {} failed in {:.1}s ({:.1}/s)",
            label,
            report.fetched,
            report.skipped,
            report.failed,
            report.elapsed.as_secs_f64(),
            report.rate_per_second()
        );
        if !report.failed_token_ids.is_empty() {
            warn!(
                "⚠️  {} tokens failed to store; run retry-failed",
                report.failed_token_ids.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ClaimRecord;
    use crate::harvester::checkpoint::MemoryCheckpointSink;
    use crate::harvester::fetcher::FetcherConfig;
    use crate::harvester::scheduler::{AdaptiveScheduler, SchedulerConfig};
    use crate::harvester::testing::MockReader;
    use alloy_primitives::U256;

    struct Harness {
        reader: Arc<MockReader>,
        sink: Arc<MemoryCheckpointSink>,
        orchestrator: CrawlOrchestrator,
    }

    fn harness(batch_size: usize) -> Harness {
        let reader = Arc::new(MockReader::new());
        let sink = Arc::new(MemoryCheckpointSink::new());
        let scheduler = AdaptiveScheduler::new(SchedulerConfig::default());
        let fetcher = Arc::new(RecordFetcher::new(
            reader.clone(),
            scheduler,
            FetcherConfig::default(),
        ));
        let settings = CrawlSettings {
            batch_size,
            gap_scan_batch_size: 7,
            ..Default::default()
        };
        let orchestrator = CrawlOrchestrator::new(
            fetcher,
            ClaimCache::open_in_memory().unwrap(),
            sink.clone(),
            settings,
        );
        Harness {
            reader,
            sink,
            orchestrator,
        }
    }

    fn stale(token_id: u64) -> ClaimRecord {
        ClaimRecord {
            token_id: token_id.to_string(),
            allocation_per_token: "1.00".into(),
            consumed: "0.00".into(),
            claimed: "0.00".into(),
            part_percentage: "0.5000".into(),
            init_unlock: "0.5000".into(),
            updated_at: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_build_then_idempotent_rerun() {
        let h = harness(10);

        let first = h.orchestrator.run_full(25).await.unwrap();
        assert_eq!(first.fetched, 25);
        assert_eq!(first.skipped, 0);
        assert_eq!(h.orchestrator.cache().stats().await.unwrap().total_count, 25);

        let calls_after_first = h.reader.total_calls();
        let snapshot = h.orchestrator.cache().scan_all().await.unwrap();

        let second = h.orchestrator.run_full(25).await.unwrap();
        assert_eq!(second.fetched, 0);
        assert_eq!(second.skipped, 25);
        assert_eq!(h.reader.total_calls(), calls_after_first);
        assert_eq!(h.orchestrator.cache().scan_all().await.unwrap(), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_completeness_with_transient_failures() {
        let h = harness(8);
        h.reader.fail_next(12, "connection reset");

        let report = h.orchestrator.run_full(20).await.unwrap();

        assert_eq!(report.fetched, 20);
        assert!(report.failed_token_ids.is_empty());
        let stats = h.orchestrator.cache().stats().await.unwrap();
        assert_eq!(stats.total_count, 20);
        assert_eq!(stats.min_token_id, Some(1));
        assert_eq!(stats.max_token_id, Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_failure_writes_error_checkpoint() {
        let h = harness(5);
        h.orchestrator
            .cache()
            .execute_raw("DROP TABLE claim_data;")
            .await
            .unwrap();

        assert!(h.orchestrator.run_full(3).await.is_err());

        let last = h.sink.last().unwrap();
        assert_eq!(last.status, CrawlStatus::Error);
        assert_eq!(last.stats["job"], "build");
        assert!(last.stats["error"].as_str().is_some_and(|e| !e.is_empty()));
        assert_eq!(h.reader.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoints_per_batch_then_completed() {
        let h = harness(4);

        h.orchestrator.run_full(10).await.unwrap();

        let written = h.sink.all();
        // 3 batches + final
        assert_eq!(written.len(), 4);
        let positions: Vec<u64> = written.iter().map(|c| c.current_token_id).collect();
        assert_eq!(positions, vec![4, 8, 10, 10]);
        assert!(written[..3].iter().all(|c| c.status == CrawlStatus::Running));

        let last = h.sink.last().unwrap();
        assert_eq!(last.status, CrawlStatus::Completed);
        assert_eq!(last.stats["fetched"], 10);
        assert_eq!(last.stats["job"], "build");
        assert!(last.stats["scheduler"]["maxConcurrent"].is_u64());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_gaps_fetches_only_missing() {
        let h = harness(5);
        let cache = h.orchestrator.cache();
        for id in [1, 2, 5, 9, 15] {
            cache.put(id, &stale(id)).await.unwrap();
        }

        let missing = h.orchestrator.find_missing(15).await.unwrap();
        assert_eq!(missing, vec![3, 4, 6, 7, 8, 10, 11, 12, 13, 14]);

        let report = h.orchestrator.fill_gaps(15).await.unwrap();
        assert_eq!(report.fetched, 10);
        assert_eq!(cache.stats().await.unwrap().total_count, 15);
        // Existing rows untouched
        assert_eq!(cache.get(9).await.unwrap().unwrap(), stale(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_gaps_with_nothing_missing() {
        let h = harness(5);
        h.orchestrator.run_full(6).await.unwrap();
        let calls = h.reader.total_calls();

        let report = h.orchestrator.fill_gaps(6).await.unwrap();

        assert_eq!(report.targets, 0);
        assert_eq!(h.reader.total_calls(), calls);
        assert_eq!(h.sink.last().unwrap().status, CrawlStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_overwrites_with_latest_fetch() {
        let h = harness(10);
        let cache = h.orchestrator.cache();

        h.orchestrator.refresh(&[7]).await.unwrap();
        assert_eq!(cache.get(7).await.unwrap().unwrap().allocation_per_token, "854.70");

        h.reader
            .set_allocation(U256::from(900_000_000_000_000_000_000u128));
        let report = h.orchestrator.refresh(&[7, 7]).await.unwrap();
        assert_eq!(report.targets, 1);

        let stored = cache.get(7).await.unwrap().unwrap();
        assert_eq!(stored.allocation_per_token, "900.00");
        assert_eq!(stored.part_percentage, "0.3300");
        assert_eq!(cache.stats().await.unwrap().total_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed_forces_listed_ids() {
        let h = harness(10);
        let cache = h.orchestrator.cache();
        for id in [3, 4] {
            cache.put(id, &stale(id)).await.unwrap();
        }
        let previous = CrawlCheckpoint::new(
            4,
            CrawlStatus::Completed,
            json!({ "failedTokenIds": [4, 3] }),
        );

        let report = h
            .orchestrator
            .retry_failed(100, Some(&previous))
            .await
            .unwrap();

        assert_eq!(report.targets, 2);
        assert_eq!(report.fetched, 2);
        assert_eq!(cache.get(3).await.unwrap().unwrap().allocation_per_token, "854.70");
        assert_eq!(cache.stats().await.unwrap().total_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed_without_history_fills_gaps() {
        let h = harness(10);

        let report = h.orchestrator.retry_failed(12, None).await.unwrap();

        assert_eq!(report.fetched, 12);
        assert_eq!(h.orchestrator.cache().stats().await.unwrap().total_count, 12);
        assert_eq!(h.sink.last().unwrap().stats["job"], "fill-gaps");
    }

    #[test]
    fn test_report_rate() {
        let report = CrawlReport {
            targets: 10,
            fetched: 6,
            skipped: 3,
            failed: 1,
            elapsed: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(report.processed(), 10);
        assert!((report.rate_per_second() - 5.0).abs() < f64::EPSILON);
        assert_eq!(CrawlReport::default().rate_per_second(), 0.0);
    }
}
