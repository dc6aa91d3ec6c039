//! Record Fetcher
//!
//! Turns four contract reads into one normalized `ClaimRecord`, retrying
//! until it succeeds. There is no attempt limit: the harvest is a batch job
//! that must finish, so a stuck endpoint stalls the run instead of leaving
//! holes. Operators bound total run time from the outside.
//!
//! Retry delays:
//! - rate limited: `min(1s * 2^retry, 20s)`, plus a backoff signal to the scheduler
//! - anything else: `1s * min(retry + 1, 8)`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::{Result, WrapErr};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use super::scheduler::AdaptiveScheduler;
use crate::cache::ClaimRecord;
use crate::chain::{classify, ChainReader, ClaimData, FailureKind, RawClaim};

// ============================================
// CONFIGURATION
// ============================================

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Pause after each of the three structural calls
    pub call_pause: Duration,
    pub rate_limit_base_delay: Duration,
    pub rate_limit_max_delay: Duration,
    pub retry_base_delay: Duration,
    /// Cap on the linear multiplier for non-rate-limit retries
    pub retry_max_multiplier: u32,
    /// Log a warning on every Nth attempt instead of every attempt
    pub warn_every: u32,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            call_pause: Duration::from_millis(50),
            rate_limit_base_delay: Duration::from_millis(1_000),
            rate_limit_max_delay: Duration::from_millis(20_000),
            retry_base_delay: Duration::from_millis(1_000),
            retry_max_multiplier: 8,
            warn_every: 10,
        }
    }
}

impl FetcherConfig {
    /// `min(base * 2^retry_count, max)`
    pub fn rate_limit_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.rate_limit_base_delay
            .checked_mul(factor)
            .unwrap_or(self.rate_limit_max_delay)
            .min(self.rate_limit_max_delay)
    }

    /// `base * min(retry_count + 1, max_multiplier)`
    pub fn transient_delay(&self, retry_count: u32) -> Duration {
        let multiplier = retry_count
            .saturating_add(1)
            .min(self.retry_max_multiplier);
        self.retry_base_delay * multiplier
    }

    /// Failed attempt `attempt` (1-based) is logged at warn level
    pub fn should_warn(&self, attempt: u32) -> bool {
        self.warn_every > 0 && attempt % self.warn_every == 0
    }

    pub fn retry_delay(&self, kind: FailureKind, retry_count: u32) -> Duration {
        match kind {
            FailureKind::RateLimited => self.rate_limit_delay(retry_count),
            FailureKind::Transient => self.transient_delay(retry_count),
        }
    }
}

/// Running counters across every fetch made by one fetcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetcherMetrics {
    pub fetched: u64,
    pub retries: u64,
    pub rate_limited: u64,
    pub claim_data_defaulted: u64,
}

// ============================================
// FETCHER
// ============================================

pub struct RecordFetcher {
    reader: Arc<dyn ChainReader>,
    scheduler: AdaptiveScheduler,
    config: FetcherConfig,
    fetched: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    claim_data_defaulted: AtomicU64,
}

impl RecordFetcher {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        scheduler: AdaptiveScheduler,
        config: FetcherConfig,
    ) -> Self {
        Self {
            reader,
            scheduler,
            config,
            fetched: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            claim_data_defaulted: AtomicU64::new(0),
        }
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> FetcherMetrics {
        FetcherMetrics {
            fetched: self.fetched.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            claim_data_defaulted: self.claim_data_defaulted.load(Ordering::Relaxed),
        }
    }

    /// Fetch one token's record, retrying for as long as it takes
    pub async fn fetch(&self, token_id: u64) -> ClaimRecord {
        let mut retry_count: u32 = 0;

        loop {
            match self.attempt(token_id).await {
                Ok(record) => {
                    self.fetched.fetch_add(1, Ordering::Relaxed);
                    if retry_count > 0 {
                        debug!("Token {} fetched after {} retries", token_id, retry_count);
                    }
                    return record;
                }
                Err(e) => {
                    let kind = classify(&e);
                    if kind == FailureKind::RateLimited {
                        self.rate_limited.fetch_add(1, Ordering::Relaxed);
                        self.scheduler.report_rate_limit();
                    }

                    let delay = self.config.retry_delay(kind, retry_count);
                    let attempt = retry_count.saturating_add(1);

                    if self.config.should_warn(attempt) {
                        warn!(
                            "⚠️  Token {}: attempt {} failed ({}), retrying in {:?}: {:#}",
                            token_id, attempt, kind, delay, e
                        );
                    } else {
                        debug!(
                            "Token {}: attempt {} failed ({}), retrying in {:?}: {:#}",
                            token_id, attempt, kind, delay, e
                        );
                    }

                    self.retries.fetch_add(1, Ordering::Relaxed);
                    sleep(delay).await;
                    retry_count = attempt;
                }
            }
        }
    }

    /// One pass over the four calls
    async fn attempt(&self, token_id: u64) -> Result<ClaimRecord> {
        let reader = &self.reader;

        let allocation_per_token = self
            .scheduler
            .submit(reader.allocation_per_token())
            .await
            .wrap_err("allocationPerToken() failed")?;
        sleep(self.config.call_pause).await;

        let init_unlock = self
            .scheduler
            .submit(reader.init_unlock())
            .await
            .wrap_err("init_unlock() failed")?;
        sleep(self.config.call_pause).await;

        let part_percentage = self
            .scheduler
            .submit(reader.part_percentage())
            .await
            .wrap_err("partPercentage() failed")?;
        sleep(self.config.call_pause).await;

        // Known accuracy caveat: a failing claimData reads as zero/zero for
        // this attempt and does not trigger a retry
        let claim = match self.scheduler.submit(reader.claim_data(token_id)).await {
            Ok(claim) => claim,
            Err(e) => {
                self.claim_data_defaulted.fetch_add(1, Ordering::Relaxed);
                debug!("claimData({}) failed, using zero: {:#}", token_id, e);
                ClaimData::default()
            }
        };

        let raw = RawClaim {
            allocation_per_token,
            init_unlock,
            part_percentage,
            claim,
        };
        trace!("Token {} raw values: {:?}", token_id, raw);

        Ok(ClaimRecord::from_raw(
            token_id,
            &raw,
            Utc::now().timestamp_millis(),
        ))
    }
}
