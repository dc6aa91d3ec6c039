//! Adaptive Request Scheduler
//!
//! Gates every outbound RPC call behind three conditions:
//! - fewer than `max_concurrent` calls in flight
//! - at least `min_spacing` since the previous call started
//! - no active rate-limit backoff window
//!
//! Waiters are served strictly in arrival order. A rate-limit report opens a
//! backoff window (2s, 4s, 8s ... capped at 30s) and cuts the concurrency
//! bound by 3 (floor 5). Each report schedules its own recovery 10s later,
//! which undoes one step of the counter and gives back one slot (cap 15).

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

// ============================================
// CONFIGURATION
// ============================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Starting (and maximum) number of concurrent calls
    pub max_concurrent: usize,
    /// Lowest the bound can be pushed by backoff
    pub min_concurrent: usize,
    /// Minimum gap between two call starts
    pub min_spacing: Duration,
    /// Slots removed per rate-limit report
    pub concurrency_step_down: usize,
    /// First backoff window
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Delay before a report is partially undone
    pub recovery_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 15,
            min_concurrent: 5,
            min_spacing: Duration::from_millis(50),
            concurrency_step_down: 3,
            base_backoff: Duration::from_millis(2_000),
            max_backoff: Duration::from_millis(30_000),
            recovery_window: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    /// Backoff window for the `consecutive`-th unrecovered rate limit:
    /// `min(base * 2^(consecutive - 1), max)`
    pub fn backoff_delay(&self, consecutive: u32) -> Duration {
        if consecutive == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(consecutive - 1).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Bound after a rate-limit report
    pub fn tightened(&self, current: usize) -> usize {
        current
            .saturating_sub(self.concurrency_step_down)
            .max(self.min_concurrent)
    }

    /// Bound after a recovery tick
    pub fn relaxed(&self, current: usize) -> usize {
        (current + 1).min(self.max_concurrent)
    }
}

// ============================================
// STATE
// ============================================

#[derive(Debug)]
struct SchedulerState {
    in_flight: usize,
    max_concurrent: usize,
    consecutive_rate_limits: u32,
    last_start: Option<Instant>,
    backoff_until: Option<Instant>,
}

/// Point-in-time view of the scheduler, safe to log or checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub in_flight: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub consecutive_rate_limits: u32,
    pub backing_off: bool,
    pub started_total: u64,
    pub rate_limit_total: u64,
}

struct Inner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    /// Held by the head of the queue while it waits; tokio's mutex is FIFO
    gate: tokio::sync::Mutex<()>,
    slot_freed: Notify,
    queued: AtomicUsize,
    started_total: AtomicU64,
    rate_limit_total: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recover(&self) {
        let (consecutive, bound) = {
            let mut st = self.state();
            st.consecutive_rate_limits = st.consecutive_rate_limits.saturating_sub(1);
            st.max_concurrent = self.config.relaxed(st.max_concurrent);
            (st.consecutive_rate_limits, st.max_concurrent)
        };
        debug!(
            "Scheduler recovery: consecutive rate limits {}, concurrency {}",
            consecutive, bound
        );
        self.slot_freed.notify_waiters();
    }
}

enum Admission {
    Start,
    Wait(Duration),
    Full,
}

// ============================================
// SCHEDULER
// ============================================

/// Shared handle; clones drive the same queue
#[derive(Clone)]
pub struct AdaptiveScheduler {
    inner: Arc<Inner>,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let config = SchedulerConfig {
            max_concurrent,
            min_concurrent: config.min_concurrent.clamp(1, max_concurrent),
            ..config
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState {
                    in_flight: 0,
                    max_concurrent,
                    consecutive_rate_limits: 0,
                    last_start: None,
                    backoff_until: None,
                }),
                config,
                gate: tokio::sync::Mutex::new(()),
                slot_freed: Notify::new(),
                queued: AtomicUsize::new(0),
                started_total: AtomicU64::new(0),
                rate_limit_total: AtomicU64::new(0),
            }),
        }
    }

    /// Run `task` once it is admitted and hand back its output untouched
    pub async fn submit<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire().await;
        task.await
    }

    async fn acquire(&self) -> SlotGuard {
        let _ticket = QueueTicket::new(&self.inner.queued);
        let _gate = self.inner.gate.lock().await;

        loop {
            // Register before checking so a release between the check and
            // the await is not lost
            let notified = self.inner.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_admit() {
                Admission::Start => break,
                Admission::Wait(delay) => sleep(delay).await,
                Admission::Full => notified.await,
            }
        }

        self.inner.started_total.fetch_add(1, Ordering::Relaxed);
        SlotGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    fn try_admit(&self) -> Admission {
        let mut st = self.inner.state();
        let now = Instant::now();

        if let Some(until) = st.backoff_until {
            if now < until {
                return Admission::Wait(until - now);
            }
            st.backoff_until = None;
        }

        if st.in_flight >= st.max_concurrent {
            return Admission::Full;
        }

        if let Some(last) = st.last_start {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.inner.config.min_spacing {
                return Admission::Wait(self.inner.config.min_spacing - elapsed);
            }
        }

        st.in_flight += 1;
        st.last_start = Some(now);
        Admission::Start
    }

    /// Record a rate-limit signal. Returns the backoff window imposed.
    pub fn report_rate_limit(&self) -> Duration {
        let (delay, bound, consecutive) = {
            let mut st = self.inner.state();
            st.consecutive_rate_limits = st.consecutive_rate_limits.saturating_add(1);
            let delay = self.inner.config.backoff_delay(st.consecutive_rate_limits);

            let until = Instant::now() + delay;
            st.backoff_until = Some(match st.backoff_until {
                Some(existing) if existing > until => existing,
                _ => until,
            });
            st.max_concurrent = self.inner.config.tightened(st.max_concurrent);
            (delay, st.max_concurrent, st.consecutive_rate_limits)
        };
        self.inner.rate_limit_total.fetch_add(1, Ordering::Relaxed);

        warn!(
            "🚦 Rate limited ({} in a row): backing off {:?}, concurrency → {}",
            consecutive, delay, bound
        );

        let inner = Arc::clone(&self.inner);
        let window = self.inner.config.recovery_window;
        tokio::spawn(async move {
            sleep(window).await;
            inner.recover();
        });

        delay
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let st = self.inner.state();
        SchedulerSnapshot {
            in_flight: st.in_flight,
            queued: self.inner.queued.load(Ordering::Relaxed),
            max_concurrent: st.max_concurrent,
            consecutive_rate_limits: st.consecutive_rate_limits,
            backing_off: st
                .backoff_until
                .map(|until| until > Instant::now())
                .unwrap_or(false),
            started_total: self.inner.started_total.load(Ordering::Relaxed),
            rate_limit_total: self.inner.rate_limit_total.load(Ordering::Relaxed),
        }
    }

    /// One-line summary for logs
    pub fn log_state(&self) {
        let snap = self.snapshot();
        info!(
            "⚙️  Scheduler: {}/{} in flight, {} queued, {} rate limits ({} unrecovered)",
            snap.in_flight,
            snap.max_concurrent,
            snap.queued,
            snap.rate_limit_total,
            snap.consecutive_rate_limits
        );
    }
}

/// Releases an in-flight slot when the task finishes or is dropped
struct SlotGuard {
    inner: Arc<Inner>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut st = self.inner.state();
            st.in_flight = st.in_flight.saturating_sub(1);
        }
        self.inner.slot_freed.notify_waiters();
    }
}

struct QueueTicket<'a> {
    queued: &'a AtomicUsize,
}

impl<'a> QueueTicket<'a> {
    fn new(queued: &'a AtomicUsize) -> Self {
        queued.fetch_add(1, Ordering::Relaxed);
        Self { queued }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }
}
