//! Scripted in-memory `ChainReader` shared by the harvester tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use eyre::{eyre, Result};
use tokio::time::Instant;

use crate::chain::{ChainReader, ClaimData};

pub(crate) const ALLOCATION_854_70: u128 = 854_700_000_000_000_000_000;
pub(crate) const INIT_UNLOCK_0_1: u128 = 100_000_000_000_000_000;
pub(crate) const PART_0_33: u128 = 330_000_000_000_000_000;

pub(crate) struct MockReader {
    allocation: Mutex<U256>,
    init_unlock: U256,
    part_percentage: U256,
    /// Next N structural calls fail with `failure_message`
    failures_remaining: AtomicU32,
    failure_message: Mutex<String>,
    claim_fail_ids: Mutex<HashSet<u64>>,
    claims: Mutex<HashMap<u64, ClaimData>>,
    latency: Duration,
    /// Method name and start time of every call, in call order
    calls: Mutex<Vec<(&'static str, Instant)>>,
    pub structural_calls: AtomicUsize,
    pub claim_calls: AtomicUsize,
}

impl MockReader {
    pub fn new() -> Self {
        Self {
            allocation: Mutex::new(U256::from(ALLOCATION_854_70)),
            init_unlock: U256::from(INIT_UNLOCK_0_1),
            part_percentage: U256::from(PART_0_33),
            failures_remaining: AtomicU32::new(0),
            failure_message: Mutex::new(String::new()),
            claim_fail_ids: Mutex::new(HashSet::new()),
            claims: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            structural_calls: AtomicUsize::new(0),
            claim_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `count` structural calls with `message`
    pub fn fail_next(&self, count: u32, message: &str) {
        *self.failure_message.lock().unwrap() = message.to_string();
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn fail_claim_data_for(&self, token_id: u64) {
        self.claim_fail_ids.lock().unwrap().insert(token_id);
    }

    pub fn set_claim(&self, token_id: u64, claim: ClaimData) {
        self.claims.lock().unwrap().insert(token_id, claim);
    }

    pub fn set_allocation(&self, value: U256) {
        *self.allocation.lock().unwrap() = value;
    }

    pub fn total_calls(&self) -> usize {
        self.structural_calls.load(Ordering::SeqCst) + self.claim_calls.load(Ordering::SeqCst)
    }

    pub fn call_log(&self) -> Vec<(&'static str, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    fn record_call(&self, name: &'static str) {
        self.calls.lock().unwrap().push((name, Instant::now()));
    }

    async fn structural(&self, name: &'static str, value: U256) -> Result<U256> {
        self.record_call(name);
        self.structural_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            let message = self.failure_message.lock().unwrap().clone();
            return Err(eyre!(message));
        }
        Ok(value)
    }
}

#[async_trait]
impl ChainReader for MockReader {
    async fn allocation_per_token(&self) -> Result<U256> {
        let value = *self.allocation.lock().unwrap();
        self.structural("allocationPerToken", value).await
    }

    async fn init_unlock(&self) -> Result<U256> {
        self.structural("init_unlock", self.init_unlock).await
    }

    async fn part_percentage(&self) -> Result<U256> {
        self.structural("partPercentage", self.part_percentage).await
    }

    async fn claim_data(&self, token_id: u64) -> Result<ClaimData> {
        self.record_call("claimData");
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if self.claim_fail_ids.lock().unwrap().contains(&token_id) {
            return Err(eyre!("execution reverted"));
        }
        let claims = self.claims.lock().unwrap();
        Ok(claims.get(&token_id).copied().unwrap_or_default())
    }
}
