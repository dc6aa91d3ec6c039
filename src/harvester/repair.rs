//! Validation & Repair
//!
//! Re-reads the whole cache, flags rows that are incomplete or out of range,
//! works out which ids in `1..=max` were never written, and re-fetches the
//! union of both.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use eyre::Result;
use serde_json::json;
use tracing::{info, warn};

use super::orchestrator::CrawlOrchestrator;
use crate::cache::ScannedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    MissingField(&'static str),
    Unparseable(&'static str),
    NonPositiveAllocation,
    OutOfRange(&'static str),
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::MissingField(field) => write!(f, "{} missing", field),
            InvalidReason::Unparseable(field) => write!(f, "{} not numeric", field),
            InvalidReason::NonPositiveAllocation => write!(f, "allocationPerToken <= 0"),
            InvalidReason::OutOfRange(field) => write!(f, "{} outside [0, 1]", field),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordValidity {
    Valid,
    Invalid(InvalidReason),
}

impl RecordValidity {
    pub fn is_valid(&self) -> bool {
        matches!(self, RecordValidity::Valid)
    }
}

fn parse_field(name: &'static str, value: Option<&str>) -> Result<f64, InvalidReason> {
    let raw = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(InvalidReason::MissingField(name))?;
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or(InvalidReason::Unparseable(name))
}

/// Check the five data fields of a cached row
pub fn classify(record: &ScannedRecord) -> RecordValidity {
    match check(record) {
        Ok(()) => RecordValidity::Valid,
        Err(reason) => RecordValidity::Invalid(reason),
    }
}

fn check(record: &ScannedRecord) -> Result<(), InvalidReason> {
    let allocation = parse_field("allocationPerToken", record.allocation_per_token.as_deref())?;
    parse_field("consumed", record.consumed.as_deref())?;
    parse_field("claimed", record.claimed.as_deref())?;
    let part = parse_field("partPercentage", record.part_percentage.as_deref())?;
    let unlock = parse_field("initUnlock", record.init_unlock.as_deref())?;

    if allocation <= 0.0 {
        return Err(InvalidReason::NonPositiveAllocation);
    }
    if !(0.0..=1.0).contains(&part) {
        return Err(InvalidReason::OutOfRange("partPercentage"));
    }
    if !(0.0..=1.0).contains(&unlock) {
        return Err(InvalidReason::OutOfRange("initUnlock"));
    }
    Ok(())
}

// ============================================
// REPORTS
// ============================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: u64,
    pub valid: u64,
    pub invalid_ids: Vec<u64>,
    pub missing_ids: Vec<u64>,
    /// Rows whose key is not a decimal id; counted invalid, never refetched
    pub unkeyed: u64,
}

impl ScanReport {
    pub fn invalid(&self) -> u64 {
        self.invalid_ids.len() as u64 + self.unkeyed
    }

    /// `invalid ∪ missing`, ascending
    pub fn repair_targets(&self) -> Vec<u64> {
        self.invalid_ids
            .iter()
            .chain(self.missing_ids.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub scan: ScanReport,
    pub repaired: u64,
    pub failed: u64,
    pub failed_token_ids: Vec<u64>,
}

// ============================================
// REPAIR JOB
// ============================================

pub struct ValidationRepair {
    orchestrator: Arc<CrawlOrchestrator>,
}

impl ValidationRepair {
    pub fn new(orchestrator: Arc<CrawlOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Classify every cached row and list the ids absent from `1..=max_token_id`
    pub async fn scan(&self, max_token_id: u64) -> Result<ScanReport> {
        let rows = self.orchestrator.cache().scan_all().await?;
        let mut report = ScanReport {
            scanned: rows.len() as u64,
            ..Default::default()
        };
        let mut present = BTreeSet::new();

        for row in &rows {
            let validity = classify(row);
            match row.numeric_token_id() {
                Some(id) => {
                    present.insert(id);
                    match validity {
                        RecordValidity::Valid => report.valid += 1,
                        RecordValidity::Invalid(reason) => {
                            warn!("🩹 Token {} invalid: {}", id, reason);
                            report.invalid_ids.push(id);
                        }
                    }
                }
                None => {
                    warn!("🩹 Row with non-numeric key {:?} skipped", row.token_id);
                    report.unkeyed += 1;
                }
            }
        }

        report.invalid_ids.sort_unstable();
        report.missing_ids = (1..=max_token_id)
            .filter(|id| !present.contains(id))
            .collect();

        info!(
            "🔎 Scanned {} rows: {} valid, {} invalid, {} missing in 1..={}",
            report.scanned,
            report.valid,
            report.invalid(),
            report.missing_ids.len(),
            max_token_id
        );
        Ok(report)
    }

    /// Scan, then re-fetch and overwrite every invalid or missing id
    pub async fn run(&self, max_token_id: u64) -> Result<RepairReport> {
        match self.repair(max_token_id).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.orchestrator.record_error("repair", &e).await;
                Err(e)
            }
        }
    }

    async fn repair(&self, max_token_id: u64) -> Result<RepairReport> {
        let scan = self.scan(max_token_id).await?;
        let targets = scan.repair_targets();

        if targets.is_empty() {
            info!("✅ Cache is complete and valid");
        } else {
            info!("🔧 Repairing {} tokens", targets.len());
        }

        let crawl = self
            .orchestrator
            .run_batches("repair", &targets, true)
            .await?;

        let report = RepairReport {
            repaired: crawl.fetched,
            failed: crawl.failed,
            failed_token_ids: crawl.failed_token_ids,
            scan,
        };

        self.orchestrator
            .write_completed(json!({
                "job": "repair",
                "scanned": report.scan.scanned,
                "valid": report.scan.valid,
                "invalid": report.scan.invalid(),
                "missing": report.scan.missing_ids.len(),
                "repaired": report.repaired,
                "failed": report.failed,
                "failedTokenIds": report.failed_token_ids,
            }))
            .await?;

        info!(
            "🏁 Repair complete: {} repaired, {} failed",
            report.repaired, report.failed
        );
        Ok(report)
    }
}
