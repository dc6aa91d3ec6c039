//! Cached claim rows and aggregate statistics

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::units::{format_amount, format_fraction};
use crate::chain::RawClaim;

/// One token's allocation snapshot, as stored in the cache.
///
/// Amounts carry 2 decimal places, fractions carry 4. All fields are written
/// together by a single upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub token_id: String,
    pub allocation_per_token: String,
    pub consumed: String,
    pub claimed: String,
    pub part_percentage: String,
    pub init_unlock: String,
    /// Write time, epoch milliseconds
    pub updated_at: i64,
}

impl ClaimRecord {
    /// Normalize raw contract values into a record
    pub fn from_raw(token_id: u64, raw: &RawClaim, updated_at: i64) -> Self {
        Self {
            token_id: token_id.to_string(),
            allocation_per_token: format_amount(raw.allocation_per_token),
            consumed: format_amount(raw.claim.consumed),
            claimed: format_amount(raw.claim.claimed),
            part_percentage: format_fraction(raw.part_percentage),
            init_unlock: format_fraction(raw.init_unlock),
            updated_at,
        }
    }

    /// Compare the five data fields, ignoring the write timestamp
    pub fn same_values(&self, other: &ClaimRecord) -> bool {
        self.token_id == other.token_id
            && self.allocation_per_token == other.allocation_per_token
            && self.consumed == other.consumed
            && self.claimed == other.claimed
            && self.part_percentage == other.part_percentage
            && self.init_unlock == other.init_unlock
    }

    pub fn numeric_token_id(&self) -> Option<u64> {
        self.token_id.parse().ok()
    }
}

/// A cache row read back without assuming it is well formed.
///
/// Rows written by this crate are always complete, but the table is shared
/// with other tooling, so the repair pass reads every column as nullable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannedRecord {
    pub token_id: String,
    pub allocation_per_token: Option<String>,
    pub consumed: Option<String>,
    pub claimed: Option<String>,
    pub part_percentage: Option<String>,
    pub init_unlock: Option<String>,
    pub updated_at: Option<i64>,
}

impl ScannedRecord {
    pub fn numeric_token_id(&self) -> Option<u64> {
        self.token_id.trim().parse().ok()
    }

    pub fn into_record(self) -> ClaimRecord {
        ClaimRecord {
            token_id: self.token_id,
            allocation_per_token: self.allocation_per_token.unwrap_or_default(),
            consumed: self.consumed.unwrap_or_default(),
            claimed: self.claimed.unwrap_or_default(),
            part_percentage: self.part_percentage.unwrap_or_default(),
            init_unlock: self.init_unlock.unwrap_or_default(),
            updated_at: self.updated_at.unwrap_or_default(),
        }
    }
}

impl From<ClaimRecord> for ScannedRecord {
    fn from(record: ClaimRecord) -> Self {
        Self {
            token_id: record.token_id,
            allocation_per_token: Some(record.allocation_per_token),
            consumed: Some(record.consumed),
            claimed: Some(record.claimed),
            part_percentage: Some(record.part_percentage),
            init_unlock: Some(record.init_unlock),
            updated_at: Some(record.updated_at),
        }
    }
}

/// Aggregate view of the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_count: u64,
    pub min_token_id: Option<u64>,
    pub max_token_id: Option<u64>,
    /// Most recent write, epoch milliseconds
    pub last_updated: Option<i64>,
}

impl CacheStats {
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Fraction of `1..=max_token_id` present in the cache
    pub fn coverage(&self, max_token_id: u64) -> f64 {
        if max_token_id == 0 {
            return 0.0;
        }
        self.total_count as f64 / max_token_id as f64
    }
}
