//! Durable claim cache (SQLite)

mod models;
mod store;

pub use models::{CacheStats, ClaimRecord, ScannedRecord};
pub use store::{ClaimCache, MAX_LOOKUP_CHUNK};
