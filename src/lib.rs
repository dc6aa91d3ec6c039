//! Claim Harvester
//!
//! Sweeps a claim contract's token id space over JSON-RPC and keeps a local
//! SQLite copy of every token's allocation snapshot.

pub mod cache;
pub mod chain;
pub mod config;
pub mod harvester;
