//! Chain access: claim contract reads, unit conversion, failure classification

mod client;
pub mod errors;
pub mod units;

pub use client::{ChainReadClient, ChainReader, ClaimData, IClaimContract, RawClaim};
pub use errors::{classify, FailureKind};
