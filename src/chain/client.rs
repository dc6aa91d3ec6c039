//! Claim Contract Reader
//!
//! Thin wrapper around the four view functions of the claim contract.
//! Every method is a single `eth_call`: no retry, no caching. Retries and
//! pacing live one layer up in the harvester.

use alloy_primitives::{Address, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types::TransactionRequest;
use alloy_sol_types::{sol, SolCall};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, trace};

// ============================================
// CLAIM CONTRACT INTERFACE
// ============================================

sol! {
    /// Per-token reward allocation contract (read-only surface)
    interface IClaimContract {
        function allocationPerToken() external view returns (uint256);
        function init_unlock() external view returns (uint256);
        function partPercentage() external view returns (uint256);
        function claimData(uint256 tokenId) external view returns (uint256 consumed, uint256 claimed);
    }
}

// ============================================
// TYPES
// ============================================

/// Consumed/claimed pair returned by `claimData`, in 18-decimal base units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimData {
    pub consumed: U256,
    pub claimed: U256,
}

/// All four values for one token, still in base units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawClaim {
    pub allocation_per_token: U256,
    pub init_unlock: U256,
    pub part_percentage: U256,
    pub claim: ClaimData,
}

// ============================================
// READER TRAIT
// ============================================

/// Read access to the claim contract.
///
/// The three zero-argument calls are contract-wide constants; `claim_data`
/// is the only per-token call.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn allocation_per_token(&self) -> Result<U256>;

    async fn init_unlock(&self) -> Result<U256>;

    async fn part_percentage(&self) -> Result<U256>;

    async fn claim_data(&self, token_id: u64) -> Result<ClaimData>;

    /// Read all four values back to back.
    ///
    /// A failing `claimData` is reported as zero/zero; any structural call
    /// failure fails the whole read.
    async fn read_snapshot(&self, token_id: u64) -> Result<RawClaim> {
        let allocation_per_token = self.allocation_per_token().await?;
        let init_unlock = self.init_unlock().await?;
        let part_percentage = self.part_percentage().await?;
        let claim = match self.claim_data(token_id).await {
            Ok(claim) => claim,
            Err(e) => {
                debug!("claimData({}) unavailable, defaulting to zero: {:#}", token_id, e);
                ClaimData::default()
            }
        };

        Ok(RawClaim {
            allocation_per_token,
            init_unlock,
            part_percentage,
            claim,
        })
    }
}

// ============================================
// JSON-RPC CLIENT
// ============================================

/// `ChainReader` backed by a JSON-RPC HTTP endpoint
pub struct ChainReadClient {
    contract: Address,
    provider: DynProvider,
}

impl ChainReadClient {
    pub fn new(rpc_url: &str, contract: Address) -> Result<Self> {
        let url = rpc_url
            .parse()
            .map_err(|e| eyre!("Invalid RPC URL {}: {}", rpc_url, e))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();

        Ok(Self { contract, provider })
    }

    /// Execute an `eth_call` against the claim contract
    async fn call_contract<C: SolCall>(&self, call: C) -> Result<C::Return> {
        let tx = TransactionRequest::default()
            .to(self.contract)
            .input(call.abi_encode().into());

        let output = self
            .provider
            .call(tx)
            .await
            .wrap_err_with(|| format!("eth_call {} failed", C::SIGNATURE))?;

        trace!("{} returned {} bytes", C::SIGNATURE, output.len());

        C::abi_decode_returns(&output)
            .map_err(|e| eyre!("Failed to decode {} result: {}", C::SIGNATURE, e))
    }
}

#[async_trait]
impl ChainReader for ChainReadClient {
    async fn allocation_per_token(&self) -> Result<U256> {
        self.call_contract(IClaimContract::allocationPerTokenCall {}).await
    }

    async fn init_unlock(&self) -> Result<U256> {
        self.call_contract(IClaimContract::init_unlockCall {}).await
    }

    async fn part_percentage(&self) -> Result<U256> {
        self.call_contract(IClaimContract::partPercentageCall {}).await
    }

    async fn claim_data(&self, token_id: u64) -> Result<ClaimData> {
        let ret = self
            .call_contract(IClaimContract::claimDataCall {
                tokenId: U256::from(token_id),
            })
            .await?;

        Ok(ClaimData {
            consumed: ret.consumed,
            claimed: ret.claimed,
        })
    }
}
