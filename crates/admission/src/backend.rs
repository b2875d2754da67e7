//! Capability interfaces to the contract backend and the local chain.

use std::time::Duration;

use async_trait::async_trait;
use dpor_types::{Address, Hash, Header};

/// Errors reported by a contract backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable")]
    Unavailable,
    #[error("the period is locked")]
    LockedPeriod,
    #[error("contract call reverted: {0}")]
    Reverted(String),
}

/// Signing handle for admission transactions.
///
/// Key custody is external; the backend only needs the account to transact
/// as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionKey {
    pub address: Address,
}

/// A submitted, not yet mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: Hash,
}

/// A mined transaction receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: Hash,
    /// 1 on success, 0 on revert.
    pub status: u64,
}

/// Difficulty and lifetime parameters read from the admission contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionParams {
    pub cpu_difficulty: u64,
    pub mem_difficulty: u64,
    pub cpu_lifetime: Duration,
    pub mem_lifetime: Duration,
}

/// The proof payload submitted to the campaign contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignClaim {
    pub terms: u64,
    pub cpu_nonce: u64,
    pub cpu_block_number: u64,
    pub mem_nonce: u64,
    pub mem_block_number: u64,
    pub version: u64,
}

/// Contract-side capabilities consumed by admission control.
///
/// Implementations include the real chain client and
/// [`SimulatedBackend`](crate::SimulatedBackend) for tests.
#[async_trait]
pub trait ContractBackend: Send + Sync {
    /// Current balance of an account.
    async fn balance_at(&self, addr: Address) -> Result<u128, BackendError>;

    /// Receipt for a transaction, or `None` while it is unmined.
    async fn transaction_receipt(&self, tx: Hash) -> Result<Option<Receipt>, BackendError>;

    /// Whether the account has deposited the rnode bond.
    async fn is_rnode(&self, addr: Address) -> Result<bool, BackendError>;

    /// Submit the join transaction carrying the bond deposit.
    async fn join_rnode(&self, key: &AdmissionKey, value: u128) -> Result<PendingTx, BackendError>;

    /// Read difficulty and lifetime parameters from the admission contract.
    async fn admission_parameters(&self) -> Result<AdmissionParams, BackendError>;

    /// Submit the campaign claim.
    async fn claim_campaign(
        &self,
        key: &AdmissionKey,
        claim: &CampaignClaim,
    ) -> Result<PendingTx, BackendError>;

    /// Whether this backend can carry real transactions.
    ///
    /// Simulated backends report `false`, and claims are withheld from
    /// them.
    fn supports_transactions(&self) -> bool;
}

/// Read access to the local chain tip, used to pick the proof seed header.
pub trait ChainReader: Send + Sync {
    /// The header at the current tip.
    fn current_header(&self) -> Header;

    /// The header at a given height, if the chain has reached it.
    fn header_by_number(&self, number: u64) -> Option<Header>;
}
