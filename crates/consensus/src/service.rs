//! Capability interface to the external chain.
//!
//! The FSM treats the chain as a set of short-lived in-memory lookups; long
//! operations (network fetches, disk reads) belong in the driver, not here,
//! because the FSM may hold its data lock across these calls.

use dpor_types::{Address, Block, Hash, Header, Phase, Signature};

/// Errors reported by a chain service implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("block rejected by chain validation")]
    InvalidBlock,
    #[error("seal recovery failed")]
    SealRecovery,
    #[error("local validator is not in the committee for height {0}")]
    NotInCommittee(u64),
    #[error("no impeach block available")]
    NoImpeachBlock,
}

/// External chain capabilities consumed by the validator FSM.
///
/// Implementations include the real chain client and [`SimulatedChain`]
/// for tests.
///
/// [`SimulatedChain`]: crate::SimulatedChain
pub trait ChainService: Send + Sync {
    /// Validate a newly proposed block against chain rules.
    fn validate_block(&self, block: &Block) -> Result<(), ChainError>;

    /// Recover the (signer, seal) pairs from a header's filled seal slots
    /// for the given phase.
    fn ecrecover_seals(
        &self,
        header: &Header,
        phase: Phase,
    ) -> Result<Vec<(Address, Signature)>, ChainError>;

    /// The authoritative validator committee for a height.
    fn validators_of(&self, height: u64) -> Vec<Address>;

    /// Fill the local validator's seal slot in the header for the given
    /// phase.
    fn sign_header(&self, header: &mut Header, phase: Phase) -> Result<(), ChainError>;

    /// Forward a prepare-phase seal to the chain's prepare seal cache.
    fn update_prepare_sig_cache(&self, signer: Address, hash: Hash, sig: Signature);

    /// Forward a commit-phase seal to the chain's final seal cache.
    fn update_final_sig_cache(&self, signer: Address, hash: Hash, sig: Signature);

    /// Construct the substitute block used to impeach a failed proposer.
    fn create_impeach_block(&self) -> Result<Block, ChainError>;
}
