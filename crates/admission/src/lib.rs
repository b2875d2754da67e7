//! Admission control for the proposer pool.
//!
//! A candidate node proves possession of CPU and memory resources by running
//! two bounded proof-of-work searches (SHA-256 and scrypt) over a seed block
//! header, then submits a campaign claim transaction carrying both nonces.
//! This crate drives that pipeline:
//!
//! - [`AdmissionControl::campaign`] launches both proof tasks concurrently,
//!   awaits them behind a barrier, and submits the claim on all-success.
//! - [`AdmissionControl::fund_for_rnode`] is the lazy, idempotent
//!   self-funding step that makes the node eligible in the first place.
//! - [`AdmissionControl::abort`] cancels an in-flight campaign
//!   deterministically.
//!
//! Contract access sits behind the [`ContractBackend`] trait; the chain tip
//! behind [`ChainReader`]. [`SimulatedBackend`] and [`InMemoryChain`] are the
//! in-memory implementations used in tests.

mod backend;
mod config;
mod control;
mod simulated;
mod work;

pub use backend::{
    AdmissionKey, AdmissionParams, BackendError, CampaignClaim, ChainReader, ContractBackend,
    PendingTx, Receipt,
};
pub use config::{AdmissionConfig, BASE_UNIT, MIN_RNODE_FUND_UNITS};
pub use control::AdmissionControl;
pub use simulated::{InMemoryChain, SimulatedBackend};
pub use work::{meets_difficulty, proof_digest, ProofKind, ProofResult};

/// Controller status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// No campaign in flight.
    #[default]
    Idle,
    /// Proof tasks are running.
    Running,
}

/// Errors surfaced by admission control.
///
/// Any of these ends the current campaign: the error is recorded on the
/// controller, no claim is submitted, and the controller returns to
/// [`Status::Idle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("the number of terms to campaign is out of range")]
    TermOutOfRange,
    #[error("not an rnode, unable to participate in campaign")]
    NotRNode,
    #[error("the period is locked, cannot invest now")]
    LockedPeriod,
    #[error("balance is not enough to become an rnode")]
    NotEnoughFunds,
    #[error("proof work did not meet its difficulty within the lifetime")]
    ProofFailed,
    #[error("no admission key configured")]
    NoKey,
    #[error("contract backend unavailable")]
    BackendUnavailable,
    #[error("contract call failed: {0}")]
    Contract(String),
}

impl From<BackendError> for AdmissionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable => AdmissionError::BackendUnavailable,
            BackendError::LockedPeriod => AdmissionError::LockedPeriod,
            BackendError::Reverted(msg) => AdmissionError::Contract(msg),
        }
    }
}
