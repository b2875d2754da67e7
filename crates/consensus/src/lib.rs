//! PBFT-style validator state machine for DPoR block agreement.
//!
//! This crate implements the per-validator finite state machine that drives
//! three-phase agreement (pre-prepare, prepare, commit) plus the impeachment
//! fallback, as a synchronous model:
//!
//! ```text
//! (Input, MsgCode) → ValidatorFsm::handle() → Outcome
//! ```
//!
//! The FSM performs no network or storage I/O. The consensus driver feeds it
//! typed inputs and executes the returned [`FsmAction`] (broadcast the output,
//! insert the block, or both). External chain capabilities — block
//! validation, seal recovery, committee lookup, header signing — sit behind
//! the [`ChainService`] trait; [`SimulatedChain`] is the in-memory
//! implementation used in tests.
//!
//! # Safety
//!
//! - A phase certificate holds only when 2f+1 committee members have sealed
//!   the same block hash at that phase for the current height.
//! - Signature state is reset whenever a strictly greater height is
//!   observed, so stale seals can never count toward a certificate.
//!
//! # Liveness
//!
//! - A commit certificate is honored in any state, including `Idle`, so a
//!   validator that missed earlier phases still emits the validate message.
//! - Impeachment runs the same three phases over a substitute block when the
//!   designated proposer fails.

mod fsm;
mod service;
mod simulator;

pub use fsm::{FsmConfig, Outcome, ValidatorFsm, BLOCK_CACHE_SIZE};
pub use service::{ChainError, ChainService};
pub use simulator::SimulatedChain;

use dpor_types::{Block, Header};

/// The five protocol states of a validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    Preprepared,
    Prepared,
    ImpeachPreprepared,
    ImpeachPrepared,
}

/// Protocol message codes.
///
/// `Validate` is the phase-complete broadcast telling peers "insert this
/// block now"; the four impeach variants mirror the normal phases over the
/// substitute block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgCode {
    NoMsg,
    PrePrepare,
    Prepare,
    Commit,
    Validate,
    ImpeachPrePrepare,
    ImpeachPrepare,
    ImpeachCommit,
    ImpeachValidate,
}

/// What the driver should do with an outcome's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmAction {
    /// Nothing to do.
    None,
    /// Broadcast the output to the validator mesh.
    Broadcast,
    /// Insert the output block into the local chain.
    Insert,
    /// Broadcast the output and insert it locally.
    BroadcastAndInsert,
}

/// Typed input to the state machine.
#[derive(Debug, Clone)]
pub enum Input {
    /// A phase message carrying a header with seal slots.
    Header(Header),
    /// A proposed block.
    Block(Block),
    /// A proposed impeachment block.
    ImpeachBlock(Block),
}

impl Input {
    fn header(&self) -> Result<&Header, FsmError> {
        match self {
            Input::Header(h) => Ok(h),
            _ => Err(FsmError::WrongDataType),
        }
    }

    fn into_block(self) -> Result<Block, FsmError> {
        match self {
            Input::Block(b) | Input::ImpeachBlock(b) => Ok(b),
            Input::Header(_) => Err(FsmError::WrongDataType),
        }
    }
}

/// Typed output of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    None,
    Header(Header),
    Block(Block),
}

impl Output {
    /// The output block, if this output carries one.
    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Output::Block(b) => Some(b),
            _ => None,
        }
    }

    /// The output header, if this output carries one.
    pub fn as_header(&self) -> Option<&Header> {
        match self {
            Output::Header(h) => Some(h),
            _ => None,
        }
    }
}

/// Errors surfaced by the state machine.
///
/// None of these crash the FSM: the controlling state is preserved (no
/// spurious transition), the error is logged, and the caller receives it in
/// the [`Outcome`]. The one exception is [`FsmError::FaultyBlock`], which
/// accompanies the impeachment transition the table prescribes for a
/// rejected proposal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsmError {
    #[error("an unexpected input data type for this message code")]
    WrongDataType,
    #[error("not a proper input for {0:?} state")]
    WrongInput(State),
    #[error("the block is too old")]
    BlockTooOld,
    #[error("the block does not exist in the cache")]
    BlockNotFound,
    #[error("the newly proposed block is faulty")]
    FaultyBlock,
    #[error("failed to recover seal signers")]
    SignatureRecovery,
    #[error("a signer is not in the validator committee")]
    InvalidSigners,
    #[error(transparent)]
    Service(#[from] ChainError),
}
