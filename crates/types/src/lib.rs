//! Core types for the DPoR consensus subsystem.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: `Hash`, `Address`, `Signature`
//! - **Consensus types**: `Block`, `Header`, `CommitteeExtra`
//! - **Reputation**: `RptEntry`
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod address;
mod block;
mod hash;
mod rpt;
mod signature;

pub use address::{Address, ADDRESS_BYTES};
pub use block::{Block, CommitteeExtra, Header};
pub use hash::{Hash, HASH_BYTES};
pub use rpt::RptEntry;
pub use signature::{Signature, SEAL_BYTES};

/// Signing phase of the three-phase agreement protocol.
///
/// A validator seals a header once when it first accepts the proposal
/// (prepare) and again when it has seen a prepare certificate (commit).
/// The chain service uses the phase to pick the signing domain and the
/// seal cache to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prepare,
    Commit,
}

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// A test address with every byte set to `seed`.
    pub fn test_address(seed: u8) -> Address {
        Address([seed; ADDRESS_BYTES])
    }

    /// A committee of `n` test validators seeded 1..=n.
    pub fn test_committee(n: u8) -> Vec<Address> {
        (1..=n).map(test_address).collect()
    }

    /// A header at `height` for the given committee, all seal slots empty.
    pub fn test_header(height: u64, validators: Vec<Address>) -> Header {
        Header {
            height,
            parent_hash: Hash::digest(&height.to_le_bytes()),
            proposer: test_address(0xaa),
            timestamp: 1_700_000_000_000 + height,
            extra: CommitteeExtra::new(validators),
        }
    }

    /// A block at `height` with a small opaque payload.
    pub fn test_block(height: u64, validators: Vec<Address>) -> Block {
        Block::new(test_header(height, validators), vec![0xb0; 8])
    }
}
