//! Block and header types as seen by the consensus core.
//!
//! The core observes a block as a header plus an opaque payload. The header
//! carries the proposer-committee extension: an ordered validator list and a
//! parallel fixed-length sequence of seal slots, one per validator.

use crate::{Address, Hash, Signature};

/// Proposer-committee extension carried in every header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitteeExtra {
    /// Ordered validator addresses for this height.
    pub validators: Vec<Address>,
    /// Seal slots, parallel to `validators`. Empty until signed.
    pub seals: Vec<Signature>,
}

impl CommitteeExtra {
    /// Extension for the given committee with all seal slots empty.
    pub fn new(validators: Vec<Address>) -> Self {
        let seals = vec![Signature::EMPTY; validators.len()];
        Self { validators, seals }
    }

    /// Index of a validator in the committee, if it is a member.
    pub fn index_of(&self, addr: &Address) -> Option<usize> {
        self.validators.iter().position(|v| v == addr)
    }

    /// The seal recorded for a validator, if that validator is a member.
    pub fn seal_of(&self, addr: &Address) -> Option<&Signature> {
        self.index_of(addr).map(|i| &self.seals[i])
    }
}

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    /// Chain height, monotonic per chain.
    pub height: u64,
    /// Digest of the parent block's header.
    pub parent_hash: Hash,
    /// Address of the proposer of this block.
    pub proposer: Address,
    /// Proposal time, milliseconds since epoch.
    pub timestamp: u64,
    /// Validator committee and seal slots for this height.
    pub extra: CommitteeExtra,
}

impl Header {
    /// Canonical digest of this header.
    ///
    /// Covers height, parent, proposer, timestamp, and the validator list.
    /// Seal slots are excluded so the hash is stable as signatures arrive.
    pub fn hash(&self) -> Hash {
        let mut data = Vec::with_capacity(64 + 20 * self.extra.validators.len());
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(self.parent_hash.as_bytes());
        data.extend_from_slice(self.proposer.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        for v in &self.extra.validators {
            data.extend_from_slice(v.as_bytes());
        }
        Hash::digest(&data)
    }
}

/// A block: header plus opaque payload.
///
/// The payload is carried untouched; transaction semantics live outside the
/// consensus core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Digest of the block's header.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Chain height of this block.
    pub fn height(&self) -> u64 {
        self.header.height
    }
}
