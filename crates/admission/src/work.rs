//! Bounded proof-of-work searches over a seed header.
//!
//! Each campaign runs two searches: a CPU-bound SHA-256 search and a
//! memory-bound scrypt search. A nonce satisfies its task when the digest of
//! `seed-hash ‖ miner ‖ nonce` falls below the target derived from the
//! difficulty, i.e. its leading `difficulty` bits are zero.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dpor_types::{Address, Header};

use crate::AdmissionError;

/// How many nonces to try between deadline checks. The cancellation token
/// is checked every nonce; it is a single atomic load.
const DEADLINE_CHECK_INTERVAL: u64 = 256;

/// Memory hardness of the scrypt task (N = 4096, r = 8, p = 1).
const SCRYPT_LOG_N: u8 = 12;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// The two proof tasks of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProofKind {
    /// CPU-bound SHA-256 search.
    Cpu,
    /// Memory-bound scrypt search.
    Memory,
}

impl ProofKind {
    /// The key this task reports under in campaign results.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofKind::Cpu => "cpu",
            ProofKind::Memory => "memory",
        }
    }
}

/// Outcome of one proof task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResult {
    pub block_number: u64,
    pub nonce: u64,
    pub success: bool,
}

/// Parameters of one proof task.
#[derive(Debug, Clone)]
pub(crate) struct WorkParams {
    pub kind: ProofKind,
    pub difficulty: u64,
    pub lifetime: Duration,
    pub miner: Address,
    /// Seed header, taken at the height below the chain tip.
    pub seed: Header,
}

/// True if the digest's leading `difficulty` bits are zero.
pub fn meets_difficulty(digest: &[u8; 32], difficulty: u64) -> bool {
    let mut remaining = difficulty.min(256);
    for byte in digest {
        if remaining == 0 {
            return true;
        }
        if remaining >= 8 {
            if *byte != 0 {
                return false;
            }
            remaining -= 8;
        } else {
            return byte.leading_zeros() as u64 >= remaining;
        }
    }
    true
}

/// The digest a given nonce produces for a task.
///
/// Exposed so claims can be replayed against their difficulty target.
pub fn proof_digest(kind: ProofKind, seed: &Header, miner: Address, nonce: u64) -> [u8; 32] {
    let mut data = Vec::with_capacity(60);
    data.extend_from_slice(seed.hash().as_bytes());
    data.extend_from_slice(miner.as_bytes());
    data.extend_from_slice(&nonce.to_le_bytes());

    match kind {
        ProofKind::Cpu => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&Sha256::digest(&data));
            out
        }
        ProofKind::Memory => {
            let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
                .expect("fixed scrypt parameters are valid");
            let mut out = [0u8; 32];
            scrypt::scrypt(&data, &data, &params, &mut out)
                .expect("32-byte scrypt output length is valid");
            out
        }
    }
}

/// Run one proof search to completion, cancellation, or deadline.
///
/// Aborted searches report `success = false` with no error; an exhausted
/// lifetime reports `success = false` with [`AdmissionError::ProofFailed`].
/// No side effects happen after cancellation is observed.
pub(crate) fn search(
    params: &WorkParams,
    cancel: &CancellationToken,
) -> (ProofResult, Option<AdmissionError>) {
    let deadline = Instant::now() + params.lifetime;
    let block_number = params.seed.height;
    let failed = ProofResult {
        block_number,
        nonce: 0,
        success: false,
    };

    let mut nonce: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            debug!(kind = params.kind.as_str(), nonce, "proof search aborted");
            return (failed, None);
        }
        if nonce % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
            warn!(
                kind = params.kind.as_str(),
                difficulty = params.difficulty,
                "proof search exceeded its lifetime"
            );
            return (failed, Some(AdmissionError::ProofFailed));
        }

        let digest = proof_digest(params.kind, &params.seed, params.miner, nonce);
        if meets_difficulty(&digest, params.difficulty) {
            debug!(
                kind = params.kind.as_str(),
                nonce, block_number, "proof search succeeded"
            );
            return (
                ProofResult {
                    block_number,
                    nonce,
                    success: true,
                },
                None,
            );
        }

        match nonce.checked_add(1) {
            Some(next) => nonce = next,
            None => return (failed, Some(AdmissionError::ProofFailed)),
        }
    }
}
