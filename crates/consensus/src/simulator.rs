//! In-memory chain service for tests and local simulation.
//!
//! Seals produced here are synthetic: the signer address is embedded in the
//! signature bytes, so "recovery" is a parse rather than real public-key
//! recovery. That keeps the FSM exercisable without key material while
//! preserving the shape of the real service: per-phase recovery, committee
//! lookups, and seal-cache forwarding.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::debug;

use dpor_types::{Address, Block, Hash, Header, Phase, Signature, ADDRESS_BYTES, HASH_BYTES};

use crate::service::{ChainError, ChainService};

const PHASE_BYTE: usize = ADDRESS_BYTES + HASH_BYTES;
const MARKER_BYTE: usize = PHASE_BYTE + 1;

fn phase_tag(phase: Phase) -> u8 {
    match phase {
        Phase::Prepare => 1,
        Phase::Commit => 2,
    }
}

/// Simulated chain backing a [`ValidatorFsm`](crate::ValidatorFsm).
pub struct SimulatedChain {
    local: Address,
    committee: Vec<Address>,
    faulty_blocks: Mutex<HashSet<Hash>>,
    impeach_template: Mutex<Option<Block>>,
    prepare_cache: Mutex<Vec<(Address, Hash, Signature)>>,
    final_cache: Mutex<Vec<(Address, Hash, Signature)>>,
}

impl SimulatedChain {
    /// A simulated chain where `committee` validates every height and
    /// `local` is the validator this node signs as.
    pub fn new(local: Address, committee: Vec<Address>) -> Self {
        Self {
            local,
            committee,
            faulty_blocks: Mutex::new(HashSet::new()),
            impeach_template: Mutex::new(None),
            prepare_cache: Mutex::new(Vec::new()),
            final_cache: Mutex::new(Vec::new()),
        }
    }

    /// Mark a block hash so `validate_block` rejects it.
    pub fn mark_faulty(&self, hash: Hash) {
        self.faulty_blocks.lock().insert(hash);
    }

    /// Set the substitute block `create_impeach_block` hands out.
    pub fn set_impeach_block(&self, block: Block) {
        *self.impeach_template.lock() = Some(block);
    }

    /// Seals forwarded to the prepare seal cache so far.
    pub fn prepare_cache_entries(&self) -> Vec<(Address, Hash, Signature)> {
        self.prepare_cache.lock().clone()
    }

    /// Seals forwarded to the final seal cache so far.
    pub fn final_cache_entries(&self) -> Vec<(Address, Hash, Signature)> {
        self.final_cache.lock().clone()
    }

    /// The synthetic seal `signer` would produce over `hash` at `phase`.
    pub fn sealed_signature(signer: Address, hash: Hash, phase: Phase) -> Signature {
        let mut bytes = [0u8; dpor_types::SEAL_BYTES];
        bytes[..ADDRESS_BYTES].copy_from_slice(signer.as_bytes());
        bytes[ADDRESS_BYTES..PHASE_BYTE].copy_from_slice(hash.as_bytes());
        bytes[PHASE_BYTE] = phase_tag(phase);
        bytes[MARKER_BYTE] = 0xd0;
        Signature(bytes)
    }

    /// Fill `signer`'s seal slot in a header, as a peer validator would
    /// before broadcasting a phase message.
    ///
    /// Does nothing if `signer` is not in the header's committee.
    pub fn seal(header: &mut Header, signer: Address, phase: Phase) {
        let hash = header.hash();
        if let Some(i) = header.extra.index_of(&signer) {
            header.extra.seals[i] = Self::sealed_signature(signer, hash, phase);
        }
    }
}

impl ChainService for SimulatedChain {
    fn validate_block(&self, block: &Block) -> Result<(), ChainError> {
        if self.faulty_blocks.lock().contains(&block.hash()) {
            Err(ChainError::InvalidBlock)
        } else {
            Ok(())
        }
    }

    fn ecrecover_seals(
        &self,
        header: &Header,
        phase: Phase,
    ) -> Result<Vec<(Address, Signature)>, ChainError> {
        let mut recovered = Vec::new();
        for seal in &header.extra.seals {
            if seal.is_empty() {
                continue;
            }
            if seal.0[PHASE_BYTE] != phase_tag(phase) {
                return Err(ChainError::SealRecovery);
            }
            let mut addr = [0u8; ADDRESS_BYTES];
            addr.copy_from_slice(&seal.0[..ADDRESS_BYTES]);
            recovered.push((Address(addr), *seal));
        }
        Ok(recovered)
    }

    fn validators_of(&self, _height: u64) -> Vec<Address> {
        self.committee.clone()
    }

    fn sign_header(&self, header: &mut Header, phase: Phase) -> Result<(), ChainError> {
        let hash = header.hash();
        let Some(i) = header.extra.index_of(&self.local) else {
            return Err(ChainError::NotInCommittee(header.height));
        };
        header.extra.seals[i] = Self::sealed_signature(self.local, hash, phase);
        debug!(height = header.height, slot = i, phase = ?phase, "sealed header as local validator");
        Ok(())
    }

    fn update_prepare_sig_cache(&self, signer: Address, hash: Hash, sig: Signature) {
        self.prepare_cache.lock().push((signer, hash, sig));
    }

    fn update_final_sig_cache(&self, signer: Address, hash: Hash, sig: Signature) {
        self.final_cache.lock().push((signer, hash, sig));
    }

    fn create_impeach_block(&self) -> Result<Block, ChainError> {
        self.impeach_template
            .lock()
            .clone()
            .ok_or(ChainError::NoImpeachBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpor_types::test_utils::{test_address, test_committee, test_header};

    #[test]
    fn recovery_reports_sealers_for_the_phase() {
        let committee = test_committee(4);
        let chain = SimulatedChain::new(test_address(1), committee.clone());

        let mut header = test_header(9, committee.clone());
        SimulatedChain::seal(&mut header, committee[0], Phase::Prepare);
        SimulatedChain::seal(&mut header, committee[2], Phase::Prepare);

        let recovered = chain.ecrecover_seals(&header, Phase::Prepare).unwrap();
        let signers: Vec<Address> = recovered.iter().map(|(a, _)| *a).collect();
        assert_eq!(signers, vec![committee[0], committee[2]]);
    }

    #[test]
    fn recovery_fails_on_phase_mismatch() {
        let committee = test_committee(4);
        let chain = SimulatedChain::new(test_address(1), committee.clone());

        let mut header = test_header(9, committee.clone());
        SimulatedChain::seal(&mut header, committee[0], Phase::Commit);

        assert_eq!(
            chain.ecrecover_seals(&header, Phase::Prepare),
            Err(ChainError::SealRecovery)
        );
    }

    #[test]
    fn signing_requires_committee_membership() {
        let committee = test_committee(4);
        let chain = SimulatedChain::new(test_address(0x77), committee.clone());

        let mut header = test_header(3, committee);
        assert_eq!(
            chain.sign_header(&mut header, Phase::Prepare),
            Err(ChainError::NotInCommittee(3))
        );
    }
}
