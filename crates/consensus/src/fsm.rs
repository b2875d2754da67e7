//! The validator finite state machine.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use dpor_types::{Address, Block, Hash, Header, Phase, Signature};

use crate::service::ChainService;
use crate::{FsmAction, FsmError, Input, MsgCode, Output, State};

/// Number of in-flight blocks kept for validate reconstruction.
///
/// Protocol-adjacent: it bounds how many concurrent in-flight heights a
/// validator can honor validate messages for. Must match across nodes.
pub const BLOCK_CACHE_SIZE: usize = 10;

/// Configuration for the validator FSM.
#[derive(Debug, Clone)]
pub struct FsmConfig {
    /// The Byzantine bound f; the committee holds at least 3f+1 members
    /// and certificates require 2f+1 seals.
    pub faulty: u64,
    /// Capacity of the block cache.
    pub cache_capacity: usize,
}

impl FsmConfig {
    /// Config for a committee tolerating `faulty` Byzantine members.
    pub fn new(faulty: u64) -> Self {
        Self {
            faulty,
            cache_capacity: BLOCK_CACHE_SIZE,
        }
    }
}

/// One recorded seal: the sealed block hash and the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SigItem {
    hash: Hash,
    sig: Signature,
}

/// Per-phase signature state: validator address → recorded seal.
type SigState = HashMap<Address, SigItem>;

/// Mutable data shared by the sig-plus and compose operations.
///
/// Lives behind the FSM's data lock, separate from the state lock; read-only
/// certificate checks take shared access, mutating operations exclusive.
struct FsmData {
    prepare_sigs: SigState,
    commit_sigs: SigState,
    last_height: u64,
    cache: LruCache<Hash, Block>,
}

impl FsmData {
    /// Monotonic-height reset: observing a strictly greater height clears
    /// both phase maps so stale seals can never count toward a certificate.
    fn refresh_when_newer_height(&mut self, height: u64) {
        if height > self.last_height {
            debug!(
                old_height = self.last_height,
                new_height = height,
                "resetting signature state for newer height"
            );
            self.last_height = height;
            self.prepare_sigs.clear();
            self.commit_sigs.clear();
        }
    }
}

/// Everything `handle` tells the driver about one step.
///
/// Mirrors the five result positions of the agreement algorithm: the output
/// payload, what to do with it, the protocol code the output travels under,
/// and the typed error if the step failed. A populated `error` with a
/// non-`None` action occurs only for faulty proposals, where the impeachment
/// response and the `FaultyBlock` error are produced together.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub output: Output,
    pub action: FsmAction,
    pub msg: MsgCode,
    pub error: Option<FsmError>,
}

impl Outcome {
    fn noop() -> Self {
        Self {
            output: Output::None,
            action: FsmAction::None,
            msg: MsgCode::NoMsg,
            error: None,
        }
    }

    fn fail(err: FsmError) -> Self {
        Self {
            output: Output::None,
            action: FsmAction::None,
            msg: MsgCode::NoMsg,
            error: Some(err),
        }
    }

    fn emit(output: Output, action: FsmAction, msg: MsgCode) -> Self {
        Self {
            output,
            action,
            msg,
            error: None,
        }
    }

    /// True if this step produced neither output nor error.
    pub fn is_noop(&self) -> bool {
        self.action == FsmAction::None && self.error.is_none()
    }
}

/// The validator state machine.
///
/// Designed to be invoked from a single consensus-driver thread; internal
/// state is nevertheless guarded by two separate reader-writer locks (the
/// protocol state and the signature data) so status queries never contend
/// with sig-plus writes.
pub struct ValidatorFsm {
    state: RwLock<State>,
    data: RwLock<FsmData>,
    service: Arc<dyn ChainService>,
    faulty: u64,
}

impl ValidatorFsm {
    pub fn new(service: Arc<dyn ChainService>, config: FsmConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1)).unwrap();
        Self {
            state: RwLock::new(State::Idle),
            data: RwLock::new(FsmData {
                prepare_sigs: SigState::new(),
                commit_sigs: SigState::new(),
                last_height: 0,
                cache: LruCache::new(capacity),
            }),
            service,
            faulty: config.faulty,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> State {
        *self.state.read()
    }

    /// Force the protocol state. Exposed for drivers that restore state.
    pub fn set_state(&self, state: State) {
        *self.state.write() = state;
    }

    /// The greatest height observed so far.
    pub fn last_height(&self) -> u64 {
        self.data.read().last_height
    }

    fn quorum(&self) -> u64 {
        2 * self.faulty + 1
    }

    // ───────────────────────────────────────────────────────────────────
    // Certificates
    // ───────────────────────────────────────────────────────────────────

    fn certificate(&self, header: &Header, phase: Phase) -> bool {
        let hash = header.hash();
        let data = self.data.read();
        let sigs = match phase {
            Phase::Prepare => &data.prepare_sigs,
            Phase::Commit => &data.commit_sigs,
        };
        let count = sigs.values().filter(|item| item.hash == hash).count() as u64;
        count >= self.quorum()
    }

    /// True once 2f+1 prepare seals for this header have been collected.
    fn prepare_certificate(&self, header: &Header) -> bool {
        self.certificate(header, Phase::Prepare)
    }

    /// True once 2f+1 commit seals for this header have been collected.
    fn commit_certificate(&self, header: &Header) -> bool {
        self.certificate(header, Phase::Commit)
    }

    fn impeach_prepare_certificate(&self, header: &Header) -> bool {
        self.prepare_certificate(header)
    }

    fn impeach_commit_certificate(&self, header: &Header) -> bool {
        self.commit_certificate(header)
    }

    // ───────────────────────────────────────────────────────────────────
    // Sig-plus accumulators
    // ───────────────────────────────────────────────────────────────────

    /// Merge the header's seal slots for `phase` into the signature state.
    ///
    /// Recovered signers must all be committee members for the header's
    /// height; one non-member rejects the whole batch and nothing is
    /// written. Existing entries for a signer are overwritten, keeping at
    /// most one seal per validator per phase per height.
    fn sig_plus(&self, header: &Header, phase: Phase) -> Result<(), FsmError> {
        let mut data = self.data.write();
        // Seals for an already-passed height must never re-enter the state:
        // certificates only ever consider the greatest height observed.
        if header.height < data.last_height {
            return Err(FsmError::BlockTooOld);
        }
        data.refresh_when_newer_height(header.height);

        let recovered = self
            .service
            .ecrecover_seals(header, phase)
            .map_err(|err| {
                warn!(phase = ?phase, error = %err, "failed to recover seals");
                FsmError::SignatureRecovery
            })?;

        let validators = self.service.validators_of(header.height);
        for (signer, _) in &recovered {
            if !validators.contains(signer) {
                warn!(signer = %signer, height = header.height, "a signer is not in the validator committee");
                return Err(FsmError::InvalidSigners);
            }
        }

        let hash = header.hash();
        let sigs = match phase {
            Phase::Prepare => &mut data.prepare_sigs,
            Phase::Commit => &mut data.commit_sigs,
        };
        for (signer, sig) in recovered {
            sigs.insert(signer, SigItem { hash, sig });
        }
        Ok(())
    }

    fn prepare_sig_plus(&self, header: &Header) -> Result<(), FsmError> {
        self.sig_plus(header, Phase::Prepare)
    }

    fn commit_sig_plus(&self, header: &Header) -> Result<(), FsmError> {
        self.sig_plus(header, Phase::Commit)
    }

    fn impeach_prepare_sig_plus(&self, header: &Header) -> Result<(), FsmError> {
        self.prepare_sig_plus(header)
    }

    fn impeach_commit_sig_plus(&self, header: &Header) -> Result<(), FsmError> {
        self.commit_sig_plus(header)
    }

    // ───────────────────────────────────────────────────────────────────
    // Compose operations
    // ───────────────────────────────────────────────────────────────────

    /// Accept a fresh proposal: cache the block, forward recorded prepare
    /// seals, and seal the header at the prepare phase.
    fn compose_prepare(&self, mut block: Block) -> Result<Header, FsmError> {
        let mut data = self.data.write();
        if data.last_height >= block.height() {
            return Err(FsmError::BlockTooOld);
        }
        data.refresh_when_newer_height(block.height());

        for (signer, item) in &data.prepare_sigs {
            self.service
                .update_prepare_sig_cache(*signer, item.hash, item.sig);
        }
        self.service.sign_header(&mut block.header, Phase::Prepare)?;
        info!(
            height = block.height(),
            hash = %block.hash(),
            "sealed proposal at prepare phase"
        );

        let header = block.header.clone();
        data.cache.put(block.hash(), block);
        Ok(header)
    }

    /// Seal the header at the commit phase and forward recorded commit
    /// seals to the final seal cache.
    fn compose_commit(&self, mut header: Header) -> Result<Header, FsmError> {
        let mut data = self.data.write();
        if data.last_height > header.height {
            return Err(FsmError::BlockTooOld);
        }
        data.refresh_when_newer_height(header.height);

        for (signer, item) in &data.commit_sigs {
            self.service
                .update_final_sig_cache(*signer, item.hash, item.sig);
        }
        self.service.sign_header(&mut header, Phase::Commit)?;
        info!(height = header.height, "sealed header at commit phase");
        Ok(header)
    }

    /// Reconstruct the full block for a commit certificate, splicing
    /// recorded commit seals into any still-empty slots.
    fn compose_validate(&self, header: &Header) -> Result<Block, FsmError> {
        let mut data = self.data.write();
        let hash = header.hash();
        let Some(mut block) = data.cache.get(&hash).cloned() else {
            warn!(hash = %hash, "failed to retrieve block from cache");
            return Err(FsmError::BlockNotFound);
        };
        for (i, validator) in header.extra.validators.iter().enumerate() {
            let Some(slot) = block.header.extra.seals.get_mut(i) else {
                break;
            };
            if !slot.is_empty() {
                continue;
            }
            if let Some(item) = data.commit_sigs.get(validator) {
                if item.hash == hash {
                    *slot = item.sig;
                }
            }
        }
        Ok(block)
    }

    fn compose_impeach_validate(&self, header: &Header) -> Result<Block, FsmError> {
        self.compose_validate(header)
    }

    /// Build and seal the substitute block for a failed proposer.
    fn propose_impeach_block(&self) -> Result<Block, FsmError> {
        let mut block = self.service.create_impeach_block().map_err(|err| {
            warn!(error = %err, "creating impeachment block failed");
            FsmError::Service(err)
        })?;
        self.service.sign_header(&mut block.header, Phase::Prepare)?;
        info!(hash = %block.hash(), height = block.height(), "proposed an impeachment block");
        Ok(block)
    }

    fn verify_block(&self, block: &Block) -> bool {
        match self.service.validate_block(block) {
            Ok(()) => true,
            Err(err) => {
                warn!(hash = %block.hash(), error = %err, "proposed block failed validation");
                false
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Transition table
    // ───────────────────────────────────────────────────────────────────

    /// Process one input under the current state and settle the next state.
    ///
    /// Errors never crash the machine: the state is preserved on failure
    /// and the typed error travels in the outcome.
    pub fn handle(&self, input: Input, msg: MsgCode) -> Outcome {
        let state = self.state();
        let (outcome, next) = self.step(input, msg, state);
        if let Some(err) = &outcome.error {
            warn!(state = ?state, msg = ?msg, error = %err, "fsm step failed");
        }
        self.set_state(next);
        outcome
    }

    fn step(&self, input: Input, msg: MsgCode, state: State) -> (Outcome, State) {
        use MsgCode::*;
        use State::*;

        match (state, msg) {
            // A (impeach) validate message is accepted in any state: insert
            // the finished block and settle back to Idle.
            (_, Validate) | (_, ImpeachValidate) => self.on_validate(input, state),

            (Idle, PrePrepare) => self.on_preprepare(input),

            (Idle | Preprepared, Prepare) => self.on_prepare(input, state),

            // A commit certificate is honored even from Idle (late arrival)
            // to keep liveness under message reordering.
            (Idle | Preprepared | Prepared, Commit) => self.on_commit(input, state),

            (Idle | Preprepared | Prepared, ImpeachPrePrepare) => {
                self.on_impeach_preprepare(state)
            }

            (Idle | Preprepared | Prepared | ImpeachPreprepared, ImpeachPrepare) => {
                self.on_impeach_prepare(input, state)
            }

            (_, ImpeachCommit) => self.on_impeach_commit(input, state),

            _ => (Outcome::fail(FsmError::WrongInput(state)), state),
        }
    }

    fn on_validate(&self, input: Input, state: State) -> (Outcome, State) {
        match input.into_block() {
            Ok(block) => (
                Outcome::emit(Output::Block(block), FsmAction::Insert, MsgCode::NoMsg),
                State::Idle,
            ),
            Err(err) => (Outcome::fail(err), state),
        }
    }

    fn on_preprepare(&self, input: Input) -> (Outcome, State) {
        let block = match input.into_block() {
            Ok(b) => b,
            Err(err) => return (Outcome::fail(err), State::Idle),
        };

        if self.verify_block(&block) {
            match self.compose_prepare(block) {
                Ok(header) => (
                    Outcome::emit(
                        Output::Header(header),
                        FsmAction::Broadcast,
                        MsgCode::Prepare,
                    ),
                    State::Preprepared,
                ),
                Err(err) => (Outcome::fail(err), State::Idle),
            }
        } else {
            // Faulty proposal: answer with an impeachment block. The
            // transition and the FaultyBlock error are reported together.
            match self.propose_impeach_block() {
                Ok(impeach) => (
                    Outcome {
                        output: Output::Block(impeach),
                        action: FsmAction::BroadcastAndInsert,
                        msg: MsgCode::ImpeachPrepare,
                        error: Some(FsmError::FaultyBlock),
                    },
                    State::ImpeachPreprepared,
                ),
                Err(err) => (Outcome::fail(err), State::Idle),
            }
        }
    }

    fn on_prepare(&self, input: Input, state: State) -> (Outcome, State) {
        let header = match input.header() {
            Ok(h) => h.clone(),
            Err(err) => return (Outcome::fail(err), state),
        };

        if self.prepare_certificate(&header) {
            match self.compose_commit(header) {
                Ok(signed) => (
                    Outcome::emit(
                        Output::Header(signed),
                        FsmAction::Broadcast,
                        MsgCode::Commit,
                    ),
                    State::Prepared,
                ),
                Err(err) => (Outcome::fail(err), state),
            }
        } else {
            match self.prepare_sig_plus(&header) {
                Ok(()) => (Outcome::noop(), state),
                Err(err) => (Outcome::fail(err), state),
            }
        }
    }

    fn on_commit(&self, input: Input, state: State) -> (Outcome, State) {
        let header = match input.header() {
            Ok(h) => h.clone(),
            Err(err) => return (Outcome::fail(err), state),
        };

        if self.commit_certificate(&header) {
            match self.compose_validate(&header) {
                Ok(block) => (
                    Outcome::emit(
                        Output::Block(block),
                        FsmAction::BroadcastAndInsert,
                        MsgCode::Validate,
                    ),
                    State::Idle,
                ),
                Err(err) => (Outcome::fail(err), state),
            }
        } else {
            match self.commit_sig_plus(&header) {
                Ok(()) => (Outcome::noop(), state),
                Err(err) => (Outcome::fail(err), state),
            }
        }
    }

    fn on_impeach_preprepare(&self, state: State) -> (Outcome, State) {
        // Proposer timed out: build the substitute block and enter the
        // impeach phases. The input is unused; the trigger carries no data.
        match self.propose_impeach_block() {
            Ok(impeach) => (
                Outcome::emit(
                    Output::Block(impeach),
                    FsmAction::Broadcast,
                    MsgCode::ImpeachPrepare,
                ),
                State::ImpeachPreprepared,
            ),
            Err(err) => (Outcome::fail(err), state),
        }
    }

    fn on_impeach_prepare(&self, input: Input, state: State) -> (Outcome, State) {
        let header = match input.header() {
            Ok(h) => h.clone(),
            Err(err) => return (Outcome::fail(err), state),
        };

        if self.impeach_prepare_certificate(&header) {
            (
                Outcome::emit(
                    Output::Header(header),
                    FsmAction::Broadcast,
                    MsgCode::ImpeachCommit,
                ),
                State::ImpeachPrepared,
            )
        } else {
            match self.impeach_prepare_sig_plus(&header) {
                Ok(()) => (Outcome::noop(), state),
                Err(err) => (Outcome::fail(err), state),
            }
        }
    }

    fn on_impeach_commit(&self, input: Input, state: State) -> (Outcome, State) {
        let header = match input.header() {
            Ok(h) => h.clone(),
            Err(err) => return (Outcome::fail(err), state),
        };

        if self.impeach_commit_certificate(&header) {
            match self.compose_impeach_validate(&header) {
                Ok(block) => (
                    Outcome::emit(
                        Output::Block(block),
                        FsmAction::BroadcastAndInsert,
                        MsgCode::ImpeachValidate,
                    ),
                    State::Idle,
                ),
                Err(err) => (Outcome::fail(err), state),
            }
        } else {
            match self.impeach_commit_sig_plus(&header) {
                Ok(()) => (Outcome::noop(), state),
                Err(err) => (Outcome::fail(err), state),
            }
        }
    }
}

impl std::fmt::Debug for ValidatorFsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read();
        f.debug_struct("ValidatorFsm")
            .field("state", &self.state())
            .field("faulty", &self.faulty)
            .field("last_height", &data.last_height)
            .field("prepare_sigs", &data.prepare_sigs.len())
            .field("commit_sigs", &data.commit_sigs.len())
            .field("cached_blocks", &data.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedChain;
    use dpor_types::test_utils::{test_address, test_block, test_committee, test_header};

    fn fsm_with_committee(n: u8, faulty: u64) -> (ValidatorFsm, Arc<SimulatedChain>) {
        let committee = test_committee(n);
        let chain = Arc::new(SimulatedChain::new(test_address(1), committee));
        let fsm = ValidatorFsm::new(chain.clone(), FsmConfig::new(faulty));
        (fsm, chain)
    }

    fn sealed_header(
        height: u64,
        committee: &[Address],
        signers: &[Address],
        phase: Phase,
    ) -> Header {
        let mut header = test_header(height, committee.to_vec());
        for signer in signers {
            SimulatedChain::seal(&mut header, *signer, phase);
        }
        header
    }

    #[test]
    fn sig_plus_keeps_one_entry_per_signer() {
        let (fsm, _) = fsm_with_committee(4, 1);
        let committee = test_committee(4);
        let header = sealed_header(5, &committee, &committee[..2], Phase::Prepare);

        fsm.prepare_sig_plus(&header).unwrap();
        fsm.prepare_sig_plus(&header).unwrap();

        let data = fsm.data.read();
        assert_eq!(data.prepare_sigs.len(), 2);
        assert_eq!(data.last_height, 5);
    }

    #[test]
    fn sig_plus_rejects_foreign_signer_entirely() {
        let (fsm, _) = fsm_with_committee(4, 1);
        let committee = test_committee(4);
        let outsider = test_address(0x99);

        let mut header = test_header(5, committee.clone());
        SimulatedChain::seal(&mut header, committee[0], Phase::Prepare);
        // The outsider holds no committee slot; plant its seal in one it
        // does not own.
        header.extra.seals[1] =
            SimulatedChain::sealed_signature(outsider, header.hash(), Phase::Prepare);

        let err = fsm.prepare_sig_plus(&header).unwrap_err();
        assert_eq!(err, FsmError::InvalidSigners);
        assert!(
            fsm.data.read().prepare_sigs.is_empty(),
            "accept none on failure"
        );
    }

    #[test]
    fn newer_height_clears_both_phase_maps() {
        let (fsm, _) = fsm_with_committee(4, 1);
        let committee = test_committee(4);

        let prepare = sealed_header(100, &committee, &committee[..2], Phase::Prepare);
        fsm.prepare_sig_plus(&prepare).unwrap();
        let commit = sealed_header(100, &committee, &committee[..1], Phase::Commit);
        fsm.commit_sig_plus(&commit).unwrap();
        assert_eq!(fsm.data.read().prepare_sigs.len(), 2);
        assert_eq!(fsm.data.read().commit_sigs.len(), 1);

        let next = sealed_header(101, &committee, &committee[..1], Phase::Prepare);
        fsm.prepare_sig_plus(&next).unwrap();

        let data = fsm.data.read();
        assert_eq!(data.last_height, 101);
        assert_eq!(data.prepare_sigs.len(), 1, "only the height-101 seal remains");
        assert!(data.commit_sigs.is_empty());
    }

    #[test]
    fn compose_prepare_rejects_old_blocks() {
        let (fsm, _) = fsm_with_committee(4, 1);
        let committee = test_committee(4);

        let current = sealed_header(10, &committee, &committee[..1], Phase::Prepare);
        fsm.prepare_sig_plus(&current).unwrap();

        let stale = test_block(10, committee);
        assert_eq!(
            fsm.compose_prepare(stale).unwrap_err(),
            FsmError::BlockTooOld
        );
    }

    #[test]
    fn compose_validate_requires_cached_block() {
        let (fsm, _) = fsm_with_committee(4, 1);
        let header = test_header(3, test_committee(4));
        assert_eq!(
            fsm.compose_validate(&header).unwrap_err(),
            FsmError::BlockNotFound
        );
    }

    #[test]
    fn compose_validate_splices_commit_seals_without_downgrade() {
        let (fsm, _) = fsm_with_committee(4, 1);
        let committee = test_committee(4);

        // Cache the proposal via the normal path.
        let block = test_block(7, committee.clone());
        let accepted = fsm.compose_prepare(block.clone()).unwrap();

        // Collect commit seals from v2 and v3.
        let commit = sealed_header(7, &committee, &committee[1..3], Phase::Commit);
        fsm.commit_sig_plus(&commit).unwrap();

        let rebuilt = fsm.compose_validate(&block.header).unwrap();
        // v1's prepare-phase seal from compose_prepare survives untouched.
        assert!(!rebuilt.header.extra.seals[0].is_empty());
        assert_eq!(rebuilt.header.extra.seals[0], accepted.extra.seals[0]);
        // v2 and v3 slots were spliced from commit state.
        assert!(!rebuilt.header.extra.seals[1].is_empty());
        assert!(!rebuilt.header.extra.seals[2].is_empty());
        // v4 never sealed anything.
        assert!(rebuilt.header.extra.seals[3].is_empty());
    }

    #[test]
    fn wrong_message_for_state_keeps_state() {
        let (fsm, _) = fsm_with_committee(4, 1);
        fsm.set_state(State::ImpeachPrepared);

        let header = test_header(2, test_committee(4));
        let outcome = fsm.handle(Input::Header(header), MsgCode::Prepare);
        assert_eq!(
            outcome.error,
            Some(FsmError::WrongInput(State::ImpeachPrepared))
        );
        assert_eq!(fsm.state(), State::ImpeachPrepared);
    }

    #[test]
    fn wrong_data_type_is_rejected() {
        let (fsm, _) = fsm_with_committee(4, 1);
        let block = test_block(2, test_committee(4));
        let outcome = fsm.handle(Input::Block(block), MsgCode::Prepare);
        assert_eq!(outcome.error, Some(FsmError::WrongDataType));
        assert_eq!(fsm.state(), State::Idle);
    }

    #[test]
    fn impeach_block_failure_preserves_state() {
        let committee = test_committee(4);
        let chain = Arc::new(SimulatedChain::new(test_address(1), committee.clone()));
        // No impeach template configured: CreateImpeachBlock fails.
        let fsm = ValidatorFsm::new(chain, FsmConfig::new(1));

        let outcome = fsm.handle(Input::Header(test_header(1, committee)), MsgCode::ImpeachPrePrepare);
        assert!(matches!(outcome.error, Some(FsmError::Service(_))));
        assert_eq!(fsm.state(), State::Idle);
    }
}
