//! In-memory backend and chain for tests and local simulation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dpor_types::{Address, CommitteeExtra, Hash, Header};

use crate::backend::{
    AdmissionKey, AdmissionParams, BackendError, CampaignClaim, ChainReader, ContractBackend,
    PendingTx, Receipt,
};

/// What the simulated contracts remember.
struct SimState {
    balances: HashMap<Address, u128>,
    rnodes: HashSet<Address>,
    receipts: HashMap<Hash, Receipt>,
    params: AdmissionParams,
    locked_period: bool,
    claims: Vec<CampaignClaim>,
    joins: Vec<(Address, u128)>,
    pending_joins: Vec<(Hash, Address)>,
    tx_counter: u64,
}

/// Simulated contract backend.
///
/// Reports `supports_transactions() == false` by default, like the real
/// simulated backend the claim path refuses to transact against; tests that
/// want to observe claims flip it with [`allow_transactions`].
///
/// [`allow_transactions`]: SimulatedBackend::allow_transactions
pub struct SimulatedBackend {
    state: Mutex<SimState>,
    supports_tx: AtomicBool,
    /// Mine join transactions instantly (receipt available on first poll).
    auto_mine: AtomicBool,
}

impl SimulatedBackend {
    pub fn new(params: AdmissionParams) -> Self {
        Self {
            state: Mutex::new(SimState {
                balances: HashMap::new(),
                rnodes: HashSet::new(),
                receipts: HashMap::new(),
                params,
                locked_period: false,
                claims: Vec::new(),
                joins: Vec::new(),
                pending_joins: Vec::new(),
                tx_counter: 0,
            }),
            supports_tx: AtomicBool::new(false),
            auto_mine: AtomicBool::new(true),
        }
    }

    /// Easy parameters: tiny difficulties, generous lifetimes.
    pub fn with_easy_params() -> Self {
        Self::new(AdmissionParams {
            cpu_difficulty: 4,
            mem_difficulty: 2,
            cpu_lifetime: Duration::from_secs(10),
            mem_lifetime: Duration::from_secs(10),
        })
    }

    pub fn set_balance(&self, addr: Address, balance: u128) {
        self.state.lock().balances.insert(addr, balance);
    }

    pub fn add_rnode(&self, addr: Address) {
        self.state.lock().rnodes.insert(addr);
    }

    /// Refuse join transactions with a locked-period revert.
    pub fn set_locked_period(&self, locked: bool) {
        self.state.lock().locked_period = locked;
    }

    /// Let claims through `supports_transactions`.
    pub fn allow_transactions(&self, allow: bool) {
        self.supports_tx.store(allow, Ordering::SeqCst);
    }

    /// Hold receipts back until [`mine_all`](Self::mine_all).
    pub fn set_auto_mine(&self, auto: bool) {
        self.auto_mine.store(auto, Ordering::SeqCst);
    }

    /// Mine every pending join: receipts land and the bonds register.
    pub fn mine_all(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending_joins);
        for (hash, addr) in pending {
            state.receipts.insert(
                hash,
                Receipt {
                    tx_hash: hash,
                    status: 1,
                },
            );
            state.rnodes.insert(addr);
        }
    }

    /// Join transactions submitted so far.
    pub fn joins(&self) -> Vec<(Address, u128)> {
        self.state.lock().joins.clone()
    }

    /// Campaign claims submitted so far.
    pub fn claims(&self) -> Vec<CampaignClaim> {
        self.state.lock().claims.clone()
    }

    fn join_tx_hash(counter: u64) -> Hash {
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(b"join");
        data.extend_from_slice(&counter.to_le_bytes());
        Hash::digest(&data)
    }
}

#[async_trait]
impl ContractBackend for SimulatedBackend {
    async fn balance_at(&self, addr: Address) -> Result<u128, BackendError> {
        Ok(self.state.lock().balances.get(&addr).copied().unwrap_or(0))
    }

    async fn transaction_receipt(&self, tx: Hash) -> Result<Option<Receipt>, BackendError> {
        Ok(self.state.lock().receipts.get(&tx).copied())
    }

    async fn is_rnode(&self, addr: Address) -> Result<bool, BackendError> {
        Ok(self.state.lock().rnodes.contains(&addr))
    }

    async fn join_rnode(&self, key: &AdmissionKey, value: u128) -> Result<PendingTx, BackendError> {
        let mut state = self.state.lock();
        if state.locked_period {
            return Err(BackendError::LockedPeriod);
        }
        let hash = Self::join_tx_hash(state.tx_counter);
        state.tx_counter += 1;
        state.joins.push((key.address, value));
        if self.auto_mine.load(Ordering::SeqCst) {
            state.receipts.insert(
                hash,
                Receipt {
                    tx_hash: hash,
                    status: 1,
                },
            );
            state.rnodes.insert(key.address);
        } else {
            state.pending_joins.push((hash, key.address));
        }
        Ok(PendingTx { hash })
    }

    async fn admission_parameters(&self) -> Result<AdmissionParams, BackendError> {
        Ok(self.state.lock().params)
    }

    async fn claim_campaign(
        &self,
        _key: &AdmissionKey,
        claim: &CampaignClaim,
    ) -> Result<PendingTx, BackendError> {
        let mut state = self.state.lock();
        state.claims.push(*claim);
        let mut data = Vec::with_capacity(13);
        data.extend_from_slice(b"claim");
        data.extend_from_slice(&state.tx_counter.to_le_bytes());
        state.tx_counter += 1;
        Ok(PendingTx {
            hash: Hash::digest(&data),
        })
    }

    fn supports_transactions(&self) -> bool {
        self.supports_tx.load(Ordering::SeqCst)
    }
}

/// In-memory chain of headers for seeding proof works.
pub struct InMemoryChain {
    headers: Mutex<Vec<Header>>,
}

impl InMemoryChain {
    /// A chain grown to `height`, genesis included.
    pub fn with_height(height: u64) -> Self {
        let chain = Self {
            headers: Mutex::new(vec![Header::default()]),
        };
        chain.extend_to(height);
        chain
    }

    /// Append empty blocks until the tip reaches `height`.
    pub fn extend_to(&self, height: u64) {
        let mut headers = self.headers.lock();
        while (headers.len() as u64) <= height {
            let parent = headers
                .last()
                .map(|h| h.hash())
                .unwrap_or(Hash::ZERO);
            let next_height = headers.len() as u64;
            headers.push(Header {
                height: next_height,
                parent_hash: parent,
                proposer: Address::ZERO,
                timestamp: next_height,
                extra: CommitteeExtra::default(),
            });
        }
    }
}

impl ChainReader for InMemoryChain {
    fn current_header(&self) -> Header {
        self.headers
            .lock()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        self.headers.lock().get(number as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_links_headers() {
        let chain = InMemoryChain::with_height(5);
        assert_eq!(chain.current_header().height, 5);
        let h4 = chain.header_by_number(4).unwrap();
        let h5 = chain.header_by_number(5).unwrap();
        assert_eq!(h5.parent_hash, h4.hash());
        assert!(chain.header_by_number(6).is_none());
    }

    #[tokio::test]
    async fn locked_period_rejects_joins() {
        let backend = SimulatedBackend::with_easy_params();
        backend.set_locked_period(true);
        let key = AdmissionKey {
            address: Address([1; 20]),
        };
        assert_eq!(
            backend.join_rnode(&key, 1).await,
            Err(BackendError::LockedPeriod)
        );
        assert!(backend.joins().is_empty());
    }
}
