//! The admission controller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dpor_types::{Address, Hash};

use crate::backend::{AdmissionKey, CampaignClaim, ChainReader, ContractBackend};
use crate::work::{search, ProofKind, ProofResult, WorkParams};
use crate::{AdmissionConfig, AdmissionError, Status};

/// Mutable controller state behind the data lock.
struct ControlState {
    status: Status,
    err: Option<AdmissionError>,
    key: Option<AdmissionKey>,
    backend: Option<Arc<dyn ContractBackend>>,
    cpu_result: ProofResult,
    mem_result: ProofResult,
    /// Cancellation signal for the in-flight campaign.
    abort: Option<CancellationToken>,
    /// Flips to `true` when the in-flight campaign finishes.
    done: watch::Receiver<bool>,
    /// The coordinator awaiting the proof tasks; owned, not detached.
    coordinator: Option<JoinHandle<()>>,
    /// The funding receipt watcher; owned, not detached.
    funding_watcher: Option<JoinHandle<()>>,
}

struct Inner {
    address: Address,
    chain: Arc<dyn ChainReader>,
    config: AdmissionConfig,
    op_lock: Mutex<()>,
    state: RwLock<ControlState>,
    sending_fund: AtomicBool,
}

/// Drives a node through self-funding, resource proof, and campaign claim.
///
/// One operation mutex serializes `campaign` / `abort` / `set_admission_key`
/// / `set_simulate_backend`; status and result queries only take the read
/// side of the data lock. The funding flag is a compare-and-set atomic so
/// concurrent fund calls submit exactly one join transaction.
///
/// Cloning yields another handle onto the same controller.
#[derive(Clone)]
pub struct AdmissionControl {
    inner: Arc<Inner>,
}

impl AdmissionControl {
    /// A controller for `address` reading the chain tip from `chain`.
    ///
    /// No backend is attached yet; operator wiring supplies one via
    /// [`set_simulate_backend`](Self::set_simulate_backend) or the real
    /// client equivalent.
    pub fn new(address: Address, chain: Arc<dyn ChainReader>, config: AdmissionConfig) -> Self {
        // Starts settled: a subscriber before the first campaign sees
        // `true` immediately even though the sender is gone.
        let (_, done_rx) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                address,
                chain,
                config,
                op_lock: Mutex::new(()),
                state: RwLock::new(ControlState {
                    status: Status::Idle,
                    err: None,
                    key: None,
                    backend: None,
                    cpu_result: ProofResult::default(),
                    mem_result: ProofResult::default(),
                    abort: None,
                    done: done_rx,
                    coordinator: None,
                    funding_watcher: None,
                }),
                sending_fund: AtomicBool::new(false),
            }),
        }
    }

    /// The account this controller campaigns as.
    pub fn address(&self) -> Address {
        self.inner.address
    }

    /// Current status and the last campaign error, if any.
    pub fn status(&self) -> (Status, Option<AdmissionError>) {
        let state = self.inner.state.read();
        (state.status, state.err.clone())
    }

    /// Latest proof results, keyed `"cpu"` and `"memory"`.
    pub fn results(&self) -> HashMap<&'static str, ProofResult> {
        let state = self.inner.state.read();
        HashMap::from([
            (ProofKind::Cpu.as_str(), state.cpu_result),
            (ProofKind::Memory.as_str(), state.mem_result),
        ])
    }

    /// Observer for campaign completion: the value flips to `true` when the
    /// in-flight campaign finishes.
    pub fn done_ch(&self) -> watch::Receiver<bool> {
        self.inner.state.read().done.clone()
    }

    /// Install the key used to sign admission transactions.
    pub async fn set_admission_key(&self, key: AdmissionKey) {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.state.write().key = Some(key);
    }

    /// Install a contract backend (simulated or real client).
    pub async fn set_simulate_backend(&self, backend: Arc<dyn ContractBackend>) {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.state.write().backend = Some(backend);
    }

    /// Whether this node has deposited the rnode bond.
    pub async fn is_rnode(&self) -> Result<bool, AdmissionError> {
        let backend = self.inner.backend()?;
        Ok(backend.is_rnode(self.inner.address).await?)
    }

    /// Start a campaign over `terms` terms.
    ///
    /// Launches the CPU and memory proof tasks concurrently and returns; a
    /// coordinator task awaits both and submits the claim on all-success.
    /// A campaign already in flight is a no-op success.
    pub async fn campaign(&self, terms: u64) -> Result<(), AdmissionError> {
        info!(terms, "starting campaign for the proposer committee");
        let inner = &self.inner;
        let _guard = inner.op_lock.lock().await;

        if terms < inner.config.min_terms || terms > inner.config.max_terms {
            return Err(AdmissionError::TermOutOfRange);
        }
        if inner.state.read().status == Status::Running {
            return Ok(());
        }

        let backend = inner.backend()?;
        if !backend.is_rnode(inner.address).await? {
            return Err(AdmissionError::NotRNode);
        }

        let params = backend.admission_parameters().await?;

        // The contract cannot see the hash of the block being built, so the
        // seed is the header one below the current tip.
        let tip = inner.chain.current_header().height;
        let seed_number = tip.saturating_sub(1);
        let seed = inner
            .chain
            .header_by_number(seed_number)
            .ok_or(AdmissionError::BackendUnavailable)?;

        let cpu_work = WorkParams {
            kind: ProofKind::Cpu,
            difficulty: params.cpu_difficulty,
            lifetime: params.cpu_lifetime,
            miner: inner.address,
            seed: seed.clone(),
        };
        let mem_work = WorkParams {
            kind: ProofKind::Memory,
            difficulty: params.mem_difficulty,
            lifetime: params.mem_lifetime,
            miner: inner.address,
            seed,
        };

        let abort = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut state = inner.state.write();
            state.status = Status::Running;
            state.err = None;
            state.cpu_result = ProofResult::default();
            state.mem_result = ProofResult::default();
            state.abort = Some(abort.clone());
            state.done = done_rx;
        }

        let cpu_cancel = abort.clone();
        let cpu_task = tokio::task::spawn_blocking(move || search(&cpu_work, &cpu_cancel));
        let mem_cancel = abort;
        let mem_task = tokio::task::spawn_blocking(move || search(&mem_work, &mem_cancel));

        let coordinator_inner = Arc::clone(inner);
        let coordinator = tokio::spawn(async move {
            coordinator_inner
                .await_works_and_claim(terms, cpu_task, mem_task, done_tx)
                .await;
        });
        inner.state.write().coordinator = Some(coordinator);

        Ok(())
    }

    /// Cancel the in-flight campaign and wait until it has settled.
    pub async fn abort(&self) {
        let inner = &self.inner;
        // Snapshot under the read lock first; only then serialize.
        let (status, abort, mut done) = {
            let state = inner.state.read();
            (state.status, state.abort.clone(), state.done.clone())
        };
        if status != Status::Running {
            return;
        }
        let _guard = inner.op_lock.lock().await;

        if let Some(token) = abort {
            token.cancel();
        }
        let _ = done.wait_for(|finished| *finished).await;

        let mut state = inner.state.write();
        state.abort = None;
        state.status = Status::Idle;
    }

    /// Deposit the rnode bond if this node has not yet.
    ///
    /// Idempotent: while a funding transaction is in flight the call returns
    /// success immediately, so N concurrent calls submit exactly one join
    /// transaction. A watcher polls the receipt at the configured interval
    /// until the overall timeout, then clears the in-flight flag.
    pub async fn fund_for_rnode(&self) -> Result<(), AdmissionError> {
        debug!("start funding to become an rnode");
        let inner = &self.inner;
        let _guard = inner.op_lock.lock().await;

        if inner.sending_fund.load(Ordering::SeqCst) {
            // A funding transaction is pending; wait for it instead.
            return Ok(());
        }

        let backend = inner.backend()?;
        if backend.is_rnode(inner.address).await? {
            return Ok(());
        }

        let balance = backend.balance_at(inner.address).await?;
        if balance < inner.config.min_rnode_fund {
            info!(
                balance = %balance,
                required = %inner.config.min_rnode_fund,
                "not enough balance to become an rnode"
            );
            return Err(AdmissionError::NotEnoughFunds);
        }

        let key = inner.state.read().key.ok_or(AdmissionError::NoKey)?;
        let tx = backend
            .join_rnode(&key, inner.config.min_rnode_fund)
            .await
            .map_err(|e| {
                info!(error = %e, "error when funding the rnode deposit");
                AdmissionError::from(e)
            })?;

        if inner
            .sending_fund
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        info!(account = %inner.address, tx = %tx.hash, "deposited fund to become an rnode");
        let watcher_inner = Arc::clone(inner);
        let watcher = tokio::spawn(async move {
            watcher_inner.wait_for_tx_done(backend, tx.hash).await;
        });
        inner.state.write().funding_watcher = Some(watcher);

        Ok(())
    }
}

impl Inner {
    fn backend(&self) -> Result<Arc<dyn ContractBackend>, AdmissionError> {
        self.state
            .read()
            .backend
            .clone()
            .ok_or(AdmissionError::BackendUnavailable)
    }

    /// Barrier-wait for both proof tasks, then submit the claim.
    async fn await_works_and_claim(
        &self,
        terms: u64,
        cpu_task: JoinHandle<(ProofResult, Option<AdmissionError>)>,
        mem_task: JoinHandle<(ProofResult, Option<AdmissionError>)>,
        done_tx: watch::Sender<bool>,
    ) {
        // Both tasks are already running; awaiting in turn is the barrier.
        let (cpu_result, cpu_err) = cpu_task
            .await
            .unwrap_or_else(|_| (ProofResult::default(), Some(AdmissionError::ProofFailed)));
        let (mem_result, mem_err) = mem_task
            .await
            .unwrap_or_else(|_| (ProofResult::default(), Some(AdmissionError::ProofFailed)));

        {
            let mut state = self.state.write();
            state.cpu_result = cpu_result;
            state.mem_result = mem_result;
        }

        let mut err = cpu_err.or(mem_err);
        if let Some(e) = &err {
            info!(error = %e, "a proof work did not pass admission");
        } else if cpu_result.success && mem_result.success {
            err = self
                .send_campaign_claim(terms, cpu_result, mem_result)
                .await
                .err();
        }

        {
            let mut state = self.state.write();
            state.err = err;
            state.status = Status::Idle;
        }
        let _ = done_tx.send(true);
    }

    /// Submit the campaign claim carrying both proof results.
    async fn send_campaign_claim(
        &self,
        terms: u64,
        cpu: ProofResult,
        mem: ProofResult,
    ) -> Result<(), AdmissionError> {
        let backend = self.backend()?;
        if !backend.supports_transactions() {
            warn!("contract backend cannot carry transactions, claim withheld");
            return Err(AdmissionError::BackendUnavailable);
        }
        let key = self.state.read().key.ok_or(AdmissionError::NoKey)?;

        let claim = CampaignClaim {
            terms,
            cpu_nonce: cpu.nonce,
            cpu_block_number: cpu.block_number,
            mem_nonce: mem.nonce,
            mem_block_number: mem.block_number,
            version: self.config.contract_version,
        };
        let tx = backend.claim_campaign(&key, &claim).await.map_err(|e| {
            warn!(error = %e, "error in claiming campaign");
            AdmissionError::from(e)
        })?;
        info!(
            terms,
            cpu_nonce = cpu.nonce,
            mem_nonce = mem.nonce,
            cpu_block = cpu.block_number,
            mem_block = mem.block_number,
            tx = %tx.hash,
            "claimed for campaign"
        );
        Ok(())
    }

    /// Poll the funding receipt until it lands or the timeout expires.
    async fn wait_for_tx_done(&self, backend: Arc<dyn ContractBackend>, tx_hash: Hash) {
        let poll = self.config.funding_poll_interval;
        let outcome = tokio::time::timeout(self.config.funding_timeout, async {
            loop {
                if let Ok(Some(receipt)) = backend.transaction_receipt(tx_hash).await {
                    debug!(tx = %tx_hash, status = receipt.status, "funding receipt landed");
                    return;
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        if outcome.is_err() {
            warn!(tx = %tx_hash, "funding transaction was not processed in time");
        }
        self.sending_fund.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("AdmissionControl")
            .field("address", &self.inner.address)
            .field("status", &state.status)
            .field("err", &state.err)
            .field(
                "sending_fund",
                &self.inner.sending_fund.load(Ordering::SeqCst),
            )
            .finish()
    }
}
