//! End-to-end campaign and funding flows against the simulated backend.

use std::sync::Arc;
use std::time::Duration;

use dpor_admission::{
    meets_difficulty, proof_digest, AdmissionConfig, AdmissionControl, AdmissionError,
    AdmissionKey, AdmissionParams, ChainReader, ContractBackend, InMemoryChain, ProofKind,
    SimulatedBackend, Status,
};
use dpor_types::Address;
use tracing_test::traced_test;

const MINER: Address = Address([0x42; 20]);

async fn setup(backend: SimulatedBackend) -> (AdmissionControl, Arc<SimulatedBackend>) {
    let backend = Arc::new(backend);
    let chain = Arc::new(InMemoryChain::with_height(12));
    let control = AdmissionControl::new(MINER, chain, AdmissionConfig::default());
    control.set_admission_key(AdmissionKey { address: MINER }).await;
    control
        .set_simulate_backend(backend.clone() as Arc<dyn ContractBackend>)
        .await;
    (control, backend)
}

#[tokio::test(flavor = "multi_thread")]
async fn campaign_submits_replayable_claim() {
    let (control, backend) = setup(SimulatedBackend::with_easy_params()).await;
    backend.add_rnode(MINER);
    backend.allow_transactions(true);

    control.campaign(3).await.expect("campaign starts");

    let mut done = control.done_ch();
    done.wait_for(|finished| *finished).await.expect("campaign finishes");

    let (status, err) = control.status();
    assert_eq!(status, Status::Idle);
    assert_eq!(err, None);

    let results = control.results();
    assert!(results["cpu"].success);
    assert!(results["memory"].success);

    // The claim carries the seed block number (tip − 1) and nonces that
    // replay against their difficulty targets.
    let claims = backend.claims();
    assert_eq!(claims.len(), 1);
    let claim = claims[0];
    assert_eq!(claim.terms, 3);
    assert_eq!(claim.cpu_block_number, 11);
    assert_eq!(claim.mem_block_number, 11);

    let chain = InMemoryChain::with_height(12);
    let seed = chain.header_by_number(11).expect("seed header");
    let cpu = proof_digest(ProofKind::Cpu, &seed, MINER, claim.cpu_nonce);
    assert!(meets_difficulty(&cpu, 4));
    let mem = proof_digest(ProofKind::Memory, &seed, MINER, claim.mem_nonce);
    assert!(meets_difficulty(&mem, 2));
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_stops_campaign_without_claim() {
    // Unreachable difficulties: the workers run until cancelled.
    let backend = SimulatedBackend::new(AdmissionParams {
        cpu_difficulty: 255,
        mem_difficulty: 255,
        cpu_lifetime: Duration::from_secs(60),
        mem_lifetime: Duration::from_secs(60),
    });
    let (control, backend) = setup(backend).await;
    backend.add_rnode(MINER);
    backend.allow_transactions(true);

    control.campaign(3).await.expect("campaign starts");
    assert_eq!(control.status().0, Status::Running);

    control.abort().await;

    let (status, err) = control.status();
    assert_eq!(status, Status::Idle);
    assert_eq!(err, None, "an aborted campaign is not an error");

    let results = control.results();
    assert!(!results["cpu"].success);
    assert!(!results["memory"].success);
    assert!(backend.claims().is_empty(), "no claim after abort");
}

#[tokio::test]
async fn campaign_rejects_out_of_range_terms() {
    let (control, backend) = setup(SimulatedBackend::with_easy_params()).await;
    backend.add_rnode(MINER);

    assert_eq!(
        control.campaign(0).await,
        Err(AdmissionError::TermOutOfRange)
    );
    assert_eq!(
        control.campaign(11).await,
        Err(AdmissionError::TermOutOfRange)
    );
}

#[tokio::test]
async fn campaign_requires_rnode_membership() {
    let (control, _) = setup(SimulatedBackend::with_easy_params()).await;
    assert_eq!(control.campaign(3).await, Err(AdmissionError::NotRNode));
}

#[tokio::test(flavor = "multi_thread")]
async fn running_campaign_makes_second_call_a_noop() {
    let backend = SimulatedBackend::new(AdmissionParams {
        cpu_difficulty: 255,
        mem_difficulty: 255,
        cpu_lifetime: Duration::from_secs(60),
        mem_lifetime: Duration::from_secs(60),
    });
    let (control, backend) = setup(backend).await;
    backend.add_rnode(MINER);

    control.campaign(2).await.expect("first call starts");
    assert_eq!(control.campaign(5).await, Ok(()), "second call is a no-op");
    control.abort().await;
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn simulated_backend_without_transactions_withholds_claim() {
    let (control, backend) = setup(SimulatedBackend::with_easy_params()).await;
    backend.add_rnode(MINER);
    // supports_transactions stays false.

    control.campaign(1).await.expect("campaign starts");
    let mut done = control.done_ch();
    done.wait_for(|finished| *finished).await.expect("campaign finishes");

    let (status, err) = control.status();
    assert_eq!(status, Status::Idle);
    assert_eq!(err, Some(AdmissionError::BackendUnavailable));
    assert!(backend.claims().is_empty());
    assert!(logs_contain("claim withheld"));

    // The proofs themselves still passed.
    assert!(control.results()["cpu"].success);
}

#[tokio::test(start_paused = true)]
async fn funding_is_idempotent_while_tx_outstanding() {
    let (control, backend) = setup(SimulatedBackend::with_easy_params()).await;
    backend.set_balance(MINER, 300_000 * dpor_admission::BASE_UNIT);
    backend.set_auto_mine(false);

    for _ in 0..5 {
        control.fund_for_rnode().await.expect("fund accepted");
    }
    assert_eq!(backend.joins().len(), 1, "exactly one join transaction");

    // The watcher gives up after the 30s bound (auto-advanced virtual
    // time), clearing the in-flight flag; the next call may submit again.
    tokio::time::sleep(Duration::from_secs(31)).await;
    control.fund_for_rnode().await.expect("fund accepted again");
    assert_eq!(backend.joins().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn funding_noops_once_member() {
    let (control, backend) = setup(SimulatedBackend::with_easy_params()).await;
    backend.set_balance(MINER, 300_000 * dpor_admission::BASE_UNIT);

    control.fund_for_rnode().await.expect("first fund submits");
    assert_eq!(backend.joins().len(), 1);

    // Auto-mined: the bond registered; let the watcher observe the receipt.
    tokio::time::sleep(Duration::from_secs(1)).await;
    control.fund_for_rnode().await.expect("member fund is a no-op");
    assert_eq!(backend.joins().len(), 1);
}

#[tokio::test]
async fn funding_requires_sufficient_balance() {
    let (control, backend) = setup(SimulatedBackend::with_easy_params()).await;
    backend.set_balance(MINER, 1_000);

    assert_eq!(
        control.fund_for_rnode().await,
        Err(AdmissionError::NotEnoughFunds)
    );
    assert!(backend.joins().is_empty());
}

#[tokio::test]
async fn funding_surfaces_locked_period() {
    let (control, backend) = setup(SimulatedBackend::with_easy_params()).await;
    backend.set_balance(MINER, 300_000 * dpor_admission::BASE_UNIT);
    backend.set_locked_period(true);

    assert_eq!(
        control.fund_for_rnode().await,
        Err(AdmissionError::LockedPeriod)
    );
}
