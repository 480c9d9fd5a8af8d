//! End-to-end tests for the mixing engine against the in-memory
//! collaborators: full mix lifecycle, CoinJoin rounds, double-spend
//! prevention, and scheduler retry/rehydration behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use tumbler_crypto::commitment::PedersenGens;
use tumbler_crypto::curve::random_scalar;
use tumbler_crypto::keys::SpendKeyPair;
use tumbler_crypto::range_proof::RangeProof;
use tumbler_crypto::signature::{public_key_for, sign};
use tumbler_crypto::clsag;

use tumbler_types::coinjoin::{BlindedOutput, CoinJoinPhase, SessionInput};
use tumbler_types::config::{EngineConfig, SigAlgorithm};
use tumbler_types::currency::Currency;
use tumbler_types::mix::{AnonymityLevel, MixStatus, OutputSpec, OutputTxStatus};
use tumbler_types::schedule::{
    OperationKind, OperationPayload, OperationStatus, ScheduledOperation,
};
use tumbler_types::SessionId;

use tumbler_engine::coinjoin::CoinJoinCoordinator;
use tumbler_engine::events::EventBus;
use tumbler_engine::lifecycle::CreateMixRequest;
use tumbler_engine::memory::{MemoryChain, MemoryRepository, SoftSecretStore};
use tumbler_engine::registry::KeyImageRegistry;
use tumbler_engine::scheduler::{CancelToken, OperationExecutor, Scheduler};
use tumbler_engine::traits::{BlockchainAdapter, Repository};
use tumbler_engine::{EngineError, MixingEngine};

const BTC_ADDR_A: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
const BTC_ADDR_B: &str = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2";

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.schedule_check_interval_secs = 1;
    config.scheduler.execution_pump_interval_secs = 1;
    config.scheduler.min_delay_secs = 1;
    config.scheduler.max_jitter_secs = 0;
    config
        .scheduler
        .per_kind_caps
        .insert(OperationKind::Distribution, 1);
    config.coinjoin.registration_quiet_period_ms = 0;
    config
}

async fn wait_for<F, Fut>(what: &str, timeout_secs: u64, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

// ---------------------------------------------------------------------------
// Mix request lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_full_mix_flow_btc() {
    let repository = MemoryRepository::new();
    let chain = MemoryChain::new();
    let secrets = SoftSecretStore::new();
    let engine = MixingEngine::new(
        fast_config(),
        repository.clone(),
        chain.clone(),
        secrets,
    );
    engine.start().await.unwrap();

    let created = engine
        .lifecycle
        .create_mix_request(CreateMixRequest {
            currency: Currency::Btc,
            input_amount: 72_300_000, // 0.723 BTC
            output_addresses: vec![
                OutputSpec { address: BTC_ADDR_A.into(), percentage: 60.0 },
                OutputSpec { address: BTC_ADDR_B.into(), percentage: 40.0 },
            ],
            delay_window_secs: 0,
            anonymity_level: AnonymityLevel::Medium,
            mixing_rounds: 2,
            fee_percentage: None,
        })
        .await
        .unwrap();

    let request = repository
        .get_mix_request(created.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, MixStatus::PendingDeposit);
    assert_eq!(created.total_amount, 72_300_000 + 1_084_500); // 1.5% fee

    // Fund the one-time address at the confirmation threshold.
    chain
        .deposit(Currency::Btc, &created.deposit_address, "deposit-tx-1", created.total_amount, 3)
        .await;

    wait_for("mix request completion", 180, || {
        let repository = repository.clone();
        let id = created.id;
        async move {
            repository
                .get_mix_request(id)
                .await
                .unwrap()
                .map(|r| r.status == MixStatus::Completed)
                .unwrap_or(false)
        }
    })
    .await;

    // Every output chunk was dispatched and they sum to the net amount.
    let outputs = repository.output_txs_for(created.id).await.unwrap();
    assert!(!outputs.is_empty());
    for output in &outputs {
        assert_eq!(output.status, OutputTxStatus::Sent);
        assert!(output.tx_hash.is_some());
        assert!(output.amount >= Currency::Btc.dust_limit());
    }
    let distributed: u64 = outputs.iter().map(|o| o.amount).sum();
    assert_eq!(distributed, 72_300_000);

    // Deposited minus distributed equals the fee, exactly.
    let leftover = chain
        .get_balance(Currency::Btc, &created.deposit_address)
        .await
        .unwrap();
    assert_eq!(leftover, 1_084_500);

    // Funds only ever moved to the two requested destinations.
    for send in chain.sends().await {
        assert!(send.to == BTC_ADDR_A || send.to == BTC_ADDR_B);
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn test_mix_request_validation() {
    let engine = MixingEngine::new(
        fast_config(),
        MemoryRepository::new(),
        MemoryChain::new(),
        SoftSecretStore::new(),
    );

    let base = CreateMixRequest {
        currency: Currency::Btc,
        input_amount: 72_300_000,
        output_addresses: vec![OutputSpec { address: BTC_ADDR_A.into(), percentage: 100.0 }],
        delay_window_secs: 0,
        anonymity_level: AnonymityLevel::Low,
        mixing_rounds: 1,
        fee_percentage: None,
    };

    // A valid BTC address is rejected when the request says ETH.
    let mut wrong_chain = base.clone();
    wrong_chain.currency = Currency::Eth;
    wrong_chain.input_amount = 1_000_000_000;
    assert!(matches!(
        engine.lifecycle.create_mix_request(wrong_chain).await,
        Err(EngineError::Validation(_))
    ));

    // Percentage sums beyond the 0.01 tolerance are rejected.
    let mut bad_sum = base.clone();
    bad_sum.output_addresses = vec![
        OutputSpec { address: BTC_ADDR_A.into(), percentage: 60.0 },
        OutputSpec { address: BTC_ADDR_B.into(), percentage: 40.02 },
    ];
    assert!(matches!(
        engine.lifecycle.create_mix_request(bad_sum).await,
        Err(EngineError::Validation(_))
    ));

    // Below the currency minimum.
    let mut too_small = base.clone();
    too_small.input_amount = 50_000;
    assert!(matches!(
        engine.lifecycle.create_mix_request(too_small).await,
        Err(EngineError::Validation(_))
    ));

    // Mixing rounds outside 1..=10.
    let mut bad_rounds = base.clone();
    bad_rounds.mixing_rounds = 11;
    assert!(matches!(
        engine.lifecycle.create_mix_request(bad_rounds).await,
        Err(EngineError::Validation(_))
    ));

    // The base request itself is accepted.
    assert!(engine.lifecycle.create_mix_request(base).await.is_ok());
}

// ---------------------------------------------------------------------------
// Ring signatures against the registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_clsag_roundtrip_with_registry() {
    let repository = MemoryRepository::new();
    let registry = KeyImageRegistry::new(repository.clone(), EventBus::default());

    // Ring of 11 with the real key at index 7.
    let real = SpendKeyPair::generate();
    let mut ring: Vec<[u8; 32]> = (0..11).map(|_| SpendKeyPair::generate().public_bytes()).collect();
    ring[7] = real.public_bytes();

    let sig = clsag::sign(b"abc", &ring, &real.secret, None, 7).unwrap();
    clsag::verify(b"abc", &sig, &ring, None, 7).unwrap();
    registry
        .insert(Currency::Btc, &sig.key_image)
        .await
        .unwrap();

    // Tampering any scalar byte breaks the ring.
    let mut tampered = sig.clone();
    tampered.s[3][0] ^= 0x01;
    assert!(clsag::verify(b"abc", &tampered, &ring, None, 7).is_err());

    // Replaying the original signature now hits the registry.
    clsag::verify(b"abc", &sig, &ring, None, 7).unwrap();
    assert_eq!(
        registry.insert(Currency::Btc, &sig.key_image).await,
        Err(EngineError::DoubleSpend)
    );
}

// ---------------------------------------------------------------------------
// CoinJoin
// ---------------------------------------------------------------------------

struct TestParticipant {
    seed: [u8; 32],
    pubkey: Vec<u8>,
}

impl TestParticipant {
    fn new(tag: u8) -> Self {
        let seed = [tag; 32];
        let pubkey = public_key_for(SigAlgorithm::Schnorr, &seed).unwrap();
        TestParticipant { seed, pubkey }
    }

    fn input(&self, amount: u64, image_tag: u8) -> SessionInput {
        SessionInput {
            tx_id: [image_tag; 32],
            output_index: 0,
            amount,
            public_key: self.pubkey.clone(),
            key_image: [image_tag; 32],
        }
    }

    fn blinded_output(&self, denomination: u64, tag: u8) -> BlindedOutput {
        let gens = PedersenGens::default();
        let blinding = random_scalar();
        BlindedOutput {
            commitment: gens.commit_bytes(denomination, &blinding),
            range_proof: RangeProof::prove(&gens, denomination, &blinding).to_bytes(),
            address: format!("cjout{}", tag),
        }
    }
}

fn coordinator(repository: Arc<MemoryRepository>, chain: Arc<MemoryChain>) -> CoinJoinCoordinator {
    let config = fast_config();
    let events = EventBus::default();
    let registry = Arc::new(KeyImageRegistry::new(repository.clone(), events.clone()));
    CoinJoinCoordinator::new(
        config.coinjoin,
        config.ban,
        repository,
        chain,
        registry,
        events,
    )
}

/// Drive one session from registration through broadcast. Returns the
/// session id; image tags parametrize key images so tests can collide them.
async fn run_session_through_signing(
    coordinator: &CoinJoinCoordinator,
    participants: &[TestParticipant],
    image_tags: &[u8],
) -> Result<SessionId, EngineError> {
    let session_id = coordinator
        .create_session(Currency::Eth, 400_000_000, b"coordinator-pub".to_vec())
        .await?;
    let session = coordinator.session(session_id).await.unwrap();
    assert_eq!(session.denomination, 100_000_000); // 0.1 ETH
    let funded = session.denomination + session.fees.total();

    for (participant, tag) in participants.iter().zip(image_tags) {
        let challenge = coordinator
            .registration_challenge(session_id, &participant.pubkey)
            .await?;
        let proof = sign(SigAlgorithm::Schnorr, &participant.seed, &challenge).unwrap();
        coordinator
            .register_participant(
                session_id,
                vec![participant.input(funded, *tag)],
                participant.pubkey.clone(),
                vec![proof],
            )
            .await?;
    }

    // Quiet period is zero: one tick closes registration.
    assert_eq!(coordinator.tick(session_id).await?, CoinJoinPhase::OutputRegistration);

    for (i, participant) in participants.iter().enumerate() {
        let session = coordinator.session(session_id).await.unwrap();
        let id = tumbler_types::ParticipantId(*blake3::hash(&participant.pubkey).as_bytes());
        coordinator
            .register_outputs(
                session_id,
                id,
                vec![participant.blinded_output(session.denomination, i as u8)],
            )
            .await?;
    }

    let session = coordinator.session(session_id).await.unwrap();
    assert_eq!(session.phase, CoinJoinPhase::Signing);
    let digest = session.transaction.as_ref().unwrap().digest;

    for participant in participants {
        let id = tumbler_types::ParticipantId(*blake3::hash(&participant.pubkey).as_bytes());
        let signature = sign(SigAlgorithm::Schnorr, &participant.seed, &digest).unwrap();
        coordinator
            .sign_transaction(session_id, id, vec![signature])
            .await?;
    }
    Ok(session_id)
}

#[tokio::test]
async fn test_coinjoin_denomination_selection() {
    let coordinator = coordinator(MemoryRepository::new(), MemoryChain::new());

    // 0.4 ETH joins at the 0.1 denomination.
    let session_id = coordinator
        .create_session(Currency::Eth, 400_000_000, b"coord".to_vec())
        .await
        .unwrap();
    let session = coordinator.session(session_id).await.unwrap();
    assert_eq!(session.denomination, 100_000_000);

    // 0.05 ETH has no CoinJoin denomination underneath it.
    assert!(matches!(
        coordinator
            .create_session(Currency::Eth, 50_000_000, b"coord".to_vec())
            .await,
        Err(EngineError::DenominationNotFound { .. })
    ));
}

#[tokio::test]
async fn test_coinjoin_full_round() {
    let repository = MemoryRepository::new();
    let chain = MemoryChain::new();
    let coordinator = coordinator(repository.clone(), chain.clone());
    let participants: Vec<TestParticipant> = (1..=3).map(TestParticipant::new).collect();

    let session_id = run_session_through_signing(&coordinator, &participants, &[10, 11, 12])
        .await
        .unwrap();

    let session = coordinator.session(session_id).await.unwrap();
    assert_eq!(session.phase, CoinJoinPhase::Broadcasting);

    // Broadcast tick completes the session.
    assert_eq!(coordinator.tick(session_id).await.unwrap(), CoinJoinPhase::Completed);
    let broadcasts = chain.broadcasts().await;
    assert_eq!(broadcasts.len(), 1);

    let session = coordinator.session(session_id).await.unwrap();
    let tx = session.transaction.as_ref().unwrap();

    // The output list is a permutation of the registered addresses, every
    // output at the session denomination.
    let mut addresses: Vec<&str> = tx.outputs.iter().map(|o| o.address.as_str()).collect();
    addresses.sort_unstable();
    assert_eq!(addresses, vec!["cjout0", "cjout1", "cjout2"]);
    for output in &tx.outputs {
        assert_eq!(output.amount, session.denomination);
    }

    // Sum(in) = sum(out) + per-participant coordinator and network fees.
    let total_in: u64 = tx.inputs.iter().map(|i| i.amount).sum();
    let total_out: u64 = tx.outputs.iter().map(|o| o.amount).sum();
    assert_eq!(total_in, total_out + 3 * session.fees.total());
}

#[tokio::test]
async fn test_coinjoin_double_spend_across_sessions() {
    let repository = MemoryRepository::new();
    let chain = MemoryChain::new();
    // One coordinator, one registry: the registry is the cross-session
    // source of truth.
    let coordinator = coordinator(repository.clone(), chain.clone());

    let group_a: Vec<TestParticipant> = (1..=3).map(TestParticipant::new).collect();
    let group_b: Vec<TestParticipant> = (4..=6).map(TestParticipant::new).collect();

    // Session A reaches signing first and registers image 50.
    let session_a = run_session_through_signing(&coordinator, &group_a, &[50, 51, 52])
        .await
        .unwrap();
    assert_eq!(coordinator.tick(session_a).await.unwrap(), CoinJoinPhase::Completed);

    // Session B shares image 50 and must die at the verify step.
    let result = run_session_through_signing(&coordinator, &group_b, &[50, 61, 62]).await;
    assert_eq!(result.unwrap_err(), EngineError::DoubleSpend);

    // Only session A's transaction was ever broadcast.
    assert_eq!(chain.broadcasts().await.len(), 1);
}

#[tokio::test]
async fn test_cancelled_session_never_broadcasts() {
    let repository = MemoryRepository::new();
    let chain = MemoryChain::new();
    let coordinator = coordinator(repository.clone(), chain.clone());
    let participants: Vec<TestParticipant> = (1..=3).map(TestParticipant::new).collect();

    let session_id = run_session_through_signing(&coordinator, &participants, &[70, 71, 72])
        .await
        .unwrap();
    coordinator.cancel_session(session_id, "test cancel").await.unwrap();

    let session = coordinator.session(session_id).await.unwrap();
    assert_eq!(session.phase, CoinJoinPhase::Failed);

    // Ticks after cancellation are inert; nothing reaches the chain.
    coordinator.tick(session_id).await.unwrap();
    assert!(chain.broadcasts().await.is_empty());
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct FlakyExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl OperationExecutor for FlakyExecutor {
    async fn execute(&self, _op: &ScheduledOperation, _cancel: &CancelToken) -> Result<(), EngineError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(EngineError::Adapter("rpc connection reset".into()))
        } else {
            Ok(())
        }
    }
}

fn distribution_op() -> ScheduledOperation {
    ScheduledOperation::new(
        OperationPayload::Distribution { output_tx_id: uuid::Uuid::new_v4() },
        Some(Currency::Btc),
        None,
        Utc::now(),
        5,
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scheduler_retry_then_complete() {
    let repository = MemoryRepository::new();
    let config = fast_config().scheduler;
    let scheduler = Scheduler::new(config, repository.clone(), EventBus::default());
    scheduler.register_executor(
        OperationKind::Distribution,
        Arc::new(FlakyExecutor { calls: AtomicU32::new(0) }),
    );
    let tasks = scheduler.start();

    let id = scheduler.schedule(distribution_op()).await.unwrap();

    // The adapter fails once; the operation must land in retry_pending with
    // one recorded attempt, then complete on the second try.
    wait_for("operation completion after retry", 30, || {
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .get(id)
                .await
                .map(|op| op.status == OperationStatus::Completed)
                .unwrap_or(false)
        }
    })
    .await;

    let op = scheduler.get(id).await.unwrap();
    assert_eq!(op.retry_count, 1);
    assert!(op.retry_count <= fast_config().scheduler.max_retry_attempts);

    scheduler.shutdown();
    for task in tasks {
        let _ = task.await;
    }
}

#[tokio::test]
async fn test_scheduler_rehydration_preserves_live_operations() {
    let repository = MemoryRepository::new();
    let first = Scheduler::new(fast_config().scheduler, repository.clone(), EventBus::default());

    let mut expected = Vec::new();
    for _ in 0..3 {
        let mut op = distribution_op();
        op.scheduled_at = Utc::now() + chrono::Duration::hours(1);
        let id = first.schedule(op).await.unwrap();
        let stored = first.get(id).await.unwrap();
        expected.push((id, stored.scheduled_at));
    }
    // Terminal operations must not come back.
    let mut done = distribution_op();
    done.status = OperationStatus::Completed;
    repository.put_operation(&done).await.unwrap();

    // A new scheduler over the same store sees exactly the live set with
    // exact schedule times.
    let second = Scheduler::new(fast_config().scheduler, repository.clone(), EventBus::default());
    let count = second.rehydrate().await.unwrap();
    assert_eq!(count, 3);
    for (id, scheduled_at) in expected {
        let op = second.get(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Scheduled);
        assert_eq!(op.scheduled_at, scheduled_at);
    }
    assert!(second.get(done.id).await.is_none());
}

struct SlowExecutor;

#[async_trait]
impl OperationExecutor for SlowExecutor {
    async fn execute(&self, _op: &ScheduledOperation, cancel: &CancelToken) -> Result<(), EngineError> {
        for _ in 0..40 {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scheduler_cancellation_rules() {
    let repository = MemoryRepository::new();
    let scheduler = Scheduler::new(fast_config().scheduler, repository.clone(), EventBus::default());
    scheduler.register_executor(OperationKind::Distribution, Arc::new(SlowExecutor));

    // Pending operations cancel cleanly.
    let mut future_op = distribution_op();
    future_op.scheduled_at = Utc::now() + chrono::Duration::hours(1);
    let pending_id = scheduler.schedule(future_op).await.unwrap();
    scheduler.cancel(pending_id).await.unwrap();
    assert_eq!(
        scheduler.get(pending_id).await.unwrap().status,
        OperationStatus::Cancelled
    );

    // Executing operations refuse cancellation.
    let tasks = scheduler.start();
    let running_id = scheduler.schedule(distribution_op()).await.unwrap();
    wait_for("operation to start executing", 15, || {
        let scheduler = scheduler.clone();
        async move {
            scheduler
                .get(running_id)
                .await
                .map(|op| op.status == OperationStatus::Executing)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(scheduler.cancel(running_id).await.is_err());

    scheduler.shutdown();
    for task in tasks {
        let _ = task.await;
    }
}
