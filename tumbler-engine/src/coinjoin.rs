//! The CoinJoin session coordinator.
//!
//! An N-party equal-denomination pooling round. The coordinator learns which
//! inputs and which outputs exist but not which output belongs to which
//! participant: outputs arrive blinded, only their range proofs are checked,
//! and a CSPRNG shuffle fixes the final ordering before anyone signs.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use rand::rngs::OsRng;
use rand::RngCore;

use tumbler_crypto::commitment::PedersenGens;
use tumbler_crypto::curve::sha256;
use tumbler_crypto::range_proof::RangeProof;
use tumbler_crypto::signature as participant_sig;

use tumbler_types::amount::Amount;
use tumbler_types::coinjoin::{
    BlindedOutput, CoinJoinPhase, CoinJoinSession, Participant, ParticipantStatus, SessionFees,
    SessionInput, SessionOutput, SessionTransaction,
};
use tumbler_types::config::{BanConfig, CoinJoinConfig};
use tumbler_types::currency::Currency;
use tumbler_types::schedule::{OperationPayload, ScheduledOperation};
use tumbler_types::{ParticipantId, SessionId};

use crate::events::{EngineEvent, EventBus};
use crate::registry::KeyImageRegistry;
use crate::scheduler::{CancelToken, OperationExecutor, Scheduler};
use crate::traits::{BlockchainAdapter, Repository};
use crate::EngineError;

pub struct CoinJoinCoordinator {
    config: CoinJoinConfig,
    ban_config: BanConfig,
    repository: Arc<dyn Repository>,
    adapter: Arc<dyn BlockchainAdapter>,
    registry: Arc<KeyImageRegistry>,
    events: EventBus,
    gens: PedersenGens,
    sessions: tokio::sync::Mutex<HashMap<SessionId, CoinJoinSession>>,
    /// Ban expiry per `H(pubkey)`.
    bans: tokio::sync::Mutex<HashMap<ParticipantId, DateTime<Utc>>>,
    failure_counts: tokio::sync::Mutex<HashMap<ParticipantId, u32>>,
    /// Outstanding proof-of-funds challenges.
    challenges: tokio::sync::Mutex<HashMap<(SessionId, ParticipantId), [u8; 32]>>,
    /// Broadcast attempts per session.
    broadcast_attempts: tokio::sync::Mutex<HashMap<SessionId, u32>>,
}

impl CoinJoinCoordinator {
    pub fn new(
        config: CoinJoinConfig,
        ban_config: BanConfig,
        repository: Arc<dyn Repository>,
        adapter: Arc<dyn BlockchainAdapter>,
        registry: Arc<KeyImageRegistry>,
        events: EventBus,
    ) -> Self {
        CoinJoinCoordinator {
            config,
            ban_config,
            repository,
            adapter,
            registry,
            events,
            gens: PedersenGens::default(),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            bans: tokio::sync::Mutex::new(HashMap::new()),
            failure_counts: tokio::sync::Mutex::new(HashMap::new()),
            challenges: tokio::sync::Mutex::new(HashMap::new()),
            broadcast_attempts: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Open a session for the largest standard denomination not exceeding
    /// `amount`. Fails when no denomination fits.
    pub async fn create_session(
        &self,
        currency: Currency,
        amount: Amount,
        coordinator_pubkey: Vec<u8>,
    ) -> Result<SessionId, EngineError> {
        let denomination = currency
            .coinjoin_denominations()
            .iter()
            .rev()
            .copied()
            .find(|d| *d <= amount)
            .ok_or(EngineError::DenominationNotFound { currency, amount })?;

        let mut id_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut id_bytes);
        let id = SessionId(id_bytes);

        let now = Utc::now();
        let session = CoinJoinSession {
            id,
            currency,
            denomination,
            participants: HashMap::new(),
            coordinator_pubkey,
            phase: CoinJoinPhase::Registration,
            fees: SessionFees {
                coordinator: self.config.coordinator_fee_for(currency),
                network: self.config.network_fee_for(currency),
            },
            min_participants: self.config.min_participants,
            max_participants: self.config.max_participants,
            round: 1,
            transaction: None,
            phase_deadline: now + ChronoDuration::milliseconds(self.config.registration_timeout_ms as i64),
            last_join_at: now,
            blame_list: Vec::new(),
            created_at: now,
            completed_at: None,
        };
        self.repository.put_session(&session).await?;
        self.sessions.lock().await.insert(id, session);
        info!("coinjoin session opened: {} at denomination {}", currency, denomination);
        Ok(id)
    }

    /// Issue the fresh 32-byte challenge a joining participant must sign
    /// with each claimed input key.
    pub async fn registration_challenge(
        &self,
        session_id: SessionId,
        pubkey: &[u8],
    ) -> Result<[u8; 32], EngineError> {
        let participant_id = ParticipantId(*blake3::hash(pubkey).as_bytes());
        let mut challenge = [0u8; 32];
        OsRng.fill_bytes(&mut challenge);
        self.challenges
            .lock()
            .await
            .insert((session_id, participant_id), challenge);
        Ok(challenge)
    }

    /// Register a participant with proof of funds: one signature over the
    /// previously issued challenge per input, made with that input's key.
    pub async fn register_participant(
        &self,
        session_id: SessionId,
        inputs: Vec<SessionInput>,
        pubkey: Vec<u8>,
        input_proofs: Vec<Vec<u8>>,
    ) -> Result<ParticipantId, EngineError> {
        let participant_id = ParticipantId(*blake3::hash(&pubkey).as_bytes());

        if self.is_banned(&participant_id).await {
            return Err(EngineError::ParticipantBanned);
        }

        let challenge = self
            .challenges
            .lock()
            .await
            .remove(&(session_id, participant_id))
            .ok_or_else(|| EngineError::ProofFailure("no outstanding challenge".into()))?;

        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&session_id).ok_or(EngineError::SessionNotFound)?;

        if session.phase != CoinJoinPhase::Registration {
            return Err(EngineError::WrongPhase(session.phase.to_string()));
        }
        if session.is_full() {
            return Err(EngineError::SessionFull);
        }

        let required = session.denomination + session.fees.total();
        let funded: Amount = inputs.iter().map(|i| i.amount).sum();
        if funded < required {
            return Err(EngineError::ProofFailure(format!(
                "inputs {} below denomination plus fees {}",
                funded, required
            )));
        }

        if input_proofs.len() != inputs.len() {
            return Err(EngineError::ProofFailure("one proof per input required".into()));
        }
        for (input, proof) in inputs.iter().zip(&input_proofs) {
            let ok = participant_sig::verify(
                self.config.signature_algorithm,
                &input.public_key,
                &challenge,
                proof,
            );
            if !ok {
                return Err(EngineError::ProofFailure("proof of funds rejected".into()));
            }
        }

        let mut blinding = [0u8; 32];
        OsRng.fill_bytes(&mut blinding);

        let participant = Participant {
            id: participant_id,
            pubkey,
            inputs,
            outputs: Vec::new(),
            blinding_factor: blinding,
            commitments: Vec::new(),
            proofs: input_proofs,
            status: ParticipantStatus::Registered,
            joined_at: Utc::now(),
        };
        session.participants.insert(participant_id, participant);
        session.last_join_at = Utc::now();
        self.repository.put_session(session).await?;
        info!(
            "participant {} joined session ({} of {})",
            participant_id,
            session.participant_count(),
            session.max_participants
        );
        Ok(participant_id)
    }

    /// Register a participant's blinded outputs. Each must carry a valid
    /// range proof; the outputs stay blinded, the coordinator never learns
    /// the mapping.
    pub async fn register_outputs(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        outputs: Vec<BlindedOutput>,
    ) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&session_id).ok_or(EngineError::SessionNotFound)?;
        if session.phase != CoinJoinPhase::OutputRegistration {
            return Err(EngineError::WrongPhase(session.phase.to_string()));
        }
        if outputs.is_empty() {
            return Err(EngineError::ProofFailure("no outputs registered".into()));
        }

        for output in &outputs {
            let proof = RangeProof::from_bytes(&output.range_proof)?;
            proof.verify(&self.gens, &output.commitment)?;
        }

        let participant = session
            .participants
            .get_mut(&participant_id)
            .ok_or(EngineError::ParticipantNotFound)?;
        participant.commitments = outputs.iter().map(|o| o.commitment).collect();
        participant.outputs = outputs;
        participant.status = ParticipantStatus::Committed;

        if session.all_committed() {
            self.enter_signing(session).await?;
        } else {
            self.repository.put_session(session).await?;
        }
        Ok(())
    }

    /// Build the shuffled transaction and open the signing phase.
    async fn enter_signing(&self, session: &mut CoinJoinSession) -> Result<(), EngineError> {
        // Inputs in a canonical order so every party derives the same digest.
        let mut inputs: Vec<SessionInput> = session
            .participants
            .values()
            .flat_map(|p| p.inputs.iter().cloned())
            .collect();
        inputs.sort_by(|a, b| a.tx_id.cmp(&b.tx_id).then(a.output_index.cmp(&b.output_index)));

        // One equal-denomination output per registered blinded output.
        let mut outputs: Vec<SessionOutput> = session
            .participants
            .values()
            .flat_map(|p| p.outputs.iter())
            .map(|blinded| SessionOutput {
                address: blinded.address.clone(),
                amount: session.denomination,
                script: Vec::new(),
            })
            .collect();

        // The shuffle is the sole source of unlinkability between inputs and
        // outputs: Fisher-Yates, four fresh CSPRNG bytes per swap.
        for i in (1..outputs.len()).rev() {
            let mut buf = [0u8; 4];
            OsRng.fill_bytes(&mut buf);
            let j = (u32::from_le_bytes(buf) as usize) % (i + 1);
            outputs.swap(i, j);
        }

        let digest = transaction_digest(&inputs, &outputs);
        session.transaction = Some(SessionTransaction {
            inputs,
            outputs,
            digest,
            signatures: HashMap::new(),
            tx_hash: None,
        });
        self.advance(session, CoinJoinPhase::Signing).await?;
        self.set_deadline(session, self.config.signing_timeout_ms);
        self.repository.put_session(session).await
    }

    /// Accept a participant's input signatures over the session digest. An
    /// invalid signature blames and bans the participant and cancels the
    /// session.
    pub async fn sign_transaction(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        signatures: Vec<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&session_id).ok_or(EngineError::SessionNotFound)?;
        if session.phase != CoinJoinPhase::Signing {
            return Err(EngineError::WrongPhase(session.phase.to_string()));
        }
        let digest = session
            .transaction
            .as_ref()
            .map(|tx| tx.digest)
            .ok_or_else(|| EngineError::Internal("signing phase without transaction".into()))?;

        let participant = session
            .participants
            .get(&participant_id)
            .ok_or(EngineError::ParticipantNotFound)?;

        let valid = signatures.len() == participant.inputs.len()
            && participant.inputs.iter().zip(&signatures).all(|(input, sig)| {
                participant_sig::verify(
                    self.config.signature_algorithm,
                    &input.public_key,
                    &digest,
                    sig,
                )
            });

        if !valid {
            self.blame(session, participant_id, "invalid transaction signature").await;
            self.fail_session(session, "signature verification failed").await?;
            return Err(EngineError::ProofFailure("invalid transaction signature".into()));
        }

        let participant = session
            .participants
            .get_mut(&participant_id)
            .expect("participant checked above");
        participant.status = ParticipantStatus::Signed;
        session
            .transaction
            .as_mut()
            .expect("transaction present")
            .signatures
            .insert(participant_id, signatures);

        if session.all_signed() {
            // Register every input's key image before anything leaves the
            // coordinator. The batch lands all-or-nothing: a collision is a
            // double spend, nothing is broadcast, and the other inputs'
            // images are not burned by the failed round.
            let images: Vec<[u8; 32]> = session
                .participants
                .values()
                .flat_map(|p| p.inputs.iter().map(|i| i.key_image))
                .collect();
            if let Err(e) = self.registry.insert_all(session.currency, &images).await {
                self.fail_session(session, "double-spent input key image").await?;
                return Err(e);
            }
            self.advance(session, CoinJoinPhase::Broadcasting).await?;
            self.set_deadline(session, self.config.broadcast_timeout_ms);
        }
        self.repository.put_session(session).await
    }

    /// Drive a session forward: quiet-period and timeout handling plus
    /// broadcast attempts. Called by the scheduler's CoinJoin operation.
    pub async fn tick(&self, session_id: SessionId) -> Result<CoinJoinPhase, EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = match sessions.get_mut(&session_id) {
            Some(s) => s,
            None => return Err(EngineError::SessionNotFound),
        };
        let now = Utc::now();

        match session.phase {
            CoinJoinPhase::Registration => {
                let quiet = ChronoDuration::milliseconds(self.config.registration_quiet_period_ms as i64);
                if session.participant_count() >= session.min_participants
                    && now - session.last_join_at >= quiet
                {
                    self.advance(session, CoinJoinPhase::OutputRegistration).await?;
                    self.set_deadline(session, self.config.registration_timeout_ms);
                    self.repository.put_session(session).await?;
                } else if now >= session.phase_deadline {
                    self.fail_session(session, "registration timeout with too few participants")
                        .await?;
                }
            }
            CoinJoinPhase::OutputRegistration => {
                if now >= session.phase_deadline {
                    let laggards: Vec<ParticipantId> = session
                        .participants
                        .values()
                        .filter(|p| p.status == ParticipantStatus::Registered)
                        .map(|p| p.id)
                        .collect();
                    for id in laggards {
                        self.blame(session, id, "did not commit outputs").await;
                    }
                    self.fail_session(session, "output registration timeout").await?;
                }
            }
            CoinJoinPhase::Signing => {
                if now >= session.phase_deadline {
                    let laggards: Vec<ParticipantId> = session
                        .participants
                        .values()
                        .filter(|p| p.status != ParticipantStatus::Signed)
                        .map(|p| p.id)
                        .collect();
                    for id in laggards {
                        self.blame(session, id, "did not sign").await;
                    }
                    self.fail_session(session, "signing timeout").await?;
                }
            }
            CoinJoinPhase::Broadcasting => {
                self.try_broadcast(session).await?;
            }
            CoinJoinPhase::Completed | CoinJoinPhase::Failed => {}
        }
        Ok(session.phase)
    }

    async fn try_broadcast(&self, session: &mut CoinJoinSession) -> Result<(), EngineError> {
        let tx = session
            .transaction
            .as_ref()
            .ok_or_else(|| EngineError::Internal("broadcasting without transaction".into()))?;
        let raw = bincode::serialize(tx)
            .map_err(|e| EngineError::Internal(format!("serialize session tx: {}", e)))?;

        match self.adapter.broadcast(session.currency, &raw).await {
            Ok(tx_hash) => {
                if let Some(tx) = session.transaction.as_mut() {
                    tx.tx_hash = Some(tx_hash);
                }
                for participant in session.participants.values_mut() {
                    participant.status = ParticipantStatus::Confirmed;
                }
                session.completed_at = Some(Utc::now());
                self.advance(session, CoinJoinPhase::Completed).await?;
                self.broadcast_attempts.lock().await.remove(&session.id);
                self.repository.put_session(session).await?;
                info!("coinjoin session completed, {} participants", session.participant_count());
            }
            Err(e) => {
                let mut attempts = self.broadcast_attempts.lock().await;
                let count = attempts.entry(session.id).or_insert(0);
                *count += 1;
                let exhausted = *count >= self.config.max_broadcast_attempts;
                drop(attempts);
                warn!("coinjoin broadcast failed ({}), attempt capped: {}", e, exhausted);
                if exhausted {
                    self.fail_session(session, "broadcast retries exhausted").await?;
                }
            }
        }
        Ok(())
    }

    async fn advance(
        &self,
        session: &mut CoinJoinSession,
        to: CoinJoinPhase,
    ) -> Result<(), EngineError> {
        let from = session.phase;
        if !from.can_advance_to(to) {
            return Err(EngineError::Internal(format!(
                "illegal session transition {} -> {}",
                from, to
            )));
        }
        session.phase = to;
        self.events.emit(EngineEvent::SessionPhaseChanged {
            session: session.id,
            from,
            to,
        });
        Ok(())
    }

    fn set_deadline(&self, session: &mut CoinJoinSession, timeout_ms: u64) {
        session.phase_deadline = Utc::now() + ChronoDuration::milliseconds(timeout_ms as i64);
    }

    /// Cancel a session. Cancelled and timed-out sessions never broadcast.
    async fn fail_session(
        &self,
        session: &mut CoinJoinSession,
        reason: &str,
    ) -> Result<(), EngineError> {
        warn!("coinjoin session failed: {}", reason);
        for participant in session.participants.values_mut() {
            if participant.status != ParticipantStatus::Signed {
                participant.status = ParticipantStatus::Failed;
            }
        }
        session.completed_at = Some(Utc::now());
        self.advance(session, CoinJoinPhase::Failed).await?;
        self.repository.put_session(session).await
    }

    pub async fn cancel_session(&self, session_id: SessionId, reason: &str) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&session_id).ok_or(EngineError::SessionNotFound)?;
        if session.phase.is_terminal() {
            return Err(EngineError::WrongPhase(session.phase.to_string()));
        }
        self.fail_session(session, reason).await
    }

    /// Blame a participant and count the failure toward a ban. Proof
    /// failures ban immediately; see the configured threshold for the rest.
    async fn blame(&self, session: &mut CoinJoinSession, participant_id: ParticipantId, reason: &str) {
        if !session.blame_list.contains(&participant_id) {
            session.blame_list.push(participant_id);
        }
        if let Some(p) = session.participants.get_mut(&participant_id) {
            p.status = ParticipantStatus::Failed;
        }
        self.events.emit(EngineEvent::ParticipantBlamed {
            session: session.id,
            participant: participant_id,
        });

        let mut counts = self.failure_counts.lock().await;
        let count = counts.entry(participant_id).or_insert(0);
        *count += 1;
        let ban_now = reason.contains("signature") || *count >= self.ban_config.max_failed_attempts;
        drop(counts);
        if ban_now {
            // Banning on coordinator-observed failure alone is a griefing
            // vector; see the design notes.
            warn!("banning participant {}: {}", participant_id, reason);
            let until = Utc::now() + ChronoDuration::seconds(self.ban_config.ban_duration_secs as i64);
            self.bans.lock().await.insert(participant_id, until);
        }
    }

    pub async fn is_banned(&self, participant_id: &ParticipantId) -> bool {
        let bans = self.bans.lock().await;
        match bans.get(participant_id) {
            Some(until) => *until > Utc::now(),
            None => false,
        }
    }

    /// Drop expired bans and destroy terminal sessions past their grace
    /// period. Driven by the cleanup operation.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        self.bans.lock().await.retain(|_, until| *until > now);

        // Failure counts are only interesting while a ban could still
        // result; keep the table bounded.
        {
            let mut counts = self.failure_counts.lock().await;
            if counts.len() > 10_000 {
                let bans = self.bans.lock().await;
                counts.retain(|id, _| bans.contains_key(id));
            }
        }

        let grace = ChronoDuration::milliseconds(self.config.session_grace_period_ms as i64);
        let mut sessions = self.sessions.lock().await;
        let stale: Vec<SessionId> = sessions
            .values()
            .filter(|s| {
                s.phase.is_terminal()
                    && s.completed_at.map(|t| now - t >= grace).unwrap_or(true)
            })
            .map(|s| s.id)
            .collect();
        for id in &stale {
            sessions.remove(id);
            self.repository.remove_session(*id).await?;
            self.challenges.lock().await.retain(|(sid, _), _| sid != id);
        }
        Ok(stale.len())
    }

    /// Read-only session snapshot.
    pub async fn session(&self, session_id: SessionId) -> Option<CoinJoinSession> {
        self.sessions.lock().await.get(&session_id).cloned()
    }
}

/// Deterministic transaction digest: SHA-256 over every input
/// `(tx_id | output_index | amount_le)` then every output
/// `(address | amount_le | script)`, in order.
pub fn transaction_digest(inputs: &[SessionInput], outputs: &[SessionOutput]) -> [u8; 32] {
    let mut bytes = Vec::new();
    for input in inputs {
        bytes.extend_from_slice(&input.tx_id);
        bytes.extend_from_slice(&input.output_index.to_le_bytes());
        bytes.extend_from_slice(&input.amount.to_le_bytes());
    }
    for output in outputs {
        bytes.extend_from_slice(output.address.as_bytes());
        bytes.extend_from_slice(&output.amount.to_le_bytes());
        bytes.extend_from_slice(&output.script);
    }
    sha256(&bytes)
}

/// Scheduler executor driving session ticks. Live sessions reschedule their
/// own next tick; terminal sessions let the chain of operations end.
pub struct CoinJoinExecutor {
    pub coordinator: Arc<CoinJoinCoordinator>,
    pub scheduler: Weak<Scheduler>,
    /// Seconds between ticks of one session.
    pub tick_interval_secs: u64,
}

#[async_trait]
impl OperationExecutor for CoinJoinExecutor {
    async fn execute(&self, op: &ScheduledOperation, cancel: &CancelToken) -> Result<(), EngineError> {
        let session_id = match &op.payload {
            OperationPayload::Coinjoin { session_id } => *session_id,
            _ => return Err(EngineError::Internal("malformed coinjoin payload".into())),
        };
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let phase = self.coordinator.tick(session_id).await?;
        if !phase.is_terminal() {
            if let Some(scheduler) = self.scheduler.upgrade() {
                let next = ScheduledOperation::new(
                    OperationPayload::Coinjoin { session_id },
                    op.currency,
                    None,
                    Utc::now() + ChronoDuration::seconds(self.tick_interval_secs as i64),
                    op.priority,
                );
                scheduler.schedule(next).await?;
            }
        }
        Ok(())
    }
}
