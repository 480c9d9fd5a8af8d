//! Mix-request lifecycle: intake, deposit detection, plan execution.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use rand::RngCore;
use uuid::Uuid;

use tumbler_types::amount::Amount;
use tumbler_types::config::EngineConfig;
use tumbler_types::currency::Currency;
use tumbler_types::mix::{
    percentages_sum_ok, AnonymityLevel, DepositAddress, MixRequest, MixStatus, OutputSpec,
    OutputTransaction, OutputTxStatus,
};
use tumbler_types::pool::PoolType;
use tumbler_types::schedule::{OperationPayload, ScheduledOperation};
use tumbler_types::{MixRequestId, SessionId, ValidationError};

use crate::events::{EngineEvent, EventBus};
use crate::plan::generate_plan;
use crate::pool::PoolManager;
use crate::scheduler::{CancelToken, OperationExecutor, Scheduler};
use crate::traits::{BlockchainAdapter, Repository, SecretStore};
use crate::validate::AddressValidator;
use crate::EngineError;

/// Input to [`MixRequestManager::create_mix_request`].
#[derive(Debug, Clone)]
pub struct CreateMixRequest {
    pub currency: Currency,
    pub input_amount: Amount,
    pub output_addresses: Vec<OutputSpec>,
    pub delay_window_secs: u64,
    pub anonymity_level: AnonymityLevel,
    pub mixing_rounds: u8,
    /// Defaults to the configured fee when absent.
    pub fee_percentage: Option<f64>,
}

/// What the caller gets back: the id, the deposit address to fund, and the
/// secret session id used to query progress.
#[derive(Debug, Clone)]
pub struct CreatedMix {
    pub id: MixRequestId,
    pub deposit_address: String,
    pub session_id: SessionId,
    /// Gross amount the deposit address must receive (input plus fee).
    pub total_amount: Amount,
}

pub struct MixRequestManager {
    config: EngineConfig,
    repository: Arc<dyn Repository>,
    secrets: Arc<dyn SecretStore>,
    adapter: Arc<dyn BlockchainAdapter>,
    pool: Arc<PoolManager>,
    scheduler: Arc<Scheduler>,
    validator: AddressValidator,
    events: EventBus,
}

impl MixRequestManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        secrets: Arc<dyn SecretStore>,
        adapter: Arc<dyn BlockchainAdapter>,
        pool: Arc<PoolManager>,
        scheduler: Arc<Scheduler>,
        events: EventBus,
    ) -> Self {
        MixRequestManager {
            config,
            repository,
            secrets,
            adapter,
            pool,
            scheduler,
            validator: AddressValidator::new(),
            events,
        }
    }

    /// Validate a request, allocate its one-time deposit address, and
    /// persist it in `pending_deposit`.
    pub async fn create_mix_request(
        self: &Arc<Self>,
        input: CreateMixRequest,
    ) -> Result<CreatedMix, EngineError> {
        self.validate(&input)?;

        // Address generation failure is terminal for the request; there is
        // nothing to retry against a refusing secret store.
        let (deposit_address, key_handle) = self.secrets.generate_key(input.currency).await?;

        let mut session_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut session_bytes);
        let session_id = SessionId(session_bytes);

        let now = Utc::now();
        let request = MixRequest {
            id: MixRequestId::generate(),
            currency: input.currency,
            input_amount: input.input_amount,
            output_addresses: input.output_addresses,
            delay_window_secs: input.delay_window_secs,
            anonymity_level: input.anonymity_level,
            mixing_rounds: input.mixing_rounds,
            fee_percentage: input
                .fee_percentage
                .unwrap_or(self.config.mix.fee_percentage),
            session_id,
            deposit_address: deposit_address.clone(),
            status: MixStatus::PendingDeposit,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(self.config.mix.request_ttl_secs as i64),
            completed_at: None,
        };

        self.repository.put_mix_request(&request).await?;
        self.repository
            .put_deposit_address(&DepositAddress {
                address: deposit_address.clone(),
                key_handle,
                currency: input.currency,
                mix_request_id: request.id,
                used: false,
                expires_at: now
                    + ChronoDuration::seconds(self.config.mix.deposit_address_ttl_secs as i64),
            })
            .await?;

        self.spawn_deposit_watcher(request.currency, deposit_address.clone())
            .await;

        info!("created mix request {} for {}", request.id, request.currency);
        Ok(CreatedMix {
            id: request.id,
            deposit_address,
            session_id,
            total_amount: request.total_amount(),
        })
    }

    fn validate(&self, input: &CreateMixRequest) -> Result<(), EngineError> {
        let currency = input.currency;
        if input.output_addresses.is_empty() {
            return Err(ValidationError::NoOutputs.into());
        }
        for output in &input.output_addresses {
            self.validator.check(currency, &output.address)?;
        }
        if !percentages_sum_ok(&input.output_addresses) {
            let sum = input.output_addresses.iter().map(|o| o.percentage).sum();
            return Err(ValidationError::PercentageSum(sum).into());
        }
        if input.input_amount < currency.min_amount() {
            return Err(ValidationError::AmountBelowMinimum {
                currency,
                amount: input.input_amount,
                minimum: currency.min_amount(),
            }
            .into());
        }
        if input.input_amount > currency.max_amount() {
            return Err(ValidationError::AmountAboveMaximum {
                currency,
                amount: input.input_amount,
                maximum: currency.max_amount(),
            }
            .into());
        }
        if input.delay_window_secs > self.config.scheduler.max_delay_secs {
            return Err(ValidationError::DelayOutOfRange {
                requested: input.delay_window_secs,
                maximum: self.config.scheduler.max_delay_secs,
            }
            .into());
        }
        if !(1..=10).contains(&input.mixing_rounds) {
            return Err(ValidationError::MixingRounds(input.mixing_rounds).into());
        }
        Ok(())
    }

    /// Forward deposits from the chain adapter's subscription into
    /// [`Self::on_deposit_observed`]. The subscription is established before
    /// this returns; only the forwarding loop runs in the background.
    async fn spawn_deposit_watcher(self: &Arc<Self>, currency: Currency, address: String) {
        let mut stream = match self.adapter.subscribe_address(currency, &address).await {
            Ok(stream) => stream,
            Err(e) => {
                // Deposit detection is the chain collaborator's job and it
                // retries on its side; a failed subscription is not fatal
                // for the request.
                warn!("deposit subscription for {} failed: {}", address, e);
                return;
            }
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if let Err(e) = manager
                    .on_deposit_observed(&event.address, &event.tx_hash, event.amount, event.confirmations)
                    .await
                {
                    warn!("deposit handling for {} failed: {}", address, e);
                }
            }
        });
    }

    /// Handle an observed deposit. Idempotent in `(address, tx_hash)`: a
    /// duplicate notification changes nothing, but later notifications of
    /// the same transaction still advance confirmation-gated transitions.
    pub async fn on_deposit_observed(
        &self,
        address: &str,
        tx_hash: &str,
        amount: Amount,
        confirmations: u32,
    ) -> Result<(), EngineError> {
        let mut deposit = self
            .repository
            .get_deposit_address(address)
            .await?
            .ok_or(EngineError::RequestNotFound)?;
        let mut request = self
            .repository
            .get_mix_request(deposit.mix_request_id)
            .await?
            .ok_or(EngineError::RequestNotFound)?;

        if request.status.is_terminal() {
            return Ok(());
        }

        let first_sighting = self.repository.record_deposit_seen(address, tx_hash).await?;
        if first_sighting {
            deposit.used = true;
            self.repository.put_deposit_address(&deposit).await?;
            if request.status == MixStatus::PendingDeposit {
                self.transition(&mut request, MixStatus::DepositReceived).await?;
            }
            self.events.emit(EngineEvent::DepositObserved {
                id: request.id,
                tx_hash: tx_hash.to_string(),
                amount,
                confirmations,
            });
        }

        let threshold = request.currency.confirmation_threshold();
        if request.status == MixStatus::DepositReceived
            && confirmations >= threshold
            && amount >= request.total_amount()
        {
            self.transition(&mut request, MixStatus::Processing).await?;
            self.commit_plan(&mut request, &deposit).await?;
        }
        Ok(())
    }

    /// Build the mixing plan, pool the deposit, persist the chunked output
    /// transactions, and hand their dispatch to the scheduler.
    async fn commit_plan(
        &self,
        request: &mut MixRequest,
        deposit: &DepositAddress,
    ) -> Result<(), EngineError> {
        // Deterministic seed: the plan is reproducible for a given request.
        let seed = u64::from_le_bytes(request.session_id.0[..8].try_into().expect("32 >= 8"));
        let plan = generate_plan(request, seed)?;

        let pool_type = match request.anonymity_level {
            AnonymityLevel::Low => PoolType::Express,
            AnonymityLevel::Medium => PoolType::Standard,
            AnonymityLevel::High => PoolType::Premium,
        };
        self.pool
            .add_entry(
                request.currency,
                request.input_amount,
                request.id,
                deposit.address.clone(),
                deposit.key_handle.clone(),
                priority_for(request.anonymity_level),
                pool_type,
                self.config.scheduler.operation_ttl_secs,
            )
            .await?;

        let now = Utc::now();
        for chunk in &plan.chunks {
            let scheduled_at = now + ChronoDuration::seconds(chunk.delay_secs as i64);
            let output = OutputTransaction {
                id: Uuid::new_v4(),
                mix_request_id: request.id,
                amount: chunk.amount,
                from_address: None,
                to_address: chunk.to_address.clone(),
                scheduled_at,
                status: OutputTxStatus::Scheduled,
                retry_count: 0,
                priority: priority_for(request.anonymity_level),
                required_confirmations: request.currency.confirmation_threshold(),
                confirmations: 0,
                tx_hash: None,
            };
            self.repository.put_output_tx(&output).await?;

            let op = ScheduledOperation::new(
                OperationPayload::Distribution { output_tx_id: output.id },
                Some(request.currency),
                Some(request.id),
                scheduled_at,
                output.priority,
            );
            self.scheduler.schedule(op).await?;
        }

        self.transition(request, MixStatus::Mixing).await?;
        info!(
            "committed plan for {}: {} chunks, fee {}",
            request.id,
            plan.chunks.len(),
            plan.fee
        );
        Ok(())
    }

    /// Cancel a request. Only allowed before the plan is committed.
    pub async fn cancel(&self, id: MixRequestId, reason: &str) -> Result<(), EngineError> {
        let mut request = self
            .repository
            .get_mix_request(id)
            .await?
            .ok_or(EngineError::RequestNotFound)?;
        match request.status {
            MixStatus::PendingDeposit | MixStatus::DepositReceived => {
                warn!("cancelling mix request {}: {}", id, reason);
                self.transition(&mut request, MixStatus::Failed).await
            }
            other => Err(EngineError::WrongStatus(other.to_string(), "cancelled".into())),
        }
    }

    /// Expire overdue requests; driven by the cleanup operation.
    pub async fn expire_due(&self, ids: &[MixRequestId]) -> Result<usize, EngineError> {
        let now = Utc::now();
        let mut expired = 0;
        for id in ids {
            if let Some(mut request) = self.repository.get_mix_request(*id).await? {
                if !request.status.is_terminal() && request.expires_at < now {
                    self.transition(&mut request, MixStatus::Expired).await?;
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }

    async fn transition(&self, request: &mut MixRequest, to: MixStatus) -> Result<(), EngineError> {
        set_status(&self.repository, &self.events, request, to).await
    }
}

fn priority_for(level: AnonymityLevel) -> u8 {
    match level {
        AnonymityLevel::High => 3,
        AnonymityLevel::Medium => 5,
        AnonymityLevel::Low => 7,
    }
}

/// Dispatches one chunked payout from pooled liquidity.
pub struct DistributionExecutor {
    pub config: EngineConfig,
    pub repository: Arc<dyn Repository>,
    pub adapter: Arc<dyn BlockchainAdapter>,
    pub pool: Arc<PoolManager>,
    pub scheduler: std::sync::Weak<Scheduler>,
    pub events: EventBus,
}

#[async_trait]
impl OperationExecutor for DistributionExecutor {
    async fn execute(&self, op: &ScheduledOperation, cancel: &CancelToken) -> Result<(), EngineError> {
        let output_tx_id = match &op.payload {
            OperationPayload::Distribution { output_tx_id } => *output_tx_id,
            _ => return Err(EngineError::Internal("malformed distribution payload".into())),
        };

        let mut output = self
            .repository
            .get_output_tx(output_tx_id)
            .await?
            .ok_or_else(|| EngineError::Internal("distribution without output tx".into()))?;
        if output.status.is_terminal() || output.status == OutputTxStatus::Sent {
            return Ok(());
        }
        let mut request = self
            .repository
            .get_mix_request(output.mix_request_id)
            .await?
            .ok_or(EngineError::RequestNotFound)?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let sources = self
            .pool
            .select_distribution_sources(request.currency, output.amount, op)
            .await?;

        output.status = OutputTxStatus::Broadcasting;
        self.repository.put_output_tx(&output).await?;

        let mut remaining = output.amount;
        let mut last_hash = None;
        for (index, entry) in sources.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let portion = entry.amount.min(remaining);
            match self
                .adapter
                .send(
                    request.currency,
                    &entry.source_address,
                    &output.to_address,
                    portion,
                    &entry.key_handle,
                )
                .await
            {
                Ok(tx_hash) => {
                    remaining -= portion;
                    output.from_address = Some(entry.source_address.clone());
                    last_hash = Some(tx_hash);
                }
                Err(e) => {
                    // Nothing from this entry moved; give it and every
                    // untouched entry back to the pool.
                    self.pool.return_liquidity(&sources[index..]).await?;
                    let sent = output.amount - remaining;
                    if sent == 0 {
                        // Clean failure: the whole chunk retries.
                        output.retry_count += 1;
                        output.status =
                            if op.retry_count >= self.config.scheduler.max_retry_attempts {
                                OutputTxStatus::Failed
                            } else {
                                OutputTxStatus::Scheduled
                            };
                        self.repository.put_output_tx(&output).await?;
                        return Err(e);
                    }
                    // Partial dispatch: shrink this chunk to what actually
                    // moved and split the remainder into its own chunk, so
                    // amounts stay conserved and nothing is paid twice.
                    warn!(
                        "distribution {} partially sent ({} of {}), splitting remainder",
                        output.id, sent, output.amount
                    );
                    output.amount = sent;
                    output.status = OutputTxStatus::Sent;
                    output.tx_hash = last_hash.clone();
                    self.repository.put_output_tx(&output).await?;

                    let remainder = OutputTransaction {
                        id: Uuid::new_v4(),
                        amount: remaining,
                        status: OutputTxStatus::Scheduled,
                        retry_count: output.retry_count + 1,
                        tx_hash: None,
                        from_address: None,
                        scheduled_at: Utc::now()
                            + ChronoDuration::seconds(self.config.scheduler.min_delay_secs as i64),
                        ..output.clone()
                    };
                    self.repository.put_output_tx(&remainder).await?;
                    let follow_up = ScheduledOperation::new(
                        OperationPayload::Distribution { output_tx_id: remainder.id },
                        Some(request.currency),
                        Some(request.id),
                        remainder.scheduled_at,
                        remainder.priority,
                    );
                    match self.scheduler.upgrade() {
                        Some(scheduler) => {
                            scheduler.schedule(follow_up).await?;
                        }
                        None => {
                            // Shutting down; the operation is persisted and
                            // rehydrates on the next start.
                            self.repository.put_operation(&follow_up).await?;
                        }
                    }
                    // The dispatched part stands; the remainder is its own
                    // operation, so this one is done.
                    return Ok(());
                }
            }
        }

        output.status = OutputTxStatus::Sent;
        output.tx_hash = last_hash.clone();
        self.repository.put_output_tx(&output).await?;
        if let Some(tx_hash) = last_hash {
            self.events.emit(EngineEvent::OutputTxSent { mix: request.id, tx_hash });
        }

        // First dispatched chunk moves the request into `sending`; the last
        // one completes it. Individual retries never regress the aggregate.
        let outputs = self.repository.output_txs_for(request.id).await?;
        let all_done = outputs
            .iter()
            .all(|o| matches!(o.status, OutputTxStatus::Sent | OutputTxStatus::Confirmed));
        if request.status == MixStatus::Mixing {
            set_status(&self.repository, &self.events, &mut request, MixStatus::Sending).await?;
        }
        if all_done && request.status == MixStatus::Sending {
            set_status(&self.repository, &self.events, &mut request, MixStatus::Completed).await?;
            info!("mix request {} completed", request.id);
        }
        Ok(())
    }
}

async fn set_status(
    repository: &Arc<dyn Repository>,
    events: &EventBus,
    request: &mut MixRequest,
    to: MixStatus,
) -> Result<(), EngineError> {
    let from = request.status;
    if !from.can_transition_to(to) {
        return Err(EngineError::Internal(format!(
            "illegal mix transition {} -> {}",
            from, to
        )));
    }
    request.status = to;
    if to.is_terminal() {
        request.completed_at = Some(Utc::now());
    }
    repository.put_mix_request(request).await?;
    events.emit(EngineEvent::MixStatusChanged { id: request.id, from, to });
    Ok(())
}
