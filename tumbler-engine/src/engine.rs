//! Engine assembly.
//!
//! One [`MixingEngine`] per process owns the registry, pool, coordinator,
//! lifecycle manager, and scheduler; its lifetime spans startup to shutdown.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use log::info;
use tokio::task::JoinHandle;

use tumbler_types::config::EngineConfig;
use tumbler_types::currency::Currency;
use tumbler_types::schedule::{OperationKind, OperationPayload, ScheduledOperation};
use tumbler_types::SessionId;

use crate::coinjoin::{CoinJoinCoordinator, CoinJoinExecutor};
use crate::events::EventBus;
use crate::lifecycle::{DistributionExecutor, MixRequestManager};
use crate::pool::{ConsolidationExecutor, PoolManager, RebalancingExecutor};
use crate::registry::KeyImageRegistry;
use crate::ring_tx::RingTransactionBuilder;
use crate::scheduler::{CancelToken, OperationExecutor, Scheduler};
use crate::traits::{BlockchainAdapter, Repository, SecretStore};
use crate::EngineError;

pub struct MixingEngine {
    pub config: EngineConfig,
    pub repository: Arc<dyn Repository>,
    pub events: EventBus,
    pub registry: Arc<KeyImageRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<PoolManager>,
    pub coinjoin: Arc<CoinJoinCoordinator>,
    pub lifecycle: Arc<MixRequestManager>,
    pub ring_builder: Arc<RingTransactionBuilder>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MixingEngine {
    /// Wire the engine from its injected collaborators and register every
    /// operation executor with the scheduler.
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        adapter: Arc<dyn BlockchainAdapter>,
        secrets: Arc<dyn SecretStore>,
    ) -> Arc<Self> {
        let events = EventBus::default();
        let registry = Arc::new(KeyImageRegistry::new(Arc::clone(&repository), events.clone()));
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            Arc::clone(&repository),
            events.clone(),
        );
        let pool = Arc::new(PoolManager::new(Arc::clone(&repository), Arc::clone(&adapter)));
        let coinjoin = Arc::new(CoinJoinCoordinator::new(
            config.coinjoin.clone(),
            config.ban.clone(),
            Arc::clone(&repository),
            Arc::clone(&adapter),
            Arc::clone(&registry),
            events.clone(),
        ));
        let lifecycle = Arc::new(MixRequestManager::new(
            config.clone(),
            Arc::clone(&repository),
            Arc::clone(&secrets),
            Arc::clone(&adapter),
            Arc::clone(&pool),
            Arc::clone(&scheduler),
            events.clone(),
        ));
        let ring_builder = Arc::new(RingTransactionBuilder::new(
            config.ring.clone(),
            Arc::clone(&repository),
            Arc::clone(&adapter),
            Arc::clone(&registry),
        ));

        scheduler.register_executor(
            OperationKind::Distribution,
            Arc::new(DistributionExecutor {
                config: config.clone(),
                repository: Arc::clone(&repository),
                adapter: Arc::clone(&adapter),
                pool: Arc::clone(&pool),
                scheduler: Arc::downgrade(&scheduler),
                events: events.clone(),
            }),
        );
        scheduler.register_executor(
            OperationKind::Coinjoin,
            Arc::new(CoinJoinExecutor {
                coordinator: Arc::clone(&coinjoin),
                scheduler: Arc::downgrade(&scheduler),
                tick_interval_secs: 5,
            }),
        );
        scheduler.register_executor(
            OperationKind::Consolidation,
            Arc::new(ConsolidationExecutor { pool: Arc::clone(&pool) }),
        );
        scheduler.register_executor(
            OperationKind::Rebalancing,
            Arc::new(RebalancingExecutor { pool: Arc::clone(&pool) }),
        );
        scheduler.register_executor(
            OperationKind::Cleanup,
            Arc::new(CleanupExecutor {
                repository: Arc::clone(&repository),
                lifecycle: Arc::clone(&lifecycle),
                coinjoin: Arc::clone(&coinjoin),
                scheduler: Arc::downgrade(&scheduler),
                interval_secs: config.scheduler.cleanup_interval_secs,
            }),
        );

        Arc::new(MixingEngine {
            config,
            repository,
            events,
            registry,
            scheduler,
            pool,
            coinjoin,
            lifecycle,
            ring_builder,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Rehydrate persisted operations, start the scheduler timers, and seed
    /// the recurring cleanup operation.
    pub async fn start(&self) -> Result<(), EngineError> {
        let rehydrated = self.scheduler.rehydrate().await?;
        let handles = self.scheduler.start();
        self.tasks.lock().await.extend(handles);

        let cleanup = ScheduledOperation::new(
            OperationPayload::Cleanup,
            None,
            None,
            Utc::now() + ChronoDuration::seconds(self.config.scheduler.cleanup_interval_secs as i64),
            9,
        );
        self.scheduler.schedule(cleanup).await?;

        info!("mixing engine started ({} operations rehydrated)", rehydrated);
        Ok(())
    }

    /// Open a CoinJoin session and arm its tick operation.
    pub async fn open_coinjoin_session(
        &self,
        currency: Currency,
        amount: u64,
        coordinator_pubkey: Vec<u8>,
    ) -> Result<SessionId, EngineError> {
        let session_id = self
            .coinjoin
            .create_session(currency, amount, coordinator_pubkey)
            .await?;
        let tick = ScheduledOperation::new(
            OperationPayload::Coinjoin { session_id },
            Some(currency),
            None,
            Utc::now(),
            2,
        );
        self.scheduler.schedule(tick).await?;
        Ok(session_id)
    }

    /// Status of a mix request, looked up by the client's secret session id.
    /// Terminal statuses carry no further detail across this boundary.
    pub async fn status_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<tumbler_types::mix::MixStatus>, EngineError> {
        Ok(self
            .repository
            .get_mix_request_by_session(session_id)
            .await?
            .map(|r| r.status))
    }

    /// Cooperative shutdown: stop the timers and let in-flight operations
    /// finish their current step.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("mixing engine stopped");
    }
}

/// Hourly housekeeping: expire overdue mix requests, destroy terminal
/// CoinJoin sessions past their grace period, drop expired bans. The
/// scheduler's own sweep handles stale operations.
pub struct CleanupExecutor {
    pub repository: Arc<dyn Repository>,
    pub lifecycle: Arc<MixRequestManager>,
    pub coinjoin: Arc<CoinJoinCoordinator>,
    pub scheduler: Weak<Scheduler>,
    pub interval_secs: u64,
}

#[async_trait]
impl OperationExecutor for CleanupExecutor {
    async fn execute(&self, op: &ScheduledOperation, cancel: &CancelToken) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let active = self.repository.list_active_mix_requests().await?;
        let expired = self.lifecycle.expire_due(&active).await?;
        let swept = self.coinjoin.sweep().await?;
        if expired > 0 || swept > 0 {
            info!("cleanup: {} requests expired, {} sessions swept", expired, swept);
        }

        if let Some(scheduler) = self.scheduler.upgrade() {
            let next = ScheduledOperation::new(
                OperationPayload::Cleanup,
                None,
                None,
                Utc::now() + ChronoDuration::seconds(self.interval_secs as i64),
                op.priority,
            );
            scheduler.schedule(next).await?;
        }
        Ok(())
    }
}
