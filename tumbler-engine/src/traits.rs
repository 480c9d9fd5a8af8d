//! Contracts of the engine's external collaborators.
//!
//! The engine depends only on these narrow interfaces; concrete blockchain
//! adapters, the relational store, and the Vault/HSM client live outside the
//! core and are injected at construction time.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use tumbler_types::amount::Amount;
use tumbler_types::coinjoin::CoinJoinSession;
use tumbler_types::currency::Currency;
use tumbler_types::mix::{DepositAddress, MixRequest, OutputTransaction};
use tumbler_types::pool::PoolEntry;
use tumbler_types::ring::RingKey;
use tumbler_types::schedule::{OperationStatus, ScheduledOperation};
use tumbler_types::{Hash, KeyHandle, MixRequestId, OperationId, SessionId};

use crate::EngineError;

/// A deposit notification from a watched address.
#[derive(Debug, Clone)]
pub struct DepositEvent {
    pub address: String,
    pub tx_hash: String,
    pub amount: Amount,
    pub confirmations: u32,
}

/// One unspent output as the chain reports it.
#[derive(Debug, Clone)]
pub struct UtxoInfo {
    pub amount: Amount,
    pub spent: bool,
}

/// Per-currency blockchain access.
#[async_trait]
pub trait BlockchainAdapter: Send + Sync {
    async fn get_balance(&self, currency: Currency, address: &str) -> Result<Amount, EngineError>;

    async fn get_utxo(
        &self,
        currency: Currency,
        tx_id: &Hash,
        output_index: u32,
    ) -> Result<Option<UtxoInfo>, EngineError>;

    /// Broadcast a raw transaction, returning its hash.
    async fn broadcast(&self, currency: Currency, raw_tx: &[u8]) -> Result<String, EngineError>;

    /// Build, sign (by handle), and broadcast a simple transfer.
    async fn send(
        &self,
        currency: Currency,
        from: &str,
        to: &str,
        amount: Amount,
        key: &KeyHandle,
    ) -> Result<String, EngineError>;

    /// Stream of deposits observed at an address.
    async fn subscribe_address(
        &self,
        currency: Currency,
        address: &str,
    ) -> Result<mpsc::Receiver<DepositEvent>, EngineError>;

    async fn block_height(&self, currency: Currency) -> Result<u64, EngineError>;
}

/// Vault/HSM facade. Key material never crosses this boundary; the engine
/// holds handles and asks for signatures and key images by handle.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Generate a fresh key for `currency`, returning its address and handle.
    async fn generate_key(&self, currency: Currency) -> Result<(String, KeyHandle), EngineError>;

    async fn sign_digest(&self, key: &KeyHandle, digest: &[u8; 32]) -> Result<Vec<u8>, EngineError>;

    /// Compute the key image `x * H_p(P)` for a vaulted spend key.
    async fn compute_key_image(&self, key: &KeyHandle) -> Result<[u8; 32], EngineError>;
}

/// Typed persistence for every engine entity. Implementations must enforce
/// uniqueness on `session_id`, `deposit_address`, `tx_hash`, and
/// `(currency, key_image)`.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn put_mix_request(&self, request: &MixRequest) -> Result<(), EngineError>;
    async fn get_mix_request(&self, id: MixRequestId) -> Result<Option<MixRequest>, EngineError>;
    /// Ids of every request not yet in a terminal state.
    async fn list_active_mix_requests(&self) -> Result<Vec<MixRequestId>, EngineError>;
    /// Lookup by the client-held secret session id.
    async fn get_mix_request_by_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<MixRequest>, EngineError>;

    async fn put_deposit_address(&self, address: &DepositAddress) -> Result<(), EngineError>;
    async fn get_deposit_address(&self, address: &str) -> Result<Option<DepositAddress>, EngineError>;

    async fn put_output_tx(&self, tx: &OutputTransaction) -> Result<(), EngineError>;
    async fn get_output_tx(&self, id: Uuid) -> Result<Option<OutputTransaction>, EngineError>;
    async fn output_txs_for(&self, id: MixRequestId) -> Result<Vec<OutputTransaction>, EngineError>;

    /// Record that `(address, tx_hash)` was observed. Returns `false` when
    /// the pair was already recorded, making deposit handling idempotent.
    async fn record_deposit_seen(&self, address: &str, tx_hash: &str) -> Result<bool, EngineError>;

    /// Insert into the persistent key-image registry. Returns `false` when
    /// the image is already present. Must be linearizable: of two racing
    /// inserts of the same image, exactly one returns `true`.
    async fn insert_key_image(&self, currency: Currency, image: &[u8; 32]) -> Result<bool, EngineError>;

    async fn contains_key_image(&self, currency: Currency, image: &[u8; 32]) -> Result<bool, EngineError>;

    async fn put_operation(&self, op: &ScheduledOperation) -> Result<(), EngineError>;
    async fn get_operation(&self, id: OperationId) -> Result<Option<ScheduledOperation>, EngineError>;
    /// Operations in any of `statuses`, scheduled after `min_scheduled_at`.
    async fn load_operations(
        &self,
        statuses: &[OperationStatus],
        min_scheduled_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ScheduledOperation>, EngineError>;

    async fn put_pool_entry(&self, entry: &PoolEntry) -> Result<(), EngineError>;
    async fn pool_entries(&self, currency: Currency) -> Result<Vec<PoolEntry>, EngineError>;
    /// Mark entries used and persist the operation that consumed them, in
    /// one transaction. No entry may be double-selected.
    async fn mark_pool_entries_used(
        &self,
        ids: &[Uuid],
        op: &ScheduledOperation,
    ) -> Result<(), EngineError>;

    async fn put_session(&self, session: &CoinJoinSession) -> Result<(), EngineError>;
    async fn get_session(&self, id: SessionId) -> Result<Option<CoinJoinSession>, EngineError>;
    async fn remove_session(&self, id: SessionId) -> Result<(), EngineError>;

    /// Prior on-chain outputs usable as ring decoys, within an age window
    /// given in absolute block heights.
    async fn decoy_candidates(
        &self,
        currency: Currency,
        min_height: u64,
        max_height: u64,
    ) -> Result<Vec<RingKey>, EngineError>;
}
