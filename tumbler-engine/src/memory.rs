//! In-memory collaborator implementations.
//!
//! Back the engine in tests and in a node run without real backends: a
//! hash-map repository with the production uniqueness constraints, a
//! scriptable chain adapter, and a process-local secret store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use tumbler_crypto::curve::point_to_bytes;
use tumbler_crypto::keys::spend_pair_from_seed;
use tumbler_crypto::signature as soft_sig;

use tumbler_types::amount::Amount;
use tumbler_types::coinjoin::CoinJoinSession;
use tumbler_types::config::SigAlgorithm;
use tumbler_types::currency::Currency;
use tumbler_types::mix::{DepositAddress, MixRequest, OutputTransaction};
use tumbler_types::pool::PoolEntry;
use tumbler_types::ring::RingKey;
use tumbler_types::schedule::{OperationStatus, ScheduledOperation};
use tumbler_types::{Hash, KeyHandle, MixRequestId, OperationId, SessionId};

use crate::traits::{BlockchainAdapter, DepositEvent, Repository, SecretStore, UtxoInfo};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepoState {
    mix_requests: HashMap<MixRequestId, MixRequest>,
    mix_session_ids: HashMap<SessionId, MixRequestId>,
    deposit_addresses: HashMap<String, DepositAddress>,
    output_txs: HashMap<Uuid, OutputTransaction>,
    deposits_seen: HashSet<(String, String)>,
    key_images: HashSet<(Currency, [u8; 32])>,
    operations: HashMap<OperationId, ScheduledOperation>,
    pool: HashMap<Uuid, PoolEntry>,
    sessions: HashMap<SessionId, CoinJoinSession>,
    decoys: HashMap<Currency, Vec<RingKey>>,
}

/// Hash-map repository enforcing the production uniqueness constraints
/// (session ids, deposit addresses, tx hashes, key images).
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<RepoState>,
}

impl MemoryRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryRepository::default())
    }

    /// Seed the decoy database with prior on-chain outputs.
    pub async fn add_decoy_candidates(&self, currency: Currency, keys: Vec<RingKey>) {
        self.state
            .lock()
            .await
            .decoys
            .entry(currency)
            .or_default()
            .extend(keys);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn put_mix_request(&self, request: &MixRequest) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if let Some(owner) = state.mix_session_ids.get(&request.session_id) {
            if *owner != request.id {
                return Err(EngineError::Repository("duplicate session_id".into()));
            }
        }
        state.mix_session_ids.insert(request.session_id, request.id);
        state.mix_requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_mix_request(&self, id: MixRequestId) -> Result<Option<MixRequest>, EngineError> {
        Ok(self.state.lock().await.mix_requests.get(&id).cloned())
    }

    async fn get_mix_request_by_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<MixRequest>, EngineError> {
        let state = self.state.lock().await;
        Ok(state
            .mix_session_ids
            .get(&session_id)
            .and_then(|id| state.mix_requests.get(id))
            .cloned())
    }

    async fn list_active_mix_requests(&self) -> Result<Vec<MixRequestId>, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .mix_requests
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id)
            .collect())
    }

    async fn put_deposit_address(&self, address: &DepositAddress) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.deposit_addresses.get(&address.address) {
            if existing.mix_request_id != address.mix_request_id {
                return Err(EngineError::Repository("duplicate deposit address".into()));
            }
        }
        state
            .deposit_addresses
            .insert(address.address.clone(), address.clone());
        Ok(())
    }

    async fn get_deposit_address(&self, address: &str) -> Result<Option<DepositAddress>, EngineError> {
        Ok(self.state.lock().await.deposit_addresses.get(address).cloned())
    }

    async fn put_output_tx(&self, tx: &OutputTransaction) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if let Some(hash) = &tx.tx_hash {
            let clash = state
                .output_txs
                .values()
                .any(|other| other.id != tx.id && other.tx_hash.as_ref() == Some(hash));
            if clash {
                return Err(EngineError::Repository("duplicate tx_hash".into()));
            }
        }
        state.output_txs.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get_output_tx(&self, id: Uuid) -> Result<Option<OutputTransaction>, EngineError> {
        Ok(self.state.lock().await.output_txs.get(&id).cloned())
    }

    async fn output_txs_for(&self, id: MixRequestId) -> Result<Vec<OutputTransaction>, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .output_txs
            .values()
            .filter(|tx| tx.mix_request_id == id)
            .cloned()
            .collect())
    }

    async fn record_deposit_seen(&self, address: &str, tx_hash: &str) -> Result<bool, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .deposits_seen
            .insert((address.to_string(), tx_hash.to_string())))
    }

    async fn insert_key_image(&self, currency: Currency, image: &[u8; 32]) -> Result<bool, EngineError> {
        Ok(self.state.lock().await.key_images.insert((currency, *image)))
    }

    async fn contains_key_image(&self, currency: Currency, image: &[u8; 32]) -> Result<bool, EngineError> {
        Ok(self.state.lock().await.key_images.contains(&(currency, *image)))
    }

    async fn put_operation(&self, op: &ScheduledOperation) -> Result<(), EngineError> {
        self.state.lock().await.operations.insert(op.id, op.clone());
        Ok(())
    }

    async fn get_operation(&self, id: OperationId) -> Result<Option<ScheduledOperation>, EngineError> {
        Ok(self.state.lock().await.operations.get(&id).cloned())
    }

    async fn load_operations(
        &self,
        statuses: &[OperationStatus],
        min_scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<ScheduledOperation>, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .operations
            .values()
            .filter(|op| statuses.contains(&op.status) && op.scheduled_at > min_scheduled_at)
            .cloned()
            .collect())
    }

    async fn put_pool_entry(&self, entry: &PoolEntry) -> Result<(), EngineError> {
        self.state.lock().await.pool.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn pool_entries(&self, currency: Currency) -> Result<Vec<PoolEntry>, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .pool
            .values()
            .filter(|e| e.currency == currency)
            .cloned()
            .collect())
    }

    async fn mark_pool_entries_used(
        &self,
        ids: &[Uuid],
        op: &ScheduledOperation,
    ) -> Result<(), EngineError> {
        // One lock covers both writes, which is what makes the pair atomic.
        let mut state = self.state.lock().await;
        for id in ids {
            match state.pool.get(id) {
                Some(entry) if !entry.used => {}
                Some(_) => return Err(EngineError::Repository("pool entry already used".into())),
                None => return Err(EngineError::Repository("unknown pool entry".into())),
            }
        }
        for id in ids {
            if let Some(entry) = state.pool.get_mut(id) {
                entry.used = true;
            }
        }
        state.operations.insert(op.id, op.clone());
        Ok(())
    }

    async fn put_session(&self, session: &CoinJoinSession) -> Result<(), EngineError> {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<CoinJoinSession>, EngineError> {
        Ok(self.state.lock().await.sessions.get(&id).cloned())
    }

    async fn remove_session(&self, id: SessionId) -> Result<(), EngineError> {
        self.state.lock().await.sessions.remove(&id);
        Ok(())
    }

    async fn decoy_candidates(
        &self,
        currency: Currency,
        min_height: u64,
        max_height: u64,
    ) -> Result<Vec<RingKey>, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .decoys
            .get(&currency)
            .map(|keys| {
                keys.iter()
                    .filter(|k| {
                        k.metadata.block_height >= min_height && k.metadata.block_height <= max_height
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Blockchain adapter
// ---------------------------------------------------------------------------

/// One transfer executed through [`MemoryChain::send`].
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub currency: Currency,
    pub from: String,
    pub to: String,
    pub amount: Amount,
    pub key: KeyHandle,
    pub tx_hash: String,
}

#[derive(Default)]
struct ChainState {
    balances: HashMap<(Currency, String), Amount>,
    utxos: HashMap<(Currency, Hash, u32), UtxoInfo>,
    broadcasts: Vec<(Currency, Vec<u8>, String)>,
    sends: Vec<SendRecord>,
    subscriptions: HashMap<String, Vec<mpsc::Sender<DepositEvent>>>,
    heights: HashMap<Currency, u64>,
    fail_sends: u32,
    fail_broadcasts: u32,
}

/// Scriptable chain double: tests feed deposits and failures, the engine
/// sees a normal adapter.
#[derive(Default)]
pub struct MemoryChain {
    state: Mutex<ChainState>,
}

impl MemoryChain {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryChain::default())
    }

    pub async fn set_height(&self, currency: Currency, height: u64) {
        self.state.lock().await.heights.insert(currency, height);
    }

    pub async fn credit(&self, currency: Currency, address: &str, amount: Amount) {
        *self
            .state
            .lock()
            .await
            .balances
            .entry((currency, address.to_string()))
            .or_insert(0) += amount;
    }

    pub async fn add_utxo(&self, currency: Currency, tx_id: Hash, index: u32, info: UtxoInfo) {
        self.state.lock().await.utxos.insert((currency, tx_id, index), info);
    }

    /// Make the next `n` sends fail with an adapter error.
    pub async fn fail_next_sends(&self, n: u32) {
        self.state.lock().await.fail_sends = n;
    }

    pub async fn fail_next_broadcasts(&self, n: u32) {
        self.state.lock().await.fail_broadcasts = n;
    }

    /// Deliver a deposit to every subscriber of `address`.
    pub async fn deposit(
        &self,
        currency: Currency,
        address: &str,
        tx_hash: &str,
        amount: Amount,
        confirmations: u32,
    ) {
        let event = DepositEvent {
            address: address.to_string(),
            tx_hash: tx_hash.to_string(),
            amount,
            confirmations,
        };
        let senders = {
            let mut state = self.state.lock().await;
            *state
                .balances
                .entry((currency, address.to_string()))
                .or_insert(0) += amount;
            state.subscriptions.get(address).cloned().unwrap_or_default()
        };
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }

    pub async fn sends(&self) -> Vec<SendRecord> {
        self.state.lock().await.sends.clone()
    }

    pub async fn broadcasts(&self) -> Vec<(Currency, Vec<u8>, String)> {
        self.state.lock().await.broadcasts.clone()
    }
}

#[async_trait]
impl BlockchainAdapter for MemoryChain {
    async fn get_balance(&self, currency: Currency, address: &str) -> Result<Amount, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .balances
            .get(&(currency, address.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn get_utxo(
        &self,
        currency: Currency,
        tx_id: &Hash,
        output_index: u32,
    ) -> Result<Option<UtxoInfo>, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .utxos
            .get(&(currency, *tx_id, output_index))
            .cloned())
    }

    async fn broadcast(&self, currency: Currency, raw_tx: &[u8]) -> Result<String, EngineError> {
        let mut state = self.state.lock().await;
        if state.fail_broadcasts > 0 {
            state.fail_broadcasts -= 1;
            return Err(EngineError::Adapter("broadcast refused".into()));
        }
        let tx_hash = hex::encode(blake3::hash(raw_tx).as_bytes());
        state.broadcasts.push((currency, raw_tx.to_vec(), tx_hash.clone()));
        Ok(tx_hash)
    }

    async fn send(
        &self,
        currency: Currency,
        from: &str,
        to: &str,
        amount: Amount,
        key: &KeyHandle,
    ) -> Result<String, EngineError> {
        let mut state = self.state.lock().await;
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(EngineError::Adapter("send refused".into()));
        }
        let mut preimage = Vec::new();
        preimage.extend_from_slice(from.as_bytes());
        preimage.extend_from_slice(to.as_bytes());
        preimage.extend_from_slice(&amount.to_le_bytes());
        preimage.extend_from_slice(&(state.sends.len() as u64).to_le_bytes());
        let tx_hash = hex::encode(blake3::hash(&preimage).as_bytes());

        let balance = state.balances.entry((currency, from.to_string())).or_insert(0);
        *balance = balance.saturating_sub(amount);
        *state.balances.entry((currency, to.to_string())).or_insert(0) += amount;
        state.sends.push(SendRecord {
            currency,
            from: from.to_string(),
            to: to.to_string(),
            amount,
            key: key.clone(),
            tx_hash: tx_hash.clone(),
        });
        Ok(tx_hash)
    }

    async fn subscribe_address(
        &self,
        _currency: Currency,
        address: &str,
    ) -> Result<mpsc::Receiver<DepositEvent>, EngineError> {
        let (tx, rx) = mpsc::channel(16);
        self.state
            .lock()
            .await
            .subscriptions
            .entry(address.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn block_height(&self, currency: Currency) -> Result<u64, EngineError> {
        Ok(self
            .state
            .lock()
            .await
            .heights
            .get(&currency)
            .copied()
            .unwrap_or(100_000))
    }
}

// ---------------------------------------------------------------------------
// Secret store
// ---------------------------------------------------------------------------

struct StoredKey {
    seed: [u8; 32],
}

/// Process-local secret store: keys live behind handles, callers only ever
/// see addresses, signatures, and key images.
pub struct SoftSecretStore {
    keys: Mutex<HashMap<String, StoredKey>>,
    counter: AtomicU64,
}

impl SoftSecretStore {
    pub fn new() -> Arc<Self> {
        Arc::new(SoftSecretStore {
            keys: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl SecretStore for SoftSecretStore {
    async fn generate_key(&self, currency: Currency) -> Result<(String, KeyHandle), EngineError> {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let pair = spend_pair_from_seed(&seed)?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = format!("{}-key-{}", currency.ticker().to_lowercase(), n);
        let address = format!(
            "dep{}",
            &hex::encode(point_to_bytes(&pair.public))[..40]
        );
        self.keys
            .lock()
            .await
            .insert(handle.clone(), StoredKey { seed });
        Ok((address, KeyHandle(handle)))
    }

    async fn sign_digest(&self, key: &KeyHandle, digest: &[u8; 32]) -> Result<Vec<u8>, EngineError> {
        let keys = self.keys.lock().await;
        let stored = keys
            .get(&key.0)
            .ok_or_else(|| EngineError::Adapter(format!("unknown key handle {}", key)))?;
        Ok(soft_sig::sign(SigAlgorithm::Schnorr, &stored.seed, digest)?)
    }

    async fn compute_key_image(&self, key: &KeyHandle) -> Result<[u8; 32], EngineError> {
        let keys = self.keys.lock().await;
        let stored = keys
            .get(&key.0)
            .ok_or_else(|| EngineError::Adapter(format!("unknown key handle {}", key)))?;
        let pair = spend_pair_from_seed(&stored.seed)?;
        Ok(point_to_bytes(&pair.key_image()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_image_registry_uniqueness() {
        let repo = MemoryRepository::new();
        let image = [5u8; 32];
        assert!(repo.insert_key_image(Currency::Btc, &image).await.unwrap());
        assert!(!repo.insert_key_image(Currency::Btc, &image).await.unwrap());
        // Same image under a different currency is a distinct constraint key.
        assert!(repo.insert_key_image(Currency::Ltc, &image).await.unwrap());
        assert!(repo.contains_key_image(Currency::Btc, &image).await.unwrap());
    }

    #[tokio::test]
    async fn test_deposit_seen_idempotency() {
        let repo = MemoryRepository::new();
        assert!(repo.record_deposit_seen("addr", "tx1").await.unwrap());
        assert!(!repo.record_deposit_seen("addr", "tx1").await.unwrap());
        assert!(repo.record_deposit_seen("addr", "tx2").await.unwrap());
    }

    #[tokio::test]
    async fn test_secret_store_signs_and_images() {
        let store = SoftSecretStore::new();
        let (address, handle) = store.generate_key(Currency::Btc).await.unwrap();
        assert!(address.starts_with("dep"));
        let sig = store.sign_digest(&handle, &[9u8; 32]).await.unwrap();
        assert_eq!(sig.len(), 64);
        let image_a = store.compute_key_image(&handle).await.unwrap();
        let image_b = store.compute_key_image(&handle).await.unwrap();
        assert_eq!(image_a, image_b);
    }

    #[tokio::test]
    async fn test_memory_chain_send_and_deposit() {
        let chain = MemoryChain::new();
        chain.credit(Currency::Btc, "a", 1_000).await;
        let hash = chain
            .send(Currency::Btc, "a", "b", 400, &KeyHandle("k".into()))
            .await
            .unwrap();
        assert!(!hash.is_empty());
        assert_eq!(chain.get_balance(Currency::Btc, "a").await.unwrap(), 600);
        assert_eq!(chain.get_balance(Currency::Btc, "b").await.unwrap(), 400);

        chain.fail_next_sends(1).await;
        let err = chain
            .send(Currency::Btc, "a", "b", 1, &KeyHandle("k".into()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
