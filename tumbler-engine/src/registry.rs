//! The key-image registry, single source of truth for double-spend
//! prevention.

use std::collections::HashSet;
use std::sync::Arc;

use log::warn;
use tokio::sync::Mutex;

use tumbler_types::currency::Currency;

use crate::events::{EngineEvent, EventBus};
use crate::traits::Repository;
use crate::EngineError;

/// Engine-owned registry of used key images. Inserts are linearizable: the
/// in-memory set is consulted and updated inside one exclusive section that
/// also performs the persisted unique-constraint insert, so of two racing
/// inserts of the same image exactly one succeeds. Entries are permanent;
/// this table never evicts.
pub struct KeyImageRegistry {
    repository: Arc<dyn Repository>,
    events: EventBus,
    // The lock is deliberately held across the repository write; this is the
    // one permitted cross-await critical section in the engine.
    seen: Mutex<HashSet<(Currency, [u8; 32])>>,
}

impl KeyImageRegistry {
    pub fn new(repository: Arc<dyn Repository>, events: EventBus) -> Self {
        KeyImageRegistry {
            repository,
            events,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Record a key image. Returns `Err(DoubleSpend)` if it was ever
    /// recorded before; inserting the same image twice leaves the registry
    /// unchanged.
    pub async fn insert(&self, currency: Currency, image: &[u8; 32]) -> Result<(), EngineError> {
        let mut seen = self.seen.lock().await;
        if seen.contains(&(currency, *image)) {
            self.events.emit(EngineEvent::DoubleSpendRejected { key_image: *image });
            return Err(EngineError::DoubleSpend);
        }
        let fresh = self.repository.insert_key_image(currency, image).await?;
        if !fresh {
            // Another process got there first; mirror its insert locally.
            seen.insert((currency, *image));
            warn!("key image {} already persisted", hex::encode(&image[..8]));
            self.events.emit(EngineEvent::DoubleSpendRejected { key_image: *image });
            return Err(EngineError::DoubleSpend);
        }
        seen.insert((currency, *image));
        self.events.emit(EngineEvent::SignatureVerified { key_image: *image });
        Ok(())
    }

    /// Record a batch of key images, all or nothing, under one critical
    /// section. If any image was seen before (or the batch repeats one),
    /// nothing is recorded and `DoubleSpend` is returned; callers use this
    /// so that a transaction rejected on its Nth input does not burn the
    /// images of inputs 1..N-1.
    pub async fn insert_all(
        &self,
        currency: Currency,
        images: &[[u8; 32]],
    ) -> Result<(), EngineError> {
        let mut seen = self.seen.lock().await;

        // Full non-mutating pass first: the cache, the batch itself, then
        // the persisted store.
        let mut batch = HashSet::new();
        for image in images {
            if seen.contains(&(currency, *image)) || !batch.insert(*image) {
                self.events.emit(EngineEvent::DoubleSpendRejected { key_image: *image });
                return Err(EngineError::DoubleSpend);
            }
        }
        for image in images {
            if self.repository.contains_key_image(currency, image).await? {
                seen.insert((currency, *image));
                self.events.emit(EngineEvent::DoubleSpendRejected { key_image: *image });
                return Err(EngineError::DoubleSpend);
            }
        }

        // Only now mutate. The lock is still held, so no other in-process
        // insert can interleave; a cross-process race loses at the store's
        // unique constraint instead.
        for image in images {
            let fresh = self.repository.insert_key_image(currency, image).await?;
            if !fresh {
                seen.insert((currency, *image));
                warn!(
                    "key image {} raced in from another process mid-batch",
                    hex::encode(&image[..8])
                );
                self.events.emit(EngineEvent::DoubleSpendRejected { key_image: *image });
                return Err(EngineError::DoubleSpend);
            }
            seen.insert((currency, *image));
        }
        for image in images {
            self.events.emit(EngineEvent::SignatureVerified { key_image: *image });
        }
        Ok(())
    }

    /// Non-mutating check, for early rejection before expensive verification.
    pub async fn contains(&self, currency: Currency, image: &[u8; 32]) -> Result<bool, EngineError> {
        let seen = self.seen.lock().await;
        if seen.contains(&(currency, *image)) {
            return Ok(true);
        }
        drop(seen);
        // Fall through to the store for images inserted by other processes.
        self.repository.contains_key_image(currency, image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use std::sync::Arc;

    fn registry() -> Arc<KeyImageRegistry> {
        Arc::new(KeyImageRegistry::new(
            MemoryRepository::new(),
            EventBus::default(),
        ))
    }

    #[tokio::test]
    async fn test_insert_is_permanent() {
        let registry = registry();
        let image = [3u8; 32];
        registry.insert(Currency::Btc, &image).await.unwrap();
        assert!(registry.contains(Currency::Btc, &image).await.unwrap());
        assert_eq!(
            registry.insert(Currency::Btc, &image).await,
            Err(EngineError::DoubleSpend)
        );
        // The failed insert changed nothing.
        assert!(registry.contains(Currency::Btc, &image).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_all_is_all_or_nothing() {
        let registry = registry();
        registry.insert(Currency::Btc, &[1u8; 32]).await.unwrap();

        // One poisoned image rejects the whole batch...
        let batch = [[2u8; 32], [1u8; 32], [3u8; 32]];
        assert_eq!(
            registry.insert_all(Currency::Btc, &batch).await,
            Err(EngineError::DoubleSpend)
        );
        // ...and the innocent members stay unregistered.
        assert!(!registry.contains(Currency::Btc, &[2u8; 32]).await.unwrap());
        assert!(!registry.contains(Currency::Btc, &[3u8; 32]).await.unwrap());

        // An internally duplicated batch is also a double spend.
        assert_eq!(
            registry.insert_all(Currency::Btc, &[[4u8; 32], [4u8; 32]]).await,
            Err(EngineError::DoubleSpend)
        );
        assert!(!registry.contains(Currency::Btc, &[4u8; 32]).await.unwrap());

        // A clean batch lands whole.
        registry
            .insert_all(Currency::Btc, &[[2u8; 32], [3u8; 32]])
            .await
            .unwrap();
        assert!(registry.contains(Currency::Btc, &[2u8; 32]).await.unwrap());
        assert!(registry.contains(Currency::Btc, &[3u8; 32]).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_racing_inserts_linearize() {
        let registry = registry();
        let image = [9u8; 32];
        let a = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.insert(Currency::Btc, &image).await })
        };
        let b = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.insert(Currency::Btc, &image).await })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        // Exactly one side wins, the other sees the double spend.
        assert_eq!(
            ra.is_ok() as u8 + rb.is_ok() as u8,
            1,
            "results were {:?} and {:?}",
            ra,
            rb
        );
    }
}
