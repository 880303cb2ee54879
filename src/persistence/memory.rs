//! In-memory state store and cache (for testing or ephemeral use)

use crate::core::error::StoreError;
use crate::persistence::{
    ItemWrite, Precondition, StateCache, StateStore, StoreKey, StoreResult, StoredItem,
    WriteOutcome,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// In-memory durable store double
///
/// Writes are serialized by the lock, so the conditional check and the write are atomic
/// just like a conditional put against a real backend.
pub struct InMemoryStateStore {
    items: RwLock<BTreeMap<(String, String), StoredItem>>,
    available: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; every call fails with [`StoreError::Unavailable`] until restored
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }

    /// Number of items held
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_item(&self, key: &StoreKey) -> StoreResult<Option<StoredItem>> {
        self.check_available()?;
        let items = self.items.read().await;
        Ok(items.get(&(key.pk(), key.sk())).cloned())
    }

    async fn put_item_conditional(
        &self,
        key: &StoreKey,
        precondition: Precondition,
        item: ItemWrite,
    ) -> StoreResult<WriteOutcome> {
        self.check_available()?;
        let mut items = self.items.write().await;
        let slot = (key.pk(), key.sk());
        let current = items.get(&slot);

        if !precondition.holds(current) {
            return Ok(WriteOutcome::conflict_with(current));
        }

        let version = current.map(|i| i.version).unwrap_or(0) + 1;
        items.insert(
            slot,
            StoredItem {
                pk: key.pk(),
                sk: key.sk(),
                status: item.status,
                version,
                body: item.body,
            },
        );

        Ok(WriteOutcome::Committed { version })
    }

    async fn query_by_partition(&self, pk: &str) -> StoreResult<Vec<StoredItem>> {
        self.check_available()?;
        let items = self.items.read().await;
        Ok(items
            .iter()
            .filter(|((item_pk, _), _)| item_pk == pk)
            .map(|(_, item)| item.clone())
            .collect())
    }
}

/// In-memory TTL cache
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    available: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a cache outage; reads, writes and invalidations fail until restored
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory cache offline".to_string()))
        }
    }

    /// Whether a live entry exists for `key`
    pub async fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StateCache for InMemoryCache {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, ttl: Duration, value: String) -> StoreResult<()> {
        self.check_available()?;
        let expires = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}
