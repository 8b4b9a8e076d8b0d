use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{SharedStore, UpdateFn};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process store for tests and single-instance deployments.
/// Uses tokio's clock so paused-time tests see expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.lock().await.values().filter(|s| s.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Live keys with the given prefix, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .slots
            .lock()
            .await
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && s.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

fn live_value<'a>(slots: &'a HashMap<String, Slot>, key: &str, now: Instant) -> Option<&'a [u8]> {
    slots
        .get(key)
        .filter(|s| s.is_live(now))
        .map(|s| s.value.as_slice())
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let slots = self.slots.lock().await;
        Ok(live_value(&slots, key, Instant::now()).map(<[u8]>::to_vec))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().await;
        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();
        if live_value(&slots, key, now).is_some() {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: owner.as_bytes().to_vec(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) && slot.value == owner.as_bytes() => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut slots = self.slots.lock().await;
        if live_value(&slots, key, Instant::now()) == Some(owner.as_bytes()) {
            slots.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn publish_and_release(
        &self,
        entry_key: &str,
        value: &[u8],
        ttl: Duration,
        lease_key: &str,
        owner: &str,
    ) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();
        slots.insert(
            entry_key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at: Some(now + ttl),
            },
        );
        if live_value(&slots, lease_key, now) == Some(owner.as_bytes()) {
            slots.remove(lease_key);
        }
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        apply: &UpdateFn<'_>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();
        let current = live_value(&slots, key, now).map(<[u8]>::to_vec);
        if let Some(value) = apply(current.as_deref())? {
            slots.insert(
                key.to_string(),
                Slot {
                    value,
                    expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
                },
            );
        }
        Ok(current)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live(now));
        Ok((before - slots.len()) as u64)
    }
}
