//! In-process [`SharedStore`].
//!
//! Behaves like the network store for a single process: string values and
//! sets share one keyspace, expiries are honoured lazily on access against the
//! injected clock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock, millis};
use crate::lock::{rw_read, rw_write};

use super::{SetOptions, SharedStore, StoreError};

const SOURCE: &str = "store::memory";

#[derive(Debug, Clone)]
enum Data {
    Text(String),
    Members(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    data: Data,
    expires_at: Option<u64>,
}

impl Slot {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    slots: RwLock<HashMap<String, Slot>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulates an outage: every command fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        rw_read(&self.slots, SOURCE, "len")
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store is offline"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_millis();
        let slots = rw_read(&self.slots, SOURCE, "get");
        match slots.get(key).filter(|slot| slot.is_live(now)) {
            None => Ok(None),
            Some(Slot {
                data: Data::Text(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::command("GET", "key holds a set")),
        }
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_millis();
        let mut slots = rw_write(&self.slots, SOURCE, "set");

        if options.only_if_absent && slots.get(key).is_some_and(|slot| slot.is_live(now)) {
            return Ok(false);
        }

        let expires_at = options
            .expiry
            .map(|expiry| now.saturating_add(millis(expiry)));
        slots.insert(
            key.to_string(),
            Slot {
                data: Data::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_millis();
        let mut slots = rw_write(&self.slots, SOURCE, "del");
        let removed = keys
            .iter()
            .filter_map(|key| slots.remove(key))
            .filter(|slot| slot.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_millis();
        let mut slots = rw_write(&self.slots, SOURCE, "sadd");

        if slots.get(set).is_some_and(|slot| !slot.is_live(now)) {
            slots.remove(set);
        }

        let slot = slots.entry(set.to_string()).or_insert_with(|| Slot {
            data: Data::Members(BTreeSet::new()),
            expires_at: None,
        });
        match &mut slot.data {
            Data::Members(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            Data::Text(_) => Err(StoreError::command("SADD", "key holds a string")),
        }
    }

    async fn extend_expiry(&self, key: &str, expiry: Duration) -> Result<(), StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_millis();
        let until = now.saturating_add(millis(expiry));
        let mut slots = rw_write(&self.slots, SOURCE, "extend_expiry");
        if let Some(slot) = slots.get_mut(key).filter(|slot| slot.is_live(now)) {
            slot.expires_at = Some(slot.expires_at.map_or(until, |at| at.max(until)));
        }
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_millis();
        let slots = rw_read(&self.slots, SOURCE, "smembers");
        match slots.get(set).filter(|slot| slot.is_live(now)) {
            None => Ok(Vec::new()),
            Some(Slot {
                data: Data::Members(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::command("SMEMBERS", "key holds a string")),
        }
    }
}
