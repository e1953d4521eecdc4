use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::QuotaError;

/// Serialization key for check-and-consume: one quota counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub plan_id: String,
    pub customer_id: String,
    pub metric_name: String,
}

impl LockKey {
    pub fn new(plan_id: &str, customer_id: &str, metric_name: &str) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            customer_id: customer_id.to_string(),
            metric_name: metric_name.to_string(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.plan_id, self.customer_id, self.metric_name)
    }
}

/// Table of per-key async mutexes. Slots are created on demand and dropped
/// again once nobody holds or waits on them.
#[derive(Default)]
pub struct KeyLocks {
    slots: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every key, in sorted order so overlapping batches cannot
    /// deadlock. The whole acquisition shares one deadline.
    pub async fn acquire<I>(
        self: &Arc<Self>,
        keys: I,
        wait: Duration,
    ) -> Result<KeyLockGuard, QuotaError>
    where
        I: IntoIterator<Item = LockKey>,
    {
        let keys: BTreeSet<LockKey> = keys.into_iter().collect();
        let deadline = Instant::now() + wait;
        let mut guard = KeyLockGuard {
            locks: Arc::clone(self),
            held: Vec::with_capacity(keys.len()),
        };

        for key in keys {
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();

            match timeout_at(deadline, slot.lock_owned()).await {
                Ok(held) => guard.held.push((key, held)),
                Err(_) => {
                    debug!(key = %key, "quota lock acquisition timed out");
                    return Err(QuotaError::ContentionTimeout {
                        key: key.to_string(),
                        waited_ms: Some(wait.as_millis() as u64),
                    });
                }
            }
        }

        Ok(guard)
    }

    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }

    fn release(&self, key: &LockKey) {
        self.slots
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

pub struct KeyLockGuard {
    locks: Arc<KeyLocks>,
    held: Vec<(LockKey, OwnedMutexGuard<()>)>,
}

impl KeyLockGuard {
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        for (key, held) in self.held.drain(..) {
            drop(held);
            self.locks.release(&key);
        }
    }
}
