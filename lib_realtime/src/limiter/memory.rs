//! Single-process bucket store. Atomic per key because every step happens
//! under one lock. Expired buckets are swept every `SWEEP_EVERY` calls so
//! clients that go quiet do not stay in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::bucket::{refill_and_consume, BucketState};
use super::{BucketPolicy, BucketStore, Clock, SystemClock};
use crate::error::LimiterError;

const SWEEP_EVERY: u64 = 256;

struct Entry {
    state: BucketState,
    expires_at_ms: i64,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    calls: u64,
}

impl Table {
    fn sweep(&mut self, now_ms: i64) {
        self.entries.retain(|_, e| e.expires_at_ms > now_ms);
    }
}

pub struct MemoryBucketStore {
    clock: Arc<dyn Clock>,
    buckets: Mutex<Table>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: Mutex::new(Table::default()),
        }
    }

    /// Live (unexpired) bucket count.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.buckets
            .lock()
            .map(|b| b.entries.values().filter(|e| e.expires_at_ms > now).count())
            .unwrap_or(0)
    }

    /// Entries held in memory, expired or not.
    pub fn stored_len(&self) -> usize {
        self.buckets.lock().map(|b| b.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn refill_and_consume(
        &self,
        key: &str,
        policy: &BucketPolicy,
    ) -> Result<bool, LimiterError> {
        let now = self.clock.now_ms();
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| LimiterError::Unreachable("bucket table lock poisoned".into()))?;

        buckets.calls = buckets.calls.wrapping_add(1);
        if buckets.calls % SWEEP_EVERY == 0 {
            buckets.sweep(now);
        }

        // Expired buckets are gone, exactly as if the store had evicted them.
        let current = buckets
            .entries
            .get(key)
            .filter(|e| e.expires_at_ms > now)
            .map(|e| e.state);
        if current.is_none() {
            buckets.entries.remove(key);
        }

        let admission = refill_and_consume(current, policy, now);
        if let Some(state) = admission.write {
            buckets.entries.insert(
                key.to_string(),
                Entry {
                    state,
                    expires_at_ms: now + policy.expiry().as_millis() as i64,
                },
            );
        }
        Ok(admission.allowed)
    }
}
