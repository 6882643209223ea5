use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Barrier, Mutex};

use crate::error::{GradpipeError, Result};
use crate::store::{KeyRange, KvStore, RequestId};
use crate::types::Key;

/// In-process store: values live in a map, pushes complete immediately and
/// the worker barrier is a `std::sync::Barrier`.
///
/// Share one instance (behind an `Arc`) between the backends of all
/// simulated workers.
pub struct InMemoryStore {
    ranges: Vec<KeyRange>,
    values: Mutex<HashMap<Key, Vec<u8>>>,
    pending: Mutex<HashSet<RequestId>>,
    next_request: AtomicU64,
    pushes: AtomicU64,
    worker_barrier: Barrier,
    barriers: AtomicU64,
}

impl InMemoryStore {
    pub fn new(num_servers: usize, num_workers: usize) -> Self {
        Self {
            ranges: KeyRange::even_split(num_servers),
            values: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            next_request: AtomicU64::new(1),
            pushes: AtomicU64::new(0),
            worker_barrier: Barrier::new(num_workers.max(1)),
            barriers: AtomicU64::new(0),
        }
    }

    /// Value last pushed to a store key.
    pub fn get(&self, store_key: Key) -> Option<Vec<u8>> {
        self.values.lock().ok()?.get(&store_key).cloned()
    }

    /// Number of pushes accepted so far.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Acquire)
    }

    /// Number of barrier calls made so far, summed over all callers.
    pub fn barrier_count(&self) -> u64 {
        self.barriers.load(Ordering::Acquire)
    }
}

impl KvStore for InMemoryStore {
    fn server_key_ranges(&self) -> Vec<KeyRange> {
        self.ranges.clone()
    }

    fn zpush(&self, keys: &[Key], vals: &[u8], lens: &[usize], _cmd: i32) -> Result<RequestId> {
        if keys.len() != lens.len() {
            return Err(GradpipeError::store(format!(
                "{} keys but {} lengths",
                keys.len(),
                lens.len()
            )));
        }
        let total: usize = lens.iter().sum();
        if total != vals.len() {
            return Err(GradpipeError::store(format!(
                "lengths sum to {total}, got {} bytes",
                vals.len()
            )));
        }

        {
            let mut values = self
                .values
                .lock()
                .map_err(|_| GradpipeError::LockPoisoned("store values"))?;
            let mut offset = 0;
            for (&key, &len) in keys.iter().zip(lens) {
                values.insert(key, vals[offset..offset + len].to_vec());
                offset += len;
            }
        }
        self.pushes.fetch_add(1, Ordering::AcqRel);

        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .map_err(|_| GradpipeError::LockPoisoned("store pending"))?
            .insert(id);
        Ok(id)
    }

    fn wait(&self, request: RequestId) -> Result<()> {
        let known = self
            .pending
            .lock()
            .map_err(|_| GradpipeError::LockPoisoned("store pending"))?
            .remove(&request);
        if known {
            Ok(())
        } else {
            Err(GradpipeError::store(format!("unknown request {request}")))
        }
    }

    fn barrier(&self) -> Result<()> {
        self.barriers.fetch_add(1, Ordering::AcqRel);
        self.worker_barrier.wait();
        Ok(())
    }
}
