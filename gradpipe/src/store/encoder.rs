use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{GradpipeError, Result};
use crate::store::KeyRange;
use crate::types::Key;

/// Routing descriptor for one partition: which store keys receive which
/// byte sub-ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsKv {
    pub keys: Vec<Key>,
    pub lens: Vec<usize>,
    pub size: usize,
}

/// Maps partition keys to store routing descriptors.
///
/// Each partition is owned by a single server chosen by a fixed hash of its
/// key, so every process (and every later push/pull of the same key) agrees
/// on the owner without coordination.
pub struct KeyEncoder {
    ranges: Vec<KeyRange>,
    cache: Mutex<HashMap<Key, PsKv>>,
}

impl KeyEncoder {
    pub fn new(ranges: Vec<KeyRange>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(GradpipeError::store("store reports no servers"));
        }
        Ok(Self {
            ranges,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Index of the server owning `key`.
    pub fn server_for(&self, key: Key) -> usize {
        (fnv1a(key) % self.ranges.len() as u64) as usize
    }

    /// Encode `(key, len)`. Repeated calls return the cached descriptor;
    /// a different length for an already-encoded key is rejected.
    pub fn encode(&self, key: Key, len: usize) -> Result<PsKv> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| GradpipeError::LockPoisoned("key encoder"))?;
        if let Some(pskv) = cache.get(&key) {
            if pskv.size != len {
                return Err(GradpipeError::KeyLengthMismatch {
                    key,
                    encoded: pskv.size,
                    requested: len,
                });
            }
            return Ok(pskv.clone());
        }

        let range = self.ranges[self.server_for(key)];
        let ps_key = range
            .begin
            .checked_add(key)
            .filter(|k| range.contains(*k))
            .ok_or_else(|| GradpipeError::store(format!("key {key} overflows server range")))?;

        let pskv = PsKv {
            keys: vec![ps_key],
            lens: vec![len],
            size: len,
        };
        cache.insert(key, pskv.clone());
        Ok(pskv)
    }
}

/// FNV-1a over the key's little-endian bytes.
fn fnv1a(key: Key) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in key.to_le_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}
