//! The distributed key-value store as seen by the control plane.
//!
//! Only the calls tensor initialization makes are modelled here; steady-state
//! push/pull traffic belongs to the stage workers.

mod encoder;
mod memory;

pub use encoder::{KeyEncoder, PsKv};
pub use memory::InMemoryStore;

use crate::error::Result;
use crate::types::Key;

/// Handle of an in-flight store request.
pub type RequestId = u64;

/// Half-open range `[begin, end)` of store keys owned by one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    /// Split the whole key space evenly across `num_servers` servers.
    pub fn even_split(num_servers: usize) -> Vec<KeyRange> {
        let n = num_servers.max(1) as u64;
        let width = u64::MAX / n;
        (0..n)
            .map(|i| KeyRange {
                begin: width * i,
                end: width * (i + 1),
            })
            .collect()
    }

    pub fn contains(&self, key: Key) -> bool {
        key >= self.begin && key < self.end
    }
}

/// Client of the distributed store.
pub trait KvStore: Send + Sync {
    /// Key ranges owned by each server, in server order.
    fn server_key_ranges(&self) -> Vec<KeyRange>;

    /// Start a push of `vals`, split by `lens` across `keys`.
    ///
    /// Returns a handle to pass to [`wait`](Self::wait).
    fn zpush(&self, keys: &[Key], vals: &[u8], lens: &[usize], cmd: i32) -> Result<RequestId>;

    /// Block until the request is acknowledged.
    fn wait(&self, request: RequestId) -> Result<()>;

    /// Block until every worker of the job reached the barrier.
    fn barrier(&self) -> Result<()>;
}
