//! Per-tensor state that outlives individual transfers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::error::{GradpipeError, Result};
use crate::memory::{HostRegion, SharedBuffer};
use crate::types::Key;

/// Partition index occupies the low 16 bits of a routing key.
const PARTITION_KEY_BITS: u32 = 16;

/// Most partitions a single tensor can be split into.
pub const MAX_PARTITIONS: usize = 1 << PARTITION_KEY_BITS;

/// Host memory backing a tensor's partitions.
#[derive(Debug, Clone)]
pub enum HostBuffer {
    /// Segment acquired from the shared-memory provider.
    Shared(SharedBuffer),
    /// Memory the caller already owns and handed over at init.
    External(HostRegion),
}

impl HostBuffer {
    pub fn region(&self) -> HostRegion {
        match self {
            HostBuffer::Shared(buf) => buf.region(),
            HostBuffer::External(region) => *region,
        }
    }
}

#[derive(Debug)]
struct ContextBuffers {
    cpubuff: HostBuffer,
    pcie_cpubuff: Arc<[SharedBuffer]>,
    reuse_buff: bool,
}

/// Everything the backend remembers about one tensor name.
#[derive(Debug)]
pub struct TensorContext {
    name: String,
    buff_len: usize,
    declared_key: u32,
    key_list: Vec<Key>,
    buffers: OnceLock<ContextBuffers>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl TensorContext {
    /// Build a context whose key list covers `buff_len` bytes in partitions
    /// of at most `partition_bound` bytes.
    pub fn new(
        name: impl Into<String>,
        buff_len: usize,
        declared_key: u32,
        partition_bound: usize,
    ) -> Result<Self> {
        let name = name.into();
        if partition_bound == 0 {
            return Err(GradpipeError::InvalidPartitionBound(0));
        }
        if buff_len == 0 {
            return Err(GradpipeError::EmptyTensor { name });
        }
        let partitions = buff_len.div_ceil(partition_bound);
        if partitions > MAX_PARTITIONS {
            return Err(GradpipeError::TooManyPartitions {
                name,
                partitions,
                max: MAX_PARTITIONS,
            });
        }

        let base = (declared_key as Key) << PARTITION_KEY_BITS;
        let key_list = (0..partitions as Key).map(|i| base + i).collect();
        Ok(Self {
            name,
            buff_len,
            declared_key,
            key_list,
            buffers: OnceLock::new(),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buff_len(&self) -> usize {
        self.buff_len
    }

    pub fn declared_key(&self) -> u32 {
        self.declared_key
    }

    /// Routing keys, one per partition, in offset order.
    pub fn key_list(&self) -> &[Key] {
        &self.key_list
    }

    /// Primary host buffer, once initialized.
    pub fn cpubuff(&self) -> Option<HostBuffer> {
        self.buffers.get().map(|b| b.cpubuff.clone())
    }

    /// Per-PCIe-switch buffers (empty unless cross-switch mode).
    pub fn pcie_cpubuff(&self) -> Arc<[SharedBuffer]> {
        self.buffers
            .get()
            .map_or_else(|| Arc::from(Vec::new()), |b| Arc::clone(&b.pcie_cpubuff))
    }

    /// True if the host buffer was supplied by the caller.
    pub fn reuse_buff(&self) -> bool {
        self.buffers.get().is_some_and(|b| b.reuse_buff)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn set_buffers(
        &self,
        cpubuff: HostBuffer,
        pcie_cpubuff: Vec<SharedBuffer>,
        reuse_buff: bool,
    ) {
        let _ = self.buffers.set(ContextBuffers {
            cpubuff,
            pcie_cpubuff: pcie_cpubuff.into(),
            reuse_buff,
        });
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Serializes initialization of this tensor.
    pub(crate) fn lock_init(&self) -> Result<MutexGuard<'_, ()>> {
        self.init_lock
            .lock()
            .map_err(|_| GradpipeError::LockPoisoned("tensor init"))
    }
}

struct RegistryState {
    contexts: HashMap<String, Arc<TensorContext>>,
    last_used_key: u32,
}

/// Name → context map, handing out declared keys in registration order.
pub struct ContextRegistry {
    partition_bound: usize,
    state: Mutex<RegistryState>,
}

impl ContextRegistry {
    pub fn new(partition_bound: usize) -> Self {
        Self {
            partition_bound,
            state: Mutex::new(RegistryState {
                contexts: HashMap::new(),
                last_used_key: 0,
            }),
        }
    }

    /// Look up `name`, registering it with `size` bytes on first sight.
    ///
    /// Returns the context and whether this call created it. Re-declaring a
    /// name with a different size is rejected.
    pub fn declare(&self, name: &str, size: usize) -> Result<(Arc<TensorContext>, bool)> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| GradpipeError::LockPoisoned("context registry"))?;

        if let Some(ctx) = state.contexts.get(name) {
            if ctx.buff_len() != size {
                return Err(GradpipeError::ContextSizeMismatch {
                    name: name.to_string(),
                    registered: ctx.buff_len(),
                    requested: size,
                });
            }
            return Ok((Arc::clone(ctx), false));
        }

        let mut declared = state.last_used_key.wrapping_add(1);
        if declared == u32::MAX {
            declared = 0;
        }
        let ctx = Arc::new(TensorContext::new(
            name,
            size,
            declared,
            self.partition_bound,
        )?);
        state.last_used_key = declared;
        state.contexts.insert(name.to_string(), Arc::clone(&ctx));

        tracing::debug!(
            tensor = name,
            size,
            declared_key = declared,
            parts = ctx.key_list().len(),
            "declared tensor"
        );
        Ok((ctx, true))
    }

    pub fn get(&self, name: &str) -> Result<Arc<TensorContext>> {
        self.state
            .lock()
            .map_err(|_| GradpipeError::LockPoisoned("context registry"))?
            .contexts
            .get(name)
            .cloned()
            .ok_or_else(|| GradpipeError::UnknownTensor {
                name: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.state.lock().map_or(0, |s| s.contexts.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
