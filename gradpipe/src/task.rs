use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use crate::context::{HostBuffer, TensorContext};
use crate::error::Result;
use crate::memory::SharedBuffer;
use crate::tensor::{ReadyEvent, Tensor};
use crate::types::{DeviceId, Key, Stage};

/// Caller-supplied completion callback.
pub type Callback = Box<dyn FnOnce(Result<()>) + Send>;

/// A completion callback shared by every partition of one transfer.
///
/// Firing is one-shot: the first `fire` runs the callback, later calls are
/// ignored and return `false`.
pub struct Completion {
    callback: Mutex<Option<Callback>>,
}

impl Completion {
    pub fn new(f: impl FnOnce(Result<()>) + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(Box::new(f))),
        })
    }

    /// Run the callback with `status` if it has not run yet.
    pub fn fire(&self, status: Result<()>) -> bool {
        // The slot is a plain Option; a poisoned guard is still consistent.
        let cb = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match cb {
            Some(cb) => {
                cb(status);
                true
            }
            None => false,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// One partition of one transfer, owned by whichever stage currently holds it.
///
/// Fields behind `Arc` are shared with sibling partitions; `tensor_name`,
/// `key`, `offset`, `len` and `stage_cursor` are per partition.
#[derive(Clone)]
pub struct TaskEntry {
    /// `<tensor name>_<partition index>`.
    pub tensor_name: String,
    /// Routing key. Assigned by dispatch after partitioning.
    pub key: Option<Key>,
    pub context: Arc<TensorContext>,
    pub tensor: Option<Arc<dyn Tensor>>,
    pub output: Option<Arc<dyn Tensor>>,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    pub device: DeviceId,
    pub priority: i32,
    pub version: i32,
    pub callback: Arc<Completion>,
    pub cpubuff: Option<HostBuffer>,
    pub pcie_cpubuff: Arc<[SharedBuffer]>,
    pub queue_list: Arc<[Stage]>,
    /// Index into `queue_list` of the stage holding the task.
    pub stage_cursor: usize,
    /// Byte offset within the parent tensor.
    pub offset: usize,
    /// Byte length of this partition.
    pub len: usize,
    /// Partitions of this transfer that finished their last stage.
    pub counter: Arc<AtomicUsize>,
    pub total_partnum: usize,
}

impl TaskEntry {
    /// Stage currently holding the task, or `None` once it ran out of stages.
    pub fn current_stage(&self) -> Option<Stage> {
        self.queue_list.get(self.stage_cursor).copied()
    }

    /// Size of the whole transfer this task belongs to.
    pub fn transfer_size(&self) -> usize {
        self.tensor
            .as_ref()
            .or(self.output.as_ref())
            .map_or(0, |t| t.size())
    }
}

impl std::fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEntry")
            .field("tensor_name", &self.tensor_name)
            .field("key", &self.key)
            .field("device", &self.device)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("stage", &self.current_stage())
            .field("total_partnum", &self.total_partnum)
            .finish()
    }
}
