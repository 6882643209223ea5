pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod partition;
pub mod queue;
pub mod store;
pub mod task;
pub mod tensor;
pub mod topology;
pub mod types;

pub use backend::{Backend, Transfer};
pub use config::GradpipeConfig;
pub use context::{HostBuffer, TensorContext};
pub use error::{GradpipeError, Result};
pub use memory::{HostRegion, MmapSharedMemory, SharedBuffer, SharedMemory};
pub use partition::partition_tensor;
pub use queue::{QueueRegistry, ScheduledQueue};
pub use store::{InMemoryStore, KeyEncoder, KeyRange, KvStore, PsKv, RequestId};
pub use task::{Completion, TaskEntry};
pub use tensor::{HostTensor, ReadyEvent, Tensor};
pub use topology::{TopologyFacts, active_stages, pull_stages, push_stages};
pub use types::{DataType, DeviceId, Key, Rank, RequestKind, Stage, command_type};
