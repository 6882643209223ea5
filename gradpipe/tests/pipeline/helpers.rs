use gradpipe::{
    Backend, DataType, DeviceId, GradpipeConfig, GradpipeError, HostTensor, KvStore,
    MmapSharedMemory, Result, Tensor, Transfer,
};
use std::path::Path;
use std::sync::mpsc::{Receiver, channel};
use std::sync::Arc;

/// Backend whose shared memory lives under `dir`.
pub fn backend_in(
    dir: &Path,
    config: GradpipeConfig,
    store: Option<Arc<dyn KvStore>>,
) -> Result<Backend> {
    let shm = Arc::new(MmapSharedMemory::new(dir, config.num_pcie_switches()));
    Backend::init(config, shm, store)
}

/// Single-process config with the given partition size.
pub fn local_config(partition_bytes: usize) -> GradpipeConfig {
    GradpipeConfig {
        partition_bytes,
        ..GradpipeConfig::default()
    }
}

/// Byte tensor with contents `0, 1, 2, ...`.
pub fn byte_tensor(size: usize) -> Arc<dyn Tensor> {
    let data = (0..size).map(|i| i as u8).collect();
    Arc::new(HostTensor::new(DataType::U8, data))
}

pub fn transfer(name: &str, tensor: Arc<dyn Tensor>, device: DeviceId) -> Transfer {
    Transfer {
        name: name.to_string(),
        input: Some(tensor),
        output: None,
        ready_event: None,
        device,
        priority: 0,
        version: 0,
    }
}

/// Declare and initialize `name` with `size` bytes.
pub fn declare_and_init(backend: &Backend, name: &str, size: usize) {
    assert!(!backend.is_tensor_initialized(name, size).unwrap());
    backend.init_tensor(name, DataType::U8, None).unwrap();
    assert!(backend.is_tensor_initialized(name, size).unwrap());
}

/// Callback that reports every invocation on a channel, errors as strings.
pub fn recording_callback() -> (
    impl FnOnce(Result<()>) + Send + 'static,
    Receiver<std::result::Result<(), String>>,
) {
    let (tx, rx) = channel();
    let cb = move |status: Result<()>| {
        let _ = tx.send(status.map_err(|e: GradpipeError| e.to_string()));
    };
    (cb, rx)
}

/// Act as every stage worker: pop tasks and hand them on until all queues
/// are empty. Returns the number of stage executions.
pub fn drain(backend: &Backend) -> usize {
    let mut executed = 0;
    loop {
        let mut progressed = false;
        for stage in backend.stages() {
            let queue = backend.queue(stage).unwrap();
            while let Some(task) = queue.get_task() {
                assert_eq!(task.current_stage(), Some(stage));
                backend.finish_or_proceed(task).unwrap();
                executed += 1;
                progressed = true;
            }
        }
        if !progressed {
            return executed;
        }
    }
}
