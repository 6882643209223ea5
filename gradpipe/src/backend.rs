use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::GradpipeConfig;
use crate::context::{ContextRegistry, HostBuffer, TensorContext};
use crate::error::{GradpipeError, Result};
use crate::memory::{HostRegion, MmapSharedMemory, SharedMemory};
use crate::partition::partition_tensor;
use crate::queue::{QueueRegistry, ScheduledQueue};
use crate::store::{KeyEncoder, KvStore};
use crate::task::{Completion, TaskEntry};
use crate::tensor::{ReadyEvent, Tensor};
use crate::topology::{TopologyFacts, active_stages, pull_stages, push_stages};
use crate::types::{DataType, DeviceId, Rank, RequestKind, Stage, command_type};

/// One transfer of one tensor, as handed over by a framework frontend.
pub struct Transfer {
    pub name: String,
    pub input: Option<Arc<dyn Tensor>>,
    pub output: Option<Arc<dyn Tensor>>,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    pub device: DeviceId,
    pub priority: i32,
    pub version: i32,
}

/// Store client plus the encoder built from its key ranges.
struct StoreHandle {
    client: Arc<dyn KvStore>,
    encoder: KeyEncoder,
}

/// The control plane of one process.
///
/// Owns the tensor registry and the stage queues. Every entry point takes
/// `&self` and may be called from any thread; transfers of different tensors
/// never contend beyond the registry lock.
///
/// # Example
///
/// ```no_run
/// use gradpipe::{Backend, DataType, DeviceId, GradpipeConfig, HostTensor, Transfer};
/// use std::sync::Arc;
///
/// # fn example() -> gradpipe::Result<()> {
/// let backend = Backend::with_default_shm(GradpipeConfig::from_env(), None)?;
///
/// let grad = Arc::new(HostTensor::zeros(DataType::F32, 1024));
/// if !backend.is_tensor_initialized("fc.weight", 4096)? {
///     backend.init_tensor("fc.weight", DataType::F32, None)?;
/// }
///
/// let ctx = backend.context("fc.weight")?;
/// let stages = backend.push_queue_list(DeviceId::Cpu);
/// backend.enqueue_tensor(
///     &ctx,
///     Transfer {
///         name: "fc.weight".into(),
///         input: Some(grad),
///         output: None,
///         ready_event: None,
///         device: DeviceId::Cpu,
///         priority: 0,
///         version: 0,
///     },
///     |status| assert!(status.is_ok()),
///     stages,
/// )?;
/// # Ok(())
/// # }
/// ```
pub struct Backend {
    config: GradpipeConfig,
    facts: TopologyFacts,
    partition_bound: usize,
    queues: QueueRegistry,
    contexts: ContextRegistry,
    shm: Arc<dyn SharedMemory>,
    store: Option<StoreHandle>,
    push_list: Arc<[Stage]>,
    pull_list: Arc<[Stage]>,
    running: AtomicBool,
}

impl Backend {
    /// Bring up the control plane: validate the topology, create one queue
    /// per stage this process can reach, and connect the store encoder.
    ///
    /// A store is required on the root device of a distributed job, the only
    /// process that talks to it.
    pub fn init(
        config: GradpipeConfig,
        shm: Arc<dyn SharedMemory>,
        store: Option<Arc<dyn KvStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let facts = config.topology();

        let store = match store {
            Some(client) => {
                let encoder = KeyEncoder::new(client.server_key_ranges())?;
                Some(StoreHandle { client, encoder })
            }
            None if facts.is_distributed && facts.is_root_device => {
                return Err(GradpipeError::InvalidConfig(
                    "distributed root device needs a store client".into(),
                ));
            }
            None => None,
        };

        let stages = active_stages(facts);
        let gpu = DeviceId::Gpu(0);
        let backend = Self {
            partition_bound: config.partition_bound(),
            queues: QueueRegistry::new(&stages),
            contexts: ContextRegistry::new(config.partition_bound()),
            push_list: push_stages(facts, gpu).into(),
            pull_list: pull_stages(facts, gpu).into(),
            facts,
            config,
            shm,
            store,
            running: AtomicBool::new(true),
        };

        tracing::debug!(
            rank = backend.rank(),
            local_rank = backend.local_rank(),
            distributed = facts.is_distributed,
            root_device = facts.is_root_device,
            cross_pcie = facts.is_cross_pcie_switch,
            signal_root = facts.is_signal_root,
            partition_bound = backend.partition_bound,
            ?stages,
            "backend initialized"
        );
        Ok(backend)
    }

    /// [`init`](Self::init) with file-backed shared memory under `config.shm_dir`.
    pub fn with_default_shm(
        config: GradpipeConfig,
        store: Option<Arc<dyn KvStore>>,
    ) -> Result<Self> {
        let shm = Arc::new(MmapSharedMemory::new(
            config.shm_dir.clone(),
            config.num_pcie_switches(),
        ));
        Self::init(config, shm, store)
    }

    /// Stop accepting work. Queued tasks stay available to workers draining
    /// the queues; new submissions fail with `QueueClosed`.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.queues.close_all();
            tracing::trace!(rank = self.rank(), "backend is shut down");
        }
    }

    pub fn check_initialized(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(GradpipeError::NotInitialized)
        }
    }

    pub fn rank(&self) -> Rank {
        self.config.rank()
    }

    pub fn local_rank(&self) -> Rank {
        self.config.local_rank()
    }

    pub fn size(&self) -> u32 {
        self.config.size()
    }

    pub fn local_size(&self) -> u32 {
        self.config.local_size()
    }

    pub fn config(&self) -> &GradpipeConfig {
        &self.config
    }

    pub fn topology(&self) -> TopologyFacts {
        self.facts
    }

    pub fn partition_bound(&self) -> usize {
        self.partition_bound
    }

    /// Queue feeding `stage`, for the worker loop serving it.
    pub fn queue(&self, stage: Stage) -> Result<&Arc<ScheduledQueue>> {
        self.queues.get(stage)
    }

    /// Stages with a queue on this process.
    pub fn stages(&self) -> Vec<Stage> {
        self.queues.stages()
    }

    /// Stage list for an outbound (push) transfer from `device`.
    pub fn push_queue_list(&self, device: DeviceId) -> Arc<[Stage]> {
        if device.is_cpu() {
            return Arc::from(Vec::new());
        }
        Arc::clone(&self.push_list)
    }

    /// Stage list for an inbound (pull) transfer to `device`.
    pub fn pull_queue_list(&self, device: DeviceId) -> Arc<[Stage]> {
        if device.is_cpu() {
            return Arc::from(Vec::new());
        }
        Arc::clone(&self.pull_list)
    }

    pub fn context(&self, name: &str) -> Result<Arc<TensorContext>> {
        self.contexts.get(name)
    }

    /// Declare `name` on first sight and report whether it is initialized.
    ///
    /// The first call for a name derives its partition keys; later calls must
    /// pass the same size.
    pub fn is_tensor_initialized(&self, name: &str, size: usize) -> Result<bool> {
        let (ctx, _) = self.contexts.declare(name, size)?;
        Ok(ctx.is_initialized())
    }

    /// First-use setup of a declared tensor. **Blocks.**
    ///
    /// Adopts `cpubuff` when given, otherwise opens a shared segment keyed by
    /// the tensor's first partition key. On the root device of a distributed
    /// job, every partition is then seeded into the store by the elected
    /// initializer, and all root devices rendezvous on a worker barrier after
    /// each partition. This stalls for a store round trip plus a full barrier
    /// per partition; keep it off latency-critical paths.
    ///
    /// Calling it again once the tensor is initialized is a no-op. A retry
    /// after a failed attempt keeps the buffer that attempt bound; offering a
    /// different `cpubuff` then fails with `HostBufferConflict`.
    pub fn init_tensor(
        &self,
        name: &str,
        dtype: DataType,
        cpubuff: Option<HostRegion>,
    ) -> Result<()> {
        self.check_initialized()?;
        let ctx = self.contexts.get(name)?;
        let _guard = ctx.lock_init()?;
        if ctx.is_initialized() {
            tracing::debug!(tensor = name, "already initialized");
            return Ok(());
        }

        let size = ctx.buff_len();
        let bound = self.partition_bound;
        let keys = ctx.key_list();
        let expected = size.div_ceil(bound);
        if keys.is_empty() || keys.len() != expected {
            return Err(GradpipeError::KeyCountMismatch {
                name: name.to_string(),
                keys: keys.len(),
                expected,
                size,
                bound,
            });
        }
        tracing::trace!(tensor = name, size, parts = keys.len(), "begin init");

        // A failed earlier attempt may already have bound a buffer.
        match (ctx.cpubuff(), cpubuff) {
            (None, cpubuff) => self.acquire_buffer(&ctx, cpubuff)?,
            (Some(HostBuffer::External(held)), Some(offered)) if held == offered => {}
            (Some(held), Some(offered)) => {
                tracing::warn!(
                    tensor = name,
                    held = %held.region(),
                    %offered,
                    "retry offers a different host buffer"
                );
                return Err(GradpipeError::HostBufferConflict {
                    name: name.to_string(),
                    offered,
                });
            }
            (Some(_), None) => {}
        }
        let data = ctx
            .cpubuff()
            .ok_or_else(|| GradpipeError::TensorNotReady {
                name: name.to_string(),
            })?
            .region();

        let seed = self.facts.is_distributed && self.facts.is_root_device;
        let store = if seed { Some(self.store()?) } else { None };
        let cmd = command_type(RequestKind::DefaultPushPull, dtype);

        let mut accumulated = 0;
        for (i, &key) in keys.iter().enumerate() {
            let len = (size - accumulated).min(bound);

            if let Some(store) = store {
                if self.config.is_initializer() {
                    let pskv = store.encoder.encode(key, len)?;
                    let part = data.slice(accumulated, len).ok_or_else(|| {
                        GradpipeError::Shm {
                            key,
                            reason: format!(
                                "partition {i} [{accumulated}, +{len}) exceeds host buffer"
                            ),
                        }
                    })?;
                    // SAFETY: no transfer of this tensor can run before
                    // `initialized` is set, so nothing writes the buffer now.
                    let vals = unsafe { part.as_bytes() };
                    let req = store.client.zpush(&pskv.keys, vals, &pskv.lens, cmd)?;
                    store.client.wait(req)?;
                    tracing::trace!(tensor = name, key, len, "seeded partition");
                }
                store.client.barrier()?;
            }

            accumulated += len;
        }

        if accumulated != size {
            return Err(GradpipeError::SizeNotConserved {
                name: name.to_string(),
                accumulated,
                expected: size,
            });
        }

        ctx.mark_initialized();
        tracing::trace!(tensor = name, size, parts = keys.len(), "finish init");
        Ok(())
    }

    /// Run [`init_tensor`](Self::init_tensor), then deliver its outcome to
    /// `callback`. Blocks exactly as long as `init_tensor` does.
    pub fn enqueue_tensor_init(
        &self,
        name: &str,
        dtype: DataType,
        cpubuff: Option<HostRegion>,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        callback(self.init_tensor(name, dtype, cpubuff));
    }

    /// Split a transfer into partitions and submit each to the first stage in
    /// `queue_list`.
    ///
    /// `callback` fires at most once. With an empty stage list it fires `Ok`
    /// synchronously. Recoverable rejections (shut down backend, shape or
    /// readiness errors, a closed first queue) fire it with the error that is
    /// also returned. Otherwise whichever worker finishes the last partition
    /// fires it.
    ///
    /// Fatal errors ([`GradpipeError::is_fatal`]) are only returned: the
    /// callback is dropped without running and no partition is submitted.
    pub fn enqueue_tensor(
        &self,
        context: &Arc<TensorContext>,
        transfer: Transfer,
        callback: impl FnOnce(Result<()>) + Send + 'static,
        queue_list: Arc<[Stage]>,
    ) -> Result<()> {
        let name = transfer.name;
        let callback = Completion::new(callback);
        if self.check_initialized().is_err() {
            return reject(&callback, || GradpipeError::NotInitialized);
        }

        let size = match (&transfer.input, &transfer.output) {
            (Some(input), Some(output)) if input.size() != output.size() => {
                let (input, output) = (input.size(), output.size());
                return reject(&callback, || GradpipeError::ShapeMismatch {
                    name: name.clone(),
                    input,
                    output,
                });
            }
            (Some(t), _) | (None, Some(t)) => t.size(),
            (None, None) => {
                return reject(&callback, || GradpipeError::MissingTensor {
                    name: name.clone(),
                });
            }
        };
        if !context.is_initialized() {
            return reject(&callback, || GradpipeError::TensorNotReady {
                name: name.clone(),
            });
        }

        let key_count = context.key_list().len();
        let template = TaskEntry {
            tensor_name: name.clone(),
            key: None,
            context: Arc::clone(context),
            tensor: transfer.input,
            output: transfer.output,
            ready_event: transfer.ready_event,
            device: transfer.device,
            priority: transfer.priority,
            version: transfer.version,
            callback,
            cpubuff: context.cpubuff(),
            pcie_cpubuff: context.pcie_cpubuff(),
            queue_list,
            stage_cursor: 0,
            offset: 0,
            len: size,
            counter: Arc::new(AtomicUsize::new(0)),
            total_partnum: key_count,
        };

        let partitions = partition_tensor(&template, self.partition_bound)?;
        if partitions.len() != key_count {
            return Err(GradpipeError::PartitionCountMismatch {
                name,
                partitions: partitions.len(),
                keys: key_count,
            });
        }
        let accumulated: usize = partitions.iter().map(|p| p.len).sum();
        if accumulated != size {
            return Err(GradpipeError::SizeNotConserved {
                name,
                accumulated,
                expected: size,
            });
        }

        let Some(&first) = template.queue_list.first() else {
            if template.device.is_cpu() {
                tracing::debug!(tensor = %name, "no queue_list assigned, skipped");
            } else {
                tracing::warn!(
                    tensor = %name,
                    device = %template.device,
                    "device tensor has an empty queue_list, completing without a pipeline"
                );
            }
            template.callback.fire(Ok(()));
            return Ok(());
        };
        let queue = self.queues.get(first)?;
        if queue.is_closed() {
            return reject(&template.callback, || GradpipeError::QueueClosed {
                stage: first,
            });
        }

        let keyed = partitions.into_iter().zip(context.key_list());
        for (i, (mut task, &key)) in keyed.enumerate() {
            task.key = Some(key);
            tracing::trace!(
                task = %task.tensor_name,
                key,
                offset = task.offset,
                len = task.len,
                device = %task.device,
                rank = self.local_rank(),
                "enqueue partition"
            );
            if queue.add_task(task).is_err() {
                // Partitions 0..i stay queued but can never complete the transfer.
                tracing::warn!(
                    tensor = %name,
                    submitted = i,
                    total = key_count,
                    "queue closed during submission"
                );
                return reject(&template.callback, || GradpipeError::QueueClosed {
                    stage: first,
                });
            }
        }

        tracing::trace!(tensor = %name, rank = self.local_rank(), "enqueue finished");
        Ok(())
    }

    /// Hand a task whose current stage just finished to its next stage.
    ///
    /// After the last stage the transfer's counter is incremented; the
    /// partition that brings it to `total_partnum` fires the callback.
    pub fn finish_or_proceed(&self, mut task: TaskEntry) -> Result<()> {
        let Some(done_stage) = task.current_stage() else {
            return Err(GradpipeError::StageOverrun {
                name: task.tensor_name,
            });
        };
        task.stage_cursor += 1;

        if let Some(next) = task.current_stage() {
            tracing::trace!(task = %task.tensor_name, from = %done_stage, to = %next, "proceed");
            return self.queues.get(next)?.add_task(task);
        }

        let finished = task.counter.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(
            task = %task.tensor_name,
            stage = %done_stage,
            finished,
            total = task.total_partnum,
            "partition finished"
        );
        if finished == task.total_partnum {
            tracing::trace!(task = %task.tensor_name, "transfer finished");
            task.callback.fire(Ok(()));
        }
        Ok(())
    }

    fn acquire_buffer(&self, ctx: &TensorContext, cpubuff: Option<HostRegion>) -> Result<()> {
        let size = ctx.buff_len();
        let first_key = ctx.key_list()[0];

        if let Some(region) = cpubuff {
            if region.len_bytes() < size {
                return Err(GradpipeError::ContextSizeMismatch {
                    name: ctx.name().to_string(),
                    registered: size,
                    requested: region.len_bytes(),
                });
            }
            tracing::trace!(tensor = ctx.name(), len = size, "reusing host buffer");
            ctx.set_buffers(HostBuffer::External(region), Vec::new(), true);
            return Ok(());
        }

        if self.facts.is_cross_pcie_switch {
            let bufs = self.shm.open_pcie_shared_memory(first_key, size)?;
            let primary = bufs.last().cloned().ok_or_else(|| GradpipeError::Shm {
                key: first_key,
                reason: "no pcie segments returned".into(),
            })?;
            ctx.set_buffers(HostBuffer::Shared(primary), bufs, false);
        } else {
            let buf = self.shm.open_shared_memory(first_key, size)?;
            ctx.set_buffers(HostBuffer::Shared(buf), Vec::new(), false);
        }
        tracing::trace!(tensor = ctx.name(), size, "acquired host buffer");
        Ok(())
    }

    fn store(&self) -> Result<&StoreHandle> {
        self.store
            .as_ref()
            .ok_or_else(|| GradpipeError::store("no store client configured"))
    }
}

/// Deliver a recoverable error to the callback and return the same error.
fn reject(callback: &Completion, err: impl Fn() -> GradpipeError) -> Result<()> {
    callback.fire(Err(err()));
    Err(err())
}
