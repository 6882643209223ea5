use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_queue::SegQueue;

use crate::error::{GradpipeError, Result};
use crate::task::TaskEntry;
use crate::types::Stage;

/// Work queue feeding one stage's worker loop.
///
/// Lock-free and unbounded: `add_task` never blocks the dispatcher. Tasks
/// come out in insertion order.
pub struct ScheduledQueue {
    stage: Stage,
    tasks: SegQueue<TaskEntry>,
    closed: AtomicBool,
    added: AtomicU64,
}

impl ScheduledQueue {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            tasks: SegQueue::new(),
            closed: AtomicBool::new(false),
            added: AtomicU64::new(0),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Enqueue a task. Fails only after [`close`](Self::close).
    pub fn add_task(&self, task: TaskEntry) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                stage = %self.stage,
                task = %task.tensor_name,
                "rejecting task: queue closed"
            );
            return Err(GradpipeError::QueueClosed { stage: self.stage });
        }
        self.tasks.push(task);
        self.added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the oldest pending task, if any.
    pub fn get_task(&self) -> Option<TaskEntry> {
        self.tasks.pop()
    }

    pub fn pending_size(&self) -> usize {
        self.tasks.len()
    }

    /// Total tasks ever accepted.
    pub fn total_added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    /// Stop accepting tasks. Pending tasks stay available to `get_task`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Stage → queue map built once at startup.
pub struct QueueRegistry {
    queues: HashMap<Stage, Arc<ScheduledQueue>>,
}

impl QueueRegistry {
    pub fn new(stages: &[Stage]) -> Self {
        let queues = stages
            .iter()
            .map(|&s| (s, Arc::new(ScheduledQueue::new(s))))
            .collect();
        Self { queues }
    }

    pub fn get(&self, stage: Stage) -> Result<&Arc<ScheduledQueue>> {
        self.queues
            .get(&stage)
            .ok_or(GradpipeError::QueueNotRegistered { stage })
    }

    /// Registered stages in declaration order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.queues.keys().copied().collect();
        stages.sort();
        stages
    }

    pub fn close_all(&self) {
        for q in self.queues.values() {
            q.close();
        }
    }
}
