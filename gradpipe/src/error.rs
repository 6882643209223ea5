use crate::memory::HostRegion;
use crate::types::{Key, Stage};

pub type Result<T> = std::result::Result<T, GradpipeError>;

#[derive(Debug, thiserror::Error)]
pub enum GradpipeError {
    #[error("{name}: input size {input} does not match output size {output}")]
    ShapeMismatch {
        name: String,
        input: usize,
        output: usize,
    },

    #[error("{name}: transfer has neither an input nor an output tensor")]
    MissingTensor { name: String },

    #[error("{name}: {partitions} partitions but {keys} registered keys")]
    PartitionCountMismatch {
        name: String,
        partitions: usize,
        keys: usize,
    },

    #[error("{name}: accumulated partition size {accumulated} != tensor size {expected}")]
    SizeNotConserved {
        name: String,
        accumulated: usize,
        expected: usize,
    },

    #[error("{name}: {keys} keys registered, expected {expected} (size={size}, bound={bound})")]
    KeyCountMismatch {
        name: String,
        keys: usize,
        expected: usize,
        size: usize,
        bound: usize,
    },

    #[error("tensor {name} has zero size")]
    EmptyTensor { name: String },

    #[error("tensor {name} needs {partitions} partitions, at most {max} allowed")]
    TooManyPartitions {
        name: String,
        partitions: usize,
        max: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid partition bound: {0}")]
    InvalidPartitionBound(usize),

    #[error("key {key} already encoded with length {encoded}, got {requested}")]
    KeyLengthMismatch {
        key: Key,
        encoded: usize,
        requested: usize,
    },

    #[error("no queue registered for stage {stage}")]
    QueueNotRegistered { stage: Stage },

    #[error("task {name} has no stage left to finish")]
    StageOverrun { name: String },

    #[error("{name}: registered with {registered} bytes, requested {requested}")]
    ContextSizeMismatch {
        name: String,
        registered: usize,
        requested: usize,
    },

    #[error("{name}: host buffer {offered} offered after another buffer was bound")]
    HostBufferConflict { name: String, offered: HostRegion },

    #[error("tensor {name} is not registered")]
    UnknownTensor { name: String },

    #[error("tensor {name} used before its buffers were initialized")]
    TensorNotReady { name: String },

    #[error("backend is not initialized or already shut down")]
    NotInitialized,

    #[error("stage queue {stage} is closed")]
    QueueClosed { stage: Stage },

    #[error("store error: {0}")]
    Store(String),

    #[error("shared memory error for key {key}: {reason}")]
    Shm { key: Key, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl GradpipeError {
    /// Create a `Store` error from a message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// True for internal invariant violations and registration misuse.
    ///
    /// Continuing after a fatal error would leave the task graph corrupted;
    /// frontends are expected to abort rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PartitionCountMismatch { .. }
                | Self::SizeNotConserved { .. }
                | Self::KeyCountMismatch { .. }
                | Self::EmptyTensor { .. }
                | Self::TooManyPartitions { .. }
                | Self::InvalidConfig(_)
                | Self::InvalidPartitionBound(_)
                | Self::KeyLengthMismatch { .. }
                | Self::QueueNotRegistered { .. }
                | Self::HostBufferConflict { .. }
                | Self::StageOverrun { .. }
                | Self::ContextSizeMismatch { .. }
                | Self::LockPoisoned(_)
        )
    }
}
