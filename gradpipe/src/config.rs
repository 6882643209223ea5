//! Process topology and tuning parameters.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `GRADPIPE_`) or by constructing a custom `GradpipeConfig`.
//! The config is read once and then shared immutably by every component.

use std::path::PathBuf;

use crate::error::{GradpipeError, Result};
use crate::topology::TopologyFacts;
use crate::types::Rank;

/// Default partition size: just under 4 MiB.
const DEFAULT_PARTITION_BYTES: usize = 4_096_000;

/// Default number of devices behind one PCIe switch.
const DEFAULT_PCIE_SWITCH_SIZE: u32 = 8;

/// Static facts about where this process sits in the job, plus the
/// partition size used to slice tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradpipeConfig {
    /// Index of this machine among all machines (the store worker id).
    pub worker_id: u32,

    /// Number of machines taking part in the job.
    pub num_worker: u32,

    /// Index of this process among the processes on its machine.
    pub local_rank: u32,

    /// Number of processes (devices) on this machine.
    pub local_size: u32,

    /// Requested partition size in bytes, before alignment.
    pub partition_bytes: usize,

    /// Number of devices sharing one PCIe root complex.
    pub pcie_switch_size: u32,

    /// Run the distributed pipeline even with a single machine.
    pub force_distributed: bool,

    /// Worker id that seeds initial tensor values into the store.
    pub initializer_worker: u32,

    /// Directory holding shared-memory segments.
    pub shm_dir: PathBuf,
}

impl Default for GradpipeConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            num_worker: 1,
            local_rank: 0,
            local_size: 1,
            partition_bytes: DEFAULT_PARTITION_BYTES,
            pcie_switch_size: DEFAULT_PCIE_SWITCH_SIZE,
            force_distributed: false,
            initializer_worker: 0,
            shm_dir: PathBuf::from("/dev/shm"),
        }
    }
}

impl GradpipeConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `GRADPIPE_WORKER_ID`
    /// - `GRADPIPE_NUM_WORKER`
    /// - `GRADPIPE_LOCAL_RANK`
    /// - `GRADPIPE_LOCAL_SIZE`
    /// - `GRADPIPE_PARTITION_BYTES`
    /// - `GRADPIPE_PCIE_SWITCH_SIZE`
    /// - `GRADPIPE_FORCE_DISTRIBUTED` (`1` or `true`)
    /// - `GRADPIPE_INITIALIZER_WORKER`
    /// - `GRADPIPE_SHM_DIR`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<u32>("GRADPIPE_WORKER_ID") {
            cfg.worker_id = n;
        }
        if let Some(n) = env_parse::<u32>("GRADPIPE_NUM_WORKER") {
            cfg.num_worker = n;
        }
        if let Some(n) = env_parse::<u32>("GRADPIPE_LOCAL_RANK") {
            cfg.local_rank = n;
        }
        if let Some(n) = env_parse::<u32>("GRADPIPE_LOCAL_SIZE") {
            cfg.local_size = n;
        }
        if let Some(n) = env_parse::<usize>("GRADPIPE_PARTITION_BYTES") {
            cfg.partition_bytes = n;
        }
        if let Some(n) = env_parse::<u32>("GRADPIPE_PCIE_SWITCH_SIZE") {
            cfg.pcie_switch_size = n;
        }
        if let Ok(v) = std::env::var("GRADPIPE_FORCE_DISTRIBUTED") {
            cfg.force_distributed = matches!(v.trim(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(n) = env_parse::<u32>("GRADPIPE_INITIALIZER_WORKER") {
            cfg.initializer_worker = n;
        }
        if let Ok(v) = std::env::var("GRADPIPE_SHM_DIR")
            && !v.is_empty()
        {
            cfg.shm_dir = PathBuf::from(v);
        }

        cfg
    }

    /// Reject combinations no process could actually be in.
    pub fn validate(&self) -> Result<()> {
        if self.local_size == 0 || self.num_worker == 0 {
            return Err(GradpipeError::InvalidConfig(format!(
                "local_size={} num_worker={} must both be non-zero",
                self.local_size, self.num_worker
            )));
        }
        if self.local_rank >= self.local_size {
            return Err(GradpipeError::InvalidConfig(format!(
                "local_rank {} out of range for local_size {}",
                self.local_rank, self.local_size
            )));
        }
        if self.worker_id >= self.num_worker || self.initializer_worker >= self.num_worker {
            return Err(GradpipeError::InvalidConfig(format!(
                "worker_id {} / initializer {} out of range for num_worker {}",
                self.worker_id, self.initializer_worker, self.num_worker
            )));
        }
        if self.partition_bytes == 0 {
            return Err(GradpipeError::InvalidPartitionBound(0));
        }
        Ok(())
    }

    /// Partition size actually used, rounded up to a multiple of
    /// `8 * local_size` so every device gets an aligned slice of a partition.
    pub fn partition_bound(&self) -> usize {
        let align = 8 * self.local_size.max(1) as usize;
        self.partition_bytes.div_ceil(align) * align
    }

    /// Global rank: machines are laid out consecutively.
    pub fn rank(&self) -> Rank {
        self.worker_id * self.local_size + self.local_rank
    }

    /// Total number of processes in the job.
    pub fn size(&self) -> u32 {
        self.num_worker * self.local_size
    }

    pub fn local_rank(&self) -> Rank {
        self.local_rank
    }

    pub fn local_size(&self) -> u32 {
        self.local_size
    }

    pub fn is_distributed(&self) -> bool {
        self.num_worker > 1 || self.force_distributed
    }

    /// The last local process talks to the store for the whole machine.
    pub fn is_root_device(&self) -> bool {
        self.local_rank + 1 == self.local_size
    }

    pub fn is_cross_pcie_switch(&self) -> bool {
        self.local_size > self.pcie_switch_size()
    }

    /// The last process of each PCIe switch group issues that group's
    /// collective calls.
    pub fn is_signal_root(&self) -> bool {
        let switch = self.pcie_switch_size();
        let group_end = ((self.local_rank / switch + 1) * switch).min(self.local_size);
        self.local_rank + 1 == group_end
    }

    /// Number of PCIe switch groups on this machine.
    pub fn num_pcie_switches(&self) -> usize {
        (self.local_size as usize).div_ceil(self.pcie_switch_size() as usize)
    }

    /// True on the single process allowed to seed initial values into the store.
    pub fn is_initializer(&self) -> bool {
        self.worker_id == self.initializer_worker
    }

    /// Snapshot the boolean facts stage derivation depends on.
    pub fn topology(&self) -> TopologyFacts {
        TopologyFacts {
            is_distributed: self.is_distributed(),
            is_root_device: self.is_root_device(),
            is_cross_pcie_switch: self.is_cross_pcie_switch(),
            is_signal_root: self.is_signal_root(),
        }
    }

    fn pcie_switch_size(&self) -> u32 {
        self.pcie_switch_size.max(1)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}
