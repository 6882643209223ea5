//! Stage pipelines derived from static topology facts.
//!
//! Only one process per device group may issue the collective call (the
//! signal root), and only one process per machine talks to the store (the
//! root device). Everyone else takes a `Coordinate*` stage first, so each
//! resource keeps exactly one authoritative path.

use crate::types::{DeviceId, Stage};

/// The facts stage derivation depends on, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TopologyFacts {
    /// More than one machine takes part (or distributed mode is forced).
    pub is_distributed: bool,
    /// This process talks to the store on behalf of its machine.
    pub is_root_device: bool,
    /// Local devices span more than one PCIe switch.
    pub is_cross_pcie_switch: bool,
    /// This process issues the collective calls of its device group.
    pub is_signal_root: bool,
}

impl TopologyFacts {
    /// Host and device memory must be bridged by explicit copies.
    fn needs_host_copy(&self) -> bool {
        self.is_distributed || self.is_cross_pcie_switch
    }
}

/// Stages an outbound (push / reduce) partition visits, in order.
///
/// Host-only tensors need no pipeline and get an empty list.
pub fn push_stages(facts: TopologyFacts, device: DeviceId) -> Vec<Stage> {
    let mut stages = Vec::new();
    if device.is_cpu() {
        return stages;
    }

    // Per-PCIe-switch reduce.
    if !facts.is_signal_root {
        stages.push(Stage::CoordinateReduce);
    }
    stages.push(Stage::Reduce);

    if facts.needs_host_copy() {
        stages.push(Stage::CopyD2H);
    }

    // Second reduction across switch groups, on host memory.
    if facts.is_cross_pcie_switch {
        stages.push(Stage::PcieReduce);
    }

    if facts.is_distributed {
        if facts.is_root_device {
            stages.push(Stage::Push);
        } else {
            stages.push(Stage::CoordinatePush);
        }
    }
    stages
}

/// Stages an inbound (pull / broadcast) partition visits, in order.
pub fn pull_stages(facts: TopologyFacts, device: DeviceId) -> Vec<Stage> {
    let mut stages = Vec::new();
    if device.is_cpu() {
        return stages;
    }

    if facts.is_distributed && facts.is_root_device {
        stages.push(Stage::Pull);
    }

    if facts.needs_host_copy() {
        stages.push(Stage::CopyH2D);
    }

    if !facts.is_signal_root {
        stages.push(Stage::CoordinateBroadcast);
    }
    stages.push(Stage::Broadcast);
    stages
}

/// Every stage some device tensor of this process can reach.
///
/// One queue is created per active stage at startup; a stage outside this
/// set never receives work on this process.
pub fn active_stages(facts: TopologyFacts) -> Vec<Stage> {
    let device = DeviceId::Gpu(0);
    let mut stages = push_stages(facts, device);
    for stage in pull_stages(facts, device) {
        if !stages.contains(&stage) {
            stages.push(stage);
        }
    }
    stages
}
