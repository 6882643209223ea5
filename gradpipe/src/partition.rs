use crate::error::{GradpipeError, Result};
use crate::task::TaskEntry;

/// Split `entry` into contiguous partitions of at most `bound` bytes.
///
/// Partitions cover `[0, size)` in ascending offset order and share every
/// `Arc` field of the template. Keys are left unassigned: dispatch assigns
/// them after checking the count against the tensor's key list.
pub fn partition_tensor(entry: &TaskEntry, bound: usize) -> Result<Vec<TaskEntry>> {
    if bound == 0 {
        return Err(GradpipeError::InvalidPartitionBound(bound));
    }
    let size = entry.transfer_size();
    let mut partitions = Vec::with_capacity(size.div_ceil(bound));

    let mut accumulated = 0;
    while accumulated < size {
        let len = (size - accumulated).min(bound);
        let mut part = entry.clone();
        part.tensor_name = format!("{}_{}", entry.tensor_name, partitions.len());
        part.key = None;
        part.offset = accumulated;
        part.len = len;
        part.stage_cursor = 0;
        partitions.push(part);
        accumulated += len;
    }
    Ok(partitions)
}
