use super::helpers::*;
use gradpipe::{DeviceId, GradpipeConfig, InMemoryStore, KvStore, Stage};
use std::sync::Arc;

fn distributed(local_rank: u32) -> GradpipeConfig {
    GradpipeConfig {
        num_worker: 2,
        local_rank,
        local_size: 4,
        pcie_switch_size: 2,
        partition_bytes: 32,
        ..GradpipeConfig::default()
    }
}

fn store() -> Option<Arc<dyn KvStore>> {
    Some(Arc::new(InMemoryStore::new(1, 1)))
}

#[test]
fn distributed_root_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), distributed(3), store()).unwrap();
    let gpu = DeviceId::Gpu(3);

    assert_eq!(
        &*backend.push_queue_list(gpu),
        &[Stage::Reduce, Stage::CopyD2H, Stage::PcieReduce, Stage::Push]
    );
    assert_eq!(
        &*backend.pull_queue_list(gpu),
        &[Stage::Pull, Stage::CopyH2D, Stage::Broadcast]
    );
    assert_eq!(
        backend.stages(),
        vec![
            Stage::Reduce,
            Stage::CopyD2H,
            Stage::PcieReduce,
            Stage::Push,
            Stage::Pull,
            Stage::CopyH2D,
            Stage::Broadcast,
        ]
    );
}

#[test]
fn distributed_non_root_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), distributed(0), None).unwrap();
    let gpu = DeviceId::Gpu(0);

    assert_eq!(
        &*backend.push_queue_list(gpu),
        &[
            Stage::CoordinateReduce,
            Stage::Reduce,
            Stage::CopyD2H,
            Stage::PcieReduce,
            Stage::CoordinatePush,
        ]
    );
    assert_eq!(
        &*backend.pull_queue_list(gpu),
        &[Stage::CopyH2D, Stage::CoordinateBroadcast, Stage::Broadcast]
    );
    assert!(!backend.stages().contains(&Stage::Push));
}

#[test]
fn signal_root_of_first_switch() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), distributed(1), None).unwrap();
    let facts = backend.topology();
    assert!(facts.is_signal_root);
    assert!(!facts.is_root_device);
    assert_eq!(backend.push_queue_list(DeviceId::Gpu(1))[0], Stage::Reduce);
}

#[test]
fn forced_distributed_single_worker() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = GradpipeConfig {
        force_distributed: true,
        ..local_config(8)
    };
    let backend = backend_in(dir.path(), cfg, store()).unwrap();
    assert_eq!(
        &*backend.push_queue_list(DeviceId::Gpu(0)),
        &[Stage::Reduce, Stage::CopyD2H, Stage::Push]
    );
    assert_eq!(
        &*backend.pull_queue_list(DeviceId::Gpu(0)),
        &[Stage::Pull, Stage::CopyH2D, Stage::Broadcast]
    );
}

#[test]
fn full_push_and_pull_run_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), distributed(3), store()).unwrap();
    declare_and_init(&backend, "w", 100);
    let ctx = backend.context("w").unwrap();
    let parts = ctx.key_list().len();
    assert_eq!(parts, 4);
    assert_eq!(ctx.pcie_cpubuff().len(), 2);

    let gpu = DeviceId::Gpu(3);
    let (push_cb, push_rx) = recording_callback();
    backend
        .enqueue_tensor(
            &ctx,
            transfer("w", byte_tensor(100), gpu),
            push_cb,
            backend.push_queue_list(gpu),
        )
        .unwrap();
    assert_eq!(drain(&backend), 4 * parts);
    assert_eq!(push_rx.try_recv().unwrap(), Ok(()));

    let (pull_cb, pull_rx) = recording_callback();
    backend
        .enqueue_tensor(
            &ctx,
            transfer("w", byte_tensor(100), gpu),
            pull_cb,
            backend.pull_queue_list(gpu),
        )
        .unwrap();
    assert_eq!(drain(&backend), 3 * parts);
    assert_eq!(pull_rx.try_recv().unwrap(), Ok(()));
    assert!(pull_rx.try_recv().is_err());
}
