use super::helpers::*;
use gradpipe::{
    DataType, GradpipeConfig, GradpipeError, HostBuffer, HostRegion, InMemoryStore, Key,
    KeyEncoder, KeyRange, KvStore, RequestId,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[test]
fn init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), local_config(8), None).unwrap();
    declare_and_init(&backend, "w", 20);

    let ctx = backend.context("w").unwrap();
    let first = ctx.cpubuff().unwrap().region();
    backend.init_tensor("w", DataType::U8, None).unwrap();
    assert_eq!(ctx.cpubuff().unwrap().region(), first);
    assert!(!ctx.reuse_buff());
    assert!(dir
        .path()
        .join(format!("gradpipe_shm_{}", ctx.key_list()[0]))
        .exists());
}

#[test]
fn declared_keys_follow_registration_order() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), local_config(8), None).unwrap();
    backend.is_tensor_initialized("a", 8).unwrap();
    backend.is_tensor_initialized("b", 24).unwrap();

    let a = backend.context("a").unwrap();
    let b = backend.context("b").unwrap();
    assert_eq!(a.key_list(), &[1 << 16]);
    assert_eq!(b.key_list(), &[2 << 16, (2 << 16) + 1, (2 << 16) + 2]);
}

#[test]
fn redeclaring_with_new_size_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), local_config(8), None).unwrap();
    backend.is_tensor_initialized("a", 8).unwrap();
    let err = backend.is_tensor_initialized("a", 16).unwrap_err();
    assert!(matches!(err, GradpipeError::ContextSizeMismatch { .. }));
    assert!(err.is_fatal());
}

#[test]
fn external_buffer_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), local_config(8), None).unwrap();
    let mut data = vec![7u8; 32];
    let region = unsafe { HostRegion::from_slice(&mut data) };

    backend.is_tensor_initialized("e", 32).unwrap();
    backend.init_tensor("e", DataType::F32, Some(region)).unwrap();

    let ctx = backend.context("e").unwrap();
    assert!(ctx.reuse_buff());
    assert!(matches!(ctx.cpubuff(), Some(HostBuffer::External(r)) if r == region));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[test]
fn external_buffer_too_small_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), local_config(8), None).unwrap();
    let mut data = vec![0u8; 8];
    let region = unsafe { HostRegion::from_slice(&mut data) };

    backend.is_tensor_initialized("e", 32).unwrap();
    assert!(matches!(
        backend.init_tensor("e", DataType::F32, Some(region)),
        Err(GradpipeError::ContextSizeMismatch { registered: 32, requested: 8, .. })
    ));
    assert!(!backend.is_tensor_initialized("e", 32).unwrap());
}

#[test]
fn cross_pcie_switch_opens_one_buffer_per_switch() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = GradpipeConfig {
        local_rank: 3,
        local_size: 4,
        pcie_switch_size: 2,
        partition_bytes: 32,
        ..GradpipeConfig::default()
    };
    let backend = backend_in(dir.path(), cfg, None).unwrap();
    assert!(backend.topology().is_cross_pcie_switch);
    declare_and_init(&backend, "p", 64);

    let ctx = backend.context("p").unwrap();
    let pcie = ctx.pcie_cpubuff();
    assert_eq!(pcie.len(), 2);
    match ctx.cpubuff() {
        Some(HostBuffer::Shared(primary)) => assert_eq!(primary.path(), pcie[1].path()),
        other => panic!("expected shared primary buffer, got {other:?}"),
    }
    let key = ctx.key_list()[0];
    for i in 0..2 {
        assert!(dir.path().join(format!("gradpipe_pcie_shm_{key}_{i}")).exists());
    }
}

#[test]
fn distributed_init_seeds_store_once() {
    const SIZE: usize = 20;
    let store = Arc::new(InMemoryStore::new(2, 2));
    let seeded: Vec<u8> = (100..100 + SIZE as u8).collect();

    std::thread::scope(|s| {
        for worker in 0..2u32 {
            let store: Arc<dyn KvStore> = store.clone();
            let seeded = seeded.clone();
            s.spawn(move || {
                let dir = tempfile::tempdir().unwrap();
                let cfg = GradpipeConfig {
                    worker_id: worker,
                    num_worker: 2,
                    partition_bytes: 8,
                    ..GradpipeConfig::default()
                };
                let backend = backend_in(dir.path(), cfg, Some(store)).unwrap();
                assert!(backend.topology().is_distributed);

                let mut data = if worker == 0 { seeded } else { vec![0; SIZE] };
                let region = unsafe { HostRegion::from_slice(&mut data) };
                backend.is_tensor_initialized("w", SIZE).unwrap();
                backend.init_tensor("w", DataType::U8, Some(region)).unwrap();
                assert!(backend.is_tensor_initialized("w", SIZE).unwrap());
            });
        }
    });

    assert_eq!(store.push_count(), 3);
    assert_eq!(store.barrier_count(), 2 * 3);

    let encoder = KeyEncoder::new(store.server_key_ranges()).unwrap();
    let base = 1u64 << 16;
    for (i, chunk) in seeded.chunks(8).enumerate() {
        let pskv = encoder.encode(base + i as u64, chunk.len()).unwrap();
        assert_eq!(store.get(pskv.keys[0]).as_deref(), Some(chunk));
    }
}

#[test]
fn non_root_device_skips_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new(1, 2));
    let cfg = GradpipeConfig {
        num_worker: 2,
        local_rank: 0,
        local_size: 2,
        partition_bytes: 16,
        ..GradpipeConfig::default()
    };
    let backend = backend_in(dir.path(), cfg, Some(store.clone())).unwrap();
    assert!(!backend.topology().is_root_device);
    declare_and_init(&backend, "w", 40);
    assert_eq!(store.push_count(), 0);
    assert_eq!(store.barrier_count(), 0);
}

#[test]
fn enqueue_init_reports_through_callback() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_in(dir.path(), local_config(8), None).unwrap();

    let (cb, rx) = recording_callback();
    backend.enqueue_tensor_init("ghost", DataType::U8, None, cb);
    let msg = rx.try_recv().unwrap().unwrap_err();
    assert!(msg.contains("ghost"), "{msg}");

    backend.is_tensor_initialized("w", 16).unwrap();
    let (cb, rx) = recording_callback();
    backend.enqueue_tensor_init("w", DataType::U8, None, cb);
    assert_eq!(rx.try_recv().unwrap(), Ok(()));
}

/// Store whose first push fails; everything after succeeds.
#[derive(Default)]
struct FailOnceStore {
    failed: AtomicBool,
}

impl KvStore for FailOnceStore {
    fn server_key_ranges(&self) -> Vec<KeyRange> {
        KeyRange::even_split(1)
    }

    fn zpush(&self, _: &[Key], _: &[u8], _: &[usize], _: i32) -> gradpipe::Result<RequestId> {
        if self.failed.swap(true, Ordering::SeqCst) {
            Ok(1)
        } else {
            Err(GradpipeError::store("server unreachable"))
        }
    }

    fn wait(&self, _: RequestId) -> gradpipe::Result<()> {
        Ok(())
    }

    fn barrier(&self) -> gradpipe::Result<()> {
        Ok(())
    }
}

#[test]
fn retry_keeps_buffer_bound_by_failed_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = GradpipeConfig {
        force_distributed: true,
        ..local_config(8)
    };
    let store: Arc<dyn KvStore> = Arc::new(FailOnceStore::default());
    let backend = backend_in(dir.path(), cfg, Some(store)).unwrap();
    backend.is_tensor_initialized("w", 16).unwrap();

    assert!(matches!(
        backend.init_tensor("w", DataType::U8, None),
        Err(GradpipeError::Store(_))
    ));
    let ctx = backend.context("w").unwrap();
    assert!(!ctx.is_initialized());
    let bound = ctx.cpubuff().unwrap().region();

    let mut data = vec![0u8; 16];
    let region = unsafe { HostRegion::from_slice(&mut data) };
    let err = backend
        .init_tensor("w", DataType::U8, Some(region))
        .unwrap_err();
    assert!(matches!(
        err,
        GradpipeError::HostBufferConflict { offered, .. } if offered == region
    ));
    assert!(err.is_fatal());
    assert!(!ctx.reuse_buff());

    backend.init_tensor("w", DataType::U8, None).unwrap();
    assert!(ctx.is_initialized());
    assert_eq!(ctx.cpubuff().unwrap().region(), bound);
}

#[test]
fn retry_with_same_external_buffer_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = GradpipeConfig {
        force_distributed: true,
        ..local_config(8)
    };
    let store: Arc<dyn KvStore> = Arc::new(FailOnceStore::default());
    let backend = backend_in(dir.path(), cfg, Some(store)).unwrap();
    backend.is_tensor_initialized("w", 16).unwrap();

    let mut data = vec![1u8; 16];
    let region = unsafe { HostRegion::from_slice(&mut data) };
    assert!(backend.init_tensor("w", DataType::U8, Some(region)).is_err());
    backend.init_tensor("w", DataType::U8, Some(region)).unwrap();

    let ctx = backend.context("w").unwrap();
    assert!(ctx.reuse_buff());
    assert!(ctx.is_initialized());
}
