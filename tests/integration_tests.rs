//! Integration tests for framepool.

use framepool::gpu::{DeviceCaps, DummyForeignApi, ForeignApi, QueueKind, ResourceKind};
use framepool::{
    copy_from_foreign, copy_from_system, copy_memory, copy_to_system, ensure_registered, ContextThread,
    CopyPath, DeviceConfig, DeviceRegistry, DirectAllocator, DummyBackend, FrameAllocator, FrameError,
    FrameLayout, MapFlags, MemoryShape, PoolAllocator, PoolConfig, PoolPhase, SystemFrame, TransferFlags,
    VideoFormat, WaitStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open(registry: &DeviceRegistry, backend: &Arc<DummyBackend>, config: DeviceConfig) -> framepool::Device {
    registry.open(backend.clone(), config).unwrap()
}

fn nv12() -> MemoryShape {
    MemoryShape::new(VideoFormat::NV12, 64, 32)
}

fn pattern_frame(format: VideoFormat, width: u32, height: u32) -> SystemFrame {
    let mut frame = SystemFrame::new(format, width, height);
    let bytes = frame.as_mut_slice();
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (i * 7 % 251) as u8;
    }
    frame
}

#[test]
fn test_pool_counts_balance_under_contention() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());

    let pool = Arc::new(PoolAllocator::new(&device, nv12()));
    pool.configure(nv12(), 0, 3).unwrap();
    pool.set_active(true).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..50 {
                    let memory = pool.acquire().unwrap();
                    let stats = pool.stats();
                    assert_eq!(stats.outstanding + stats.queued, stats.created);
                    assert!(stats.created <= 3);
                    drop(memory);

                    let stats = pool.stats();
                    assert_eq!(stats.outstanding + stats.queued, stats.created);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.queued, stats.created);
    assert_eq!(stats.acquires, 400);
    assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), stats.created);
}

#[test]
fn test_host_write_then_device_read_uploads_once() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());
    let memory = DirectAllocator::alloc(&device, nv12()).unwrap();

    let mut map = memory.map_for_host(MapFlags::WRITE).unwrap();
    let pattern: Vec<u8> = (0..map.as_slice().len()).map(|i| (i % 253) as u8).collect();
    map.as_mut_slice().unwrap().copy_from_slice(&pattern);
    map.unmap();

    let device_map = memory.map_for_device(MapFlags::READ | MapFlags::DEVICE).unwrap();
    let handle = device_map.handle();
    device_map.unmap();
    memory.map_for_device(MapFlags::READ | MapFlags::DEVICE).unwrap().unmap();

    assert_eq!(backend.counters().uploads.get(), 1);
    let on_device = backend.read_resource(&handle.resource).unwrap();
    let start = handle.offset as usize;
    for plane in memory.layout().planes() {
        for row in 0..plane.rows {
            let at = plane.offset + row as usize * plane.stride;
            assert_eq!(
                &on_device[start + at..start + at + plane.row_bytes],
                &pattern[at..at + plane.row_bytes]
            );
        }
    }
}

#[test]
fn test_device_write_then_host_reads_download_once() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());
    let memory = DirectAllocator::alloc(&device, nv12()).unwrap();

    // First host map creates staging and pulls the initial contents
    memory.map_for_host(MapFlags::READ).unwrap().unmap();
    let baseline = backend.counters().downloads.get();

    memory.map_for_device(MapFlags::WRITE | MapFlags::DEVICE).unwrap().unmap();
    assert!(memory.transfer_flags().contains(TransferFlags::NEED_DOWNLOAD));

    memory.map_for_host(MapFlags::READ).unwrap().unmap();
    memory.map_for_host(MapFlags::READ).unwrap().unmap();
    assert_eq!(backend.counters().downloads.get(), baseline + 1);
    assert!(!memory.transfer_flags().contains(TransferFlags::NEED_DOWNLOAD));
}

#[test]
fn test_acquire_fails_fast_when_not_active() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());

    let never_active = PoolAllocator::new(&device, nv12());
    assert_eq!(never_active.acquire().unwrap_err(), FrameError::Flushing);
    assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 0);

    let pool = PoolAllocator::new(&device, nv12());
    pool.configure(nv12(), 0, 1).unwrap();
    pool.set_active(true).unwrap();
    let held = pool.acquire().unwrap();
    pool.set_active(false).unwrap();
    assert_eq!(pool.phase(), PoolPhase::Flushing);

    // Would block if the pool were active, so this must return on its own
    let (tx, rx) = mpsc::channel();
    let pool = Arc::new(pool);
    let worker = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || tx.send(pool.acquire().map(|m| m.id())).unwrap())
    };
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.unwrap_err().is_flushing());
    worker.join().unwrap();

    assert_eq!(pool.stats().created, 1);
    drop(held);
}

#[test]
fn test_deactivate_frees_after_last_release() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());
    let pool = PoolAllocator::new(&device, nv12());
    pool.configure(nv12(), 0, 0).unwrap();
    pool.set_active(true).unwrap();

    let mut held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
    let queued = held.pop().unwrap();
    drop(queued);
    pool.set_active(false).unwrap();

    let counters = backend.counters();
    assert_eq!(counters.device_resources_created.get(), 4);
    assert_eq!(counters.device_resources_destroyed.get(), 0);

    // Returning Memories are requeued; nothing is freed until the last one is back
    let mut released = 0;
    while let Some(memory) = held.pop() {
        assert_eq!(counters.device_resources_destroyed.get(), 0);
        assert_ne!(pool.phase(), PoolPhase::Inactive);
        drop(memory);
        released += 1;
    }

    assert_eq!(released, 3);
    assert_eq!(pool.phase(), PoolPhase::Inactive);
    assert_eq!(counters.device_resources_destroyed.get(), 4);
    assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 0);

    drop(pool);
    assert_eq!(counters.device_resources_destroyed.get(), 4);
}

#[test]
fn test_fence_wait_blocks_until_completion() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());
    let fence = device.create_fence().unwrap();

    let done = device.next_fence_value();
    fence.signal(QueueKind::Copy, done).unwrap();
    let waits = backend.counters().blocking_waits.get();
    assert_eq!(fence.wait(None).unwrap(), WaitStatus::Completed);
    assert_eq!(backend.counters().blocking_waits.get(), waits);

    backend.set_auto_complete(false);
    let pending = device.next_fence_value();
    fence.signal(QueueKind::Copy, pending).unwrap();

    let completed = Arc::new(AtomicBool::new(false));
    let completer = {
        let backend = Arc::clone(&backend);
        let completed = Arc::clone(&completed);
        let native = fence.native();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            completed.store(true, Ordering::SeqCst);
            backend.complete_fence(native, pending);
        })
    };

    assert_eq!(fence.wait(None).unwrap(), WaitStatus::Completed);
    assert!(completed.load(Ordering::SeqCst));
    assert_eq!(backend.counters().blocking_waits.get(), waits + 1);
    completer.join().unwrap();
}

#[test]
fn test_blocked_acquire_gets_released_memory() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());
    let pool = Arc::new(PoolAllocator::new(&device, nv12()));
    pool.configure(nv12(), 0, 3).unwrap();
    pool.set_active(true).unwrap();

    let mut held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();

    let (tx, rx) = mpsc::channel();
    let fourth = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let memory = pool.acquire().unwrap();
            tx.send(memory.id()).unwrap();
            memory
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(pool.stats().created, 3);

    let released = held.remove(1);
    let released_id = released.id();
    drop(released);

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), released_id);
    let memory = fourth.join().unwrap();
    assert_eq!(memory.id(), released_id);
    assert_eq!(pool.stats().created, 3);
    assert!(pool.stats().waits >= 1);
}

fn cross_device_copy(config: DeviceConfig) -> (CopyPath, SystemFrame) {
    let registry = DeviceRegistry::new();
    let a = open(&registry, &Arc::new(DummyBackend::new(0)), config.clone());
    let b = open(&registry, &Arc::new(DummyBackend::new(1)), config);

    let src = DirectAllocator::alloc(&a, MemoryShape::new(VideoFormat::I420, 40, 22)).unwrap();
    let dst = DirectAllocator::alloc(&b, MemoryShape::new(VideoFormat::I420, 40, 22)).unwrap();
    copy_from_system(&src, &pattern_frame(VideoFormat::I420, 40, 22)).unwrap();

    let path = copy_memory(&dst, &src).unwrap();
    let mut out = SystemFrame::new(VideoFormat::I420, 40, 22);
    copy_to_system(&mut out, &dst).unwrap();
    (path, out)
}

#[test]
fn test_cross_device_copy_without_peer_matches_direct() {
    init();
    let (peer_path, peer_out) = cross_device_copy(DeviceConfig::default());
    let (host_path, host_out) = cross_device_copy(DeviceConfig::isolated());

    assert_eq!(peer_path, CopyPath::PeerCopy);
    assert_eq!(host_path, CopyPath::HostStaging);
    assert_eq!(peer_out.as_slice(), host_out.as_slice());

    let expected = pattern_frame(VideoFormat::I420, 40, 22);
    for plane in 0..3 {
        for row in 0..expected.layout().plane(plane).rows {
            assert_eq!(host_out.row(plane, row), expected.row(plane, row));
        }
    }
}

#[test]
fn test_second_registration_is_cached() {
    init();
    let api = DummyForeignApi::new(ForeignApi::D3D11);
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0).with_foreign_api(Arc::clone(&api)));
    let device = open(&registry, &backend, DeviceConfig::default());
    let buffer = api.create_buffer(FrameLayout::packed(VideoFormat::NV12, 64, 32), 0x21);
    let memory = DirectAllocator::alloc(&device, nv12()).unwrap();

    let first = ensure_registered(&device, &buffer).unwrap();
    let second = ensure_registered(&device, &buffer).unwrap();
    assert_eq!(first.token(), second.token());
    assert_eq!(backend.counters().registrations.get(), 1);

    copy_from_foreign(&memory, &buffer).unwrap();
    copy_from_foreign(&memory, &buffer).unwrap();
    assert_eq!(backend.counters().registrations.get(), 1);
}

#[test]
fn test_device_reuse_and_symmetric_peers() {
    init();
    let registry = DeviceRegistry::new();
    let a_backend = Arc::new(DummyBackend::new(0));
    let b_backend = Arc::new(DummyBackend::new(1));
    let a = open(&registry, &a_backend, DeviceConfig::default());
    let b = open(&registry, &b_backend, DeviceConfig::default());

    // Same LUID, new backend: the live device wins
    let again = registry
        .open(Arc::new(DummyBackend::new(0)), DeviceConfig::default())
        .unwrap();
    assert_eq!(again, a);
    assert_eq!(registry.len(), 2);

    assert!(a.can_access_peer(&b) && b.can_access_peer(&a));
    let b_luid = b.luid();
    drop(b);
    assert!(!a_backend.has_peer(b_luid));
    assert!(registry.find(b_luid).is_none());
}

#[test]
fn test_deferred_release_waits_for_fence() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());
    let memory = DirectAllocator::alloc(&device, nv12()).unwrap();
    memory.map_for_host(MapFlags::READ).unwrap().unmap();

    backend.set_auto_complete(false);
    let fence = device.create_fence().unwrap();
    let value = device.next_fence_value();
    fence.signal(QueueKind::Direct, value).unwrap();
    memory.set_fence(Arc::clone(&fence), value);
    drop(memory);

    assert_eq!(device.pending_releases(), 1);
    assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 1);
    assert_eq!(backend.live_resources(ResourceKind::Staging), 1);

    backend.complete_fence(fence.native(), value);
    backend.set_auto_complete(true);

    // Allocating sweeps completed releases
    let _next = DirectAllocator::alloc(&device, nv12()).unwrap();
    assert_eq!(device.pending_releases(), 0);
    assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 1);
    assert_eq!(backend.live_resources(ResourceKind::Staging), 0);
}

#[test]
fn test_context_thread_round_trip() {
    init();
    let worker = ContextThread::spawn("integration-gl").unwrap();
    let caller = thread::current().id();

    let (ran_on, value) = worker.run(|| (thread::current().id(), 6 * 7)).unwrap();
    assert_eq!(value, 42);
    assert_eq!(ran_on, worker.thread_id());
    assert_ne!(ran_on, caller);
}

#[test]
fn test_layout_offsets() {
    let i420 = FrameLayout::pitched(&MemoryShape::new(VideoFormat::I420, 100, 51), 64);
    let pitch = i420.plane(0).stride;
    assert_eq!(pitch, 128);
    assert_eq!(i420.plane(1).offset, pitch * 51);
    assert_eq!(i420.plane(2).offset, pitch * 51 + pitch * 26);

    let nv12 = FrameLayout::pitched(&MemoryShape::new(VideoFormat::NV12, 64, 32), 64);
    assert_eq!(nv12.n_planes(), 2);
    assert_eq!(nv12.plane(1).offset, 64 * 32);

    let gbra = FrameLayout::pitched(&MemoryShape::new(VideoFormat::GBRA, 16, 10), 64);
    let offsets: Vec<_> = gbra.planes().iter().map(|p| p.offset).collect();
    assert_eq!(offsets, vec![0, 640, 1280, 1920]);

    let packed = FrameLayout::packed(VideoFormat::RGBA, 3, 2);
    assert_eq!(packed.n_planes(), 1);
    assert_eq!(packed.plane(0).stride, 12);
}

#[test]
fn test_frame_allocator_variants() {
    init();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(DummyBackend::new(0));
    let device = open(&registry, &backend, DeviceConfig::default());

    let direct = FrameAllocator::direct(&device, nv12());
    direct.set_active(false).unwrap();
    let memory = direct.allocate().unwrap();
    assert!(!memory.is_pooled());
    drop(memory);
    assert_eq!(backend.live_resources(ResourceKind::DeviceLocal), 0);

    let pool = PoolAllocator::with_config(&device, &PoolConfig::bounded(nv12(), 2)).unwrap();
    let pooled = FrameAllocator::from(pool);
    assert!(pooled.allocate().unwrap_err().is_flushing());
    pooled.set_active(true).unwrap();
    let memory = pooled.allocate().unwrap();
    assert!(memory.is_pooled());
}

#[test]
fn test_gl_interop_falls_back_without_caps() {
    init();
    let api = DummyForeignApi::with_context_thread(ForeignApi::Gl, "integration-gl-fallback").unwrap();
    let registry = DeviceRegistry::new();
    let backend = Arc::new(
        DummyBackend::new(0)
            .with_caps(DeviceCaps::all() - DeviceCaps::GL_INTEROP)
            .with_foreign_api(Arc::clone(&api)),
    );
    let device = open(&registry, &backend, DeviceConfig::default());
    let buffer = api.create_buffer(FrameLayout::packed(VideoFormat::NV12, 64, 32), 0x44);
    let memory = DirectAllocator::alloc(&device, nv12()).unwrap();

    assert_eq!(copy_from_foreign(&memory, &buffer).unwrap(), CopyPath::HostStaging);
    let mut out = SystemFrame::new(VideoFormat::NV12, 64, 32);
    copy_to_system(&mut out, &memory).unwrap();
    assert!(out.row(0, 31).iter().all(|&b| b == 0x44));
}
