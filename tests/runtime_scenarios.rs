//! End-to-end runtime scenarios on the CPU simulator backend

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ignis::device::cpu_simulator;
use ignis::kernel::{KernelArtifact, ParamDescriptor, ParamLayout};
use ignis::{
    Accelerator, BackendKind, Context, DeviceFilter, Error, ExecutionStrategy, HybridDispatcher,
    KernelSignature, LaunchDims, LayoutHint, RuntimeConfig, Shape,
};

fn init_tracing() {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn cpu_accelerator() -> (Context, Accelerator) {
    init_tracing();
    let context = Context::new().unwrap();
    let device = context
        .discover(&DeviceFilter::backend(BackendKind::Cpu))
        .remove(0);
    let accel = context.create_accelerator(&device).unwrap();
    (context, accel)
}

fn iota_signature() -> KernelSignature {
    KernelSignature::new("fill_index", BackendKind::Cpu)
        .with_param(ParamDescriptor::view::<i32>())
}

fn iota_artifact() -> KernelArtifact {
    let layout = ParamLayout::from_descriptors(&[ParamDescriptor::view::<i32>()]);
    KernelArtifact::host_fn("fill_index", layout, |ctx| {
        let out = ctx.view_mut::<i32>(0)?;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = i as i32;
        }
        Ok(())
    })
}

#[test]
fn basic_launch_writes_indices() {
    let (_context, accel) = cpu_accelerator();

    let buffer = accel
        .allocate::<i32>(Shape::D1(1000), LayoutHint::GpuOptimized)
        .unwrap();
    let launcher = accel
        .load_kernel_cached(&iota_signature(), "1.0.0", || Ok(iota_artifact()))
        .unwrap();

    launcher
        .launch_sync(
            LaunchDims::grid_for(1000, 256),
            LaunchDims::linear(256),
            vec![buffer.view().arg()],
            accel.default_stream(),
        )
        .unwrap();

    let mut host = vec![0i32; 1000];
    buffer.copy_to_host(&mut host).unwrap();
    for (i, v) in host.iter().enumerate() {
        assert_eq!(*v, i as i32);
    }
}

#[test]
fn identity_kernel_preserves_payload() {
    let (_context, accel) = cpu_accelerator();

    let signature = KernelSignature::new("identity", BackendKind::Cpu)
        .with_param(ParamDescriptor::view::<u64>())
        .with_param(ParamDescriptor::view::<u64>());
    let layout = ParamLayout::from_descriptors(&[
        ParamDescriptor::view::<u64>(),
        ParamDescriptor::view::<u64>(),
    ]);
    let artifact = KernelArtifact::host_fn("identity", layout, |ctx| {
        let src = ctx.view::<u64>(0)?;
        let dst = ctx.view_mut::<u64>(1)?;
        dst.copy_from_slice(src);
        Ok(())
    });
    let launcher = accel
        .load_kernel_cached(&signature, "1.0.0", || Ok(artifact))
        .unwrap();

    let xs: Vec<u64> = (0..4096).map(|i| i * 0x9e37_79b9).collect();
    let input = accel
        .allocate::<u64>(Shape::D1(4096), LayoutHint::GpuOptimized)
        .unwrap();
    let output = accel
        .allocate::<u64>(Shape::D1(4096), LayoutHint::GpuOptimized)
        .unwrap();
    input.copy_from_host(&xs, None).unwrap();

    launcher
        .launch_sync(
            LaunchDims::grid_for(4096, 256),
            LaunchDims::linear(256),
            vec![input.view().arg(), output.view().arg()],
            accel.default_stream(),
        )
        .unwrap();

    let mut back = vec![0u64; 4096];
    output.copy_to_host(&mut back).unwrap();
    assert_eq!(back, xs);
}

#[test]
fn cache_version_semantics_and_stats() {
    let (_context, accel) = cpu_accelerator();
    let cache = accel.cache();
    let key = iota_signature().fingerprint("1.0.0");

    cache.put(key, iota_artifact(), "1.0.0", HashMap::new());
    assert!(cache.try_get(&key, "1.0.0").is_some());
    assert!(cache.try_get(&key, "2.0.0").is_none());
    cache.invalidate_version("1.0.0");
    assert!(cache.try_get(&key, "1.0.0").is_none());

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[test]
fn cached_load_round_trips_through_launch() {
    let (_context, accel) = cpu_accelerator();
    let compiles = AtomicU32::new(0);

    for _ in 0..5 {
        let launcher = accel
            .load_kernel_cached(&iota_signature(), "3.1.4", || {
                compiles.fetch_add(1, Ordering::SeqCst);
                Ok(iota_artifact())
            })
            .unwrap();
        let buffer = accel
            .allocate::<i32>(Shape::D1(128), LayoutHint::GpuOptimized)
            .unwrap();
        launcher
            .launch_sync(
                LaunchDims::grid_for(128, 128),
                LaunchDims::linear(128),
                vec![buffer.view().arg()],
                accel.default_stream(),
            )
            .unwrap();
    }
    assert_eq!(compiles.load(Ordering::SeqCst), 1);
}

#[test]
fn pool_reuse_returns_the_same_buffer() {
    let (_context, accel) = cpu_accelerator();

    let first = accel.rent::<i32>(1000).unwrap();
    let handle = first.native_handle().unwrap();
    accel.return_buffer(first, false).unwrap();

    let second = accel.rent::<i32>(1000).unwrap();
    assert_eq!(second.native_handle().unwrap(), handle);
    assert!(second.len() >= 1000);
    assert_eq!(accel.pool_stats().hits, 1);
}

#[test]
fn unified_buffer_coherence_across_a_device_increment() {
    let (_context, accel) = cpu_accelerator();

    let unified = accel.allocate_unified::<i32>(100).unwrap();
    unified.host_mut().unwrap()[5] = 42;
    unified.ensure_device().unwrap();

    let signature = KernelSignature::new("increment", BackendKind::Cpu)
        .with_param(ParamDescriptor::view::<i32>());
    let layout = ParamLayout::from_descriptors(&[ParamDescriptor::view::<i32>()]);
    let artifact = KernelArtifact::host_fn("increment", layout, |ctx| {
        for v in ctx.view_mut::<i32>(0)? {
            *v += 1;
        }
        Ok(())
    });
    let launcher = accel
        .load_kernel_cached(&signature, "1.0.0", || Ok(artifact))
        .unwrap();
    launcher
        .launch_sync(
            LaunchDims::grid_for(100, 128),
            LaunchDims::linear(128),
            vec![unified.device_arg_mut().unwrap()],
            accel.default_stream(),
        )
        .unwrap();

    unified.ensure_host().unwrap();
    assert_eq!(unified.host().unwrap()[5], 43);
    assert_eq!(unified.host().unwrap()[0], 1);
}

#[test]
fn oom_recovery_trims_then_surfaces_with_suggestion() {
    // 64 KiB simulated device
    let device = cpu_simulator(false, 64 * 1024);
    let mut config = RuntimeConfig::default();
    config.pool.max_pool_bytes = 64 * 1024;
    config.pool.max_buffer_bytes = 32 * 1024;
    let accel = Accelerator::new(device, config).unwrap();

    // drive allocations until the device is exhausted
    let mut held = Vec::new();
    let err = loop {
        match accel.rent::<u8>(16 * 1024) {
            Ok(buffer) => held.push(buffer),
            Err(e) => break e,
        }
        assert!(held.len() < 64, "device never filled");
    };

    assert!(matches!(err, Error::OutOfMemory { .. }));
    assert!(err.suggestions()[0].contains("pool.trim()"));

    // no leaks: everything handed out is accounted for
    let stats = accel.pool_stats();
    assert_eq!(stats.in_use, held.len());
    assert_eq!(stats.total, 0);

    // returning everything makes memory rentable again
    for buffer in held.drain(..) {
        accel.return_buffer(buffer, false).unwrap();
    }
    let buffer = accel.rent::<u8>(16 * 1024).unwrap();
    assert!(buffer.len() >= 16 * 1024);
}

#[test]
fn context_shutdown_cascades_into_held_buffers() {
    let (context, accel) = cpu_accelerator();
    let buffer = accel
        .allocate::<i32>(Shape::D1(128), LayoutHint::GpuOptimized)
        .unwrap();
    let unified = accel.allocate_unified::<i32>(32).unwrap();

    context.shutdown().unwrap();

    assert!(buffer.is_disposed());
    assert!(unified.is_disposed());
    let mut host = vec![0i32; 128];
    assert!(matches!(
        buffer.copy_to_host(&mut host),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn stream_orders_copies_before_launches() {
    let (_context, accel) = cpu_accelerator();
    let stream = accel.create_stream().unwrap();

    let buffer = accel
        .allocate::<i32>(Shape::D1(256), LayoutHint::GpuOptimized)
        .unwrap();
    let xs: Vec<i32> = (0..256).collect();
    // async upload, then a launch that reads it on the same stream
    buffer.copy_from_host(&xs, Some(&stream)).unwrap();

    let signature = KernelSignature::new("double", BackendKind::Cpu)
        .with_param(ParamDescriptor::view::<i32>());
    let layout = ParamLayout::from_descriptors(&[ParamDescriptor::view::<i32>()]);
    let artifact = KernelArtifact::host_fn("double", layout, |ctx| {
        for v in ctx.view_mut::<i32>(0)? {
            *v *= 2;
        }
        Ok(())
    });
    let launcher = accel
        .load_kernel_cached(&signature, "1.0.0", || Ok(artifact))
        .unwrap();
    launcher
        .launch(
            LaunchDims::grid_for(256, 128),
            LaunchDims::linear(128),
            vec![buffer.view().arg()],
            &stream,
        )
        .unwrap();

    let mut host = vec![0i32; 256];
    buffer.copy_to_host_on(&mut host, &stream).unwrap();
    for (i, v) in host.iter().enumerate() {
        assert_eq!(*v, 2 * i as i32);
    }
}

#[test]
fn dispatcher_end_to_end_over_context() {
    let context = Context::new().unwrap();
    let device = context
        .discover(&DeviceFilter::backend(BackendKind::CpuSimd))
        .remove(0);
    let accel = context.create_accelerator(&device).unwrap();
    let dispatcher = HybridDispatcher::new(accel);

    let len = 50_000;
    let xs: Vec<f32> = (0..len).map(|i| i as f32).collect();
    let a = dispatcher
        .accelerator()
        .allocate::<f32>(Shape::D1(len), LayoutHint::GpuOptimized)
        .unwrap();
    a.copy_from_host(&xs, None).unwrap();
    let b = dispatcher
        .accelerator()
        .allocate::<f32>(Shape::D1(len), LayoutHint::GpuOptimized)
        .unwrap();
    b.copy_from_host(&xs, None).unwrap();
    let out = dispatcher
        .accelerator()
        .allocate::<f32>(Shape::D1(len), LayoutHint::GpuOptimized)
        .unwrap();

    dispatcher
        .add(&a, &b, &out, ExecutionStrategy::Hybrid)
        .unwrap();

    let mut host = vec![0.0f32; len];
    out.copy_to_host(&mut host).unwrap();
    for (i, v) in host.iter().enumerate() {
        assert_eq!(*v, 2.0 * i as f32);
    }
    context.shutdown().unwrap();
}

#[tokio::test]
async fn async_launch_reports_elapsed_time() {
    let device = cpu_simulator(false, 16 * 1024 * 1024);
    let accel = Accelerator::new(device, RuntimeConfig::default()).unwrap();

    let launcher = accel
        .load_kernel_cached(&iota_signature(), "1.0.0", || Ok(iota_artifact()))
        .unwrap();
    let buffer = accel
        .allocate::<i32>(Shape::D1(512), LayoutHint::GpuOptimized)
        .unwrap();

    let result = launcher
        .launch_async(
            LaunchDims::grid_for(512, 256),
            LaunchDims::linear(256),
            vec![buffer.view().arg()],
            accel.default_stream(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.status, ignis::LaunchStatus::Completed);

    let mut host = vec![0i32; 512];
    buffer.copy_to_host(&mut host).unwrap();
    assert_eq!(host[511], 511);
}

#[tokio::test]
async fn cancelled_launch_is_dropped_at_the_enqueue_boundary() {
    let device = cpu_simulator(false, 16 * 1024 * 1024);
    let accel = Accelerator::new(device, RuntimeConfig::default()).unwrap();

    let ran = Arc::new(AtomicU32::new(0));
    let ran_in_kernel = ran.clone();
    let layout = ParamLayout::from_descriptors(&[]);
    let artifact = KernelArtifact::host_fn("observed", layout, move |_| {
        ran_in_kernel.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let signature = KernelSignature::new("observed", BackendKind::Cpu);
    let launcher = accel
        .load_kernel_cached(&signature, "1.0.0", || Ok(artifact))
        .unwrap();

    let cancel = ignis::CancelFlag::new();
    cancel.cancel();
    let result = launcher
        .launch_async(
            LaunchDims::linear(1),
            LaunchDims::ONE,
            vec![],
            accel.default_stream(),
            Some(&cancel),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ignis::LaunchStatus::Cancelled);
    accel.default_stream().synchronize().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
