//! Buffer hierarchy properties: transfer round trips, view bounds,
//! disposal semantics

use ignis::device::cpu_simulator;
use ignis::{Accelerator, Error, LayoutHint, RuntimeConfig, Shape};
use proptest::prelude::*;

fn accelerator() -> Accelerator {
    let device = cpu_simulator(false, 64 * 1024 * 1024);
    Accelerator::new(device, RuntimeConfig::default()).unwrap()
}

proptest! {
    #[test]
    fn host_round_trip_is_bitwise_for_f32(xs in proptest::collection::vec(any::<f32>(), 1..512)) {
        let accel = accelerator();
        let buffer = accel
            .allocate::<f32>(Shape::D1(xs.len()), LayoutHint::GpuOptimized)
            .unwrap();
        buffer.copy_from_host(&xs, None).unwrap();
        let mut back = vec![0.0f32; xs.len()];
        buffer.copy_to_host(&mut back).unwrap();
        // bitwise, so NaN payloads survive too
        for (a, b) in xs.iter().zip(&back) {
            prop_assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn host_round_trip_is_exact_for_u64(xs in proptest::collection::vec(any::<u64>(), 1..512)) {
        let accel = accelerator();
        let buffer = accel
            .allocate::<u64>(Shape::D1(xs.len()), LayoutHint::GpuOptimized)
            .unwrap();
        buffer.copy_from_host(&xs, None).unwrap();
        let mut back = vec![0u64; xs.len()];
        buffer.copy_to_host(&mut back).unwrap();
        prop_assert_eq!(xs, back);
    }

    #[test]
    fn subview_round_trip_reads_the_right_window(
        len in 1usize..256,
        offset_frac in 0.0f64..1.0,
        extent_frac in 0.0f64..1.0,
    ) {
        let accel = accelerator();
        let offset = ((len as f64) * offset_frac) as usize;
        let extent = (((len - offset) as f64) * extent_frac) as usize;

        let xs: Vec<i32> = (0..len as i32).collect();
        let buffer = accel
            .allocate::<i32>(Shape::D1(len), LayoutHint::GpuOptimized)
            .unwrap();
        buffer.copy_from_host(&xs, None).unwrap();

        let window = buffer.subview(offset, extent).unwrap().read_to_vec().unwrap();
        prop_assert_eq!(&window[..], &xs[offset..offset + extent]);
    }
}

#[test]
fn empty_subview_at_the_end_is_valid() {
    let accel = accelerator();
    let buffer = accel
        .allocate::<i32>(Shape::D1(100), LayoutHint::GpuOptimized)
        .unwrap();

    let empty = buffer.subview(100, 0).unwrap();
    assert!(empty.is_empty());

    assert!(matches!(
        buffer.subview(100, 1),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        buffer.subview(99, 2),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn every_operation_after_dispose_is_invalid_argument() {
    let accel = accelerator();
    let buffer = accel
        .allocate::<i32>(Shape::D1(64), LayoutHint::GpuOptimized)
        .unwrap();
    let view = buffer.view();
    buffer.dispose().unwrap();

    assert!(buffer.is_disposed());
    let mut host = vec![0i32; 64];
    assert!(matches!(
        buffer.copy_to_host(&mut host),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        buffer.copy_from_host(&host, None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        buffer.fill_zero(None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(buffer.native_handle(), Err(Error::InvalidArgument(_))));
    assert!(matches!(view.read_to_vec(), Err(Error::InvalidArgument(_))));
    // double dispose is also rejected
    assert!(matches!(buffer.dispose(), Err(Error::InvalidArgument(_))));
}

#[test]
fn views_do_not_keep_dropped_buffers_alive() {
    let accel = accelerator();
    let view = {
        let buffer = accel
            .allocate::<i32>(Shape::D1(16), LayoutHint::GpuOptimized)
            .unwrap();
        buffer.view()
    };
    assert!(matches!(view.read_to_vec(), Err(Error::InvalidArgument(_))));
}

#[test]
fn copy_to_requires_matching_lengths() {
    let accel = accelerator();
    let a = accel
        .allocate::<f64>(Shape::D1(32), LayoutHint::GpuOptimized)
        .unwrap();
    let b = accel
        .allocate::<f64>(Shape::D1(16), LayoutHint::GpuOptimized)
        .unwrap();
    let err = a.copy_to(&b, None).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(err.is_fatal());
}

#[test]
fn copy_to_moves_data_between_buffers() {
    let accel = accelerator();
    let xs: Vec<f64> = (0..128).map(|i| i as f64 / 3.0).collect();
    let a = accel
        .allocate::<f64>(Shape::D1(128), LayoutHint::GpuOptimized)
        .unwrap();
    a.copy_from_host(&xs, None).unwrap();
    let b = accel
        .allocate::<f64>(Shape::D1(128), LayoutHint::GpuOptimized)
        .unwrap();
    a.copy_to(&b, None).unwrap();

    let mut back = vec![0.0f64; 128];
    b.copy_to_host(&mut back).unwrap();
    assert_eq!(back, xs);
}

#[test]
fn cross_accelerator_copy_stages_through_the_host() {
    let a_accel = accelerator();
    let b_accel = accelerator();

    let xs: Vec<u32> = (0..64).collect();
    let src = a_accel
        .allocate::<u32>(Shape::D1(64), LayoutHint::GpuOptimized)
        .unwrap();
    src.copy_from_host(&xs, None).unwrap();
    let dst = b_accel
        .allocate::<u32>(Shape::D1(64), LayoutHint::GpuOptimized)
        .unwrap();

    src.copy_to(&dst, None).unwrap();
    let mut back = vec![0u32; 64];
    dst.copy_to_host(&mut back).unwrap();
    assert_eq!(back, xs);
}

#[test]
fn fill_zero_clears_the_logical_extent() {
    let accel = accelerator();
    let buffer = accel
        .allocate::<u32>(Shape::D2(8, 8), LayoutHint::GpuOptimized)
        .unwrap();
    buffer.copy_from_host(&[0xffff_ffffu32; 64], None).unwrap();
    buffer.fill_zero(None).unwrap();

    let mut host = vec![1u32; 64];
    buffer.copy_to_host(&mut host).unwrap();
    assert_eq!(host, vec![0u32; 64]);
}

#[test]
fn pinned_buffers_expose_host_slices() {
    let accel = accelerator();
    let mut buffer = accel
        .allocate::<f32>(Shape::D1(32), LayoutHint::Pinned)
        .unwrap();
    assert_eq!(buffer.location(), ignis::MemoryLocation::Pinned);

    buffer.as_host_slice_mut().unwrap()[7] = 2.5;
    assert_eq!(buffer.as_host_slice().unwrap()[7], 2.5);

    // the pinned mapping and device copies see the same bytes
    let mut host = vec![0.0f32; 32];
    buffer.copy_to_host(&mut host).unwrap();
    assert_eq!(host[7], 2.5);
}

#[test]
fn auto_layout_places_by_working_set_size() {
    let accel = accelerator();
    let small = accel.allocate::<u8>(Shape::D1(16), LayoutHint::Auto).unwrap();
    assert_eq!(small.location(), ignis::MemoryLocation::Host);

    let medium = accel
        .allocate::<u8>(Shape::D1(64 * 1024), LayoutHint::Auto)
        .unwrap();
    assert_eq!(medium.location(), ignis::MemoryLocation::Device);

    // host-optimized buffers expose no device handle
    assert!(small.native_handle().is_err());
    assert!(medium.native_handle().is_ok());
}
