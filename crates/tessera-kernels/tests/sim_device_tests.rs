//! End-to-end tests of the device plumbing against the simulated runtime.
//! Run with: cargo test -p tessera-kernels

use std::sync::Arc;

use tessera_core::{SimDeviceConfig, TesseraError};
use tessera_kernels::ops::{copy_dtod, copy_dtoh, copy_htod, scale_shift};
use tessera_kernels::{
    make_policy, status, ComputeHandles, ComputeLibrary, DeviceBuffer, ExecutionStream, KernelId, LibraryCall,
    SharedHandle, SharedRuntime, SimRuntime,
};

fn sim() -> (Arc<SimRuntime>, SharedRuntime) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let sim = Arc::new(SimRuntime::default());
    let rt: SharedRuntime = sim.clone();
    (sim, rt)
}

fn upload(stream: &ExecutionStream, values: &[f32]) -> DeviceBuffer {
    let mut buf = DeviceBuffer::alloc_f32(stream.runtime(), values.len()).unwrap();
    let span = buf.span([values.len()]).unwrap();
    unsafe { copy_htod(stream, &span, values).unwrap() };
    stream.synchronize().unwrap();
    buf
}

fn download(stream: &ExecutionStream, buf: &DeviceBuffer, n: usize) -> Vec<f32> {
    let mut out = vec![0f32; n];
    unsafe { copy_dtoh(stream, &mut out, &buf.view([n]).unwrap()).unwrap() };
    stream.synchronize().unwrap();
    out
}

// ============================================================================
// Handles and streams
// ============================================================================

#[test]
fn test_handle_outlives_its_creator() {
    let (sim, rt) = sim();
    let stream = ExecutionStream::create(&rt).unwrap();

    let consumer = {
        let creator = SharedHandle::create_on(ComputeLibrary::Blas, &stream).unwrap();
        creator.clone()
    };
    assert_eq!(consumer.use_count(), 1);
    assert_eq!(sim.live_handles(), 1);

    let buf = upload(&stream, &[1.0, 2.0, 3.0]);
    consumer
        .dispatch(&LibraryCall::Scal { n: 3, alpha: -1.0, x: buf.ptr() })
        .unwrap();
    assert_eq!(download(&stream, &buf, 3), vec![-1.0, -2.0, -3.0]);

    drop(consumer);
    assert_eq!(sim.live_handles(), 0);
    assert_eq!(sim.stats().handles_destroyed, 1);
}

#[test]
fn test_handles_bound_to_one_stream_share_ordering() {
    let (_sim, rt) = sim();
    let stream = ExecutionStream::create(&rt).unwrap();
    let handles = ComputeHandles::create(&stream).unwrap();
    assert_eq!(handles.blas.stream(), Some(&stream));
    assert_eq!(handles.dnn.stream(), Some(&stream));

    let x = upload(&stream, &[-2.0, 0.5, -0.1, 4.0]);
    let y = DeviceBuffer::alloc_f32(&rt, 4).unwrap();
    handles
        .dnn
        .dispatch(&LibraryCall::ReluForward { n: 4, x: x.ptr(), y: y.ptr() })
        .unwrap();
    handles
        .blas
        .dispatch(&LibraryCall::Axpy { n: 4, alpha: 2.0, x: x.ptr(), y: y.ptr() })
        .unwrap();
    stream.synchronize().unwrap();
    assert_eq!(download(&stream, &y, 4), vec![-4.0, 1.5, -0.2, 12.0]);
}

#[test]
fn test_wrong_library_is_rejected_by_device() {
    let (_sim, rt) = sim();
    let blas = SharedHandle::create(&rt, ComputeLibrary::Blas).unwrap();
    let buf = DeviceBuffer::alloc_f32(&rt, 1).unwrap();
    let err = blas
        .dispatch(&LibraryCall::ReluForward { n: 1, x: buf.ptr(), y: buf.ptr() })
        .unwrap_err();
    assert_eq!(err.status(), Some(status::INVALID_VALUE));
}

// ============================================================================
// Copies and kernels
// ============================================================================

#[test]
fn test_dtod_copy_of_sub_view() {
    let (_sim, rt) = sim();
    let stream = ExecutionStream::default_stream(&rt);
    let src = upload(&stream, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let mut dst = DeviceBuffer::alloc_f32(&rt, 3).unwrap();

    let rows = src.view([2, 3]).unwrap();
    let second_row = rows.subspan(&[1], &[2]).unwrap();
    copy_dtod(&stream, &dst.span([1, 3]).unwrap(), &second_row).unwrap();
    assert_eq!(download(&stream, &dst, 3), vec![3.0, 4.0, 5.0]);
}

#[test]
fn test_scale_shift_on_small_device() {
    let sim = Arc::new(SimRuntime::new(SimDeviceConfig {
        multiprocessors: 1,
        max_threads_per_block: 128,
        max_threads_per_multiprocessor: 128,
        warp_size: 32,
        ..Default::default()
    }));
    let rt: SharedRuntime = sim.clone();
    let stream = ExecutionStream::create(&rt).unwrap();

    let n = 1000;
    let input: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let x = upload(&stream, &input);
    let mut y = DeviceBuffer::alloc_f32(&rt, n).unwrap();

    let policy = make_policy(&stream, KernelId::ScaleShift, n, 0, 64).unwrap();
    assert_eq!(policy.block.x, 128);
    assert!(policy.threads() >= n as u64);

    scale_shift(&stream, &y.span([n]).unwrap(), &x.view([n]).unwrap(), 0.5, -1.0, 64).unwrap();
    let out = download(&stream, &y, n);
    for (i, v) in out.iter().enumerate() {
        assert_eq!(*v, 0.5 * i as f32 - 1.0, "element {i}");
    }
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn test_fault_surfaces_at_synchronize_and_poisons_stream() {
    let (sim, rt) = sim();
    let stream = ExecutionStream::create(&rt).unwrap();
    let buf = upload(&stream, &[1.0; 4]);

    sim.fault_next_operation(status::ILLEGAL_ADDRESS);
    let mut out = [0f32; 4];
    unsafe { copy_dtoh(&stream, &mut out, &buf.view([4]).unwrap()).unwrap() };
    let err = stream.synchronize().unwrap_err();
    assert!(matches!(err, TesseraError::Device { status: s, .. } if s == status::ILLEGAL_ADDRESS));
    assert_eq!(out, [0.0; 4]);

    // Other streams keep working.
    let fresh = ExecutionStream::create(&rt).unwrap();
    assert_eq!(download(&fresh, &buf, 4), vec![1.0; 4]);
}
