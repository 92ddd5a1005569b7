//! Engine runs on real hardware.
//!
//! Skipped unless built with `--features cuda` and a device is present.

#![cfg(feature = "cuda")]

use std::sync::Arc;

use streamgrid_core::kernel::reference;
use streamgrid_core::prelude::*;
use streamgrid_cuda::{is_cuda_available, CudaDevice};

fn engine() -> Option<Engine> {
    if !is_cuda_available() {
        eprintln!("CUDA not available, skipping");
        return None;
    }
    let device = CudaDevice::new(0).ok()?;
    Some(Engine::new(Arc::new(device)))
}

#[test]
fn test_axpy_on_gpu() {
    let Some(engine) = engine() else { return };
    let n = 1_000_000;
    let x = vec![1.0; n];
    let mut y = vec![0.0; n];
    let params = ParameterVector::builder()
        .threads_per_block(256)
        .stream_count(4)
        .use_pinned_host(true)
        .build()
        .unwrap();

    engine
        .execute_request(ExecutionRequest::axpy(2.0, &x, &mut y, params))
        .unwrap();
    assert!(y.iter().all(|&v| v == 2.0));
}

#[test]
fn test_dia_on_gpu_matches_reference() {
    let Some(engine) = engine() else { return };
    let m = 64;
    let n = m * m;
    let offsets = reference::stencil_offsets(m, 1);
    let values: Vec<f64> = (0..n * offsets.len()).map(|i| (i % 9) as f64 - 4.0).collect();
    let x: Vec<f64> = (0..n).map(|i| (i % 5) as f64).collect();
    let mut y = vec![0.0; n];

    let params = ParameterVector::builder()
        .threads_per_block(128)
        .stream_count(3)
        .unroll_factor(2)
        .build()
        .unwrap();
    let request = ExecutionRequest::new(KernelKind::SparseDiaMatVec, n as i64, params)
        .with_array(ArrayDescriptor::input(&values))
        .with_array(ArrayDescriptor::input(&x))
        .with_array(ArrayDescriptor::in_out(&mut y))
        .with_scalars(offsets.iter().map(|&o| o as f64).collect());
    engine.execute_request(request).unwrap();

    let mut expected = vec![0.0; n];
    reference::dia_matvec(&values, &offsets, &x, &mut expected);
    for (got, want) in y.iter().zip(&expected) {
        assert!((got - want).abs() < 1e-9);
    }
}
