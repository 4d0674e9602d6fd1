use std::sync::Arc;

use anyhow::Result;
use loop_rs::backend::{get_typed_backend, BackendRegistry};
use loop_rs::control_flow::{LoopErrorKind, Stage};
use loop_rs::nn::Linear;
use loop_rs::ops::add_bias;
use loop_rs::tensor::{DeviceTensor, DeviceTensorOps, Shape, Tensor};
use loop_rs::{fori_loop, while_loop};
use loop_rs_backend_ref_cpu::{register_cpu_backend, CpuPortableBackend};

fn device_f32(
    backend: &Arc<CpuPortableBackend>,
    dims: &[usize],
    data: &[f32],
) -> Result<DeviceTensor<CpuPortableBackend>> {
    let host = Tensor::from_vec(Shape::new(dims.to_vec()), data.to_vec())?;
    DeviceTensor::from_host(Arc::clone(backend), host)
}

fn device_i32_scalar(
    backend: &Arc<CpuPortableBackend>,
    value: i32,
) -> Result<DeviceTensor<CpuPortableBackend>> {
    let host = Tensor::from_i32(Shape::new([1]), vec![value])?;
    DeviceTensor::from_host(Arc::clone(backend), host)
}

#[test]
fn while_loop_counts_down_on_device() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let steps = device_f32(&backend, &[1], &[3.0])?;
    let total = device_f32(&backend, &[1], &[0.0])?;

    let results = while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        |carried, _additional| {
            Ok(vec![carried[0].sub_scalar(1.0)?, carried[1].add_scalar(1.0)?])
        },
        &[steps.clone(), total.clone()],
        &[],
    )?;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].to_host()?.data(), &[0.0]);
    assert_eq!(results[1].to_host()?.data(), &[3.0]);

    // Loop inputs are read, never written.
    assert_eq!(steps.to_host()?.data(), &[3.0]);
    assert_eq!(total.to_host()?.data(), &[0.0]);

    Ok(())
}

#[test]
fn while_loop_with_zero_iterations_returns_inputs() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let gate = device_f32(&backend, &[1], &[1.0])?;
    let payload = device_f32(&backend, &[2], &[5.0, 6.0])?;

    let results = while_loop(
        |carried, _additional| carried[0].gt_scalar(10.0),
        |carried, _additional| {
            Ok(vec![carried[0].add_scalar(1.0)?, carried[1].add_scalar(1.0)?])
        },
        &[gate, payload],
        &[],
    )?;

    assert_eq!(results[0].to_host()?.data(), &[1.0]);
    assert_eq!(results[1].to_host()?.data(), &[5.0, 6.0]);

    Ok(())
}

#[test]
fn while_loop_applies_linear_layer_per_iteration() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());

    let weight = Tensor::from_vec(Shape::new([2, 2]), vec![0.5, -0.25, 0.75, 1.0])?;
    let bias = Tensor::from_vec(Shape::new([2]), vec![0.1, -0.2])?;
    let input = Tensor::from_vec(Shape::new([2, 2]), vec![1.0, 2.0, 3.0, 4.0])?;

    // Host-side reference: two applications of the same layer.
    let layer = Linear::new(Arc::clone(&backend), weight.clone(), Some(bias.clone()))?;
    let x0 = DeviceTensor::from_host(Arc::clone(&backend), input.clone())?;
    let once = layer.forward(&x0)?;
    let expected = layer.forward(&once)?.to_host()?;

    let counter = device_f32(&backend, &[1], &[2.0])?;
    let x = DeviceTensor::from_host(Arc::clone(&backend), input)?;
    let w = DeviceTensor::from_host(Arc::clone(&backend), weight)?;
    let b = DeviceTensor::from_host(Arc::clone(&backend), bias)?;

    let results = while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        |carried, additional| {
            let projected = carried[1].matmul(&additional[0])?;
            let next = add_bias(&projected, &additional[1])?;
            Ok(vec![carried[0].sub_scalar(1.0)?, next])
        },
        &[counter, x],
        &[w.clone(), b.clone()],
    )?;

    assert_eq!(results[0].to_host()?.data(), &[0.0]);
    let looped = results[1].to_host()?;
    assert_eq!(looped.shape().dims(), expected.shape().dims());
    assert_eq!(looped.data(), expected.data());

    // Additional inputs are read, never written.
    assert_eq!(w.to_host()?.data(), &[0.5, -0.25, 0.75, 1.0]);
    assert_eq!(b.to_host()?.data(), &[0.1, -0.2]);

    Ok(())
}

#[test]
fn cond_closure_sees_additional_inputs() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let counter = device_f32(&backend, &[1], &[2.0])?;
    let total = device_f32(&backend, &[1], &[0.0])?;
    let limit = device_f32(&backend, &[1], &[1.0])?;

    let results = while_loop(
        |carried, additional| carried[0].minimum(&additional[0])?.gt_scalar(0.0),
        |carried, _additional| {
            Ok(vec![carried[0].sub_scalar(1.0)?, carried[1].add_scalar(1.0)?])
        },
        &[counter, total],
        &[limit],
    )?;

    assert_eq!(results[0].to_host()?.data(), &[0.0]);
    assert_eq!(results[1].to_host()?.data(), &[2.0]);

    Ok(())
}

#[test]
fn fori_loop_runs_upper_minus_lower_times() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let upper = device_i32_scalar(&backend, 5)?;
    let lower = device_i32_scalar(&backend, 2)?;
    let total = device_f32(&backend, &[1], &[0.0])?;

    let results = fori_loop(
        &upper,
        &lower,
        |carried, _additional| Ok(vec![carried[0].add_scalar(1.0)?]),
        &[total],
    )?;

    // The derived counter is bookkeeping and never comes back.
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].to_host()?.data(), &[3.0]);

    Ok(())
}

#[test]
fn fori_loop_with_equal_bounds_runs_zero_iterations() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let upper = device_i32_scalar(&backend, 4)?;
    let lower = device_i32_scalar(&backend, 4)?;
    let payload = device_f32(&backend, &[1], &[7.0])?;

    let results = fori_loop(
        &upper,
        &lower,
        |carried, _additional| Ok(vec![carried[0].add_scalar(1.0)?]),
        &[payload],
    )?;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].to_host()?.data(), &[7.0]);

    Ok(())
}

#[test]
fn fori_loop_rejects_reversed_bounds() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let upper = device_i32_scalar(&backend, 3)?;
    let lower = device_i32_scalar(&backend, 10)?;
    let payload = device_f32(&backend, &[1], &[0.0])?;

    let err = match fori_loop(
        &upper,
        &lower,
        |carried, _additional| Ok(vec![carried[0].add_scalar(1.0)?]),
        &[payload],
    ) {
        Ok(_) => panic!("reversed bounds must surface"),
        Err(err) => err,
    };

    assert_eq!(err.stage(), Stage::Probing);
    match err.kind() {
        LoopErrorKind::Precondition { message } => {
            assert!(
                message.contains("upper bound 3 is less than lower bound 10"),
                "unexpected message: {message}"
            );
        }
        other => panic!("unexpected kind: {other:?}"),
    }

    Ok(())
}

#[test]
fn fori_loop_requires_i32_scalar_bounds() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let payload = device_f32(&backend, &[1], &[0.0])?;

    let f32_bound = device_f32(&backend, &[1], &[5.0])?;
    let lower = device_i32_scalar(&backend, 0)?;
    let err = match fori_loop(
        &f32_bound,
        &lower,
        |carried, _additional| Ok(vec![carried[0].add_scalar(1.0)?]),
        &[payload.clone()],
    ) {
        Ok(_) => panic!("f32 bound must surface"),
        Err(err) => err,
    };
    assert_eq!(err.stage(), Stage::Probing);
    match err.kind() {
        LoopErrorKind::Precondition { message } => {
            assert!(
                message.contains("upper bound must be an I32 tensor of shape [1]"),
                "unexpected message: {message}"
            );
        }
        other => panic!("unexpected kind: {other:?}"),
    }

    let host = Tensor::from_i32(Shape::new([2]), vec![1, 2])?;
    let wide_bound = DeviceTensor::from_host(Arc::clone(&backend), host)?;
    let upper = device_i32_scalar(&backend, 5)?;
    let err = match fori_loop(
        &upper,
        &wide_bound,
        |carried, _additional| Ok(vec![carried[0].add_scalar(1.0)?]),
        &[payload],
    ) {
        Ok(_) => panic!("non-scalar bound must surface"),
        Err(err) => err,
    };
    match err.kind() {
        LoopErrorKind::Precondition { message } => {
            assert!(
                message.contains("lower bound must be an I32 tensor of shape [1]"),
                "unexpected message: {message}"
            );
        }
        other => panic!("unexpected kind: {other:?}"),
    }

    Ok(())
}

#[test]
fn registry_created_backend_drives_loops() -> Result<()> {
    let registry = BackendRegistry::new();
    register_cpu_backend(&registry);

    assert!(registry.contains("cpu"));
    assert!(registry.contains("cpu-portable"));
    let mut names = registry.backend_names();
    names.sort();
    assert_eq!(names, vec!["cpu".to_string(), "cpu-portable".to_string()]);

    let erased = registry.create("cpu").expect("cpu backend registered");
    assert_eq!(erased.backend_name(), "cpu-portable");

    let backend: Arc<CpuPortableBackend> =
        get_typed_backend(erased.as_ref()).expect("typed cpu backend");

    let counter = device_f32(&backend, &[1], &[2.0])?;
    let results = while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        |carried, _additional| Ok(vec![carried[0].sub_scalar(1.0)?]),
        &[counter],
        &[],
    )?;
    assert_eq!(results[0].to_host()?.data(), &[0.0]);

    assert!(registry.create("tpu").is_none());

    Ok(())
}
