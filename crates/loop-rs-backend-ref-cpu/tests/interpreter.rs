use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use loop_rs::backend::ltir_utils::{shape_static, tensor_spec_static};
use loop_rs::backend::spec::{
    BackendError, BackendResult, BroadcastToSpec, CompareSpec, ComparisonOp, DType,
    ElementwiseBinaryOp, GetTupleElementSpec, Operand, Operation, PortableBackend, Program,
    ProgramBuilder, RegionId, SpecErrorCode, TensorInit, TensorLiteral, TensorSpec, ValueType,
    WhileSpec,
};
use loop_rs_backend_ref_cpu::{
    CpuKernelInterceptor, CpuPortableBackend, CpuTensor, GenericCpuBackend, TensorData,
};

fn f32_literal(dims: &[usize], values: &[f32]) -> TensorLiteral {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    TensorLiteral::new(
        tensor_spec_static(DType::F32, dims),
        Arc::from(bytes.into_boxed_slice()),
    )
}

fn i32_literal(dims: &[usize], values: &[i32]) -> TensorLiteral {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    TensorLiteral::new(
        tensor_spec_static(DType::Si32, dims),
        Arc::from(bytes.into_boxed_slice()),
    )
}

fn f32_input(backend: &impl PortableBackend<TensorHandle = CpuTensor>, values: &[f32]) -> CpuTensor {
    backend
        .materialize(TensorInit::Literal(f32_literal(&[values.len()], values)))
        .expect("materialize f32 input")
}

fn f32_data(tensor: &CpuTensor) -> Vec<f32> {
    match &tensor.data {
        TensorData::F32(values) => values.to_vec(),
        other => panic!("expected f32 payload, got {:?}", data_label(other)),
    }
}

fn data_label(data: &TensorData) -> &'static str {
    match data {
        TensorData::F32(_) => "f32",
        TensorData::Si32(_) => "si32",
        TensorData::Bool(_) => "bool",
    }
}

/// Countdown loop over a single `[1] x F32` slot: while (x > 0) { x = x - 1 }.
fn countdown_program(entry: &str) -> Program {
    let slot = tensor_spec_static(DType::F32, &[1]);
    let predicate = tensor_spec_static(DType::I1, &[1]);

    let cond_region = {
        let mut builder = ProgramBuilder::new();
        let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
        let zero = builder.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape_static(&[1]),
            }),
            vec![Operand::Literal(f32_literal(&[1], &[0.0]))],
            ValueType::Tensor(slot.clone()),
        );
        let flag = builder.emit(
            Operation::Compare(CompareSpec {
                op: ComparisonOp::Greater,
            }),
            vec![Operand::Value(param), Operand::Value(zero)],
            ValueType::Tensor(predicate),
        );
        builder.finish_region(RegionId(0), vec![flag])
    };

    let body_region = {
        let mut builder = ProgramBuilder::new();
        let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
        let one = builder.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape_static(&[1]),
            }),
            vec![Operand::Literal(f32_literal(&[1], &[1.0]))],
            ValueType::Tensor(slot.clone()),
        );
        let next = builder.emit(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Sub),
            vec![Operand::Value(param), Operand::Value(one)],
            ValueType::Tensor(slot.clone()),
        );
        builder.finish_region(RegionId(1), vec![next])
    };

    let mut builder = ProgramBuilder::new();
    let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
    let tuple_ty = ValueType::Tuple(vec![ValueType::Tensor(slot.clone())]);
    let tuple = builder.emit(
        Operation::Tuple,
        vec![Operand::Value(param)],
        tuple_ty.clone(),
    );
    let done = builder.emit(
        Operation::While(WhileSpec {
            cond_region: RegionId(0),
            body_region: RegionId(1),
        }),
        vec![Operand::Value(tuple)],
        tuple_ty,
    );
    let out = builder.emit(
        Operation::GetTupleElement(GetTupleElementSpec { index: 0 }),
        vec![Operand::Value(done)],
        ValueType::Tensor(slot),
    );
    let function = builder.finish(entry, vec![out]);
    Program::new(entry)
        .with_functions(vec![function])
        .with_regions(vec![cond_region, body_region])
}

#[test]
fn while_program_counts_down_to_zero() -> Result<()> {
    let backend = CpuPortableBackend::new();
    let program = countdown_program("countdown");
    let seed = f32_input(&backend, &[4.0]);

    let outputs = backend.run_program(&program, &[seed])?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(f32_data(&outputs[0]), vec![0.0]);

    Ok(())
}

struct AddOverride {
    hits: AtomicUsize,
}

impl CpuKernelInterceptor for AddOverride {
    fn try_execute(
        &self,
        op: &Operation,
        _inputs: &[CpuTensor],
        outputs: &[TensorSpec],
    ) -> Option<BackendResult<Vec<CpuTensor>>> {
        match op {
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add) => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                let spec = outputs[0].clone();
                let len = spec.element_count().expect("static output shape");
                Some(Ok(vec![CpuTensor {
                    spec,
                    data: TensorData::F32(Arc::from(vec![9.0; len])),
                }]))
            }
            _ => None,
        }
    }
}

#[test]
fn interceptor_overrides_matching_kernels() -> Result<()> {
    let backend = GenericCpuBackend::with_interceptor(AddOverride {
        hits: AtomicUsize::new(0),
    });

    let slot = tensor_spec_static(DType::F32, &[2]);
    let mut builder = ProgramBuilder::new();
    let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
    let summed = builder.emit(
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
        vec![Operand::Value(param), Operand::Value(param)],
        ValueType::Tensor(slot.clone()),
    );
    let doubled = builder.emit(
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul),
        vec![Operand::Value(summed), Operand::Value(summed)],
        ValueType::Tensor(slot),
    );
    let function = builder.finish("main", vec![doubled]);
    let program = Program::new("main").with_functions(vec![function]);

    let input = f32_input(&backend, &[1.0, 2.0]);
    let outputs = backend.run_program(&program, &[input])?;

    // Add was replaced by the interceptor constant; Mul still runs natively.
    assert_eq!(f32_data(&outputs[0]), vec![81.0, 81.0]);
    assert_eq!(backend.interceptor().hits.load(Ordering::SeqCst), 1);

    Ok(())
}

#[test]
fn tuple_index_out_of_bounds_is_a_spec_violation() {
    let backend = CpuPortableBackend::new();

    let slot = tensor_spec_static(DType::F32, &[1]);
    let mut builder = ProgramBuilder::new();
    let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
    let tuple = builder.emit(
        Operation::Tuple,
        vec![Operand::Value(param)],
        ValueType::Tuple(vec![ValueType::Tensor(slot.clone())]),
    );
    let out = builder.emit(
        Operation::GetTupleElement(GetTupleElementSpec { index: 3 }),
        vec![Operand::Value(tuple)],
        ValueType::Tensor(slot),
    );
    let function = builder.finish("main", vec![out]);
    let program = Program::new("main").with_functions(vec![function]);

    let input = f32_input(&backend, &[1.0]);
    let err = backend
        .run_program(&program, &[input])
        .expect_err("out of bounds index must fail");
    match err {
        BackendError::SpecViolation(spec_err) => {
            assert_eq!(spec_err.code, SpecErrorCode::TupleIndexOutOfBounds);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn while_body_must_keep_slot_specs() {
    let backend = CpuPortableBackend::new();

    let slot = tensor_spec_static(DType::F32, &[1]);
    let wide = tensor_spec_static(DType::F32, &[2]);
    let predicate = tensor_spec_static(DType::I1, &[1]);

    let cond_region = {
        let mut builder = ProgramBuilder::new();
        let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
        let zero = builder.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape_static(&[1]),
            }),
            vec![Operand::Literal(f32_literal(&[1], &[0.0]))],
            ValueType::Tensor(slot.clone()),
        );
        let flag = builder.emit(
            Operation::Compare(CompareSpec {
                op: ComparisonOp::Greater,
            }),
            vec![Operand::Value(param), Operand::Value(zero)],
            ValueType::Tensor(predicate),
        );
        builder.finish_region(RegionId(0), vec![flag])
    };

    // Body widens the slot from [1] to [2], which the interpreter must reject.
    let body_region = {
        let mut builder = ProgramBuilder::new();
        let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
        let widened = builder.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape_static(&[2]),
            }),
            vec![Operand::Value(param)],
            ValueType::Tensor(wide),
        );
        builder.finish_region(RegionId(1), vec![widened])
    };

    let mut builder = ProgramBuilder::new();
    let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
    let tuple_ty = ValueType::Tuple(vec![ValueType::Tensor(slot.clone())]);
    let tuple = builder.emit(
        Operation::Tuple,
        vec![Operand::Value(param)],
        tuple_ty.clone(),
    );
    let done = builder.emit(
        Operation::While(WhileSpec {
            cond_region: RegionId(0),
            body_region: RegionId(1),
        }),
        vec![Operand::Value(tuple)],
        tuple_ty,
    );
    let out = builder.emit(
        Operation::GetTupleElement(GetTupleElementSpec { index: 0 }),
        vec![Operand::Value(done)],
        ValueType::Tensor(slot),
    );
    let function = builder.finish("main", vec![out]);
    let program = Program::new("main")
        .with_functions(vec![function])
        .with_regions(vec![cond_region, body_region]);

    let input = f32_input(&backend, &[1.0]);
    let err = backend
        .run_program(&program, &[input])
        .expect_err("slot widening must fail");
    assert!(
        err.to_string().contains("changed the spec of slot 0"),
        "unexpected error: {err}"
    );
}

#[test]
fn cond_region_must_produce_scalar_predicate() {
    let backend = CpuPortableBackend::new();

    let slot = tensor_spec_static(DType::F32, &[2]);
    let wide_predicate = tensor_spec_static(DType::I1, &[2]);

    // Elementwise compare leaves a [2] x I1 flag, which is not a predicate.
    let cond_region = {
        let mut builder = ProgramBuilder::new();
        let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
        let zero = builder.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape_static(&[2]),
            }),
            vec![Operand::Literal(f32_literal(&[1], &[0.0]))],
            ValueType::Tensor(slot.clone()),
        );
        let flags = builder.emit(
            Operation::Compare(CompareSpec {
                op: ComparisonOp::Greater,
            }),
            vec![Operand::Value(param), Operand::Value(zero)],
            ValueType::Tensor(wide_predicate),
        );
        builder.finish_region(RegionId(0), vec![flags])
    };

    let body_region = {
        let mut builder = ProgramBuilder::new();
        let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
        builder.finish_region(RegionId(1), vec![param])
    };

    let mut builder = ProgramBuilder::new();
    let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
    let tuple_ty = ValueType::Tuple(vec![ValueType::Tensor(slot.clone())]);
    let tuple = builder.emit(
        Operation::Tuple,
        vec![Operand::Value(param)],
        tuple_ty.clone(),
    );
    let done = builder.emit(
        Operation::While(WhileSpec {
            cond_region: RegionId(0),
            body_region: RegionId(1),
        }),
        vec![Operand::Value(tuple)],
        tuple_ty,
    );
    let out = builder.emit(
        Operation::GetTupleElement(GetTupleElementSpec { index: 0 }),
        vec![Operand::Value(done)],
        ValueType::Tensor(slot),
    );
    let function = builder.finish("main", vec![out]);
    let program = Program::new("main")
        .with_functions(vec![function])
        .with_regions(vec![cond_region, body_region]);

    let input = f32_input(&backend, &[1.0, 2.0]);
    let err = backend
        .run_program(&program, &[input])
        .expect_err("wide predicate must fail");
    match err {
        BackendError::SpecViolation(spec_err) => {
            assert_eq!(spec_err.code, SpecErrorCode::RegionSignatureMismatch);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn integer_division_by_zero_reports_instruction_context() {
    let backend = CpuPortableBackend::new();

    let slot = tensor_spec_static(DType::Si32, &[1]);
    let mut builder = ProgramBuilder::new();
    let lhs = builder.add_parameter(ValueType::Tensor(slot.clone()));
    let rhs = builder.add_parameter(ValueType::Tensor(slot.clone()));
    let quotient = builder.emit(
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Div),
        vec![Operand::Value(lhs), Operand::Value(rhs)],
        ValueType::Tensor(slot),
    );
    let function = builder.finish("main", vec![quotient]);
    let program = Program::new("main").with_functions(vec![function]);

    let numerator = backend
        .materialize(TensorInit::Literal(i32_literal(&[1], &[4])))
        .expect("materialize numerator");
    let denominator = backend
        .materialize(TensorInit::Literal(i32_literal(&[1], &[0])))
        .expect("materialize denominator");

    let err = backend
        .run_program(&program, &[numerator, denominator])
        .expect_err("division by zero must fail");
    let rendered = err.to_string();
    assert!(
        rendered.contains("integer division by zero")
            && rendered.contains("at `main` instruction #0"),
        "unexpected error: {rendered}"
    );
}
