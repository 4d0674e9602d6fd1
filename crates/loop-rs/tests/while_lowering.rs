use std::sync::{Arc, Mutex};

use anyhow::Result;
use loop_rs::backend::ltir_utils::tensor_spec_static;
use loop_rs::backend::spec::{DType, Operand, Operation, PortableBackend, Program, ValueType};
use loop_rs::control_flow::{Callable, LoopErrorKind, Stage};
use loop_rs::ops::trace::{
    self, ProgramContext, ProgramKind, ProgramStats, ProgramStatus, TraceSink,
};
use loop_rs::tensor::{DeviceTensor, DeviceTensorOps, Shape, Tensor};
use loop_rs::while_loop;
use loop_rs_backend_ref_cpu::CpuPortableBackend;

/// Delegating backend that keeps a copy of every submitted program.
struct RecordingBackend {
    inner: Arc<CpuPortableBackend>,
    programs: Mutex<Vec<Program>>,
}

impl RecordingBackend {
    fn new() -> Self {
        RecordingBackend {
            inner: Arc::new(CpuPortableBackend::new()),
            programs: Mutex::new(Vec::new()),
        }
    }

    fn recorded(&self) -> Vec<Program> {
        self.programs.lock().expect("program log lock").clone()
    }
}

impl PortableBackend for RecordingBackend {
    type TensorHandle = <CpuPortableBackend as PortableBackend>::TensorHandle;

    fn backend_name(&self) -> &str {
        "cpu-recording"
    }

    fn materialize(
        &self,
        init: loop_rs::backend::spec::TensorInit,
    ) -> loop_rs::backend::spec::BackendResult<Self::TensorHandle> {
        self.inner.materialize(init)
    }

    fn to_literal(
        &self,
        tensor: &Self::TensorHandle,
    ) -> loop_rs::backend::spec::BackendResult<loop_rs::backend::spec::TensorLiteral> {
        self.inner.to_literal(tensor)
    }

    fn execute_instruction(
        &self,
        instruction: &loop_rs::backend::spec::Instruction,
        inputs: &[Self::TensorHandle],
    ) -> loop_rs::backend::spec::BackendResult<Vec<Self::TensorHandle>> {
        self.inner.execute_instruction(instruction, inputs)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> loop_rs::backend::spec::BackendResult<Vec<Self::TensorHandle>> {
        self.programs
            .lock()
            .expect("program log lock")
            .push(program.clone());
        self.inner.run_program(program, entry_inputs)
    }
}

fn device_tensor_on<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    dims: &[usize],
    data: &[f32],
) -> Result<DeviceTensor<B>> {
    let host = Tensor::from_vec(Shape::new(dims.to_vec()), data.to_vec())?;
    DeviceTensor::from_host(Arc::clone(backend), host)
}

#[test]
fn lowered_program_uses_canonical_slot_order() -> Result<()> {
    let backend = Arc::new(RecordingBackend::new());

    let counter = device_tensor_on(&backend, &[1], &[3.0])?;
    let acc = device_tensor_on(&backend, &[3], &[0.0, 0.0, 0.0])?;
    let table = device_tensor_on(&backend, &[4], &[1.0, 2.0, 3.0, 4.0])?;

    let results = while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        |carried, _additional| {
            Ok(vec![carried[0].sub_scalar(1.0)?, carried[1].add_scalar(1.0)?])
        },
        &[counter, acc],
        &[table.clone()],
    )?;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].to_host()?.data(), &[0.0]);
    assert_eq!(results[1].to_host()?.data(), &[3.0, 3.0, 3.0]);
    assert_eq!(table.to_host()?.data(), &[1.0, 2.0, 3.0, 4.0]);

    // The whole loop must reach the backend as one program submission.
    let programs = backend.recorded();
    assert_eq!(programs.len(), 1);
    let program = &programs[0];
    assert_eq!(program.entry, "while_loop");

    let entry = program.functions.first().expect("entry function");
    let f32_slot =
        |dims: &[usize]| ValueType::Tensor(tensor_spec_static(DType::F32, dims));

    // Slot order is first carried, then additional, then remaining carried.
    assert_eq!(
        entry.parameters,
        vec![f32_slot(&[1]), f32_slot(&[4]), f32_slot(&[3])]
    );

    let tuple_instr = entry
        .body
        .iter()
        .find(|instr| matches!(instr.op, Operation::Tuple))
        .expect("tuple packing instruction");
    assert_eq!(tuple_instr.operands.len(), 3);

    let whiles: Vec<_> = entry
        .body
        .iter()
        .filter(|instr| matches!(instr.op, Operation::While(_)))
        .collect();
    assert_eq!(whiles.len(), 1);
    let while_instr = whiles[0];
    assert_eq!(while_instr.operands, vec![Operand::Value(tuple_instr.id)]);

    let spec = match &while_instr.op {
        Operation::While(spec) => spec,
        other => panic!("expected a while op, got {other:?}"),
    };
    let cond_region = program.region(spec.cond_region).expect("cond region");
    assert_eq!(cond_region.parameters, entry.parameters);
    assert_eq!(
        cond_region.results,
        vec![ValueType::Tensor(tensor_spec_static(DType::I1, &[1]))]
    );
    let body_region = program.region(spec.body_region).expect("body region");
    assert_eq!(body_region.parameters, entry.parameters);
    assert_eq!(body_region.results, entry.parameters);

    let unpacks = entry
        .body
        .iter()
        .filter(|instr| matches!(instr.op, Operation::GetTupleElement(_)))
        .count();
    assert_eq!(unpacks, 3);

    Ok(())
}

struct LoopSinkProbe {
    submissions: Mutex<Vec<(String, usize, usize, bool)>>,
}

impl TraceSink for LoopSinkProbe {
    fn before_program(&self, context: &ProgramContext, program: &Program) {
        if let ProgramKind::Loop {
            carried,
            additional,
        } = context.kind
        {
            self.submissions
                .lock()
                .expect("sink lock")
                .push((program.entry.clone(), carried, additional, false));
        }
    }

    fn after_program(&self, context: &ProgramContext, stats: &ProgramStats) {
        if let ProgramKind::Loop { .. } = context.kind {
            if let ProgramStatus::Success = stats.status {
                if let Some(last) = self.submissions.lock().expect("sink lock").last_mut() {
                    last.3 = true;
                }
            }
        }
    }
}

#[test]
fn trace_sink_observes_one_loop_submission() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let state = device_tensor_on(&backend, &[1], &[2.0])?;

    let sink = Arc::new(LoopSinkProbe {
        submissions: Mutex::new(Vec::new()),
    });
    trace::install_sink(sink.clone());
    let outcome = while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        |carried, _additional| Ok(vec![carried[0].sub_scalar(1.0)?]),
        &[state],
        &[],
    );
    trace::clear_sink();
    let results = outcome?;
    assert_eq!(results[0].to_host()?.data(), &[0.0]);

    let submissions = sink.submissions.lock().expect("sink lock");
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0], ("while_loop".to_string(), 1, 0, true));

    Ok(())
}

#[test]
fn failing_cond_closure_is_tagged_tracing_cond() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let state = device_tensor_on(&backend, &[1], &[1.0])?;

    let err = match while_loop(
        |_carried, _additional| anyhow::bail!("cond exploded"),
        |carried, _additional| Ok(vec![carried[0].add_scalar(1.0)?]),
        &[state],
        &[],
    ) {
        Ok(_) => panic!("cond failure must surface"),
        Err(err) => err,
    };

    assert_eq!(err.stage(), Stage::TracingCond);
    assert!(matches!(
        err.kind(),
        LoopErrorKind::Tracing {
            callable: Callable::Cond,
            ..
        }
    ));
    let rendered = err.to_string();
    assert!(
        rendered.contains("tracing cond") && rendered.contains("cond exploded"),
        "unexpected error text: {rendered}"
    );

    Ok(())
}

#[test]
fn body_arity_mismatch_is_tagged_reconciling() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let first = device_tensor_on(&backend, &[1], &[1.0])?;
    let second = device_tensor_on(&backend, &[1], &[2.0])?;

    let err = match while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        |carried, _additional| Ok(vec![carried[0].add_scalar(1.0)?]),
        &[first, second],
        &[],
    ) {
        Ok(_) => panic!("arity mismatch must surface"),
        Err(err) => err,
    };

    assert_eq!(err.stage(), Stage::Reconciling);
    match err.kind() {
        LoopErrorKind::Reconciliation { message } => {
            assert!(
                message.contains("must return 2 carried value(s), got 1"),
                "unexpected message: {message}"
            );
        }
        other => panic!("unexpected kind: {other:?}"),
    }

    Ok(())
}

#[test]
fn captured_tensor_outside_declared_lists_is_rejected() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let state = device_tensor_on(&backend, &[1], &[1.0])?;
    let stray = device_tensor_on(&backend, &[1], &[5.0])?;

    let err = match while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        move |carried, _additional| Ok(vec![carried[0].add(&stray)?]),
        &[state],
        &[],
    ) {
        Ok(_) => panic!("closure capture must surface"),
        Err(err) => err,
    };

    assert_eq!(err.stage(), Stage::Reconciling);
    match err.kind() {
        LoopErrorKind::Reconciliation { message } => {
            assert!(
                message.contains("body closure captured 1 tensor(s)")
                    && message.contains("additional_inputs"),
                "unexpected message: {message}"
            );
        }
        other => panic!("unexpected kind: {other:?}"),
    }

    Ok(())
}

#[test]
fn result_recorded_in_foreign_arena_is_rejected() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let state = device_tensor_on(&backend, &[1], &[1.0])?;
    let lhs = device_tensor_on(&backend, &[1], &[1.0])?;
    let rhs = device_tensor_on(&backend, &[1], &[2.0])?;
    let prebuilt = lhs.add(&rhs)?;

    let err = match while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        move |_carried, _additional| Ok(vec![prebuilt.clone()]),
        &[state],
        &[],
    ) {
        Ok(_) => panic!("foreign result must surface"),
        Err(err) => err,
    };

    assert_eq!(err.stage(), Stage::TracingBody);
    assert!(matches!(
        err.kind(),
        LoopErrorKind::Tracing {
            callable: Callable::Body,
            ..
        }
    ));
    assert!(
        err.to_string().contains("different graph arena"),
        "unexpected error text: {err}"
    );

    Ok(())
}

#[test]
fn empty_carried_list_is_rejected() -> Result<()> {
    let backend = Arc::new(CpuPortableBackend::new());
    let extra = device_tensor_on(&backend, &[1], &[1.0])?;

    let err = match while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        |carried, _additional| Ok(carried.to_vec()),
        &[],
        &[extra],
    ) {
        Ok(_) => panic!("empty carried list must surface"),
        Err(err) => err,
    };

    assert_eq!(err.stage(), Stage::Probing);
    match err.kind() {
        LoopErrorKind::Precondition { message } => {
            assert!(
                message.contains("at least one carried value"),
                "unexpected message: {message}"
            );
        }
        other => panic!("unexpected kind: {other:?}"),
    }

    Ok(())
}

#[test]
fn mixed_backend_instances_are_rejected() -> Result<()> {
    let backend_a = Arc::new(CpuPortableBackend::new());
    let backend_b = Arc::new(CpuPortableBackend::new());
    let carried = device_tensor_on(&backend_a, &[1], &[1.0])?;
    let extra = device_tensor_on(&backend_b, &[1], &[1.0])?;

    let err = match while_loop(
        |carried, _additional| carried[0].gt_scalar(0.0),
        |carried, _additional| Ok(carried.to_vec()),
        &[carried],
        &[extra],
    ) {
        Ok(_) => panic!("split backends must surface"),
        Err(err) => err,
    };

    assert_eq!(err.stage(), Stage::Probing);
    match err.kind() {
        LoopErrorKind::Precondition { message } => {
            assert!(
                message.contains("share one backend instance"),
                "unexpected message: {message}"
            );
        }
        other => panic!("unexpected kind: {other:?}"),
    }

    Ok(())
}
