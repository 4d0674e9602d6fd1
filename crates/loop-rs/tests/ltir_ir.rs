use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use loop_rs::backend::ltir_utils::{shape_static, tensor_literal_zeros, tensor_spec_static};
use loop_rs::backend::spec::{
    BroadcastToSpec, CompareSpec, ComparisonOp, DType, ElementwiseBinaryOp, GetTupleElementSpec,
    Operand, Operation, Program, ProgramBuilder, ProgramSerdeError, RegionId, ValueType,
    WhileSpec, SPEC_VERSION,
};

fn sample_loop_program() -> Program {
    let slot = tensor_spec_static(DType::F32, &[1]);
    let predicate = tensor_spec_static(DType::I1, &[1]);

    let cond_region = {
        let mut builder = ProgramBuilder::new();
        let param = builder.add_parameter(ValueType::Tensor(slot.clone()));
        let zero = builder.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape_static(&[1]),
            }),
            vec![Operand::Literal(tensor_literal_zeros(slot.clone()))],
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
        let next = builder.emit(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![Operand::Value(param), Operand::Value(param)],
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
    let function = builder.finish("countdown", vec![out]);
    Program::new("countdown")
        .with_functions(vec![function])
        .with_regions(vec![cond_region, body_region])
}

fn unique_path(ext: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    env::temp_dir().join(format!("loop_rs_ltir_{nanos}.{ext}"))
}

#[test]
fn program_builder_records_result_types() {
    let program = sample_loop_program();
    let function = program
        .functions
        .first()
        .expect("sample program should contain a function");
    assert_eq!(function.body.len(), 3);
    let last = function
        .body
        .last()
        .expect("function body should not be empty");
    assert_eq!(last.id, function.result_ids[0]);
    assert_eq!(last.output, function.results[0]);
}

#[test]
fn program_region_lookup_by_id() {
    let program = sample_loop_program();
    assert!(program.region(RegionId(0)).is_some());
    assert!(program.region(RegionId(1)).is_some());
    assert!(program.region(RegionId(7)).is_none());

    let cond = program.region(RegionId(0)).expect("cond region");
    assert_eq!(cond.result_ids.len(), 1);
    assert_eq!(
        cond.results[0],
        ValueType::Tensor(tensor_spec_static(DType::I1, &[1]))
    );
}

#[test]
fn program_display_renders_loop_ir() {
    let program = sample_loop_program();
    let rendered = format!("{program}");
    assert!(
        rendered.contains("program @countdown"),
        "rendered IR missing program header:\n{rendered}"
    );
    assert!(
        rendered.contains("region ^r0 {"),
        "rendered IR missing cond region:\n{rendered}"
    );
    assert!(
        rendered.contains("region ^r1 {"),
        "rendered IR missing body region:\n{rendered}"
    );
    assert!(
        rendered.contains("While"),
        "rendered IR missing while instruction:\n{rendered}"
    );
    assert!(
        rendered.contains("tensor<I1 x 1>"),
        "rendered IR missing predicate type:\n{rendered}"
    );
}

#[test]
fn program_json_roundtrip_preserves_regions() {
    let program = sample_loop_program();
    let json = program.to_json_string().expect("json serialization");
    assert_eq!(
        Program::from_json_str(&json).expect("json deserialization"),
        program
    );
}

#[test]
fn program_bincode_roundtrip_preserves_regions() {
    let program = sample_loop_program();
    let bytes = program.to_bincode_bytes().expect("bincode serialization");
    assert_eq!(
        Program::from_bincode_slice(&bytes).expect("bincode deserialization"),
        program
    );
}

#[test]
fn program_json_missing_spec_version_defaults() {
    let mut value =
        serde_json::to_value(sample_loop_program()).expect("serialize to json value");
    value
        .as_object_mut()
        .expect("json object")
        .remove("spec_version");
    let parsed = Program::from_json_str(&value.to_string()).expect("parsed without spec version");
    assert_eq!(parsed.spec_version, SPEC_VERSION);
}

#[test]
fn program_json_spec_version_mismatch_errors() {
    let mut value =
        serde_json::to_value(sample_loop_program()).expect("serialize to json value");
    value["spec_version"] = serde_json::json!("ltir.v999");
    let err =
        Program::from_json_str(&value.to_string()).expect_err("expected spec version mismatch");
    match err {
        ProgramSerdeError::SpecVersionMismatch { found, expected } => {
            assert_eq!(found, "ltir.v999");
            assert_eq!(expected, SPEC_VERSION);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn program_file_roundtrip_json_and_bincode() {
    let program = sample_loop_program();

    let json_path = unique_path("json");
    program
        .save_json(&json_path)
        .expect("save json to disk succeeds");
    assert_eq!(
        Program::load_json(&json_path).expect("load json program"),
        program
    );
    let _ = fs::remove_file(json_path);

    let bin_path = unique_path("bin");
    program
        .save_bincode(&bin_path)
        .expect("save bincode to disk succeeds");
    assert_eq!(
        Program::load_bincode(&bin_path).expect("load bincode program"),
        program
    );
    let _ = fs::remove_file(bin_path);
}
