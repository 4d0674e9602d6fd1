//! Assembly of reconciled loop regions into a runnable LTIR program.

use crate::backend::ltir_utils::tensor_spec_static;
use crate::backend::spec::{
    BackendError, DType, GetTupleElementSpec, Operand, Operation, Program, ProgramBuilder,
    SpecErrorCode, ValueId, ValueType, WhileSpec,
};

use super::error::{LoopError, LoopErrorKind, Stage};
use super::reconcile::ReconciledLoop;

pub(crate) const LOOP_ENTRY: &str = "while_loop";

/// Builds the single-submission loop program.
///
/// The entry function takes one parameter per canonical slot, packs them into
/// one tuple, runs `While` over it, and unpacks every slot back out so the
/// backend returns plain tensor handles.
pub(crate) fn assemble_program(reconciled: &ReconciledLoop) -> Result<Program, LoopError> {
    let slot_types: Vec<ValueType> = reconciled
        .operand_specs
        .iter()
        .cloned()
        .map(ValueType::Tensor)
        .collect();

    let mut builder = ProgramBuilder::new();
    let parameter_ids: Vec<ValueId> = slot_types
        .iter()
        .map(|ty| builder.add_parameter(ty.clone()))
        .collect();
    let tuple_ty = ValueType::Tuple(slot_types.clone());
    let tuple_id = builder.emit(
        Operation::Tuple,
        parameter_ids.iter().copied().map(Operand::Value).collect(),
        tuple_ty.clone(),
    );
    let while_id = builder.emit(
        Operation::While(WhileSpec {
            cond_region: reconciled.cond_region.id,
            body_region: reconciled.body_region.id,
        }),
        vec![Operand::Value(tuple_id)],
        tuple_ty,
    );
    let mut result_ids = Vec::with_capacity(slot_types.len());
    for (index, ty) in slot_types.iter().enumerate() {
        result_ids.push(builder.emit(
            Operation::GetTupleElement(GetTupleElementSpec { index }),
            vec![Operand::Value(while_id)],
            ty.clone(),
        ));
    }
    let function = builder.finish(LOOP_ENTRY, result_ids);

    check_region_signatures(reconciled, &slot_types)?;

    Ok(Program::new(LOOP_ENTRY)
        .with_functions(vec![function])
        .with_regions(vec![
            reconciled.cond_region.clone(),
            reconciled.body_region.clone(),
        ]))
}

/// Last structural gate before the backend sees the program. The reconciler
/// already validated specs slot by slot; this catches assembly-level drift
/// between the tuple layout and the lowered regions.
fn check_region_signatures(
    reconciled: &ReconciledLoop,
    slot_types: &[ValueType],
) -> Result<(), LoopError> {
    for region in [&reconciled.cond_region, &reconciled.body_region] {
        if region.parameters.as_slice() != slot_types {
            return Err(signature_mismatch(format!(
                "region ^r{} parameters do not match the loop tuple layout",
                region.id.0
            )));
        }
    }
    let predicate = [ValueType::Tensor(tensor_spec_static(DType::I1, &[1]))];
    if reconciled.cond_region.results.as_slice() != predicate.as_slice() {
        return Err(signature_mismatch(format!(
            "region ^r{} must produce a [1] x I1 predicate",
            reconciled.cond_region.id.0
        )));
    }
    if reconciled.body_region.results.as_slice() != slot_types {
        return Err(signature_mismatch(format!(
            "region ^r{} results do not match the loop tuple layout",
            reconciled.body_region.id.0
        )));
    }
    Ok(())
}

fn signature_mismatch(detail: String) -> LoopError {
    LoopError::new(
        Stage::Assembling,
        LoopErrorKind::Compile {
            source: BackendError::spec(SpecErrorCode::RegionSignatureMismatch, detail),
        },
    )
}
