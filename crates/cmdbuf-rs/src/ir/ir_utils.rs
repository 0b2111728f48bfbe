use std::sync::Arc;

use crate::ir::spec::{
    Computation, DType, Operand, Operation, Shape, TensorLiteral, TensorSpec, ValueId,
    ValueType,
};

/// Builds a static shape descriptor from explicit dimensions.
pub fn shape_static(dims: &[usize]) -> Shape {
    Shape::new(dims)
}

/// Builds a tensor spec with fully static dimensions.
pub fn tensor_spec_static(dtype: DType, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(dtype, shape_static(dims))
}

/// Wraps a static tensor spec as a value type.
pub fn tensor_type(dtype: DType, dims: &[usize]) -> ValueType {
    ValueType::Tensor(tensor_spec_static(dtype, dims))
}

/// Creates an f32 literal where every element equals `value`.
pub fn tensor_literal_f32_splat(dims: &[usize], value: f32) -> TensorLiteral {
    let count = dims.iter().product::<usize>();
    let bytes = value.to_le_bytes().repeat(count);
    TensorLiteral::new(
        tensor_spec_static(DType::F32, dims),
        Arc::<[u8]>::from(bytes),
    )
}

/// Operands referencing values by id only.
pub fn value_operands(values: &[ValueId]) -> Vec<Operand> {
    values.iter().copied().map(Operand::Value).collect()
}

/// Moves parameters and constants to the front of the schedule, keeping relative order.
///
/// Leaves read no other value, so hoisting them keeps the schedule topologically valid.
/// Returns `true` when the order changed.
pub fn hoist_leaves(computation: &mut Computation) -> bool {
    let already_front = computation
        .body
        .iter()
        .skip_while(|inst| inst.op.is_leaf())
        .all(|inst| !inst.op.is_leaf());
    if already_front {
        return false;
    }
    let (mut leaves, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut computation.body)
        .into_iter()
        .partition(|inst| inst.op.is_leaf());
    leaves.extend(rest);
    computation.body = leaves;
    true
}

/// Returns `true` when `op` only reshuffles or renames existing buffers.
pub fn is_no_op(op: &Operation) -> bool {
    matches!(
        op,
        Operation::Bitcast | Operation::Tuple | Operation::GetTupleElement(_)
    )
}
