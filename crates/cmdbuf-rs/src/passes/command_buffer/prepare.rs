use std::collections::{HashMap, HashSet};

use crate::ir::ir_utils::hoist_leaves;
use crate::ir::spec::{Computation, ComputationBuilder, Operation, ValueId, ValueType};
use crate::ir::{ComputationIndexError, ComputationIndices};

use super::collect::CommandRun;
use super::error::CommandBufferError;

/// A run outlined into a standalone computation, ready to be spliced into the module.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    /// Parent values read by the run, in first-use order. Parameter `i` receives `arguments[i]`.
    pub arguments: Vec<ValueId>,
    /// Run values visible outside the run, in schedule order.
    pub results: Vec<ValueId>,
    pub computation: Computation,
    /// Parent value to its clone inside `computation`.
    pub value_map: HashMap<ValueId, ValueId>,
    pub num_commands: usize,
}

impl CommandBuffer {
    /// Type produced by a call to the command buffer.
    pub fn result_type(&self) -> Option<&ValueType> {
        self.computation.result_type()
    }
}

/// Positions of `run` in the current schedule of `parent`, checked to still be contiguous.
pub(crate) fn locate_run(
    parent: &Computation,
    indices: &ComputationIndices,
    run: &CommandRun,
) -> Result<std::ops::Range<usize>, CommandBufferError> {
    let first = *run.values.first().ok_or(CommandBufferError::EmptyRun)?;
    let missing = || CommandBufferError::MissingRun {
        computation: parent.name.clone(),
        first,
    };
    let start = indices.position_of_value(first).ok_or_else(missing)?;
    let end = start + run.values.len();
    let contiguous = parent
        .body
        .get(start..end)
        .is_some_and(|slice| slice.iter().map(|inst| inst.id).eq(run.values.iter().copied()));
    if !contiguous {
        return Err(missing());
    }
    Ok(start..end)
}

/// Values of the run at `range` that are the root or read by an instruction outside it.
fn run_results(
    parent: &Computation,
    indices: &ComputationIndices,
    range: std::ops::Range<usize>,
) -> Vec<ValueId> {
    parent.body[range.clone()]
        .iter()
        .filter(|inst| {
            inst.id == parent.root
                || indices.users_of(inst.id).iter().any(|user| {
                    indices
                        .position(*user)
                        .is_some_and(|pos| !range.contains(&pos))
                })
        })
        .map(|inst| inst.id)
        .collect()
}

/// Returns `true` when nothing outside `run` observes any of its values.
pub fn is_dead_run(parent: &Computation, run: &CommandRun) -> Result<bool, CommandBufferError> {
    let indices =
        ComputationIndices::build(parent).map_err(CommandBufferError::index(&parent.name))?;
    let range = locate_run(parent, &indices, run)?;
    Ok(run_results(parent, &indices, range).is_empty())
}

/// Builds the command buffer computation for `run` without touching `parent`.
///
/// A dead run yields a buffer with no results whose root is an empty tuple; the pass never
/// outlines those (see [`is_dead_run`]).
pub fn prepare_command_buffer(
    parent: &Computation,
    run: &CommandRun,
    name: impl Into<String>,
) -> Result<CommandBuffer, CommandBufferError> {
    let indices =
        ComputationIndices::build(parent).map_err(CommandBufferError::index(&parent.name))?;
    let range = locate_run(parent, &indices, run)?;
    let in_run = run.values.iter().copied().collect::<HashSet<_>>();
    let instructions = &parent.body[range.clone()];

    let mut arguments = Vec::new();
    let mut seen_arguments = HashSet::new();
    for inst in instructions {
        for operand in &inst.operands {
            let value = operand.value();
            if !in_run.contains(&value) && seen_arguments.insert(value) {
                arguments.push(value);
            }
        }
    }

    let results = run_results(parent, &indices, range.clone());

    let mut builder = ComputationBuilder::new();
    let mut value_map = HashMap::new();
    for argument in &arguments {
        let ty = indices.type_of(*argument).cloned().ok_or_else(|| {
            CommandBufferError::index(&parent.name)(ComputationIndexError::MissingValueDefinition {
                value: *argument,
            })
        })?;
        value_map.insert(*argument, builder.add_parameter(ty));
    }

    for inst in instructions {
        let operands = inst
            .operands
            .iter()
            .map(|operand| {
                let value = operand.value();
                match value_map.get(&value) {
                    Some(clone) => Ok(operand.with_value(*clone)),
                    None if in_run.contains(&value) => Err(CommandBufferError::MissingClone { value }),
                    None => Err(CommandBufferError::EscapingOperand { value }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let clone = builder.emit(inst.op.clone(), operands, inst.output.clone());
        value_map.insert(inst.id, clone);
    }

    let clone_of = |value: ValueId| {
        value_map
            .get(&value)
            .copied()
            .ok_or(CommandBufferError::MissingClone { value })
    };
    let root = match results.as_slice() {
        [single] => clone_of(*single)?,
        many => {
            let operands = many
                .iter()
                .map(|value| clone_of(*value).map(crate::ir::Operand::Value))
                .collect::<Result<Vec<_>, _>>()?;
            let types = many
                .iter()
                .filter_map(|value| indices.type_of(*value).cloned())
                .collect::<Vec<_>>();
            builder.emit(Operation::Tuple, operands, ValueType::Tuple(types))
        }
    };

    let mut computation = builder.finish(name, root);
    computation.execution_thread = parent.execution_thread.clone();
    hoist_leaves(&mut computation);

    Ok(CommandBuffer {
        arguments,
        results,
        computation,
        value_map,
        num_commands: run.num_commands,
    })
}
