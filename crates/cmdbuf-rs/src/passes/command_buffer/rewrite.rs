use std::collections::HashSet;

use crate::ir::ir_utils::value_operands;
use crate::ir::spec::{
    CallKind, CallSpec, ComputationId, GetTupleElementSpec, Module, Operand, Operation, ValueId,
};
use crate::ir::{ComputationIndexError, ComputationIndices, ComputationRewriter, InstId};

use super::collect::CommandRun;
use super::error::CommandBufferError;
use super::prepare::{locate_run, CommandBuffer};

/// Where a command buffer ended up after splicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub computation: ComputationId,
    pub call: ValueId,
    /// Instructions removed from the parent.
    pub erased: usize,
    /// `get_tuple_element` nodes added after the call.
    pub inserted: usize,
}

/// Splices `buffer` into `module` and replaces `run` in `parent` with a call to it.
///
/// The parent is edited on a copy and swapped in only once every step succeeded, so a failure
/// leaves the module untouched.
pub fn rewrite_command_buffer(
    module: &mut Module,
    parent: ComputationId,
    run: &CommandRun,
    buffer: CommandBuffer,
) -> Result<RewriteOutcome, CommandBufferError> {
    let original = module
        .computation(parent)
        .ok_or(CommandBufferError::UnknownComputation(parent))?;
    let mut edited = original.clone();
    let name = edited.name.clone();

    let indices = ComputationIndices::build(&edited).map_err(CommandBufferError::index(&name))?;
    locate_run(&edited, &indices, run)?;
    let in_run = run.values.iter().copied().collect::<HashSet<_>>();
    let call_type = buffer
        .result_type()
        .cloned()
        .ok_or(CommandBufferError::MissingClone {
            value: buffer.computation.root,
        })?;
    let target = module.next_computation_id();

    let mut rewriter = ComputationRewriter::new(&mut edited).map_err(CommandBufferError::index(&name))?;
    let first = run
        .values
        .first()
        .and_then(|value| rewriter.inst_of(*value))
        .ok_or(CommandBufferError::EmptyRun)?;
    let (call_inst, call) = rewriter
        .insert_before(
            first,
            Operation::Call(CallSpec {
                to_apply: target,
                kind: CallKind::CommandBuffer,
            }),
            value_operands(&buffer.arguments),
            call_type,
        )
        .map_err(CommandBufferError::index(&name))?;

    let mut inserted = 0usize;
    if let [result] = buffer.results.as_slice() {
        redirect_external_uses(&mut rewriter, &in_run, *result, |operand| operand.with_value(call))
            .map_err(CommandBufferError::index(&name))?;
        if rewriter.root() == *result {
            rewriter.set_root(call).map_err(CommandBufferError::index(&name))?;
        }
    } else {
        let mut last_inst = call_inst;
        for (index, result) in buffer.results.iter().copied().enumerate() {
            let reads_element = external_users(&rewriter, &in_run, result).iter().any(|user| {
                rewriter.operands(*user).iter().any(|operand| {
                    matches!(operand, Operand::TupleElement { tuple, .. } if *tuple == result)
                })
            });
            let is_root = rewriter.root() == result;
            if reads_element || is_root {
                let ty = rewriter.type_of(result).cloned().ok_or_else(|| {
                    CommandBufferError::index(&name)(ComputationIndexError::MissingValueDefinition { value: result })
                })?;
                let (gte_inst, gte) = rewriter
                    .insert_after(
                        last_inst,
                        Operation::GetTupleElement(GetTupleElementSpec { index }),
                        vec![Operand::Value(call)],
                        ty,
                    )
                    .map_err(CommandBufferError::index(&name))?;
                last_inst = gte_inst;
                inserted += 1;
                redirect_external_uses(&mut rewriter, &in_run, result, |operand| {
                    operand.with_value(gte)
                })
                .map_err(CommandBufferError::index(&name))?;
                if is_root {
                    rewriter.set_root(gte).map_err(CommandBufferError::index(&name))?;
                }
            } else {
                redirect_external_uses(&mut rewriter, &in_run, result, |operand| match operand {
                    Operand::Value(_) => Operand::TupleElement { tuple: call, index },
                    other => other,
                })
                .map_err(CommandBufferError::index(&name))?;
            }
        }
    }

    let run_insts = run
        .values
        .iter()
        .map(|value| rewriter.inst_of(*value).ok_or(CommandBufferError::MissingClone { value: *value }))
        .collect::<Result<Vec<_>, _>>()?;
    for inst in run_insts.iter().rev() {
        rewriter.erase_inst(*inst).map_err(CommandBufferError::index(&name))?;
    }
    drop(rewriter);

    let id = module.add_computation(buffer.computation);
    debug_assert_eq!(id, target);
    if let Some(slot) = module.computation_mut(parent) {
        *slot = edited;
    }

    Ok(RewriteOutcome {
        computation: id,
        call,
        erased: run_insts.len(),
        inserted,
    })
}

fn external_users(
    rewriter: &ComputationRewriter<'_>,
    in_run: &HashSet<ValueId>,
    value: ValueId,
) -> Vec<InstId> {
    rewriter
        .users_of(value)
        .iter()
        .copied()
        .filter(|user| {
            rewriter
                .value_of(*user)
                .is_some_and(|defined| !in_run.contains(&defined))
        })
        .collect()
}

fn redirect_external_uses(
    rewriter: &mut ComputationRewriter<'_>,
    in_run: &HashSet<ValueId>,
    result: ValueId,
    mut redirect: impl FnMut(Operand) -> Operand,
) -> Result<(), ComputationIndexError> {
    for user in external_users(rewriter, in_run, result) {
        rewriter.rewrite_operands(user, |operand| {
            if operand.value() == result {
                redirect(operand)
            } else {
                operand
            }
        })?;
    }
    Ok(())
}
