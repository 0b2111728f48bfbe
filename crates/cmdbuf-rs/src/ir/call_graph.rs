use std::collections::HashSet;

use thiserror::Error;

use crate::ir::spec::{Computation, ComputationId, Module, Operation};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallGraphError {
    #[error("computation {0:?} is referenced but not part of the module")]
    UnknownComputation(ComputationId),
}

/// Computations invoked from `computation`, deduplicated in first-call order.
pub fn callees_of(computation: &Computation) -> Vec<ComputationId> {
    let mut seen = HashSet::new();
    computation
        .body
        .iter()
        .flat_map(|inst| inst.op.called_computations())
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Orders computations so every caller precedes its callees.
///
/// Computations reachable from the entry come first; unreachable ones follow in module order.
pub fn callers_first_order(module: &Module) -> Result<Vec<ComputationId>, CallGraphError> {
    let mut visited = HashSet::new();
    let mut order = Vec::with_capacity(module.computations.len());
    let roots = std::iter::once(module.entry).chain(module.computations.iter().map(|c| c.id));
    for root in roots {
        if visited.contains(&root) {
            continue;
        }
        let mut postorder = Vec::new();
        post_order(module, root, &mut visited, &mut postorder)?;
        order.extend(postorder.into_iter().rev());
    }
    Ok(order)
}

fn post_order(
    module: &Module,
    root: ComputationId,
    visited: &mut HashSet<ComputationId>,
    out: &mut Vec<ComputationId>,
) -> Result<(), CallGraphError> {
    // Explicit stack of (computation, callees, next callee index).
    let mut stack: Vec<(ComputationId, Vec<ComputationId>, usize)> = Vec::new();
    let computation = module
        .computation(root)
        .ok_or(CallGraphError::UnknownComputation(root))?;
    visited.insert(root);
    stack.push((root, callees_of(computation), 0));

    while let Some((id, callees, next)) = stack.last_mut() {
        if let Some(callee) = callees.get(*next).copied() {
            *next += 1;
            if visited.insert(callee) {
                let computation = module
                    .computation(callee)
                    .ok_or(CallGraphError::UnknownComputation(callee))?;
                stack.push((callee, callees_of(computation), 0));
            }
        } else {
            out.push(*id);
            stack.pop();
        }
    }
    Ok(())
}

/// `root` plus every computation transitively called from it.
pub fn reachable_from(
    module: &Module,
    root: ComputationId,
) -> Result<HashSet<ComputationId>, CallGraphError> {
    let mut visited = HashSet::new();
    let mut worklist = vec![root];
    while let Some(id) = worklist.pop() {
        if !visited.insert(id) {
            continue;
        }
        let computation = module
            .computation(id)
            .ok_or(CallGraphError::UnknownComputation(id))?;
        worklist.extend(callees_of(computation));
    }
    Ok(visited)
}

/// Computations that serve as fusion kernel bodies, including anything they call.
pub fn fusion_bodies(module: &Module) -> Result<HashSet<ComputationId>, CallGraphError> {
    let mut bodies = HashSet::new();
    for computation in &module.computations {
        for inst in &computation.body {
            if let Operation::Fusion(spec) = &inst.op {
                bodies.extend(reachable_from(module, spec.calls)?);
            }
        }
    }
    Ok(bodies)
}
