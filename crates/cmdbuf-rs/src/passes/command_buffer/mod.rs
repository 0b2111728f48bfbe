//! Outlines runs of device commands into command-buffer computations.
//!
//! For every computation the driver hoists parameters and constants, collects maximal runs of
//! commands ([`collect`]), builds a standalone computation per run ([`prepare`]) and replaces the
//! run by a single `call` ([`rewrite`]). The call is tagged as a command-buffer launch so later
//! runs of the pass leave the outlined computation alone.

pub mod collect;
pub mod config;
mod error;
pub mod prepare;
pub mod rewrite;

use std::collections::HashSet;

use crate::ir::call_graph::{callers_first_order, fusion_bodies, reachable_from};
use crate::ir::ir_utils::hoist_leaves;
use crate::ir::spec::{CallKind, Computation, ComputationId, Module, Operation};
use crate::passes::{ExecutionThreadSet, ModulePass, PassError, PassResult};
use crate::trace::{emit_pass_event, PassEvent, PassEventKind};

pub use collect::{collect_command_buffer_sequences, CommandClassifier, CommandRun, Role};
pub use config::{
    command_kind_of, is_eligible, CommandBufferConfig, CommandBufferOptions, CommandKind,
    DeviceVersions, ParseCommandKindError,
};
pub use error::CommandBufferError;
pub use prepare::{is_dead_run, prepare_command_buffer, CommandBuffer};
pub use rewrite::{rewrite_command_buffer, RewriteOutcome};

pub const PASS_NAME: &str = "command-buffer-scheduling";

/// Name given to outlined computations; clashes get a numeric suffix.
pub const COMMAND_BUFFER_NAME: &str = "command_buffer";

/// Moves parameters and constants to the front of the schedule. Returns `true` if it moved any.
pub fn move_parameters_and_constants_to_front(computation: &mut Computation) -> bool {
    hoist_leaves(computation)
}

/// The command-buffer scheduling pass for one device.
#[derive(Debug, Clone)]
pub struct CommandBufferScheduling {
    versions: DeviceVersions,
    options: CommandBufferOptions,
}

impl CommandBufferScheduling {
    pub fn new(versions: DeviceVersions, options: CommandBufferOptions) -> Self {
        Self { versions, options }
    }

    pub fn versions(&self) -> DeviceVersions {
        self.versions
    }

    pub fn options(&self) -> &CommandBufferOptions {
        &self.options
    }

    /// Outlines every run of commands in the computations admitted by `threads`.
    ///
    /// Stops at the first error; runs rewritten before the failure stay rewritten.
    pub fn run_module(
        &self,
        module: &mut Module,
        threads: &ExecutionThreadSet,
    ) -> Result<PassResult, CommandBufferError> {
        let order = callers_first_order(module)?;
        let kernels = fusion_bodies(module)?;
        let mut processed = existing_command_buffers(module)?;
        let mut result = PassResult {
            iterations: 1,
            ..PassResult::default()
        };

        for id in order {
            if processed.contains(&id) || kernels.contains(&id) {
                continue;
            }
            let computation = module
                .computation(id)
                .ok_or(CommandBufferError::UnknownComputation(id))?;
            if !threads.admits(computation) {
                continue;
            }

            let mut hoisted = computation.clone();
            move_parameters_and_constants_to_front(&mut hoisted);
            let collected = {
                let classifier = CommandClassifier::new(
                    module,
                    &self.options.enabled,
                    self.versions,
                    &processed,
                );
                collect_command_buffer_sequences(
                    &hoisted,
                    &classifier,
                    self.options.min_num_commands,
                )
            };
            // Runs nothing reads stay where they are.
            let mut runs = Vec::with_capacity(collected.len());
            for run in collected {
                if !is_dead_run(&hoisted, &run)? {
                    runs.push(run);
                }
            }
            if runs.is_empty() {
                continue;
            }
            if let Some(slot) = module.computation_mut(id) {
                *slot = hoisted;
            }

            for run in &runs {
                let outcome = self.lift(module, id, run)?;
                processed.extend(reachable_from(module, outcome.computation)?);
                result.changed = true;
                result.rewrites_applied += 1;
                result.erased_insts += outcome.erased;
            }
        }

        Ok(result)
    }

    fn lift(
        &self,
        module: &mut Module,
        parent: ComputationId,
        run: &CommandRun,
    ) -> Result<RewriteOutcome, CommandBufferError> {
        let name = module.next_computation_name(COMMAND_BUFFER_NAME);
        let computation = module
            .computation(parent)
            .ok_or(CommandBufferError::UnknownComputation(parent))?;
        let parent_name = computation.name.clone();
        let buffer = prepare_command_buffer(computation, run, name.clone())?;
        let (arguments, results) = (buffer.arguments.len(), buffer.results.len());
        let outcome = rewrite_command_buffer(module, parent, run, buffer)?;

        tracing::debug!(
            parent = %parent_name,
            computation = %name,
            commands = run.num_commands,
            instructions = run.len(),
            arguments,
            results,
            "outlined command buffer"
        );
        emit_pass_event(PassEvent::now(PassEventKind::CommandBufferLifted {
            module: module.name.clone(),
            parent: parent_name,
            computation: name,
            commands: run.num_commands,
            instructions: run.len(),
            arguments,
            results,
        }));
        Ok(outcome)
    }
}

impl ModulePass for CommandBufferScheduling {
    fn name(&self) -> &'static str {
        PASS_NAME
    }

    fn run(
        &self,
        module: &mut Module,
        threads: &ExecutionThreadSet,
    ) -> Result<PassResult, PassError> {
        self.run_module(module, threads).map_err(PassError::from)
    }
}

/// Computations launched by command-buffer calls already present in `module`.
fn existing_command_buffers(module: &Module) -> Result<HashSet<ComputationId>, CommandBufferError> {
    let mut lifted = HashSet::new();
    for computation in &module.computations {
        for inst in &computation.body {
            if let Operation::Call(spec) = &inst.op {
                if spec.kind == CallKind::CommandBuffer {
                    lifted.extend(reachable_from(module, spec.to_apply)?);
                }
            }
        }
    }
    Ok(lifted)
}
