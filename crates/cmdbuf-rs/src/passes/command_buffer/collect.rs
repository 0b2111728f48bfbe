use std::collections::HashSet;

use crate::ir::ir_utils::is_no_op;
use crate::ir::spec::{Computation, ComputationId, Instruction, Module, Operation, ValueId};

use super::config::{command_kind_of, is_eligible, CommandBufferConfig, DeviceVersions};

/// How the collector treats one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Counts toward the run length.
    Command,
    /// Joins an open run without counting; never opens one.
    NoOp,
    /// Closes the open run.
    Boundary,
}

/// Decides which instructions are commands for one device and configuration.
pub struct CommandClassifier<'a> {
    module: &'a Module,
    config: &'a CommandBufferConfig,
    versions: DeviceVersions,
    processed: &'a HashSet<ComputationId>,
}

impl<'a> CommandClassifier<'a> {
    pub fn new(
        module: &'a Module,
        config: &'a CommandBufferConfig,
        versions: DeviceVersions,
        processed: &'a HashSet<ComputationId>,
    ) -> Self {
        Self {
            module,
            config,
            versions,
            processed,
        }
    }

    pub fn role(&self, inst: &Instruction) -> Role {
        if is_no_op(&inst.op) {
            return Role::NoOp;
        }
        if self.is_command(&inst.op, &mut HashSet::new()) {
            Role::Command
        } else {
            Role::Boundary
        }
    }

    fn is_command(&self, op: &Operation, visiting: &mut HashSet<ComputationId>) -> bool {
        let Some(kind) = command_kind_of(op) else {
            return false;
        };
        if !is_eligible(kind, self.config, self.versions) {
            return false;
        }
        match op {
            // Control flow is recorded together with its bodies, which must not already be
            // outlined.
            Operation::While(_) | Operation::Conditional(_) => {
                op.called_computations().into_iter().all(|id| {
                    !self.processed.contains(&id) && self.is_command_computation(id, visiting)
                })
            }
            _ => true,
        }
    }

    /// Every instruction of `id` can be recorded into a command buffer.
    fn is_command_computation(&self, id: ComputationId, visiting: &mut HashSet<ComputationId>) -> bool {
        if !visiting.insert(id) {
            return false;
        }
        let Some(computation) = self.module.computation(id) else {
            return false;
        };
        let all_commands = computation.body.iter().all(|inst| {
            inst.op.is_leaf() || is_no_op(&inst.op) || self.is_command(&inst.op, visiting)
        });
        visiting.remove(&id);
        all_commands
    }
}

/// A maximal contiguous run of instructions selected for one command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRun {
    /// Schedule position of the first instruction when the run was collected.
    pub start: usize,
    /// Values defined by the run, in schedule order.
    pub values: Vec<ValueId>,
    pub num_commands: usize,
}

impl CommandRun {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// One past the last schedule position when the run was collected.
    pub fn end(&self) -> usize {
        self.start + self.values.len()
    }
}

/// Splits the schedule of `computation` into runs of commands.
///
/// Runs with fewer than `max(1, min_num_commands)` commands are dropped; trailing no-ops are
/// trimmed from every run.
pub fn collect_command_buffer_sequences(
    computation: &Computation,
    classifier: &CommandClassifier<'_>,
    min_num_commands: usize,
) -> Vec<CommandRun> {
    collect_with_roles(
        computation.body.iter().map(|inst| (inst.id, classifier.role(inst))),
        min_num_commands,
    )
}

/// Core of the collector over a pre-classified schedule.
pub fn collect_with_roles(
    schedule: impl IntoIterator<Item = (ValueId, Role)>,
    min_num_commands: usize,
) -> Vec<CommandRun> {
    let threshold = min_num_commands.max(1);
    let mut runs = Vec::new();
    let mut current: Option<CommandRun> = None;

    let close = |current: &mut Option<CommandRun>, runs: &mut Vec<CommandRun>, trailing: usize| {
        if let Some(mut run) = current.take() {
            run.values.truncate(run.values.len() - trailing);
            if run.num_commands >= threshold {
                runs.push(run);
            }
        }
    };

    let mut trailing_no_ops = 0usize;
    for (pos, (value, role)) in schedule.into_iter().enumerate() {
        match role {
            Role::Command => {
                let run = current.get_or_insert_with(|| CommandRun {
                    start: pos,
                    values: Vec::new(),
                    num_commands: 0,
                });
                run.values.push(value);
                run.num_commands += 1;
                trailing_no_ops = 0;
            }
            Role::NoOp => {
                if let Some(run) = current.as_mut() {
                    run.values.push(value);
                    trailing_no_ops += 1;
                }
            }
            Role::Boundary => {
                close(&mut current, &mut runs, trailing_no_ops);
                trailing_no_ops = 0;
            }
        }
    }
    close(&mut current, &mut runs, trailing_no_ops);
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use Role::{Boundary as B, Command as C, NoOp as N};

    fn schedule(roles: &[Role]) -> Vec<(ValueId, Role)> {
        roles
            .iter()
            .enumerate()
            .map(|(idx, role)| (ValueId(idx as u32), *role))
            .collect()
    }

    fn ids(run: &CommandRun) -> Vec<u32> {
        run.values.iter().map(|value| value.0).collect()
    }

    #[test]
    fn no_ops_never_open_a_run() {
        let runs = collect_with_roles(schedule(&[N, N, C, N, C]), 1);
        assert_eq!(runs.len(), 1);
        assert_eq!(ids(&runs[0]), vec![2, 3, 4]);
        assert_eq!(runs[0].num_commands, 2);
        assert_eq!(runs[0].start, 2);
    }

    #[test]
    fn trailing_no_ops_are_trimmed() {
        let runs = collect_with_roles(schedule(&[C, N, N, B, C, N]), 1);
        assert_eq!(runs.iter().map(ids).collect::<Vec<_>>(), vec![vec![0], vec![4]]);
    }

    #[test]
    fn threshold_counts_commands_only() {
        let runs = collect_with_roles(schedule(&[C, N, N, C, B, C, C, C]), 3);
        assert_eq!(runs.len(), 1);
        assert_eq!(ids(&runs[0]), vec![5, 6, 7]);
    }

    #[test]
    fn zero_threshold_behaves_like_one() {
        assert!(collect_with_roles(schedule(&[N, B, N]), 0).is_empty());
        assert_eq!(collect_with_roles(schedule(&[C]), 0).len(), 1);
    }
}
