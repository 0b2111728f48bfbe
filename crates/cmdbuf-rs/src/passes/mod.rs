//! Module-level passes and the pipeline that drives them.

pub mod command_buffer;
mod pipeline;

use std::collections::BTreeSet;

use thiserror::Error;

use crate::ir::{spec::Computation, Module};

pub use command_buffer::{
    CommandBufferConfig, CommandBufferError, CommandBufferOptions, CommandBufferScheduling,
    CommandKind, DeviceVersions,
};
pub use pipeline::{PassPipeline, PipelineBuilder, PipelineConfig, Step};

/// Result returned by a [`ModulePass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR.
    pub changed: bool,
    /// Number of iterations executed while applying the pass.
    pub iterations: usize,
    /// Total number of rewrites applied by the pass.
    pub rewrites_applied: usize,
    /// Instructions removed from their original computation.
    pub erased_insts: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_insts: self.erased_insts + other.erased_insts,
        }
    }
}

/// Execution threads a pass may touch. The empty set admits every thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutionThreadSet {
    threads: BTreeSet<String>,
}

impl ExecutionThreadSet {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I, S>(threads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            threads: threads.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, thread: &str) -> bool {
        self.threads.is_empty() || self.threads.contains(thread)
    }

    pub fn admits(&self, computation: &Computation) -> bool {
        self.contains(&computation.execution_thread)
    }
}

/// Errors that abort a pass run.
#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    CommandBuffer(#[from] CommandBufferError),
}

/// Canonical interface implemented by passes that operate on a whole module.
pub trait ModulePass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, module: &mut Module, threads: &ExecutionThreadSet)
        -> Result<PassResult, PassError>;
}
