use thiserror::Error;

use crate::ir::{call_graph::CallGraphError, ComputationId, ComputationIndexError, ValueId};

/// Internal errors raised while outlining a command buffer. Any of them aborts the pass run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandBufferError {
    #[error("command buffer run is empty")]
    EmptyRun,
    #[error("instruction %{value:?} has no clone in the command buffer")]
    MissingClone { value: ValueId },
    #[error("operand %{value:?} escapes the command buffer boundary")]
    EscapingOperand { value: ValueId },
    #[error("run starting at %{first:?} is no longer a contiguous part of `{computation}`")]
    MissingRun { computation: String, first: ValueId },
    #[error("computation {0:?} is not part of the module")]
    UnknownComputation(ComputationId),
    #[error("malformed computation `{computation}`: {source}")]
    Index {
        computation: String,
        #[source]
        source: ComputationIndexError,
    },
}

impl CommandBufferError {
    pub(crate) fn index(computation: &str) -> impl FnOnce(ComputationIndexError) -> Self + '_ {
        move |source| CommandBufferError::Index {
            computation: computation.to_string(),
            source,
        }
    }
}

impl From<CallGraphError> for CommandBufferError {
    fn from(err: CallGraphError) -> Self {
        match err {
            CallGraphError::UnknownComputation(id) => CommandBufferError::UnknownComputation(id),
        }
    }
}
