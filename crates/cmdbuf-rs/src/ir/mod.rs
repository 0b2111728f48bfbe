//! Graph IR the scheduling passes operate on.
//!
//! A [`spec::Module`] owns [`spec::Computation`]s; each computation is an SSA instruction list
//! whose order is the schedule. [`index`] and [`rewriter`] provide indexed editing,
//! [`text_ir`] a compact text format for fixtures.

pub mod call_graph;
pub mod index;
pub mod ir_utils;
pub mod rewriter;
pub mod spec;
pub mod text_ir;

pub use index::{ComputationIndexError, ComputationIndices, InstId};
pub use rewriter::ComputationRewriter;
pub use spec::{
    Computation, ComputationBuilder, ComputationId, Instruction, Module, Operand, Operation,
    ValueId, ValueType,
};
