extern crate self as cmdbuf_rs;

mod env;
pub mod ir;
pub mod passes;
pub mod trace;

pub use ir::{Computation, Module};
pub use passes::command_buffer::{
    CommandBufferConfig, CommandBufferOptions, CommandBufferScheduling, CommandKind,
    DeviceVersions,
};
pub use passes::{ExecutionThreadSet, ModulePass, PassPipeline, PassResult};
