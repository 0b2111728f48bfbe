//! Host callback boundary for custom calls that leave the command-buffer graph.
//!
//! A [`CpuCallback`] binds a [`HostCallable`] to the operand and result signature of one custom
//! call. Device buffers are exposed to the callable as read-only [`ArrayView`]s, results are
//! validated against the expected tuple and copied (or transposed through a cached
//! [`TransposePlan`]) into the output buffers. Failures land in a [`CustomCallStatus`] and never
//! unwind across [`ffi::cmdbuf_cpu_callback`].

mod callback;
pub mod ffi;
mod host;
mod status;
pub mod transpose;

pub use callback::{CallbackArg, CallbackError, CallbackResult, CpuCallback};
pub use host::{
    row_major_strides, strided_extent, ArrayView, HostArg, HostArray, HostCallable, HostError,
    HostRuntime, HostValue,
};
pub use status::CustomCallStatus;
pub use transpose::{TransposeError, TransposeOptions, TransposePlan, TransposePlanCache};
