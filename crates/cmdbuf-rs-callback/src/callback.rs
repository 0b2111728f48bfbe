//! Invocation of a host callable on device buffers.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use cmdbuf_rs::ir::spec::DType;
use thiserror::Error;

use crate::host::{
    row_major_strides, strided_extent, ArrayView, HostArg, HostCallable, HostRuntime, HostValue,
};
use crate::status::CustomCallStatus;
use crate::transpose::{TransposeError, TransposeOptions, TransposePlanCache};

fn join_dims(dims: &[usize]) -> String {
    dims.iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("CpuCallback error: {0}")]
    Callable(String),
    #[error("CPU callback expected a tuple result, got {0}")]
    NotATuple(String),
    #[error("CPU callback expected a tuple with {expected} results, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("Token output from host callback should be None, got {0}")]
    TokenNotNone(String),
    #[error("CPU callback expected an array for the {index}-th return value, got {got}")]
    ResultNotArray { index: usize, got: String },
    #[error(
        "Mismatched result shape for {index}-th return value from CPU callback; expected array with dimensions {}, got {}",
        join_dims(.expected),
        join_dims(.got)
    )]
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error(
        "Mismatched result dtype for {index}-th return value from CPU callback; expected {}, got {}",
        .expected.as_str(),
        .got.as_str()
    )]
    ResultDType {
        index: usize,
        expected: DType,
        got: DType,
    },
    #[error("CPU callback expected {expected} {role} buffers, got {got}")]
    BufferCount {
        role: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{role} buffer {index} of CPU callback holds {len} bytes, need {needed}")]
    BufferSize {
        role: &'static str,
        index: usize,
        len: usize,
        needed: usize,
    },
    #[error("null {0} pointer passed to CPU callback")]
    NullPointer(&'static str),
    #[error(transparent)]
    Transpose(#[from] TransposeError),
}

/// Describes one operand handed to the callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackArg {
    /// Ordering token; passed to the callable as `None`.
    Token,
    Array {
        dtype: DType,
        dims: Vec<usize>,
        /// Byte strides of the device buffer.
        strides: Vec<i64>,
    },
}

impl CallbackArg {
    /// Dense row-major array argument.
    pub fn array(dtype: DType, dims: &[usize]) -> Self {
        CallbackArg::Array {
            dtype,
            dims: dims.to_vec(),
            strides: row_major_strides(dtype, dims),
        }
    }

    /// Bytes the device buffer must provide.
    pub fn byte_len(&self) -> usize {
        match self {
            CallbackArg::Token => 0,
            CallbackArg::Array {
                dtype,
                dims,
                strides,
            } => strided_extent(*dtype, dims, strides),
        }
    }
}

/// Describes one value the callable must return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    Token,
    Array {
        dtype: DType,
        expected_dims: Vec<usize>,
        /// Byte strides of the output buffer layout.
        expected_strides: Vec<i64>,
        /// Output layout as major-to-minor dimension order.
        reversed_layout: Vec<usize>,
        size_in_bytes: usize,
    },
}

impl CallbackResult {
    /// Dense row-major array result.
    pub fn array(dtype: DType, dims: &[usize]) -> Self {
        let minor_to_major = (0..dims.len()).rev().collect::<Vec<_>>();
        Self::dense(dtype, dims, &minor_to_major)
    }

    /// Dense array result stored with the given minor-to-major layout.
    ///
    /// `minor_to_major` must name every axis of `dims` exactly once.
    pub fn with_layout(
        dtype: DType,
        dims: &[usize],
        minor_to_major: &[usize],
    ) -> Result<Self, TransposeError> {
        let rank = dims.len();
        let mut seen = vec![false; rank];
        let valid = minor_to_major.len() == rank
            && minor_to_major
                .iter()
                .all(|axis| *axis < rank && !std::mem::replace(&mut seen[*axis], true));
        if !valid {
            return Err(TransposeError::InvalidPermutation {
                permutation: minor_to_major.to_vec(),
                rank,
            });
        }
        Ok(Self::dense(dtype, dims, minor_to_major))
    }

    fn dense(dtype: DType, dims: &[usize], minor_to_major: &[usize]) -> Self {
        let mut expected_strides = vec![0i64; dims.len()];
        let mut stride = dtype.size_in_bytes() as i64;
        for axis in minor_to_major {
            expected_strides[*axis] = stride;
            stride *= dims[*axis].max(1) as i64;
        }
        CallbackResult::Array {
            dtype,
            expected_dims: dims.to_vec(),
            expected_strides,
            reversed_layout: minor_to_major.iter().rev().copied().collect(),
            size_in_bytes: dims.iter().product::<usize>() * dtype.size_in_bytes(),
        }
    }

    /// Bytes the output buffer must provide.
    pub fn byte_len(&self) -> usize {
        match self {
            CallbackResult::Token => 0,
            CallbackResult::Array { size_in_bytes, .. } => *size_in_bytes,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callable panicked".to_string()
    }
}

/// A host callable bound to the operand and result signature of one custom call.
///
/// The callable runs under [`HostRuntime`], so it must not invoke another callback on the same
/// thread.
pub struct CpuCallback {
    callable: Arc<dyn HostCallable>,
    args: Vec<CallbackArg>,
    results: Vec<CallbackResult>,
    transpose_cache: TransposePlanCache,
}

impl CpuCallback {
    pub fn new(
        callable: Arc<dyn HostCallable>,
        args: Vec<CallbackArg>,
        results: Vec<CallbackResult>,
    ) -> Self {
        Self {
            callable,
            args,
            results,
            transpose_cache: TransposePlanCache::default(),
        }
    }

    pub fn args(&self) -> &[CallbackArg] {
        &self.args
    }

    pub fn results(&self) -> &[CallbackResult] {
        &self.results
    }

    pub fn transpose_cache(&self) -> &TransposePlanCache {
        &self.transpose_cache
    }

    /// Invokes the callable and returns its validated results.
    pub fn call(&self, args: &[HostArg<'_>]) -> Result<Vec<HostValue>, CallbackError> {
        let _runtime = HostRuntime::acquire();
        self.call_internal(args)
    }

    /// Like [`CpuCallback::call`], reporting failures through `status`.
    pub fn call_with_status(
        &self,
        args: &[HostArg<'_>],
        status: &mut CustomCallStatus,
    ) -> Option<Vec<HostValue>> {
        match self.call(args) {
            Ok(values) => Some(values),
            Err(err) => {
                tracing::debug!(error = %err, "host callback failed");
                status.set_failure(err.to_string());
                None
            }
        }
    }

    /// Wraps `inputs` as read-only views, invokes the callable and writes each array result into
    /// the matching entry of `outputs`. Token slots may be empty.
    pub fn prepare_and_call(
        &self,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
    ) -> Result<(), CallbackError> {
        if inputs.len() != self.args.len() {
            return Err(CallbackError::BufferCount {
                role: "input",
                expected: self.args.len(),
                got: inputs.len(),
            });
        }
        if outputs.len() != self.results.len() {
            return Err(CallbackError::BufferCount {
                role: "output",
                expected: self.results.len(),
                got: outputs.len(),
            });
        }

        let mut host_args = Vec::with_capacity(self.args.len());
        for (index, (arg, input)) in self.args.iter().zip(inputs).enumerate() {
            match arg {
                CallbackArg::Token => host_args.push(HostArg::None),
                CallbackArg::Array {
                    dtype,
                    dims,
                    strides,
                } => {
                    let needed = arg.byte_len();
                    let data = input.get(..needed).ok_or(CallbackError::BufferSize {
                        role: "input",
                        index,
                        len: input.len(),
                        needed,
                    })?;
                    host_args.push(HostArg::Array(ArrayView {
                        dtype: *dtype,
                        dims,
                        strides,
                        data,
                    }));
                }
            }
        }

        let _runtime = HostRuntime::acquire();
        let values = self.call_internal(&host_args)?;
        for (index, ((result, value), output)) in self
            .results
            .iter()
            .zip(&values)
            .zip(outputs.iter_mut())
            .enumerate()
        {
            let CallbackResult::Array {
                dtype,
                expected_strides,
                reversed_layout,
                size_in_bytes,
                ..
            } = result
            else {
                continue;
            };
            let array = match value {
                HostValue::Array(array) => array,
                other => {
                    return Err(CallbackError::ResultNotArray {
                        index,
                        got: other.to_string(),
                    })
                }
            };
            let len = output.len();
            let output = output
                .get_mut(..*size_in_bytes)
                .ok_or(CallbackError::BufferSize {
                    role: "output",
                    index,
                    len,
                    needed: *size_in_bytes,
                })?;
            if array.strides == *expected_strides {
                let data = array
                    .data
                    .get(..*size_in_bytes)
                    .ok_or(CallbackError::BufferSize {
                        role: "result",
                        index,
                        len: array.data.len(),
                        needed: *size_in_bytes,
                    })?;
                output.copy_from_slice(data);
            } else {
                let plan = self.transpose_cache.get_or_create(&TransposeOptions {
                    elem_size_in_bytes: dtype.size_in_bytes(),
                    dims: array.dims.clone(),
                    permutation: reversed_layout.clone(),
                    input_strides: array.strides.clone(),
                })?;
                plan.execute(&array.data, output)?;
            }
        }
        Ok(())
    }

    /// Like [`CpuCallback::prepare_and_call`], reporting failures through `status`.
    pub fn prepare_and_call_with_status(
        &self,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
        status: &mut CustomCallStatus,
    ) {
        if let Err(err) = self.prepare_and_call(inputs, outputs) {
            tracing::debug!(error = %err, "host callback failed");
            status.set_failure(err.to_string());
        }
    }

    fn call_internal(&self, args: &[HostArg<'_>]) -> Result<Vec<HostValue>, CallbackError> {
        let returned = catch_unwind(AssertUnwindSafe(|| self.callable.call(args)))
            .map_err(|payload| CallbackError::Callable(panic_message(&*payload)))?
            .map_err(|err| CallbackError::Callable(err.message().to_string()))?;

        let values = match returned {
            HostValue::Tuple(values) => values,
            other => return Err(CallbackError::NotATuple(other.to_string())),
        };
        if values.len() != self.results.len() {
            return Err(CallbackError::Arity {
                expected: self.results.len(),
                got: values.len(),
            });
        }
        for (index, (result, value)) in self.results.iter().zip(&values).enumerate() {
            match (result, value) {
                (CallbackResult::Token, HostValue::None) => {}
                (CallbackResult::Token, other) => {
                    return Err(CallbackError::TokenNotNone(other.to_string()))
                }
                (
                    CallbackResult::Array {
                        dtype,
                        expected_dims,
                        ..
                    },
                    HostValue::Array(array),
                ) => {
                    if array.dims != *expected_dims {
                        return Err(CallbackError::ShapeMismatch {
                            index,
                            expected: expected_dims.clone(),
                            got: array.dims.clone(),
                        });
                    }
                    if array.dtype != *dtype {
                        return Err(CallbackError::ResultDType {
                            index,
                            expected: *dtype,
                            got: array.dtype,
                        });
                    }
                }
                (CallbackResult::Array { .. }, other) => {
                    return Err(CallbackError::ResultNotArray {
                        index,
                        got: other.to_string(),
                    })
                }
            }
        }
        Ok(values)
    }
}

impl std::fmt::Debug for CpuCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuCallback")
            .field("args", &self.args)
            .field("results", &self.results)
            .field("transpose_cache", &self.transpose_cache)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_results_keep_identity_layout() {
        assert_eq!(
            CallbackResult::array(DType::F32, &[2, 3]),
            CallbackResult::Array {
                dtype: DType::F32,
                expected_dims: vec![2, 3],
                expected_strides: vec![12, 4],
                reversed_layout: vec![0, 1],
                size_in_bytes: 24,
            }
        );
    }

    #[test]
    fn column_major_results_reverse_the_layout() {
        assert_eq!(
            CallbackResult::with_layout(DType::F32, &[2, 3], &[0, 1]),
            Ok(CallbackResult::Array {
                dtype: DType::F32,
                expected_dims: vec![2, 3],
                expected_strides: vec![4, 8],
                reversed_layout: vec![1, 0],
                size_in_bytes: 24,
            })
        );
    }

    #[test]
    fn layouts_must_name_every_axis_once() {
        for layout in [&[0, 2][..], &[1, 1], &[0], &[2, 1, 0]] {
            assert_eq!(
                CallbackResult::with_layout(DType::F32, &[2, 3], layout),
                Err(TransposeError::InvalidPermutation {
                    permutation: layout.to_vec(),
                    rank: 2,
                }),
                "layout {layout:?}"
            );
        }
        assert!(CallbackResult::with_layout(DType::Si8, &[], &[]).is_ok());
    }

    #[test]
    fn shape_mismatch_joins_dims_with_commas() {
        let err = CallbackError::ShapeMismatch {
            index: 1,
            expected: vec![2, 3],
            got: vec![3],
        };
        assert_eq!(
            err.to_string(),
            "Mismatched result shape for 1-th return value from CPU callback; expected array with dimensions 2,3, got 3"
        );
    }
}
