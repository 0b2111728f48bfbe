//! Values exchanged with the host runtime and the lock that serializes access to it.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use cmdbuf_rs::ir::spec::DType;
use once_cell::sync::Lazy;
use thiserror::Error;

/// The host runtime is not re-entrant; every invocation holds this lock while it marshals
/// arguments, runs the callable and copies results out.
static RUNTIME_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Exclusive access to the host runtime.
pub struct HostRuntime {
    _guard: MutexGuard<'static, ()>,
}

impl HostRuntime {
    /// Blocks until the runtime is free. A panic in a previous holder does not poison it.
    pub fn acquire() -> Self {
        let guard = RUNTIME_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        Self { _guard: guard }
    }
}

/// Byte strides of a dense row-major array.
pub fn row_major_strides(dtype: DType, dims: &[usize]) -> Vec<i64> {
    let mut strides = vec![0i64; dims.len()];
    let mut stride = dtype.size_in_bytes() as i64;
    for (slot, dim) in strides.iter_mut().zip(dims).rev() {
        *slot = stride;
        stride *= (*dim).max(1) as i64;
    }
    strides
}

/// Bytes spanned by an array with the given dims and non-negative byte strides.
pub fn strided_extent(dtype: DType, dims: &[usize], strides: &[i64]) -> usize {
    if dims.iter().any(|dim| *dim == 0) {
        return 0;
    }
    let last = dims
        .iter()
        .zip(strides)
        .map(|(dim, stride)| (*dim as i64 - 1) * (*stride).max(0))
        .sum::<i64>();
    last as usize + dtype.size_in_bytes()
}

/// Array owned by the host, with byte strides.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub strides: Vec<i64>,
    pub data: Vec<u8>,
}

impl HostArray {
    pub fn new(dtype: DType, dims: Vec<usize>, strides: Vec<i64>, data: Vec<u8>) -> Self {
        Self {
            dtype,
            dims,
            strides,
            data,
        }
    }

    /// Dense row-major `f32` array.
    pub fn from_f32(dims: &[usize], values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(
            DType::F32,
            dims.to_vec(),
            row_major_strides(DType::F32, dims),
            data,
        )
    }

    pub fn view(&self) -> ArrayView<'_> {
        ArrayView {
            dtype: self.dtype,
            dims: &self.dims,
            strides: &self.strides,
            data: &self.data,
        }
    }
}

/// Read-only view of a device buffer handed to the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrayView<'a> {
    pub dtype: DType,
    pub dims: &'a [usize],
    pub strides: &'a [i64],
    pub data: &'a [u8],
}

impl ArrayView<'_> {
    /// Element `index` read as `f32`, following the view's strides.
    pub fn f32_at(&self, index: &[usize]) -> Option<f32> {
        if self.dtype != DType::F32 || index.len() != self.dims.len() {
            return None;
        }
        let mut offset = 0i64;
        for ((i, dim), stride) in index.iter().zip(self.dims).zip(self.strides) {
            if i >= dim {
                return None;
            }
            offset += *i as i64 * stride;
        }
        let start = usize::try_from(offset).ok()?;
        let bytes = self.data.get(start..start + 4)?;
        Some(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn to_owned_array(&self) -> HostArray {
        HostArray::new(
            self.dtype,
            self.dims.to_vec(),
            self.strides.to_vec(),
            self.data.to_vec(),
        )
    }
}

/// Argument passed to a host callable. Tokens are passed as `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostArg<'a> {
    None,
    Array(ArrayView<'a>),
}

/// Value returned by a host callable.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    None,
    Array(HostArray),
    Tuple(Vec<HostValue>),
    /// Anything the runtime cannot hand back as an array, by its printed form.
    Object(String),
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::None => f.write_str("None"),
            HostValue::Array(array) => {
                let dims = array
                    .dims
                    .iter()
                    .map(usize::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "array(shape=({dims}), dtype={})", array.dtype.as_str())
            }
            HostValue::Tuple(items) => {
                let items = items.iter().map(ToString::to_string).collect::<Vec<_>>();
                if items.len() == 1 {
                    write!(f, "({},)", items[0])
                } else {
                    write!(f, "({})", items.join(", "))
                }
            }
            HostValue::Object(repr) => f.write_str(repr),
        }
    }
}

/// Failure raised by host code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HostError {
    message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A host function invoked by a callback.
pub trait HostCallable: Send + Sync {
    fn call(&self, args: &[HostArg<'_>]) -> Result<HostValue, HostError>;
}

impl<F> HostCallable for F
where
    F: Fn(&[HostArg<'_>]) -> Result<HostValue, HostError> + Send + Sync,
{
    fn call(&self, args: &[HostArg<'_>]) -> Result<HostValue, HostError> {
        self(args)
    }
}
