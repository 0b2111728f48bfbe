//! Strided copies into a permuted dense layout, with a small plan cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use thiserror::Error;

/// Plans kept by a cache built with [`TransposePlanCache::default`].
pub const DEFAULT_TRANSPOSE_CACHE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransposeError {
    #[error("element size must be positive")]
    ZeroElementSize,
    #[error("permutation {permutation:?} is not a permutation of {rank} dimensions")]
    InvalidPermutation { permutation: Vec<usize>, rank: usize },
    #[error("expected {rank} input strides, got {got}")]
    StrideRank { rank: usize, got: usize },
    #[error("input buffer of {len} bytes is too small for the strided layout")]
    InputOutOfBounds { len: usize },
    #[error("output buffer of {len} bytes is too small, need {needed}")]
    OutputTooSmall { len: usize, needed: usize },
}

/// Everything that determines a plan; also the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransposeOptions {
    pub elem_size_in_bytes: usize,
    /// Logical dims of the input.
    pub dims: Vec<usize>,
    /// Output dimension `i` walks input dimension `permutation[i]`.
    pub permutation: Vec<usize>,
    /// Byte strides of the input, one per logical dim.
    pub input_strides: Vec<i64>,
}

/// A validated transpose from a strided input to a dense permuted output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransposePlan {
    options: TransposeOptions,
    output_dims: Vec<usize>,
    /// Input byte stride for each output dimension.
    walk_strides: Vec<i64>,
}

impl TransposePlan {
    pub fn new(options: TransposeOptions) -> Result<Self, TransposeError> {
        if options.elem_size_in_bytes == 0 {
            return Err(TransposeError::ZeroElementSize);
        }
        let rank = options.dims.len();
        let mut seen = vec![false; rank];
        let valid = options.permutation.len() == rank
            && options
                .permutation
                .iter()
                .all(|axis| *axis < rank && !std::mem::replace(&mut seen[*axis], true));
        if !valid {
            return Err(TransposeError::InvalidPermutation {
                permutation: options.permutation.clone(),
                rank,
            });
        }
        if options.input_strides.len() != rank {
            return Err(TransposeError::StrideRank {
                rank,
                got: options.input_strides.len(),
            });
        }
        let output_dims = options
            .permutation
            .iter()
            .map(|axis| options.dims[*axis])
            .collect();
        let walk_strides = options
            .permutation
            .iter()
            .map(|axis| options.input_strides[*axis])
            .collect();
        Ok(Self {
            options,
            output_dims,
            walk_strides,
        })
    }

    pub fn options(&self) -> &TransposeOptions {
        &self.options
    }

    pub fn output_dims(&self) -> &[usize] {
        &self.output_dims
    }

    /// Bytes written by [`TransposePlan::execute`].
    pub fn output_len(&self) -> usize {
        self.output_dims.iter().product::<usize>() * self.options.elem_size_in_bytes
    }

    /// Copies `input` into `output` in row-major order over the permuted dims.
    pub fn execute(&self, input: &[u8], output: &mut [u8]) -> Result<(), TransposeError> {
        let needed = self.output_len();
        if output.len() < needed {
            return Err(TransposeError::OutputTooSmall {
                len: output.len(),
                needed,
            });
        }
        if needed == 0 {
            return Ok(());
        }
        let elem = self.options.elem_size_in_bytes;
        let rank = self.output_dims.len();
        let mut index = vec![0usize; rank];
        let mut offset = 0i64;
        for chunk in output[..needed].chunks_exact_mut(elem) {
            let start = usize::try_from(offset)
                .ok()
                .filter(|start| start + elem <= input.len())
                .ok_or(TransposeError::InputOutOfBounds { len: input.len() })?;
            chunk.copy_from_slice(&input[start..start + elem]);

            // Odometer step over the output index, innermost dimension first.
            for axis in (0..rank).rev() {
                index[axis] += 1;
                offset += self.walk_strides[axis];
                if index[axis] < self.output_dims[axis] {
                    break;
                }
                offset -= self.walk_strides[axis] * index[axis] as i64;
                index[axis] = 0;
            }
        }
        Ok(())
    }
}

/// Thread-safe LRU of transpose plans keyed by their options.
pub struct TransposePlanCache {
    plans: Mutex<LruCache<TransposeOptions, Arc<TransposePlan>>>,
}

impl TransposePlanCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            plans: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached plan for `options`, building it on a miss.
    pub fn get_or_create(&self, options: &TransposeOptions) -> Result<Arc<TransposePlan>, TransposeError> {
        let mut plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(plan) = plans.get(options) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(TransposePlan::new(options.clone())?);
        plans.put(options.clone(), Arc::clone(&plan));
        tracing::trace!(dims = ?options.dims, permutation = ?options.permutation, "cached transpose plan");
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.plans.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransposePlanCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_TRANSPOSE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl std::fmt::Debug for TransposePlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransposePlanCache")
            .field("len", &self.len())
            .finish()
    }
}
