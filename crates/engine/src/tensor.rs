//! Dense row-major tensors
//!
//! Batch inputs cross the executor boundary as `Tensor<u32>` and logits come
//! back as `Tensor<f32>`. Only the handful of shape operations the engine needs
//! are provided: building from padded rows, narrowing and selecting along a
//! dimension.

use llmperf_common::{LlmPerfError, Result};
use std::fmt;

/// Tensor shape
pub type Shape = Vec<usize>;

/// Tensor strides
pub type Strides = Vec<usize>;

/// Compute row-major strides from shape
fn compute_strides(shape: &[usize]) -> Strides {
    let mut strides = Vec::with_capacity(shape.len());
    let mut stride = 1;

    for &dim in shape.iter().rev() {
        strides.push(stride);
        stride *= dim;
    }

    strides.reverse();
    strides
}

/// Owned tensor with heap-allocated data
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    data: Vec<T>,
    shape: Shape,
}

impl<T> Tensor<T>
where
    T: Copy,
{
    /// Create a new tensor from data and shape
    pub fn new(data: Vec<T>, shape: Shape) -> Result<Self> {
        let size: usize = shape.iter().product();
        if size != data.len() {
            return Err(LlmPerfError::tensor(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                size,
                data.len()
            )));
        }
        Ok(Self { data, shape })
    }

    /// Stack equal-length rows into a `[rows, cols]` tensor
    pub fn from_rows(rows: &[Vec<T>]) -> Result<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);

        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(LlmPerfError::tensor(format!(
                    "row {} has length {}, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend_from_slice(row);
        }

        Ok(Self {
            data,
            shape: vec![rows.len(), cols],
        })
    }

    /// Get the total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Get a value at the given indices
    pub fn get(&self, indices: &[usize]) -> Option<T> {
        if indices.len() != self.shape.len()
            || indices.iter().zip(&self.shape).any(|(&i, &d)| i >= d)
        {
            return None;
        }
        let idx: usize = indices
            .iter()
            .zip(compute_strides(&self.shape))
            .map(|(&i, s)| i * s)
            .sum();
        self.data.get(idx).copied()
    }

    /// Slice of the last dimension at the given leading indices
    pub fn last_dim(&self, leading: &[usize]) -> Option<&[T]> {
        if leading.len() + 1 != self.shape.len() {
            return None;
        }
        let width = *self.shape.last()?;
        let strides = compute_strides(&self.shape);
        let mut start = 0;
        for (i, (&idx, &dim)) in leading.iter().zip(&self.shape).enumerate() {
            if idx >= dim {
                return None;
            }
            start += idx * strides[i];
        }
        self.data.get(start..start + width)
    }

    /// Keep `len` entries of dimension `dim` starting at `start`
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let size = *self
            .shape
            .get(dim)
            .ok_or_else(|| LlmPerfError::tensor(format!("narrow: no dimension {} in {:?}", dim, self.shape)))?;
        if start + len > size {
            return Err(LlmPerfError::tensor(format!(
                "narrow: range {}..{} out of bounds for dimension {} of size {}",
                start,
                start + len,
                dim,
                size
            )));
        }

        // outer blocks × [size, inner] → outer blocks × [len, inner]
        let outer: usize = self.shape[..dim].iter().product();
        let inner: usize = self.shape[dim + 1..].iter().product();
        let mut data = Vec::with_capacity(outer * len * inner);
        for block in 0..outer {
            let base = block * size * inner;
            data.extend_from_slice(&self.data[base + start * inner..base + (start + len) * inner]);
        }

        let mut shape = self.shape.clone();
        shape[dim] = len;
        Ok(Self { data, shape })
    }

    /// Take index `index` of dimension `dim`, removing that dimension
    pub fn select(&self, dim: usize, index: usize) -> Result<Self> {
        let mut narrowed = self.narrow(dim, index, 1)?;
        narrowed.shape.remove(dim);
        Ok(narrowed)
    }
}

impl<T> fmt::Display for Tensor<T>
where
    T: fmt::Display + Copy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, size={})", self.shape, self.len())
    }
}
