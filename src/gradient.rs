//! Gradient values exchanged between the backward engine, the reducer and
//! the communication backend.
//!
//! A gradient is either a dense buffer or a row-selected sparse matrix.
//! Both store their elements as little-endian bytes tagged with a
//! [`DataType`], which is also how bucket contents travel to the backend.

use std::collections::HashMap;

use crate::error::{GradSyncError, Result};
use crate::types::{DataType, GradKind, ParamId};

/// A gradient in one of the two supported representations.
#[derive(Debug, Clone, PartialEq)]
pub enum Gradient {
    Dense(DenseGrad),
    Sparse(SparseGrad),
}

impl Gradient {
    pub fn dtype(&self) -> DataType {
        match self {
            Gradient::Dense(d) => d.dtype,
            Gradient::Sparse(s) => s.dtype,
        }
    }

    pub fn kind(&self) -> GradKind {
        match self {
            Gradient::Dense(_) => GradKind::Dense,
            Gradient::Sparse(s) => GradKind::Sparse {
                height: s.height,
                row_width: s.row_width,
            },
        }
    }

    /// Bytes of element data carried by this gradient.
    pub fn byte_len(&self) -> usize {
        match self {
            Gradient::Dense(d) => d.data.len(),
            Gradient::Sparse(s) => s.values.len(),
        }
    }

    pub fn as_dense(&self) -> Option<&DenseGrad> {
        match self {
            Gradient::Dense(d) => Some(d),
            Gradient::Sparse(_) => None,
        }
    }

    pub fn as_sparse(&self) -> Option<&SparseGrad> {
        match self {
            Gradient::Sparse(s) => Some(s),
            Gradient::Dense(_) => None,
        }
    }
}

impl From<DenseGrad> for Gradient {
    fn from(d: DenseGrad) -> Self {
        Gradient::Dense(d)
    }
}

impl From<SparseGrad> for Gradient {
    fn from(s: SparseGrad) -> Self {
        Gradient::Sparse(s)
    }
}

/// Contiguous dense gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseGrad {
    dtype: DataType,
    data: Vec<u8>,
}

impl DenseGrad {
    /// Wrap raw little-endian bytes. The length must be a whole number of elements.
    pub fn new(dtype: DataType, data: Vec<u8>) -> Result<Self> {
        if data.len() % dtype.size_in_bytes() != 0 {
            return Err(GradSyncError::BufferSizeMismatch {
                expected: data.len().next_multiple_of(dtype.size_in_bytes()),
                actual: data.len(),
            });
        }
        Ok(Self { dtype, data })
    }

    /// Zero-filled gradient of `len` bytes.
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        Self {
            dtype,
            data: vec![0u8; len],
        }
    }

    pub fn from_f32(values: &[f32]) -> Self {
        Self {
            dtype: DataType::F32,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn from_f64(values: &[f64]) -> Self {
        Self {
            dtype: DataType::F64,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.data.len() / self.dtype.size_in_bytes()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Decode as `f32` values.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self.dtype {
            DataType::F32 => Ok(self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()),
            DataType::F16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()),
            DataType::BF16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect()),
            dtype => Err(GradSyncError::UnsupportedDType {
                dtype,
                op: "to_f32_vec",
            }),
        }
    }

    /// Decode as `f64` values.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        if self.dtype != DataType::F64 {
            return Err(GradSyncError::UnsupportedDType {
                dtype: self.dtype,
                op: "to_f64_vec",
            });
        }
        Ok(self
            .data
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                f64::from_le_bytes(raw)
            })
            .collect())
    }
}

/// Row-selected sparse gradient of a `height x row_width` matrix.
///
/// `rows` may repeat; repeated rows are additive. `values` holds
/// `rows.len() * row_width` elements in row order.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseGrad {
    dtype: DataType,
    height: usize,
    row_width: usize,
    rows: Vec<u64>,
    values: Vec<u8>,
}

impl SparseGrad {
    pub fn new(
        dtype: DataType,
        height: usize,
        row_width: usize,
        rows: Vec<u64>,
        values: Vec<u8>,
    ) -> Result<Self> {
        let expected = rows.len() * row_width * dtype.size_in_bytes();
        if values.len() != expected {
            return Err(GradSyncError::BufferSizeMismatch {
                expected,
                actual: values.len(),
            });
        }
        if let Some(&row) = rows.iter().find(|&&r| r as usize >= height) {
            return Err(GradSyncError::InvalidGradient(format!(
                "sparse row {row} out of range for height {height}"
            )));
        }
        Ok(Self {
            dtype,
            height,
            row_width,
            rows,
            values,
        })
    }

    /// Sparse gradient that selects no rows.
    pub fn empty(dtype: DataType, height: usize, row_width: usize) -> Self {
        Self {
            dtype,
            height,
            row_width,
            rows: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_f32(
        height: usize,
        row_width: usize,
        rows: Vec<u64>,
        values: &[f32],
    ) -> Result<Self> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DataType::F32, height, row_width, rows, bytes)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row_width(&self) -> usize {
        self.row_width
    }

    pub fn rows(&self) -> &[u64] {
        &self.rows
    }

    pub fn values(&self) -> &[u8] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [u8] {
        &mut self.values
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether `other` describes the same matrix shape and element type.
    pub fn same_shape(&self, other: &SparseGrad) -> bool {
        self.dtype == other.dtype
            && self.height == other.height
            && self.row_width == other.row_width
    }

    /// Append all rows of `other` (same shape) after this gradient's rows.
    pub fn extend_from(&mut self, other: &SparseGrad) -> Result<()> {
        if !self.same_shape(other) {
            return Err(GradSyncError::InvalidGradient(format!(
                "cannot merge sparse {}x{} {} with {}x{} {}",
                self.height, self.row_width, self.dtype, other.height, other.row_width, other.dtype
            )));
        }
        self.rows.extend_from_slice(&other.rows);
        self.values.extend_from_slice(&other.values);
        Ok(())
    }

    /// Drop all rows while keeping the allocations.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.values.clear();
    }

    /// Materialize as a dense `f32` matrix, summing repeated rows.
    pub fn to_dense_f32(&self) -> Result<Vec<f32>> {
        if self.dtype != DataType::F32 {
            return Err(GradSyncError::UnsupportedDType {
                dtype: self.dtype,
                op: "to_dense_f32",
            });
        }
        let mut out = vec![0.0f32; self.height * self.row_width];
        for (i, &row) in self.rows.iter().enumerate() {
            for col in 0..self.row_width {
                let off = (i * self.row_width + col) * 4;
                let v = f32::from_le_bytes([
                    self.values[off],
                    self.values[off + 1],
                    self.values[off + 2],
                    self.values[off + 3],
                ]);
                out[row as usize * self.row_width + col] += v;
            }
        }
        Ok(out)
    }
}

/// Per-parameter gradient storage the reducer scatters reduced results into.
#[derive(Debug, Clone, Default)]
pub struct GradStore {
    grads: HashMap<ParamId, Gradient>,
}

impl GradStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `grad`, returning the previous value for `id` if any.
    pub fn insert(&mut self, id: ParamId, grad: Gradient) -> Option<Gradient> {
        self.grads.insert(id, grad)
    }

    pub fn get(&self, id: ParamId) -> Option<&Gradient> {
        self.grads.get(&id)
    }

    pub fn remove(&mut self, id: ParamId) -> Option<Gradient> {
        self.grads.remove(&id)
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.grads.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamId, &Gradient)> {
        self.grads.iter()
    }

    pub fn clear(&mut self) {
        self.grads.clear();
    }

    /// Dense `f32` view of a stored gradient, for tests and optimizers.
    pub fn dense_f32(&self, id: ParamId) -> Option<Vec<f32>> {
        match self.grads.get(&id)? {
            Gradient::Dense(d) => d.to_f32_vec().ok(),
            Gradient::Sparse(s) => s.to_dense_f32().ok(),
        }
    }
}
