use crate::error::{CoreError, CoreResult};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type of a descriptor matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DescriptorType {
    /// 32-bit float descriptors (SIFT, SURF, KAZE, SuperPoint)
    F32,
    /// 8-bit binary descriptors (ORB, BRISK, AKAZE)
    U8,
}

impl fmt::Display for DescriptorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorType::F32 => write!(f, "CV_32F"),
            DescriptorType::U8 => write!(f, "CV_8U"),
        }
    }
}

/// Dense row-major descriptor matrix, one row per keypoint
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Descriptors<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy + Default> Descriptors<T> {
    /// Empty matrix with a fixed row length
    pub fn new(cols: usize) -> Self {
        Self { rows: 0, cols, data: Vec::new() }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![T::default(); rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> CoreResult<Self> {
        if data.len() != rows * cols {
            return Err(CoreError::DescriptorShape {
                rows,
                cols,
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Build from equally sized rows
    pub fn from_rows<R: AsRef<[T]>>(cols: usize, rows: &[R]) -> CoreResult<Self> {
        let mut out = Self::new(cols);
        out.data.reserve(rows.len() * cols);
        for row in rows {
            out.push_row(row.as_ref())?;
        }
        Ok(out)
    }

    pub fn push_row(&mut self, row: &[T]) -> CoreResult<()> {
        if row.len() != self.cols {
            return Err(CoreError::RowLength { expected: self.cols, actual: row.len() });
        }
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [T] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[T]> {
        // chunks_exact panics on zero, an empty-column matrix has no rows anyway
        self.data.chunks_exact(self.cols.max(1)).take(self.rows)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Copy the given rows into a new matrix, in the given order
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            rows: indices.len(),
            cols: self.cols,
            data,
        }
    }

    pub fn map<U, F: Fn(T) -> U>(&self, f: F) -> Descriptors<U> {
        Descriptors {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }
}

/// Descriptor matrix in the canonical element type of its detector family
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DescriptorMatrix {
    Float(Descriptors<f32>),
    Binary(Descriptors<u8>),
}

impl DescriptorMatrix {
    pub fn empty(descriptor_type: DescriptorType, cols: usize) -> Self {
        match descriptor_type {
            DescriptorType::F32 => DescriptorMatrix::Float(Descriptors::new(cols)),
            DescriptorType::U8 => DescriptorMatrix::Binary(Descriptors::new(cols)),
        }
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        match self {
            DescriptorMatrix::Float(_) => DescriptorType::F32,
            DescriptorMatrix::Binary(_) => DescriptorType::U8,
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            DescriptorMatrix::Float(d) => d.rows(),
            DescriptorMatrix::Binary(d) => d.rows(),
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            DescriptorMatrix::Float(d) => d.cols(),
            DescriptorMatrix::Binary(d) => d.cols(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn as_float(&self) -> Option<&Descriptors<f32>> {
        match self {
            DescriptorMatrix::Float(d) => Some(d),
            DescriptorMatrix::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Descriptors<u8>> {
        match self {
            DescriptorMatrix::Binary(d) => Some(d),
            DescriptorMatrix::Float(_) => None,
        }
    }

    /// Promote to float, copying when the matrix is binary
    pub fn to_f32(&self) -> Descriptors<f32> {
        match self {
            DescriptorMatrix::Float(d) => d.clone(),
            DescriptorMatrix::Binary(d) => d.map(f32::from),
        }
    }

    /// Convert to bytes, rounding and saturating float values
    pub fn to_u8(&self) -> Descriptors<u8> {
        match self {
            DescriptorMatrix::Binary(d) => d.clone(),
            DescriptorMatrix::Float(d) => d.map(|v| v.round().clamp(0.0, 255.0) as u8),
        }
    }

    /// Coerce in place to the requested element type
    pub fn coerce(self, target: DescriptorType) -> Self {
        match (self, target) {
            (DescriptorMatrix::Binary(d), DescriptorType::F32) => DescriptorMatrix::Float(d.map(f32::from)),
            (m @ DescriptorMatrix::Float(_), DescriptorType::U8) => DescriptorMatrix::Binary(m.to_u8()),
            (m, _) => m,
        }
    }
}

impl From<Descriptors<f32>> for DescriptorMatrix {
    fn from(d: Descriptors<f32>) -> Self {
        DescriptorMatrix::Float(d)
    }
}

impl From<Descriptors<u8>> for DescriptorMatrix {
    fn from(d: Descriptors<u8>) -> Self {
        DescriptorMatrix::Binary(d)
    }
}
