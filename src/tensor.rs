//! Dense row-major matrices and the JSON tensor bundle format.

use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};

/// A dense, row-major 2-D array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix<T = f32> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy + Default> Matrix<T> {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![T::default(); rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(QuantError::ShapeMismatch {
                what: "matrix data",
                expected: vec![rows * cols],
                got: vec![data.len()],
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Check that `data` holds exactly `rows * cols` values.
    pub fn validate(&self) -> Result<()> {
        let expected = self.rows.checked_mul(self.cols);
        if expected != Some(self.data.len()) {
            return Err(QuantError::ShapeMismatch {
                what: "matrix data",
                expected: vec![self.rows, self.cols],
                got: vec![self.data.len()],
            });
        }
        Ok(())
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> T {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: T) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[T] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [T] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn transpose(&self) -> Self {
        Self::from_fn(self.cols, self.rows, |r, c| self.get(c, r))
    }

    /// Reinterpret the row-major data with a new shape of the same size.
    pub fn reshape(self, rows: usize, cols: usize) -> Result<Self> {
        if rows * cols != self.data.len() {
            return Err(QuantError::ShapeMismatch {
                what: "reshape",
                expected: vec![self.rows, self.cols],
                got: vec![rows, cols],
            });
        }
        Ok(Self {
            rows,
            cols,
            data: self.data,
        })
    }

    /// Split columns at `at`: `[0, at)` on the left, `[at, cols)` on the right.
    pub fn split_cols(&self, at: usize) -> (Self, Self) {
        let at = at.min(self.cols);
        let left = Self::from_fn(self.rows, at, |r, c| self.get(r, c));
        let right = Self::from_fn(self.rows, self.cols - at, |r, c| self.get(r, at + c));
        (left, right)
    }

    /// Concatenate `other` to the right of `self`.
    pub fn hcat(&self, other: &Self) -> Result<Self> {
        if self.rows != other.rows {
            return Err(QuantError::ShapeMismatch {
                what: "column concatenation",
                expected: vec![self.rows],
                got: vec![other.rows],
            });
        }
        let cols = self.cols + other.cols;
        let mut data = Vec::with_capacity(self.rows * cols);
        for r in 0..self.rows {
            data.extend_from_slice(self.row(r));
            data.extend_from_slice(other.row(r));
        }
        Ok(Self {
            rows: self.rows,
            cols,
            data,
        })
    }

    pub fn map<U: Copy + Default>(&self, f: impl Fn(T) -> U) -> Matrix<U> {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }
}

/// A single float32 tensor in a simple JSON-friendly format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// A bundle of named tensors representing a model checkpoint fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloatBundle {
    pub tensors: Vec<FloatTensor>,
}

pub(crate) fn expected_len(shape: &[usize]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &d| {
        acc.checked_mul(d).ok_or_else(|| QuantError::ShapeMismatch {
            what: "tensor size overflow",
            expected: vec![usize::MAX],
            got: shape.to_vec(),
        })
    })
}

impl FloatTensor {
    pub fn from_matrix(name: impl Into<String>, m: &Matrix<f32>) -> Self {
        Self {
            name: name.into(),
            shape: m.shape().to_vec(),
            data: m.as_slice().to_vec(),
        }
    }

    /// Check that `data` holds exactly as many values as `shape` describes.
    pub fn validate(&self) -> Result<()> {
        let expected = expected_len(&self.shape)?;
        if expected != self.data.len() {
            return Err(QuantError::ShapeMismatch {
                what: "tensor data",
                expected: vec![expected],
                got: vec![self.data.len()],
            });
        }
        Ok(())
    }

    /// View a 2-D tensor as a matrix. Returns `None` for other ranks.
    pub fn to_matrix(&self) -> Result<Option<Matrix<f32>>> {
        self.validate()?;
        match self.shape.as_slice() {
            &[rows, cols] => Ok(Some(Matrix::from_vec(rows, cols, self.data.clone())?)),
            _ => Ok(None),
        }
    }
}
