//! Tensor Storage for Layer Inputs and Outputs
//!
//! Every layer consumes and produces a [`Tensor`]: a flat `Vec<f64>` plus a
//! shape and row-major strides. Two shapes occur in practice:
//!
//! ```text
//! [n]          feature vector (dense, dropout, batch norm, recurrent steps)
//! [h, w, c]    image volume   (conv2d, max pooling, flatten input)
//! ```
//!
//! ## Memory Layout
//!
//! A volume of shape `[h, w, c]` stores element `(y, x, ch)` at
//! `y * w * c + x * c + ch`, i.e. strides `[w*c, c, 1]`. Flattening a volume
//! is therefore a no-op on the data and only changes the shape.
//!
//! ## Example
//!
//! ```rust
//! use synapse::Tensor;
//!
//! let volume = Tensor::zeros(vec![2, 2, 3]);
//! assert_eq!(volume.len(), 12);
//! assert_eq!(volume.strides, vec![6, 3, 1]);
//!
//! let flat = volume.reshape(&[12]).unwrap();
//! assert_eq!(flat.shape, vec![12]);
//! ```

use crate::error::{Error, Result};

/// A multi-dimensional array of `f64` values in row-major order
///
/// # Fields
///
/// - `data`: Flat storage of all elements
/// - `shape`: Dimensions (`[n]` or `[h, w, c]`)
/// - `strides`: Step sizes per dimension, derived from `shape`
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] when the product of `shape` differs
    /// from `data.len()`.
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::shape(&shape, &[data.len()]));
        }
        let strides = Self::compute_strides(&shape);
        Ok(Self {
            data,
            shape,
            strides,
        })
    }

    /// Create a one-dimensional tensor
    pub fn from_vec(data: Vec<f64>) -> Self {
        let shape = vec![data.len()];
        Self {
            data,
            strides: vec![1],
            shape,
        }
    }

    /// Create a `[height, width, channels]` volume from nested rows
    ///
    /// `rows[y][x][c]` becomes element `(y, x, c)`. Ragged input is rejected.
    pub fn from_volume(rows: &[Vec<Vec<f64>>]) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        let channels = rows
            .first()
            .and_then(|row| row.first())
            .map_or(0, Vec::len);

        let mut data = Vec::with_capacity(height * width * channels);
        for row in rows {
            if row.len() != width {
                return Err(Error::shape(&[height, width, channels], &[height, row.len()]));
            }
            for pixel in row {
                if pixel.len() != channels {
                    return Err(Error::shape(
                        &[height, width, channels],
                        &[height, width, pixel.len()],
                    ));
                }
                data.extend_from_slice(pixel);
            }
        }
        Self::new(data, vec![height, width, channels])
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        let strides = Self::compute_strides(&shape);
        Self {
            data: vec![0.0; size],
            shape,
            strides,
        }
    }

    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Flat offset of element `(y, x, c)` in a rank-3 tensor
    #[inline]
    pub fn offset3(&self, y: usize, x: usize, c: usize) -> usize {
        y * self.strides[0] + x * self.strides[1] + c
    }

    #[inline]
    pub fn get3(&self, y: usize, x: usize, c: usize) -> f64 {
        self.data[self.offset3(y, x, c)]
    }

    /// Fail unless this tensor has exactly `expected` shape
    pub fn ensure_shape(&self, expected: &[usize]) -> Result<()> {
        if self.shape == expected {
            Ok(())
        } else {
            Err(Error::shape(expected, &self.shape))
        }
    }

    /// Reshape to a new shape with the same element count
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Tensor> {
        let new_size: usize = new_shape.iter().product();
        if new_size != self.data.len() {
            return Err(Error::shape(new_shape, &self.shape));
        }
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Element-wise `self - other`
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        other.ensure_shape(&self.shape)?;
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a - b)
            .collect();
        Tensor::new(data, self.shape.clone())
    }

    /// Mean of all elements (0 for an empty tensor)
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f64>() / self.data.len() as f64
    }

    /// Population variance of all elements around `mean`
    pub fn variance(&self, mean: f64) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data
            .iter()
            .map(|&x| {
                let diff = x - mean;
                diff * diff
            })
            .sum::<f64>()
            / self.data.len() as f64
    }

    /// Index of the largest element; ties resolve to the first occurrence
    pub fn argmax(&self) -> Option<usize> {
        argmax(&self.data)
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }
}

impl From<Vec<f64>> for Tensor {
    fn from(data: Vec<f64>) -> Self {
        Tensor::from_vec(data)
    }
}

impl From<&[f64]> for Tensor {
    fn from(data: &[f64]) -> Self {
        Tensor::from_vec(data.to_vec())
    }
}

/// Index of the largest value in `values`, first occurrence on ties
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
