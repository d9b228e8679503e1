//! Host-backed tensor used for feeds, parameter init, and tests.

use anyhow::{bail, Result};
use rand::Rng;

use super::shape::Shape;

/// Simple host tensor: an owned f32 payload with a logical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor { shape, data })
    }

    /// Returns a zero-initialized tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor {
            shape,
            data: values,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Number of rows in the leading (batch) dimension.
    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    /// Copies out the first `rows` rows, used to shrink calibration batches.
    pub fn first_rows(&self, rows: usize) -> Result<Tensor> {
        if rows > self.rows() {
            bail!(
                "cannot take {} rows from a tensor with {} rows",
                rows,
                self.rows()
            );
        }
        let mut dims = self.shape.dims().to_vec();
        dims[0] = rows;
        let row_elems: usize = dims[1..].iter().product();
        let data = self.data[..rows * row_elems].to_vec();
        Tensor::from_vec(Shape::new(dims), data)
    }
}
