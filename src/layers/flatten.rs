//! Flatten Layer
//!
//! Reshapes a `[h, w, c]` volume into a `[h·w·c]` vector. Tensors are stored
//! row-major, so both directions only swap the shape.

use crate::error::{Error, Result};
use crate::layers::{check_output_shape, missing_forward, not_initialized, Layer, LayerKind};
use crate::tensor::Tensor;

#[derive(Debug, Default)]
pub struct Flatten {
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    seen_forward: bool,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Flatten {
    fn kind(&self) -> LayerKind {
        LayerKind::Flatten
    }

    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        match input_shape {
            [h, w, c] if h * w * c > 0 => Ok(vec![h * w * c]),
            _ => Err(Error::Config(format!(
                "flatten expects a non-empty [height, width, channels] input, got {input_shape:?}"
            ))),
        }
    }

    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()> {
        check_output_shape(self, input_shape, output_shape)?;
        self.input_shape = input_shape.to_vec();
        self.output_shape = output_shape.to_vec();
        self.seen_forward = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        !self.input_shape.is_empty()
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if !self.is_initialized() {
            return Err(not_initialized(self.kind()));
        }
        input.ensure_shape(&self.input_shape)?;
        self.seen_forward = true;
        input.reshape(&self.output_shape)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        input.ensure_shape(&self.input_shape)?;
        grad_output.ensure_shape(&self.output_shape)?;
        if !self.seen_forward {
            return Err(missing_forward(LayerKind::Flatten));
        }
        grad_output.reshape(&self.input_shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::sample_tensor;

    #[test]
    fn test_round_trip() {
        let mut flatten = Flatten::new();
        flatten.initialize(&[2, 3, 2], &[12]).unwrap();
        let input = sample_tensor(vec![2, 3, 2], 4);

        let flat = flatten.forward(&input).unwrap();
        assert_eq!(flat.shape, vec![12]);
        assert_eq!(flat.data, input.data);

        let back = flatten.backward(&input, &flat).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_row_major_order() {
        let mut flatten = Flatten::new();
        flatten.initialize(&[1, 2, 2], &[4]).unwrap();
        let input = Tensor::from_volume(&[vec![vec![1.0, 2.0], vec![3.0, 4.0]]]).unwrap();
        assert_eq!(flatten.forward(&input).unwrap().data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rejects_vector_input() {
        assert!(Flatten::new().output_shape_for(&[10]).is_err());
    }
}
