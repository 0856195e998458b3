//! Dropout Layer
//!
//! Dropout is a regularization technique that randomly zeros out activations
//! during training to prevent overfitting. During inference, it passes values
//! through unchanged.
//!
//! Survivors are scaled by `1/(1-p)` (inverted dropout) so the expected
//! activation is the same in both modes.

use crate::error::{Error, Result};
use crate::layers::{check_output_shape, missing_forward, not_initialized, Layer, LayerKind};
use crate::tensor::Tensor;

/// Dropout layer with rate `p` in `[0, 1)`
#[derive(Debug)]
pub struct Dropout {
    rate: f64,
    training: bool,
    shape: Vec<usize>,
    cache: Option<DropoutCache>,
}

/// Mask from the last forward pass
#[derive(Debug)]
struct DropoutCache {
    /// `true` = kept. `None` when dropout was disabled for that pass.
    mask: Option<Vec<bool>>,
    scale: f64,
}

impl Dropout {
    /// Create a new dropout layer
    ///
    /// # Arguments
    ///
    /// * `rate` - Drop probability, `0.0 <= rate < 1.0`
    pub fn new(rate: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::Config(format!(
                "dropout rate must be in [0, 1), got {rate}"
            )));
        }
        Ok(Self {
            rate,
            training: true,
            shape: Vec::new(),
            cache: None,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Layer for Dropout {
    fn kind(&self) -> LayerKind {
        LayerKind::Dropout
    }

    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        if input_shape.is_empty() {
            return Err(Error::Config("dropout needs a non-empty input shape".into()));
        }
        Ok(input_shape.to_vec())
    }

    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()> {
        check_output_shape(self, input_shape, output_shape)?;
        self.shape = input_shape.to_vec();
        self.cache = None;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        !self.shape.is_empty()
    }

    fn input_shape(&self) -> &[usize] {
        &self.shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if !self.is_initialized() {
            return Err(not_initialized(self.kind()));
        }
        input.ensure_shape(&self.shape)?;

        if !self.training || self.rate == 0.0 {
            self.cache = Some(DropoutCache {
                mask: None,
                scale: 1.0,
            });
            return Ok(input.clone());
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Vec::with_capacity(input.len());
        let mut output = Tensor::zeros(input.shape.clone());

        for (i, &x) in input.data.iter().enumerate() {
            let keep = rand::random::<f64>() > self.rate;
            mask.push(keep);
            if keep {
                output.data[i] = x * scale;
            }
        }

        self.cache = Some(DropoutCache {
            mask: Some(mask),
            scale,
        });
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        input.ensure_shape(&self.shape)?;
        grad_output.ensure_shape(&self.shape)?;
        let cache = self.cache.as_ref().ok_or_else(|| missing_forward(LayerKind::Dropout))?;

        match &cache.mask {
            Some(mask) => {
                let mut grad_input = Tensor::zeros(grad_output.shape.clone());
                for (i, &keep) in mask.iter().enumerate() {
                    if keep {
                        grad_input.data[i] = grad_output.data[i] * cache.scale;
                    }
                }
                Ok(grad_input)
            }
            None => Ok(grad_output.clone()),
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(rate: f64, n: usize) -> Dropout {
        let mut d = Dropout::new(rate).unwrap();
        d.initialize(&[n], &[n]).unwrap();
        d
    }

    #[test]
    fn test_rate_bounds() {
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(0.0).is_ok());
        assert!(Dropout::new(0.99).is_ok());
    }

    #[test]
    fn test_survivors_scaled_and_gradient_masked() {
        let mut d = layer(0.5, 200);
        let input = Tensor::from_vec(vec![1.0; 200]);
        let out = d.forward(&input).unwrap();
        assert!(out.data.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-12));

        let grad = d.backward(&input, &Tensor::from_vec(vec![1.0; 200])).unwrap();
        for (o, g) in out.data.iter().zip(&grad.data) {
            assert_eq!(*o == 0.0, *g == 0.0);
        }

        let dropped = out.data.iter().filter(|&&v| v == 0.0).count();
        assert!(dropped > 40 && dropped < 160, "dropped {dropped} of 200");
    }

    #[test]
    fn test_inference_is_identity() {
        let mut d = layer(0.9, 4);
        d.set_training(false);
        let input = Tensor::from_vec(vec![1.0, -2.0, 3.0, 4.0]);
        assert_eq!(d.forward(&input).unwrap(), input);
        let grad = Tensor::from_vec(vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(d.backward(&input, &grad).unwrap(), grad);
    }
}
