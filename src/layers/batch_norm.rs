//! Batch Normalization
//!
//! Normalizes each incoming vector to zero mean and unit variance, then
//! applies a learnable per-unit scale (gamma) and shift (beta).
//!
//! ## Forward Pass (training)
//!
//! ```text
//! 1. mean = sum(x) / N
//! 2. var  = sum((x - mean)²) / N
//! 3. x̂    = (x - mean) / √(var + ε)
//! 4. y    = γ ⊙ x̂ + β
//! 5. running_mean = 0.9 · running_mean + 0.1 · mean
//!    running_var  = 0.9 · running_var  + 0.1 · var
//! ```
//!
//! In inference mode the running statistics replace `mean` and `var`.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ += grad_y ⊙ x̂
//! grad_β += grad_y
//! grad_x  = grad_y ⊙ γ
//! ```
//!
//! The input gradient passes straight through the scale and ignores the
//! dependency of `mean`/`var` on `x`. In inference mode the gradient is
//! returned unchanged.

use crate::error::{Error, Result};
use crate::layers::{
    check_output_shape, missing_forward, not_initialized, Layer, LayerKind, ParamRef,
};
use crate::tensor::Tensor;

const EPSILON: f64 = 1e-8;
const MOMENTUM: f64 = 0.9;

/// Per-vector normalization layer
#[derive(Debug)]
pub struct BatchNormalization {
    pub gamma: Vec<f64>,
    pub beta: Vec<f64>,
    pub running_mean: Vec<f64>,
    pub running_var: Vec<f64>,
    gamma_grads: Vec<f64>,
    beta_grads: Vec<f64>,
    training: bool,
    shape: Vec<usize>,
    cache: Option<BatchNormCache>,
}

#[derive(Debug)]
struct BatchNormCache {
    x_hat: Vec<f64>,
    training: bool,
}

impl BatchNormalization {
    pub fn new() -> Self {
        Self {
            gamma: Vec::new(),
            beta: Vec::new(),
            running_mean: Vec::new(),
            running_var: Vec::new(),
            gamma_grads: Vec::new(),
            beta_grads: Vec::new(),
            training: true,
            shape: Vec::new(),
            cache: None,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Default for BatchNormalization {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for BatchNormalization {
    fn kind(&self) -> LayerKind {
        LayerKind::BatchNormalization
    }

    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        match input_shape {
            [n] if *n > 0 => Ok(vec![*n]),
            _ => Err(Error::Config(format!(
                "batch normalization expects a vector input, got shape {input_shape:?}"
            ))),
        }
    }

    /// gamma = 1, beta = 0, running mean = 0, running variance = 1
    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()> {
        check_output_shape(self, input_shape, output_shape)?;
        let n = input_shape[0];
        self.gamma = vec![1.0; n];
        self.beta = vec![0.0; n];
        self.running_mean = vec![0.0; n];
        self.running_var = vec![1.0; n];
        self.gamma_grads = vec![0.0; n];
        self.beta_grads = vec![0.0; n];
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

        let n = input.len();
        let mut x_hat = vec![0.0; n];
        let mut output = vec![0.0; n];

        if self.training {
            let mean = input.mean();
            let var = input.variance(mean);
            for i in 0..n {
                self.running_mean[i] = MOMENTUM * self.running_mean[i] + (1.0 - MOMENTUM) * mean;
                self.running_var[i] = MOMENTUM * self.running_var[i] + (1.0 - MOMENTUM) * var;
            }
            let std = (var + EPSILON).sqrt();
            for i in 0..n {
                x_hat[i] = (input.data[i] - mean) / std;
                output[i] = self.gamma[i] * x_hat[i] + self.beta[i];
            }
        } else {
            for i in 0..n {
                x_hat[i] = (input.data[i] - self.running_mean[i])
                    / (self.running_var[i] + EPSILON).sqrt();
                output[i] = self.gamma[i] * x_hat[i] + self.beta[i];
            }
        }

        self.cache = Some(BatchNormCache {
            x_hat,
            training: self.training,
        });
        Tensor::new(output, self.shape.clone())
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        input.ensure_shape(&self.shape)?;
        grad_output.ensure_shape(&self.shape)?;
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| missing_forward(LayerKind::BatchNormalization))?;

        if !cache.training {
            return Ok(grad_output.clone());
        }

        let mut grad_input = vec![0.0; grad_output.len()];
        for (i, &g) in grad_output.data.iter().enumerate() {
            self.gamma_grads[i] += g * cache.x_hat[i];
            self.beta_grads[i] += g;
            grad_input[i] = g * self.gamma[i];
        }
        Tensor::new(grad_input, self.shape.clone())
    }

    fn parameters(&mut self) -> Vec<ParamRef<'_>> {
        vec![
            ParamRef {
                values: &mut self.gamma,
                grads: &mut self.gamma_grads,
            },
            ParamRef {
                values: &mut self.beta,
                grads: &mut self.beta_grads,
            },
        ]
    }

    fn parameter_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(n: usize) -> BatchNormalization {
        let mut bn = BatchNormalization::new();
        bn.initialize(&[n], &[n]).unwrap();
        bn
    }

    #[test]
    fn test_training_output_is_normalized() {
        let mut bn = layer(4);
        let out = bn.forward(&Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        let mean = out.mean();
        let var = out.variance(mean);
        assert!(mean.abs() < 1e-9);
        assert!((var - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_running_statistics_update() {
        let mut bn = layer(2);
        bn.forward(&Tensor::from_vec(vec![3.0, 5.0])).unwrap();
        // mean 4, var 1
        assert!((bn.running_mean[0] - 0.4).abs() < 1e-12);
        assert!((bn.running_var[1] - (0.9 + 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_gradients_applied_in_update_weights() {
        let mut bn = layer(2);
        let input = Tensor::from_vec(vec![0.0, 2.0]);
        bn.forward(&input).unwrap();
        let grad = bn.backward(&input, &Tensor::from_vec(vec![1.0, 1.0])).unwrap();
        assert_eq!(grad.data, vec![1.0, 1.0]);

        // gamma/beta unchanged until update_weights runs
        assert_eq!(bn.beta, vec![0.0, 0.0]);
        bn.update_weights(0.1);
        assert!((bn.beta[0] - 0.1).abs() < 1e-12);
        // x̂ = [-1, 1]
        assert!((bn.gamma[0] - 0.9).abs() < 1e-6);
        assert!((bn.gamma[1] - 1.1).abs() < 1e-6);
    }

    #[test]
    fn test_inference_uses_running_stats() {
        let mut bn = layer(2);
        bn.set_training(false);
        let out = bn.forward(&Tensor::from_vec(vec![1.0, -1.0])).unwrap();
        assert!((out.data[0] - 1.0).abs() < 1e-6);
        let grad = Tensor::from_vec(vec![0.3, 0.7]);
        assert_eq!(bn.backward(&Tensor::from_vec(vec![1.0, -1.0]), &grad).unwrap(), grad);
    }
}
