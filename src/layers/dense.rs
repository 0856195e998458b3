//! Dense Layer (Fully Connected)
//!
//! Performs an affine transformation followed by an activation:
//! `y = act(W·x + b)`
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [in]
//! Weight: W [in, out]
//! Bias:   b [out]
//! z = x @ W + b        [out]
//! y = act(z)           [out]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! δ      = grad_y ⊙ act'(z)        (softmax: Jacobian product)
//! grad_W += x^T δ                  outer product
//! grad_b += δ
//! grad_x  = W δ
//! ```
//!
//! ## Implementation Notes
//!
//! - Glorot uniform initialization: limit = √(6/(in+out))
//! - Bias initialized to zero
//! - Caches x, z and y for the backward pass

use crate::activation::ActivationFunction;
use crate::error::{Error, Result};
use crate::layers::{
    check_output_shape, glorot_limit, missing_forward, not_initialized, random_init, Layer,
    LayerKind, ParamRef,
};
use crate::tensor::Tensor;

pub const MIN_NEURONS: usize = 1;
pub const MAX_NEURONS: usize = 10_000;

/// Fully connected layer
///
/// Weights are stored row-major as `[in][out]`, so `weights[i * out + j]`
/// connects input `i` to neuron `j`.
#[derive(Debug)]
pub struct Dense {
    neurons: usize,
    activation: ActivationFunction,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
    weight_grads: Vec<f64>,
    bias_grads: Vec<f64>,
    cache: Option<DenseCache>,
}

/// Values from the last forward pass
#[derive(Debug)]
struct DenseCache {
    input: Vec<f64>,
    z: Vec<f64>,
    output: Vec<f64>,
}

impl Dense {
    /// Create an uninitialized dense layer
    ///
    /// # Arguments
    ///
    /// * `neurons` - Output width, 1 to 10000
    /// * `activation` - Activation applied to `W·x + b`
    pub fn new(neurons: usize, activation: ActivationFunction) -> Result<Self> {
        if !(MIN_NEURONS..=MAX_NEURONS).contains(&neurons) {
            return Err(Error::Config(format!(
                "dense layer needs {MIN_NEURONS}..={MAX_NEURONS} neurons, got {neurons}"
            )));
        }
        Ok(Self {
            neurons,
            activation,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            weights: Vec::new(),
            biases: Vec::new(),
            weight_grads: Vec::new(),
            bias_grads: Vec::new(),
            cache: None,
        })
    }

    pub fn neurons(&self) -> usize {
        self.neurons
    }

    pub fn activation(&self) -> ActivationFunction {
        self.activation
    }

    fn input_size(&self) -> usize {
        self.input_shape.first().copied().unwrap_or(0)
    }

    fn pre_activation(&self, x: &[f64]) -> Vec<f64> {
        let mut z = self.biases.clone();
        for (i, &xi) in x.iter().enumerate() {
            if xi == 0.0 {
                continue;
            }
            let row = &self.weights[i * self.neurons..(i + 1) * self.neurons];
            for (zj, &w) in z.iter_mut().zip(row) {
                *zj += xi * w;
            }
        }
        z
    }

    fn compute(&self, x: &[f64]) -> DenseCache {
        let z = self.pre_activation(x);
        let output = self.activation.apply_vector(&z);
        DenseCache {
            input: x.to_vec(),
            z,
            output,
        }
    }
}

impl Layer for Dense {
    fn kind(&self) -> LayerKind {
        LayerKind::Dense
    }

    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        match input_shape {
            [n] if *n > 0 => Ok(vec![self.neurons]),
            _ => Err(Error::Config(format!(
                "dense layer expects a non-empty vector input, got shape {input_shape:?}"
            ))),
        }
    }

    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()> {
        check_output_shape(self, input_shape, output_shape)?;
        let fan_in = input_shape[0];
        let limit = glorot_limit(fan_in, self.neurons);

        self.weights = random_init(fan_in * self.neurons, limit);
        self.biases = vec![0.0; self.neurons];
        self.weight_grads = vec![0.0; fan_in * self.neurons];
        self.bias_grads = vec![0.0; self.neurons];
        self.input_shape = input_shape.to_vec();
        self.output_shape = output_shape.to_vec();
        self.cache = None;
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

        let cache = self.compute(&input.data);
        let output = Tensor::from_vec(cache.output.clone());
        self.cache = Some(cache);
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        input.ensure_shape(&self.input_shape)?;
        grad_output.ensure_shape(&self.output_shape)?;
        let cached = self.cache.take().ok_or_else(|| missing_forward(self.kind()))?;

        // A caller may back-propagate an earlier input of the same sequence;
        // the dense layer is stateless so the activations can be recomputed.
        let cache = if cached.input == input.data {
            cached
        } else {
            self.compute(&input.data)
        };

        let delta = self
            .activation
            .backprop_vector(&cache.z, &cache.output, &grad_output.data);

        let fan_in = self.input_size();
        let mut grad_input = vec![0.0; fan_in];
        for i in 0..fan_in {
            let xi = cache.input[i];
            let row = i * self.neurons..(i + 1) * self.neurons;
            let mut acc = 0.0;
            for ((gw, &w), &d) in self.weight_grads[row.clone()]
                .iter_mut()
                .zip(&self.weights[row])
                .zip(&delta)
            {
                *gw += xi * d;
                acc += w * d;
            }
            grad_input[i] = acc;
        }
        for (gb, d) in self.bias_grads.iter_mut().zip(&delta) {
            *gb += d;
        }

        self.cache = Some(cache);
        Tensor::new(grad_input, self.input_shape.clone())
    }

    fn parameters(&mut self) -> Vec<ParamRef<'_>> {
        vec![
            ParamRef {
                values: &mut self.weights,
                grads: &mut self.weight_grads,
            },
            ParamRef {
                values: &mut self.biases,
                grads: &mut self.bias_grads,
            },
        ]
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::{check_input_gradient, dot, sample_tensor};

    fn initialized(input: usize, neurons: usize, activation: ActivationFunction) -> Dense {
        let mut layer = Dense::new(neurons, activation).unwrap();
        layer.initialize(&[input], &[neurons]).unwrap();
        layer
    }

    #[test]
    fn test_neuron_bounds() {
        assert!(Dense::new(0, ActivationFunction::Relu).is_err());
        assert!(Dense::new(10_001, ActivationFunction::Relu).is_err());
        assert!(Dense::new(10_000, ActivationFunction::Relu).is_ok());
    }

    #[test]
    fn test_forward_known_weights() {
        let mut layer = initialized(2, 2, ActivationFunction::Linear);
        layer.weights = vec![1.0, 2.0, 3.0, 4.0];
        layer.biases = vec![0.5, -0.5];
        let out = layer.forward(&Tensor::from_vec(vec![1.0, 1.0])).unwrap();
        assert_eq!(out.data, vec![4.5, 5.5]);
    }

    #[test]
    fn test_input_gradient_matches_finite_differences() {
        for activation in [
            ActivationFunction::Sigmoid,
            ActivationFunction::Tanh,
            ActivationFunction::Gelu,
            ActivationFunction::Softmax,
        ] {
            let mut layer = initialized(5, 3, activation);
            let input = sample_tensor(vec![5], 11);
            check_input_gradient(&mut layer, &input, 1e-6);
        }
    }

    #[test]
    fn test_weight_gradient_matches_finite_differences() {
        let mut layer = initialized(3, 2, ActivationFunction::Tanh);
        let input = sample_tensor(vec![3], 21);
        layer.forward(&input).unwrap();
        let grad = sample_tensor(vec![2], 22);
        layer.backward(&input, &grad).unwrap();
        let analytic = layer.weight_grads.clone();

        let h = 1e-6;
        for k in 0..layer.weights.len() {
            let original = layer.weights[k];
            layer.weights[k] = original + h;
            let lp = dot(&layer.forward(&input).unwrap(), &grad);
            layer.weights[k] = original - h;
            let lm = dot(&layer.forward(&input).unwrap(), &grad);
            layer.weights[k] = original;
            let numeric = (lp - lm) / (2.0 * h);
            assert!((numeric - analytic[k]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_update_weights_adds_and_clears() {
        let mut layer = initialized(2, 1, ActivationFunction::Linear);
        layer.weights = vec![0.0, 0.0];
        let input = Tensor::from_vec(vec![1.0, 2.0]);
        layer.forward(&input).unwrap();
        layer.backward(&input, &Tensor::from_vec(vec![1.0])).unwrap();
        layer.update_weights(0.5);

        // target - output was positive, so the weights grow
        assert_eq!(layer.weights, vec![0.5, 1.0]);
        assert_eq!(layer.biases, vec![0.5]);
        assert!(layer.weight_grads.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_gradients_accumulate_until_update() {
        let mut layer = initialized(1, 1, ActivationFunction::Linear);
        let input = Tensor::from_vec(vec![2.0]);
        for _ in 0..3 {
            layer.forward(&input).unwrap();
            layer.backward(&input, &Tensor::from_vec(vec![1.0])).unwrap();
        }
        assert_eq!(layer.weight_grads, vec![6.0]);
        assert_eq!(layer.bias_grads, vec![3.0]);
    }
}
