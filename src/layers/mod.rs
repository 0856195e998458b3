//! Neural Network Layers
//!
//! Every layer implements the [`Layer`] trait so that network containers can
//! hold a heterogeneous `Vec<Box<dyn Layer>>` and drive it uniformly.
//!
//! ## Layers
//!
//! - **dense**: Fully connected layer with an activation function
//! - **dropout**: Dropout regularization
//! - **batch_norm**: Per-vector normalization with learnable scale/shift
//! - **conv2d**: 2-D convolution over `[h, w, c]` volumes
//! - **max_pooling**: Windowed max with argmax routing
//! - **flatten**: Volume to vector reshape
//! - **lstm**: Long short-term memory cell
//! - **gru**: Gated recurrent unit
//!
//! ## Life Cycle
//!
//! ```text
//! new(config)            validate construction bounds
//! initialize(in, out)    allocate parameters (Glorot uniform, zero bias)
//! forward(x)             compute output, cache what backward needs
//! backward(x, grad)      accumulate parameter gradients, return input grad
//! update_weights(lr)     param += lr * grad, then clear grads
//! ```
//!
//! ## Sign Convention
//!
//! Networks seed back-propagation with `target - output`, the negative of
//! the loss gradient. Gradients accumulated by layers therefore already point
//! downhill and are *added* to the parameters.

pub mod batch_norm;
pub mod conv2d;
pub mod dense;
pub mod dropout;
pub mod flatten;
mod gate;
pub mod gru;
pub mod lstm;
pub mod max_pooling;

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::Tensor;

pub use batch_norm::BatchNormalization;
pub use conv2d::Conv2D;
pub use dense::Dense;
pub use dropout::Dropout;
pub use flatten::Flatten;
pub use gru::Gru;
pub use lstm::Lstm;
pub use max_pooling::MaxPooling;

/// Layer variant tag, used in architecture strings and shape-chain checks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Dense,
    Dropout,
    BatchNormalization,
    Conv2D,
    MaxPooling,
    Flatten,
    Lstm,
    Gru,
}

impl LayerKind {
    pub fn name(self) -> &'static str {
        match self {
            LayerKind::Dense => "Dense",
            LayerKind::Dropout => "Dropout",
            LayerKind::BatchNormalization => "BatchNormalization",
            LayerKind::Conv2D => "Conv2D",
            LayerKind::MaxPooling => "MaxPooling",
            LayerKind::Flatten => "Flatten",
            LayerKind::Lstm => "LSTM",
            LayerKind::Gru => "GRU",
        }
    }

    pub fn is_recurrent(self) -> bool {
        matches!(self, LayerKind::Lstm | LayerKind::Gru)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A learnable parameter buffer paired with its gradient accumulator
///
/// Handed to the optimizer so moment-based algorithms can update parameters
/// without knowing the layer type.
pub struct ParamRef<'a> {
    pub values: &'a mut [f64],
    pub grads: &'a mut [f64],
}

/// The contract every layer variant implements
pub trait Layer: Send + fmt::Debug {
    fn kind(&self) -> LayerKind;

    /// Shape this layer produces for `input_shape`
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the input shape is structurally invalid for the
    /// variant (wrong rank, window larger than the input, ...).
    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>>;

    /// Allocate and seed parameters for the given shapes
    ///
    /// `output_shape` must equal `output_shape_for(input_shape)`.
    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()>;

    fn is_initialized(&self) -> bool;

    fn input_shape(&self) -> &[usize];

    fn output_shape(&self) -> &[usize];

    /// Compute the output for `input` and cache what `backward` needs
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Accumulate parameter gradients and return the gradient w.r.t. `input`
    ///
    /// Must follow a matching `forward` call on the same instance.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor>;

    /// Parameter/gradient pairs, empty for parameter-free layers
    fn parameters(&mut self) -> Vec<ParamRef<'_>> {
        Vec::new()
    }

    fn parameter_count(&self) -> usize {
        0
    }

    /// Apply accumulated gradients with plain gradient steps, then clear them
    fn update_weights(&mut self, learning_rate: f64) {
        for param in self.parameters() {
            for (value, grad) in param.values.iter_mut().zip(param.grads.iter_mut()) {
                *value += learning_rate * *grad;
                *grad = 0.0;
            }
        }
    }

    /// Switch between training and inference behaviour
    fn set_training(&mut self, _training: bool) {}

    /// Clear recurrent state and any per-sequence caches
    fn reset_state(&mut self) {}

    /// Seed the recurrent state used by the next forward step
    fn set_initial_state(&mut self, _hidden: &[f64], _cell: Option<&[f64]>) -> Result<()> {
        Err(Error::InvalidState(format!(
            "{} layer has no recurrent state",
            self.kind()
        )))
    }
}

/// Uniform initialization in `[-limit, limit]`
pub fn random_init(size: usize, limit: f64) -> Vec<f64> {
    let mut rng = rand::rng();
    if limit <= 0.0 {
        return vec![0.0; size];
    }
    (0..size).map(|_| rng.random_range(-limit..=limit)).collect()
}

/// Glorot/Xavier uniform limit `sqrt(6 / (fan_in + fan_out))`
pub fn glorot_limit(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out).max(1) as f64).sqrt()
}

/// Shared `initialize` check: the requested output shape must be the one
/// the layer would derive itself
pub(crate) fn check_output_shape(
    layer: &dyn Layer,
    input_shape: &[usize],
    output_shape: &[usize],
) -> Result<()> {
    let derived = layer.output_shape_for(input_shape)?;
    if derived != output_shape {
        return Err(Error::Config(format!(
            "{} layer maps {:?} to {:?}, not {:?}",
            layer.kind(),
            input_shape,
            derived,
            output_shape
        )));
    }
    Ok(())
}

pub(crate) fn not_initialized(kind: LayerKind) -> Error {
    Error::InvalidState(format!("{kind} layer used before initialize"))
}

pub(crate) fn missing_forward(kind: LayerKind) -> Error {
    Error::InvalidState(format!("{kind} backward called without a matching forward"))
}

/// Shape/gradient invariants that every layer must satisfy
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic pseudo-random tensor for gradient checks
    pub fn sample_tensor(shape: Vec<usize>, seed: u64) -> Tensor {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let mut t = Tensor::zeros(shape);
        for v in &mut t.data {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            *v = ((state >> 33) as f64 / (1u64 << 31) as f64) - 0.5;
        }
        t
    }

    /// Loss `L = <grad_output, forward(x)>`. The layer's backward returns
    /// `dL/dx`; compare against central differences on `x`.
    pub fn check_input_gradient(layer: &mut dyn Layer, input: &Tensor, tolerance: f64) {
        let output = layer.forward(input).unwrap();
        let grad_output = sample_tensor(output.shape.clone(), 99);
        let analytic = layer.backward(input, &grad_output).unwrap();
        assert_eq!(analytic.shape, input.shape);

        let h = 1e-6;
        for i in 0..input.len() {
            let mut plus = input.clone();
            let mut minus = input.clone();
            plus.data[i] += h;
            minus.data[i] -= h;
            let lp: f64 = dot(&layer.forward(&plus).unwrap(), &grad_output);
            let lm: f64 = dot(&layer.forward(&minus).unwrap(), &grad_output);
            let numeric = (lp - lm) / (2.0 * h);
            assert!(
                (numeric - analytic.data[i]).abs() < tolerance,
                "{} input grad {i}: numeric {numeric} vs analytic {}",
                layer.kind(),
                analytic.data[i]
            );
        }
    }

    pub fn dot(a: &Tensor, b: &Tensor) -> f64 {
        a.data.iter().zip(&b.data).map(|(x, y)| x * y).sum()
    }
}
