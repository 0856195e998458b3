//! Network Containers
//!
//! Containers own an ordered layer stack plus one [`Optimizer`] and drive
//! forward passes, back-propagation and epoch training over them.
//!
//! - **flat**: [`NeuralNetwork`], a fixed `input → hidden… → output` perceptron
//! - **deep**: [`DeepNetwork`], an appendable stack of dense, dropout and
//!   batch-normalization layers
//! - **convolutional**: [`ConvNetwork`], image volumes through conv/pool/flatten/dense
//! - **recurrent**: [`RecurrentNetwork`], sequences through LSTM/GRU/dense
//! - **trainer**: the shared epoch loop and error history
//!
//! ## Training Step
//!
//! ```text
//! for each sample:
//!     activations = forward through every layer (kept per layer)
//!     error       = target - output
//!     grad        = error
//!     for layer in reverse: grad = layer.backward(activation_in, grad)
//!     optimizer.update_weights(layers)
//! ```

pub mod convolutional;
pub mod deep;
pub mod flat;
pub mod recurrent;
pub mod trainer;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::layers::{Layer, LayerKind};
use crate::optimizer::OptimizerType;
use crate::tensor::Tensor;

pub use convolutional::{ConvNetwork, ImageShape};
pub use deep::DeepNetwork;
pub use flat::{FlatTopology, NeuralNetwork};
pub use recurrent::{RecurrentNetwork, Sequence};
pub use trainer::{ErrorHistory, TrainingReport};

/// Snapshot of a container for reporting
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkStats {
    pub architecture: String,
    pub layers: usize,
    pub parameters: usize,
    pub active: bool,
    pub current_error: f64,
    pub total_epochs: u64,
    pub learning_rate: f64,
    pub optimizer: OptimizerType,
    /// Up to the last 10 epoch errors, oldest first
    pub recent_errors: Vec<f64>,
}

/// Ordered layers with a consistent shape chain
#[derive(Debug, Default)]
pub(crate) struct LayerStack {
    layers: Vec<Box<dyn Layer>>,
}

impl LayerStack {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn last_kind(&self) -> Option<LayerKind> {
        self.layers.last().map(|l| l.kind())
    }

    pub fn output_shape(&self) -> Option<&[usize]> {
        self.layers.last().map(|l| l.output_shape())
    }

    /// Initialize `layer` for `input_shape` and append it
    pub fn push(&mut self, mut layer: Box<dyn Layer>, input_shape: &[usize]) -> Result<()> {
        let output_shape = layer.output_shape_for(input_shape)?;
        layer.initialize(input_shape, &output_shape)?;
        self.layers.push(layer);
        Ok(())
    }

    /// Append without initializing; [`LayerStack::reinitialize`] must run
    /// before the next forward pass
    pub fn push_deferred(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn pop(&mut self) -> Option<Box<dyn Layer>> {
        self.layers.pop()
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }

    /// Shape the stack would produce for `input_shape`, without touching
    /// any layer
    pub fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let mut shape = input_shape.to_vec();
        for layer in &self.layers {
            shape = layer.output_shape_for(&shape)?;
        }
        Ok(shape)
    }

    /// Re-derive and re-initialize every layer for a new input shape
    pub fn reinitialize(&mut self, input_shape: &[usize]) -> Result<()> {
        let mut shape = input_shape.to_vec();
        for layer in &mut self.layers {
            let out = layer.output_shape_for(&shape)?;
            layer.initialize(&shape, &out)?;
            shape = out;
        }
        Ok(())
    }

    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let mut current = input.clone();
        for layer in &mut self.layers {
            current = layer.forward(&current)?;
        }
        Ok(current)
    }

    /// Forward pass keeping the input of every layer
    ///
    /// Returns `(layer_inputs, output)`; `layer_inputs[i]` is what layer `i`
    /// received.
    pub fn forward_recording(&mut self, input: &Tensor) -> Result<(Vec<Tensor>, Tensor)> {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut current = input.clone();
        for layer in &mut self.layers {
            let next = layer.forward(&current)?;
            inputs.push(current);
            current = next;
        }
        Ok((inputs, current))
    }

    /// Back-propagate `grad` from the output through every layer, returning
    /// the gradient with respect to the network input
    pub fn backward(&mut self, layer_inputs: &[Tensor], grad: Tensor) -> Result<Tensor> {
        let mut grad = grad;
        for (layer, input) in self.layers.iter_mut().zip(layer_inputs).rev() {
            grad = layer.backward(input, &grad)?;
        }
        Ok(grad)
    }

    /// One supervised step without the weight update
    ///
    /// Runs the forward pass, seeds back-propagation with `target - output`
    /// and returns that output error.
    pub fn backpropagate(&mut self, input: &Tensor, target: &[f64]) -> Result<Vec<f64>> {
        let (layer_inputs, output) = self.forward_recording(input)?;
        let error = output_error(&output, target)?;
        self.backward(&layer_inputs, Tensor::from_vec(error.clone()))?;
        Ok(error)
    }

    /// Drop accumulated gradients, leaving parameters as they are
    pub fn clear_gradients(&mut self) {
        for layer in &mut self.layers {
            for param in layer.parameters() {
                param.grads.fill(0.0);
            }
        }
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    pub fn reset_state(&mut self) {
        for layer in &mut self.layers {
            layer.reset_state();
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }

    /// `"Name[Dense -> Dropout -> Dense]"`
    pub fn architecture(&self, name: &str) -> String {
        let kinds: Vec<&str> = self.layers.iter().map(|l| l.kind().name()).collect();
        format!("{name}[{}]", kinds.join(" -> "))
    }
}

/// `target - output`, element-wise
pub(crate) fn output_error(output: &Tensor, target: &[f64]) -> Result<Vec<f64>> {
    if output.len() != target.len() {
        return Err(Error::shape(&output.shape, &[target.len()]));
    }
    Ok(target
        .iter()
        .zip(&output.data)
        .map(|(t, o)| t - o)
        .collect())
}

/// Reject the first target row that is not `width` values wide
///
/// Runs before training touches any layer.
pub(crate) fn check_target_widths<'a>(
    network: &str,
    targets: impl IntoIterator<Item = &'a [f64]>,
    width: usize,
) -> Result<()> {
    if let Some(row) = targets.into_iter().find(|t| t.len() != width) {
        tracing::warn!(
            expected = width,
            actual = row.len(),
            "{network} rejected training targets"
        );
        return Err(Error::shape(&[width], &[row.len()]));
    }
    Ok(())
}

pub(crate) fn inactive(network: &str) -> Error {
    Error::InvalidState(format!("{network} is not active"))
}

pub(crate) fn active_modification(network: &str) -> Error {
    Error::InvalidState(format!("{network} layers cannot change while active"))
}
