//! Recurrent Network
//!
//! Sequences of step vectors run through LSTM, GRU and dense layers. Layer
//! widths are only known once the first sequence arrives: layers are stored
//! uninitialized and sized from that sequence's step width.
//!
//! ## Sequence Pass
//!
//! ```text
//! reset every recurrent state, apply seeded initial states
//! for t in steps:
//!     for layer in layers: x = layer.forward(x)        (caches kept)
//! ```
//!
//! Training then walks the steps backwards, feeding each step's output error
//! through the layers in reverse. The recurrent layers add the gradient
//! carried from the later step themselves, which gives full
//! back-propagation through time.

use crate::activation::ActivationFunction;
use crate::config::TrainingConfig;
use crate::error::{Error, Result};
use crate::layers::{Dense, Gru, Layer, Lstm};
use crate::network::trainer::{run_epochs, ErrorHistory, TrainingReport, TrainingState};
use crate::network::{
    active_modification, check_target_widths, inactive, output_error, LayerStack, NetworkStats,
};
use crate::optimizer::{Optimizer, OptimizerType};
use crate::tensor::Tensor;

pub const MAX_LAYERS: usize = 20;
pub const MIN_LEARNING_RATE: f64 = 1e-4;
pub const MAX_LEARNING_RATE: f64 = 1.0;
pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 1000;

const NAME: &str = "RecurrentNetwork";

/// One step vector per time step
pub type Sequence = Vec<Vec<f64>>;

#[derive(Clone, Debug, PartialEq)]
struct InitialState {
    hidden: Vec<f64>,
    cell: Option<Vec<f64>>,
}

/// Stack of recurrent and dense layers over sequences
#[derive(Debug)]
pub struct RecurrentNetwork {
    stack: LayerStack,
    /// Step width the layers are currently sized for
    step_width: Option<usize>,
    initial_states: Vec<Option<InitialState>>,
    optimizer: Optimizer,
    progress: TrainingState,
    batch_size: usize,
    active: bool,
}

impl Default for RecurrentNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl RecurrentNetwork {
    pub fn new() -> Self {
        Self {
            stack: LayerStack::default(),
            step_width: None,
            initial_states: Vec::new(),
            optimizer: Optimizer::new(OptimizerType::Adam, 0.001),
            progress: TrainingState::default(),
            batch_size: 1,
            active: false,
        }
    }

    fn append(&mut self, layer: Box<dyn Layer>) -> Result<()> {
        if self.active {
            return Err(active_modification(NAME));
        }
        if self.stack.len() >= MAX_LAYERS {
            tracing::warn!(max = MAX_LAYERS, "{NAME} layer limit reached");
            return Err(Error::Config(format!(
                "{NAME} holds at most {MAX_LAYERS} layers"
            )));
        }
        tracing::info!(layer = %layer.kind(), position = self.stack.len() + 1, "{NAME} layer added");
        self.stack.push_deferred(layer);
        self.initial_states.push(None);
        self.step_width = None;
        Ok(())
    }

    pub fn add_lstm_layer(&mut self, hidden_size: usize) -> Result<()> {
        self.append(Box::new(Lstm::new(hidden_size)?))
    }

    pub fn add_gru_layer(&mut self, hidden_size: usize) -> Result<()> {
        self.append(Box::new(Gru::new(hidden_size)?))
    }

    pub fn add_dense_layer(&mut self, neurons: usize, activation: ActivationFunction) -> Result<()> {
        self.append(Box::new(Dense::new(neurons, activation)?))
    }

    pub fn clear_layers(&mut self) {
        self.stack.clear();
        self.initial_states.clear();
        self.step_width = None;
        self.optimizer.reset();
        self.active = false;
        tracing::info!("{NAME} layers cleared");
    }

    pub fn layer_count(&self) -> usize {
        self.stack.len()
    }

    pub fn activate(&mut self) -> Result<()> {
        if self.stack.is_empty() {
            return Err(Error::InvalidState(format!(
                "{NAME} needs at least one layer to activate"
            )));
        }
        self.active = true;
        tracing::info!(architecture = %self.architecture(), "{NAME} activated");
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Width every step must have, derived from the sequence
    fn sequence_width(sequence: &[Vec<f64>]) -> Result<usize> {
        let width = sequence
            .first()
            .map(Vec::len)
            .ok_or_else(|| Error::InvalidData("sequence has no steps".into()))?;
        if width == 0 {
            return Err(Error::InvalidData("sequence steps are empty".into()));
        }
        if let Some(step) = sequence.iter().find(|s| s.len() != width) {
            return Err(Error::shape(&[width], &[step.len()]));
        }
        Ok(width)
    }

    /// Size the layers for `width`-wide steps, re-initializing them when the
    /// width changed
    fn ensure_initialized(&mut self, width: usize) -> Result<()> {
        if self.step_width == Some(width) {
            return Ok(());
        }
        if let Some(previous) = self.step_width {
            tracing::warn!(previous, width, "{NAME} step width changed, re-initializing layers");
        }
        self.stack.reinitialize(&[width])?;
        self.optimizer.reset();
        self.initial_states.iter_mut().for_each(|s| *s = None);
        self.step_width = Some(width);
        Ok(())
    }

    /// Reset recurrent state, then apply any seeded initial states
    fn begin_sequence(&mut self) -> Result<()> {
        self.stack.reset_state();
        for (layer, state) in self.stack.layers_mut().iter_mut().zip(&self.initial_states) {
            if let Some(state) = state {
                layer.set_initial_state(&state.hidden, state.cell.as_deref())?;
            }
        }
        Ok(())
    }

    /// Per-step outputs of the last layer
    pub fn forward(&mut self, sequence: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        if !self.active {
            tracing::warn!("{NAME} is not active, forward skipped");
            return Err(inactive(NAME));
        }
        let width = Self::sequence_width(sequence)?;
        self.ensure_initialized(width)?;
        self.begin_sequence()?;

        sequence
            .iter()
            .map(|step| {
                self.stack
                    .forward(&Tensor::from_vec(step.clone()))
                    .map(Tensor::into_vec)
            })
            .collect()
    }

    /// Train for exactly `epochs` passes with back-propagation through time
    ///
    /// Gradients accumulate over `batch_size` sequences before each
    /// optimizer step; a partial batch is applied at the end of the epoch.
    /// The epoch error is the per-sequence mean squared error over every
    /// step and unit, averaged over sequences. Zero epochs validates the
    /// data and returns without training.
    pub fn train(
        &mut self,
        sequences: &[Sequence],
        targets: &[Sequence],
        epochs: usize,
    ) -> Result<TrainingReport> {
        if !self.active {
            tracing::warn!("{NAME} is not active, training skipped");
            return Err(inactive(NAME));
        }
        if sequences.len() != targets.len() || sequences.is_empty() {
            return Err(Error::InvalidData(format!(
                "need the same non-zero number of input and target sequences, got {} and {}",
                sequences.len(),
                targets.len()
            )));
        }
        let width = Self::sequence_width(&sequences[0])?;
        for (seq, target) in sequences.iter().zip(targets) {
            if Self::sequence_width(seq)? != width {
                return Err(Error::InvalidData(
                    "all training sequences must share one step width".into(),
                ));
            }
            if seq.len() != target.len() {
                return Err(Error::InvalidData(format!(
                    "sequence of {} steps paired with {} target steps",
                    seq.len(),
                    target.len()
                )));
            }
        }
        let output_width: usize = self.stack.output_shape_for(&[width])?.iter().product();
        check_target_widths(
            NAME,
            targets.iter().flatten().map(Vec::as_slice),
            output_width,
        )?;
        if epochs == 0 {
            return Ok(TrainingReport::idle(&self.progress));
        }
        self.ensure_initialized(width)?;

        let batch_size = self.batch_size;
        let learning_rate = self.optimizer.learning_rate();
        let count = sequences.len() as f64;
        let config = TrainingConfig::fixed_epochs(epochs);

        // moved out while the epoch closure borrows the whole network
        let mut progress = std::mem::take(&mut self.progress);
        let result = run_epochs(NAME, &config, &mut progress, learning_rate, || {
            let mut total = 0.0;
            for (i, (seq, target)) in sequences.iter().zip(targets).enumerate() {
                total += self.backpropagate_sequence(seq, target)?;
                if (i + 1) % batch_size == 0 {
                    self.optimizer.update_weights(self.stack.layers_mut());
                }
            }
            if sequences.len() % batch_size != 0 {
                self.optimizer.update_weights(self.stack.layers_mut());
            }
            Ok(total / count)
        });
        self.progress = progress;

        self.stack.reset_state();
        if let Err(e) = &result {
            self.stack.clear_gradients();
            tracing::error!(error = %e, "{NAME} training failed");
        }
        result
    }

    /// Forward one sequence, back-propagate it through time and return its
    /// mean squared error
    fn backpropagate_sequence(&mut self, sequence: &[Vec<f64>], target: &[Vec<f64>]) -> Result<f64> {
        self.begin_sequence()?;

        let mut layer_inputs = Vec::with_capacity(sequence.len());
        let mut errors = Vec::with_capacity(sequence.len());
        for (step, step_target) in sequence.iter().zip(target) {
            let (inputs, output) = self
                .stack
                .forward_recording(&Tensor::from_vec(step.clone()))?;
            errors.push(output_error(&output, step_target)?);
            layer_inputs.push(inputs);
        }

        let mut squared = 0.0;
        let mut units = 0;
        for (inputs, error) in layer_inputs.iter().zip(errors).rev() {
            squared += error.iter().map(|e| e * e).sum::<f64>();
            units += error.len();
            self.stack.backward(inputs, Tensor::from_vec(error))?;
        }
        Ok(squared / units.max(1) as f64)
    }

    /// Zero every hidden and cell state and drop seeded initial states
    pub fn reset_states(&mut self) {
        self.stack.reset_state();
        self.initial_states.iter_mut().for_each(|s| *s = None);
    }

    /// Seed the state a recurrent layer starts every sequence from
    ///
    /// The layers must already be sized by a first `forward` or `train`
    /// call. `cell` applies to LSTM layers only.
    pub fn set_initial_state(
        &mut self,
        layer_index: usize,
        hidden: &[f64],
        cell: Option<&[f64]>,
    ) -> Result<()> {
        let layer = self
            .stack
            .layers_mut()
            .get_mut(layer_index)
            .ok_or_else(|| {
                Error::Config(format!("no layer at index {layer_index}"))
            })?;
        if !layer.kind().is_recurrent() {
            return Err(Error::Config(format!(
                "layer {layer_index} is {}, not recurrent",
                layer.kind()
            )));
        }
        layer.set_initial_state(hidden, cell)?;
        self.initial_states[layer_index] = Some(InitialState {
            hidden: hidden.to_vec(),
            cell: cell.map(<[f64]>::to_vec),
        });
        Ok(())
    }

    /// Set the learning rate, clamped to `[1e-4, 1]`
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        let lr = if learning_rate.is_nan() {
            MIN_LEARNING_RATE
        } else {
            learning_rate.clamp(MIN_LEARNING_RATE, MAX_LEARNING_RATE)
        };
        self.optimizer.set_learning_rate(lr);
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_optimizer(&mut self, kind: OptimizerType) {
        self.optimizer.set_type(kind);
    }

    /// Sequences per optimizer step, clamped to `[1, 1000]`
    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn architecture(&self) -> String {
        self.stack.architecture(NAME)
    }

    pub fn error_history(&self) -> &ErrorHistory {
        &self.progress.history
    }

    pub fn training_epochs(&self) -> u64 {
        self.progress.total_epochs
    }

    pub fn statistics(&self) -> NetworkStats {
        NetworkStats {
            architecture: self.architecture(),
            layers: self.stack.len(),
            parameters: self.stack.parameter_count(),
            active: self.active,
            current_error: self.progress.current_error,
            total_epochs: self.progress.total_epochs,
            learning_rate: self.optimizer.learning_rate(),
            optimizer: self.optimizer.kind(),
            recent_errors: self.progress.history.recent(10),
        }
    }
}
