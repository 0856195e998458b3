//! Deep Feed-Forward Network
//!
//! An appendable stack of dense, dropout and batch-normalization layers
//! trained one sample at a time with the shared [`Optimizer`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use synapse::{ActivationFunction, DeepNetwork, ProcessedData};
//!
//! let mut net = DeepNetwork::new(2)?;
//! net.add_dense_layer(8, ActivationFunction::Tanh)?;
//! net.add_dense_layer(1, ActivationFunction::Sigmoid)?;
//! net.activate()?;
//!
//! let data = ProcessedData::new(
//!     vec![vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]],
//!     vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]],
//! )?;
//! let report = net.train(&data)?;
//! println!("{} epochs, error {:.4}", report.epochs, report.final_error);
//! # Ok::<(), synapse::Error>(())
//! ```

use crate::activation::ActivationFunction;
use crate::config::TrainingConfig;
use crate::data::ProcessedData;
use crate::error::{Error, Result};
use crate::layers::{BatchNormalization, Dense, Dropout, Layer};
use crate::network::trainer::{
    run_epochs, squared_error, ErrorHistory, TrainingReport, TrainingState,
};
use crate::network::{
    active_modification, check_target_widths, inactive, LayerStack, NetworkStats,
};
use crate::optimizer::{Optimizer, OptimizerType};
use crate::tensor::Tensor;
use crate::training_logger::TrainingLogger;

pub const MAX_LAYERS: usize = 50;
pub const MIN_LEARNING_RATE: f64 = 1e-4;
pub const MAX_LEARNING_RATE: f64 = 1.0;

const NAME: &str = "DeepNetwork";

/// Layer stack over fixed-width input vectors
#[derive(Debug)]
pub struct DeepNetwork {
    input_size: usize,
    stack: LayerStack,
    optimizer: Optimizer,
    config: TrainingConfig,
    progress: TrainingState,
    active: bool,
    training_mode: bool,
}

impl DeepNetwork {
    /// Empty, inactive network for input vectors of `input_size` values
    pub fn new(input_size: usize) -> Result<Self> {
        if input_size == 0 {
            return Err(Error::Config("input size must be at least 1".into()));
        }
        Ok(Self {
            input_size,
            stack: LayerStack::default(),
            optimizer: Optimizer::default(),
            config: TrainingConfig::default(),
            progress: TrainingState::default(),
            active: false,
            training_mode: true,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Append a layer, deriving its input shape from the current output
    pub fn add_layer(&mut self, mut layer: Box<dyn Layer>) -> Result<()> {
        if self.active {
            tracing::warn!(layer = %layer.kind(), "{NAME} is active, layer not added");
            return Err(active_modification(NAME));
        }
        if self.stack.len() >= MAX_LAYERS {
            tracing::warn!(max = MAX_LAYERS, "{NAME} layer limit reached");
            return Err(Error::Config(format!(
                "{NAME} holds at most {MAX_LAYERS} layers"
            )));
        }

        let input_shape = self
            .stack
            .output_shape()
            .map_or_else(|| vec![self.input_size], <[usize]>::to_vec);
        let kind = layer.kind();
        layer.set_training(self.training_mode);
        self.stack.push(layer, &input_shape)?;
        tracing::info!(
            layer = %kind,
            position = self.stack.len(),
            input = ?input_shape,
            "{NAME} layer added"
        );
        Ok(())
    }

    pub fn add_dense_layer(&mut self, neurons: usize, activation: ActivationFunction) -> Result<()> {
        self.add_layer(Box::new(Dense::new(neurons, activation)?))
    }

    pub fn add_dropout_layer(&mut self, rate: f64) -> Result<()> {
        self.add_layer(Box::new(Dropout::new(rate)?))
    }

    pub fn add_batch_normalization_layer(&mut self) -> Result<()> {
        self.add_layer(Box::new(BatchNormalization::new()))
    }

    /// Remove and return the last layer
    pub fn remove_last_layer(&mut self) -> Result<Box<dyn Layer>> {
        if self.active {
            return Err(active_modification(NAME));
        }
        let layer = self
            .stack
            .pop()
            .ok_or_else(|| Error::InvalidState(format!("{NAME} has no layers")))?;
        self.optimizer.reset();
        Ok(layer)
    }

    /// Drop every layer and deactivate
    pub fn clear_layers(&mut self) {
        self.stack.clear();
        self.optimizer.reset();
        self.active = false;
        tracing::info!("{NAME} layers cleared");
    }

    pub fn layer_count(&self) -> usize {
        self.stack.len()
    }

    pub fn activate(&mut self) -> Result<()> {
        if self.stack.is_empty() {
            tracing::warn!("{NAME} cannot be activated without layers");
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

    fn check_input(&self, input: &[f64]) -> Result<()> {
        if !self.active {
            return Err(inactive(NAME));
        }
        if input.len() != self.input_size {
            return Err(Error::shape(&[self.input_size], &[input.len()]));
        }
        Ok(())
    }

    pub fn forward(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        self.check_input(input)?;
        let output = self.stack.forward(&Tensor::from_vec(input.to_vec()))?;
        Ok(output.into_vec())
    }

    /// Back-propagate one sample and return its output error
    /// `target - output`
    ///
    /// Gradients stay accumulated in the layers until the next optimizer
    /// update.
    pub fn backward(&mut self, input: &[f64], target: &[f64]) -> Result<Vec<f64>> {
        self.check_input(input)?;
        self.stack
            .backpropagate(&Tensor::from_vec(input.to_vec()), target)
    }

    /// Train on `data` with the network's own [`TrainingConfig`]
    pub fn train(&mut self, data: &ProcessedData) -> Result<TrainingReport> {
        let config = self.config.clone();
        self.train_with_config(data, &config)
    }

    pub fn train_with_config(
        &mut self,
        data: &ProcessedData,
        config: &TrainingConfig,
    ) -> Result<TrainingReport> {
        if !self.active {
            tracing::warn!("{NAME} is not active, training skipped");
            return Err(inactive(NAME));
        }
        if data.is_empty() {
            return Err(Error::InvalidData("training data is empty".into()));
        }
        if let Some((input, _)) = data.iter().find(|(x, _)| x.len() != self.input_size) {
            tracing::warn!(
                expected = self.input_size,
                actual = input.len(),
                "{NAME} rejected training data"
            );
            return Err(Error::shape(&[self.input_size], &[input.len()]));
        }
        let output_width: usize = self
            .stack
            .output_shape_for(&[self.input_size])?
            .iter()
            .product();
        check_target_widths(NAME, data.targets().iter().map(Vec::as_slice), output_width)?;

        self.stack.set_training(true);
        let stack = &mut self.stack;
        let optimizer = &mut self.optimizer;
        let learning_rate = optimizer.learning_rate();
        let samples = data.len() as f64;

        let result = run_epochs(NAME, config, &mut self.progress, learning_rate, || {
            let mut total = 0.0;
            for (input, target) in data.iter() {
                let error = stack.backpropagate(&Tensor::from_vec(input.to_vec()), target)?;
                total += squared_error(&error);
                optimizer.update_weights(stack.layers_mut());
            }
            Ok(total / samples)
        });

        self.stack.set_training(self.training_mode);
        if let Err(e) = &result {
            self.stack.clear_gradients();
            tracing::error!(error = %e, "{NAME} training failed");
        }
        result
    }

    /// Fine-tune on new data with a tenth of the learning rate
    ///
    /// The learning rate is restored afterwards, also when training fails.
    pub fn adapt(&mut self, data: &ProcessedData) -> Result<TrainingReport> {
        let original = self.optimizer.learning_rate();
        self.optimizer.set_learning_rate(original * 0.1);
        let result = self.train(data);
        self.optimizer.set_learning_rate(original);
        result
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

    /// Switch the optimizer algorithm, keeping the learning rate
    pub fn set_optimizer(&mut self, kind: OptimizerType) {
        self.optimizer.set_type(kind);
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Optimizer {
        &mut self.optimizer
    }

    /// Enable or disable dropout and batch statistics
    pub fn set_training_mode(&mut self, training: bool) {
        self.training_mode = training;
        self.stack.set_training(training);
    }

    pub fn training_mode(&self) -> bool {
        self.training_mode
    }

    pub fn training_config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn set_training_config(&mut self, config: TrainingConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Record every following epoch to a CSV file
    pub fn set_logger(&mut self, logger: TrainingLogger) {
        self.progress.logger = Some(logger);
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

    pub fn current_error(&self) -> f64 {
        self.progress.current_error
    }

    /// Milliseconds since the Unix epoch when training last finished
    pub fn last_training(&self) -> Option<u64> {
        self.progress.last_training
    }

    pub fn parameter_count(&self) -> usize {
        self.stack.parameter_count()
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

#[cfg(test)]
mod tests {
    use super::*;

    fn xor() -> ProcessedData {
        ProcessedData::new(
            vec![vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]],
            vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_xor_converges() {
        let mut net = DeepNetwork::new(2).unwrap();
        net.add_dense_layer(16, ActivationFunction::Tanh).unwrap();
        net.add_dense_layer(1, ActivationFunction::Sigmoid).unwrap();
        net.set_learning_rate(0.05);
        net.set_training_config(TrainingConfig {
            max_epochs: 5000,
            min_error: 0.01,
            patience: 500,
            log_every: 0,
        })
        .unwrap();
        net.activate().unwrap();

        let report = net.train(&xor()).unwrap();
        assert!(report.epochs <= 5000);
        assert!(report.final_error < 0.05, "error {}", report.final_error);

        for (input, target) in xor().iter() {
            let out = net.forward(input).unwrap()[0];
            assert_eq!(out > 0.5, target[0] > 0.5, "{input:?} -> {out}");
        }
    }

    #[test]
    fn test_architecture_and_statistics() {
        let mut net = DeepNetwork::new(4).unwrap();
        net.add_dense_layer(8, ActivationFunction::Relu).unwrap();
        net.add_dropout_layer(0.2).unwrap();
        net.add_batch_normalization_layer().unwrap();
        net.add_dense_layer(2, ActivationFunction::Softmax).unwrap();
        assert_eq!(
            net.architecture(),
            "DeepNetwork[Dense -> Dropout -> BatchNormalization -> Dense]"
        );

        let stats = net.statistics();
        assert_eq!(stats.layers, 4);
        assert_eq!(stats.parameters, 4 * 8 + 8 + 2 * 8 + 8 * 2 + 2);
        assert!(!stats.active);
        assert_eq!(stats.optimizer, OptimizerType::Adam);
    }

    #[test]
    fn test_layers_frozen_while_active() {
        let mut net = DeepNetwork::new(2).unwrap();
        assert!(net.activate().is_err());

        net.add_dense_layer(3, ActivationFunction::Relu).unwrap();
        net.activate().unwrap();
        assert!(matches!(
            net.add_dense_layer(1, ActivationFunction::Linear),
            Err(Error::InvalidState(_))
        ));
        assert!(net.remove_last_layer().is_err());

        net.deactivate();
        net.add_dense_layer(1, ActivationFunction::Linear).unwrap();
        assert_eq!(net.layer_count(), 2);
        net.remove_last_layer().unwrap();
        assert_eq!(net.layer_count(), 1);

        net.activate().unwrap();
        net.clear_layers();
        assert!(!net.is_active());
        assert_eq!(net.layer_count(), 0);
    }

    #[test]
    fn test_layer_limit() {
        let mut net = DeepNetwork::new(2).unwrap();
        for _ in 0..MAX_LAYERS {
            net.add_dropout_layer(0.0).unwrap();
        }
        assert!(matches!(net.add_dropout_layer(0.0), Err(Error::Config(_))));
    }

    #[test]
    fn test_inactive_and_wrong_width_rejected() {
        let mut net = DeepNetwork::new(2).unwrap();
        net.add_dense_layer(1, ActivationFunction::Linear).unwrap();
        assert!(matches!(net.forward(&[0.0, 1.0]), Err(Error::InvalidState(_))));
        assert!(net.train(&xor()).is_err());

        net.activate().unwrap();
        assert!(matches!(net.forward(&[1.0]), Err(Error::ShapeMismatch { .. })));
        assert!(net.backward(&[1.0, 0.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_epochs_bounded_and_history_recorded() {
        let mut net = DeepNetwork::new(2).unwrap();
        net.add_dense_layer(2, ActivationFunction::Sigmoid).unwrap();
        net.add_dense_layer(1, ActivationFunction::Sigmoid).unwrap();
        net.activate().unwrap();

        let config = TrainingConfig::default().with_max_epochs(15);
        let report = net.train_with_config(&xor(), &config).unwrap();
        assert!(report.epochs <= 15);
        assert_eq!(net.training_epochs(), report.epochs as u64);
        assert_eq!(net.error_history().len(), report.epochs);
        assert!(net.last_training().is_some());
        assert!(net.statistics().recent_errors.len() <= 10);
    }

    #[test]
    fn test_adapt_restores_learning_rate() {
        let mut net = DeepNetwork::new(2).unwrap();
        net.add_dense_layer(1, ActivationFunction::Sigmoid).unwrap();
        net.set_learning_rate(0.01);
        net.set_training_config(TrainingConfig::default().with_max_epochs(3))
            .unwrap();

        // inactive: adapt fails but must still restore the rate
        assert!(net.adapt(&xor()).is_err());
        assert_eq!(net.learning_rate(), 0.01);

        net.activate().unwrap();
        net.adapt(&xor()).unwrap();
        assert_eq!(net.learning_rate(), 0.01);
    }

    #[test]
    fn test_learning_rate_clamped() {
        let mut net = DeepNetwork::new(1).unwrap();
        net.set_learning_rate(5.0);
        assert_eq!(net.learning_rate(), MAX_LEARNING_RATE);
        net.set_learning_rate(1e-9);
        assert_eq!(net.learning_rate(), MIN_LEARNING_RATE);
    }

    #[test]
    fn test_rejected_training_leaves_weights_intact() {
        let mut net = DeepNetwork::new(2).unwrap();
        net.add_dense_layer(3, ActivationFunction::Tanh).unwrap();
        net.add_dense_layer(1, ActivationFunction::Sigmoid).unwrap();
        net.activate().unwrap();
        let before = net.forward(&[1.0, 1.0]).unwrap();

        // the last target row is too wide
        let data = ProcessedData::new(
            vec![vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]],
            vec![vec![0.0], vec![1.0], vec![1.0, 2.0]],
        )
        .unwrap();
        assert!(matches!(
            net.train(&data),
            Err(Error::ShapeMismatch { .. })
        ));
        assert_eq!(net.forward(&[1.0, 1.0]).unwrap(), before);
        assert_eq!(net.training_epochs(), 0);
        assert_eq!(net.optimizer().iteration(), 0);
    }
}
