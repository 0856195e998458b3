//! Fixed-topology perceptron
//!
//! `input → hidden × n → output`, all dense, trained with plain gradient
//! steps. Inputs are clamped to `[0, 1]` before every pass, matching the
//! output of [`crate::DataNormalizer`].

use serde::{Deserialize, Serialize};

use crate::activation::ActivationFunction;
use crate::config::TrainingConfig;
use crate::data::ProcessedData;
use crate::error::{Error, Result};
use crate::layers::Dense;
use crate::network::trainer::{
    run_epochs, squared_error, ErrorHistory, TrainingReport, TrainingState,
};
use crate::network::{check_target_widths, inactive, LayerStack, NetworkStats};
use crate::optimizer::{Optimizer, OptimizerType};
use crate::tensor::{argmax, Tensor};

pub const DEFAULT_LEARNING_RATE: f64 = 0.1;
pub const MIN_LEARNING_RATE: f64 = 0.001;
pub const MAX_LEARNING_RATE: f64 = 1.0;

const NAME: &str = "NeuralNetwork";

/// Layer widths and activations of a [`NeuralNetwork`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatTopology {
    pub input_size: usize,
    pub hidden_layers: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    pub hidden_activation: ActivationFunction,
    pub output_activation: ActivationFunction,
}

impl Default for FlatTopology {
    fn default() -> Self {
        Self {
            input_size: 10,
            hidden_layers: 2,
            hidden_size: 8,
            output_size: 5,
            hidden_activation: ActivationFunction::Sigmoid,
            output_activation: ActivationFunction::Sigmoid,
        }
    }
}

impl FlatTopology {
    pub fn new(
        input_size: usize,
        hidden_layers: usize,
        hidden_size: usize,
        output_size: usize,
    ) -> Self {
        Self {
            input_size,
            hidden_layers,
            hidden_size,
            output_size,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let dims = [
            self.input_size,
            self.hidden_layers,
            self.hidden_size,
            self.output_size,
        ];
        if dims.contains(&0) {
            return Err(Error::Config(format!(
                "every topology dimension must be at least 1, got {self}"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for FlatTopology {
    /// `10-2x8-5`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}x{}-{}",
            self.input_size, self.hidden_layers, self.hidden_size, self.output_size
        )
    }
}

/// Small fully connected network with a fixed shape
#[derive(Debug)]
pub struct NeuralNetwork {
    topology: FlatTopology,
    stack: LayerStack,
    optimizer: Optimizer,
    config: TrainingConfig,
    progress: TrainingState,
    active: bool,
}

impl NeuralNetwork {
    pub fn new(topology: FlatTopology) -> Result<Self> {
        topology.validate()?;

        let mut stack = LayerStack::default();
        let mut width = topology.input_size;
        for _ in 0..topology.hidden_layers {
            stack.push(
                Box::new(Dense::new(topology.hidden_size, topology.hidden_activation)?),
                &[width],
            )?;
            width = topology.hidden_size;
        }
        stack.push(
            Box::new(Dense::new(topology.output_size, topology.output_activation)?),
            &[width],
        )?;

        tracing::info!(architecture = %topology, "{NAME} created");
        Ok(Self {
            topology,
            stack,
            optimizer: Optimizer::new(OptimizerType::Sgd, DEFAULT_LEARNING_RATE),
            config: TrainingConfig::flat(),
            progress: TrainingState::default(),
            active: false,
        })
    }

    pub fn topology(&self) -> &FlatTopology {
        &self.topology
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn clamp_input(&self, input: &[f64]) -> Result<Tensor> {
        if input.len() != self.topology.input_size {
            return Err(Error::shape(&[self.topology.input_size], &[input.len()]));
        }
        Ok(Tensor::from_vec(
            input
                .iter()
                .map(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) })
                .collect(),
        ))
    }

    pub fn forward(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        if !self.active {
            return Err(inactive(NAME));
        }
        let input = self.clamp_input(input)?;
        Ok(self.stack.forward(&input)?.into_vec())
    }

    /// Index of the largest output
    pub fn predict_class(&mut self, input: &[f64]) -> Result<usize> {
        let output = self.forward(input)?;
        argmax(&output).ok_or_else(|| Error::Numeric("network produced no output".into()))
    }

    pub fn train(&mut self, data: &ProcessedData) -> Result<TrainingReport> {
        if !self.active {
            tracing::warn!("{NAME} is not active, training skipped");
            return Err(inactive(NAME));
        }
        if data.is_empty() {
            return Err(Error::InvalidData("training data is empty".into()));
        }
        let inputs = data
            .inputs()
            .iter()
            .map(|row| self.clamp_input(row))
            .collect::<Result<Vec<_>>>()?;
        check_target_widths(
            NAME,
            data.targets().iter().map(Vec::as_slice),
            self.topology.output_size,
        )?;

        let stack = &mut self.stack;
        let optimizer = &mut self.optimizer;
        let learning_rate = optimizer.learning_rate();
        let samples = data.len() as f64;

        let result = run_epochs(NAME, &self.config, &mut self.progress, learning_rate, || {
            let mut total = 0.0;
            for (input, target) in inputs.iter().zip(data.targets()) {
                let error = stack.backpropagate(input, target)?;
                total += squared_error(&error);
                optimizer.update_weights(stack.layers_mut());
            }
            Ok(total / samples)
        });
        if let Err(e) = &result {
            self.stack.clear_gradients();
            tracing::error!(error = %e, "{NAME} training failed");
        }
        result
    }

    /// Train with a tenth of the learning rate, restoring it afterwards
    pub fn adapt(&mut self, data: &ProcessedData) -> Result<TrainingReport> {
        let original = self.optimizer.learning_rate();
        self.optimizer.set_learning_rate(original * 0.1);
        let result = self.train(data);
        self.optimizer.set_learning_rate(original);
        result
    }

    /// Set the learning rate, clamped to `[0.001, 1]`
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        let lr = if learning_rate.is_nan() {
            DEFAULT_LEARNING_RATE
        } else {
            learning_rate.clamp(MIN_LEARNING_RATE, MAX_LEARNING_RATE)
        };
        self.optimizer.set_learning_rate(lr);
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_training_config(&mut self, config: TrainingConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn architecture(&self) -> String {
        self.topology.to_string()
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
