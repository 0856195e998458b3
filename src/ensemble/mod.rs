//! Ensemble Models
//!
//! Combine several trained networks into one predictor.
//!
//! - **bagging**: every model trains on its own bootstrap sample, predictions
//!   are averaged
//! - **voting**: hard (majority class) or soft (weighted probabilities)
//! - **stacking**: a meta-learner is trained on the concatenated base
//!   predictions
//!
//! All ensembles work on flat `f64` vectors. [`Model`] adapts each network
//! kind to that interface.

pub mod bagging;
pub mod stacking;
pub mod voting;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::ProcessedData;
use crate::error::{Error, Result};
use crate::network::{ConvNetwork, DeepNetwork, RecurrentNetwork};
use crate::tensor::Tensor;

pub use bagging::BaggingEnsemble;
pub use stacking::StackingEnsemble;
pub use voting::{VotingEnsemble, VotingType};

pub const MIN_MODELS: usize = 2;
pub const MAX_MODELS: usize = 20;
pub const MIN_OUTPUT_CLASSES: usize = 2;
pub const MAX_OUTPUT_CLASSES: usize = 1000;
pub const DEFAULT_OUTPUT_CLASSES: usize = 2;

/// A network usable as an ensemble member
#[derive(Debug)]
pub enum Model {
    Flat(DeepNetwork),
    /// Inputs are reshaped to the network's image shape
    Image(ConvNetwork),
    /// Inputs become one-step sequences
    Sequence(RecurrentNetwork),
}

impl Model {
    pub fn name(&self) -> &'static str {
        match self {
            Model::Flat(_) => "DeepNetwork",
            Model::Image(_) => "ConvNetwork",
            Model::Sequence(_) => "RecurrentNetwork",
        }
    }

    pub fn predict(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        match self {
            Model::Flat(net) => net.forward(input),
            Model::Image(net) => net.forward(&image_from(net, input)?),
            Model::Sequence(net) => net
                .forward(&[input.to_vec()])?
                .into_iter()
                .next()
                .ok_or_else(|| Error::InvalidState("recurrent model returned no steps".into())),
        }
    }

    /// Train for `epochs` epochs on row-aligned inputs and targets
    ///
    /// Zero epochs is a no-op.
    pub fn train(
        &mut self,
        inputs: &[Vec<f64>],
        targets: &[Vec<f64>],
        epochs: usize,
    ) -> Result<()> {
        if epochs == 0 {
            return Ok(());
        }
        match self {
            Model::Flat(net) => {
                let data = ProcessedData::new(inputs.to_vec(), targets.to_vec())?;
                let config = net.training_config().clone().with_max_epochs(epochs);
                net.train_with_config(&data, &config)?;
            }
            Model::Image(net) => {
                let images = inputs
                    .iter()
                    .map(|row| image_from(net, row))
                    .collect::<Result<Vec<_>>>()?;
                net.train(&images, targets, epochs)?;
            }
            Model::Sequence(net) => {
                let steps = |rows: &[Vec<f64>]| -> Vec<_> {
                    rows.iter().map(|row| vec![row.clone()]).collect()
                };
                net.train(&steps(inputs), &steps(targets), epochs)?;
            }
        }
        Ok(())
    }
}

fn image_from(net: &ConvNetwork, input: &[f64]) -> Result<Tensor> {
    Tensor::new(input.to_vec(), net.input_shape().dims().to_vec())
}

impl From<DeepNetwork> for Model {
    fn from(net: DeepNetwork) -> Self {
        Model::Flat(net)
    }
}

impl From<ConvNetwork> for Model {
    fn from(net: ConvNetwork) -> Self {
        Model::Image(net)
    }
}

impl From<RecurrentNetwork> for Model {
    fn from(net: RecurrentNetwork) -> Self {
        Model::Sequence(net)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleType {
    Voting,
    Stacking,
    Bagging,
}

impl fmt::Display for EnsembleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnsembleType::Voting => "Voting",
            EnsembleType::Stacking => "Stacking",
            EnsembleType::Bagging => "Bagging",
        })
    }
}

/// Summary of an ensemble for reporting
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnsembleStats {
    pub kind: EnsembleType,
    pub models: usize,
    pub active: bool,
    pub weights: Vec<f64>,
    pub output_classes: usize,
}

/// Model list, weights and activation state shared by every ensemble
#[derive(Debug)]
pub struct EnsembleCore {
    kind: EnsembleType,
    models: Vec<Model>,
    weights: Vec<f64>,
    output_classes: usize,
    active: bool,
}

impl EnsembleCore {
    pub fn new(kind: EnsembleType, output_classes: usize) -> Self {
        Self {
            kind,
            models: Vec::new(),
            weights: Vec::new(),
            output_classes: output_classes.clamp(MIN_OUTPUT_CLASSES, MAX_OUTPUT_CLASSES),
            active: false,
        }
    }

    pub fn add_model(&mut self, model: impl Into<Model>) -> Result<()> {
        let model = model.into();
        if self.active {
            tracing::warn!(ensemble = %self.kind, "cannot add models to an active ensemble");
            return Err(Error::InvalidState(format!(
                "{} ensemble is active",
                self.kind
            )));
        }
        if self.models.len() >= MAX_MODELS {
            tracing::warn!(ensemble = %self.kind, max = MAX_MODELS, "model limit reached");
            return Err(Error::Config(format!(
                "an ensemble holds at most {MAX_MODELS} models"
            )));
        }
        tracing::info!(
            ensemble = %self.kind,
            model = model.name(),
            total = self.models.len() + 1,
            "model added"
        );
        self.models.push(model);
        Ok(())
    }

    pub fn remove_model(&mut self, index: usize) -> Result<Model> {
        if self.active {
            return Err(Error::InvalidState(format!(
                "{} ensemble is active",
                self.kind
            )));
        }
        if index >= self.models.len() {
            tracing::warn!(ensemble = %self.kind, index, "invalid model index");
            return Err(Error::Config(format!(
                "no model at index {index} (have {})",
                self.models.len()
            )));
        }
        Ok(self.models.remove(index))
    }

    /// Drop every model and deactivate
    pub fn clear_models(&mut self) {
        self.models.clear();
        self.weights.clear();
        self.active = false;
    }

    /// Activate with uniform weights; needs at least two models
    pub fn activate(&mut self) -> Result<()> {
        let count = self.models.len();
        if count < MIN_MODELS {
            tracing::warn!(
                ensemble = %self.kind,
                have = count,
                need = MIN_MODELS,
                "not enough models to activate"
            );
            return Err(Error::InvalidState(format!(
                "an ensemble needs at least {MIN_MODELS} models, has {count}"
            )));
        }
        self.weights = vec![1.0 / count as f64; count];
        self.active = true;
        tracing::info!(ensemble = %self.kind, models = count, "ensemble activated");
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{} ensemble is not active",
                self.kind
            )))
        }
    }

    /// Set per-model weights, normalized to sum to one
    ///
    /// Weights must be non-negative and match the model count. All-zero
    /// weights fall back to uniform.
    pub fn set_model_weights(&mut self, weights: &[f64]) -> Result<()> {
        if weights.len() != self.models.len() {
            return Err(Error::shape(&[self.models.len()], &[weights.len()]));
        }
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(Error::Config(format!(
                "model weights must be finite and non-negative, got {w}"
            )));
        }
        let total: f64 = weights.iter().sum();
        self.weights = if total > 0.0 {
            weights.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / weights.len().max(1) as f64; weights.len()]
        };
        Ok(())
    }

    pub fn model_weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [Model] {
        &mut self.models
    }

    pub fn output_classes(&self) -> usize {
        self.output_classes
    }

    /// Clamped to `[2, 1000]`
    pub fn set_output_classes(&mut self, output_classes: usize) {
        self.output_classes = output_classes.clamp(MIN_OUTPUT_CLASSES, MAX_OUTPUT_CLASSES);
    }

    pub fn kind(&self) -> EnsembleType {
        self.kind
    }

    /// Every model's prediction in insertion order; failures are logged and
    /// come back as `None`
    pub(crate) fn predictions(&mut self, input: &[f64]) -> Vec<Option<Vec<f64>>> {
        let kind = self.kind;
        self.models
            .iter_mut()
            .enumerate()
            .map(|(i, model)| match model.predict(input) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(ensemble = %kind, model = i, error = %e, "model prediction failed");
                    None
                }
            })
            .collect()
    }

    /// Run `train_one` for every model in insertion order
    ///
    /// A failing model is logged and skipped; the call only fails when no
    /// model trained.
    pub(crate) fn train_models<F>(&mut self, mut train_one: F) -> Result<()>
    where
        F: FnMut(usize, &mut Model) -> Result<()>,
    {
        let kind = self.kind;
        let mut trained = 0;
        let mut last_error = None;
        for (i, model) in self.models.iter_mut().enumerate() {
            match train_one(i, model) {
                Ok(()) => trained += 1,
                Err(e) => {
                    tracing::warn!(ensemble = %kind, model = i, error = %e, "model training failed");
                    last_error = Some(e);
                }
            }
        }
        match (trained, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn statistics(&self) -> EnsembleStats {
        EnsembleStats {
            kind: self.kind,
            models: self.models.len(),
            active: self.active,
            weights: self.weights.clone(),
            output_classes: self.output_classes,
        }
    }
}

/// Shared interface of the ensemble strategies
pub trait Ensemble {
    fn core(&self) -> &EnsembleCore;

    fn core_mut(&mut self) -> &mut EnsembleCore;

    fn predict(&mut self, input: &[f64]) -> Result<Vec<f64>>;

    fn train(&mut self, inputs: &[Vec<f64>], targets: &[Vec<f64>], epochs: usize) -> Result<()>;

    fn kind(&self) -> EnsembleType {
        self.core().kind()
    }
}

/// Shared argument check for ensemble `train`
pub(crate) fn check_training_data(inputs: &[Vec<f64>], targets: &[Vec<f64>]) -> Result<()> {
    if inputs.len() != targets.len() || inputs.is_empty() {
        return Err(Error::InvalidData(format!(
            "need the same non-zero number of input and target rows, got {} and {}",
            inputs.len(),
            targets.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::activation::ActivationFunction;

    /// Small active deep network `inputs -> 4 -> outputs`
    pub fn deep_model(inputs: usize, outputs: usize) -> Model {
        let mut net = DeepNetwork::new(inputs).unwrap();
        net.add_dense_layer(4, ActivationFunction::Tanh).unwrap();
        net.add_dense_layer(outputs, ActivationFunction::Sigmoid).unwrap();
        net.set_learning_rate(0.05);
        net.activate().unwrap();
        Model::Flat(net)
    }
}
