//! Stacking Ensemble
//!
//! Base models train on the full data set. Their predictions for every row
//! are concatenated into a meta input, and a separate meta-learner is
//! trained to map those meta inputs to the original targets.
//!
//! ```text
//! meta_input = [p_0[0..k], p_1[0..k], ..., p_n[0..k]]     k = output_classes
//! ```
//!
//! A base model that fails, or returns a different width, contributes its
//! `k` slots zero-filled or truncated, so the meta input width is always
//! `models * k`.

use crate::ensemble::{
    check_training_data, Ensemble, EnsembleCore, EnsembleType, Model, DEFAULT_OUTPUT_CLASSES,
};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct StackingEnsemble {
    core: EnsembleCore,
    meta_learner: Model,
    meta_trained: bool,
}

impl StackingEnsemble {
    pub fn new(meta_learner: impl Into<Model>) -> Self {
        Self::with_output_classes(meta_learner, DEFAULT_OUTPUT_CLASSES)
    }

    pub fn with_output_classes(meta_learner: impl Into<Model>, output_classes: usize) -> Self {
        Self {
            core: EnsembleCore::new(EnsembleType::Stacking, output_classes),
            meta_learner: meta_learner.into(),
            meta_trained: false,
        }
    }

    pub fn meta_learner(&self) -> &Model {
        &self.meta_learner
    }

    /// Replace the meta-learner; the ensemble must be trained again
    pub fn set_meta_learner(&mut self, meta_learner: impl Into<Model>) {
        self.meta_learner = meta_learner.into();
        self.meta_trained = false;
    }

    pub fn is_meta_learner_trained(&self) -> bool {
        self.meta_trained
    }

    fn meta_input(&mut self, input: &[f64]) -> Vec<f64> {
        combine_predictions(&self.core.predictions(input), self.core.output_classes())
    }
}

/// Concatenate predictions into `predictions.len() * classes` values
pub fn combine_predictions(predictions: &[Option<Vec<f64>>], classes: usize) -> Vec<f64> {
    let mut combined = vec![0.0; predictions.len() * classes];
    for (slot, prediction) in combined.chunks_mut(classes).zip(predictions) {
        if let Some(p) = prediction {
            for (s, v) in slot.iter_mut().zip(p) {
                *s = *v;
            }
        }
    }
    combined
}

impl Ensemble for StackingEnsemble {
    fn core(&self) -> &EnsembleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EnsembleCore {
        &mut self.core
    }

    fn predict(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        self.core.ensure_active()?;
        if !self.meta_trained {
            tracing::warn!("stacking prediction requested before training");
            return Err(Error::InvalidState("meta-learner is not trained".into()));
        }
        let meta = self.meta_input(input);
        self.meta_learner.predict(&meta)
    }

    fn train(&mut self, inputs: &[Vec<f64>], targets: &[Vec<f64>], epochs: usize) -> Result<()> {
        self.core.ensure_active()?;
        check_training_data(inputs, targets)?;

        self.core
            .train_models(|_, model| model.train(inputs, targets, epochs))?;

        let meta_inputs: Vec<_> = inputs.iter().map(|row| self.meta_input(row)).collect();
        if let Err(e) = self.meta_learner.train(&meta_inputs, targets, epochs) {
            tracing::error!(error = %e, "meta-learner training failed");
            return Err(e);
        }
        self.meta_trained = true;
        tracing::info!(
            models = self.core.model_count(),
            meta_width = meta_inputs.first().map_or(0, Vec::len),
            "stacking ensemble trained"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::testing::deep_model;

    #[test]
    fn test_combine_pads_and_truncates() {
        let predictions = vec![Some(vec![0.1, 0.9]), None, Some(vec![0.2, 0.3, 0.5]), Some(vec![1.0])];
        assert_eq!(
            combine_predictions(&predictions, 2),
            vec![0.1, 0.9, 0.0, 0.0, 0.2, 0.3, 1.0, 0.0]
        );
    }

    #[test]
    fn test_predict_requires_training() {
        let mut stacking = StackingEnsemble::new(deep_model(4, 2));
        stacking.core_mut().add_model(deep_model(2, 2)).unwrap();
        stacking.core_mut().add_model(deep_model(2, 2)).unwrap();
        assert!(stacking.train(&[vec![0.0, 1.0]], &[vec![1.0, 0.0]], 1).is_err());
        stacking.core_mut().activate().unwrap();
        assert!(matches!(
            stacking.predict(&[0.0, 1.0]),
            Err(Error::InvalidState(_))
        ));

        let inputs = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let targets = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        stacking.train(&inputs, &targets, 5).unwrap();
        assert!(stacking.is_meta_learner_trained());
        assert_eq!(stacking.predict(&[0.0, 1.0]).unwrap().len(), 2);
        assert_eq!(stacking.kind(), EnsembleType::Stacking);

        stacking.set_meta_learner(deep_model(4, 2));
        assert!(!stacking.is_meta_learner_trained());
        assert!(stacking.predict(&[0.0, 1.0]).is_err());
    }

    #[test]
    fn test_meta_learner_width_mismatch_fails_training() {
        // two base models with two classes need a four-input meta-learner
        let mut stacking = StackingEnsemble::new(deep_model(3, 2));
        stacking.core_mut().add_model(deep_model(2, 2)).unwrap();
        stacking.core_mut().add_model(deep_model(2, 2)).unwrap();
        stacking.core_mut().activate().unwrap();
        assert!(stacking
            .train(&[vec![0.0, 1.0]], &[vec![1.0, 0.0]], 1)
            .is_err());
        assert!(!stacking.is_meta_learner_trained());
    }
}
