//! Voting Ensemble
//!
//! Every model trains on the full data set. At prediction time the models
//! either vote for their top class (hard) or their output vectors are
//! blended with the model weights (soft).

use serde::{Deserialize, Serialize};

use crate::ensemble::{
    check_training_data, Ensemble, EnsembleCore, EnsembleType, DEFAULT_OUTPUT_CLASSES,
};
use crate::error::Result;
use crate::tensor::argmax;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingType {
    /// Share of votes per argmax class
    Hard,
    /// Weighted mean of output vectors, normalized to sum to one
    #[default]
    Soft,
}

#[derive(Debug)]
pub struct VotingEnsemble {
    core: EnsembleCore,
    voting: VotingType,
}

impl VotingEnsemble {
    pub fn new(voting: VotingType) -> Self {
        Self::with_output_classes(voting, DEFAULT_OUTPUT_CLASSES)
    }

    pub fn with_output_classes(voting: VotingType, output_classes: usize) -> Self {
        Self {
            core: EnsembleCore::new(EnsembleType::Voting, output_classes),
            voting,
        }
    }

    pub fn voting_type(&self) -> VotingType {
        self.voting
    }

    pub fn set_voting_type(&mut self, voting: VotingType) {
        self.voting = voting;
    }
}

impl Ensemble for VotingEnsemble {
    fn core(&self) -> &EnsembleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EnsembleCore {
        &mut self.core
    }

    fn predict(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        self.core.ensure_active()?;
        let predictions = self.core.predictions(input);
        let classes = self.core.output_classes();
        Ok(match self.voting {
            VotingType::Hard => hard_vote(&predictions, classes),
            VotingType::Soft => soft_vote(&predictions, self.core.model_weights(), classes),
        })
    }

    fn train(&mut self, inputs: &[Vec<f64>], targets: &[Vec<f64>], epochs: usize) -> Result<()> {
        self.core.ensure_active()?;
        check_training_data(inputs, targets)?;
        self.core
            .train_models(|_, model| model.train(inputs, targets, epochs))?;
        tracing::info!(models = self.core.model_count(), epochs, "voting ensemble trained");
        Ok(())
    }
}

/// Normalized histogram of each prediction's argmax class
///
/// Missing predictions and classes outside `0..classes` cast no vote. With
/// no votes at all the result is all zeros.
pub fn hard_vote(predictions: &[Option<Vec<f64>>], classes: usize) -> Vec<f64> {
    let mut votes = vec![0.0; classes];
    for prediction in predictions.iter().flatten() {
        if let Some(class) = argmax(prediction).filter(|&c| c < classes) {
            votes[class] += 1.0;
        }
    }
    let total: f64 = votes.iter().sum();
    if total > 0.0 {
        votes.iter_mut().for_each(|v| *v /= total);
    }
    votes
}

/// Weighted mean of the full-length predictions, rescaled to sum to one
///
/// `weights[i]` belongs to the model that produced `predictions[i]`. A zero
/// sum gives the uniform distribution; no valid prediction gives zeros.
pub fn soft_vote(predictions: &[Option<Vec<f64>>], weights: &[f64], classes: usize) -> Vec<f64> {
    let mut blended = vec![0.0; classes];
    let mut valid = 0;
    for (i, prediction) in predictions.iter().enumerate() {
        let Some(p) = prediction.as_ref().filter(|p| p.len() == classes) else {
            continue;
        };
        let w = weights.get(i).copied().unwrap_or(0.0);
        for (b, v) in blended.iter_mut().zip(p) {
            *b += v * w;
        }
        valid += 1;
    }
    if valid == 0 {
        return blended;
    }

    blended.iter_mut().for_each(|b| *b /= valid as f64);
    let sum: f64 = blended.iter().sum();
    if sum == 0.0 {
        vec![1.0 / classes as f64; classes]
    } else {
        blended.iter().map(|b| b / sum).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::testing::deep_model;

    #[test]
    fn test_hard_vote_counts_argmax() {
        let predictions = vec![
            Some(vec![1.0, 0.0]),
            Some(vec![1.0, 0.0]),
            Some(vec![0.0, 1.0]),
        ];
        let result = hard_vote(&predictions, 2);
        assert!((result[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((result[1] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_hard_vote_ignores_missing_and_out_of_range() {
        let predictions = vec![None, Some(vec![0.0, 0.0, 5.0]), Some(vec![0.2, 0.9])];
        assert_eq!(hard_vote(&predictions, 2), vec![0.0, 1.0]);
        assert_eq!(hard_vote(&[None], 3), vec![0.0; 3]);
    }

    #[test]
    fn test_soft_vote_weights_by_model_position() {
        let predictions = vec![Some(vec![1.0, 0.0]), None, Some(vec![0.0, 1.0])];
        let result = soft_vote(&predictions, &[0.25, 0.5, 0.75], 2);
        assert!((result[0] - 0.25).abs() < 1e-12);
        assert!((result[1] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_soft_vote_degenerate_cases() {
        let zeros = vec![Some(vec![0.0, 0.0, 0.0])];
        assert_eq!(soft_vote(&zeros, &[1.0], 3), vec![1.0 / 3.0; 3]);
        assert_eq!(soft_vote(&[Some(vec![1.0])], &[1.0], 2), vec![0.0, 0.0]);
    }

    #[test]
    fn test_predict_and_train_need_activation() {
        let mut ensemble = VotingEnsemble::new(VotingType::Soft);
        ensemble.core_mut().add_model(deep_model(2, 2)).unwrap();
        ensemble.core_mut().add_model(deep_model(2, 2)).unwrap();
        assert!(ensemble.predict(&[0.0, 1.0]).is_err());
        assert!(ensemble.train(&[vec![0.0, 1.0]], &[vec![1.0, 0.0]], 1).is_err());

        ensemble.core_mut().activate().unwrap();
        ensemble
            .train(&[vec![0.0, 1.0], vec![1.0, 0.0]], &[vec![1.0, 0.0], vec![0.0, 1.0]], 5)
            .unwrap();
        let p = ensemble.predict(&[0.0, 1.0]).unwrap();
        assert_eq!(p.len(), 2);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(ensemble.kind(), EnsembleType::Voting);

        ensemble.set_voting_type(VotingType::Hard);
        let votes = ensemble.predict(&[0.0, 1.0]).unwrap();
        assert!((votes.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_failing_models_do_not_break_prediction() {
        let mut ensemble = VotingEnsemble::new(VotingType::Hard);
        ensemble.core_mut().add_model(deep_model(2, 2)).unwrap();
        // expects three inputs, fails on every two-value row
        ensemble.core_mut().add_model(deep_model(3, 2)).unwrap();
        ensemble.core_mut().activate().unwrap();

        let votes = ensemble.predict(&[0.5, 0.5]).unwrap();
        assert_eq!(votes.iter().sum::<f64>(), 1.0);
        ensemble.train(&[vec![0.5, 0.5]], &[vec![1.0, 0.0]], 2).unwrap();
    }
}
