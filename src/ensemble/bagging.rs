//! Bagging Ensemble
//!
//! Bootstrap aggregating: each model trains on rows drawn with replacement
//! from the training set, and predictions are averaged.

use rand::Rng;

use crate::ensemble::{
    check_training_data, Ensemble, EnsembleCore, EnsembleType, DEFAULT_OUTPUT_CLASSES,
};
use crate::error::Result;

pub const MIN_SAMPLE_SIZE: f64 = 0.1;
pub const MAX_SAMPLE_SIZE: f64 = 1.0;
pub const DEFAULT_SAMPLE_SIZE: f64 = 0.8;

#[derive(Debug)]
pub struct BaggingEnsemble {
    core: EnsembleCore,
    sample_size: f64,
}

impl BaggingEnsemble {
    /// `sample_size` is the bootstrap fraction, clamped to `[0.1, 1.0]`
    pub fn new(sample_size: f64) -> Self {
        Self::with_output_classes(sample_size, DEFAULT_OUTPUT_CLASSES)
    }

    pub fn with_output_classes(sample_size: f64, output_classes: usize) -> Self {
        Self {
            core: EnsembleCore::new(EnsembleType::Bagging, output_classes),
            sample_size: clamp_sample_size(sample_size),
        }
    }

    pub fn sample_size(&self) -> f64 {
        self.sample_size
    }

    pub fn set_sample_size(&mut self, sample_size: f64) {
        self.sample_size = clamp_sample_size(sample_size);
    }

    /// Row indices of one bootstrap sample over `n` rows
    ///
    /// Draws `floor(n * sample_size)` indices (at least one) with
    /// replacement. Empty when `n` is zero.
    pub fn bootstrap_sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<usize> {
        if n == 0 {
            return Vec::new();
        }
        let size = ((n as f64 * self.sample_size).floor() as usize).max(1);
        (0..size).map(|_| rng.random_range(0..n)).collect()
    }
}

impl Default for BaggingEnsemble {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE)
    }
}

fn clamp_sample_size(sample_size: f64) -> f64 {
    if sample_size.is_nan() {
        DEFAULT_SAMPLE_SIZE
    } else {
        sample_size.clamp(MIN_SAMPLE_SIZE, MAX_SAMPLE_SIZE)
    }
}

impl Ensemble for BaggingEnsemble {
    fn core(&self) -> &EnsembleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EnsembleCore {
        &mut self.core
    }

    /// Mean of every prediction with exactly `output_classes` values
    ///
    /// Returns zeros when no model produced a usable prediction.
    fn predict(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        self.core.ensure_active()?;
        let classes = self.core.output_classes();
        let mut sum = vec![0.0; classes];
        let mut valid = 0;
        for prediction in self.core.predictions(input).into_iter().flatten() {
            if prediction.len() != classes {
                continue;
            }
            for (s, p) in sum.iter_mut().zip(&prediction) {
                *s += p;
            }
            valid += 1;
        }
        if valid > 0 {
            sum.iter_mut().for_each(|s| *s /= valid as f64);
        }
        Ok(sum)
    }

    fn train(&mut self, inputs: &[Vec<f64>], targets: &[Vec<f64>], epochs: usize) -> Result<()> {
        self.core.ensure_active()?;
        check_training_data(inputs, targets)?;

        let mut rng = rand::rng();
        let mut samples = Vec::with_capacity(self.core.model_count());
        for _ in 0..self.core.model_count() {
            samples.push(self.bootstrap_sample(inputs.len(), &mut rng));
        }

        self.core.train_models(|i, model| {
            let indices = &samples[i];
            let sample_inputs: Vec<_> = indices.iter().map(|&r| inputs[r].clone()).collect();
            let sample_targets: Vec<_> = indices.iter().map(|&r| targets[r].clone()).collect();
            tracing::debug!(model = i, rows = indices.len(), "training on bootstrap sample");
            model.train(&sample_inputs, &sample_targets, epochs)
        })?;
        tracing::info!(
            models = self.core.model_count(),
            sample_size = self.sample_size,
            "bagging ensemble trained"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::testing::deep_model;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sample_size_clamped() {
        assert_eq!(BaggingEnsemble::new(0.0).sample_size(), MIN_SAMPLE_SIZE);
        assert_eq!(BaggingEnsemble::new(3.0).sample_size(), MAX_SAMPLE_SIZE);
        assert_eq!(BaggingEnsemble::default().sample_size(), DEFAULT_SAMPLE_SIZE);
    }

    #[test]
    fn test_bootstrap_size() {
        let bagging = BaggingEnsemble::new(0.5);
        let mut rng = StdRng::seed_from_u64(7);
        let sample = bagging.bootstrap_sample(100, &mut rng);
        assert_eq!(sample.len(), 50);
        assert!(sample.iter().all(|&i| i < 100));

        // never empty for a non-empty set
        assert_eq!(BaggingEnsemble::new(0.1).bootstrap_sample(3, &mut rng).len(), 1);
        assert!(bagging.bootstrap_sample(0, &mut rng).is_empty());
    }

    #[test]
    fn test_bootstrap_draws_with_replacement() {
        let bagging = BaggingEnsemble::new(1.0);
        let mut rng = StdRng::seed_from_u64(11);
        let sample = bagging.bootstrap_sample(50, &mut rng);
        let mut unique = sample.clone();
        unique.sort_unstable();
        unique.dedup();
        // 50 draws from 50 rows repeat some row with overwhelming probability
        assert!(unique.len() < sample.len());
    }

    #[test]
    fn test_predict_averages_valid_predictions() {
        let mut bagging = BaggingEnsemble::new(0.8);
        bagging.core_mut().add_model(deep_model(2, 2)).unwrap();
        bagging.core_mut().add_model(deep_model(2, 2)).unwrap();
        // wrong output width, ignored
        bagging.core_mut().add_model(deep_model(2, 3)).unwrap();
        bagging.core_mut().activate().unwrap();

        let p = bagging.predict(&[0.3, 0.7]).unwrap();
        let mut expected = vec![0.0; 2];
        for model in &mut bagging.core_mut().models_mut()[..2] {
            for (e, v) in expected.iter_mut().zip(model.predict(&[0.3, 0.7]).unwrap()) {
                *e += v / 2.0;
            }
        }
        for (a, b) in p.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_no_valid_prediction_gives_zeros() {
        let mut bagging = BaggingEnsemble::with_output_classes(0.8, 4);
        bagging.core_mut().add_model(deep_model(2, 2)).unwrap();
        bagging.core_mut().add_model(deep_model(2, 2)).unwrap();
        bagging.core_mut().activate().unwrap();
        assert_eq!(bagging.predict(&[0.0, 0.0]).unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_train_runs_every_model() {
        let mut bagging = BaggingEnsemble::new(0.5);
        bagging.core_mut().add_model(deep_model(2, 2)).unwrap();
        bagging.core_mut().add_model(deep_model(2, 2)).unwrap();
        assert!(bagging.train(&[vec![0.0, 1.0]], &[vec![1.0, 0.0]], 2).is_err());
        bagging.core_mut().activate().unwrap();

        let inputs: Vec<_> = (0..10).map(|i| vec![i as f64 / 10.0, 1.0]).collect();
        let targets: Vec<_> = (0..10).map(|i| vec![(i % 2) as f64, 0.0]).collect();
        bagging.train(&inputs, &targets, 3).unwrap();
        for model in bagging.core().models() {
            match model {
                crate::ensemble::Model::Flat(net) => assert!(net.training_epochs() >= 1),
                _ => unreachable!(),
            }
        }
    }
}
