//! Epoch loop shared by the network containers
//!
//! A container supplies a closure that runs one pass over its data and
//! returns the epoch error; [`run_epochs`] decides when to stop, keeps the
//! error history and emits progress.
//!
//! ## Stopping Rules
//!
//! ```text
//! while epochs < max_epochs && error > min_error && stale < patience:
//!     error = run_epoch()
//!     stale = (error >= previous) ? stale + 1 : 0
//! ```

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::TrainingConfig;
use crate::error::{Error, Result};
use crate::training_logger::TrainingLogger;

/// Most recent epoch errors kept per network
pub const MAX_ERROR_HISTORY: usize = 1000;

/// Outcome of one `train` call
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrainingReport {
    /// Epochs run by this call
    pub epochs: usize,
    pub final_error: f64,
    /// Stopped because the error stopped improving
    pub stopped_early: bool,
    /// Reached `min_error`
    pub converged: bool,
}

impl TrainingReport {
    /// Report for a call that ran no epochs
    pub fn idle(state: &TrainingState) -> Self {
        Self {
            epochs: 0,
            final_error: state.current_error,
            stopped_early: false,
            converged: false,
        }
    }
}

/// Fixed-capacity ring buffer of epoch errors
#[derive(Clone, Debug)]
pub struct ErrorHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl ErrorHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity.min(MAX_ERROR_HISTORY)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, error: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(error);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    /// The last `n` values, oldest first
    pub fn recent(&self, n: usize) -> Vec<f64> {
        let skip = self.values.len().saturating_sub(n);
        self.values.iter().skip(skip).copied().collect()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl Default for ErrorHistory {
    fn default() -> Self {
        Self::new(MAX_ERROR_HISTORY)
    }
}

/// Training bookkeeping owned by every container
#[derive(Debug, Default)]
pub struct TrainingState {
    pub history: ErrorHistory,
    pub total_epochs: u64,
    pub current_error: f64,
    /// Milliseconds since the Unix epoch when the last `train` call finished
    pub last_training: Option<u64>,
    pub logger: Option<TrainingLogger>,
}

/// Run epochs until a stopping rule fires
///
/// `run_epoch` performs one full pass and returns its error. A non-finite
/// error aborts training with [`Error::Numeric`].
pub fn run_epochs<F>(
    network: &str,
    config: &TrainingConfig,
    state: &mut TrainingState,
    learning_rate: f64,
    mut run_epoch: F,
) -> Result<TrainingReport>
where
    F: FnMut() -> Result<f64>,
{
    config.validate()?;

    let mut epochs = 0;
    let mut error = f64::MAX;
    let mut previous = f64::MAX;
    let mut stale = 0;

    while epochs < config.max_epochs && error > config.min_error && stale < config.patience {
        error = run_epoch()?;
        if !error.is_finite() {
            tracing::error!(network, epoch = epochs + 1, "epoch error is not finite");
            return Err(Error::Numeric(format!(
                "{network} epoch {} produced error {error}",
                epochs + 1
            )));
        }

        state.history.push(error);
        state.total_epochs += 1;
        state.current_error = error;

        if error >= previous {
            stale += 1;
        } else {
            stale = 0;
        }
        previous = error;
        epochs += 1;

        if let Some(logger) = state.logger.as_mut() {
            logger.log(state.total_epochs as usize, learning_rate, error)?;
        }
        if config.log_every > 0 && epochs % config.log_every == 0 {
            tracing::debug!(network, epoch = epochs, error, "training progress");
        }
    }

    state.last_training = Some(crate::data::now_millis());
    let converged = error <= config.min_error;
    let report = TrainingReport {
        epochs,
        final_error: error,
        stopped_early: !converged && stale >= config.patience,
        converged,
    };
    tracing::info!(
        network,
        epochs,
        error = format_args!("{error:.6}"),
        converged,
        stopped_early = report.stopped_early,
        "training completed"
    );
    Ok(report)
}

/// `Σ (target - output)²`
pub fn squared_error(errors: &[f64]) -> f64 {
    errors.iter().map(|e| e * e).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_epochs: usize, min_error: f64, patience: usize) -> TrainingConfig {
        TrainingConfig {
            max_epochs,
            min_error,
            patience,
            log_every: 0,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = ErrorHistory::new(3);
        for e in [1.0, 2.0, 3.0, 4.0] {
            history.push(e);
        }
        assert_eq!(history.to_vec(), vec![2.0, 3.0, 4.0]);
        assert_eq!(history.recent(2), vec![3.0, 4.0]);
        assert_eq!(history.last(), Some(4.0));
    }

    #[test]
    fn test_stops_at_max_epochs() {
        let mut state = TrainingState::default();
        let mut e = 1.0;
        let report = run_epochs("test", &config(25, 0.0, 100), &mut state, 0.1, || {
            e *= 0.9;
            Ok(e)
        })
        .unwrap();
        assert_eq!(report.epochs, 25);
        assert!(!report.converged && !report.stopped_early);
        assert_eq!(state.total_epochs, 25);
        assert_eq!(state.history.len(), 25);
    }

    #[test]
    fn test_stops_when_converged() {
        let mut state = TrainingState::default();
        let mut e = 1.0;
        let report = run_epochs("test", &config(1000, 0.1, 100), &mut state, 0.1, || {
            e /= 2.0;
            Ok(e)
        })
        .unwrap();
        // 0.5, 0.25, 0.125, 0.0625
        assert_eq!(report.epochs, 4);
        assert!(report.converged);
        assert_eq!(report.final_error, 0.0625);
    }

    #[test]
    fn test_patience_counts_non_improving_epochs() {
        let mut state = TrainingState::default();
        let report = run_epochs("test", &config(1000, 0.0, 5), &mut state, 0.1, || Ok(0.5)).unwrap();
        // first epoch improves on the initial sentinel, then five stale ones
        assert_eq!(report.epochs, 6);
        assert!(report.stopped_early);
        assert!(report.epochs <= 1000);
    }

    #[test]
    fn test_non_finite_error_aborts() {
        let mut state = TrainingState::default();
        let result = run_epochs("test", &config(10, 0.0, 5), &mut state, 0.1, || Ok(f64::NAN));
        assert!(matches!(result, Err(Error::Numeric(_))));
    }
}
