//! Training configuration
//!
//! Stopping criteria and progress reporting for the epoch loop shared by the
//! feed-forward containers. Configurations are plain serde structs, so they
//! can be kept next to experiment data as JSON:
//!
//! ```json
//! { "max_epochs": 5000, "min_error": 0.001, "patience": 50, "log_every": 250 }
//! ```
//!
//! Missing fields take their defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stopping criteria and logging cadence for one `train` call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Upper bound on epochs run by a single `train` call
    pub max_epochs: usize,
    /// Stop once the epoch error is at or below this value
    pub min_error: f64,
    /// Stop after this many consecutive epochs without improvement
    pub patience: usize,
    /// Emit a progress line every N epochs (0 disables progress lines)
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            max_epochs: 10_000,
            min_error: 1e-4,
            patience: 100,
            log_every: 100,
        }
    }
}

impl TrainingConfig {
    /// Defaults used by the fixed-topology [`crate::NeuralNetwork`]
    ///
    /// The flat network has no patience rule.
    pub fn flat() -> Self {
        Self {
            max_epochs: 1000,
            min_error: 0.001,
            patience: usize::MAX,
            ..Self::default()
        }
    }

    /// Exactly `epochs` epochs unless the error turns non-finite
    pub fn fixed_epochs(epochs: usize) -> Self {
        Self {
            max_epochs: epochs,
            min_error: 0.0,
            patience: usize::MAX,
            log_every: 10,
        }
    }

    /// Same criteria with a different epoch cap
    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    /// Parse a JSON document and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(Error::Config("max_epochs must be at least 1".into()));
        }
        if !self.min_error.is_finite() || self.min_error < 0.0 {
            return Err(Error::Config(format!(
                "min_error must be a finite non-negative number, got {}",
                self.min_error
            )));
        }
        if self.patience == 0 {
            return Err(Error::Config("patience must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.max_epochs, 10_000);
        assert_eq!(config.min_error, 1e-4);
        assert_eq!(config.patience, 100);

        let flat = TrainingConfig::flat();
        assert_eq!(flat.max_epochs, 1000);
        assert_eq!(flat.min_error, 0.001);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = TrainingConfig::from_json(r#"{ "max_epochs": 20 }"#).unwrap();
        assert_eq!(config.max_epochs, 20);
        assert_eq!(config.patience, 100);
    }

    #[test]
    fn test_json_round_trip() {
        let config = TrainingConfig::default().with_max_epochs(7);
        let back = TrainingConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            TrainingConfig::from_json(r#"{ "max_epochs": 0 }"#),
            Err(Error::Config(_))
        ));
        assert!(TrainingConfig::from_json(r#"{ "min_error": -1.0 }"#).is_err());
        assert!(TrainingConfig::from_json(r#"{ "patience": 0 }"#).is_err());
        assert!(matches!(
            TrainingConfig::from_json("not json"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        assert!(matches!(
            TrainingConfig::load("/nonexistent/synapse-config.json"),
            Err(Error::Io(_))
        ));
    }
}
