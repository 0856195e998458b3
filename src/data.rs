//! Training data containers and normalization
//!
//! [`ProcessedData`] is the unit handed to every `train` call: row-aligned
//! input and target matrices. [`DataNormalizer`] turns raw feature rows into
//! `[0, 1]`-scaled rows and keeps running statistics per stream.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{Error, Result};

/// Paired input/target matrices, one row per example
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedData {
    inputs: Vec<Vec<f64>>,
    targets: Vec<Vec<f64>>,
    timestamp: u64,
}

impl ProcessedData {
    /// # Errors
    ///
    /// [`Error::InvalidData`] when the two matrices have different row counts.
    pub fn new(inputs: Vec<Vec<f64>>, targets: Vec<Vec<f64>>) -> Result<Self> {
        if inputs.len() != targets.len() {
            return Err(Error::InvalidData(format!(
                "{} input rows but {} target rows",
                inputs.len(),
                targets.len()
            )));
        }
        Ok(Self {
            inputs,
            targets,
            timestamp: now_millis(),
        })
    }

    pub fn inputs(&self) -> &[Vec<f64>] {
        &self.inputs
    }

    pub fn targets(&self) -> &[Vec<f64>] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Width of the first input row, 0 when empty
    pub fn input_size(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }

    pub fn output_size(&self) -> usize {
        self.targets.first().map_or(0, Vec::len)
    }

    /// Creation time in milliseconds since the Unix epoch
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// `(input, target)` row pairs
    pub fn iter(&self) -> impl Iterator<Item = (&[f64], &[f64])> {
        self.inputs
            .iter()
            .zip(&self.targets)
            .map(|(x, y)| (x.as_slice(), y.as_slice()))
    }

    /// New data set made of the rows at `indices` (repeats allowed)
    pub fn sample(&self, indices: &[usize]) -> Result<Self> {
        let mut inputs = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        for &i in indices {
            if i >= self.len() {
                return Err(Error::InvalidData(format!(
                    "row index {i} out of range for {} rows",
                    self.len()
                )));
            }
            inputs.push(self.inputs[i].clone());
            targets.push(self.targets[i].clone());
        }
        Self::new(inputs, targets)
    }

    pub fn into_parts(self) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
        (self.inputs, self.targets)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Running min/max/mean/range over every row normalized in one stream
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NormalizationStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub range: f64,
    pub update_count: u64,
}

impl Default for NormalizationStats {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            range: 0.0,
            update_count: 0,
        }
    }
}

impl NormalizationStats {
    fn merge(&mut self, min: f64, max: f64, mean: f64, range: f64) {
        self.min = self.min.min(min);
        self.max = self.max.max(max);
        self.mean = (self.mean * self.update_count as f64 + mean) / (self.update_count + 1) as f64;
        self.range = self.range.max(range);
        self.update_count += 1;
    }
}

/// Counters over all `process` calls
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub processed_sets: u64,
    pub processed_examples: u64,
    pub errors: u64,
    /// Milliseconds since the Unix epoch of the last successful call
    pub last_processed: Option<u64>,
}

impl ProcessingStats {
    /// Failed calls over all calls, 0 when nothing was processed
    pub fn error_rate(&self) -> f64 {
        let total = self.processed_sets + self.errors;
        if total == 0 {
            0.0
        } else {
            self.errors as f64 / total as f64
        }
    }
}

pub const INPUT_STREAM: &str = "input";
pub const TARGET_STREAM: &str = "target";

/// Per-row min-max scaler
#[derive(Debug, Default)]
pub struct DataNormalizer {
    stats: BTreeMap<String, NormalizationStats>,
    processing: ProcessingStats,
}

impl DataNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scale one row to `[0, 1]`
    ///
    /// Only finite values contribute to the row's min and max. Non-finite
    /// values, and every value of a row whose range is zero, become `0`.
    pub fn normalize_row(&mut self, row: &[f64], stream: &str) -> Vec<f64> {
        let finite: Vec<f64> = row.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return vec![0.0; row.len()];
        }

        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = finite.iter().sum::<f64>() / finite.len() as f64;
        let range = max - min;

        self.stats
            .entry(stream.to_string())
            .or_default()
            .merge(min, max, mean, range);

        row.iter()
            .map(|&v| {
                if v.is_finite() && range > 0.0 {
                    (v - min) / range
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Normalize both matrices row by row into a [`ProcessedData`]
    pub fn process(
        &mut self,
        inputs: &[Vec<f64>],
        targets: &[Vec<f64>],
    ) -> Result<ProcessedData> {
        if inputs.len() != targets.len() || inputs.is_empty() {
            self.processing.errors += 1;
            tracing::warn!(
                inputs = inputs.len(),
                targets = targets.len(),
                "rejecting training data"
            );
            return Err(Error::InvalidData(format!(
                "need the same non-zero number of input and target rows, got {} and {}",
                inputs.len(),
                targets.len()
            )));
        }

        let norm_inputs = inputs
            .iter()
            .map(|row| self.normalize_row(row, INPUT_STREAM))
            .collect();
        let norm_targets = targets
            .iter()
            .map(|row| self.normalize_row(row, TARGET_STREAM))
            .collect();
        let data = ProcessedData::new(norm_inputs, norm_targets)?;

        self.processing.processed_sets += 1;
        self.processing.processed_examples += inputs.len() as u64;
        self.processing.last_processed = Some(data.timestamp());
        tracing::debug!(examples = inputs.len(), "training data normalized");
        Ok(data)
    }

    pub fn stats(&self, stream: &str) -> Option<&NormalizationStats> {
        self.stats.get(stream)
    }

    pub fn all_stats(&self) -> &BTreeMap<String, NormalizationStats> {
        &self.stats
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        self.processing
    }
}
