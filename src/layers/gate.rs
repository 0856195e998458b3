//! Affine gate shared by the recurrent cells
//!
//! One gate is a `[hidden][input + hidden]` weight matrix and a bias vector
//! applied to the concatenated step input `[x, h]`. The nonlinearity stays
//! with the cell so LSTM and GRU can pick sigmoid or tanh per gate.

use crate::layers::{glorot_limit, random_init, ParamRef};

#[derive(Debug)]
pub(crate) struct Gate {
    rows: usize,
    cols: usize,
    pub weights: Vec<f64>,
    pub bias: Vec<f64>,
    pub weight_grads: Vec<f64>,
    pub bias_grads: Vec<f64>,
}

impl Gate {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            weights: random_init(rows * cols, glorot_limit(cols, rows)),
            bias: vec![0.0; rows],
            weight_grads: vec![0.0; rows * cols],
            bias_grads: vec![0.0; rows],
        }
    }

    /// `W·combined + b`
    pub fn preactivation(&self, combined: &[f64]) -> Vec<f64> {
        self.weights
            .chunks_exact(self.cols)
            .zip(&self.bias)
            .map(|(row, b)| b + row.iter().zip(combined).map(|(w, x)| w * x).sum::<f64>())
            .collect()
    }

    /// `grad_W += δ ⊗ combined`, `grad_b += δ`
    pub fn accumulate(&mut self, combined: &[f64], delta: &[f64]) {
        for (r, &d) in delta.iter().enumerate().take(self.rows) {
            if d == 0.0 {
                continue;
            }
            self.bias_grads[r] += d;
            let row = &mut self.weight_grads[r * self.cols..(r + 1) * self.cols];
            for (gw, &x) in row.iter_mut().zip(combined) {
                *gw += d * x;
            }
        }
    }

    /// `out += Wᵀ·δ`
    pub fn add_input_grad(&self, delta: &[f64], out: &mut [f64]) {
        for (row, &d) in self.weights.chunks_exact(self.cols).zip(delta) {
            for (o, &w) in out.iter_mut().zip(row) {
                *o += w * d;
            }
        }
    }

    pub fn params(&mut self) -> [ParamRef<'_>; 2] {
        [
            ParamRef {
                values: &mut self.weights,
                grads: &mut self.weight_grads,
            },
            ParamRef {
                values: &mut self.bias,
                grads: &mut self.bias_grads,
            },
        ]
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preactivation_and_transpose() {
        let mut gate = Gate::new(2, 3);
        gate.weights = vec![1.0, 0.0, 2.0, 0.0, 1.0, -1.0];
        gate.bias = vec![0.5, 0.0];
        assert_eq!(gate.preactivation(&[1.0, 2.0, 3.0]), vec![7.5, -1.0]);

        let mut out = vec![0.0; 3];
        gate.add_input_grad(&[1.0, 2.0], &mut out);
        assert_eq!(out, vec![1.0, 2.0, 0.0]);

        gate.accumulate(&[1.0, 2.0, 3.0], &[1.0, 0.5]);
        assert_eq!(gate.weight_grads, vec![1.0, 2.0, 3.0, 0.5, 1.0, 1.5]);
        assert_eq!(gate.bias_grads, vec![1.0, 0.5]);
    }
}
