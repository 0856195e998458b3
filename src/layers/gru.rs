//! Gated Recurrent Unit Layer
//!
//! ```text
//! comb   = [x, h_prev]
//! r      = σ(W_r·comb + b_r)                  reset gate
//! z      = σ(W_z·comb + b_z)                  update gate
//! ĥ      = tanh(W_h·[x, r ⊙ h_prev] + b_h)    candidate
//! h      = (1 - z) ⊙ h_prev + z ⊙ ĥ
//! ```
//!
//! Step caches and gradient carrying work the same way as in
//! [`super::lstm`], with only a hidden state to carry. Caches pile up until
//! `backward` or `reset_state` releases them.

use crate::activation::{sigmoid, tanh};
use crate::error::{Error, Result};
use crate::layers::gate::Gate;
use crate::layers::{
    check_output_shape, missing_forward, not_initialized, Layer, LayerKind, ParamRef,
};
use crate::tensor::Tensor;

pub const MIN_HIDDEN_SIZE: usize = 1;
pub const MAX_HIDDEN_SIZE: usize = 1024;

#[derive(Debug)]
pub struct Gru {
    hidden_size: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    gates: Option<GruGates>,
    hidden: Vec<f64>,
    steps: Vec<GruStep>,
    carried_hidden_grad: Vec<f64>,
}

#[derive(Debug)]
struct GruGates {
    reset: Gate,
    update: Gate,
    candidate: Gate,
}

#[derive(Debug)]
struct GruStep {
    combined: Vec<f64>,
    reset_combined: Vec<f64>,
    prev_hidden: Vec<f64>,
    reset: Vec<f64>,
    update: Vec<f64>,
    candidate: Vec<f64>,
}

impl Gru {
    pub fn new(hidden_size: usize) -> Result<Self> {
        if !(MIN_HIDDEN_SIZE..=MAX_HIDDEN_SIZE).contains(&hidden_size) {
            return Err(Error::Config(format!(
                "GRU hidden size must be in {MIN_HIDDEN_SIZE}..={MAX_HIDDEN_SIZE}, got {hidden_size}"
            )));
        }
        Ok(Self {
            hidden_size,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            gates: None,
            hidden: vec![0.0; hidden_size],
            steps: Vec::new(),
            carried_hidden_grad: vec![0.0; hidden_size],
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Forward steps still waiting for `backward`
    pub fn cached_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn hidden_state(&self) -> &[f64] {
        &self.hidden
    }
}

impl Layer for Gru {
    fn kind(&self) -> LayerKind {
        LayerKind::Gru
    }

    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        match input_shape {
            [n] if *n > 0 => Ok(vec![self.hidden_size]),
            _ => Err(Error::Config(format!(
                "GRU expects a vector step input, got shape {input_shape:?}"
            ))),
        }
    }

    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()> {
        check_output_shape(self, input_shape, output_shape)?;
        let cols = input_shape[0] + self.hidden_size;
        self.gates = Some(GruGates {
            reset: Gate::new(self.hidden_size, cols),
            update: Gate::new(self.hidden_size, cols),
            candidate: Gate::new(self.hidden_size, cols),
        });
        self.input_shape = input_shape.to_vec();
        self.output_shape = output_shape.to_vec();
        self.reset_state();
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.gates.is_some()
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let gates = self.gates.as_ref().ok_or_else(|| not_initialized(LayerKind::Gru))?;
        input.ensure_shape(&self.input_shape)?;

        let prev_hidden = std::mem::take(&mut self.hidden);
        let mut combined = input.data.clone();
        combined.extend_from_slice(&prev_hidden);

        let reset: Vec<f64> = gates
            .reset
            .preactivation(&combined)
            .into_iter()
            .map(sigmoid)
            .collect();
        let update: Vec<f64> = gates
            .update
            .preactivation(&combined)
            .into_iter()
            .map(sigmoid)
            .collect();

        let mut reset_combined = input.data.clone();
        reset_combined.extend(reset.iter().zip(&prev_hidden).map(|(r, h)| r * h));
        let candidate: Vec<f64> = gates
            .candidate
            .preactivation(&reset_combined)
            .into_iter()
            .map(tanh)
            .collect();

        let hidden: Vec<f64> = (0..self.hidden_size)
            .map(|k| (1.0 - update[k]) * prev_hidden[k] + update[k] * candidate[k])
            .collect();

        self.steps.push(GruStep {
            combined,
            reset_combined,
            prev_hidden,
            reset,
            update,
            candidate,
        });
        self.hidden = hidden.clone();
        Ok(Tensor::from_vec(hidden))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        input.ensure_shape(&self.input_shape)?;
        grad_output.ensure_shape(&self.output_shape)?;
        let step = self.steps.pop().ok_or_else(|| missing_forward(LayerKind::Gru))?;
        let gates = self.gates.as_mut().ok_or_else(|| not_initialized(LayerKind::Gru))?;

        let n = self.hidden_size;
        let input_size = self.input_shape[0];
        let mut prev_hidden_grad = vec![0.0; n];
        let mut d_update = vec![0.0; n];
        let mut d_candidate = vec![0.0; n];

        for k in 0..n {
            let dh = grad_output.data[k] + self.carried_hidden_grad[k];
            let (z, c) = (step.update[k], step.candidate[k]);
            d_update[k] = dh * (c - step.prev_hidden[k]) * z * (1.0 - z);
            d_candidate[k] = dh * z * (1.0 - c * c);
            prev_hidden_grad[k] = dh * (1.0 - z);
        }

        // candidate path: through [x, r ⊙ h_prev]
        let mut grad_reset_combined = vec![0.0; input_size + n];
        gates.candidate.accumulate(&step.reset_combined, &d_candidate);
        gates
            .candidate
            .add_input_grad(&d_candidate, &mut grad_reset_combined);

        let mut d_reset = vec![0.0; n];
        for k in 0..n {
            let g = grad_reset_combined[input_size + k];
            let r = step.reset[k];
            d_reset[k] = g * step.prev_hidden[k] * r * (1.0 - r);
            prev_hidden_grad[k] += g * r;
        }

        // gate path: through [x, h_prev]
        let mut grad_combined = vec![0.0; input_size + n];
        gates.reset.accumulate(&step.combined, &d_reset);
        gates.reset.add_input_grad(&d_reset, &mut grad_combined);
        gates.update.accumulate(&step.combined, &d_update);
        gates.update.add_input_grad(&d_update, &mut grad_combined);

        let mut grad_input = grad_reset_combined;
        grad_input.truncate(input_size);
        for (gi, g) in grad_input.iter_mut().zip(&grad_combined) {
            *gi += g;
        }
        for (ph, g) in prev_hidden_grad.iter_mut().zip(&grad_combined[input_size..]) {
            *ph += g;
        }

        if self.steps.is_empty() {
            self.carried_hidden_grad = vec![0.0; n];
        } else {
            self.carried_hidden_grad = prev_hidden_grad;
        }
        Tensor::new(grad_input, self.input_shape.clone())
    }

    fn parameters(&mut self) -> Vec<ParamRef<'_>> {
        match self.gates.as_mut() {
            Some(g) => [g.reset.params(), g.update.params(), g.candidate.params()]
                .into_iter()
                .flatten()
                .collect(),
            None => Vec::new(),
        }
    }

    fn parameter_count(&self) -> usize {
        self.gates.as_ref().map_or(0, |g| {
            g.reset.parameter_count() + g.update.parameter_count() + g.candidate.parameter_count()
        })
    }

    fn reset_state(&mut self) {
        self.hidden = vec![0.0; self.hidden_size];
        self.steps.clear();
        self.carried_hidden_grad = vec![0.0; self.hidden_size];
    }

    fn set_initial_state(&mut self, hidden: &[f64], cell: Option<&[f64]>) -> Result<()> {
        if !self.is_initialized() {
            return Err(not_initialized(LayerKind::Gru));
        }
        if cell.is_some() {
            return Err(Error::Config("GRU has no cell state".into()));
        }
        if hidden.len() != self.hidden_size {
            return Err(Error::shape(&[self.hidden_size], &[hidden.len()]));
        }
        self.hidden = hidden.to_vec();
        Ok(())
    }
}
