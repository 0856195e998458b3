//! Long Short-Term Memory Layer
//!
//! Processes one time step per `forward` call and carries hidden and cell
//! state between calls until [`Layer::reset_state`].
//!
//! ## Step Equations
//!
//! ```text
//! comb = [x, h_prev]
//! f = σ(W_f·comb + b_f)          forget gate
//! i = σ(W_i·comb + b_i)          input gate
//! o = σ(W_o·comb + b_o)          output gate
//! g = tanh(W_g·comb + b_g)       candidate
//! c = f ⊙ c_prev + i ⊙ g
//! h = o ⊙ tanh(c)
//! ```
//!
//! ## Back-Propagation Through Time
//!
//! Each `forward` pushes a step cache. `backward` pops the newest one, adds
//! the hidden and cell gradients carried from the step after it, and leaves
//! `dh_prev`/`dc_prev` behind for the step before. Calling `backward` once
//! per step in reverse order therefore differentiates the whole sequence.
//!
//! Step caches are only released by `backward` and `reset_state`. A layer
//! driven by `forward` alone keeps one cache per call, so inference loops
//! must call `reset_state` between sequences; [`crate::RecurrentNetwork`]
//! does this at the start of every sequence.

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
pub struct Lstm {
    hidden_size: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    gates: Option<LstmGates>,
    hidden: Vec<f64>,
    cell: Vec<f64>,
    steps: Vec<LstmStep>,
    carried_hidden_grad: Vec<f64>,
    carried_cell_grad: Vec<f64>,
}

#[derive(Debug)]
struct LstmGates {
    forget: Gate,
    input: Gate,
    output: Gate,
    candidate: Gate,
}

#[derive(Debug)]
struct LstmStep {
    combined: Vec<f64>,
    prev_cell: Vec<f64>,
    forget: Vec<f64>,
    input: Vec<f64>,
    output: Vec<f64>,
    candidate: Vec<f64>,
    cell_tanh: Vec<f64>,
}

impl Lstm {
    pub fn new(hidden_size: usize) -> Result<Self> {
        if !(MIN_HIDDEN_SIZE..=MAX_HIDDEN_SIZE).contains(&hidden_size) {
            return Err(Error::Config(format!(
                "LSTM hidden size must be in {MIN_HIDDEN_SIZE}..={MAX_HIDDEN_SIZE}, got {hidden_size}"
            )));
        }
        Ok(Self {
            hidden_size,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            gates: None,
            hidden: vec![0.0; hidden_size],
            cell: vec![0.0; hidden_size],
            steps: Vec::new(),
            carried_hidden_grad: vec![0.0; hidden_size],
            carried_cell_grad: vec![0.0; hidden_size],
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

    pub fn cell_state(&self) -> &[f64] {
        &self.cell
    }

    fn clear_carried(&mut self) {
        self.carried_hidden_grad.iter_mut().for_each(|g| *g = 0.0);
        self.carried_cell_grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

impl Layer for Lstm {
    fn kind(&self) -> LayerKind {
        LayerKind::Lstm
    }

    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        match input_shape {
            [n] if *n > 0 => Ok(vec![self.hidden_size]),
            _ => Err(Error::Config(format!(
                "LSTM expects a vector step input, got shape {input_shape:?}"
            ))),
        }
    }

    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()> {
        check_output_shape(self, input_shape, output_shape)?;
        let cols = input_shape[0] + self.hidden_size;
        self.gates = Some(LstmGates {
            forget: Gate::new(self.hidden_size, cols),
            input: Gate::new(self.hidden_size, cols),
            output: Gate::new(self.hidden_size, cols),
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
        let gates = self.gates.as_ref().ok_or_else(|| not_initialized(LayerKind::Lstm))?;
        input.ensure_shape(&self.input_shape)?;

        let mut combined = input.data.clone();
        combined.extend_from_slice(&self.hidden);

        let activate = |gate: &Gate, f: fn(f64) -> f64| -> Vec<f64> {
            gate.preactivation(&combined).into_iter().map(f).collect()
        };
        let forget = activate(&gates.forget, sigmoid);
        let input_gate = activate(&gates.input, sigmoid);
        let output = activate(&gates.output, sigmoid);
        let candidate = activate(&gates.candidate, tanh);

        let prev_cell = std::mem::take(&mut self.cell);
        let cell: Vec<f64> = (0..self.hidden_size)
            .map(|k| forget[k] * prev_cell[k] + input_gate[k] * candidate[k])
            .collect();
        let cell_tanh: Vec<f64> = cell.iter().map(|&c| tanh(c)).collect();
        let hidden: Vec<f64> = output.iter().zip(&cell_tanh).map(|(o, t)| o * t).collect();

        self.steps.push(LstmStep {
            combined,
            prev_cell,
            forget,
            input: input_gate,
            output,
            candidate,
            cell_tanh,
        });
        self.cell = cell;
        self.hidden = hidden.clone();
        Ok(Tensor::from_vec(hidden))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        input.ensure_shape(&self.input_shape)?;
        grad_output.ensure_shape(&self.output_shape)?;
        let step = self.steps.pop().ok_or_else(|| missing_forward(LayerKind::Lstm))?;
        let gates = self.gates.as_mut().ok_or_else(|| not_initialized(LayerKind::Lstm))?;

        let n = self.hidden_size;
        let mut d_forget = vec![0.0; n];
        let mut d_input = vec![0.0; n];
        let mut d_output = vec![0.0; n];
        let mut d_candidate = vec![0.0; n];
        let mut prev_cell_grad = vec![0.0; n];

        for k in 0..n {
            let dh = grad_output.data[k] + self.carried_hidden_grad[k];
            let t = step.cell_tanh[k];
            let dc = self.carried_cell_grad[k] + dh * step.output[k] * (1.0 - t * t);

            let (f, i, o, g) = (step.forget[k], step.input[k], step.output[k], step.candidate[k]);
            d_output[k] = dh * t * o * (1.0 - o);
            d_input[k] = dc * g * i * (1.0 - i);
            d_forget[k] = dc * step.prev_cell[k] * f * (1.0 - f);
            d_candidate[k] = dc * i * (1.0 - g * g);
            prev_cell_grad[k] = dc * f;
        }

        let mut grad_combined = vec![0.0; step.combined.len()];
        for (gate, delta) in [
            (&mut gates.forget, &d_forget),
            (&mut gates.input, &d_input),
            (&mut gates.output, &d_output),
            (&mut gates.candidate, &d_candidate),
        ] {
            gate.accumulate(&step.combined, delta);
            gate.add_input_grad(delta, &mut grad_combined);
        }

        let input_size = self.input_shape[0];
        let prev_hidden_grad = grad_combined.split_off(input_size);
        if self.steps.is_empty() {
            self.clear_carried();
        } else {
            self.carried_hidden_grad = prev_hidden_grad;
            self.carried_cell_grad = prev_cell_grad;
        }
        Tensor::new(grad_combined, self.input_shape.clone())
    }

    fn parameters(&mut self) -> Vec<ParamRef<'_>> {
        match self.gates.as_mut() {
            Some(g) => [
                g.forget.params(),
                g.input.params(),
                g.output.params(),
                g.candidate.params(),
            ]
            .into_iter()
            .flatten()
            .collect(),
            None => Vec::new(),
        }
    }

    fn parameter_count(&self) -> usize {
        self.gates.as_ref().map_or(0, |g| {
            g.forget.parameter_count()
                + g.input.parameter_count()
                + g.output.parameter_count()
                + g.candidate.parameter_count()
        })
    }

    fn reset_state(&mut self) {
        self.hidden = vec![0.0; self.hidden_size];
        self.cell = vec![0.0; self.hidden_size];
        self.steps.clear();
        self.clear_carried();
    }

    /// Seed `h` and `c` for the next step; a missing cell state means zeros
    fn set_initial_state(&mut self, hidden: &[f64], cell: Option<&[f64]>) -> Result<()> {
        if !self.is_initialized() {
            return Err(not_initialized(LayerKind::Lstm));
        }
        if hidden.len() != self.hidden_size {
            return Err(Error::shape(&[self.hidden_size], &[hidden.len()]));
        }
        if let Some(c) = cell {
            if c.len() != self.hidden_size {
                return Err(Error::shape(&[self.hidden_size], &[c.len()]));
            }
        }
        self.hidden = hidden.to_vec();
        self.cell = cell.map_or_else(|| vec![0.0; self.hidden_size], <[f64]>::to_vec);
        Ok(())
    }
}
