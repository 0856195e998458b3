//! Weight-Update Optimizer
//!
//! One [`Optimizer`] belongs to each network container. After the backward
//! pass has accumulated gradients in every layer, the container calls
//! [`Optimizer::update_weights`] once, which applies the selected algorithm
//! to every learnable buffer and clears the gradients.
//!
//! ## Algorithms
//!
//! Gradients handed to the optimizer already point downhill (they are
//! derived from `target - output`), so every rule *adds* its step:
//!
//! ```text
//! SGD       θ += α·g
//! Momentum  v = μ·v + α·g;               θ += v
//! AdaGrad   G += g²;                     θ += α·g / (√G + ε)
//! RMSProp   s = ρ·s + (1-ρ)·g²;          θ += α·g / (√s + ε)
//! Adam      m = β₁·m + (1-β₁)·g
//!           v = β₂·v + (1-β₂)·g²
//!           θ += α·m̂ / (√v̂ + ε)          m̂ = m/(1-β₁ᵗ), v̂ = v/(1-β₂ᵗ)
//! Adamax    u = max(β₂·u, |g|);          θ += α/(1-β₁ᵗ) · m / (u + ε)
//! Nadam     θ += α/(√v̂ + ε) · (β₁·m̂ + (1-β₁)·g/(1-β₁ᵗ))
//! ```
//!
//! `t` is the iteration counter, incremented once per update sweep.
//!
//! ## State
//!
//! Moment buffers are stored per layer *position* and per parameter buffer,
//! and are (re)allocated lazily whenever the buffer sizes change. Removing
//! or replacing layers therefore never leaves stale state attached to a
//! different layer's shape.
//!
//! ## Performance
//!
//! Buffers with more than 1000 elements are updated in parallel with Rayon;
//! smaller ones run sequentially.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::layers::{Layer, ParamRef};

pub const MIN_LEARNING_RATE: f64 = 1e-8;
pub const MAX_LEARNING_RATE: f64 = 1.0;
pub const DEFAULT_LEARNING_RATE: f64 = 0.001;
pub const EPSILON: f64 = 1e-8;

const PARALLEL_THRESHOLD: usize = 1000;

/// Update algorithm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Sgd,
    Momentum,
    AdaGrad,
    RmsProp,
    #[default]
    Adam,
    Adamax,
    Nadam,
}

impl OptimizerType {
    pub const ALL: [OptimizerType; 7] = [
        OptimizerType::Sgd,
        OptimizerType::Momentum,
        OptimizerType::AdaGrad,
        OptimizerType::RmsProp,
        OptimizerType::Adam,
        OptimizerType::Adamax,
        OptimizerType::Nadam,
    ];

    pub fn description(self) -> &'static str {
        match self {
            OptimizerType::Sgd => "Stochastic Gradient Descent",
            OptimizerType::Momentum => "Momentum",
            OptimizerType::AdaGrad => "AdaGrad",
            OptimizerType::RmsProp => "RMSprop",
            OptimizerType::Adam => "Adam",
            OptimizerType::Adamax => "Adamax",
            OptimizerType::Nadam => "Nadam",
        }
    }

    fn default_parameters(self) -> BTreeMap<String, f64> {
        let pairs: &[(&str, f64)] = match self {
            OptimizerType::Sgd => &[],
            OptimizerType::Momentum => &[("momentum", 0.9)],
            OptimizerType::AdaGrad => &[("epsilon", EPSILON)],
            OptimizerType::RmsProp => &[("decay", 0.9), ("epsilon", EPSILON)],
            OptimizerType::Adam | OptimizerType::Adamax | OptimizerType::Nadam => {
                &[("beta1", 0.9), ("beta2", 0.999), ("epsilon", EPSILON)]
            }
        };
        pairs.iter().map(|&(k, v)| (k.to_string(), v)).collect()
    }
}

impl fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for OptimizerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(OptimizerType::Sgd),
            "momentum" => Ok(OptimizerType::Momentum),
            "adagrad" => Ok(OptimizerType::AdaGrad),
            "rmsprop" => Ok(OptimizerType::RmsProp),
            "adam" => Ok(OptimizerType::Adam),
            "adamax" => Ok(OptimizerType::Adamax),
            "nadam" => Ok(OptimizerType::Nadam),
            other => Err(Error::Config(format!("unknown optimizer '{other}'"))),
        }
    }
}

/// First and second moment buffers for one parameter buffer
#[derive(Clone, Debug, Default)]
struct MomentState {
    first: Vec<f64>,
    second: Vec<f64>,
}

impl MomentState {
    fn zeros(len: usize) -> Self {
        Self {
            first: vec![0.0; len],
            second: vec![0.0; len],
        }
    }
}

/// Per-element update rule with its constants resolved for one sweep
#[derive(Clone, Copy, Debug)]
enum Rule {
    Momentum { lr: f64, mu: f64 },
    AdaGrad { lr: f64, eps: f64 },
    RmsProp { lr: f64, decay: f64, eps: f64 },
    Adam { lr: f64, b1: f64, b2: f64, eps: f64, bc1: f64, bc2: f64 },
    Adamax { lr: f64, b1: f64, b2: f64, eps: f64, bc1: f64 },
    Nadam { lr: f64, b1: f64, b2: f64, eps: f64, bc1: f64, bc2: f64 },
}

impl Rule {
    #[inline]
    fn step(self, value: &mut f64, g: f64, m: &mut f64, v: &mut f64) {
        match self {
            Rule::Momentum { lr, mu } => {
                *m = mu * *m + lr * g;
                *value += *m;
            }
            Rule::AdaGrad { lr, eps } => {
                *v += g * g;
                *value += lr * g / (v.sqrt() + eps);
            }
            Rule::RmsProp { lr, decay, eps } => {
                *v = decay * *v + (1.0 - decay) * g * g;
                *value += lr * g / (v.sqrt() + eps);
            }
            Rule::Adam { lr, b1, b2, eps, bc1, bc2 } => {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *value += lr * m_hat / (v_hat.sqrt() + eps);
            }
            Rule::Adamax { lr, b1, b2, eps, bc1 } => {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = (b2 * *v).max(g.abs());
                *value += (lr / bc1) * *m / (*v + eps);
            }
            Rule::Nadam { lr, b1, b2, eps, bc1, bc2 } => {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                let nesterov = b1 * m_hat + (1.0 - b1) * g / bc1;
                *value += lr * nesterov / (v_hat.sqrt() + eps);
            }
        }
    }

    /// Apply to one buffer and clear its gradients
    fn apply(self, param: ParamRef<'_>, state: &mut MomentState) {
        if param.values.len() > PARALLEL_THRESHOLD {
            param
                .values
                .par_iter_mut()
                .zip(param.grads.par_iter_mut())
                .zip(state.first.par_iter_mut().zip(state.second.par_iter_mut()))
                .for_each(|((value, grad), (m, v))| {
                    self.step(value, *grad, m, v);
                    *grad = 0.0;
                });
        } else {
            for (((value, grad), m), v) in param
                .values
                .iter_mut()
                .zip(param.grads.iter_mut())
                .zip(state.first.iter_mut())
                .zip(state.second.iter_mut())
            {
                self.step(value, *grad, m, v);
                *grad = 0.0;
            }
        }
    }
}

/// `1 - βᵗ`, kept away from zero
fn bias_correction(beta: f64, t: u64) -> f64 {
    (1.0 - beta.powf(t as f64)).max(f64::EPSILON)
}

/// Multi-algorithm optimizer with per-layer moment state
#[derive(Debug)]
pub struct Optimizer {
    kind: OptimizerType,
    learning_rate: f64,
    parameters: BTreeMap<String, f64>,
    /// `state[layer_position][parameter_buffer]`
    state: Vec<Vec<MomentState>>,
    iteration: u64,
}

impl Optimizer {
    /// Create an optimizer; the learning rate is clamped to `[1e-8, 1]`
    pub fn new(kind: OptimizerType, learning_rate: f64) -> Self {
        Self {
            kind,
            learning_rate: clamp_learning_rate(learning_rate),
            parameters: kind.default_parameters(),
            state: Vec::new(),
            iteration: 0,
        }
    }

    pub fn kind(&self) -> OptimizerType {
        self.kind
    }

    /// Switch algorithm, restoring its default hyperparameters and
    /// discarding all moment state
    pub fn set_type(&mut self, kind: OptimizerType) {
        self.kind = kind;
        self.parameters = kind.default_parameters();
        self.reset();
        tracing::debug!(optimizer = %kind, "optimizer type changed");
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = clamp_learning_rate(learning_rate);
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) {
        self.parameters.insert(name.to_string(), value);
    }

    /// Named hyperparameter, `0.0` when unset
    pub fn parameter(&self, name: &str) -> f64 {
        self.parameters.get(name).copied().unwrap_or(0.0)
    }

    pub fn parameters(&self) -> &BTreeMap<String, f64> {
        &self.parameters
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Clear moment state and the iteration counter
    pub fn reset(&mut self) {
        self.state.clear();
        self.iteration = 0;
    }

    /// Apply one update sweep over `layers` and clear their gradients
    pub fn update_weights(&mut self, layers: &mut [Box<dyn Layer>]) {
        self.iteration += 1;

        let Some(rule) = self.rule() else {
            for layer in layers.iter_mut() {
                layer.update_weights(self.learning_rate);
            }
            return;
        };

        if self.state.len() < layers.len() {
            self.state.resize_with(layers.len(), Vec::new);
        }

        for (layer, slots) in layers.iter_mut().zip(self.state.iter_mut()) {
            let params = layer.parameters();
            if params.is_empty() {
                continue;
            }
            if slots.len() != params.len() {
                slots.clear();
                slots.resize_with(params.len(), MomentState::default);
            }
            for (param, slot) in params.into_iter().zip(slots.iter_mut()) {
                if slot.first.len() != param.values.len() {
                    *slot = MomentState::zeros(param.values.len());
                }
                rule.apply(param, slot);
            }
        }
    }

    /// `None` for plain SGD
    fn rule(&self) -> Option<Rule> {
        let lr = self.learning_rate;
        let t = self.iteration;
        let eps = self.parameter("epsilon");
        let (b1, b2) = (self.parameter("beta1"), self.parameter("beta2"));

        let rule = match self.kind {
            OptimizerType::Sgd => return None,
            OptimizerType::Momentum => Rule::Momentum {
                lr,
                mu: self.parameter("momentum"),
            },
            OptimizerType::AdaGrad => Rule::AdaGrad { lr, eps },
            OptimizerType::RmsProp => Rule::RmsProp {
                lr,
                decay: self.parameter("decay"),
                eps,
            },
            OptimizerType::Adam => Rule::Adam {
                lr,
                b1,
                b2,
                eps,
                bc1: bias_correction(b1, t),
                bc2: bias_correction(b2, t),
            },
            OptimizerType::Adamax => Rule::Adamax {
                lr,
                b1,
                b2,
                eps,
                bc1: bias_correction(b1, t),
            },
            OptimizerType::Nadam => Rule::Nadam {
                lr,
                b1,
                b2,
                eps,
                bc1: bias_correction(b1, t),
                bc2: bias_correction(b2, t),
            },
        };
        Some(rule)
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(OptimizerType::Adam, DEFAULT_LEARNING_RATE)
    }
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (lr={:.6}, iterations={}, params={:?})",
            self.kind, self.learning_rate, self.iteration, self.parameters
        )
    }
}

fn clamp_learning_rate(learning_rate: f64) -> f64 {
    if learning_rate.is_nan() {
        return DEFAULT_LEARNING_RATE;
    }
    learning_rate.clamp(MIN_LEARNING_RATE, MAX_LEARNING_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::layers::LayerKind;
    use crate::tensor::Tensor;

    /// Bare parameter buffer with a settable gradient
    #[derive(Debug)]
    struct Params {
        values: Vec<f64>,
        grads: Vec<f64>,
    }

    impl Params {
        fn boxed(len: usize) -> Box<dyn Layer> {
            Box::new(Params {
                values: vec![0.0; len],
                grads: vec![0.0; len],
            })
        }
    }

    impl Layer for Params {
        fn kind(&self) -> LayerKind {
            LayerKind::Dense
        }
        fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
            Ok(input_shape.to_vec())
        }
        fn initialize(&mut self, _: &[usize], _: &[usize]) -> Result<()> {
            Ok(())
        }
        fn is_initialized(&self) -> bool {
            true
        }
        fn input_shape(&self) -> &[usize] {
            &[]
        }
        fn output_shape(&self) -> &[usize] {
            &[]
        }
        fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
            Ok(input.clone())
        }
        fn backward(&mut self, _: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
            Ok(grad_output.clone())
        }
        fn parameters(&mut self) -> Vec<ParamRef<'_>> {
            vec![ParamRef {
                values: &mut self.values,
                grads: &mut self.grads,
            }]
        }
    }

    fn set_grads(layer: &mut Box<dyn Layer>, g: f64) {
        for p in layer.parameters() {
            p.grads.iter_mut().for_each(|x| *x = g);
        }
    }

    fn value(layer: &mut Box<dyn Layer>) -> f64 {
        layer.parameters()[0].values[0]
    }

    #[test]
    fn test_every_algorithm_follows_gradient_and_clears_it() {
        for kind in OptimizerType::ALL {
            let mut opt = Optimizer::new(kind, 0.01);
            let mut layers = vec![Params::boxed(3)];
            set_grads(&mut layers[0], 0.5);
            opt.update_weights(&mut layers);

            assert!(value(&mut layers[0]) > 0.0, "{kind} moved the wrong way");
            assert!(layers[0].parameters()[0].grads.iter().all(|&g| g == 0.0));
            assert_eq!(opt.iteration(), 1);
        }
    }

    #[test]
    fn test_adam_first_step_is_learning_rate() {
        let mut opt = Optimizer::new(OptimizerType::Adam, 0.01);
        let mut layers = vec![Params::boxed(1)];
        set_grads(&mut layers[0], -3.0);
        opt.update_weights(&mut layers);
        // bias correction makes m̂/√v̂ = sign(g) on step one
        assert!((value(&mut layers[0]) + 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_momentum_accumulates_velocity() {
        let mut opt = Optimizer::new(OptimizerType::Momentum, 0.1);
        let mut layers = vec![Params::boxed(1)];
        set_grads(&mut layers[0], 1.0);
        opt.update_weights(&mut layers);
        assert!((value(&mut layers[0]) - 0.1).abs() < 1e-12);
        set_grads(&mut layers[0], 1.0);
        opt.update_weights(&mut layers);
        // v = 0.9·0.1 + 0.1
        assert!((value(&mut layers[0]) - 0.29).abs() < 1e-12);
    }

    #[test]
    fn test_adagrad_steps_shrink() {
        let mut opt = Optimizer::new(OptimizerType::AdaGrad, 0.1);
        let mut layers = vec![Params::boxed(1)];
        let mut last = 0.0;
        let mut steps = Vec::new();
        for _ in 0..3 {
            set_grads(&mut layers[0], 1.0);
            opt.update_weights(&mut layers);
            let now = value(&mut layers[0]);
            steps.push(now - last);
            last = now;
        }
        assert!(steps[0] > steps[1] && steps[1] > steps[2]);
        assert!((steps[1] - 0.1 / 2f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_large_buffers_match_small_ones() {
        let mut opt = Optimizer::new(OptimizerType::Nadam, 0.01);
        let mut layers = vec![Params::boxed(5000), Params::boxed(2)];
        set_grads(&mut layers[0], 0.25);
        set_grads(&mut layers[1], 0.25);
        opt.update_weights(&mut layers);
        let big = layers[0].parameters()[0].values.to_vec();
        let small = value(&mut layers[1]);
        assert!(big.iter().all(|&v| (v - small).abs() < 1e-15));
    }

    #[test]
    fn test_state_follows_layer_position() {
        let mut opt = Optimizer::new(OptimizerType::RmsProp, 0.01);
        let mut layers = vec![Params::boxed(2), Params::boxed(4)];
        opt.update_weights(&mut layers);

        // swapping in a differently sized buffer reallocates its slot
        layers[1] = Params::boxed(7);
        set_grads(&mut layers[1], 1.0);
        opt.update_weights(&mut layers);
        assert!(value(&mut layers[1]) > 0.0);
    }

    #[test]
    fn test_learning_rate_clamped() {
        let mut opt = Optimizer::new(OptimizerType::Sgd, 5.0);
        assert_eq!(opt.learning_rate(), 1.0);
        opt.set_learning_rate(0.0);
        assert_eq!(opt.learning_rate(), MIN_LEARNING_RATE);
    }

    #[test]
    fn test_set_type_resets_parameters_and_state() {
        let mut opt = Optimizer::new(OptimizerType::Momentum, 0.1);
        assert_eq!(opt.parameter("momentum"), 0.9);
        assert_eq!(opt.parameter("beta1"), 0.0);
        opt.update_weights(&mut [Params::boxed(1)]);

        opt.set_type(OptimizerType::Adam);
        assert_eq!(opt.iteration(), 0);
        assert_eq!(opt.parameter("momentum"), 0.0);
        assert_eq!(opt.parameter("beta2"), 0.999);

        opt.set_parameter("beta2", 0.99);
        assert_eq!(opt.parameter("beta2"), 0.99);
    }

    #[test]
    fn test_default_is_adam() {
        let opt = Optimizer::default();
        assert_eq!(opt.kind(), OptimizerType::Adam);
        assert_eq!(opt.learning_rate(), 0.001);
    }

    #[test]
    fn test_parse_optimizer_names() {
        assert_eq!("RMSprop".parse::<OptimizerType>().unwrap(), OptimizerType::RmsProp);
        assert_eq!("nadam".parse::<OptimizerType>().unwrap(), OptimizerType::Nadam);
        assert!("lbfgs".parse::<OptimizerType>().is_err());
    }
}
