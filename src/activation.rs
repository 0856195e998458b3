//! Activation Functions
//!
//! Scalar non-linearities and their first derivatives, used by dense layers
//! and the gates of the recurrent layers.
//!
//! ## Numeric Safety
//!
//! Every function that calls `exp` clamps its argument first so that huge
//! pre-activations saturate instead of overflowing to `inf`/`NaN`:
//!
//! ```text
//! sigmoid, swish:  x clamped to [-700, 700]
//! tanh:            x clamped to [-350, 350]
//! softmax:         max(x) subtracted before exponentiating
//! ```
//!
//! ## GELU
//!
//! Uses the tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! ## Softmax
//!
//! Softmax is the only activation that is not element-wise. Dense layers
//! special-case it: the forward pass normalizes the whole pre-activation
//! vector and the backward pass multiplies by the softmax Jacobian.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

const EXP_CLAMP: f64 = 700.0;
const TANH_CLAMP: f64 = 350.0;
const LEAKY_RELU_ALPHA: f64 = 0.01;
const ELU_ALPHA: f64 = 1.0;
const GELU_COEFF: f64 = 0.044715;

/// Supported activation functions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFunction {
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
    Elu,
    Swish,
    Gelu,
    Softmax,
    Linear,
}

impl ActivationFunction {
    /// Apply the activation to a single pre-activation value
    ///
    /// Softmax has no scalar form; a lone value is squashed with sigmoid.
    /// Use [`apply_vector`](Self::apply_vector) for whole layers.
    pub fn apply(self, x: f64) -> f64 {
        match self {
            ActivationFunction::Sigmoid | ActivationFunction::Softmax => sigmoid(x),
            ActivationFunction::Tanh => x.clamp(-TANH_CLAMP, TANH_CLAMP).tanh(),
            ActivationFunction::Relu => x.max(0.0),
            ActivationFunction::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    LEAKY_RELU_ALPHA * x
                }
            }
            ActivationFunction::Elu => {
                if x > 0.0 {
                    x
                } else {
                    ELU_ALPHA * (x.max(-EXP_CLAMP).exp() - 1.0)
                }
            }
            ActivationFunction::Swish => x * sigmoid(x),
            ActivationFunction::Gelu => {
                0.5 * x * (1.0 + gelu_inner(x).tanh())
            }
            ActivationFunction::Linear => x,
        }
    }

    /// Derivative with respect to the pre-activation value `x`
    pub fn derivative(self, x: f64) -> f64 {
        match self {
            ActivationFunction::Sigmoid | ActivationFunction::Softmax => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
            ActivationFunction::Tanh => {
                let t = x.clamp(-TANH_CLAMP, TANH_CLAMP).tanh();
                1.0 - t * t
            }
            ActivationFunction::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationFunction::LeakyRelu => {
                if x > 0.0 {
                    1.0
                } else {
                    LEAKY_RELU_ALPHA
                }
            }
            ActivationFunction::Elu => {
                if x > 0.0 {
                    1.0
                } else {
                    ELU_ALPHA * x.max(-EXP_CLAMP).exp()
                }
            }
            ActivationFunction::Swish => {
                let s = sigmoid(x);
                s + x * s * (1.0 - s)
            }
            ActivationFunction::Gelu => {
                let sqrt_2_pi = (2.0 / std::f64::consts::PI).sqrt();
                let tanh_inner = gelu_inner(x).tanh();
                let sech_sq = 1.0 - tanh_inner * tanh_inner;
                0.5 * (1.0 + tanh_inner)
                    + 0.5 * x * sech_sq * sqrt_2_pi * (1.0 + 3.0 * GELU_COEFF * x * x)
            }
            ActivationFunction::Linear => 1.0,
        }
    }

    /// Apply the activation to a whole pre-activation vector
    pub fn apply_vector(self, z: &[f64]) -> Vec<f64> {
        match self {
            ActivationFunction::Softmax => apply_softmax(z),
            other => z.iter().map(|&x| other.apply(x)).collect(),
        }
    }

    /// Back-propagate `grad` (w.r.t. the activated output) to the
    /// pre-activations `z`, given the activated `output` of the forward pass
    pub fn backprop_vector(self, z: &[f64], output: &[f64], grad: &[f64]) -> Vec<f64> {
        match self {
            ActivationFunction::Softmax => {
                // J^T g = s ⊙ (g - <g, s>)
                let dot: f64 = grad.iter().zip(output).map(|(g, s)| g * s).sum();
                output
                    .iter()
                    .zip(grad)
                    .map(|(s, g)| s * (g - dot))
                    .collect()
            }
            other => z
                .iter()
                .zip(grad)
                .map(|(&x, &g)| g * other.derivative(x))
                .collect(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ActivationFunction::Sigmoid => "sigmoid",
            ActivationFunction::Tanh => "tanh",
            ActivationFunction::Relu => "relu",
            ActivationFunction::LeakyRelu => "leaky_relu",
            ActivationFunction::Elu => "elu",
            ActivationFunction::Swish => "swish",
            ActivationFunction::Gelu => "gelu",
            ActivationFunction::Softmax => "softmax",
            ActivationFunction::Linear => "linear",
        }
    }
}

impl fmt::Display for ActivationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActivationFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sigmoid" => Ok(ActivationFunction::Sigmoid),
            "tanh" => Ok(ActivationFunction::Tanh),
            "relu" => Ok(ActivationFunction::Relu),
            "leaky_relu" | "leakyrelu" => Ok(ActivationFunction::LeakyRelu),
            "elu" => Ok(ActivationFunction::Elu),
            "swish" => Ok(ActivationFunction::Swish),
            "gelu" => Ok(ActivationFunction::Gelu),
            "softmax" => Ok(ActivationFunction::Softmax),
            "linear" | "identity" => Ok(ActivationFunction::Linear),
            other => Err(Error::Config(format!("unknown activation function '{other}'"))),
        }
    }
}

/// Logistic sigmoid with the input clamped to ±700
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x.clamp(-EXP_CLAMP, EXP_CLAMP)).exp())
}

/// Hyperbolic tangent with the input clamped to ±350
pub fn tanh(x: f64) -> f64 {
    x.clamp(-TANH_CLAMP, TANH_CLAMP).tanh()
}

fn gelu_inner(x: f64) -> f64 {
    (2.0 / std::f64::consts::PI).sqrt() * (x + GELU_COEFF * x * x * x)
}

/// Numerically stable softmax
///
/// Subtracts the maximum before exponentiating, so `[1000, 1000, 1000]`
/// yields `[1/3, 1/3, 1/3]` rather than `NaN`. An empty input gives an
/// empty output.
pub fn apply_softmax(z: &[f64]) -> Vec<f64> {
    let max = z.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        // All -inf (or empty); fall back to uniform.
        let n = z.len().max(1) as f64;
        return vec![1.0 / n; z.len()];
    }
    let exps: Vec<f64> = z.iter().map(|&x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ActivationFunction; 8] = [
        ActivationFunction::Sigmoid,
        ActivationFunction::Tanh,
        ActivationFunction::Relu,
        ActivationFunction::LeakyRelu,
        ActivationFunction::Elu,
        ActivationFunction::Swish,
        ActivationFunction::Gelu,
        ActivationFunction::Linear,
    ];

    #[test]
    fn test_softmax_sums_to_one() {
        let out = apply_softmax(&[0.5, -2.0, 3.0, 1.25]);
        let sum: f64 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(out.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_softmax_large_values_stable() {
        let out = apply_softmax(&[1000.0, 1000.0, 1000.0]);
        for p in out {
            assert!((p - 1.0 / 3.0).abs() < 1e-9);
        }

        let out = apply_softmax(&[-1e6, 0.0, 1e6]);
        assert!(out.iter().all(|p| p.is_finite()));
        assert!((out[2] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_extreme_inputs_do_not_overflow() {
        for f in ALL {
            for x in [-1e6, -800.0, 800.0, 1e6] {
                let y = f.apply(x);
                let d = f.derivative(x);
                if f != ActivationFunction::Relu
                    && f != ActivationFunction::LeakyRelu
                    && f != ActivationFunction::Linear
                    && f != ActivationFunction::Swish
                    && f != ActivationFunction::Gelu
                {
                    assert!(y.is_finite(), "{f} overflowed at {x}");
                }
                assert!(!d.is_nan(), "{f} derivative NaN at {x}");
            }
        }
        assert_eq!(sigmoid(1e6), 1.0);
        assert_eq!(sigmoid(-1e6), 0.0);
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        let h = 1e-6;
        for f in ALL {
            for x in [-2.3, -0.7, 0.4, 1.9] {
                let numeric = (f.apply(x + h) - f.apply(x - h)) / (2.0 * h);
                let analytic = f.derivative(x);
                assert!(
                    (numeric - analytic).abs() < 1e-5,
                    "{f}: numeric {numeric} vs analytic {analytic} at {x}"
                );
            }
        }
    }

    #[test]
    fn test_softmax_backprop_matches_finite_differences() {
        let z = vec![0.3, -1.2, 2.0];
        let grad = vec![0.5, -0.25, 1.0];
        let out = apply_softmax(&z);
        let analytic = ActivationFunction::Softmax.backprop_vector(&z, &out, &grad);

        let h = 1e-6;
        for i in 0..z.len() {
            let mut plus = z.clone();
            let mut minus = z.clone();
            plus[i] += h;
            minus[i] -= h;
            let f = |v: &[f64]| -> f64 {
                apply_softmax(v).iter().zip(&grad).map(|(s, g)| s * g).sum()
            };
            let numeric = (f(&plus) - f(&minus)) / (2.0 * h);
            assert!((numeric - analytic[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_parse_and_display() {
        for f in ALL {
            let parsed: ActivationFunction = f.to_string().parse().unwrap();
            assert_eq!(parsed, f);
        }
        assert!("mystery".parse::<ActivationFunction>().is_err());
    }

    #[test]
    fn test_leaky_relu_and_elu_negative_side() {
        assert!((ActivationFunction::LeakyRelu.apply(-2.0) + 0.02).abs() < 1e-12);
        let elu = ActivationFunction::Elu.apply(-1.0);
        assert!((elu - ((-1.0f64).exp() - 1.0)).abs() < 1e-12);
    }
}
