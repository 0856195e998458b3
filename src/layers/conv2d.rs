//! 2-D Convolution Layer
//!
//! Slides `filters` kernels of size `k × k × channels` over an input volume
//! and produces one output channel per filter (cross-correlation, no kernel
//! flip, no activation).
//!
//! ## Shapes
//!
//! ```text
//! Input:   [h, w, c]
//! Weights: [filters, k, k, c]
//! Bias:    [filters]
//! Output:  [(h + 2p - k)/s + 1, (w + 2p - k)/s + 1, filters]
//! ```
//!
//! Positions that fall into the zero padding contribute nothing.
//!
//! ## Backward Pass
//!
//! For every output cell `(oh, ow, f)` with incoming gradient `g` and every
//! kernel offset `(kh, kw)` that lands inside the input at `(ih, iw)`:
//!
//! ```text
//! grad_W[f, kh, kw, c] += g · x[ih, iw, c]
//! grad_x[ih, iw, c]    += g · W[f, kh, kw, c]
//! grad_b[f]            += g
//! ```

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::layers::{
    check_output_shape, missing_forward, not_initialized, random_init, Layer, LayerKind, ParamRef,
};
use crate::tensor::Tensor;

pub const MIN_FILTERS: usize = 1;
pub const MAX_FILTERS: usize = 512;
pub const MIN_KERNEL_SIZE: usize = 1;
pub const MAX_KERNEL_SIZE: usize = 7;
pub const MIN_STRIDE: usize = 1;
pub const MAX_STRIDE: usize = 5;
pub const MAX_PADDING: usize = 64;

/// Convolution over `[height, width, channels]` volumes
#[derive(Debug)]
pub struct Conv2D {
    filters: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    /// Flattened `[filters][k][k][channels]`
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
    weight_grads: Vec<f64>,
    bias_grads: Vec<f64>,
    cached_input: Option<Tensor>,
}

impl Conv2D {
    /// Create a convolution layer
    ///
    /// # Arguments
    ///
    /// * `filters` - Number of output channels, 1 to 512
    /// * `kernel_size` - Square kernel side, 1 to 7
    /// * `stride` - Step between windows, 1 to 5
    /// * `padding` - Zero padding on every border, 0 to 64
    pub fn new(filters: usize, kernel_size: usize, stride: usize, padding: usize) -> Result<Self> {
        if !(MIN_FILTERS..=MAX_FILTERS).contains(&filters) {
            return Err(Error::Config(format!(
                "conv2d filters must be in {MIN_FILTERS}..={MAX_FILTERS}, got {filters}"
            )));
        }
        if !(MIN_KERNEL_SIZE..=MAX_KERNEL_SIZE).contains(&kernel_size) {
            return Err(Error::Config(format!(
                "conv2d kernel size must be in {MIN_KERNEL_SIZE}..={MAX_KERNEL_SIZE}, got {kernel_size}"
            )));
        }
        if !(MIN_STRIDE..=MAX_STRIDE).contains(&stride) {
            return Err(Error::Config(format!(
                "conv2d stride must be in {MIN_STRIDE}..={MAX_STRIDE}, got {stride}"
            )));
        }
        if padding > MAX_PADDING {
            return Err(Error::Config(format!(
                "conv2d padding must be at most {MAX_PADDING}, got {padding}"
            )));
        }
        Ok(Self {
            filters,
            kernel_size,
            stride,
            padding,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            weights: Vec::new(),
            biases: Vec::new(),
            weight_grads: Vec::new(),
            bias_grads: Vec::new(),
            cached_input: None,
        })
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    #[inline]
    fn weight_index(&self, f: usize, kh: usize, kw: usize, c: usize) -> usize {
        let channels = self.input_shape[2];
        ((f * self.kernel_size + kh) * self.kernel_size + kw) * channels + c
    }

    /// Input coordinate touched by output `o` at kernel offset `k`, if it is
    /// not in the padding
    #[inline]
    fn input_coord(&self, o: usize, k: usize, limit: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(self.padding)
            .filter(|&i| i < limit)
    }
}

fn conv_output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = padding.checked_mul(2)?.checked_add(input)?;
    let span = padded.checked_sub(kernel)?;
    Some(span / stride + 1)
}

impl Layer for Conv2D {
    fn kind(&self) -> LayerKind {
        LayerKind::Conv2D
    }

    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let [h, w, c] = input_shape else {
            return Err(Error::Config(format!(
                "conv2d expects a [height, width, channels] input, got {input_shape:?}"
            )));
        };
        if *c == 0 {
            return Err(Error::Config("conv2d input needs at least one channel".into()));
        }
        match (
            conv_output_size(*h, self.kernel_size, self.stride, self.padding),
            conv_output_size(*w, self.kernel_size, self.stride, self.padding),
        ) {
            (Some(oh), Some(ow)) => Ok(vec![oh, ow, self.filters]),
            _ => Err(Error::Config(format!(
                "conv2d kernel {} does not fit input {h}x{w} with padding {}",
                self.kernel_size, self.padding
            ))),
        }
    }

    /// Weights uniform in `±sqrt(6 / (k·k·channels))`, biases zero
    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()> {
        check_output_shape(self, input_shape, output_shape)?;
        let channels = input_shape[2];
        let fan_in = self.kernel_size * self.kernel_size * channels;
        let size = self.filters * fan_in;
        let limit = (6.0 / fan_in as f64).sqrt();

        self.weights = random_init(size, limit);
        self.biases = vec![0.0; self.filters];
        self.weight_grads = vec![0.0; size];
        self.bias_grads = vec![0.0; self.filters];
        self.input_shape = input_shape.to_vec();
        self.output_shape = output_shape.to_vec();
        self.cached_input = None;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        !self.input_shape.is_empty()
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if !self.is_initialized() {
            return Err(not_initialized(self.kind()));
        }
        input.ensure_shape(&self.input_shape)?;

        let (in_h, in_w, channels) = (self.input_shape[0], self.input_shape[1], self.input_shape[2]);
        let (out_w, filters) = (self.output_shape[1], self.filters);
        let mut output = Tensor::zeros(self.output_shape.clone());

        // One output row per task
        let layer = &*self;
        output
            .data
            .par_chunks_mut(out_w * filters)
            .enumerate()
            .for_each(|(oh, row)| {
                for ow in 0..out_w {
                    for f in 0..filters {
                        let mut sum = layer.biases[f];
                        for kh in 0..layer.kernel_size {
                            let Some(ih) = layer.input_coord(oh, kh, in_h) else {
                                continue;
                            };
                            for kw in 0..layer.kernel_size {
                                let Some(iw) = layer.input_coord(ow, kw, in_w) else {
                                    continue;
                                };
                                let x = &input.data[input.offset3(ih, iw, 0)..][..channels];
                                let w = &layer.weights[layer.weight_index(f, kh, kw, 0)..][..channels];
                                sum += x.iter().zip(w).map(|(a, b)| a * b).sum::<f64>();
                            }
                        }
                        row[ow * filters + f] = sum;
                    }
                }
            });

        self.cached_input = Some(input.clone());
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        input.ensure_shape(&self.input_shape)?;
        grad_output.ensure_shape(&self.output_shape)?;
        let cached = self
            .cached_input
            .take()
            .ok_or_else(|| missing_forward(LayerKind::Conv2D))?;

        let (in_h, in_w, channels) = (self.input_shape[0], self.input_shape[1], self.input_shape[2]);
        let (out_h, out_w) = (self.output_shape[0], self.output_shape[1]);
        let mut grad_input = Tensor::zeros(self.input_shape.clone());

        for oh in 0..out_h {
            for ow in 0..out_w {
                for f in 0..self.filters {
                    let g = grad_output.get3(oh, ow, f);
                    if g == 0.0 {
                        continue;
                    }
                    self.bias_grads[f] += g;
                    for kh in 0..self.kernel_size {
                        let Some(ih) = self.input_coord(oh, kh, in_h) else {
                            continue;
                        };
                        for kw in 0..self.kernel_size {
                            let Some(iw) = self.input_coord(ow, kw, in_w) else {
                                continue;
                            };
                            let x_off = input.offset3(ih, iw, 0);
                            let w_off = self.weight_index(f, kh, kw, 0);
                            for c in 0..channels {
                                self.weight_grads[w_off + c] += g * input.data[x_off + c];
                                grad_input.data[x_off + c] += g * self.weights[w_off + c];
                            }
                        }
                    }
                }
            }
        }

        self.cached_input = Some(cached);
        Ok(grad_input)
    }

    fn parameters(&mut self) -> Vec<ParamRef<'_>> {
        vec![
            ParamRef {
                values: &mut self.weights,
                grads: &mut self.weight_grads,
            },
            ParamRef {
                values: &mut self.biases,
                grads: &mut self.bias_grads,
            },
        ]
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::{check_input_gradient, dot, sample_tensor};

    fn layer(filters: usize, k: usize, s: usize, p: usize, input: [usize; 3]) -> Conv2D {
        let mut conv = Conv2D::new(filters, k, s, p).unwrap();
        let out = conv.output_shape_for(&input).unwrap();
        conv.initialize(&input, &out).unwrap();
        conv
    }

    #[test]
    fn test_parameter_bounds() {
        assert!(Conv2D::new(0, 3, 1, 0).is_err());
        assert!(Conv2D::new(513, 3, 1, 0).is_err());
        assert!(Conv2D::new(8, 8, 1, 0).is_err());
        assert!(Conv2D::new(8, 3, 6, 0).is_err());
        assert!(Conv2D::new(8, 3, 0, 0).is_err());
        assert!(Conv2D::new(512, 7, 5, 3).is_ok());
        assert!(Conv2D::new(1, 1, 1, MAX_PADDING).is_ok());
        assert!(matches!(
            Conv2D::new(1, 1, 1, usize::MAX),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_output_size_never_overflows() {
        assert_eq!(conv_output_size(4, 1, 1, usize::MAX), None);
        assert_eq!(conv_output_size(usize::MAX, 1, 1, 1), None);
        assert_eq!(conv_output_size(2, 5, 1, 1), None);
        assert_eq!(conv_output_size(4, 3, 1, 1), Some(4));
    }

    #[test]
    fn test_output_shape_formula() {
        let conv = Conv2D::new(4, 3, 2, 1).unwrap();
        // (7 + 2 - 3) / 2 + 1 = 4
        assert_eq!(conv.output_shape_for(&[7, 7, 3]).unwrap(), vec![4, 4, 4]);
        let conv = Conv2D::new(2, 5, 1, 0).unwrap();
        assert!(conv.output_shape_for(&[3, 3, 1]).is_err());
        assert!(conv.output_shape_for(&[9]).is_err());
    }

    #[test]
    fn test_known_kernel() {
        let mut conv = layer(1, 2, 1, 0, [2, 2, 1]);
        conv.weights = vec![1.0, 0.0, 0.0, 1.0];
        conv.biases = vec![0.5];
        let input = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2, 1]).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.shape, vec![1, 1, 1]);
        assert_eq!(out.data, vec![5.5]);
    }

    #[test]
    fn test_padding_keeps_spatial_size() {
        let mut conv = layer(3, 3, 1, 1, [4, 4, 2]);
        let out = conv.forward(&sample_tensor(vec![4, 4, 2], 1)).unwrap();
        assert_eq!(out.shape, vec![4, 4, 3]);
    }

    #[test]
    fn test_input_gradient_matches_finite_differences() {
        let mut conv = layer(2, 3, 2, 1, [5, 5, 2]);
        let input = sample_tensor(vec![5, 5, 2], 7);
        check_input_gradient(&mut conv, &input, 1e-6);
    }

    #[test]
    fn test_weight_and_bias_gradients() {
        let mut conv = layer(2, 2, 1, 0, [3, 3, 1]);
        let input = sample_tensor(vec![3, 3, 1], 8);
        conv.forward(&input).unwrap();
        let grad = sample_tensor(vec![2, 2, 2], 9);
        conv.backward(&input, &grad).unwrap();
        let analytic = conv.weight_grads.clone();

        let h = 1e-6;
        for k in 0..conv.weights.len() {
            let original = conv.weights[k];
            conv.weights[k] = original + h;
            let lp = dot(&conv.forward(&input).unwrap(), &grad);
            conv.weights[k] = original - h;
            let lm = dot(&conv.forward(&input).unwrap(), &grad);
            conv.weights[k] = original;
            assert!(((lp - lm) / (2.0 * h) - analytic[k]).abs() < 1e-6);
        }

        let bias0: f64 = (0..4).map(|i| grad.data[i * 2]).sum();
        assert!((conv.bias_grads[0] - bias0).abs() < 1e-12);
    }
}
