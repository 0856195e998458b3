//! Max Pooling Layer
//!
//! Takes the maximum of every `pool × pool` window, channel by channel. The
//! position of each winner is remembered so that the backward pass can send
//! the whole gradient of an output cell back to the single input it came
//! from. Ties keep the first maximum in row-major window order.

use crate::error::{Error, Result};
use crate::layers::{check_output_shape, missing_forward, not_initialized, Layer, LayerKind};
use crate::tensor::Tensor;

pub const MIN_POOL_SIZE: usize = 2;
pub const MAX_POOL_SIZE: usize = 8;
pub const MIN_STRIDE: usize = 1;
pub const MAX_STRIDE: usize = 4;

#[derive(Debug)]
pub struct MaxPooling {
    pool_size: usize,
    stride: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    /// Flat input offset of the winner for every output element
    argmax: Option<Vec<usize>>,
}

impl MaxPooling {
    /// Create a pooling layer; `stride` defaults to `pool_size`
    pub fn new(pool_size: usize, stride: Option<usize>) -> Result<Self> {
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&pool_size) {
            return Err(Error::Config(format!(
                "pool size must be in {MIN_POOL_SIZE}..={MAX_POOL_SIZE}, got {pool_size}"
            )));
        }
        let stride = stride.unwrap_or(pool_size);
        if !(MIN_STRIDE..=MAX_STRIDE).contains(&stride) {
            return Err(Error::Config(format!(
                "pooling stride must be in {MIN_STRIDE}..={MAX_STRIDE}, got {stride}"
            )));
        }
        Ok(Self {
            pool_size,
            stride,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            argmax: None,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl Layer for MaxPooling {
    fn kind(&self) -> LayerKind {
        LayerKind::MaxPooling
    }

    fn output_shape_for(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let [h, w, c] = input_shape else {
            return Err(Error::Config(format!(
                "max pooling expects a [height, width, channels] input, got {input_shape:?}"
            )));
        };
        if *h < self.pool_size || *w < self.pool_size || *c == 0 {
            return Err(Error::Config(format!(
                "pool window {} does not fit input {h}x{w}x{c}",
                self.pool_size
            )));
        }
        Ok(vec![
            (h - self.pool_size) / self.stride + 1,
            (w - self.pool_size) / self.stride + 1,
            *c,
        ])
    }

    fn initialize(&mut self, input_shape: &[usize], output_shape: &[usize]) -> Result<()> {
        check_output_shape(self, input_shape, output_shape)?;
        self.input_shape = input_shape.to_vec();
        self.output_shape = output_shape.to_vec();
        self.argmax = None;
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

        let (out_h, out_w, channels) = (
            self.output_shape[0],
            self.output_shape[1],
            self.output_shape[2],
        );
        let mut output = Tensor::zeros(self.output_shape.clone());
        let mut winners = vec![0; output.len()];

        for oh in 0..out_h {
            for ow in 0..out_w {
                for c in 0..channels {
                    let mut best = f64::NEG_INFINITY;
                    let mut best_at = input.offset3(oh * self.stride, ow * self.stride, c);
                    for ph in 0..self.pool_size {
                        for pw in 0..self.pool_size {
                            let at = input.offset3(oh * self.stride + ph, ow * self.stride + pw, c);
                            if input.data[at] > best {
                                best = input.data[at];
                                best_at = at;
                            }
                        }
                    }
                    let out_at = output.offset3(oh, ow, c);
                    output.data[out_at] = best;
                    winners[out_at] = best_at;
                }
            }
        }

        self.argmax = Some(winners);
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> Result<Tensor> {
        input.ensure_shape(&self.input_shape)?;
        grad_output.ensure_shape(&self.output_shape)?;
        let winners = self
            .argmax
            .as_ref()
            .ok_or_else(|| missing_forward(LayerKind::MaxPooling))?;

        let mut grad_input = Tensor::zeros(self.input_shape.clone());
        for (&at, &g) in winners.iter().zip(&grad_output.data) {
            grad_input.data[at] += g;
        }
        Ok(grad_input)
    }
}
