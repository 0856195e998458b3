//! Convolutional Network
//!
//! Image volumes `[height, width, channels]` flow through convolution and
//! pooling layers, are flattened and finish in dense layers.
//!
//! ## Layer Order
//!
//! ```text
//! Conv2D | MaxPooling    while the data is still a volume
//! Flatten                once, turns the volume into a vector
//! Dense                  only after Flatten or another Dense
//! ```
//!
//! Pooling and flatten cannot open the network; every append derives its
//! shape from the previous layer and is rejected when the window no longer
//! fits.

use serde::{Deserialize, Serialize};

use crate::activation::ActivationFunction;
use crate::config::TrainingConfig;
use crate::error::{Error, Result};
use crate::layers::{Conv2D, Dense, Flatten, Layer, LayerKind, MaxPooling};
use crate::network::trainer::{
    run_epochs, squared_error, ErrorHistory, TrainingReport, TrainingState,
};
use crate::network::{
    active_modification, check_target_widths, inactive, LayerStack, NetworkStats,
};
use crate::optimizer::{Optimizer, OptimizerType};
use crate::tensor::Tensor;

pub const MAX_LAYERS: usize = 50;
pub const MIN_IMAGE_SIDE: usize = 1;
pub const MAX_IMAGE_SIDE: usize = 1024;
pub const MIN_CHANNELS: usize = 1;
pub const MAX_CHANNELS: usize = 64;

const NAME: &str = "ConvNetwork";

/// Input volume dimensions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Default for ImageShape {
    fn default() -> Self {
        Self {
            height: 32,
            width: 32,
            channels: 3,
        }
    }
}

impl ImageShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Result<Self> {
        let shape = Self {
            height,
            width,
            channels,
        };
        shape.validate()?;
        Ok(shape)
    }

    pub fn validate(&self) -> Result<()> {
        let sides = MIN_IMAGE_SIDE..=MAX_IMAGE_SIDE;
        if !sides.contains(&self.height) || !sides.contains(&self.width) {
            return Err(Error::Config(format!(
                "image sides must be in {MIN_IMAGE_SIDE}..={MAX_IMAGE_SIDE}, got {}x{}",
                self.height, self.width
            )));
        }
        if !(MIN_CHANNELS..=MAX_CHANNELS).contains(&self.channels) {
            return Err(Error::Config(format!(
                "image channels must be in {MIN_CHANNELS}..={MAX_CHANNELS}, got {}",
                self.channels
            )));
        }
        Ok(())
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }

    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Convolutional network over fixed-size image volumes
#[derive(Debug)]
pub struct ConvNetwork {
    input_shape: ImageShape,
    stack: LayerStack,
    optimizer: Optimizer,
    progress: TrainingState,
    active: bool,
}

impl ConvNetwork {
    pub fn new(input_shape: ImageShape) -> Result<Self> {
        input_shape.validate()?;
        Ok(Self {
            input_shape,
            stack: LayerStack::default(),
            optimizer: Optimizer::new(OptimizerType::Adam, 0.001),
            progress: TrainingState::default(),
            active: false,
        })
    }

    pub fn input_shape(&self) -> ImageShape {
        self.input_shape
    }

    fn current_shape(&self) -> Vec<usize> {
        self.stack
            .output_shape()
            .map_or_else(|| self.input_shape.dims().to_vec(), <[usize]>::to_vec)
    }

    fn append(&mut self, layer: Box<dyn Layer>) -> Result<()> {
        if self.active {
            return Err(active_modification(NAME));
        }
        if self.stack.len() >= MAX_LAYERS {
            return Err(Error::Config(format!(
                "{NAME} holds at most {MAX_LAYERS} layers"
            )));
        }

        let kind = layer.kind();
        let previous = self.stack.last_kind();
        match (kind, previous) {
            (LayerKind::MaxPooling | LayerKind::Flatten, None) => {
                return Err(Error::Config(format!("{kind} cannot be the first layer")));
            }
            (LayerKind::Dense, prev)
                if !matches!(prev, Some(LayerKind::Flatten | LayerKind::Dense)) =>
            {
                return Err(Error::Config(
                    "dense layers must follow a flatten or dense layer".into(),
                ));
            }
            _ => {}
        }

        let input_shape = self.current_shape();
        if let Err(e) = self.stack.push(layer, &input_shape) {
            tracing::warn!(layer = %kind, input = ?input_shape, error = %e, "{NAME} rejected layer");
            return Err(e);
        }
        tracing::info!(
            layer = %kind,
            input = ?input_shape,
            output = ?self.current_shape(),
            "{NAME} layer added"
        );
        Ok(())
    }

    pub fn add_conv2d_layer(
        &mut self,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
    ) -> Result<()> {
        self.append(Box::new(Conv2D::new(filters, kernel_size, stride, padding)?))
    }

    /// `stride` defaults to `pool_size`
    pub fn add_max_pooling_layer(&mut self, pool_size: usize, stride: Option<usize>) -> Result<()> {
        self.append(Box::new(MaxPooling::new(pool_size, stride)?))
    }

    pub fn add_flatten_layer(&mut self) -> Result<()> {
        self.append(Box::new(Flatten::new()))
    }

    pub fn add_dense_layer(&mut self, neurons: usize, activation: ActivationFunction) -> Result<()> {
        self.append(Box::new(Dense::new(neurons, activation)?))
    }

    pub fn clear_layers(&mut self) {
        self.stack.clear();
        self.optimizer.reset();
        self.active = false;
    }

    pub fn layer_count(&self) -> usize {
        self.stack.len()
    }

    pub fn activate(&mut self) -> Result<()> {
        if self.stack.is_empty() {
            return Err(Error::InvalidState(format!(
                "{NAME} needs at least one layer to activate"
            )));
        }
        self.active = true;
        tracing::info!(architecture = %self.architecture(), "{NAME} activated");
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn forward(&mut self, input: &Tensor) -> Result<Vec<f64>> {
        if !self.active {
            return Err(inactive(NAME));
        }
        input.ensure_shape(&self.input_shape.dims())?;
        Ok(self.stack.forward(input)?.into_vec())
    }

    /// Train for exactly `epochs` passes over the images
    ///
    /// The epoch error is the per-image mean squared error averaged over all
    /// images. Zero epochs validates the data and returns without training.
    pub fn train(
        &mut self,
        inputs: &[Tensor],
        targets: &[Vec<f64>],
        epochs: usize,
    ) -> Result<TrainingReport> {
        if !self.active {
            tracing::warn!("{NAME} is not active, training skipped");
            return Err(inactive(NAME));
        }
        if inputs.len() != targets.len() || inputs.is_empty() {
            return Err(Error::InvalidData(format!(
                "need the same non-zero number of images and targets, got {} and {}",
                inputs.len(),
                targets.len()
            )));
        }
        let dims = self.input_shape.dims();
        for image in inputs {
            image.ensure_shape(&dims)?;
        }
        let output_width: usize = self.stack.output_shape_for(&dims)?.iter().product();
        check_target_widths(NAME, targets.iter().map(Vec::as_slice), output_width)?;
        if epochs == 0 {
            return Ok(TrainingReport::idle(&self.progress));
        }

        let stack = &mut self.stack;
        let optimizer = &mut self.optimizer;
        let learning_rate = optimizer.learning_rate();
        let samples = inputs.len() as f64;

        let result = run_epochs(
            NAME,
            &TrainingConfig::fixed_epochs(epochs),
            &mut self.progress,
            learning_rate,
            || {
                let mut total = 0.0;
                for (image, target) in inputs.iter().zip(targets) {
                    let error = stack.backpropagate(image, target)?;
                    total += squared_error(&error) / error.len().max(1) as f64;
                    optimizer.update_weights(stack.layers_mut());
                }
                Ok(total / samples)
            },
        );
        if let Err(e) = &result {
            self.stack.clear_gradients();
            tracing::error!(error = %e, "{NAME} training failed");
        }
        result
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.optimizer.set_learning_rate(learning_rate);
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_optimizer(&mut self, kind: OptimizerType) {
        self.optimizer.set_type(kind);
    }

    pub fn architecture(&self) -> String {
        self.stack.architecture(NAME)
    }

    pub fn output_shape(&self) -> Vec<usize> {
        self.current_shape()
    }

    pub fn error_history(&self) -> &ErrorHistory {
        &self.progress.history
    }

    pub fn training_epochs(&self) -> u64 {
        self.progress.total_epochs
    }

    pub fn statistics(&self) -> NetworkStats {
        NetworkStats {
            architecture: self.architecture(),
            layers: self.stack.len(),
            parameters: self.stack.parameter_count(),
            active: self.active,
            current_error: self.progress.current_error,
            total_epochs: self.progress.total_epochs,
            learning_rate: self.optimizer.learning_rate(),
            optimizer: self.optimizer.kind(),
            recent_errors: self.progress.history.recent(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_net() -> ConvNetwork {
        let mut net = ConvNetwork::new(ImageShape::new(4, 4, 1).unwrap()).unwrap();
        net.add_conv2d_layer(2, 3, 1, 1).unwrap();
        net.add_max_pooling_layer(2, None).unwrap();
        net.add_flatten_layer().unwrap();
        net.add_dense_layer(1, ActivationFunction::Sigmoid).unwrap();
        net
    }

    fn image(values: [f64; 16]) -> Tensor {
        Tensor::new(values.to_vec(), vec![4, 4, 1]).unwrap()
    }

    #[test]
    fn test_image_shape_bounds() {
        assert_eq!(ImageShape::default().dims(), [32, 32, 3]);
        assert!(ImageShape::new(0, 4, 1).is_err());
        assert!(ImageShape::new(4, 1025, 1).is_err());
        assert!(ImageShape::new(4, 4, 65).is_err());
    }

    #[test]
    fn test_shape_chain() {
        let net = small_net();
        assert_eq!(
            net.architecture(),
            "ConvNetwork[Conv2D -> MaxPooling -> Flatten -> Dense]"
        );
        assert_eq!(net.output_shape(), vec![1]);
        // conv 4x4x2 -> pool 2x2x2 -> flatten 8 -> dense 1
        assert_eq!(net.statistics().parameters, (2 * 3 * 3 + 2) + (8 + 1));
    }

    #[test]
    fn test_layer_order_rules() {
        let mut net = ConvNetwork::new(ImageShape::new(8, 8, 1).unwrap()).unwrap();
        assert!(net.add_max_pooling_layer(2, None).is_err());
        assert!(net.add_flatten_layer().is_err());
        assert!(net.add_dense_layer(2, ActivationFunction::Relu).is_err());

        net.add_conv2d_layer(1, 3, 1, 0).unwrap();
        assert!(net.add_dense_layer(2, ActivationFunction::Relu).is_err());
        net.add_flatten_layer().unwrap();
        assert!(net.add_conv2d_layer(1, 3, 1, 0).is_err());
        assert!(net.add_max_pooling_layer(2, None).is_err());
        net.add_dense_layer(2, ActivationFunction::Relu).unwrap();
        net.add_dense_layer(1, ActivationFunction::Linear).unwrap();
        assert_eq!(net.layer_count(), 4);
    }

    #[test]
    fn test_window_too_large_rejected() {
        let mut net = ConvNetwork::new(ImageShape::new(3, 3, 1).unwrap()).unwrap();
        net.add_conv2d_layer(1, 3, 1, 0).unwrap();
        // output is 1x1, no 2x2 window fits
        assert!(matches!(net.add_max_pooling_layer(2, None), Err(Error::Config(_))));
        assert_eq!(net.layer_count(), 1);
    }

    #[test]
    fn test_forward_checks_state_and_shape() {
        let mut net = small_net();
        let x = image([0.5; 16]);
        assert!(net.forward(&x).is_err());
        net.activate().unwrap();
        assert_eq!(net.forward(&x).unwrap().len(), 1);
        assert!(net.forward(&Tensor::zeros(vec![4, 4, 2])).is_err());
        assert!(net.add_flatten_layer().is_err());

        net.clear_layers();
        assert!(!net.is_active());
        assert!(net.activate().is_err());
    }

    #[test]
    fn test_training_separates_two_patterns() {
        let mut net = small_net();
        net.set_learning_rate(0.01);
        net.activate().unwrap();

        let mut left = [0.0; 16];
        let mut right = [0.0; 16];
        for row in 0..4 {
            left[row * 4] = 1.0;
            left[row * 4 + 1] = 1.0;
            right[row * 4 + 2] = 1.0;
            right[row * 4 + 3] = 1.0;
        }
        let inputs = vec![image(left), image(right)];
        let targets = vec![vec![1.0], vec![0.0]];

        let report = net.train(&inputs, &targets, 300).unwrap();
        assert_eq!(report.epochs, 300);
        assert_eq!(net.training_epochs(), 300);

        let history = net.error_history().to_vec();
        assert!(history[history.len() - 1] < history[0]);
        let a = net.forward(&inputs[0]).unwrap()[0];
        let b = net.forward(&inputs[1]).unwrap()[0];
        assert!(a > b, "{a} vs {b}");
    }

    #[test]
    fn test_mismatched_training_data_rejected() {
        let mut net = small_net();
        net.activate().unwrap();
        let inputs = vec![image([0.0; 16])];
        assert!(matches!(
            net.train(&inputs, &[], 1),
            Err(Error::InvalidData(_))
        ));
        assert!(net.train(&inputs, &[vec![0.0, 1.0]], 1).is_err());
    }

    #[test]
    fn test_rejected_training_leaves_weights_intact() {
        let mut net = small_net();
        net.activate().unwrap();
        let sample = image([0.5; 16]);
        let before = net.forward(&sample).unwrap();

        let inputs = vec![image([0.0; 16]), image([1.0; 16])];
        let targets = vec![vec![0.0], vec![1.0, 0.0]];
        assert!(matches!(
            net.train(&inputs, &targets, 3),
            Err(Error::ShapeMismatch { .. })
        ));
        assert_eq!(net.forward(&sample).unwrap(), before);
        assert_eq!(net.training_epochs(), 0);
    }

    #[test]
    fn test_zero_epochs_is_a_no_op() {
        let mut net = small_net();
        net.activate().unwrap();
        let input = image([0.5; 16]);
        let before = net.forward(&input).unwrap();

        let report = net.train(&[input.clone()], &[vec![1.0]], 0).unwrap();
        assert_eq!(report.epochs, 0);
        assert!(!report.converged);
        assert_eq!(net.forward(&input).unwrap(), before);
        // the data is still checked
        assert!(net.train(&[input], &[vec![1.0, 1.0]], 0).is_err());
    }
}
