//! Synapse: Neural Networks with Hand-Written Backpropagation
//!
//! Layers, optimizers, network containers and ensembles implemented from
//! scratch over plain `f64` buffers. Every forward pass, gradient and update
//! rule is spelled out in the source.
//!
//! # Modules
//!
//! - [`activation`] - Activation functions and their derivatives
//! - [`layers`] - Dense, dropout, batch-norm, conv, pooling, flatten, LSTM, GRU
//! - [`optimizer`] - SGD, Momentum, AdaGrad, RMSProp, Adam, Adamax, Nadam
//! - [`network`] - Flat, deep, convolutional and recurrent containers
//! - [`ensemble`] - Bagging, stacking and voting over trained networks
//! - [`data`] - Row normalization into training sets
//! - [`config`] - Stopping criteria for the training loop
//! - [`training_logger`] - Per-epoch CSV logs
//!
//! # Example
//!
//! ```rust,no_run
//! use synapse::{ActivationFunction, DeepNetwork, ProcessedData};
//!
//! let data = ProcessedData::new(
//!     vec![vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]],
//!     vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]],
//! )?;
//!
//! let mut net = DeepNetwork::new(2)?;
//! net.add_dense_layer(16, ActivationFunction::Tanh)?;
//! net.add_dense_layer(1, ActivationFunction::Sigmoid)?;
//! net.set_learning_rate(0.05);
//! net.activate()?;
//!
//! let report = net.train(&data)?;
//! println!("{} epochs, error {:.4}", report.epochs, report.final_error);
//! println!("{:?}", net.forward(&[1.0, 0.0])?);
//! # Ok::<(), synapse::Error>(())
//! ```

pub mod activation;
pub mod config;
pub mod data;
pub mod ensemble;
pub mod error;
pub mod layers;
pub mod network;
pub mod optimizer;
pub mod tensor;
pub mod training_logger;

// Re-export main types for convenience
pub use activation::ActivationFunction;
pub use config::TrainingConfig;
pub use data::{DataNormalizer, ProcessedData};
pub use ensemble::{
    BaggingEnsemble, Ensemble, EnsembleType, Model, StackingEnsemble, VotingEnsemble, VotingType,
};
pub use error::{Error, Result};
pub use layers::{Layer, LayerKind};
pub use network::{
    ConvNetwork, DeepNetwork, FlatTopology, ImageShape, NetworkStats, NeuralNetwork,
    RecurrentNetwork, Sequence, TrainingReport,
};
pub use optimizer::{Optimizer, OptimizerType};
pub use tensor::Tensor;
pub use training_logger::TrainingLogger;
