//! XOR Training Walkthrough
//!
//! Trains a small deep network on the four XOR rows, prints its predictions
//! and statistics, and optionally compares it with a voting or bagging
//! ensemble of independently initialized networks.
//!
//! ## Usage
//!
//! ```bash
//! # Adam with the default settings
//! cargo run --release --example train_xor
//!
//! # Another optimizer, with a CSV log of every epoch
//! cargo run --release --example train_xor -- --optimizer rmsprop --lr 0.01 --log xor.csv
//!
//! # Add a five-model soft-voting ensemble
//! cargo run --release --example train_xor -- --ensemble voting --models 5
//!
//! # More detail from the library
//! RUST_LOG=synapse=debug cargo run --example train_xor
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use synapse::{
    ActivationFunction, BaggingEnsemble, DeepNetwork, Ensemble, OptimizerType, ProcessedData,
    TrainingConfig, TrainingLogger, VotingEnsemble, VotingType,
};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EnsembleKind {
    Voting,
    Bagging,
}

#[derive(Parser)]
#[command(name = "train_xor", about = "Train a deep network (and optionally an ensemble) on XOR")]
struct Args {
    /// Maximum epochs for a single training run
    #[arg(long, default_value_t = 5000)]
    epochs: usize,

    /// Learning rate
    #[arg(long, default_value_t = 0.05)]
    lr: f64,

    /// sgd, momentum, adagrad, rmsprop, adam, adamax or nadam
    #[arg(long, default_value = "adam")]
    optimizer: OptimizerType,

    /// Hidden layer width
    #[arg(long, default_value_t = 16)]
    hidden: usize,

    /// Write a per-epoch CSV log to this file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Also train an ensemble of this kind
    #[arg(long, value_enum)]
    ensemble: Option<EnsembleKind>,

    /// Ensemble size
    #[arg(long, default_value_t = 3)]
    models: usize,
}

fn xor_data() -> synapse::Result<ProcessedData> {
    ProcessedData::new(
        vec![
            vec![0.0, 0.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
        ],
        vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]],
    )
}

/// Two-output XOR for the ensembles: `[p(false), p(true)]`
fn one_hot(data: &ProcessedData) -> Vec<Vec<f64>> {
    data.targets()
        .iter()
        .map(|t| vec![1.0 - t[0], t[0]])
        .collect()
}

fn build_network(args: &Args, outputs: usize) -> synapse::Result<DeepNetwork> {
    let mut net = DeepNetwork::new(2)?;
    net.add_dense_layer(args.hidden, ActivationFunction::Tanh)?;
    net.add_dense_layer(outputs, ActivationFunction::Sigmoid)?;
    net.set_optimizer(args.optimizer);
    net.set_learning_rate(args.lr);
    net.set_training_config(TrainingConfig {
        max_epochs: args.epochs,
        min_error: 0.005,
        patience: 500,
        log_every: 500,
    })?;
    net.activate()?;
    Ok(net)
}

fn train_ensemble<E: Ensemble>(
    ensemble: &mut E,
    args: &Args,
    data: &ProcessedData,
) -> Result<(), Box<dyn std::error::Error>> {
    for _ in 0..args.models {
        ensemble.core_mut().add_model(build_network(args, 2)?)?;
    }
    ensemble.core_mut().activate()?;

    let inputs = data.inputs().to_vec();
    let targets = one_hot(data);
    ensemble.train(&inputs, &targets, args.epochs)?;

    println!("\n{} ensemble ({} models)", ensemble.kind(), args.models);
    for input in &inputs {
        let p = ensemble.predict(input)?;
        println!("  {input:?} -> p(true) = {:.4}", p[1]);
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("synapse=info")),
        )
        .init();

    let args = Args::parse();
    let data = xor_data()?;

    println!("=== XOR with {} (lr {}) ===", args.optimizer, args.lr);

    let mut net = build_network(&args, 1)?;
    if let Some(path) = &args.log {
        net.set_logger(TrainingLogger::new(path)?);
    }
    println!("{}", net.architecture());

    let report = net.train(&data)?;
    println!(
        "Stopped after {} epochs with error {:.6}{}",
        report.epochs,
        report.final_error,
        if report.converged { " (converged)" } else { "" }
    );

    for (input, target) in data.iter() {
        let output = net.forward(input)?;
        println!("  {input:?} -> {:.4} (target {})", output[0], target[0]);
    }
    println!("{}", serde_json::to_string_pretty(&net.statistics())?);

    match args.ensemble {
        Some(EnsembleKind::Voting) => {
            train_ensemble(&mut VotingEnsemble::new(VotingType::Soft), &args, &data)?
        }
        Some(EnsembleKind::Bagging) => {
            train_ensemble(&mut BaggingEnsemble::default(), &args, &data)?
        }
        None => {}
    }

    if let Some(path) = &args.log {
        println!("\nEpoch log written to {}", path.display());
    }
    Ok(())
}
