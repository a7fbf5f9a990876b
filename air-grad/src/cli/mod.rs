pub mod toy;

use clap::{Parser, Subcommand};

pub use toy::{ComputeDevice, EstimatorType, ToyArgs};

#[derive(Parser)]
#[command(name = "air-grad")]
#[command(about = "Score-function gradient estimators for variable-step latent models")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train the toy step-count model with NVIL or IW-NVIL
    Toy(ToyArgs),
}
