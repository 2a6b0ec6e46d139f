pub mod fit;
pub mod io;
pub mod simulate;

use clap::{Parser, Subcommand};

pub use fit::FitArgs;
pub use simulate::SimulateArgs;

#[derive(Parser)]
#[command(
    name = "split-vae",
    version,
    about = "Split-latent variational autoencoder for single-cell data"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Simulate Poisson counts with cell types and batch effects
    Simulate(SimulateArgs),
    /// Train a split VAE and write latent codes and split effects
    Fit(FitArgs),
}
