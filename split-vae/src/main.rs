use anyhow::Result;
use clap::Parser;
use split_vae::cli::{fit, simulate, Cli, Commands};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Simulate(args) => {
            simulate::run(args)?;
        }
        Commands::Fit(args) => {
            fit::run(args)?;
        }
    }

    Ok(())
}
