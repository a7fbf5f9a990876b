use air_grad::cli::{toy, Cli, Commands};
use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Toy(args) => {
            toy::run(args)?;
        }
    }

    Ok(())
}
