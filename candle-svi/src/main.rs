use anyhow::Result;
use candle_svi::cli::{bernoulli, normal, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Normal(args) => {
            normal::run(args)?;
        }
        Commands::Bernoulli(args) => {
            bernoulli::run(args)?;
        }
    }

    Ok(())
}
