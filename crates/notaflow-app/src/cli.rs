use clap::{ArgAction, Args, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "notaflow",
    version,
    about = "Queue-driven PDF document pipeline worker"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Increase logging verbosity (-v, -vv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the worker pool until interrupted.
    Run(RunArgs),
    /// Create the relational schema and exit.
    InitDb,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Override the configured worker concurrency.
    #[arg(long)]
    pub concurrency: Option<usize>,
}
