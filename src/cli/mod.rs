use clap::{Parser, Subcommand};

pub mod run;
pub mod schema;

use run::RunArgs;
use schema::SchemaArgs;

#[derive(Parser, Debug)]
#[command(
    name = "binmux",
    about = "Binary channel multiplexer over an in-process loopback",
    version = "0.2.0"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drive pings and method calls across a loopback pair
    Run(RunArgs),

    /// Emit the JSON-Schema of the settings
    Schema(SchemaArgs),
}

pub async fn execute(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args).await,
        Commands::Schema(args) => schema::execute(args).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_run())
}
