use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod call;
pub mod catalog;
pub mod run;
pub mod schema;
pub mod tools;

use call::CallArgs;
use catalog::CatalogArgs;
use run::RunArgs;
use schema::SchemaArgs;
use tools::ToolsArgs;

use railhost::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "railhost",
    about = "Routes function calls from LLM agents to local applications",
    version
)]
pub struct Cli {
    /// `.env` file to read RAILHOST_* settings from
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker until Ctrl-C
    Run(RunArgs),

    /// Call a function on a running broker
    Call(CallArgs),

    /// List what a catalog directory provides
    Catalog(CatalogArgs),

    /// Print LLM tool definitions for a catalog directory
    Tools(ToolsArgs),

    /// Emit the JSON-Schema of the wire messages
    Schema(SchemaArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Call(args) => call::execute(args, context).await,
        Commands::Catalog(args) => catalog::execute(args).await,
        Commands::Tools(args) => tools::execute(args).await,
        Commands::Schema(args) => schema::execute(args).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default())
}
