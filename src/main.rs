mod cli;

use clap::Parser;
use cli::{Cli, CliContext};
use railhost::config::{ConfigManager, EnvConfigManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let context = CliContext::new(ConfigManager(EnvConfigManager::new(args.env_file)));
    let command = args.command.unwrap_or_else(cli::default_command);
    cli::execute(&context, command).await
}
