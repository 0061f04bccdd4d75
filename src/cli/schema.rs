use std::{fs, path::PathBuf};

use clap::Args;
use rail_protocol::Envelope;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schema here instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs) -> anyhow::Result<()> {
    let schema = schemars::schema_for!(Envelope);
    let json = serde_json::to_string_pretty(&schema)?;
    match args.out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, json)?;
            println!("Schema written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
