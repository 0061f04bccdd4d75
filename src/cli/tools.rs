use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use railhost::{DiskCatalog, tools::export_manifests};

#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// Directory of manifest files
    pub dir: PathBuf,
}

pub async fn execute(args: ToolsArgs) -> anyhow::Result<()> {
    let catalog = DiskCatalog::load(&args.dir)
        .with_context(|| format!("could not load catalog {}", args.dir.display()))?;
    let manifests: Vec<_> = catalog.entries().into_iter().map(|(_, m)| m).collect();
    let tools = export_manifests(&manifests);
    println!("{}", serde_json::to_string_pretty(&tools)?);
    Ok(())
}
