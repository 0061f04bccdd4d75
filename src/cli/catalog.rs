use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use railhost::{DiskCatalog, session::capabilities_from};

#[derive(Args, Debug)]
pub struct CatalogArgs {
    /// Directory of manifest files
    pub dir: PathBuf,
}

pub async fn execute(args: CatalogArgs) -> anyhow::Result<()> {
    let catalog = DiskCatalog::load(&args.dir)
        .with_context(|| format!("could not load catalog {}", args.dir.display()))?;

    if catalog.is_empty() {
        println!("No manifests in {}", args.dir.display());
        return Ok(());
    }
    for (tag, manifest) in catalog.entries() {
        let language = if manifest.language.is_empty() {
            "unknown"
        } else {
            manifest.language.as_str()
        };
        println!("{tag} ({language})");
        for cap in capabilities_from(&manifest) {
            println!("  {}", cap.qualified_name());
        }
    }
    Ok(())
}
