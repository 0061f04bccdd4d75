use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, bail};
use clap::Args;
use rail_protocol::Endpoint;
use tokio::signal;
use tracing::info;

use super::CliContext;
use railhost::{
    AssetCatalog, Broker, BrokerConfig, DiskCatalog, logger::init_tracing, watcher::DirectoryWatcher,
};

const CATALOG_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Where to listen: unix:<path>, tcp:<host:port>, pipe:<name> or stdio
    #[arg(long)]
    pub endpoint: Option<Endpoint>,

    /// Directory of manifests for clients that connect without declaring functions
    #[arg(long)]
    pub catalog_dir: Option<PathBuf>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Default per-call timeout in milliseconds
    #[arg(long)]
    pub call_timeout_ms: Option<u64>,
}

impl RunArgs {
    /// Flags win over RAILHOST_* settings.
    fn apply(self, config: &mut BrokerConfig) -> anyhow::Result<()> {
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(dir) = self.catalog_dir {
            config.catalog_dir = Some(dir);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        match self.call_timeout_ms {
            Some(0) => bail!("--call-timeout-ms must be greater than zero"),
            Some(ms) => config.call_timeout = Duration::from_millis(ms),
            None => {}
        }
        Ok(())
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut config = BrokerConfig::from_manager(&context.config_manager)
        .await
        .context("invalid configuration")?;
    args.apply(&mut config)?;

    init_tracing(&config.log_dir, "railhost.log", "railhost-calls.json", &config.log_level)
        .context("could not set up logging")?;
    info!(endpoint = %config.endpoint, "railhost starting");

    let (catalog, _watcher) = match &config.catalog_dir {
        Some(dir) => {
            let (catalog, watcher) = open_catalog(dir).await?;
            (Some(catalog), Some(watcher))
        }
        None => (None, None),
    };

    let broker = Broker::new(config.clone(), catalog);
    broker
        .serve_endpoint(&config.endpoint)
        .await
        .with_context(|| format!("could not listen on {}", config.endpoint))?;

    info!("railhost running; press Ctrl-C to exit");
    signal::ctrl_c().await?;

    info!("railhost shutting down");
    broker.shutdown().await;
    Ok(())
}

async fn open_catalog(dir: &Path) -> anyhow::Result<(Arc<dyn AssetCatalog>, DirectoryWatcher)> {
    let catalog = Arc::new(
        DiskCatalog::load(dir).with_context(|| format!("could not load catalog {}", dir.display()))?,
    );
    let watcher = catalog.watch(CATALOG_POLL_INTERVAL).await?;
    info!(dir = %dir.display(), entries = catalog.len(), "catalog loaded");
    let catalog: Arc<dyn AssetCatalog> = catalog;
    Ok((catalog, watcher))
}
