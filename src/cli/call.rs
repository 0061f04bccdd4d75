use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use clap::Args;
use rail_protocol::{
    Endpoint,
    client::{ClientOptions, RailClient},
};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::CliContext;
use railhost::BrokerConfig;

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Function to call, either `Name` or `Class.Name`
    pub function: String,

    /// Arguments as a JSON object
    #[arg(long, default_value = "{}")]
    pub args: String,

    /// Broker to connect to; defaults to RAILHOST_ENDPOINT
    #[arg(long)]
    pub endpoint: Option<Endpoint>,

    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,
}

pub async fn execute(args: CallArgs, context: &CliContext) -> anyhow::Result<()> {
    let call_args: Map<String, Value> =
        serde_json::from_str(&args.args).context("--args must be a JSON object")?;

    let endpoint = match args.endpoint {
        Some(endpoint) => endpoint,
        None => BrokerConfig::from_manager(&context.config_manager).await?.endpoint,
    };
    let transport = endpoint
        .connect()
        .await
        .with_context(|| format!("could not connect to {endpoint}"))?;

    let options = ClientOptions::new(format!("railhost-cli-{}", Uuid::new_v4()));
    let client = RailClient::connect(Arc::new(transport), options, None).await?;

    let result = client
        .call(&args.function, call_args, Duration::from_millis(args.timeout_ms))
        .await;
    let _ = client.disconnect().await;

    let value = result.map_err(|e| anyhow!("{}: {e}", args.function))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
