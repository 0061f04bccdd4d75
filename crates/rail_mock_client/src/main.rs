use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rail_protocol::{
    Endpoint, FunctionDecl, Manifest, Transport,
    client::{ClientOptions, FunctionHandler, RailClient, init_file_logging},
};
use serde_json::{Map, Value, json};
use tracing::info;

/// Small calculator/echo client used to poke at a running broker.
#[derive(Default, Clone)]
pub struct MockClient;

#[async_trait]
impl FunctionHandler for MockClient {
    fn manifest(&self) -> Manifest {
        Manifest::new("rust")
            .with_function(
                FunctionDecl::new("Add")
                    .class("Calc")
                    .description("Adds two integers")
                    .param("a", "integer", true)
                    .param("b", "integer", true),
            )
            .with_function(
                FunctionDecl::new("Echo")
                    .description("Returns its `text` argument unchanged")
                    .param("text", "string", true),
            )
            .with_function(
                FunctionDecl::new("Sleep")
                    .description("Waits `ms` milliseconds, then returns them")
                    .param("ms", "integer", true),
            )
    }

    async fn call(&self, method: &str, _class: Option<&str>, args: Map<String, Value>) -> Result<Value, String> {
        info!("[mock] {method} {args:?}");
        let int = |key: &str| {
            args.get(key)
                .and_then(Value::as_i64)
                .ok_or_else(|| format!("argument '{key}' must be an integer"))
        };

        match method {
            "Add" => Ok(json!(int("a")? + int("b")?)),
            "Echo" => Ok(args.get("text").cloned().unwrap_or(Value::Null)),
            "Sleep" => {
                let ms = int("ms")?.max(0) as u64;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }
            other => Err(format!("Method not found: {other}")),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let log_dir = env::var("RAIL_LOG_DIR").unwrap_or_else(|_| "logs".into());
    let _guard = init_file_logging(&PathBuf::from(log_dir), "rail_mock_client.log", "info")?;

    let endpoint: Endpoint = env::var("RAIL_ENDPOINT")
        .unwrap_or_else(|_| "unix:/tmp/railhost.sock".into())
        .parse()?;
    let instance_id = env::var("RAIL_INSTANCE_ID").unwrap_or_else(|_| "mock-client".into());

    let transport: Arc<dyn Transport> = Arc::new(
        endpoint
            .connect()
            .await
            .with_context(|| format!("could not reach broker at {endpoint}"))?,
    );
    let client = RailClient::connect(
        transport,
        ClientOptions::new(instance_id).process_tag("rail_mock_client"),
        Some(Arc::new(MockClient)),
    )
    .await?;
    info!("[mock] registered as {}", client.instance_id());

    tokio::select! {
        _ = client.closed() => info!("[mock] broker went away"),
        _ = tokio::signal::ctrl_c() => {
            info!("[mock] ctrl-c, disconnecting");
            client.disconnect().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn add_and_errors() {
        let mock = MockClient;
        assert_eq!(mock.call("Add", Some("Calc"), args(json!({"a": 2, "b": 3}))).await, Ok(json!(5)));
        assert!(mock.call("Add", None, args(json!({"a": "two"}))).await.is_err());
        assert_eq!(
            mock.call("Missing", None, Map::new()).await,
            Err("Method not found: Missing".to_string())
        );
    }
}
