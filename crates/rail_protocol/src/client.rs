//! Reference client runtime.
//!
//! Connects to a broker, announces a [`Manifest`], then serves EXECUTE frames
//! through a user supplied [`FunctionHandler`]. A client can also ask the
//! broker to run a function hosted by some other client via [`RailClient::call`].
//!
//! ```ignore
//! let stream = tokio::net::UnixStream::connect("/tmp/railhost.sock").await?;
//! let transport = Arc::new(StreamTransport::from_stream("railhost", stream));
//! let client = RailClient::connect(transport, ClientOptions::new("calc-1"), Some(Arc::new(Calc))).await?;
//! client.closed().await;
//! ```

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{
    sync::{oneshot, watch},
    time,
};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

use crate::{
    message::{
        ConnectMessage, Envelope, ExecuteMessage, Manifest, ProtocolError, error_payload,
        interpret_result, success_payload,
    },
    transport::{Transport, TransportExt},
};

// -----------------------------------------------------------------------------
// FunctionHandler trait – implement this in your client code
// -----------------------------------------------------------------------------

#[async_trait]
pub trait FunctionHandler: Send + Sync + 'static {
    /// Sent to the broker once, inside CONNECT.
    fn manifest(&self) -> Manifest;

    /// Runs one function. `Err` is reported to the caller as a remote error.
    async fn call(
        &self,
        method: &str,
        class: Option<&str>,
        args: Map<String, Value>,
    ) -> Result<Value, String>;
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("broker did not acknowledge the connection within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("call to '{0}' timed out")]
    Timeout(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("connection to the broker was lost")]
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub instance_id: String,
    pub process_tag: Option<String>,
    pub handshake_timeout: Duration,
}

impl ClientOptions {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            process_tag: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn process_tag(mut self, tag: impl Into<String>) -> Self {
        self.process_tag = Some(tag.into());
        self
    }
}

type Inflight = Arc<DashMap<String, oneshot::Sender<Value>>>;

pub struct RailClient {
    instance_id: String,
    transport: Arc<dyn Transport>,
    inflight: Inflight,
    done: watch::Receiver<bool>,
}

impl RailClient {
    /// Performs the CONNECT/ACK handshake and starts the background reader.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        options: ClientOptions,
        handler: Option<Arc<dyn FunctionHandler>>,
    ) -> Result<Self, ClientError> {
        let manifest = handler.as_ref().map(|h| h.manifest()).unwrap_or_default();
        let hello = Envelope::Connect(ConnectMessage {
            instance_id: options.instance_id.clone(),
            process_tag: options.process_tag.clone(),
            manifest,
        });
        transport.send_envelope(&hello).await?;

        match time::timeout(options.handshake_timeout, transport.receive_envelope()).await {
            Err(_) => return Err(ClientError::HandshakeTimeout(options.handshake_timeout)),
            Ok(Ok(Some(Envelope::Ack))) => {}
            Ok(Ok(Some(other))) => {
                return Err(ProtocolError::Unexpected {
                    expected: "ACK",
                    got: other.kind(),
                }
                .into());
            }
            Ok(Ok(None)) => return Err(ProtocolError::Closed.into()),
            Ok(Err(e)) => return Err(e.into()),
        }
        info!(instance = %options.instance_id, peer = %transport.label(), "connected to broker");

        let inflight: Inflight = Arc::new(DashMap::new());
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(read_loop(
            transport.clone(),
            handler,
            inflight.clone(),
            done_tx,
        ));

        Ok(Self {
            instance_id: options.instance_id,
            transport,
            inflight,
            done: done_rx,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Asks the broker to run `method` on whichever client serves it.
    pub async fn call(
        &self,
        method: &str,
        args: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(request_id.clone(), tx);

        let envelope = Envelope::execute(request_id.clone(), method, None, args);
        if let Err(e) = self.transport.send_envelope(&envelope).await {
            self.inflight.remove(&request_id);
            return Err(e.into());
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => interpret_result(payload).map_err(ClientError::Remote),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.inflight.remove(&request_id);
                Err(ClientError::Timeout(method.to_string()))
            }
        }
    }

    /// Says goodbye and closes the transport.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let res = self
            .transport
            .send_envelope(&Envelope::disconnect(self.instance_id.clone()))
            .await;
        self.transport.close().await;
        res.map_err(ClientError::from)
    }

    /// Resolves once the reader has stopped, whoever closed the connection.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        // the sender is dropped when the reader exits, which also ends the wait
        let _ = done.wait_for(|finished| *finished).await;
    }
}

async fn read_loop(
    transport: Arc<dyn Transport>,
    handler: Option<Arc<dyn FunctionHandler>>,
    inflight: Inflight,
    done: watch::Sender<bool>,
) {
    loop {
        match transport.receive_envelope().await {
            Ok(Some(Envelope::Execute(call))) => {
                // one task per call; a slow function must not stall the reader
                tokio::spawn(serve_call(transport.clone(), handler.clone(), call));
            }
            Ok(Some(Envelope::Result(res))) => match inflight.remove(&res.request_id) {
                Some((_, tx)) => {
                    let _ = tx.send(res.result);
                }
                None => debug!(request_id = %res.request_id, "dropping result for unknown request"),
            },
            Ok(Some(Envelope::Disconnect(_))) => {
                info!("broker closed the session");
                break;
            }
            Ok(Some(other)) => debug!(kind = other.kind(), "ignoring message"),
            Ok(None) => break,
            Err(ProtocolError::Malformed(e)) => warn!("malformed message from broker: {e}"),
            Err(e) => {
                warn!("connection to broker failed: {e}");
                break;
            }
        }
    }

    // dropping the senders wakes every waiting `call` with Disconnected
    inflight.clear();
    transport.close().await;
    let _ = done.send(true);
}

async fn serve_call(
    transport: Arc<dyn Transport>,
    handler: Option<Arc<dyn FunctionHandler>>,
    call: ExecuteMessage,
) {
    let ExecuteMessage {
        request_id,
        method,
        class,
        args,
    } = call;

    let payload = match handler {
        Some(handler) => match handler.call(&method, class.as_deref(), args).await {
            Ok(value) => success_payload(value),
            Err(message) => error_payload(message),
        },
        None => error_payload(format!("Method not found: {method}")),
    };

    if let Err(e) = transport
        .send_envelope(&Envelope::result(request_id, payload))
        .await
    {
        warn!(%method, "could not deliver result: {e}");
    }
}

/// File logging for client processes. Clients hosted over stdio must never
/// log to stdout.
pub fn init_file_logging(log_dir: &Path, file_name: &str, level: &str) -> AnyResult<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer),
        )
        .try_init()?;
    Ok(guard)
}
