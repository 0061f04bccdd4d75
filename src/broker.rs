use std::{io, sync::Arc};

use rail_protocol::{Endpoint, Envelope, Transport};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    catalog::AssetCatalog,
    config::BrokerConfig,
    events::{BrokerEvent, EventBus},
    gateway::ExecutionGateway,
    listener::{self, Acceptor},
    registry::ClientRegistry,
    router::FunctionRouter,
    session::SessionInfo,
    tools::{ToolDefinition, export_tools},
};

pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: Arc<ClientRegistry>,
    pub(crate) gateway: Arc<ExecutionGateway>,
    pub(crate) catalog: Option<Arc<dyn AssetCatalog>>,
    pub(crate) events: EventBus,
    pub(crate) shutdown: CancellationToken,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns everything a running broker needs. Cloning is cheap and every clone
/// drives the same broker; separate `Broker::new` calls are fully independent.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(config: BrokerConfig, catalog: Option<Arc<dyn AssetCatalog>>) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let events = EventBus::default();
        let router = FunctionRouter::new(registry.clone(), events.clone());
        let gateway = Arc::new(ExecutionGateway::new(router, config.call_timeout));

        Self {
            inner: Arc::new(BrokerInner {
                config,
                registry,
                gateway,
                catalog,
                events,
                shutdown: CancellationToken::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts accepting clients from `acceptor` in the background.
    pub async fn serve(&self, acceptor: Box<dyn Acceptor>) {
        let handle = tokio::spawn(listener::accept_loop(self.inner.clone(), acceptor));
        self.inner.listeners.lock().await.push(handle);
    }

    /// Binds `endpoint` and serves it. `stdio` is attached as a single connection.
    pub async fn serve_endpoint(&self, endpoint: &Endpoint) -> io::Result<()> {
        if *endpoint == Endpoint::Stdio {
            self.attach(Arc::new(endpoint.connect().await?));
            return Ok(());
        }
        let acceptor = listener::bind(endpoint).await?;
        self.serve(acceptor).await;
        Ok(())
    }

    /// Runs a connection that is already established, e.g. stdio or one end of
    /// an in-memory pipe. The first frame must still be CONNECT.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        tokio::spawn(listener::handle_connection(self.inner.clone(), transport))
    }

    pub fn gateway(&self) -> &Arc<ExecutionGateway> {
        &self.inner.gateway
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.registry.all().iter().map(|s| s.info()).collect()
    }

    /// LLM tool definitions for everything currently connected.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        export_tools(&self.inner.registry.all())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stops accepting, says goodbye to every client and fails their pending calls.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let listeners: Vec<_> = self.inner.listeners.lock().await.drain(..).collect();
        for handle in listeners {
            let _ = handle.await;
        }

        let sessions = self.inner.registry.drain();
        let count = sessions.len();
        for session in sessions {
            let _ = session
                .send(&Envelope::disconnect(session.instance_id()))
                .await;
            session.close("broker shutting down").await;
        }
        info!(sessions = count, "broker stopped");
    }
}
