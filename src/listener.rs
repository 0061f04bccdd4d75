//! Accepting connections and running one session per connection.
//!
//! ```text
//! accept -> handshake (CONNECT, ACK) -> message loop -> cleanup
//! ```
//!
//! Each connection gets its own task, so a slow or silent client never holds
//! up the accept loop or anybody else's handshake.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rail_protocol::{
    Endpoint, Envelope, FrameError, Manifest, ProtocolError, StreamTransport, Transport, TransportExt,
    message::{ConnectMessage, ExecuteMessage, error_payload, success_payload},
};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    broker::BrokerInner,
    events::{AssociationOutcome, BrokerEvent},
    gateway::{GatewayError, Target},
    session::{Session, capabilities_from},
};

/// Source of incoming connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<Arc<dyn Transport>>;

    fn label(&self) -> String;
}

/// Opens a listener for `endpoint`. `stdio` cannot be listened on; attach it instead.
pub async fn bind(endpoint: &Endpoint) -> io::Result<Box<dyn Acceptor>> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(UnixAcceptor::bind(path.clone())?)),
        Endpoint::Tcp(addr) => Ok(Box::new(TcpAcceptor::bind(addr).await?)),
        #[cfg(windows)]
        Endpoint::Pipe(name) => Ok(Box::new(PipeAcceptor::bind(name)?)),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot listen on {other}"),
        )),
    }
}

#[cfg(unix)]
pub struct UnixAcceptor {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
    accepted: AtomicU64,
}

#[cfg(unix)]
impl UnixAcceptor {
    /// Binds `path`, replacing a socket file left behind by a previous run.
    pub fn bind(path: std::path::PathBuf) -> io::Result<Self> {
        if path.exists() {
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self {
            listener,
            path,
            accepted: AtomicU64::new(0),
        })
    }
}

#[cfg(unix)]
#[async_trait]
impl Acceptor for UnixAcceptor {
    async fn accept(&self) -> io::Result<Arc<dyn Transport>> {
        let (stream, _) = self.listener.accept().await?;
        let n = self.accepted.fetch_add(1, Ordering::Relaxed);
        let label = format!("unix:{}#{n}", self.path.display());
        Ok(Arc::new(StreamTransport::from_stream(label, stream)))
    }

    fn label(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

#[cfg(unix)]
impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct TcpAcceptor {
    listener: tokio::net::TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<Arc<dyn Transport>> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(StreamTransport::from_stream(format!("tcp:{addr}"), stream)))
    }

    fn label(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("tcp:{addr}"),
            Err(_) => "tcp".to_string(),
        }
    }
}

/// Windows named pipe server. One pipe instance waits for the next client
/// while earlier instances are in use.
#[cfg(windows)]
pub struct PipeAcceptor {
    name: String,
    next: tokio::sync::Mutex<tokio::net::windows::named_pipe::NamedPipeServer>,
    accepted: AtomicU64,
}

#[cfg(windows)]
impl PipeAcceptor {
    pub fn bind(name: &str) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let first = ServerOptions::new().first_pipe_instance(true).create(name)?;
        Ok(Self {
            name: name.to_string(),
            next: tokio::sync::Mutex::new(first),
            accepted: AtomicU64::new(0),
        })
    }
}

#[cfg(windows)]
#[async_trait]
impl Acceptor for PipeAcceptor {
    async fn accept(&self) -> io::Result<Arc<dyn Transport>> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let mut next = self.next.lock().await;
        next.connect().await?;
        let fresh = ServerOptions::new().create(&self.name)?;
        let connected = std::mem::replace(&mut *next, fresh);
        let n = self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(StreamTransport::from_stream(
            format!("pipe:{}#{n}", self.name),
            connected,
        )))
    }

    fn label(&self) -> String {
        format!("pipe:{}", self.name)
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no CONNECT within {0:?}")]
    Timeout(Duration),
    #[error("peer closed before CONNECT")]
    Closed,
    #[error("expected CONNECT, got {0}")]
    Unexpected(&'static str),
    #[error("CONNECT without an instance id")]
    MissingInstanceId,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub(crate) async fn accept_loop(inner: Arc<BrokerInner>, acceptor: Box<dyn Acceptor>) {
    info!(endpoint = %acceptor.label(), "listening for clients");
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        match accepted {
            Ok(transport) => {
                debug!(peer = %transport.label(), "accepted connection");
                tokio::spawn(handle_connection(inner.clone(), transport));
            }
            Err(e) => {
                // e.g. out of file descriptors; back off instead of spinning
                warn!("accept failed: {e}");
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    info!(endpoint = %acceptor.label(), "listener stopped");
}

/// Runs one connection from handshake to cleanup.
pub(crate) async fn handle_connection(inner: Arc<BrokerInner>, transport: Arc<dyn Transport>) {
    let peer = transport.label().to_string();

    let outcome = tokio::select! {
        _ = inner.shutdown.cancelled() => {
            transport.close().await;
            return;
        }
        outcome = handshake(&inner, transport.clone()) => outcome,
    };
    let session = match outcome {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, "rejecting connection: {e}");
            if !matches!(e, HandshakeError::Closed) {
                inner.events.emit(BrokerEvent::ProtocolViolation {
                    peer,
                    detail: e.to_string(),
                });
            }
            transport.close().await;
            return;
        }
    };

    message_loop(&inner, &session).await;

    let was_current = inner.registry.unregister_if_same(&session);
    let failed_calls = session.close("client disconnected").await;
    info!(
        instance = %session.instance_id(),
        failed_calls,
        replaced = !was_current,
        "session closed"
    );
    inner.events.emit(BrokerEvent::SessionClosed {
        instance_id: session.instance_id().to_string(),
        failed_calls,
    });
}

async fn handshake(
    inner: &Arc<BrokerInner>,
    transport: Arc<dyn Transport>,
) -> Result<Arc<Session>, HandshakeError> {
    let timeout = inner.config.handshake_timeout;
    let first = time::timeout(timeout, transport.receive_envelope())
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))??;

    let ConnectMessage {
        instance_id,
        process_tag,
        mut manifest,
    } = match first {
        Some(Envelope::Connect(hello)) => hello,
        Some(other) => return Err(HandshakeError::Unexpected(other.kind())),
        None => return Err(HandshakeError::Closed),
    };

    let instance_id = instance_id.trim().to_string();
    if instance_id.is_empty() {
        return Err(HandshakeError::MissingInstanceId);
    }
    let process_tag = process_tag
        .or_else(|| manifest.process_tag.clone())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let mut capabilities = capabilities_from(&manifest);
    let mut auto_associated = false;
    if capabilities.is_empty() {
        if let Some(tag) = &process_tag {
            if let Some(found) = associate(inner, &instance_id, tag) {
                capabilities = capabilities_from(&found);
                auto_associated = true;
                if manifest.language.trim().is_empty() {
                    manifest.language = found.language;
                }
                manifest.supports_ambient_dispatch = manifest
                    .supports_ambient_dispatch
                    .or(found.supports_ambient_dispatch);
            }
        }
    }

    let ambient_dispatch = manifest
        .supports_ambient_dispatch
        .unwrap_or_else(|| inner.config.is_ambient(manifest.language_tag()));

    let session = Arc::new(
        Session::builder(instance_id.clone())
            .language(manifest.language.clone())
            .process_tag(process_tag)
            .process_id(manifest.process_id_string())
            .capabilities(capabilities)
            .ambient_dispatch(ambient_dispatch)
            .auto_associated(auto_associated)
            .max_pending(inner.config.max_pending_calls)
            .build(transport, inner.shutdown.child_token()),
    );

    if inner.registry.register(session.clone()).await.is_some() {
        inner.events.emit(BrokerEvent::SessionReplaced {
            instance_id: instance_id.clone(),
        });
    }

    if let Err(e) = session.send(&Envelope::Ack).await {
        inner.registry.unregister_if_same(&session);
        session.close("handshake failed").await;
        return Err(e.into());
    }

    info!(
        instance = %instance_id,
        language = %session.language(),
        functions = session.capabilities().len(),
        ambient_dispatch,
        auto_associated,
        "session registered"
    );
    inner.events.emit(BrokerEvent::SessionRegistered {
        instance_id,
        language: session.language().to_string(),
        functions: session.capabilities().len(),
        ambient_dispatch,
    });
    Ok(session)
}

/// Looks `tag` up in the catalog for a client that declared nothing.
fn associate(inner: &BrokerInner, instance_id: &str, tag: &str) -> Option<Manifest> {
    let (found, outcome) = match &inner.catalog {
        None => (None, AssociationOutcome::NoCatalog),
        Some(catalog) => match catalog.lookup(tag) {
            Some(m) => {
                let functions = m.functions.len();
                (Some(m), AssociationOutcome::Matched { functions })
            }
            None => (None, AssociationOutcome::NotFound),
        },
    };

    match outcome {
        AssociationOutcome::Matched { functions } => {
            info!(instance = %instance_id, %tag, functions, "auto-associated from catalog")
        }
        AssociationOutcome::NotFound => {
            warn!(instance = %instance_id, %tag, "no catalog entry; session has no functions")
        }
        AssociationOutcome::NoCatalog => {
            warn!(instance = %instance_id, %tag, "client declared no functions and no catalog is configured")
        }
    }
    inner.events.emit(BrokerEvent::AutoAssociation {
        instance_id: instance_id.to_string(),
        process_tag: tag.to_string(),
        outcome,
    });
    found
}

async fn message_loop(inner: &Arc<BrokerInner>, session: &Arc<Session>) {
    let cancel = session.cancel_token().clone();
    let transport = session.transport().clone();

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.receive_envelope() => received,
        };

        match received {
            Ok(Some(Envelope::Result(res))) => {
                if !session.pending().fulfil(&res.request_id, res.result) {
                    debug!(
                        instance = %session.instance_id(),
                        request_id = %res.request_id,
                        "discarding result for an expired or unknown request"
                    );
                    inner.events.emit(BrokerEvent::StaleResult {
                        instance_id: session.instance_id().to_string(),
                        request_id: res.request_id,
                    });
                }
            }
            Ok(Some(Envelope::Execute(call))) => {
                tokio::spawn(serve_client_call(inner.clone(), session.clone(), call));
            }
            Ok(Some(Envelope::Disconnect(_))) => {
                debug!(instance = %session.instance_id(), "client said goodbye");
                break;
            }
            Ok(Some(other)) => {
                violation(inner, session, format!("unexpected {} after handshake", other.kind()))
            }
            Ok(None) => break,
            Err(ProtocolError::Malformed(e)) => {
                violation(inner, session, format!("malformed message: {e}"))
            }
            Err(ProtocolError::Frame(e @ (FrameError::Empty | FrameError::TooLarge(_)))) => {
                violation(inner, session, e.to_string());
                break;
            }
            Err(e) => {
                debug!(instance = %session.instance_id(), "connection lost: {e}");
                break;
            }
        }
    }
}

fn violation(inner: &BrokerInner, session: &Session, detail: String) {
    warn!(instance = %session.instance_id(), "protocol violation: {detail}");
    inner.events.emit(BrokerEvent::ProtocolViolation {
        peer: session.instance_id().to_string(),
        detail,
    });
}

/// Answers an EXECUTE sent by a client by routing it like any other call.
async fn serve_client_call(inner: Arc<BrokerInner>, session: Arc<Session>, call: ExecuteMessage) {
    let ExecuteMessage {
        request_id,
        method,
        class,
        args,
    } = call;
    let function = match class {
        Some(class) if !class.trim().is_empty() => format!("{class}.{method}"),
        _ => method,
    };
    debug!(caller = %session.instance_id(), %function, "client-initiated call");

    let payload = match inner
        .gateway
        .execute(Target::Auto, &function, args, None)
        .await
    {
        Ok(value) => success_payload(value),
        Err(GatewayError::Remote(message)) => error_payload(message),
        Err(e) => error_payload(e.to_string()),
    };

    if let Err(e) = session.send(&Envelope::result(request_id, payload)).await {
        warn!(caller = %session.instance_id(), %function, "could not deliver result: {e}");
    }
}
