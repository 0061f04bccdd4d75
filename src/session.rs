use std::sync::Arc;

use chrono::{DateTime, Utc};
use rail_protocol::{
    Envelope, Manifest, ProtocolError, Transport, TransportExt,
    message::{FunctionDecl, ParameterDecl},
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::correlator::Correlator;

/// One callable function advertised by a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capability {
    pub name: String,
    pub class: Option<String>,
    pub description: Option<String>,
    pub parameters: Vec<ParameterDecl>,
}

impl Capability {
    /// `default_class` is the manifest's `context`, used when the function names none.
    pub fn from_decl(decl: &FunctionDecl, default_class: Option<&str>) -> Self {
        Self {
            name: decl.name.trim().to_string(),
            class: decl
                .class
                .as_deref()
                .or(default_class)
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            description: decl.description.clone(),
            parameters: decl.parameters.clone(),
        }
    }

    /// `Class.Name` when a class is known, otherwise just the name.
    pub fn qualified_name(&self) -> String {
        match &self.class {
            Some(class) => format!("{class}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn matches_qualified(&self, class: &str, name: &str) -> bool {
        self.matches(name)
            && self
                .class
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(class))
    }
}

/// Turns a manifest's function list into capabilities, dropping unnamed entries.
pub fn capabilities_from(manifest: &Manifest) -> Vec<Capability> {
    manifest
        .functions
        .iter()
        .filter(|f| !f.name.trim().is_empty())
        .map(|f| Capability::from_decl(f, manifest.context.as_deref()))
        .collect()
}

/// Broker side state of one connected client.
pub struct Session {
    instance_id: String,
    language: String,
    process_tag: Option<String>,
    process_id: Option<String>,
    capabilities: Vec<Capability>,
    ambient_dispatch: bool,
    auto_associated: bool,
    connected_at: DateTime<Utc>,
    transport: Arc<dyn Transport>,
    pending: Correlator,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub instance_id: String,
    pub language: String,
    pub process_tag: Option<String>,
    pub process_id: Option<String>,
    pub functions: Vec<String>,
    pub ambient_dispatch: bool,
    pub auto_associated: bool,
    pub pending_calls: usize,
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
}

pub struct SessionBuilder {
    instance_id: String,
    language: String,
    process_tag: Option<String>,
    process_id: Option<String>,
    capabilities: Vec<Capability>,
    ambient_dispatch: bool,
    auto_associated: bool,
    max_pending: usize,
}

impl SessionBuilder {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            language: String::new(),
            process_tag: None,
            process_id: None,
            capabilities: Vec::new(),
            ambient_dispatch: false,
            auto_associated: false,
            max_pending: 1024,
        }
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn process_tag(mut self, tag: Option<String>) -> Self {
        self.process_tag = tag;
        self
    }

    pub fn process_id(mut self, id: Option<String>) -> Self {
        self.process_id = id;
        self
    }

    pub fn capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn ambient_dispatch(mut self, ambient: bool) -> Self {
        self.ambient_dispatch = ambient;
        self
    }

    pub fn auto_associated(mut self, auto: bool) -> Self {
        self.auto_associated = auto;
        self
    }

    pub fn max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>, cancel: CancellationToken) -> Session {
        Session {
            instance_id: self.instance_id,
            language: self.language,
            process_tag: self.process_tag,
            process_id: self.process_id,
            capabilities: self.capabilities,
            ambient_dispatch: self.ambient_dispatch,
            auto_associated: self.auto_associated,
            connected_at: Utc::now(),
            transport,
            pending: Correlator::new(self.max_pending),
            cancel,
        }
    }
}

impl Session {
    pub fn builder(instance_id: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(instance_id)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn supports_ambient_dispatch(&self) -> bool {
        self.ambient_dispatch
    }

    pub fn pending(&self) -> &Correlator {
        &self.pending
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn find(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.matches(name))
    }

    pub fn find_qualified(&self, class: &str, name: &str) -> Option<&Capability> {
        self.capabilities
            .iter()
            .find(|c| c.matches_qualified(class, name))
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && self.transport.is_connected()
    }

    /// Sends one envelope. Writes from concurrent callers are serialized by the transport.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        self.transport.send_envelope(envelope).await
    }

    /// Stops the read loop, fails pending calls with `reason` and closes the
    /// transport. Returns the number of calls that were failed. Safe to call twice.
    pub async fn close(&self, reason: &str) -> usize {
        self.cancel.cancel();
        let failed = self.pending.close(reason);
        self.transport.close().await;
        debug!(instance = %self.instance_id, failed, "session closed: {reason}");
        failed
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            instance_id: self.instance_id.clone(),
            language: self.language.clone(),
            process_tag: self.process_tag.clone(),
            process_id: self.process_id.clone(),
            functions: self.capabilities.iter().map(Capability::qualified_name).collect(),
            ambient_dispatch: self.ambient_dispatch,
            auto_associated: self.auto_associated,
            pending_calls: self.pending.len(),
            connected: self.is_connected(),
            connected_at: self.connected_at,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instance_id", &self.instance_id)
            .field("language", &self.language)
            .field("capabilities", &self.capabilities.len())
            .field("ambient_dispatch", &self.ambient_dispatch)
            .finish()
    }
}
