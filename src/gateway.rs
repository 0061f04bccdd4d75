use std::time::Duration;

use rail_protocol::{Envelope, message::interpret_result};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{Span, debug, instrument, warn};

use crate::{
    correlator::Outcome,
    logger::CallTelemetry,
    router::FunctionRouter,
    tools::{NameCodecError, decode_name},
};

/// Which session a call may go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Let the router pick.
    Auto,
    /// Only this instance, still honoring declared vs ambient rules.
    Instance(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("no connected client provides '{0}'")]
    NoClientFound(String),
    #[error("'{function}' did not answer within {after:?}")]
    Timeout { function: String, after: Duration },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("client disconnected during the call: {0}")]
    Disconnected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    InvalidToolName(#[from] NameCodecError),
}

/// Runs functions on connected clients and waits for their answers.
pub struct ExecutionGateway {
    router: FunctionRouter,
    telemetry: CallTelemetry,
    default_timeout: Duration,
}

impl ExecutionGateway {
    pub fn new(router: FunctionRouter, default_timeout: Duration) -> Self {
        Self {
            router,
            telemetry: CallTelemetry::new(),
            default_timeout,
        }
    }

    pub fn router(&self) -> &FunctionRouter {
        &self.router
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Calls `function` and returns its result.
    ///
    /// A timeout gives up on the call but leaves the session alone; a result
    /// arriving afterwards is dropped by the session's read loop.
    #[instrument(
        name = "execute",
        skip(self, args),
        fields(request_id = tracing::field::Empty, instance = tracing::field::Empty)
    )]
    pub async fn execute(
        &self,
        target: Target,
        function: &str,
        args: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, GatewayError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let target = &target;
        self.telemetry
            .instrument_call(function, move || self.dispatch(target, function, args, timeout))
            .await
    }

    async fn dispatch(
        &self,
        target: &Target,
        function: &str,
        args: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let resolution = match target {
            Target::Auto => self.router.resolve(function),
            Target::Instance(id) => self.router.resolve_on(id, function),
        }
        .ok_or_else(|| GatewayError::NoClientFound(function.to_string()))?;

        let session = resolution.session.clone();
        let call = session
            .pending()
            .create_pending()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let request_id = call.request_id().to_string();

        let span = Span::current();
        span.record("request_id", request_id.as_str());
        span.record("instance", session.instance_id());
        debug!(via = ?resolution.via, "dispatching");

        let envelope = Envelope::execute(
            request_id.clone(),
            resolution.method(function),
            resolution.class(),
            args,
        );
        if let Err(e) = session.send(&envelope).await {
            session.pending().expire(&request_id);
            return Err(GatewayError::Transport(e.to_string()));
        }

        match call.wait(session.pending(), timeout).await {
            Outcome::Result(payload) => interpret_result(payload).map_err(GatewayError::Remote),
            Outcome::Timeout => {
                warn!(%function, ?timeout, "call timed out");
                Err(GatewayError::Timeout {
                    function: function.to_string(),
                    after: timeout,
                })
            }
            Outcome::Disconnected(reason) => Err(GatewayError::Disconnected(reason)),
        }
    }

    /// Executes an LLM tool call; `encoded` is a name from `export_tools`.
    pub async fn execute_tool(
        &self,
        encoded: &str,
        args: Map<String, Value>,
    ) -> Result<Value, GatewayError> {
        let function = decode_name(encoded)?;
        self.execute(Target::Auto, &function, args, None).await
    }

    /// Like [`execute_tool`](Self::execute_tool), but every outcome is text an
    /// LLM can read: the result as JSON, or one sentence saying what went wrong.
    pub async fn execute_for_llm(&self, encoded: &str, args: Map<String, Value>) -> String {
        match self.execute_tool(encoded, args).await {
            Ok(value) => value.to_string(),
            Err(e) => describe_failure(encoded, &e),
        }
    }
}

fn describe_failure(function: &str, error: &GatewayError) -> String {
    match error {
        GatewayError::NoClientFound(_) => {
            format!("Error: no connected application provides the function '{function}'.")
        }
        GatewayError::Timeout { after, .. } => format!(
            "Error: '{function}' did not respond within {} seconds.",
            after.as_secs_f64()
        ),
        GatewayError::Remote(message) => format!("Error: '{function}' failed: {message}"),
        GatewayError::Disconnected(_) => {
            format!("Error: the application serving '{function}' disconnected before answering.")
        }
        GatewayError::Transport(detail) => {
            format!("Error: could not reach the application serving '{function}' ({detail}).")
        }
        GatewayError::InvalidToolName(e) => format!("Error: '{function}' is not a valid tool name ({e})."),
    }
}
