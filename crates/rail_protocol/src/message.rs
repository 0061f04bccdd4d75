use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::frame::FrameError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected {got} message while waiting for {expected}")]
    Unexpected { expected: &'static str, got: &'static str },
    #[error("peer closed the connection")]
    Closed,
}

// -----------------------------------------------------------------------------
// Envelopes
// -----------------------------------------------------------------------------

/// Every frame on the wire carries exactly one envelope, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    Connect(ConnectMessage),
    Ack,
    Execute(ExecuteMessage),
    Result(ResultMessage),
    Disconnect(DisconnectMessage),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Connect(_) => "CONNECT",
            Envelope::Ack => "ACK",
            Envelope::Execute(_) => "EXECUTE",
            Envelope::Result(_) => "RESULT",
            Envelope::Disconnect(_) => "DISCONNECT",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn execute(
        request_id: impl Into<String>,
        method: impl Into<String>,
        class: Option<String>,
        args: Map<String, Value>,
    ) -> Self {
        Envelope::Execute(ExecuteMessage {
            request_id: request_id.into(),
            method: method.into(),
            class,
            args,
        })
    }

    pub fn result(request_id: impl Into<String>, result: Value) -> Self {
        Envelope::Result(ResultMessage {
            request_id: request_id.into(),
            result,
        })
    }

    pub fn disconnect(instance_id: impl Into<String>) -> Self {
        Envelope::Disconnect(DisconnectMessage {
            instance_id: instance_id.into(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectMessage {
    #[serde(default)]
    pub instance_id: String,
    /// Older clients send this as `assembly`.
    #[serde(default, alias = "assembly", skip_serializing_if = "Option::is_none")]
    pub process_tag: Option<String>,
    #[serde(default)]
    pub manifest: Manifest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteMessage {
    pub request_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub request_id: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectMessage {
    #[serde(default)]
    pub instance_id: String,
}

// -----------------------------------------------------------------------------
// Manifest
// -----------------------------------------------------------------------------

/// What a client says it can do. Sent inside CONNECT, or stored on disk as a
/// catalog entry for clients that cannot describe themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub language: String,
    /// Only present in catalog files, where it names the process the entry belongs to.
    #[serde(default, alias = "assembly", skip_serializing_if = "Option::is_none")]
    pub process_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    /// Default class for functions that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_ambient_dispatch: Option<bool>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
}

impl Manifest {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            ..Default::default()
        }
    }

    pub fn with_function(mut self, function: FunctionDecl) -> Self {
        self.functions.push(function);
        self
    }

    pub fn language_tag(&self) -> Option<Language> {
        self.language.trim().parse().ok()
    }

    /// Process ids arrive as numbers from some SDKs and strings from others.
    pub fn process_id_string(&self) -> Option<String> {
        match self.process_id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "context", skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterDecl>,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, kind: impl Into<String>, required: bool) -> Self {
        self.parameters.push(ParameterDecl {
            name: name.into(),
            kind: kind.into(),
            description: None,
            required,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterDecl {
    pub name: String,
    #[serde(rename = "type", default = "any_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

fn any_type() -> String {
    "any".to_string()
}

/// Language tags the SDKs are known to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(ascii_case_insensitive)]
pub enum Language {
    #[strum(to_string = "csharp", serialize = "c#", serialize = "dotnet")]
    CSharp,
    #[strum(to_string = "python", serialize = "py")]
    Python,
    #[strum(to_string = "cpp", serialize = "c++")]
    Cpp,
    #[strum(to_string = "javascript", serialize = "js", serialize = "node")]
    JavaScript,
    #[strum(to_string = "typescript", serialize = "ts")]
    TypeScript,
    #[strum(to_string = "rust")]
    Rust,
}

// -----------------------------------------------------------------------------
// Result payloads
// -----------------------------------------------------------------------------

pub fn success_payload(result: Value) -> Value {
    json!({ "status": "success", "result": result })
}

pub fn error_payload(message: impl Into<String>) -> Value {
    json!({ "status": "error", "message": message.into() })
}

/// Splits a RESULT payload into the function's value or its error message.
///
/// Understands `{"status":"success","result":..}`, `{"status":"error","message":..}`
/// and the bare `{"error":..}` some native clients send. Anything else is taken
/// to be the raw return value.
pub fn interpret_result(payload: Value) -> Result<Value, String> {
    let mut map = match payload {
        Value::Object(map) => map,
        other => return Ok(other),
    };

    let status = map
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);
    match status.as_deref() {
        Some("error") => {
            let message = map
                .remove("message")
                .or_else(|| map.remove("error"))
                .map(|m| match m {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "remote function failed".to_string());
            return Err(message);
        }
        Some("success") => return Ok(map.remove("result").unwrap_or(Value::Null)),
        _ => {}
    }

    if map.len() == 1 {
        if let Some(Value::String(err)) = map.get("error") {
            return Err(err.clone());
        }
    }
    Ok(Value::Object(map))
}
