//! LLM tool definitions for everything the broker can call.
//!
//! Tool-calling APIs reject dots in function names, so `Class.Name` travels as
//! `Class__Name`. The router only ever sees decoded names.

use std::{collections::HashSet, sync::Arc};

use rail_protocol::{Manifest, message::ParameterDecl};
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::warn;

use crate::session::{Capability, Session, capabilities_from};

const SEPARATOR: &str = "__";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NameCodecError {
    #[error("function name is empty")]
    Empty,
    #[error("'{name}' contains '{ch}', only letters, digits, '_', '-' and '.' are allowed")]
    InvalidChar { name: String, ch: char },
    #[error("'{0}' contains '__' or an underscore next to a dot")]
    ReservedSeparator(String),
    #[error("'{0}' has an empty segment")]
    EmptySegment(String),
}

/// `Module.Function` → `Module__Function`.
pub fn encode_name(name: &str) -> Result<String, NameCodecError> {
    if name.is_empty() {
        return Err(NameCodecError::Empty);
    }
    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(NameCodecError::InvalidChar {
            name: name.to_string(),
            ch,
        });
    }
    // "_." or "._" would encode to "___", which decodes two ways
    if name.contains(SEPARATOR) || name.contains("_.") || name.contains("._") {
        return Err(NameCodecError::ReservedSeparator(name.to_string()));
    }
    if name.split('.').any(str::is_empty) {
        return Err(NameCodecError::EmptySegment(name.to_string()));
    }
    Ok(name.replace('.', SEPARATOR))
}

/// Inverse of [`encode_name`].
pub fn decode_name(encoded: &str) -> Result<String, NameCodecError> {
    if encoded.is_empty() {
        return Err(NameCodecError::Empty);
    }
    if let Some(ch) = encoded
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-')))
    {
        return Err(NameCodecError::InvalidChar {
            name: encoded.to_string(),
            ch,
        });
    }
    let decoded = encoded.split(SEPARATOR).collect::<Vec<_>>().join(".");
    match encode_name(&decoded) {
        Ok(again) if again == encoded => Ok(decoded),
        Ok(_) | Err(_) => Err(NameCodecError::EmptySegment(encoded.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool definitions for every declared function across `sessions`, in
/// registration order. A qualified name declared twice is exported once, for
/// the session the router would pick.
pub fn export_tools(sessions: &[Arc<Session>]) -> Vec<ToolDefinition> {
    let caps = sessions.iter().flat_map(|s| s.capabilities().iter());
    export(caps)
}

/// Same as [`export_tools`] for manifests that are not connected, e.g. a catalog.
pub fn export_manifests<'a>(manifests: impl IntoIterator<Item = &'a Manifest>) -> Vec<ToolDefinition> {
    let caps: Vec<Capability> = manifests.into_iter().flat_map(capabilities_from).collect();
    export(caps.iter())
}

fn export<'a>(caps: impl Iterator<Item = &'a Capability>) -> Vec<ToolDefinition> {
    let mut seen = HashSet::new();
    let mut tools = Vec::new();

    for cap in caps {
        let qualified = cap.qualified_name();
        if !seen.insert(qualified.to_lowercase()) {
            continue;
        }
        let name = match encode_name(&qualified) {
            Ok(name) => name,
            Err(e) => {
                warn!(function = %qualified, "not exported as a tool: {e}");
                continue;
            }
        };
        tools.push(ToolDefinition {
            name,
            description: cap
                .description
                .clone()
                .unwrap_or_else(|| format!("Calls {qualified}")),
            parameters: parameters_schema(&cap.parameters),
        });
    }
    tools
}

fn parameters_schema(params: &[ParameterDecl]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for p in params {
        let mut prop = Map::new();
        if let Some(kind) = json_type(&p.kind) {
            prop.insert("type".into(), json!(kind));
        }
        if let Some(desc) = &p.description {
            prop.insert("description".into(), json!(desc));
        }
        properties.insert(p.name.clone(), Value::Object(prop));
        if p.required {
            required.push(p.name.clone());
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Maps the type names SDKs put in manifests onto JSON schema types.
/// `None` leaves the property unconstrained.
fn json_type(kind: &str) -> Option<&'static str> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "string" | "str" | "char" => Some("string"),
        "int" | "int32" | "int64" | "long" | "short" | "integer" | "uint" => Some("integer"),
        "float" | "double" | "decimal" | "number" => Some("number"),
        "bool" | "boolean" => Some("boolean"),
        "array" | "list" => Some("array"),
        "object" | "dict" | "map" => Some("object"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::session;
    use rail_protocol::message::FunctionDecl;

    #[test]
    fn dotted_names_survive_the_codec() {
        for name in ["Add", "Calc.Add", "a.b.c", "snake_case.fn-1"] {
            let encoded = encode_name(name).unwrap();
            assert!(!encoded.contains('.'));
            assert_eq!(decode_name(&encoded).unwrap(), name);
        }
        assert_eq!(encode_name("Calc.Add").unwrap(), "Calc__Add");
    }

    #[test]
    fn names_that_would_collide_are_refused() {
        assert_eq!(
            encode_name("a__b"),
            Err(NameCodecError::ReservedSeparator("a__b".into()))
        );
        assert!(matches!(encode_name("a._b"), Err(NameCodecError::ReservedSeparator(_))));
        assert!(matches!(encode_name(".a"), Err(NameCodecError::EmptySegment(_))));
        assert!(matches!(encode_name("a..b"), Err(NameCodecError::EmptySegment(_))));
        assert!(matches!(encode_name("a b"), Err(NameCodecError::InvalidChar { ch: ' ', .. })));
        assert_eq!(encode_name(""), Err(NameCodecError::Empty));

        assert!(decode_name("a___b").is_err());
        assert!(decode_name("__a").is_err());
        assert!(decode_name("a.b").is_err());
    }

    #[tokio::test]
    async fn export_keeps_each_qualified_function_once() {
        let (a, _pa) = session("A", &[("Add", Some("Calc")), ("bad name", None)], false);
        let (b, _pb) = session("B", &[("add", Some("Math")), ("Sub", None)], false);
        let (c, _pc) = session("C", &[("ADD", Some("calc")), ("sub", None)], false);

        let tools = export_tools(&[a, b, c]);
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["Calc__Add", "Math__add", "Sub"]);
        assert_eq!(tools[2].description, "Calls Sub");
        assert_eq!(decode_name("Math__add").unwrap(), "Math.add");
    }

    #[test]
    fn manifest_parameters_become_a_schema() {
        let manifest = Manifest::new("cpp").with_function(
            FunctionDecl::new("Add")
                .class("Calc")
                .description("Adds two numbers")
                .param("a", "int", true)
                .param("b", "double", false)
                .param("opts", "Widget", false),
        );

        let tools = export_manifests([&manifest]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].description, "Adds two numbers");
        assert_eq!(
            tools[0].parameters,
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "integer"},
                    "b": {"type": "number"},
                    "opts": {},
                },
                "required": ["a"],
            })
        );
    }
}
