//! dbus-json3 control messages.
//!
//! Requests are JSON objects carrying exactly one command field (`call`,
//! `add-match`, `watch`, `meta`), checked in that order. A command field that
//! is null, false, zero or empty counts as absent.
//!
//! Outbound messages omit absent optional fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::DbusError;
use super::introspect::InterfaceInfo;

/// `{path: {interface: {property: value} | null}}`
pub type Notify = BTreeMap<String, BTreeMap<String, Option<Map<String, Value>>>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DbusMessage {
    Reply {
        reply: Vec<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        flags: Option<String>,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Error {
        error: (String, Vec<String>),
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
    Signal {
        signal: (String, String, String, Vec<Value>),
    },
    Meta {
        meta: BTreeMap<String, InterfaceInfo>,
    },
    Notify {
        notify: Notify,
    },
}

impl DbusMessage {
    pub fn reply(reply: Vec<Value>, id: Option<Value>) -> Self {
        Self::Reply {
            reply,
            id,
            flags: None,
            signature: None,
        }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>, id: Option<Value>) -> Self {
        Self::Error {
            error: (name.into(), vec![message.into()]),
            id,
        }
    }

    pub fn signal(path: String, interface: String, member: String, body: Vec<Value>) -> Self {
        Self::Signal {
            signal: (path, interface, member, body),
        }
    }
}

/// Record `props` (as received: `{name: {"t": sig, "v": value}}`) for
/// `path`/`interface`, replacing what was there and unwrapping each variant.
pub fn notify_update(notify: &mut Notify, path: &str, interface: &str, props: &Map<String, Value>) {
    let values = props
        .iter()
        .map(|(name, variant)| {
            let value = variant.get("v").cloned().unwrap_or_else(|| variant.clone());
            (name.clone(), value)
        })
        .collect();
    notify
        .entry(path.to_string())
        .or_default()
        .insert(interface.to_string(), Some(values));
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallRequest {
    pub call: (String, String, String, Vec<Value>),
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub flags: Option<Value>,
    #[serde(rename = "type", default)]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchRequest {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub path_namespace: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Request {
    Call(CallRequest),
    AddMatch {
        filter: Map<String, Value>,
        id: Option<Value>,
    },
    Watch {
        watch: WatchRequest,
        id: Option<Value>,
    },
    Meta(BTreeMap<String, InterfaceInfo>),
}

fn truthy(value: Option<&Value>) -> Option<&Value> {
    value.filter(|value| match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    })
}

fn id_of(message: &Map<String, Value>) -> Option<Value> {
    message.get("id").filter(|id| !id.is_null()).cloned()
}

fn invalid(command: &str, error: impl std::fmt::Display) -> DbusError {
    DbusError::InvalidRequest(format!("invalid {command} request: {error}"))
}

impl Request {
    /// `Ok(None)` when the message carries no command.
    pub fn parse(message: &Value) -> Result<Option<Self>, DbusError> {
        let Some(fields) = message.as_object() else {
            return Ok(None);
        };

        if truthy(fields.get("call")).is_some() {
            let call = CallRequest::deserialize(message).map_err(|e| invalid("call", e))?;
            return Ok(Some(Self::Call(call)));
        }
        if let Some(filter) = truthy(fields.get("add-match")) {
            let filter = filter
                .as_object()
                .cloned()
                .ok_or_else(|| invalid("add-match", "expected an object"))?;
            return Ok(Some(Self::AddMatch {
                filter,
                id: id_of(fields),
            }));
        }
        if let Some(watch) = truthy(fields.get("watch")) {
            let watch = WatchRequest::deserialize(watch).map_err(|e| invalid("watch", e))?;
            return Ok(Some(Self::Watch {
                watch,
                id: id_of(fields),
            }));
        }
        if let Some(meta) = truthy(fields.get("meta")) {
            let meta = BTreeMap::deserialize(meta).map_err(|e| invalid("meta", e))?;
            return Ok(Some(Self::Meta(meta)));
        }
        Ok(None)
    }

    pub fn id(&self) -> Option<&Value> {
        match self {
            Self::Call(call) => call.id.as_ref(),
            Self::AddMatch { id, .. } | Self::Watch { id, .. } => id.as_ref(),
            Self::Meta(_) => None,
        }
    }
}

/// `type='signal',key='value',...` from an add-match filter.
pub fn match_rule(filter: &Map<String, Value>) -> String {
    let mut rule = String::from("type='signal'");
    for (key, value) in filter {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rule.push_str(&format!(",{key}='{value}'"));
    }
    rule
}
