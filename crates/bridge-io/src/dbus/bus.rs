//! The bus client seam.
//!
//! The bridge channel only talks to a [`Bus`]; [`super::client::ZbusBus`] is the
//! real implementation and tests substitute an in-memory one. Arguments and
//! replies cross the seam as JSON in the dbus-json3 encoding.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";

/// Interfaces every object carries; never fetched or watched for properties.
pub const STANDARD_PREFIX: &str = "org.freedesktop.DBus.";

pub mod error_names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
}

/// A D-Bus error reply, or a local failure dressed as one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct BusError {
    pub name: String,
    pub message: String,
}

impl BusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(error_names::FAILED, message)
    }

    pub fn no_reply(message: impl Into<String>) -> Self {
        Self::new(error_names::NO_REPLY, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(error_names::INVALID_ARGS, message)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MethodCall<'a> {
    pub destination: Option<&'a str>,
    pub path: &'a str,
    pub interface: &'a str,
    pub member: &'a str,
    /// Concatenated input signature; empty for no arguments.
    pub signature: &'a str,
    pub args: &'a [Value],
    pub timeout: Option<Duration>,
}

impl<'a> MethodCall<'a> {
    pub fn new(destination: Option<&'a str>, path: &'a str, interface: &'a str, member: &'a str) -> Self {
        Self {
            destination,
            path,
            interface,
            member,
            signature: "",
            args: &[],
            timeout: None,
        }
    }

    pub fn with_args(mut self, signature: &'a str, args: &'a [Value]) -> Self {
        self.signature = signature;
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A signal delivered to a match subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct BusSignal {
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<Value>,
}

pub type SignalStream = BoxStream<'static, BusSignal>;

#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Out arguments of the reply, in order.
    async fn call_method(&self, call: MethodCall<'_>) -> Result<Vec<Value>, BusError>;

    /// Subscribe to signals matching `rule`. The subscription lives as long as
    /// the stream.
    async fn add_match(&self, rule: &str) -> Result<SignalStream, BusError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusKind {
    Internal,
    Session,
    #[default]
    System,
}

impl BusKind {
    /// Anything unrecognised selects the system bus.
    pub fn from_name(name: &str) -> Self {
        match name {
            "internal" => Self::Internal,
            "session" => Self::Session,
            _ => Self::System,
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Internal => "internal",
            Self::Session => "session",
            Self::System => "system",
        })
    }
}

#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self, kind: BusKind) -> Result<Arc<dyn Bus>, BusError>;
}
