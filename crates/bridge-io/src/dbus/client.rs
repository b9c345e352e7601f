//! [`Bus`] on a real `zbus` connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use zbus::{Connection, Message, MessageStream};
use zvariant::{Structure, StructureBuilder};

use super::bus::{Bus, BusConnector, BusError, BusKind, BusSignal, MethodCall, SignalStream};
use super::value;

impl From<zbus::Error> for BusError {
    fn from(error: zbus::Error) -> Self {
        match error {
            zbus::Error::MethodError(name, detail, _) => {
                BusError::new(name.as_str(), detail.unwrap_or_default())
            }
            other => BusError::failed(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ZbusBus {
    connection: Connection,
}

impl ZbusBus {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub async fn system() -> Result<Self, BusError> {
        Ok(Self::new(Connection::system().await?))
    }

    pub async fn session() -> Result<Self, BusError> {
        Ok(Self::new(Connection::session().await?))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    async fn send_call(&self, call: MethodCall<'_>) -> Result<Message, BusError> {
        let args = value::encode_args(call.signature, call.args)
            .map_err(|e| BusError::invalid_args(e.to_string()))?;

        let reply = if args.is_empty() {
            self.connection
                .call_method(call.destination, call.path, Some(call.interface), call.member, &())
                .await?
        } else {
            let body = args
                .into_iter()
                .fold(StructureBuilder::new(), |builder, arg| builder.append_field(arg))
                .build();
            self.connection
                .call_method(call.destination, call.path, Some(call.interface), call.member, &body)
                .await?
        };
        Ok(reply)
    }
}

/// Top-level body values of `message` as dbus-json3 arguments.
fn decode_message(message: &Message) -> Result<Vec<Value>, zbus::Error> {
    let body = message.body();
    if body.signature().is_none_or(|signature| signature.as_str().is_empty()) {
        return Ok(Vec::new());
    }
    let fields: Structure<'_> = body.deserialize()?;
    Ok(value::decode_body(fields.fields()))
}

fn to_signal(message: &Message) -> Option<BusSignal> {
    let header = message.header();
    let body = match decode_message(message) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode signal body");
            return None;
        }
    };
    Some(BusSignal {
        path: header.path()?.to_string(),
        interface: header.interface()?.to_string(),
        member: header.member()?.to_string(),
        body,
    })
}

#[async_trait]
impl Bus for ZbusBus {
    async fn call_method(&self, call: MethodCall<'_>) -> Result<Vec<Value>, BusError> {
        tracing::trace!(
            destination = ?call.destination,
            path = call.path,
            interface = call.interface,
            member = call.member,
            "Calling method"
        );

        let reply = match call.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.send_call(call))
                .await
                .map_err(|_| {
                    BusError::no_reply(format!("{}.{} timed out", call.interface, call.member))
                })??,
            None => self.send_call(call).await?,
        };
        decode_message(&reply).map_err(BusError::from)
    }

    async fn add_match(&self, rule: &str) -> Result<SignalStream, BusError> {
        let rule = zbus::MatchRule::try_from(rule)?;
        let stream = MessageStream::for_match_rule(rule, &self.connection, None).await?;
        Ok(stream
            .filter_map(|message| async move {
                match message {
                    Ok(message) => to_signal(&message),
                    Err(e) => {
                        tracing::warn!(error = %e, "Signal stream error");
                        None
                    }
                }
            })
            .boxed())
    }
}

/// Connects the system and session buses on demand; the internal bus is
/// supplied by the owner.
#[derive(Default, Clone)]
pub struct ZbusConnector {
    internal: Option<Arc<dyn Bus>>,
}

impl ZbusConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal(mut self, bus: Arc<dyn Bus>) -> Self {
        self.internal = Some(bus);
        self
    }
}

#[async_trait]
impl BusConnector for ZbusConnector {
    async fn connect(&self, kind: BusKind) -> Result<Arc<dyn Bus>, BusError> {
        match kind {
            BusKind::Internal => self
                .internal
                .clone()
                .ok_or_else(|| BusError::failed("no internal bus available")),
            BusKind::Session => Ok(Arc::new(ZbusBus::session().await?)),
            BusKind::System => Ok(Arc::new(ZbusBus::system().await?)),
        }
    }
}
