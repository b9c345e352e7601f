//! The dbus-json3 bridge channel and its D-Bus plumbing.
//!
//! ```text
//! client JSON ──► DbusChannel ──► InterfaceCache ──► Bus (zbus)
//!        ▲             │                               │
//!        └── ChannelOutput ◄── FairLock ◄── signals ◄──┘
//! ```
//!
//! Every message caused by a bus event or a method reply is emitted while
//! holding the channel's [`lock::FairLock`], so output keeps bus arrival order
//! even when producing it needs more bus round-trips.

pub mod bus;
pub mod cache;
pub mod channel;
pub mod client;
pub mod introspect;
pub mod lock;
pub mod protocol;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{Bus, BusConnector, BusError, BusKind, BusSignal, MethodCall, SignalStream};
pub use cache::{InterfaceCache, Target};
pub use channel::{ChannelError, ChannelOutput, DbusChannel, OpenOptions, Outbound};
pub use client::{ZbusBus, ZbusConnector};
pub use introspect::InterfaceInfo;
pub use lock::FairLock;
pub use protocol::{DbusMessage, Notify};

use bus::error_names;

#[derive(Debug, thiserror::Error)]
pub enum DbusError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Introspection: {0}")]
    Introspection(String),

    #[error("Interface {0} is not found")]
    UnknownInterface(String),

    #[error("Introspection data for method {interface} {method} not available")]
    UnknownMethod { interface: String, method: String },

    #[error("{0}")]
    InvalidRequest(String),
}

impl DbusError {
    pub fn introspection(message: impl std::fmt::Display) -> Self {
        Self::Introspection(message.to_string())
    }

    pub fn unknown_method(interface: &str, method: &str) -> Self {
        Self::UnknownMethod {
            interface: interface.to_string(),
            method: method.to_string(),
        }
    }

    /// `(name, message)` for an error reply.
    pub fn to_reply(&self) -> (String, String) {
        match self {
            Self::Bus(e) => (e.name.clone(), e.message.clone()),
            Self::InvalidRequest(message) => (error_names::INVALID_ARGS.to_string(), message.clone()),
            other => (error_names::FAILED.to_string(), other.to_string()),
        }
    }
}
