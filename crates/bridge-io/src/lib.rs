//! bridge-io: the I/O core of a remote-management bridge.
//!
//! Two halves that never call each other directly:
//! - **transport**: non-blocking, backpressure-aware byte transports over raw fds
//!   (sockets, stdio, subprocesses with or without a PTY)
//! - **dbus**: a channel that translates dbus-json3 control messages into D-Bus
//!   calls, matches and watches, keeping bus-triggered output in arrival order

pub mod codec;
pub mod dbus;
mod fd;
pub mod spooler;
pub mod transport;

pub use dbus::{
    Bus, BusConnector, BusError, BusKind, BusSignal, ChannelError, ChannelOutput, DbusChannel,
    DbusMessage, InterfaceCache, OpenOptions, Outbound,
};
pub use spooler::Spooler;
pub use transport::{
    Endpoint, Protocol, SocketTransport, StdioTransport, SubprocessTransport, Transport,
    TransportError, TransportHandle,
};
pub use transport::subprocess::{SpawnError, StderrMode, Subprocess, SubprocessOptions};
