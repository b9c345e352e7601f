//! dbus-json3 over stdin/stdout.
//!
//! The first line on stdin is the channel's open options
//! (`{"bus": "session", "name": "org.example.Service"}`); every later line is
//! a dbus-json3 request. Outbound messages are written one per line. On stdin
//! EOF, pending requests are answered, queued output is written and the
//! process exits.

use std::io;

use anyhow::Context;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use bridge_io::codec::JsonLinesCodec;
use bridge_io::dbus::ZbusConnector;
use bridge_io::{
    DbusChannel, OpenOptions, Outbound, Protocol, StdioTransport, Transport, TransportHandle,
};

/// Initialize tracing with BRIDGE_LOG and LOG_FORMAT support. Logs go to
/// stderr; stdout carries the protocol.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("BRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("bridge_io={level},dbus_stdio={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

enum Inbound {
    Line(Value),
    Eof,
}

/// Splits stdin into JSON lines and hands them to the main loop.
struct LineReader {
    codec: JsonLinesCodec<Value>,
    buf: BytesMut,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl LineReader {
    fn new(tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self {
            codec: JsonLinesCodec::new(),
            buf: BytesMut::new(),
            tx,
        }
    }

    fn drain(&mut self, at_eof: bool) {
        loop {
            let decoded = if at_eof {
                self.codec.decode_eof(&mut self.buf)
            } else {
                self.codec.decode(&mut self.buf)
            };
            match decoded {
                Ok(Some(line)) => {
                    let _ = self.tx.send(Inbound::Line(line));
                }
                Ok(None) => break,
                Err(e) => tracing::warn!(error = %e, "Dropping undecodable line"),
            }
        }
    }
}

impl Protocol for LineReader {
    fn data_received(&mut self, _transport: &mut dyn TransportHandle, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.drain(false);
    }

    fn eof_received(&mut self, _transport: &mut dyn TransportHandle) -> bool {
        self.drain(true);
        let _ = self.tx.send(Inbound::Eof);
        // stdout stays open until queued output is written
        true
    }

    fn connection_lost(&mut self, error: Option<io::Error>) {
        if let Some(e) = error {
            tracing::warn!(error = %e, "Stdio transport lost");
        }
        let _ = self.tx.send(Inbound::Eof);
    }
}

struct Writer {
    codec: JsonLinesCodec<Value>,
}

impl Writer {
    fn write(&mut self, transport: &mut StdioTransport<LineReader>, message: Value) {
        let mut buf = BytesMut::new();
        if let Err(e) = self.codec.encode(message, &mut buf) {
            tracing::error!(error = %e, "Failed to encode outbound message");
            return;
        }
        if let Err(e) = transport.write(&buf) {
            tracing::debug!(error = %e, "Dropping outbound message");
        }
    }

    fn write_outbound(&mut self, transport: &mut StdioTransport<LineReader>, outbound: Outbound) {
        let message = match outbound {
            Outbound::Ready => json!({"command": "ready"}),
            Outbound::Message(message) => match serde_json::to_value(message) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize outbound message");
                    return;
                }
            },
        };
        self.write(transport, message);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let (in_tx, mut in_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let mut transport =
        Transport::stdio(LineReader::new(in_tx)).context("failed to register stdin/stdout")?;
    let mut writer = Writer {
        codec: JsonLinesCodec::new(),
    };

    let connector = ZbusConnector::new();
    let mut out_tx = Some(out_tx);
    let mut channel: Option<DbusChannel> = None;

    loop {
        tokio::select! {
            alive = transport.step() => {
                if !alive {
                    break;
                }
            }
            Some(inbound) = in_rx.recv() => match inbound {
                Inbound::Line(message) => {
                    if let Some(channel) = channel.as_mut() {
                        channel.handle_message(message);
                    } else if let Some(output) = out_tx.take() {
                        let options = OpenOptions::from_json(&message);
                        tracing::info!(bus = %options.bus, name = ?options.name, "Opening channel");
                        match DbusChannel::open(options, &connector, output).await {
                            Ok(opened) => channel = Some(opened),
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to open channel");
                                writer.write(
                                    &mut transport,
                                    json!({"command": "close", "problem": e.problem, "message": e.message}),
                                );
                                transport.close();
                            }
                        }
                    }
                }
                Inbound::Eof => {
                    tracing::debug!("Input finished, flushing output");
                    if let Some(mut channel) = channel.take() {
                        channel.settle().await;
                    }
                    drop(out_tx.take());
                    while let Ok(outbound) = out_rx.try_recv() {
                        writer.write_outbound(&mut transport, outbound);
                    }
                    transport.close();
                }
            },
            Some(outbound) = out_rx.recv() => writer.write_outbound(&mut transport, outbound),
        }
    }

    tracing::debug!("Exiting");
    Ok(())
}
