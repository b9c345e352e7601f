//! The dbus-json3 channel.
//!
//! Each request runs as its own task and finishes once answered. Signal
//! consumers started by `add-match` and `watch` run as separate tasks until
//! the channel is dropped, spawning one handler per signal.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};

use super::bus::{
    Bus, BusConnector, BusError, BusKind, BusSignal, MethodCall, OBJECT_MANAGER, PROPERTIES,
    STANDARD_PREFIX, SignalStream, error_names,
};
use super::cache::{InterfaceCache, Target};
use super::introspect::InterfaceInfo;
use super::lock::FairLock;
use super::protocol::{CallRequest, DbusMessage, Notify, Request, WatchRequest, match_rule, notify_update};
use super::DbusError;

/// Where the channel's messages go.
pub trait ChannelOutput: Send + Sync + 'static {
    /// The channel is open.
    fn ready(&self);

    fn send(&self, message: DbusMessage);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Ready,
    Message(DbusMessage),
}

impl ChannelOutput for mpsc::UnboundedSender<Outbound> {
    fn ready(&self) {
        let _ = mpsc::UnboundedSender::send(self, Outbound::Ready);
    }

    fn send(&self, message: DbusMessage) {
        if mpsc::UnboundedSender::send(self, Outbound::Message(message)).is_err() {
            tracing::debug!("Channel output closed, dropping message");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub bus: BusKind,
    /// Destination for calls; also restricts subscriptions to this sender.
    pub name: Option<String>,
}

impl OpenOptions {
    pub fn new(bus: BusKind) -> Self {
        Self { bus, name: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `{"bus": "internal" | "session" | "system", "name": ...}`
    pub fn from_json(options: &Value) -> Self {
        Self {
            bus: options
                .get("bus")
                .and_then(Value::as_str)
                .map(BusKind::from_name)
                .unwrap_or_default(),
            name: options.get("name").and_then(Value::as_str).map(String::from),
        }
    }
}

/// Why a channel could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{problem}: {message}")]
pub struct ChannelError {
    pub problem: String,
    pub message: String,
}

impl ChannelError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            problem: "protocol-error".to_string(),
            message: message.into(),
        }
    }
}

struct Shared {
    bus: Arc<dyn Bus>,
    name: Option<String>,
    cache: InterfaceCache,
    lock: FairLock,
    output: Box<dyn ChannelOutput>,
    subscriptions: StdMutex<Vec<AbortHandle>>,
}

pub struct DbusChannel {
    shared: Arc<Shared>,
    tasks: JoinSet<()>,
}

impl DbusChannel {
    pub async fn open(
        options: OpenOptions,
        connector: &dyn BusConnector,
        output: impl ChannelOutput,
    ) -> Result<Self, ChannelError> {
        let bus = connector.connect(options.bus).await.map_err(|e| {
            ChannelError::protocol(format!("failed to connect to {} bus: {}", options.bus, e.message))
        })?;
        tracing::debug!(bus = %options.bus, name = ?options.name, "Opened D-Bus channel");

        let channel = Self::with_bus(bus, options.name, output);
        channel.shared.output.ready();
        Ok(channel)
    }

    /// A channel on an already connected bus. Does not signal readiness.
    pub fn with_bus(bus: Arc<dyn Bus>, name: Option<String>, output: impl ChannelOutput) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                name,
                cache: InterfaceCache::new(),
                lock: FairLock::new(),
                output: Box::new(output),
                subscriptions: StdMutex::new(Vec::new()),
            }),
            tasks: JoinSet::new(),
        }
    }

    pub fn cache(&self) -> &InterfaceCache {
        &self.shared.cache
    }

    /// Dispatch one control message. Must be called inside a tokio runtime.
    pub fn handle_message(&mut self, message: Value) {
        let request = match Request::parse(&message) {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(%message, "Ignoring message without a command");
                return;
            }
            Err(e) => {
                let id = message.get("id").filter(|id| !id.is_null()).cloned();
                tracing::warn!(error = %e, ?id, "Malformed request");
                let (name, text) = e.to_reply();
                self.shared.output.send(DbusMessage::error(name, text, id.clone()));
                self.shared.output.send(DbusMessage::reply(vec![], id));
                return;
            }
        };

        let id = request.id().cloned();
        let shared = Arc::clone(&self.shared);
        match request {
            Request::Call(call) => self.spawn(id, shared.call(call)),
            Request::AddMatch { filter, id: tag } => self.spawn(id, shared.add_match(filter, tag)),
            Request::Watch { watch, id: tag } => self.spawn(id, shared.watch(watch, tag)),
            Request::Meta(interfaces) => {
                tracing::debug!(interfaces = ?interfaces.keys().collect::<Vec<_>>(), "Injecting metadata");
                self.shared.cache.inject(interfaces);
            }
        }
    }

    /// Wait until every request handled so far has been answered.
    /// Subscriptions keep running.
    pub async fn settle(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    fn spawn(&mut self, id: Option<Value>, task: impl Future<Output = ()> + Send + 'static) {
        while self.tasks.try_join_next().is_some() {}

        let shared = Arc::clone(&self.shared);
        self.tasks.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                let message = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                tracing::error!(error = message, ?id, "Request task panicked");
                if id.is_some() {
                    shared
                        .output
                        .send(DbusMessage::error(error_names::FAILED, message, id));
                }
            }
        });
    }
}

impl Drop for DbusChannel {
    fn drop(&mut self) {
        self.tasks.abort_all();
        let mut subscriptions = self
            .shared
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for subscription in subscriptions.drain(..) {
            subscription.abort();
        }
    }
}

impl Shared {
    fn target<'a>(&'a self, path: &'a str) -> Target<'a> {
        Target::new(&*self.bus, self.name.as_deref(), path)
    }

    /// Consume `signals` until the channel is dropped. Every signal gets its
    /// own handler task as soon as it arrives, so handlers queue on the lock
    /// in bus order even while an earlier one is still waiting on the bus.
    fn keep<F, Fut>(self: &Arc<Self>, mut signals: SignalStream, handler: F)
    where
        F: Fn(Arc<Self>, BusSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        let consumer = async move {
            // dropped with the consumer, which aborts pending handlers
            let mut handlers = JoinSet::new();
            while let Some(signal) = signals.next().await {
                while handlers.try_join_next().is_some() {}
                handlers.spawn(handler(Arc::clone(&this), signal));
            }
            while handlers.join_next().await.is_some() {}
        };
        let handle = tokio::spawn(consumer).abort_handle();
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|subscription| !subscription.is_finished());
        subscriptions.push(handle);
    }

    fn send_error(&self, error: BusError, id: Option<Value>) {
        self.output.send(DbusMessage::error(error.name, error.message, id));
    }

    /// `type='signal'[,sender='NAME'],<path clause>,interface='IFACE'`
    fn watch_rule(&self, path_clause: &str, path: &str, interface: &str) -> String {
        let mut rule = String::from("type='signal'");
        if let Some(name) = &self.name {
            rule.push_str(&format!(",sender='{name}'"));
        }
        rule.push_str(&format!(",{path_clause}='{path}',interface='{interface}'"));
        rule
    }

    async fn call(self: Arc<Self>, request: CallRequest) {
        let CallRequest {
            call: (path, interface, method, args),
            timeout,
            id,
            flags,
            signature: requested,
        } = request;
        tracing::debug!(%path, %interface, %method, ?id, "Call");

        let signature = match &requested {
            Some(signature) => signature.clone(),
            None if args.is_empty() => String::new(),
            None => {
                let target = self.target(&path);
                match self.cache.get_signature(&interface, &method, Some(target)).await {
                    Ok(signature) => signature,
                    Err(e) => {
                        let error = match e {
                            DbusError::Bus(e) => {
                                BusError::new(e.name, format!("Introspection: {}", e.message))
                            }
                            DbusError::UnknownInterface(_) | DbusError::UnknownMethod { .. } => {
                                BusError::new(
                                    error_names::UNKNOWN_METHOD,
                                    DbusError::unknown_method(&interface, &method).to_string(),
                                )
                            }
                            other => {
                                let (name, message) = other.to_reply();
                                BusError::new(name, message)
                            }
                        };
                        let _guard = self.lock.lock().await;
                        self.send_error(error, id);
                        return;
                    }
                }
            }
        };

        let call = MethodCall::new(self.name.as_deref(), &path, &interface, &method)
            .with_args(&signature, &args)
            .with_timeout(timeout.map(Duration::from_millis));
        let result = self.bus.call_method(call).await;

        let _guard = self.lock.lock().await;
        match result {
            Ok(outs) => self.output.send(DbusMessage::Reply {
                reply: vec![Value::Array(outs)],
                id,
                flags: flags.map(|_| "<".to_string()),
                signature: requested,
            }),
            Err(e) => {
                tracing::debug!(%path, %interface, %method, error = %e, "Call failed");
                self.send_error(e, id);
            }
        }
    }

    async fn add_match(self: Arc<Self>, filter: Map<String, Value>, id: Option<Value>) {
        let rule = match_rule(&filter);
        tracing::debug!(%rule, ?id, "Adding match");

        let signals = match self.bus.add_match(&rule).await {
            Ok(signals) => signals,
            Err(e) => {
                self.send_error(e, id);
                return;
            }
        };
        self.output.send(DbusMessage::reply(vec![], id));

        self.keep(signals, |this, signal| async move {
            let _guard = this.lock.lock().await;
            this.output.send(DbusMessage::signal(
                signal.path,
                signal.interface,
                signal.member,
                signal.body,
            ));
        });
    }

    async fn watch(self: Arc<Self>, request: WatchRequest, id: Option<Value>) {
        let path = request.path.as_deref().or(request.path_namespace.as_deref());
        let Some(path) = path.filter(|_| id.is_some()) else {
            tracing::warn!(?request, ?id, "Incomplete watch request");
            self.output.send(DbusMessage::error(
                error_names::INVALID_ARGS,
                "Incomplete watch request",
                id.clone(),
            ));
            self.output.send(DbusMessage::reply(vec![], id));
            return;
        };
        let recursive = request.path_namespace.as_deref() == Some(path);
        let interface = request.interface.as_deref();
        tracing::debug!(%path, recursive, ?interface, ?id, "Watch");

        let signals = {
            let _guard = self.lock.lock().await;
            let mut meta = BTreeMap::new();
            let mut notify = Notify::new();
            let mut streams = Vec::new();

            let setup = async {
                streams.push(
                    self.setup_path_watch(path, interface, recursive, &mut meta, &mut notify)
                        .await?,
                );
                if recursive {
                    streams.push(
                        self.setup_objectmanager_watch(path, interface, &mut meta, &mut notify)
                            .await?,
                    );
                }
                Ok::<_, DbusError>(())
            };
            if let Err(e) = setup.await {
                tracing::debug!(%path, error = %e, "Watch setup failed");
                let (name, message) = e.to_reply();
                self.output.send(DbusMessage::error(name, message, id));
                return;
            }

            self.output.send(DbusMessage::Meta { meta });
            self.output.send(DbusMessage::Notify { notify });
            self.output.send(DbusMessage::reply(vec![], id));
            futures::stream::select_all(streams).boxed()
        };

        let only = request.interface.clone();
        self.keep(signals, move |this, signal| {
            let only = only.clone();
            async move { this.handle_watch_signal(signal, only.as_deref()).await }
        });
    }

    async fn setup_path_watch(
        &self,
        path: &str,
        interface: Option<&str>,
        recursive: bool,
        meta: &mut BTreeMap<String, InterfaceInfo>,
        notify: &mut Notify,
    ) -> Result<SignalStream, DbusError> {
        let mut found = self.cache.introspect_path(self.target(path)).await?;
        if let Some(interface) = interface {
            found.retain(|name, _| name == interface);
        }

        let clause = if recursive { "path_namespace" } else { "path" };
        let signals = self
            .bus
            .add_match(&self.watch_rule(clause, path, PROPERTIES))
            .await?;

        for name in found.keys().filter(|name| !name.starts_with(STANDARD_PREFIX)) {
            let args = [Value::String(name.clone())];
            let call = MethodCall::new(self.name.as_deref(), path, PROPERTIES, "GetAll")
                .with_args("s", &args);
            match self.bus.call_method(call).await {
                Ok(reply) => {
                    if let Some(Value::Object(props)) = reply.first() {
                        notify_update(notify, path, name, props);
                    }
                }
                Err(e) => tracing::debug!(%path, interface = %name, error = %e, "GetAll failed"),
            }
        }

        meta.extend(found);
        Ok(signals)
    }

    async fn setup_objectmanager_watch(
        &self,
        path: &str,
        interface: Option<&str>,
        meta: &mut BTreeMap<String, InterfaceInfo>,
        notify: &mut Notify,
    ) -> Result<SignalStream, DbusError> {
        let signals = self
            .bus
            .add_match(&self.watch_rule("path", path, OBJECT_MANAGER))
            .await?;

        let call = MethodCall::new(self.name.as_deref(), path, OBJECT_MANAGER, "GetManagedObjects");
        let reply = self.bus.call_method(call).await?;
        if let Some(Value::Object(objects)) = reply.first() {
            for (object, interfaces) in objects {
                if let Some(interfaces) = interfaces.as_object() {
                    self.interfaces_added(object, interfaces, interface, meta, notify)
                        .await;
                }
            }
        }
        Ok(signals)
    }

    /// Metadata for interfaces not disclosed before, and their properties.
    async fn interfaces_added(
        &self,
        path: &str,
        interfaces: &Map<String, Value>,
        only: Option<&str>,
        meta: &mut BTreeMap<String, InterfaceInfo>,
        notify: &mut Notify,
    ) {
        for (name, props) in interfaces {
            if only.is_some_and(|only| only != name) {
                continue;
            }
            if let Some(info) = self.cache.get_interface_if_new(name, self.target(path)).await {
                meta.insert(name.clone(), info);
            }
            if let Some(props) = props.as_object() {
                notify_update(notify, path, name, props);
            }
        }
    }

    async fn handle_watch_signal(&self, signal: BusSignal, only: Option<&str>) {
        let _guard = self.lock.lock().await;
        let mut notify = Notify::new();

        match (signal.interface.as_str(), signal.member.as_str(), signal.body.as_slice()) {
            (PROPERTIES, "PropertiesChanged", [Value::String(name), Value::Object(props), ..]) => {
                notify_update(&mut notify, &signal.path, name, props);
            }
            (OBJECT_MANAGER, "InterfacesAdded", [Value::String(path), Value::Object(interfaces)]) => {
                let mut meta = BTreeMap::new();
                self.interfaces_added(path, interfaces, only, &mut meta, &mut notify)
                    .await;
                self.output.send(DbusMessage::Meta { meta });
            }
            (OBJECT_MANAGER, "InterfacesRemoved", [Value::String(path), Value::Array(names)]) => {
                let removed = notify.entry(path.clone()).or_default();
                for name in names.iter().filter_map(Value::as_str) {
                    removed.insert(name.to_string(), None);
                }
            }
            _ => {
                tracing::debug!(path = %signal.path, interface = %signal.interface, member = %signal.member, "Ignoring signal");
                return;
            }
        }

        self.output.send(DbusMessage::Notify { notify });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbus::testing::{FOO_XML, FakeBus};
    use async_trait::async_trait;
    use serde_json::json;

    const THING_XML: &str = r#"<node>
  <interface name="com.example.Thing">
    <property name="Size" type="t" access="read"/>
  </interface>
</node>"#;

    fn channel(bus: &Arc<FakeBus>) -> (DbusChannel, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = DbusChannel::with_bus(bus.clone(), Some("com.example".into()), tx);
        (channel, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        loop {
            match rx.recv().await.expect("channel output closed") {
                Outbound::Message(message) => return serde_json::to_value(message).unwrap(),
                Outbound::Ready => continue,
            }
        }
    }

    fn foo_bus() -> Arc<FakeBus> {
        let bus = FakeBus::new();
        bus.object("/a", FOO_XML);
        bus.properties("/a", "com.example.Foo", json!({"Bar": {"t": "i", "v": 1}}));
        Arc::new(bus)
    }

    #[tokio::test]
    async fn watch_sends_meta_then_notify_then_reply() {
        let bus = foo_bus();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"watch": {"path": "/a"}, "id": "1"}));

        let meta = next(&mut rx).await;
        assert_eq!(
            meta["meta"]["com.example.Foo"]["properties"]["Bar"],
            json!({"flags": "r", "type": "i"})
        );
        assert_eq!(
            next(&mut rx).await,
            json!({"notify": {"/a": {"com.example.Foo": {"Bar": 1}}}})
        );
        assert_eq!(next(&mut rx).await, json!({"reply": [], "id": "1"}));

        assert_eq!(
            bus.rules(),
            ["type='signal',sender='com.example',path='/a',interface='org.freedesktop.DBus.Properties'"]
        );
        // standard interfaces are never fetched
        assert_eq!(bus.count_calls("GetAll"), 1);

        bus.emit(
            "/a",
            PROPERTIES,
            "PropertiesChanged",
            vec![json!("com.example.Foo"), json!({"Bar": {"t": "i", "v": 2}}), json!(["Baz"])],
        );
        assert_eq!(
            next(&mut rx).await,
            json!({"notify": {"/a": {"com.example.Foo": {"Bar": 2}}}})
        );
    }

    #[tokio::test]
    async fn watch_narrowed_to_interface() {
        let bus = foo_bus();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({
            "watch": {"path": "/a", "interface": "org.freedesktop.DBus.Properties"},
            "id": "1"
        }));

        let meta = next(&mut rx).await;
        assert_eq!(
            meta["meta"].as_object().unwrap().keys().collect::<Vec<_>>(),
            ["org.freedesktop.DBus.Properties"]
        );
        assert_eq!(next(&mut rx).await, json!({"notify": {}}));
        assert_eq!(next(&mut rx).await, json!({"reply": [], "id": "1"}));
        assert_eq!(bus.count_calls("GetAll"), 0);
    }

    #[tokio::test]
    async fn incomplete_watch_gets_error_and_reply() {
        let bus = foo_bus();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"watch": {"interface": "com.example.Foo"}, "id": "9"}));
        assert_eq!(
            next(&mut rx).await,
            json!({"error": ["org.freedesktop.DBus.Error.InvalidArgs", ["Incomplete watch request"]], "id": "9"})
        );
        assert_eq!(next(&mut rx).await, json!({"reply": [], "id": "9"}));

        channel.handle_message(json!({"watch": {"path": "/a"}}));
        assert_eq!(
            next(&mut rx).await,
            json!({"error": ["org.freedesktop.DBus.Error.InvalidArgs", ["Incomplete watch request"]]})
        );
        assert_eq!(next(&mut rx).await, json!({"reply": []}));
        assert_eq!(bus.count_calls("Introspect"), 0);
    }

    #[tokio::test]
    async fn watch_setup_failure_is_an_error_reply() {
        let bus = foo_bus();
        bus.reject_matches();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"watch": {"path": "/a"}, "id": "3"}));
        assert_eq!(
            next(&mut rx).await,
            json!({"error": ["org.freedesktop.DBus.Error.MatchRuleInvalid", ["Match rules rejected"]], "id": "3"})
        );
    }

    #[tokio::test]
    async fn call_without_args_skips_introspection() {
        let bus = foo_bus();
        bus.method("com.example.Foo", "Ping", |_, _| Ok(vec![]));
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"call": ["/a", "com.example.Foo", "Ping", []], "id": "2"}));

        assert_eq!(next(&mut rx).await, json!({"reply": [[]], "id": "2"}));
        assert_eq!(bus.count_calls("Introspect"), 0);
        assert_eq!(bus.calls()[0].destination.as_deref(), Some("com.example"));
    }

    #[tokio::test]
    async fn call_discovers_signature_and_echoes_flags() {
        let bus = foo_bus();
        bus.method("com.example.Foo", "Frob", |_, args| {
            Ok(vec![json!({"echo": {"t": "s", "v": args[0]}})])
        });
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({
            "call": ["/a", "com.example.Foo", "Frob", ["hi", 3]],
            "id": "3",
            "flags": ""
        }));

        assert_eq!(
            next(&mut rx).await,
            json!({"reply": [[{"echo": {"t": "s", "v": "hi"}}]], "id": "3", "flags": "<"})
        );
        let frob = bus.calls().into_iter().find(|c| c.member == "Frob").unwrap();
        assert_eq!(frob.signature, "su");
        assert_eq!(frob.args, [json!("hi"), json!(3)]);
    }

    #[tokio::test]
    async fn explicit_type_is_used_and_echoed() {
        let bus = foo_bus();
        bus.method("com.example.Foo", "Frob", |_, _| Ok(vec![json!({})]));
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({
            "call": ["/a", "com.example.Foo", "Frob", ["hi", 3]],
            "type": "su",
            "id": "4"
        }));

        assert_eq!(
            next(&mut rx).await,
            json!({"reply": [[{}]], "id": "4", "type": "su"})
        );
        assert_eq!(bus.count_calls("Introspect"), 0);
    }

    #[tokio::test]
    async fn unresolvable_method_is_unknown() {
        let bus = foo_bus();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"call": ["/a", "com.example.Nope", "Frob", ["x"]], "id": "5"}));
        assert_eq!(
            next(&mut rx).await,
            json!({
                "error": [
                    "org.freedesktop.DBus.Error.UnknownMethod",
                    ["Introspection data for method com.example.Nope Frob not available"]
                ],
                "id": "5"
            })
        );

        channel.handle_message(json!({"call": ["/a", "com.example.Foo", "Nope", ["x"]], "id": "6"}));
        assert_eq!(
            next(&mut rx).await,
            json!({
                "error": [
                    "org.freedesktop.DBus.Error.UnknownMethod",
                    ["Introspection data for method com.example.Foo Nope not available"]
                ],
                "id": "6"
            })
        );
    }

    #[tokio::test]
    async fn bus_errors_are_forwarded() {
        let bus = foo_bus();
        bus.method("com.example.Foo", "Ping", |_, _| {
            Err(BusError::new("com.example.Error.Busy", "try later"))
        });
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"call": ["/a", "com.example.Foo", "Ping", []], "id": "7"}));
        assert_eq!(
            next(&mut rx).await,
            json!({"error": ["com.example.Error.Busy", ["try later"]], "id": "7"})
        );
    }

    #[tokio::test]
    async fn injected_meta_avoids_introspection() {
        let bus = foo_bus();
        bus.method("com.example.Calc", "Add", |_, args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(vec![json!(sum)])
        });
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({
            "meta": {"com.example.Calc": {"methods": {"Add": {"in": ["i", "i"], "out": ["i"]}}}}
        }));
        channel.handle_message(json!({"call": ["/calc", "com.example.Calc", "Add", [1, 2]], "id": "8"}));

        assert_eq!(next(&mut rx).await, json!({"reply": [[3]], "id": "8"}));
        assert_eq!(bus.count_calls("Introspect"), 0);
        assert_eq!(bus.calls()[0].signature, "ii");
    }

    #[tokio::test]
    async fn add_match_reply_precedes_signals() {
        let bus = foo_bus();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({
            "add-match": {"interface": "com.example.Foo", "member": "Changed"},
            "id": "10"
        }));
        assert_eq!(next(&mut rx).await, json!({"reply": [], "id": "10"}));
        assert_eq!(
            bus.rules(),
            ["type='signal',interface='com.example.Foo',member='Changed'"]
        );

        bus.emit("/a", "com.example.Foo", "Other", vec![json!(0)]);
        bus.emit("/a", "com.example.Foo", "Changed", vec![json!(1)]);
        bus.emit("/b", "com.example.Foo", "Changed", vec![json!(2)]);

        assert_eq!(
            next(&mut rx).await,
            json!({"signal": ["/a", "com.example.Foo", "Changed", [1]]})
        );
        assert_eq!(
            next(&mut rx).await,
            json!({"signal": ["/b", "com.example.Foo", "Changed", [2]]})
        );
    }

    #[tokio::test]
    async fn rejected_match_is_an_error_reply() {
        let bus = foo_bus();
        bus.reject_matches();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"add-match": {"member": "Changed"}, "id": "11"}));
        assert_eq!(
            next(&mut rx).await,
            json!({"error": ["org.freedesktop.DBus.Error.MatchRuleInvalid", ["Match rules rejected"]], "id": "11"})
        );
    }

    #[tokio::test]
    async fn malformed_request_keeps_channel_open() {
        let bus = foo_bus();
        bus.method("com.example.Foo", "Ping", |_, _| Ok(vec![]));
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"call": ["/a"], "id": "12"}));
        let error = next(&mut rx).await;
        assert_eq!(error["error"][0], "org.freedesktop.DBus.Error.InvalidArgs");
        assert_eq!(error["id"], "12");
        assert_eq!(next(&mut rx).await, json!({"reply": [], "id": "12"}));

        channel.handle_message(json!({"nothing": true}));
        channel.handle_message(json!({"call": ["/a", "com.example.Foo", "Ping", []], "id": "13"}));
        assert_eq!(next(&mut rx).await, json!({"reply": [[]], "id": "13"}));
    }

    #[tokio::test]
    async fn panicking_task_becomes_failed_reply() {
        let bus = foo_bus();
        bus.method("com.example.Foo", "Ping", |_, _| panic!("handler exploded"));
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"call": ["/a", "com.example.Foo", "Ping", []], "id": "14"}));
        assert_eq!(
            next(&mut rx).await,
            json!({"error": ["org.freedesktop.DBus.Error.Failed", ["handler exploded"]], "id": "14"})
        );
    }

    #[tokio::test]
    async fn settle_waits_for_replies_not_subscriptions() {
        let bus = foo_bus();
        bus.method("com.example.Foo", "Ping", |_, _| Ok(vec![]));
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"add-match": {"member": "Changed"}, "id": "1"}));
        channel.handle_message(json!({"call": ["/a", "com.example.Foo", "Ping", []], "id": "2"}));
        channel.settle().await;

        let mut ids = Vec::new();
        while let Ok(Outbound::Message(message)) = rx.try_recv() {
            ids.push(serde_json::to_value(message).unwrap()["id"].clone());
        }
        ids.sort_by_key(|id| id.to_string());
        assert_eq!(ids, [json!("1"), json!("2")]);

        bus.emit("/a", "com.example.Foo", "Changed", vec![]);
        assert_eq!(
            next(&mut rx).await,
            json!({"signal": ["/a", "com.example.Foo", "Changed", []]})
        );
    }

    #[tokio::test]
    async fn dropping_the_channel_stops_subscriptions() {
        let bus = foo_bus();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"add-match": {"member": "Changed"}, "id": "1"}));
        assert_eq!(next(&mut rx).await, json!({"reply": [], "id": "1"}));

        drop(channel);
        bus.emit("/a", "com.example.Foo", "Changed", vec![]);
        assert_eq!(rx.recv().await, None);
    }

    fn manager_bus() -> Arc<FakeBus> {
        let bus = FakeBus::new();
        bus.object("/m", FOO_XML);
        bus.object("/m/0", THING_XML);
        bus.properties("/m", "com.example.Foo", json!({"Bar": {"t": "i", "v": 1}}));
        bus.managed_objects(
            "/m",
            json!({"/m/0": {"com.example.Thing": {"Size": {"t": "t", "v": 7}}}}),
        );
        Arc::new(bus)
    }

    async fn watch_namespace(channel: &mut DbusChannel, rx: &mut mpsc::UnboundedReceiver<Outbound>) {
        channel.handle_message(json!({"watch": {"path_namespace": "/m"}, "id": "1"}));
        let meta = next(rx).await;
        assert!(meta["meta"]["com.example.Thing"].is_object());
        assert_eq!(
            next(rx).await,
            json!({"notify": {
                "/m": {"com.example.Foo": {"Bar": 1}},
                "/m/0": {"com.example.Thing": {"Size": 7}}
            }})
        );
        assert_eq!(next(rx).await, json!({"reply": [], "id": "1"}));
    }

    #[tokio::test]
    async fn recursive_watch_enumerates_managed_objects() {
        let bus = manager_bus();
        let (mut channel, mut rx) = channel(&bus);

        watch_namespace(&mut channel, &mut rx).await;
        assert_eq!(
            bus.rules(),
            [
                "type='signal',sender='com.example',path_namespace='/m',interface='org.freedesktop.DBus.Properties'",
                "type='signal',sender='com.example',path='/m',interface='org.freedesktop.DBus.ObjectManager'",
            ]
        );

        bus.emit(
            "/m",
            OBJECT_MANAGER,
            "InterfacesRemoved",
            vec![json!("/m/0"), json!(["com.example.Thing"])],
        );
        assert_eq!(
            next(&mut rx).await,
            json!({"notify": {"/m/0": {"com.example.Thing": null}}})
        );

        // already disclosed: meta is empty, properties still flow
        bus.emit(
            "/m",
            OBJECT_MANAGER,
            "InterfacesAdded",
            vec![json!("/m/0"), json!({"com.example.Thing": {"Size": {"t": "t", "v": 8}}})],
        );
        assert_eq!(next(&mut rx).await, json!({"meta": {}}));
        assert_eq!(
            next(&mut rx).await,
            json!({"notify": {"/m/0": {"com.example.Thing": {"Size": 8}}}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn signal_output_keeps_bus_order_across_introspection() {
        let bus = manager_bus();
        bus.object("/m/1", &THING_XML.replace("Thing", "Widget"));
        bus.introspect_delay("/m/1", Duration::from_millis(50));
        bus.method("com.example.Foo", "Create", |bus, _| {
            bus.emit(
                "/m",
                OBJECT_MANAGER,
                "InterfacesAdded",
                vec![json!("/m/1"), json!({"com.example.Widget": {"Size": {"t": "t", "v": 42}}})],
            );
            Ok(vec![json!("/m/1")])
        });
        let (mut channel, mut rx) = channel(&bus);
        watch_namespace(&mut channel, &mut rx).await;

        channel.handle_message(json!({"call": ["/m", "com.example.Foo", "Create", []], "id": "2"}));

        let meta = next(&mut rx).await;
        assert_eq!(
            meta["meta"]["com.example.Widget"]["properties"]["Size"],
            json!({"flags": "r", "type": "t"})
        );
        assert_eq!(
            next(&mut rx).await,
            json!({"notify": {"/m/1": {"com.example.Widget": {"Size": 42}}}})
        );
        assert_eq!(next(&mut rx).await, json!({"reply": [["/m/1"]], "id": "2"}));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_signals_are_all_sent_before_a_later_reply() {
        let bus = manager_bus();
        bus.object("/m/1", &THING_XML.replace("Thing", "Widget"));
        bus.introspect_delay("/m/1", Duration::from_millis(50));
        bus.method("com.example.Foo", "Create", |bus, _| {
            bus.emit(
                "/m",
                OBJECT_MANAGER,
                "InterfacesAdded",
                vec![json!("/m/1"), json!({"com.example.Widget": {"Size": {"t": "t", "v": 42}}})],
            );
            bus.emit(
                "/m",
                PROPERTIES,
                "PropertiesChanged",
                vec![json!("com.example.Foo"), json!({"Bar": {"t": "i", "v": 5}}), json!([])],
            );
            Ok(vec![json!("/m/1")])
        });
        let (mut channel, mut rx) = channel(&bus);
        watch_namespace(&mut channel, &mut rx).await;

        channel.handle_message(json!({"call": ["/m", "com.example.Foo", "Create", []], "id": "2"}));

        assert!(next(&mut rx).await["meta"]["com.example.Widget"].is_object());
        assert_eq!(
            next(&mut rx).await,
            json!({"notify": {"/m/1": {"com.example.Widget": {"Size": 42}}}})
        );
        assert_eq!(
            next(&mut rx).await,
            json!({"notify": {"/m": {"com.example.Foo": {"Bar": 5}}}})
        );
        assert_eq!(next(&mut rx).await, json!({"reply": [["/m/1"]], "id": "2"}));
    }

    #[tokio::test]
    async fn add_match_signals_keep_bus_order() {
        let bus = foo_bus();
        let (mut channel, mut rx) = channel(&bus);

        channel.handle_message(json!({"add-match": {"interface": "com.example.Foo"}, "id": "1"}));
        assert_eq!(next(&mut rx).await, json!({"reply": [], "id": "1"}));

        for n in 0..5 {
            bus.emit("/a", "com.example.Foo", "Changed", vec![json!(n)]);
        }
        for n in 0..5 {
            assert_eq!(
                next(&mut rx).await,
                json!({"signal": ["/a", "com.example.Foo", "Changed", [n]]})
            );
        }
    }

    struct InternalOnly(Arc<FakeBus>);

    #[async_trait]
    impl BusConnector for InternalOnly {
        async fn connect(&self, kind: BusKind) -> Result<Arc<dyn Bus>, BusError> {
            match kind {
                BusKind::Internal => Ok(Arc::clone(&self.0) as Arc<dyn Bus>),
                _ => Err(BusError::failed("not connected")),
            }
        }
    }

    #[tokio::test]
    async fn open_signals_ready_or_fails_with_protocol_error() {
        let connector = InternalOnly(foo_bus());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let options = OpenOptions::from_json(&json!({"bus": "internal", "name": "com.example"}));
        assert_eq!(options, OpenOptions::new(BusKind::Internal).with_name("com.example"));
        let _channel = DbusChannel::open(options, &connector, tx.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Ready));

        let Err(err) = DbusChannel::open(OpenOptions::from_json(&json!({"bus": "session"})), &connector, tx).await
        else {
            panic!("session bus should not connect");
        };
        assert_eq!(err.problem, "protocol-error");
        assert_eq!(err.message, "failed to connect to session bus: not connected");
    }
}
