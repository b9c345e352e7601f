//! In-memory bus for the channel and cache tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::bus::{
    Bus, BusError, BusSignal, INTROSPECTABLE, MethodCall, OBJECT_MANAGER, PROPERTIES,
    SignalStream, error_names,
};

pub(crate) const FOO_XML: &str = r#"<node>
  <interface name="com.example.Foo">
    <method name="Frob">
      <arg type="s"/>
      <arg type="u"/>
      <arg type="a{sv}" direction="out"/>
    </method>
    <method name="Ping"/>
    <property name="Bar" type="i" access="read"/>
  </interface>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="GetAll">
      <arg type="s"/>
      <arg type="a{sv}" direction="out"/>
    </method>
  </interface>
</node>"#;

type Handler = Arc<dyn Fn(&FakeBus, &[Value]) -> Result<Vec<Value>, BusError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedCall {
    pub destination: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub signature: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
struct FakeState {
    objects: HashMap<String, String>,
    introspect_delays: HashMap<String, Duration>,
    properties: HashMap<(String, String), Value>,
    managed: HashMap<String, Value>,
    methods: HashMap<(String, String), Handler>,
    calls: Vec<RecordedCall>,
    matches: Vec<(String, mpsc::UnboundedSender<BusSignal>)>,
    reject_matches: bool,
}

#[derive(Default)]
pub(crate) struct FakeBus {
    state: StdMutex<FakeState>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn object(&self, path: &str, xml: &str) {
        self.state().objects.insert(path.into(), xml.into());
    }

    pub fn introspect_delay(&self, path: &str, delay: Duration) {
        self.state().introspect_delays.insert(path.into(), delay);
    }

    /// `GetAll` reply for `interface` at `path`: `{prop: {"t", "v"}}`.
    pub fn properties(&self, path: &str, interface: &str, props: Value) {
        self.state()
            .properties
            .insert((path.into(), interface.into()), props);
    }

    pub fn managed_objects(&self, path: &str, objects: Value) {
        self.state().managed.insert(path.into(), objects);
    }

    pub fn method(
        &self,
        interface: &str,
        member: &str,
        handler: impl Fn(&FakeBus, &[Value]) -> Result<Vec<Value>, BusError> + Send + Sync + 'static,
    ) {
        self.state()
            .methods
            .insert((interface.into(), member.into()), Arc::new(handler));
    }

    pub fn reject_matches(&self) {
        self.state().reject_matches = true;
    }

    pub fn emit(&self, path: &str, interface: &str, member: &str, body: Vec<Value>) {
        let signal = BusSignal {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            body,
        };
        let mut state = self.state();
        state.matches.retain(|(rule, tx)| {
            if rule_matches(rule, &signal) {
                return tx.send(signal.clone()).is_ok();
            }
            !tx.is_closed()
        });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, member: &str) -> usize {
        self.state().calls.iter().filter(|c| c.member == member).count()
    }

    pub fn rules(&self) -> Vec<String> {
        self.state().matches.iter().map(|(rule, _)| rule.clone()).collect()
    }
}

fn rule_matches(rule: &str, signal: &BusSignal) -> bool {
    rule.split(',')
        .filter_map(|clause| clause.split_once('='))
        .all(|(key, value)| {
            let value = value.trim_matches('\'');
            match key {
                "path" => signal.path == value,
                "path_namespace" => {
                    let prefix = format!("{}/", value.trim_end_matches('/'));
                    signal.path == value || signal.path.starts_with(&prefix)
                }
                "interface" => signal.interface == value,
                "member" => signal.member == value,
                _ => true,
            }
        })
}

#[async_trait]
impl Bus for FakeBus {
    async fn call_method(&self, call: MethodCall<'_>) -> Result<Vec<Value>, BusError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(RecordedCall {
                destination: call.destination.map(Into::into),
                path: call.path.into(),
                interface: call.interface.into(),
                member: call.member.into(),
                signature: call.signature.into(),
                args: call.args.to_vec(),
            });
            match call.member {
                "Introspect" => state.introspect_delays.get(call.path).copied(),
                _ => None,
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handler = {
            let state = self.state();
            match (call.interface, call.member) {
                (INTROSPECTABLE, "Introspect") => {
                    return state
                        .objects
                        .get(call.path)
                        .map(|xml| vec![json!(xml)])
                        .ok_or_else(|| {
                            BusError::new(error_names::UNKNOWN_METHOD, format!("No object at {}", call.path))
                        });
                }
                (PROPERTIES, "GetAll") => {
                    let interface = call.args.first().and_then(Value::as_str).unwrap_or_default();
                    return state
                        .properties
                        .get(&(call.path.to_string(), interface.to_string()))
                        .map(|props| vec![props.clone()])
                        .ok_or_else(|| {
                            BusError::new(
                                "org.freedesktop.DBus.Error.UnknownInterface",
                                format!("No interface {interface}"),
                            )
                        });
                }
                (OBJECT_MANAGER, "GetManagedObjects") => {
                    return state
                        .managed
                        .get(call.path)
                        .map(|objects| vec![objects.clone()])
                        .ok_or_else(|| BusError::new(error_names::UNKNOWN_METHOD, "No ObjectManager"));
                }
                (interface, member) => state
                    .methods
                    .get(&(interface.to_string(), member.to_string()))
                    .cloned(),
            }
        };

        let handler = handler.ok_or_else(|| {
            BusError::new(
                error_names::UNKNOWN_METHOD,
                format!("No method {}.{}", call.interface, call.member),
            )
        })?;
        let reply = (*handler)(self, call.args);
        // let subscribers see signals emitted by the handler before the reply
        tokio::task::yield_now().await;
        reply
    }

    async fn add_match(&self, rule: &str) -> Result<SignalStream, BusError> {
        let mut state = self.state();
        if state.reject_matches {
            return Err(BusError::new(
                "org.freedesktop.DBus.Error.MatchRuleInvalid",
                "Match rules rejected",
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.matches.push((rule.to_string(), tx));
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|signal| (signal, rx))
        })
        .boxed())
    }
}
