//! Interface descriptions learned from introspection or injected by clients.
//!
//! Entries are never evicted. The mutex is never held across a bus call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex as StdMutex;

use serde_json::Value;

use super::bus::{Bus, INTROSPECTABLE, MethodCall};
use super::introspect::{self, InterfaceInfo};
use super::DbusError;

/// Where to introspect when an interface is not cached yet.
#[derive(Clone, Copy)]
pub struct Target<'a> {
    pub bus: &'a dyn Bus,
    pub destination: Option<&'a str>,
    pub path: &'a str,
}

impl<'a> Target<'a> {
    pub fn new(bus: &'a dyn Bus, destination: Option<&'a str>, path: &'a str) -> Self {
        Self {
            bus,
            destination,
            path,
        }
    }
}

#[derive(Default)]
struct CacheState {
    interfaces: HashMap<String, InterfaceInfo>,
    /// Names already handed out by `get_interface_if_new`.
    old: HashSet<String>,
}

#[derive(Default)]
pub struct InterfaceCache {
    state: StdMutex<CacheState>,
}

impl InterfaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inject(&self, interfaces: impl IntoIterator<Item = (String, InterfaceInfo)>) {
        self.state().interfaces.extend(interfaces);
    }

    pub fn cached(&self, name: &str) -> Option<InterfaceInfo> {
        self.state().interfaces.get(name).cloned()
    }

    /// Introspect the target object, remember everything found and return it.
    pub async fn introspect_path(
        &self,
        target: Target<'_>,
    ) -> Result<BTreeMap<String, InterfaceInfo>, DbusError> {
        tracing::debug!(path = target.path, destination = ?target.destination, "Introspecting");
        let call = MethodCall::new(target.destination, target.path, INTROSPECTABLE, "Introspect");
        let reply = target.bus.call_method(call).await?;

        let xml = match reply.first() {
            Some(Value::String(xml)) => xml,
            _ => return Err(DbusError::introspection("unexpected Introspect reply")),
        };
        let interfaces = introspect::parse(xml).map_err(DbusError::introspection)?;

        self.inject(interfaces.clone());
        Ok(interfaces)
    }

    /// Cached description, introspecting the target once on a miss. Failures
    /// during that introspection are swallowed.
    pub async fn get_interface(
        &self,
        name: &str,
        target: Option<Target<'_>>,
    ) -> Option<InterfaceInfo> {
        if let Some(info) = self.cached(name) {
            return Some(info);
        }

        let target = target?;
        if let Err(e) = self.introspect_path(target).await {
            tracing::debug!(interface = name, path = target.path, error = %e, "Introspection failed");
        }
        self.cached(name)
    }

    /// Like [`Self::get_interface`], but only the first request for a name
    /// yields anything.
    pub async fn get_interface_if_new(&self, name: &str, target: Target<'_>) -> Option<InterfaceInfo> {
        if !self.state().old.insert(name.to_string()) {
            return None;
        }
        self.get_interface(name, Some(target)).await
    }

    /// Joined input signature of `interface.method`.
    pub async fn get_signature(
        &self,
        interface: &str,
        method: &str,
        target: Option<Target<'_>>,
    ) -> Result<String, DbusError> {
        let info = self
            .get_interface(interface, target)
            .await
            .ok_or_else(|| DbusError::UnknownInterface(interface.to_string()))?;
        info.methods
            .get(method)
            .map(|method| method.in_signature())
            .ok_or_else(|| DbusError::unknown_method(interface, method))
    }
}
