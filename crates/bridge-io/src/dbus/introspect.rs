//! Introspection XML to interface descriptions.
//!
//! The serialized form is what clients see in `meta` messages and may send
//! back in their own `meta` requests:
//! `{"methods": {M: {"in": [..], "out": [..]}}, "properties": {P: {"flags": "r", "type": "s"}}, "signals": {S: {"in": [..]}}}`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    #[serde(default)]
    pub methods: BTreeMap<String, MethodInfo>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyInfo>,
    #[serde(default)]
    pub signals: BTreeMap<String, SignalInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    #[serde(rename = "in", default)]
    pub inputs: Vec<String>,
    #[serde(rename = "out", default)]
    pub outputs: Vec<String>,
}

impl MethodInfo {
    /// Concatenated input signature, as needed to encode a call.
    pub fn in_signature(&self) -> String {
        self.inputs.concat()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    /// `r`, `w` or `rw`.
    pub flags: String,
    #[serde(rename = "type")]
    pub signature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    #[serde(rename = "in", default)]
    pub args: Vec<String>,
}

/// Interfaces declared directly on the introspected object. Child nodes are
/// not descended into.
pub fn parse(xml: &str) -> Result<BTreeMap<String, InterfaceInfo>, roxmltree::Error> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..roxmltree::ParsingOptions::default()
    };
    let doc = roxmltree::Document::parse_with_options(xml, options)?;
    Ok(doc
        .root_element()
        .children()
        .filter(|node| node.has_tag_name("interface"))
        .filter_map(|node| Some((node.attribute("name")?.to_string(), parse_interface(node))))
        .collect())
}

fn parse_interface(node: roxmltree::Node<'_, '_>) -> InterfaceInfo {
    let mut info = InterfaceInfo::default();
    for member in node.children().filter(roxmltree::Node::is_element) {
        let Some(name) = member.attribute("name") else {
            continue;
        };
        match member.tag_name().name() {
            "method" => {
                let mut method = MethodInfo::default();
                for (direction, signature) in args(member) {
                    match direction {
                        "out" => method.outputs.push(signature),
                        _ => method.inputs.push(signature),
                    }
                }
                info.methods.insert(name.to_string(), method);
            }
            "property" => {
                let flags = match member.attribute("access") {
                    Some("write") => "w",
                    Some("readwrite") => "rw",
                    _ => "r",
                };
                info.properties.insert(
                    name.to_string(),
                    PropertyInfo {
                        flags: flags.to_string(),
                        signature: member.attribute("type").unwrap_or_default().to_string(),
                    },
                );
            }
            "signal" => {
                let args = args(member).map(|(_, signature)| signature).collect();
                info.signals.insert(name.to_string(), SignalInfo { args });
            }
            _ => {}
        }
    }
    info
}

/// `(direction, type)` for each `<arg>`; direction defaults to `in`.
fn args<'a>(member: roxmltree::Node<'a, '_>) -> impl Iterator<Item = (&'a str, String)> {
    member
        .children()
        .filter(|node| node.has_tag_name("arg"))
        .filter_map(|arg| {
            let signature = arg.attribute("type")?;
            Some((arg.attribute("direction").unwrap_or("in"), signature.to_string()))
        })
}
