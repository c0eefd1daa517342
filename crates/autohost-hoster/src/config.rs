use std::{
    net::IpAddr,
    path::Path,
    sync::{Arc, RwLock},
};

use anyhow::Context;
use serde_json::Value;

pub type ConfigLayer = Arc<RwLock<Value>>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration has no layers")]
    NoLayers,
    #[error("empty key path")]
    EmptyPath,
    #[error("key {0:?} is not an object and can not hold children")]
    NotAnObject(String),
}

pub fn layer(value: Value) -> ConfigLayer {
    Arc::new(RwLock::new(value))
}

/// Reads the global config file (TOML) into a JSON tree.
pub fn load_file(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let parsed: toml::Value =
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
    serde_json::to_value(parsed).context("convert config to json tree")
}

fn walk<'a>(mut v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    for key in path {
        v = v.as_object()?.get(*key)?;
    }
    Some(v)
}

/// Chain of layers, outermost first: the per-room override layer, then the
/// queue layer, then the global file. A lookup returns the value from the
/// first layer that defines the key with the requested type. Layers are
/// never deep-merged.
#[derive(Clone, Debug, Default)]
pub struct LayeredConfig {
    layers: Vec<ConfigLayer>,
}

impl LayeredConfig {
    pub fn new(layers: Vec<ConfigLayer>) -> Self {
        Self { layers }
    }

    /// Returns a new chain with `value` as the new outermost layer.
    pub fn with_outer(&self, value: Value) -> Self {
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push(layer(value));
        layers.extend(self.layers.iter().cloned());
        Self { layers }
    }

    fn lookup<T>(&self, path: &[&str], extract: impl Fn(&Value) -> Option<T>) -> Option<T> {
        for l in &self.layers {
            let guard = l.read().unwrap_or_else(|e| e.into_inner());
            if let Some(v) = walk(&guard, path).and_then(&extract) {
                return Some(v);
            }
        }
        None
    }

    pub fn get_value(&self, path: &[&str]) -> Option<Value> {
        self.lookup(path, |v| Some(v.clone()))
    }

    pub fn get_bool(&self, path: &[&str]) -> Option<bool> {
        self.lookup(path, Value::as_bool)
    }

    pub fn get_i64(&self, path: &[&str]) -> Option<i64> {
        self.lookup(path, Value::as_i64)
    }

    pub fn get_str(&self, path: &[&str]) -> Option<String> {
        self.lookup(path, |v| v.as_str().map(str::to_string))
    }

    pub fn get_str_list(&self, path: &[&str]) -> Option<Vec<String>> {
        self.lookup(path, |v| {
            v.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
        })
    }

    pub fn get_keys(&self, path: &[&str]) -> Option<Vec<String>> {
        self.lookup(path, |v| v.as_object().map(|o| o.keys().cloned().collect()))
    }

    pub fn bool_or(&self, path: &[&str], default: bool) -> bool {
        self.get_bool(path).unwrap_or(default)
    }

    pub fn i64_or(&self, path: &[&str], default: i64) -> i64 {
        self.get_i64(path).unwrap_or(default)
    }

    /// Collects a string list from every layer that defines it.
    pub fn str_list_all_layers(&self, path: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for l in &self.layers {
            let guard = l.read().unwrap_or_else(|e| e.into_inner());
            if let Some(items) = walk(&guard, path).and_then(Value::as_array) {
                out.extend(items.iter().filter_map(|i| i.as_str().map(str::to_string)));
            }
        }
        out
    }

    /// Writes into the outermost layer only.
    pub fn set_top(&self, path: &[&str], value: Value) -> Result<(), ConfigError> {
        let top = self.layers.first().ok_or(ConfigError::NoLayers)?;
        let (last, parents) = path.split_last().ok_or(ConfigError::EmptyPath)?;
        let mut guard = top.write().unwrap_or_else(|e| e.into_inner());
        let mut node: &mut Value = &mut guard;
        for key in parents {
            if node.is_null() {
                *node = Value::Object(Default::default());
            }
            let obj = node
                .as_object_mut()
                .ok_or_else(|| ConfigError::NotAnObject(key.to_string()))?;
            node = obj
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        if node.is_null() {
            *node = Value::Object(Default::default());
        }
        node.as_object_mut()
            .ok_or_else(|| ConfigError::NotAnObject(last.to_string()))?
            .insert(last.to_string(), value);
        Ok(())
    }

    pub fn top_snapshot(&self) -> Value {
        self.layers
            .first()
            .map(|l| l.read().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or(Value::Null)
    }

    /// Tests `ip` against a `{ "<cidr>": bool | "string" }` rule table.
    ///
    /// Layers are applied innermost first so an outer layer can disable a
    /// rule an inner layer enabled.
    pub fn ip_rule_matches(&self, ip: &str, path: &[&str]) -> bool {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            tracing::debug!(ip, "ip rule match skipped, address does not parse");
            return false;
        };
        let mut rules = std::collections::BTreeMap::<String, bool>::new();
        for l in self.layers.iter().rev() {
            let guard = l.read().unwrap_or_else(|e| e.into_inner());
            let Some(table) = walk(&guard, path).and_then(Value::as_object) else {
                continue;
            };
            for (cidr, v) in table {
                let enabled = match v {
                    Value::Bool(b) => *b,
                    Value::String(s) => !s.starts_with("false"),
                    _ => continue,
                };
                if enabled {
                    rules.insert(cidr.clone(), true);
                } else {
                    rules.remove(cidr);
                }
            }
        }
        for cidr in rules.keys() {
            match cidr_contains(cidr, addr) {
                Some(true) => {
                    tracing::info!(ip, rule = %cidr, "ip rule matched");
                    return true;
                }
                Some(false) => {}
                None => tracing::warn!(rule = %cidr, "ip rule is not in CIDR notation"),
            }
        }
        false
    }
}

/// `None` when `cidr` does not parse.
fn cidr_contains(cidr: &str, addr: IpAddr) -> Option<bool> {
    let (net, bits) = cidr.split_once('/')?;
    let net: IpAddr = net.parse().ok()?;
    let bits: u32 = bits.parse().ok()?;
    match (net, addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            if bits > 32 {
                return None;
            }
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            Some(u32::from(n) & mask == u32::from(a) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            if bits > 128 {
                return None;
            }
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            Some(u128::from(n) & mask == u128::from(a) & mask)
        }
        _ => Some(false),
    }
}
