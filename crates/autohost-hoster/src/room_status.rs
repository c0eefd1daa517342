use std::sync::{Arc, RwLock};

use base64::Engine;
use serde_json::Value;
use sha2::Digest;

/// Slots scanned when looking for humans.
pub const MAX_SLOTS: usize = 10;

/// Live mirror of the lobby state reported by the child, shaped as
/// `{ "players": [ { "type": "player", "ip": "...", "pk": "<b64>", "name": "..." }, ... ] }`
/// where the array index is the slot number.
#[derive(Clone, Debug, Default)]
pub struct RoomStatus {
    inner: Arc<RwLock<Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashLookup {
    NotFound,
    Ambiguous,
    Found { ip: String, name: String },
}

impl RoomStatus {
    pub fn replace(&self, v: Value) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = v;
    }

    /// Deep copy; callers inspect the copy so the reader task can keep
    /// updating the live tree.
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot(self.inner.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoomSnapshot(pub Value);

pub fn identity_hash(pubkey: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(pubkey))
}

impl RoomSnapshot {
    fn players(&self) -> &[Value] {
        self.0
            .get("players")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// String property of a slot, empty when absent.
    pub fn slot_property(&self, slot: usize, key: &str) -> String {
        self.players()
            .get(slot)
            .and_then(|p| p.get(key))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn has_human_player(&self) -> bool {
        (0..MAX_SLOTS).any(|slot| self.slot_property(slot, "type") == "player")
    }

    /// Finds the player whose identity hash starts with `prefix`.
    pub fn lookup_hash_prefix(&self, prefix: &str) -> HashLookup {
        let b64 = base64::engine::general_purpose::STANDARD;
        let prefix = prefix.to_ascii_lowercase();
        let mut found: Option<(String, String)> = None;
        for p in self.players() {
            let Some(pk) = p.get("pk").and_then(Value::as_str) else {
                continue;
            };
            let pk = match b64.decode(pk) {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(%err, "room status carries undecodable pk");
                    continue;
                }
            };
            if !identity_hash(&pk).starts_with(&prefix) {
                continue;
            }
            if found.is_some() {
                return HashLookup::Ambiguous;
            }
            let Some(ip) = p.get("ip").and_then(Value::as_str) else {
                tracing::warn!("room status player without ip");
                continue;
            };
            let name = p.get("name").and_then(Value::as_str).unwrap_or_default();
            found = Some((ip.to_string(), name.to_string()));
        }
        match found {
            Some((ip, name)) => HashLookup::Found { ip, name },
            None => HashLookup::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pk(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    fn room() -> RoomStatus {
        let r = RoomStatus::default();
        r.replace(json!({"players": [
            {"type": "player", "ip": "10.0.0.1", "pk": pk("alice"), "name": "alice"},
            {"type": "closed"},
            {"type": "player", "ip": "10.0.0.3", "pk": pk("bob"), "name": "bob"},
        ]}));
        r
    }

    #[test]
    fn slot_properties() {
        let s = room().snapshot();
        assert_eq!(s.slot_property(0, "ip"), "10.0.0.1");
        assert_eq!(s.slot_property(1, "ip"), "");
        assert_eq!(s.slot_property(9, "ip"), "");
        assert!(s.has_human_player());
        assert!(!RoomSnapshot::default().has_human_player());
    }

    #[test]
    fn snapshot_is_detached_from_live_tree() {
        let r = room();
        let s = r.snapshot();
        r.replace(json!({}));
        assert_eq!(s.slot_property(2, "name"), "bob");
    }

    #[test]
    fn hash_prefix_lookup() {
        let s = room().snapshot();
        let alice = identity_hash(b"alice");
        assert_eq!(
            s.lookup_hash_prefix(&alice[..6]),
            HashLookup::Found {
                ip: "10.0.0.1".into(),
                name: "alice".into()
            }
        );
        assert_eq!(s.lookup_hash_prefix("zzz"), HashLookup::NotFound);
        assert_eq!(s.lookup_hash_prefix(""), HashLookup::Ambiguous);
    }
}
