use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use autohost_instance::InstanceId;

/// Remembers identities a moderator moved to spectators, per instance.
///
/// Every call takes `is_live`, which tells whether an instance still
/// accepts joins; entries for other instances are dropped first.
#[derive(Debug, Default)]
pub struct MovedOutTracker {
    inner: Mutex<HashMap<String, HashSet<InstanceId>>>,
}

impl MovedOutTracker {
    fn with_purged<R>(
        &self,
        is_live: impl Fn(InstanceId) -> bool,
        f: impl FnOnce(&mut HashMap<String, HashSet<InstanceId>>) -> R,
    ) -> R {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.retain(|_, ids| {
            ids.retain(|id| is_live(*id));
            !ids.is_empty()
        });
        f(&mut g)
    }

    pub fn add(&self, identity: &str, instance: InstanceId, is_live: impl Fn(InstanceId) -> bool) {
        self.with_purged(is_live, |m| {
            m.entry(identity.to_string()).or_default().insert(instance);
        })
    }

    pub fn remove(
        &self,
        identity: &str,
        instance: InstanceId,
        is_live: impl Fn(InstanceId) -> bool,
    ) {
        self.with_purged(is_live, |m| {
            if let Some(ids) = m.get_mut(identity) {
                ids.remove(&instance);
                if ids.is_empty() {
                    m.remove(identity);
                }
            }
        })
    }

    pub fn present(
        &self,
        identity: &str,
        instance: InstanceId,
        is_live: impl Fn(InstanceId) -> bool,
    ) -> bool {
        self.with_purged(is_live, |m| {
            m.get(identity).is_some_and(|ids| ids.contains(&instance))
        })
    }

    #[cfg(test)]
    fn identities(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_present_remove() {
        let t = MovedOutTracker::default();
        let live = |_: InstanceId| true;
        t.add("pk1", InstanceId(1), live);
        t.add("pk1", InstanceId(2), live);
        assert!(t.present("pk1", InstanceId(1), live));
        assert!(!t.present("pk1", InstanceId(3), live));
        assert!(!t.present("pk2", InstanceId(1), live));
        t.remove("pk1", InstanceId(1), live);
        assert!(!t.present("pk1", InstanceId(1), live));
        assert!(t.present("pk1", InstanceId(2), live));
    }

    #[test]
    fn dead_instances_are_purged_on_access() {
        let t = MovedOutTracker::default();
        t.add("pk1", InstanceId(1), |_| true);
        t.add("pk2", InstanceId(2), |_| true);
        assert!(!t.present("pk1", InstanceId(1), |id| id != InstanceId(1)));
        assert_eq!(t.identities(), 1);
        t.remove("nobody", InstanceId(9), |_| false);
        assert_eq!(t.identities(), 0);
    }
}
