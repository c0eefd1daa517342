use std::{path::PathBuf, sync::Arc};

use autohost_instance::InstanceId;

use crate::{
    abuse::AbuseStores,
    collaborators::{Alerter, ArchiveSink, IpReputation, LobbyFetcher, Storage},
    config::LayeredConfig,
    instance::InstanceRegistry,
};

#[derive(Debug, Clone)]
pub struct Paths {
    pub runs_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl Paths {
    pub fn from_config(cfg: &LayeredConfig) -> Self {
        let dir = |key: &str, d: &str| PathBuf::from(cfg.get_str(&[key]).unwrap_or_else(|| d.into()));
        Self {
            runs_dir: dir("runs_dir", "run/instances"),
            archive_dir: dir("archive_dir", "run/archive"),
        }
    }

    pub fn instance_dir(&self, id: InstanceId) -> PathBuf {
        self.runs_dir.join(id.to_string())
    }
}

/// Everything a runner, the scheduler and recovery share.
#[derive(Clone)]
pub struct HosterState {
    /// Global layers only; instances prepend their own.
    pub cfg: LayeredConfig,
    pub paths: Paths,
    pub registry: InstanceRegistry,
    pub abuse: Arc<AbuseStores>,
    pub storage: Arc<dyn Storage>,
    pub archive: Arc<dyn ArchiveSink>,
    pub ip_reputation: Arc<dyn IpReputation>,
    pub lobby: Arc<dyn LobbyFetcher>,
    pub alerter: Arc<dyn Alerter>,
}

impl HosterState {
    pub fn alert(&self, msg: impl Into<String>) {
        self.alerter.alert(msg.into());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        collaborators::fakes::{FakeAlerter, FakeArchive, FakeLobby, FakeReputation, FakeStorage},
        config::layer,
    };

    pub struct Fakes {
        pub storage: Arc<FakeStorage>,
        pub archive: Arc<FakeArchive>,
        pub alerter: Arc<FakeAlerter>,
    }

    pub fn hoster_state(root: &std::path::Path, global: serde_json::Value) -> (HosterState, Fakes) {
        hoster_state_with(root, global, FakeStorage::default(), 0)
    }

    pub fn hoster_state_with(
        root: &std::path::Path,
        global: serde_json::Value,
        storage: FakeStorage,
        lobby_rooms: usize,
    ) -> (HosterState, Fakes) {
        let fakes = Fakes {
            storage: Arc::new(storage),
            archive: Arc::new(FakeArchive::default()),
            alerter: Arc::new(FakeAlerter::default()),
        };
        let state = HosterState {
            cfg: LayeredConfig::new(vec![layer(global)]),
            paths: Paths {
                runs_dir: root.join("instances"),
                archive_dir: root.join("archive"),
            },
            registry: InstanceRegistry::default(),
            abuse: Arc::new(AbuseStores::default()),
            storage: fakes.storage.clone(),
            archive: fakes.archive.clone(),
            ip_reputation: Arc::new(FakeReputation::default()),
            lobby: Arc::new(FakeLobby { rooms: lobby_rooms }),
            alerter: fakes.alerter.clone(),
        };
        (state, fakes)
    }
}
