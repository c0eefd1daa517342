use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
};

use autohost_instance::{
    AtomicInstanceState, InstanceId, InstanceOrigin, InstanceState, InstanceStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{config::LayeredConfig, protocol::ControlLine, room_status::RoomStatus};

const COMMAND_BACKLOG: usize = 32;
const POKE_BACKLOG: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSettings {
    pub bin_path: PathBuf,
    pub game_port: u16,
    pub player_count: u32,
    /// Minutes.
    pub time_limit: u32,
    /// Telemetry frame interval in seconds.
    pub frame_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceCommand {
    None,
    /// Room-wide chat; the text is sanitized before it is written.
    Broadcast(String),
    Shutdown,
    /// Stop supervising without telling the child anything.
    RunnerStop,
    /// A raw control line, written as is.
    Control(ControlLine),
}

/// Receiving ends, owned by the runner's tasks.
pub struct InstanceInbox {
    pub commands: mpsc::Receiver<InstanceCommand>,
    pub poke_requests: mpsc::Receiver<usize>,
    pub poke_cancels: mpsc::Receiver<String>,
}

pub struct InstanceSpec {
    pub id: InstanceId,
    pub dir: PathBuf,
    pub settings: InstanceSettings,
    pub queue_name: Option<String>,
    pub origin: InstanceOrigin,
    pub admins: Vec<String>,
    pub cfg: LayeredConfig,
    pub recovered: bool,
}

/// One room. Shared read-only between the runner's tasks except for
/// `state`, which is atomic, and the small locked fields.
pub struct Instance {
    pub id: InstanceId,
    pub dir: PathBuf,
    pub settings: InstanceSettings,
    pub queue_name: Option<String>,
    pub origin: InstanceOrigin,
    /// Identity hashes allowed to use `/set`.
    pub admins: Vec<String>,
    pub cfg: LayeredConfig,
    pub recovered: bool,
    pub state: AtomicInstanceState,
    pub room: RoomStatus,
    pid: OnceLock<u32>,
    game_id: Mutex<Option<i64>>,
    pub commands: mpsc::Sender<InstanceCommand>,
    pub poke_requests: mpsc::Sender<usize>,
    pub poke_cancels: mpsc::Sender<String>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("queue_name", &self.queue_name)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(spec: InstanceSpec, state: InstanceState) -> (Arc<Self>, InstanceInbox) {
        let (commands, commands_rx) = mpsc::channel(COMMAND_BACKLOG);
        let (poke_requests, poke_requests_rx) = mpsc::channel(POKE_BACKLOG);
        let (poke_cancels, poke_cancels_rx) = mpsc::channel(POKE_BACKLOG);
        let inst = Arc::new(Self {
            id: spec.id,
            dir: spec.dir,
            settings: spec.settings,
            queue_name: spec.queue_name,
            origin: spec.origin,
            admins: spec.admins,
            cfg: spec.cfg,
            recovered: spec.recovered,
            state: AtomicInstanceState::new(state),
            room: RoomStatus::default(),
            pid: OnceLock::new(),
            game_id: Mutex::new(None),
            commands,
            poke_requests,
            poke_cancels,
        });
        let inbox = InstanceInbox {
            commands: commands_rx,
            poke_requests: poke_requests_rx,
            poke_cancels: poke_cancels_rx,
        };
        (inst, inbox)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// The pid is assigned once, at spawn or recovery.
    pub fn set_pid(&self, pid: u32) {
        if self.pid.set(pid).is_err() {
            tracing::warn!(instance = %self.id, pid, "pid already assigned");
        }
    }

    pub fn game_id(&self) -> Option<i64> {
        *self.game_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_game_id(&self, id: i64) {
        *self.game_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    /// Moves the state forward and logs real transitions. Returns true when
    /// the state changed.
    pub fn advance(&self, next: InstanceState) -> bool {
        let prev = self.state.advance(next);
        let changed = prev < next;
        if changed {
            tracing::info!(instance = %self.id, state = ?next, "state transition");
        }
        changed
    }

    pub fn is_admin(&self, hash: &str) -> bool {
        self.admins.iter().any(|a| a == hash)
    }

    /// Best-effort delivery; a full inbox is logged and dropped.
    pub fn try_command(&self, cmd: InstanceCommand) -> bool {
        match self.commands.try_send(cmd) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(instance = %self.id, %err, "failed to deliver command");
                false
            }
        }
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id,
            queue_name: self.queue_name.clone(),
            origin: self.origin,
            state: self.state.load(),
            pid: self.pid(),
            game_id: self.game_id(),
        }
    }
}

#[derive(Clone, Default)]
pub struct InstanceRegistry {
    inner: Arc<Mutex<BTreeMap<InstanceId, Arc<Instance>>>>,
}

impl InstanceRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<InstanceId, Arc<Instance>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `inst`; false when the id is already taken.
    pub fn insert(&self, inst: Arc<Instance>) -> bool {
        let mut g = self.lock();
        if g.contains_key(&inst.id) {
            return false;
        }
        g.insert(inst.id, inst);
        true
    }

    /// Reserves the first free id at or after `start`.
    pub fn next_free_id(&self, start: InstanceId) -> InstanceId {
        let g = self.lock();
        let mut id = start;
        while g.contains_key(&id) {
            id = InstanceId(id.0 + 1);
        }
        id
    }

    pub fn remove(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.lock().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Instance>> {
        self.lock().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.lock().values().map(|i| i.status()).collect()
    }

    /// True while the instance can still take joins.
    pub fn accepts_joins(&self, id: InstanceId) -> bool {
        self.lock()
            .get(&id)
            .is_some_and(|i| i.state.load() <= InstanceState::InLobby)
    }

    pub fn count_in_state(&self, state: InstanceState) -> usize {
        self.lock()
            .values()
            .filter(|i| i.state.load() == state)
            .count()
    }

    /// The queue's instance that has not started a game yet.
    pub fn queue_in_lobby(&self, queue: &str) -> Option<Arc<Instance>> {
        self.lock()
            .values()
            .find(|i| {
                i.queue_name.as_deref() == Some(queue) && i.state.load() <= InstanceState::InLobby
            })
            .cloned()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::layer;

    pub fn spec(id: i64) -> InstanceSpec {
        InstanceSpec {
            id: InstanceId(id),
            dir: std::env::temp_dir().join(format!("autohost-test-{id}")),
            settings: InstanceSettings {
                bin_path: "/bin/true".into(),
                game_port: 2100,
                player_count: 2,
                time_limit: 90,
                frame_interval: 5,
            },
            queue_name: Some("duel".into()),
            origin: InstanceOrigin::Queue,
            admins: vec!["adminhash".into()],
            cfg: LayeredConfig::new(vec![layer(serde_json::json!({}))]),
            recovered: false,
        }
    }
}
