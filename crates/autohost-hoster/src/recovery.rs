use std::path::Path;

use anyhow::Context;
use autohost_instance::{InstanceId, InstanceOrigin, InstanceState};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{io::AsyncWriteExt, task::JoinHandle};

use crate::{
    instance::{Instance, InstanceSettings, InstanceSpec},
    queue::queue_layer,
    runner,
    state::HosterState,
    support::is_pid_alive,
};

const SNAPSHOT_FILE: &str = "instance.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub settings: InstanceSettings,
    pub queue_name: Option<String>,
    pub origin: InstanceOrigin,
    #[serde(default)]
    pub admins: Vec<String>,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub game_id: Option<i64>,
    /// Outermost config layer, which holds `/set` changes.
    #[serde(default)]
    pub room_layer: Value,
}

impl InstanceSnapshot {
    pub fn of(inst: &Instance) -> Self {
        Self {
            id: inst.id,
            settings: inst.settings.clone(),
            queue_name: inst.queue_name.clone(),
            origin: inst.origin,
            admins: inst.admins.clone(),
            state: inst.state.load(),
            pid: inst.pid(),
            game_id: inst.game_id(),
            room_layer: inst.cfg.top_snapshot(),
        }
    }
}

/// Writes `instance.json` through a synced temp file and a rename, so a
/// crash leaves either the old snapshot or the new one.
pub async fn save_snapshot(inst: &Instance) -> anyhow::Result<()> {
    let snap = InstanceSnapshot::of(inst);
    let path = inst.dir.join(SNAPSHOT_FILE);
    let tmp = inst.dir.join("instance.json.tmp");
    let data = serde_json::to_vec_pretty(&snap).context("serialize instance.json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create instance.json.tmp")?;
    f.write_all(&data).await.context("write instance.json.tmp")?;
    f.flush().await.context("flush instance.json.tmp")?;
    f.sync_all().await.context("sync instance.json.tmp")?;
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist instance.json")?;
    Ok(())
}

pub fn load_snapshot(dir: &Path) -> anyhow::Result<InstanceSnapshot> {
    let path = dir.join(SNAPSHOT_FILE);
    let raw = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}

fn read_pid(dir: &Path) -> Option<u32> {
    std::fs::read_to_string(dir.join("pid"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Guards against pid reuse: the live command line must match the one
/// recorded at spawn when both are readable.
fn same_process(dir: &Path, pid: u32) -> bool {
    let Ok(stored) = std::fs::read(dir.join("cmdline")) else {
        return true;
    };
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(live) => live == stored,
        Err(_) => true,
    }
}

fn rebuild(hs: &HosterState, dir: &Path, snap: InstanceSnapshot) -> (std::sync::Arc<Instance>, crate::instance::InstanceInbox) {
    let mut cfg = hs.cfg.clone();
    if let Some(queue) = &snap.queue_name {
        cfg = cfg.with_outer(queue_layer(&hs.cfg, queue));
    }
    let room = if snap.room_layer.is_object() {
        snap.room_layer
    } else {
        json!({})
    };
    let spec = InstanceSpec {
        id: snap.id,
        dir: dir.to_path_buf(),
        settings: snap.settings,
        queue_name: snap.queue_name,
        origin: snap.origin,
        admins: snap.admins,
        cfg: cfg.with_outer(room),
        recovered: true,
    };
    let (inst, inbox) = Instance::new(spec, snap.state);
    if let Some(game_id) = snap.game_id {
        inst.set_game_id(game_id);
    }
    (inst, inbox)
}

/// Re-attaches to children that survived a daemon restart and archives
/// the directories of those that did not.
pub async fn recover_instances(hs: &HosterState) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let rd = match std::fs::read_dir(&hs.paths.runs_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("read {}", hs.paths.runs_dir.display()));
        }
    };
    let mut handles = Vec::new();
    for entry in rd.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let snap = match load_snapshot(&dir) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), err = %format!("{err:#}"), "leftover without usable snapshot");
                let id = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.parse::<i64>().ok());
                if let Some(id) = id {
                    if let Err(err) = crate::archive::archive_instance(dir.clone(), hs.paths.archive_dir.clone(), InstanceId(id)).await {
                        hs.alert(format!("archiving leftover {} failed: {err:#}", dir.display()));
                    }
                }
                continue;
            }
        };
        let id = snap.id;
        let pid = read_pid(&dir).or(snap.pid);
        let alive = snap.state < InstanceState::Exited
            && pid.is_some_and(|p| is_pid_alive(p) && same_process(&dir, p));
        let (inst, inbox) = rebuild(hs, &dir, snap);

        if !alive {
            tracing::info!(instance = %id, "archiving dead leftover");
            runner::finish(hs, &inst, Vec::new()).await;
            continue;
        }
        let Some(pid) = pid else { continue };
        inst.set_pid(pid);
        if !hs.registry.insert(inst.clone()) {
            tracing::warn!(instance = %id, "recovered instance id already registered, skipping");
            continue;
        }
        match runner::reopen_pipes(&dir) {
            Ok(pipes) => {
                tracing::info!(instance = %id, pid, state = ?inst.state.load(), "re-attached to running instance");
                handles.push(runner::start(hs.clone(), inst, inbox, pipes));
            }
            Err(err) => {
                hs.registry.remove(id);
                hs.alert(format!("instance {id} (pid {pid}) could not be re-attached: {err:#}"));
            }
        }
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        instance::testing::spec,
        state::testing::hoster_state,
    };

    async fn prepare_dir(hs: &HosterState, id: i64, state: InstanceState, pid: Option<u32>) -> std::path::PathBuf {
        let mut s = spec(id);
        s.dir = hs.paths.instance_dir(s.id);
        s.cfg = hs.cfg.with_outer(json!({"allow_non_linked_chat": false}));
        std::fs::create_dir_all(&s.dir).unwrap();
        let dir = s.dir.clone();
        let (inst, _inbox) = Instance::new(s, state);
        if let Some(pid) = pid {
            inst.set_pid(pid);
            std::fs::write(dir.join("pid"), pid.to_string()).unwrap();
        }
        inst.set_game_id(9);
        save_snapshot(&inst).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn snapshot_round_trips_room_layer() {
        let root = tempfile::tempdir().unwrap();
        let (hs, _fakes) = hoster_state(root.path(), json!({}));
        let dir = prepare_dir(&hs, 1_700_000_100, InstanceState::InGame, None).await;
        let snap = load_snapshot(&dir).unwrap();
        assert_eq!(snap.state, InstanceState::InGame);
        assert_eq!(snap.game_id, Some(9));
        assert_eq!(snap.room_layer, json!({"allow_non_linked_chat": false}));
        assert!(!dir.join("instance.json.tmp").exists());
        let (inst, _inbox) = rebuild(&hs, &dir, snap);
        assert!(inst.recovered);
        assert_eq!(inst.cfg.get_bool(&["allow_non_linked_chat"]), Some(false));
    }

    #[tokio::test]
    async fn snapshot_into_missing_dir_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut s = spec(1_700_000_150);
        s.dir = root.path().join("gone");
        let (inst, _inbox) = Instance::new(s, InstanceState::InLobby);
        let err = save_snapshot(&inst).await.unwrap_err();
        assert!(format!("{err:#}").contains("instance.json.tmp"));
        assert!(!inst.dir.join("instance.json").exists());
    }

    #[tokio::test]
    async fn dead_leftovers_are_archived() {
        let root = tempfile::tempdir().unwrap();
        let (hs, _fakes) = hoster_state(root.path(), json!({}));
        let dir = prepare_dir(&hs, 1_700_000_200, InstanceState::InLobby, Some(u32::MAX - 1)).await;
        let handles = recover_instances(&hs).await.unwrap();
        assert!(handles.is_empty());
        assert!(!dir.exists());
        assert!(crate::archive::archive_path(&hs.paths.archive_dir, InstanceId(1_700_000_200)).exists());
    }

    #[tokio::test]
    async fn live_process_is_reattached_and_archived_when_it_dies() {
        let root = tempfile::tempdir().unwrap();
        let (hs, _fakes) = hoster_state(root.path(), json!({}));
        let mut child = std::process::Command::new("sleep").arg("1").spawn().unwrap();
        let pid = child.id();
        let id = InstanceId(1_700_000_300);
        let dir = prepare_dir(&hs, id.0, InstanceState::InGame, Some(pid)).await;
        let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap();
        std::fs::write(dir.join("cmdline"), cmdline).unwrap();
        for name in ["stdin", "stdout", "stderr"] {
            runner::make_fifo(&dir.join(name)).unwrap();
        }

        let handles = recover_instances(&hs).await.unwrap();
        assert_eq!(handles.len(), 1);
        let inst = hs.registry.get(id).unwrap();
        assert!(inst.recovered);
        assert_eq!(inst.pid(), Some(pid));

        for h in handles {
            tokio::time::timeout(Duration::from_secs(20), h).await.unwrap().unwrap();
        }
        child.wait().unwrap();
        assert_eq!(inst.state.load(), InstanceState::Exited);
        assert!(hs.registry.is_empty());
        assert!(crate::archive::archive_path(&hs.paths.archive_dir, id).exists());
    }
}
