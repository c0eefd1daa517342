use std::{sync::Arc, time::Duration};

use anyhow::Context;
use autohost_instance::{InstanceId, InstanceOrigin, InstanceState};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    instance::{Instance, InstanceCommand, InstanceInbox, InstanceSpec},
    port_alloc::{allocate_game_port, port_range},
    queue::{QueueTemplate, find_queue, list_queues, queue_layer},
    runner,
    state::HosterState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    SpawnDisabled,
    LobbyFull(usize),
    RunningFull(usize),
    Processed {
        spawned: Vec<InstanceId>,
        rerolled: Vec<InstanceId>,
    },
}

/// Keeps every configured queue represented by one room in the lobby.
#[derive(Clone)]
pub struct Scheduler {
    hs: HosterState,
}

impl Scheduler {
    pub fn new(hs: HosterState) -> Self {
        Self { hs }
    }

    /// Ticks until `stop` flips to true.
    pub fn spawn(self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                let secs = self.hs.cfg.i64_or(&["lobby_poll_interval_sec"], 5).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs as u64)) => {}
                    res = stop.changed() => {
                        if res.is_err() || *stop.borrow() {
                            tracing::info!("scheduler stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    pub async fn tick(&self) -> TickOutcome {
        let cfg = &self.hs.cfg;
        let rooms = match self.hs.lobby.fetch().await {
            Ok(s) => s.rooms.len(),
            Err(err) => {
                tracing::warn!(err = %format!("{err:#}"), "lobby lookup failed");
                0
            }
        };
        tracing::debug!(rooms, "lobby polled");

        if !cfg.bool_or(&["allow_spawn"], false) {
            tracing::debug!("room spawning disabled");
            return TickOutcome::SpawnDisabled;
        }
        let max_lobby = cfg.i64_or(&["spawn_cutout_lobby_rooms"], 8).max(0) as usize;
        if rooms >= max_lobby {
            tracing::info!(rooms, max_lobby, "queue processing paused, lobby is full");
            return TickOutcome::LobbyFull(rooms);
        }
        let max_running = cfg.i64_or(&["spawn_cutout_running_rooms"], 18).max(0) as usize;
        let running = self.hs.registry.count_in_state(InstanceState::InGame);
        if running >= max_running {
            tracing::info!(running, max_running, "queue processing paused, too many running rooms");
            return TickOutcome::RunningFull(running);
        }

        let mut spawned = Vec::new();
        let mut rerolled = Vec::new();
        for name in list_queues(cfg) {
            let template = match find_queue(cfg, &name) {
                Ok(t) => t,
                Err(err) => {
                    tracing::warn!(queue = %name, err = %format!("{err:#}"), "queue misconfigured");
                    self.hs.alert(format!("queue {name:?} is misconfigured: {err:#}"));
                    continue;
                }
            };
            if let Some(inst) = self.hs.registry.queue_in_lobby(&name) {
                if self.maybe_reroll(&template, &inst) {
                    rerolled.push(inst.id);
                }
                continue;
            }
            tracing::info!(queue = %name, "queue is missing from lobby, spawning");
            match self.launch(&template).await {
                Ok(id) => spawned.push(id),
                Err(err) => {
                    tracing::error!(queue = %name, err = %format!("{err:#}"), "failed to generate instance");
                    self.hs.alert(format!("queue {name:?} failed to generate instance: {err:#}"));
                }
            }
        }
        TickOutcome::Processed { spawned, rerolled }
    }

    fn maybe_reroll(&self, template: &QueueTemplate, inst: &Instance) -> bool {
        let Some(after) = template.idle_reroll else {
            return false;
        };
        let age = Duration::from_secs(inst.id.age_secs().max(0) as u64);
        if age < after {
            return false;
        }
        // Only an idle lobby is replaced; a room already going down is left alone.
        if inst.state.load() != InstanceState::InLobby {
            tracing::debug!(instance = %inst.id, "reroll blocked");
            return false;
        }
        tracing::info!(instance = %inst.id, queue = %template.name, "reroll ordered");
        inst.try_command(InstanceCommand::Shutdown)
    }

    /// Creates the directory, preset and registry entry for a new room.
    pub async fn generate_instance(
        &self,
        template: &QueueTemplate,
    ) -> anyhow::Result<(Arc<Instance>, InstanceInbox)> {
        let id = self.hs.registry.next_free_id(InstanceId::from_unix_now());
        let dir = self.hs.paths.instance_dir(id);
        let taken: Vec<u16> = self
            .hs
            .registry
            .all()
            .iter()
            .map(|i| i.settings.game_port)
            .collect();
        let port = allocate_game_port(port_range(&self.hs.cfg), &taken)?;

        let cfg = self
            .hs
            .cfg
            .with_outer(queue_layer(&self.hs.cfg, &template.name))
            .with_outer(serde_json::json!({}));
        let spec = InstanceSpec {
            id,
            dir: dir.clone(),
            settings: template.settings(port),
            queue_name: Some(template.name.clone()),
            origin: InstanceOrigin::Queue,
            admins: template.admins.clone(),
            cfg,
            recovered: false,
        };
        let (inst, inbox) = Instance::new(spec, InstanceState::Spawning);
        if !self.hs.registry.insert(inst.clone()) {
            anyhow::bail!("instance id {id} already registered");
        }

        let preset_dir = dir.join("autohost");
        let write = async {
            tokio::fs::create_dir_all(&preset_dir)
                .await
                .with_context(|| format!("create {}", preset_dir.display()))?;
            let data = serde_json::to_vec_pretty(&template.preset).context("serialize preset")?;
            tokio::fs::write(preset_dir.join("preset.json"), data)
                .await
                .context("write preset.json")
        };
        if let Err(err) = write.await {
            self.release(&inst).await;
            return Err(err);
        }
        tracing::info!(instance = %id, queue = %template.name, port, "instance generated");
        Ok((inst, inbox))
    }

    async fn launch(&self, template: &QueueTemplate) -> anyhow::Result<InstanceId> {
        let (inst, inbox) = self.generate_instance(template).await?;
        let id = inst.id;
        if let Err(err) = runner::spawn(self.hs.clone(), inst.clone(), inbox).await {
            self.release(&inst).await;
            return Err(err.context(format!("spawn instance {id}")));
        }
        Ok(id)
    }

    /// Drops a partially created instance.
    async fn release(&self, inst: &Instance) {
        self.hs.registry.remove(inst.id);
        match tokio::fs::remove_dir_all(&inst.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(instance = %inst.id, %err, "failed to remove instance dir"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        collaborators::fakes::FakeStorage,
        instance::testing::spec,
        state::testing::{hoster_state, hoster_state_with},
    };

    fn global(bin: &str) -> serde_json::Value {
        json!({
            "allow_spawn": true,
            "bin_path": bin,
            "game_port_range": [0, 0],
            "queues": {"duel": {"player_count": 2}},
        })
    }

    #[tokio::test]
    async fn disabled_spawning_does_nothing() {
        let root = tempfile::tempdir().unwrap();
        let (hs, _fakes) = hoster_state(root.path(), json!({"queues": {"duel": {}}}));
        assert_eq!(Scheduler::new(hs.clone()).tick().await, TickOutcome::SpawnDisabled);
        assert!(hs.registry.is_empty());
    }

    #[tokio::test]
    async fn backpressure_from_lobby_and_running_rooms() {
        let root = tempfile::tempdir().unwrap();
        let (hs, _fakes) = hoster_state_with(
            root.path(),
            json!({"allow_spawn": true, "spawn_cutout_lobby_rooms": 3}),
            FakeStorage::default(),
            3,
        );
        assert_eq!(Scheduler::new(hs).tick().await, TickOutcome::LobbyFull(3));

        let (hs, _fakes) = hoster_state(
            root.path(),
            json!({"allow_spawn": true, "spawn_cutout_running_rooms": 1}),
        );
        let (inst, _inbox) = Instance::new(spec(5), InstanceState::InGame);
        hs.registry.insert(inst);
        assert_eq!(Scheduler::new(hs).tick().await, TickOutcome::RunningFull(1));
    }

    #[tokio::test]
    async fn failed_generation_is_released_and_alerted() {
        let root = tempfile::tempdir().unwrap();
        let (hs, fakes) = hoster_state(root.path(), global("/bin/true"));
        let outcome = Scheduler::new(hs.clone()).tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                spawned: vec![],
                rerolled: vec![]
            }
        );
        assert!(hs.registry.is_empty());
        let alerts = fakes.alerter.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("duel"));
    }

    #[tokio::test]
    async fn generated_instance_gets_preset_and_layers() {
        let root = tempfile::tempdir().unwrap();
        let mut g = global("/bin/true");
        g["game_port_range"] = json!([20100, 20200]);
        g["queues"]["duel"]["preset"] = json!({"scavengers": false});
        g["queues"]["duel"]["allow_non_linked_play"] = json!(false);
        let (hs, _fakes) = hoster_state(root.path(), g);
        let sched = Scheduler::new(hs.clone());
        let template = find_queue(&hs.cfg, "duel").unwrap();

        let (inst, _inbox) = sched.generate_instance(&template).await.unwrap();
        assert_eq!(hs.registry.get(inst.id).map(|i| i.id), Some(inst.id));
        assert_eq!(inst.origin, InstanceOrigin::Queue);
        assert!((20100..=20200).contains(&inst.settings.game_port));
        assert_eq!(inst.cfg.get_bool(&["allow_non_linked_play"]), Some(false));
        assert_eq!(inst.cfg.top_snapshot(), json!({}));
        let preset = std::fs::read(inst.dir.join("autohost").join("preset.json")).unwrap();
        let preset: serde_json::Value = serde_json::from_slice(&preset).unwrap();
        assert_eq!(preset, json!({"scavengers": false}));

        let (second, _inbox) = sched.generate_instance(&template).await.unwrap();
        assert_ne!(second.id, inst.id);
        assert_ne!(second.settings.game_port, inst.settings.game_port);
    }

    #[tokio::test]
    async fn idle_lobby_room_is_rerolled() {
        let root = tempfile::tempdir().unwrap();
        let mut g = global("/bin/true");
        g["queues"]["duel"]["idle_reroll_minutes"] = json!(1);
        let (hs, _fakes) = hoster_state(root.path(), g);

        let mut s = spec(InstanceId::from_unix_now().0 - 120);
        s.queue_name = Some("duel".into());
        let (inst, mut inbox) = Instance::new(s, InstanceState::InLobby);
        hs.registry.insert(inst.clone());

        let outcome = Scheduler::new(hs.clone()).tick().await;
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                spawned: vec![],
                rerolled: vec![inst.id]
            }
        );
        assert_eq!(
            inbox.commands.try_recv().ok(),
            Some(InstanceCommand::Shutdown)
        );

        // Once the room is going down the queue counts as missing.
        inst.advance(InstanceState::Exiting);
        assert!(hs.registry.queue_in_lobby("duel").is_none());
    }
}
