use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use autohost_instance::InstanceState;
use tokio::sync::mpsc;

use crate::{
    config::LayeredConfig,
    instance::{Instance, InstanceCommand},
    protocol::ControlLine,
    room_status::{MAX_SLOTS, RoomSnapshot},
    runner::ExitSignal,
};

const BROADCAST_AT: &[i64] = &[15, 10, 5, 3, 2, 1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PokeState {
    Idle,
    Armed {
        slot: usize,
        countdown: i64,
        target_ip: String,
    },
}

/// AFK kick for one room: a slot is warned once a second and then kicked
/// unless its player speaks, leaves or gets replaced.
#[derive(Debug)]
pub struct PokeController {
    state: PokeState,
    last_poke: Instant,
}

fn bcast(text: String) -> ControlLine {
    ControlLine::broadcast(text)
}

impl PokeController {
    /// The cooldown runs from `started`, so a fresh room can not be poked
    /// right away.
    pub fn new(started: Instant) -> Self {
        Self {
            state: PokeState::Idle,
            last_poke: started,
        }
    }

    pub fn state(&self) -> &PokeState {
        &self.state
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, PokeState::Armed { .. })
    }

    pub fn on_request(
        &mut self,
        now: Instant,
        slot: usize,
        room: &RoomSnapshot,
        cfg: &LayeredConfig,
    ) -> Vec<ControlLine> {
        if let PokeState::Armed { slot: current, .. } = self.state {
            return vec![bcast(format!("⚠ Poke for slot {current} is ongoing!"))];
        }
        let cooldown = cfg.i64_or(&["poke_cooldown_seconds"], 0);
        if cooldown <= 0 {
            return vec![bcast("⚠ Poke is disabled in this room!".into())];
        }
        let cooldown = Duration::from_secs(cooldown as u64);
        let since = now.saturating_duration_since(self.last_poke);
        if since < cooldown {
            return vec![bcast(format!(
                "⚠ Poke is on cooldown! (available in {})",
                crate::support::human_duration(cooldown - since)
            ))];
        }
        let countdown = cfg.i64_or(&["poke_countdown_seconds"], 15);
        if countdown < 2 {
            return vec![bcast("⚠ Poke is disabled in this room! (via countdown)".into())];
        }
        let target_ip = room.slot_property(slot, "ip");
        if target_ip.is_empty() {
            return vec![bcast("⚠ Poke failed to locate player.".into())];
        }
        tracing::info!(slot, ip = %target_ip, countdown, "poke armed");
        self.state = PokeState::Armed {
            slot,
            countdown,
            target_ip,
        };
        self.last_poke = now;
        Vec::new()
    }

    pub fn on_cancel(&mut self, ip: &str) -> Vec<ControlLine> {
        match &self.state {
            PokeState::Armed {
                slot, target_ip, ..
            } if target_ip == ip => {
                let slot = *slot;
                self.state = PokeState::Idle;
                vec![bcast(format!("⚠ Poke has been cancelled for slot {slot}."))]
            }
            _ => Vec::new(),
        }
    }

    /// One second elapsed. Returns the lines to write; the controller is
    /// idle afterwards when the target was lost or kicked.
    pub fn on_tick(&mut self, room: &RoomSnapshot) -> Vec<ControlLine> {
        let PokeState::Armed {
            slot,
            countdown,
            target_ip,
        } = &mut self.state
        else {
            return Vec::new();
        };
        let slot = *slot;
        if slot >= MAX_SLOTS {
            tracing::warn!(slot, "poke armed for a slot out of range");
            self.state = PokeState::Idle;
            return Vec::new();
        }
        let pk = room.slot_property(slot, "pk");
        if pk.is_empty() {
            self.state = PokeState::Idle;
            return vec![bcast("⚠ Poke lost target.".into())];
        }
        if *countdown <= 0 {
            let ip = target_ip.clone();
            self.state = PokeState::Idle;
            if room.slot_property(slot, "ip") != ip {
                return vec![bcast("⚠ Poke lost target.".into())];
            }
            tracing::info!(slot, %ip, "poke kicked slot");
            return vec![
                ControlLine::BanIp {
                    ip: ip.clone(),
                    reason: "You got kicked for afk. You can rejoin immediately. If you feel like it is being abused, contact administrators.".into(),
                },
                ControlLine::UnbanIp(ip),
            ];
        }
        let mut out = Vec::with_capacity(2);
        if BROADCAST_AT.contains(countdown) {
            out.push(bcast(format!(
                "⚠ Poke will kick slot {slot} for being afk in {countdown}."
            )));
        }
        out.push(ControlLine::direct(
            &pk,
            format!("⚠ Poke will kick YOU for being afk in {countdown} seconds!"),
        ));
        *countdown -= 1;
        out
    }
}

/// Drives a controller for one instance until the exit signal fires or
/// the room leaves the lobby.
pub async fn run(
    inst: Arc<Instance>,
    mut requests: mpsc::Receiver<usize>,
    mut cancels: mpsc::Receiver<String>,
    mut exit: ExitSignal,
) {
    let mut ctl = PokeController::new(Instant::now());
    let timer = tokio::time::sleep(Duration::from_secs(1));
    tokio::pin!(timer);

    loop {
        if inst.state.load() > InstanceState::InLobby {
            tracing::debug!("poke controller stops, room left the lobby");
            return;
        }
        let lines = tokio::select! {
            _ = exit.wait() => {
                tracing::debug!("poke controller stops on exit signal");
                return;
            }
            Some(slot) = requests.recv() => {
                let lines = ctl.on_request(Instant::now(), slot, &inst.room.snapshot(), &inst.cfg);
                if ctl.is_armed() {
                    timer.as_mut().reset(tokio::time::Instant::now() + Duration::from_secs(1));
                }
                lines
            }
            Some(ip) = cancels.recv() => ctl.on_cancel(&ip),
            _ = &mut timer, if ctl.is_armed() => {
                let lines = ctl.on_tick(&inst.room.snapshot());
                timer.as_mut().reset(tokio::time::Instant::now() + Duration::from_secs(1));
                lines
            }
        };
        for line in lines {
            inst.try_command(InstanceCommand::Control(line));
        }
    }
}
