use std::sync::atomic::{AtomicU8, Ordering};

/// Instance identity: the unix second the instance was created at.
///
/// Doubles as the archival key, so it must stay unique across the registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct InstanceId(pub i64);

impl InstanceId {
    pub fn from_unix_now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(secs as i64)
    }

    /// Seconds since the instance was created.
    pub fn age_secs(&self) -> i64 {
        Self::from_unix_now().0.saturating_sub(self.0)
    }

    /// Week bucket used for archive layout.
    pub fn archive_week(&self) -> i64 {
        self.0 / (7 * 24 * 60 * 60)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an instance. Ordered; never goes backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum InstanceState {
    Spawning = 0,
    InLobby = 1,
    InGame = 2,
    Exiting = 3,
    Exited = 4,
}

impl InstanceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Spawning,
            1 => Self::InLobby,
            2 => Self::InGame,
            3 => Self::Exiting,
            _ => Self::Exited,
        }
    }
}

/// The one instance field read across tasks without a lock.
#[derive(Debug)]
pub struct AtomicInstanceState(AtomicU8);

impl AtomicInstanceState {
    pub fn new(state: InstanceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> InstanceState {
        InstanceState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves the state forward to `next`. Returns the previous state.
    ///
    /// A `next` lower than the current state is ignored, which keeps
    /// transitions monotonic even when two tasks race.
    pub fn advance(&self, next: InstanceState) -> InstanceState {
        InstanceState::from_u8(self.0.fetch_max(next as u8, Ordering::AcqRel))
    }
}

impl Default for AtomicInstanceState {
    fn default() -> Self {
        Self::new(InstanceState::Spawning)
    }
}

/// Why an instance exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceOrigin {
    Queue,
    Requested,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub queue_name: Option<String>,
    pub origin: InstanceOrigin,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub game_id: Option<i64>,
}

/// Outcome severity of a join check. Rules only ever raise it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum JoinCheckActionLevel {
    Approve,
    ApproveSpectator,
    Reject,
    Ban,
}

impl JoinCheckActionLevel {
    /// Raises `self` to `to`; lower targets are a no-op.
    pub fn escalate(&mut self, to: JoinCheckActionLevel) {
        if to > *self {
            *self = to;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reject | Self::Ban)
    }
}
