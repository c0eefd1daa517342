use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub id: i32,
    pub issued: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub reason: String,
    pub forbids_joining: bool,
    pub forbids_playing: bool,
    pub forbids_chatting: bool,
}

impl BanRecord {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_none_or(|e| e >= now)
    }
}

/// A known identity, its linked account and its most relevant ban.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRecord {
    pub account: Option<i64>,
    pub ban: Option<BanRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub confirm_code: String,
    pub name: String,
    pub pubkey: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    InvalidCode,
    EmailNotConfirmed,
    AlreadyClaimed,
    Linked,
}

/// Identity, ban and link records. Production uses `storage::DbStorage`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// `None` when no identity carries this key's hash.
    async fn lookup_identity(&self, pubkey: &[u8]) -> anyhow::Result<Option<IdentityRecord>>;

    async fn has_account(&self, pubkey: &[u8]) -> anyhow::Result<bool>;

    /// Games shorter than a minute this key or account took part in,
    /// started within `window`.
    async fn count_recent_short_games(
        &self,
        pubkey: &[u8],
        account: Option<i64>,
        window: Duration,
    ) -> anyhow::Result<u64>;

    async fn is_account_terminated(&self, pubkey: &[u8]) -> anyhow::Result<bool>;

    async fn log_event(&self, msg: &str) -> anyhow::Result<()>;

    /// Runs in a single transaction; an error means nothing was written.
    async fn link_identity(&self, req: &LinkRequest) -> anyhow::Result<LinkOutcome>;

    /// Fills in the stored key of an identity only known by hash.
    async fn discover_pubkey(&self, pubkey: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn store_replay(&self, game_id: i64, replay: Vec<u8>) -> anyhow::Result<()>;
    async fn store_graphs(&self, game_id: i64, frames: Vec<Value>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct IpInfo {
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default)]
    pub asn: String,
}

#[async_trait]
pub trait IpReputation: Send + Sync {
    async fn lookup(&self, ip: &str) -> anyhow::Result<IpInfo>;
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct LobbySnapshot {
    #[serde(default)]
    pub rooms: Vec<Value>,
}

#[async_trait]
pub trait LobbyFetcher: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<LobbySnapshot>;
}

/// Operator-facing notifications. Never blocks the caller.
pub trait Alerter: Send + Sync {
    fn alert(&self, msg: String);
}
