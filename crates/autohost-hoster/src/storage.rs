use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use autohost_db::entities::{accounts, bans, eventlog, games, identities};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbBackend,
    EntityTrait, NotSet, QueryFilter, QueryOrder, Set, Statement, TransactionTrait, prelude::Expr,
};
use serde_json::Value;

use crate::{
    collaborators::{ArchiveSink, BanRecord, IdentityRecord, LinkOutcome, LinkRequest, Storage},
    room_status::identity_hash,
};

/// In-game milliseconds below which a finished game counts as abandoned.
const SHORT_GAME_MS: i64 = 60_000;

#[derive(Clone)]
pub struct DbStorage {
    db: Arc<DatabaseConnection>,
}

impl DbStorage {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn identity_by_pkey(
        &self,
        pubkey: &[u8],
    ) -> anyhow::Result<Option<(identities::Model, Option<accounts::Model>)>> {
        identities::Entity::find()
            .filter(identities::Column::Pkey.eq(pubkey.to_vec()))
            .find_also_related(accounts::Entity)
            .one(&*self.db)
            .await
            .context("query identity by pkey")
    }
}

#[async_trait]
impl Storage for DbStorage {
    async fn lookup_identity(&self, pubkey: &[u8]) -> anyhow::Result<Option<IdentityRecord>> {
        let db = &*self.db;
        let Some(identity) = identities::Entity::find()
            .filter(identities::Column::Hash.eq(identity_hash(pubkey)))
            .one(db)
            .await
            .context("query identity by hash")?
        else {
            return Ok(None);
        };

        let mut cond = Condition::any().add(bans::Column::Identity.eq(identity.id));
        if let Some(account) = identity.account {
            cond = cond.add(bans::Column::Account.eq(account));
        }
        // Postgres sorts NULL first on DESC, so permanent bans win.
        let ban = bans::Entity::find()
            .filter(cond)
            .order_by_desc(bans::Column::TimeExpires)
            .one(db)
            .await
            .context("query bans")?;

        Ok(Some(IdentityRecord {
            account: identity.account,
            ban: ban.map(|b| BanRecord {
                id: b.id,
                issued: b.time_issued.into(),
                expires: b.time_expires.map(Into::into),
                reason: b.reason,
                forbids_joining: b.forbids_joining,
                forbids_playing: b.forbids_playing,
                forbids_chatting: b.forbids_chatting,
            }),
        }))
    }

    async fn has_account(&self, pubkey: &[u8]) -> anyhow::Result<bool> {
        Ok(matches!(self.identity_by_pkey(pubkey).await?, Some((_, Some(_)))))
    }

    async fn count_recent_short_games(
        &self,
        pubkey: &[u8],
        account: Option<i64>,
        window: Duration,
    ) -> anyhow::Result<u64> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"select count(g.id) as n
from games as g
join players as p on p.game = g.id
join identities as i on p.identity = i.id
left join accounts as a on i.account = a.id
where g.game_time < $1
  and g.time_started + $2::interval > now()
  and (i.pkey = $3 or a.id = $4)"#,
            [
                SHORT_GAME_MS.into(),
                format!("{} seconds", window.as_secs()).into(),
                pubkey.to_vec().into(),
                account.unwrap_or(-1).into(),
            ],
        );
        let row = self
            .db
            .query_one(stmt)
            .await
            .context("count recent short games")?;
        let n: i64 = match row {
            Some(r) => r.try_get("", "n").context("read short game count")?,
            None => 0,
        };
        Ok(n.max(0) as u64)
    }

    async fn is_account_terminated(&self, pubkey: &[u8]) -> anyhow::Result<bool> {
        Ok(matches!(
            self.identity_by_pkey(pubkey).await?,
            Some((_, Some(accounts::Model { terminated: true, .. })))
        ))
    }

    async fn log_event(&self, msg: &str) -> anyhow::Result<()> {
        let model = eventlog::ActiveModel {
            id: NotSet,
            whensent: Set(chrono::Utc::now().into()),
            msg: Set(msg.to_string()),
        };
        model.insert(&*self.db).await.context("insert eventlog")?;
        Ok(())
    }

    async fn link_identity(&self, req: &LinkRequest) -> anyhow::Result<LinkOutcome> {
        let db = &*self.db;
        let Some(account) = accounts::Entity::find()
            .filter(accounts::Column::WzConfirmCode.eq(req.confirm_code.clone()))
            .one(db)
            .await
            .context("query account by confirm code")?
        else {
            return Ok(LinkOutcome::InvalidCode);
        };
        if account.email_confirmed.is_none() {
            return Ok(LinkOutcome::EmailNotConfirmed);
        }

        // Dropping the transaction without commit rolls it back.
        let txn = db.begin().await.context("begin link transaction")?;
        let claimed = txn
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"insert into identities (name, pkey, hash, account, claimed_at)
values ($1, $2, $3, $4, now())
on conflict (hash) do update set account = $4, claimed_at = now()
where identities.account is null and identities.pkey = $2"#,
                [
                    req.name.clone().into(),
                    req.pubkey.clone().into(),
                    identity_hash(&req.pubkey).into(),
                    account.id.into(),
                ],
            ))
            .await
            .context("upsert identity")?
            .rows_affected();
        match claimed {
            0 => return Ok(LinkOutcome::AlreadyClaimed),
            1 => {}
            n => anyhow::bail!("identity upsert touched {n} rows"),
        }

        let updated = accounts::Entity::update_many()
            .col_expr(accounts::Column::WzConfirmCode, Expr::value(Option::<String>::None))
            .col_expr(accounts::Column::DisplayName, Expr::value(req.name.clone()))
            .filter(accounts::Column::Id.eq(account.id))
            .exec(&txn)
            .await
            .context("clear confirm code")?
            .rows_affected;
        if updated != 1 {
            anyhow::bail!("confirm code clear touched {updated} rows");
        }
        txn.commit().await.context("commit link transaction")?;
        tracing::info!(account = account.id, name = %req.name, "identity linked");
        Ok(LinkOutcome::Linked)
    }

    async fn discover_pubkey(&self, pubkey: &[u8]) -> anyhow::Result<()> {
        let res = identities::Entity::update_many()
            .col_expr(identities::Column::Pkey, Expr::value(pubkey.to_vec()))
            .filter(identities::Column::Hash.eq(identity_hash(pubkey)))
            .filter(identities::Column::Pkey.is_null())
            .exec(&*self.db)
            .await
            .context("store discovered pkey")?;
        if res.rows_affected > 1 {
            tracing::warn!(rows = res.rows_affected, "pkey discovery touched several identities");
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveSink for DbStorage {
    async fn store_replay(&self, game_id: i64, replay: Vec<u8>) -> anyhow::Result<()> {
        let res = games::Entity::update_many()
            .col_expr(games::Column::Replay, Expr::value(replay))
            .filter(games::Column::Id.eq(game_id))
            .exec(&*self.db)
            .await
            .context("store replay")?;
        if res.rows_affected != 1 {
            anyhow::bail!("game {game_id} not found while storing replay");
        }
        Ok(())
    }

    async fn store_graphs(&self, game_id: i64, frames: Vec<Value>) -> anyhow::Result<()> {
        let res = games::Entity::update_many()
            .col_expr(games::Column::Graphs, Expr::value(Value::Array(frames)))
            .filter(games::Column::Id.eq(game_id))
            .exec(&*self.db)
            .await
            .context("store graphs")?;
        if res.rows_affected != 1 {
            anyhow::bail!("game {game_id} not found while storing graphs");
        }
        Ok(())
    }
}
