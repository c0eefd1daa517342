use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use autohost_instance::InstanceState;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod abuse;
mod admission;
mod alert;
mod archive;
mod audit;
mod chat;
mod collaborators;
mod config;
mod identlink;
mod instance;
mod ispcheck;
mod lobby;
mod poke;
mod port_alloc;
mod protocol;
mod queue;
mod recovery;
mod room_status;
mod runner;
mod scheduler;
mod state;
mod storage;
mod support;

use crate::{
    abuse::AbuseStores,
    collaborators::IpReputation,
    config::{LayeredConfig, layer},
    instance::{InstanceCommand, InstanceRegistry},
    state::{HosterState, Paths},
};

fn init_tracing(cfg: &LayeredConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let logs_dir = PathBuf::from(cfg.get_str(&["logs_dir"]).unwrap_or_else(|| "run/logs".into()));
    let appender = tracing_appender::rolling::daily(&logs_dir, "autohost.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("AUTOHOST_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = LayeredConfig::new(vec![layer(config::load_file(config_path.as_ref())?)]);
    let _log_guard = init_tracing(&cfg);
    tracing::info!(config = %config_path, version = env!("CARGO_PKG_VERSION"), "autohost starting");

    let database_url = std::env::var("AUTOHOST_DATABASE_URL")
        .ok()
        .or_else(|| cfg.get_str(&["database_url"]))
        .ok_or_else(|| anyhow::anyhow!("database_url is required"))?;
    let pool_size = cfg.i64_or(&["database_max_connections"], 8).clamp(1, 64) as u32;
    let db = autohost_db::connect(&database_url, pool_size)
        .await
        .context("connect database")?;
    let storage = Arc::new(storage::DbStorage::new(Arc::new(db)));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("build http client")?;
    let ip_reputation: Arc<dyn IpReputation> = match cfg.get_str(&["ispcheck", "url"]) {
        Some(url) => {
            let ttl = cfg.i64_or(&["ispcheck", "cache_ttl_sec"], 3600).max(0) as u64;
            Arc::new(ispcheck::HttpIpReputation::new(
                client.clone(),
                url,
                Duration::from_secs(ttl),
            ))
        }
        None => {
            tracing::warn!("ispcheck.url not set, IP reputation checks disabled");
            Arc::new(ispcheck::NoIpReputation)
        }
    };
    let lobby_url = cfg
        .get_str(&["lobby", "url"])
        .ok_or_else(|| anyhow::anyhow!("lobby.url is required"))?;

    let hs = HosterState {
        paths: Paths::from_config(&cfg),
        registry: InstanceRegistry::default(),
        abuse: Arc::new(AbuseStores::default()),
        storage: storage.clone(),
        archive: storage,
        ip_reputation,
        lobby: Arc::new(lobby::HttpLobby::new(client.clone(), lobby_url)),
        alerter: Arc::new(alert::WebhookAlerter::new(
            client,
            cfg.get_str(&["alerts", "webhook_url"]),
        )),
        cfg,
    };
    std::fs::create_dir_all(&hs.paths.runs_dir)
        .with_context(|| format!("create {}", hs.paths.runs_dir.display()))?;

    let recovered = recovery::recover_instances(&hs).await?;
    tracing::info!(count = recovered.len(), "recovered running instances");

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = scheduler::Scheduler::new(hs.clone()).spawn(stop_rx);

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    let running = hs.registry.statuses();
    tracing::info!(
        running = running.len(),
        "shutting down, running instances are left to recovery"
    );
    for st in running {
        tracing::info!(instance = %st.id, queue = ?st.queue_name, state = ?st.state, pid = ?st.pid, game_id = ?st.game_id, "left running");
    }
    let _ = stop_tx.send(true);
    if let Err(err) = scheduler.await {
        tracing::warn!(%err, "scheduler task failed");
    }

    for inst in hs.registry.all() {
        if inst.state.load() <= InstanceState::InLobby {
            inst.try_command(InstanceCommand::Broadcast(
                "Host maintenance in progress, this room stays open".into(),
            ));
        }
        inst.try_command(InstanceCommand::RunnerStop);
    }
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while !hs.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(left = hs.registry.all().len(), "runners did not stop in time");
    }
    Ok(())
}
