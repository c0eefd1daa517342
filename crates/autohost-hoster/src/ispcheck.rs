use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;

use crate::collaborators::{IpInfo, IpReputation};

/// Looks addresses up at `<base_url>/<ip>` and caches answers for `ttl`.
pub struct HttpIpReputation {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: tokio::sync::RwLock<HashMap<String, (Instant, IpInfo)>>,
}

impl HttpIpReputation {
    pub fn new(client: reqwest::Client, base_url: String, ttl: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
            cache: Default::default(),
        }
    }

    async fn cached(&self, ip: &str) -> Option<IpInfo> {
        let g = self.cache.read().await;
        match g.get(ip) {
            Some((ts, v)) if ts.elapsed() < self.ttl => Some(v.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl IpReputation for HttpIpReputation {
    async fn lookup(&self, ip: &str) -> anyhow::Result<IpInfo> {
        if let Some(v) = self.cached(ip).await {
            return Ok(v);
        }

        let url = format!("{}/{ip}", self.base_url);
        let info: IpInfo = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetch ip reputation for {ip}"))?
            .error_for_status()?
            .json()
            .await
            .context("parse ip reputation JSON")?;

        let mut w = self.cache.write().await;
        let ttl = self.ttl;
        w.retain(|_, (ts, _)| ts.elapsed() < ttl);
        w.insert(ip.to_string(), (Instant::now(), info.clone()));
        Ok(info)
    }
}

/// Used when no reputation service is configured.
pub struct NoIpReputation;

#[async_trait]
impl IpReputation for NoIpReputation {
    async fn lookup(&self, _ip: &str) -> anyhow::Result<IpInfo> {
        Ok(IpInfo::default())
    }
}
