use anyhow::Context;
use async_trait::async_trait;

use crate::collaborators::{LobbyFetcher, LobbySnapshot};

pub struct HttpLobby {
    client: reqwest::Client,
    url: String,
}

impl HttpLobby {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl LobbyFetcher for HttpLobby {
    async fn fetch(&self) -> anyhow::Result<LobbySnapshot> {
        self.client
            .get(&self.url)
            .send()
            .await
            .context("fetch lobby")?
            .error_for_status()?
            .json()
            .await
            .context("parse lobby JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tolerates_missing_rooms() {
        let s: LobbySnapshot = serde_json::from_str("{}").unwrap();
        assert!(s.rooms.is_empty());
        let s: LobbySnapshot = serde_json::from_str(r#"{"rooms": [{"name": "a"}, {}]}"#).unwrap();
        assert_eq!(s.rooms.len(), 2);
    }
}
