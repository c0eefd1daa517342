use crate::collaborators::Alerter;

/// Discord-style webhook limit.
const MAX_CONTENT: usize = 1900;

/// Logs every alert and, when a webhook is configured, posts it from a
/// detached task.
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookAlerter {
    pub fn new(client: reqwest::Client, url: Option<String>) -> Self {
        Self { client, url }
    }
}

fn truncate(msg: &str) -> String {
    if msg.len() <= MAX_CONTENT {
        return msg.to_string();
    }
    let mut end = MAX_CONTENT;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &msg[..end])
}

impl Alerter for WebhookAlerter {
    fn alert(&self, msg: String) {
        tracing::error!(alert = %msg, "operator alert");
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();
        let body = serde_json::json!({ "content": truncate(&msg) });
        tokio::spawn(async move {
            let res = client.post(&url).json(&body).send().await;
            match res.and_then(|r| r.error_for_status()) {
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "failed to deliver alert webhook"),
            }
        });
    }
}
