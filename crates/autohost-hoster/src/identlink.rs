use std::time::Duration;

use crate::{
    collaborators::{Alerter, LinkOutcome, LinkRequest, Storage},
    protocol::ControlLine,
    support::format_error_chain,
};

const LINK_TIMEOUT: Duration = Duration::from_secs(5);
const SOMETHING_WRONG: &str = "⚠ Something went wrong, contact administrators for assistance.";

pub struct LinkContext<'a> {
    pub storage: &'a dyn Storage,
    pub alerter: &'a dyn Alerter,
    pub link_url: &'a str,
}

/// Handles `/hostmsg confirm-...`. Anything else is ignored.
pub async fn process_linking(
    ctx: &LinkContext<'_>,
    pubkey: &[u8],
    pubkey_b64: &str,
    name: &str,
    args: &str,
) -> Vec<ControlLine> {
    let args = args.trim();
    let code = args.strip_prefix("/hostmsg ").unwrap_or(args).trim();
    if !code.starts_with("confirm-") {
        return Vec::new();
    }
    let req = LinkRequest {
        confirm_code: code.to_string(),
        name: name.to_string(),
        pubkey: pubkey.to_vec(),
    };
    let reply = |text: String| vec![ControlLine::direct(pubkey_b64, text)];

    let result = match tokio::time::timeout(LINK_TIMEOUT, ctx.storage.link_identity(&req)).await {
        Ok(r) => r,
        Err(_) => Err(anyhow::anyhow!("identity linking timed out")),
    };
    match result {
        Ok(LinkOutcome::Linked) => reply("☑ Identity linked successfully".into()),
        Ok(LinkOutcome::InvalidCode) => reply(format!(
            "⚠ Invalid code, please get one at {}",
            ctx.link_url
        )),
        Ok(LinkOutcome::EmailNotConfirmed) => reply(
            "⚠ Email not confirmed. Please confirm your email to link an identity. If you need to re-send confirmation email or change your address contact Administrators.".into(),
        ),
        Ok(LinkOutcome::AlreadyClaimed) => reply(
            "⚠ Identity already claimed, contact administrators if you are confused.".into(),
        ),
        Err(err) => {
            ctx.alerter.alert(format!(
                "identity linking failed for {pubkey_b64}: {}",
                format_error_chain(&err)
            ));
            reply(SOMETHING_WRONG.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeAlerter, FakeStorage};

    async fn link(storage: &FakeStorage, alerter: &FakeAlerter, args: &str) -> Vec<ControlLine> {
        let ctx = LinkContext {
            storage,
            alerter,
            link_url: "https://example.invalid/link",
        };
        process_linking(&ctx, b"pk", "cGs=", "alice", args).await
    }

    #[tokio::test]
    async fn non_confirm_messages_are_ignored() {
        let storage = FakeStorage::default();
        let alerter = FakeAlerter::default();
        assert!(link(&storage, &alerter, "hello").await.is_empty());
        assert!(storage.calls().is_empty());
    }

    #[tokio::test]
    async fn outcomes_map_to_private_replies() {
        let alerter = FakeAlerter::default();
        let storage = FakeStorage {
            link_outcome: Some(LinkOutcome::Linked),
            ..Default::default()
        };
        assert_eq!(
            link(&storage, &alerter, " confirm-abc ").await,
            vec![ControlLine::direct("cGs=", "☑ Identity linked successfully")]
        );

        let storage = FakeStorage {
            link_outcome: Some(LinkOutcome::InvalidCode),
            ..Default::default()
        };
        let lines = link(&storage, &alerter, "confirm-abc").await;
        assert!(lines[0].to_string().contains("https://example.invalid/link"));
        assert!(alerter.alerts().is_empty());
    }

    #[tokio::test]
    async fn storage_errors_go_to_alerts_only() {
        let alerter = FakeAlerter::default();
        let storage = FakeStorage::default();
        let lines = link(&storage, &alerter, "confirm-abc").await;
        assert_eq!(lines, vec![ControlLine::direct("cGs=", SOMETHING_WRONG)]);
        let alerts = alerter.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("deadlock detected"));
    }
}
