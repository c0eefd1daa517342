use serde_json::Value;

use crate::{
    abuse::{SpamPolicy, VoteKickError, VoteKickPolicy, VoteOutcome, validate_prefix},
    identlink::{LinkContext, process_linking},
    instance::Instance,
    protocol::{ChatLine, ControlLine},
    room_status::HashLookup,
    state::HosterState,
    support::human_duration,
};

const DEFAULT_STATS_URL: &str = "https://wz2100-autohost.net/games";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatCommandError {
    #[error("⚠ You must be an instance admin to use /set command")]
    NotAdmin,
    #[error("⚠ Set parameter {0:?} not found. Use \"/set\" to get help.")]
    UnknownSetting(String),
    #[error("⚠ Expected {expected} arguments but found {found}. Use \"/set\" to get help.")]
    MissingArgument { expected: usize, found: usize },
    #[error("Error parsing argument {index} ({name}): expected 'true', 't', '1', 'false', 'f', '0' but found {value:?}")]
    BadBool {
        index: usize,
        name: &'static str,
        value: String,
    },
    #[error("⚠ Poke requires numerical player slot as argument!")]
    BadSlot,
    #[error("⚠ Failed to process poke!")]
    PokeUndelivered,
    #[error("⚠ Failed to update room setting.")]
    SetFailed,
}

/// Room settings an instance admin may flip with `/set`.
struct Setting {
    key: &'static str,
    description: &'static str,
    arg: &'static str,
}

const SETTINGS: &[Setting] = &[
    Setting {
        key: "allow_non_linked_join",
        description: "Allow/forbid non linked clients to join the lobby",
        arg: "allow",
    },
    Setting {
        key: "allow_non_linked_play",
        description: "Allow/forbid non linked clients to participate in game",
        arg: "allow",
    },
    Setting {
        key: "allow_non_linked_chat",
        description: "Allow/forbid non linked clients to use free chat",
        arg: "allow",
    },
];

const HELP: &[&str] = &[
    "/stat - link to game history and statistics",
    "/hostmsg <code> - link this identity to your account",
    "/votekick <player ID prefix> - vote to kick a player",
    "/poke <slot> - kick an afk player after a countdown",
    "/set [<parameter> <value>] - change room settings (room admins only)",
    "/help - this list",
];

fn pop_word(s: &str) -> (&str, &str) {
    let (head, rest) = s.split_once(' ').unwrap_or((s, ""));
    (head, rest.trim())
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "true" | "t" | "1" => Some(true),
        "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

pub struct ChatContext<'a> {
    pub inst: &'a Instance,
    pub hs: &'a HosterState,
}

impl ChatContext<'_> {
    fn link_url(&self) -> String {
        self.inst
            .cfg
            .get_str(&["link_url"])
            .unwrap_or_else(|| "https://wz2100-autohost.net/wzlink".into())
    }
}

/// Everything a chat line causes, as lines to write to the child.
pub async fn handle_chat(ctx: &ChatContext<'_>, chat: &ChatLine) -> Vec<ControlLine> {
    // Any chat proves the author is not afk.
    if let Err(err) = ctx.inst.poke_cancels.try_send(chat.ip.clone()) {
        tracing::debug!(%err, ip = %chat.ip, "poke cancel not delivered");
    }

    if chat.message.starts_with('/') {
        return handle_command(ctx, chat).await;
    }

    let policy = SpamPolicy::from_config(&ctx.inst.cfg);
    if ctx.hs.abuse.spam.record_hit(&chat.ip, &chat.message, &policy) {
        return vec![
            ControlLine::ChatMute(chat.pubkey_b64.clone()),
            ControlLine::direct(&chat.pubkey_b64, "⚠ You were automatically muted for chat spam."),
            ControlLine::broadcast("⚠ Please do not spam, it does not help anyone."),
        ];
    }
    Vec::new()
}

async fn handle_command(ctx: &ChatContext<'_>, chat: &ChatLine) -> Vec<ControlLine> {
    let (cmd, args) = pop_word(chat.message.trim());
    tracing::debug!(cmd, ip = %chat.ip, "chat command");
    let result = match cmd {
        "/stat" | "/stats" => {
            let url = ctx
                .inst
                .cfg
                .get_str(&["stats_url"])
                .unwrap_or_else(|| DEFAULT_STATS_URL.into());
            Ok(vec![ControlLine::broadcast(format!(
                "Game history of Autohoster is available at the website: {url} (with detailed statistics, charts and replay for download)"
            ))])
        }
        "/hostmsg" => {
            let link_url = ctx.link_url();
            let lctx = LinkContext {
                storage: ctx.hs.storage.as_ref(),
                alerter: ctx.hs.alerter.as_ref(),
                link_url: &link_url,
            };
            Ok(process_linking(&lctx, &chat.pubkey, &chat.pubkey_b64, &chat.name, args).await)
        }
        "/votekick" => Ok(votekick(ctx, chat, args).await),
        "/set" => set(ctx, chat, args),
        "/poke" => poke(ctx, args),
        "/help" => Ok(HELP
            .iter()
            .map(|l| ControlLine::direct(&chat.pubkey_b64, *l))
            .collect()),
        _ => Ok(Vec::new()),
    };
    result.unwrap_or_else(|err| vec![ControlLine::broadcast(err.to_string())])
}

async fn votekick(ctx: &ChatContext<'_>, chat: &ChatLine, prefix: &str) -> Vec<ControlLine> {
    let policy = VoteKickPolicy::from_config(&ctx.inst.cfg);
    match votekick_inner(ctx, chat, prefix, &policy).await {
        Ok(lines) => lines,
        Err(err) => vec![ControlLine::broadcast(err.to_string())],
    }
}

async fn votekick_inner(
    ctx: &ChatContext<'_>,
    chat: &ChatLine,
    prefix: &str,
    policy: &VoteKickPolicy,
) -> Result<Vec<ControlLine>, VoteKickError> {
    if policy.threshold == 0 {
        return Err(VoteKickError::Disabled);
    }
    let linked = match ctx.hs.storage.has_account(&chat.pubkey).await {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(err = %format!("{err:#}"), "account lookup for votekick failed");
            false
        }
    };
    if !linked {
        return Err(VoteKickError::NotLinked);
    }
    validate_prefix(prefix)?;
    let (ip, name) = match ctx.inst.room.snapshot().lookup_hash_prefix(prefix) {
        HashLookup::NotFound => return Err(VoteKickError::NotFound),
        HashLookup::Ambiguous => return Err(VoteKickError::Collision),
        HashLookup::Found { ip, name } => (ip, name),
    };

    match ctx.hs.abuse.votekick.cast_vote(&chat.ip, prefix, &ip, policy) {
        VoteOutcome::Wait(left) => {
            tracing::debug!(
                ip = %chat.ip,
                standing = ?ctx.hs.abuse.votekick.current_target(&chat.ip),
                "vote rejected, previous one still live"
            );
            Ok(vec![ControlLine::broadcast(format!(
                "Please wait for {} to cast your next vote",
                human_duration(left)
            ))])
        }
        VoteOutcome::Counted { votes, kicked } => {
            let mut out = vec![ControlLine::broadcast(format!(
                "Votekick of player {prefix} ({:?}): votes {votes}/{}",
                name.replace('\n', ""),
                policy.threshold
            ))];
            if kicked {
                out.push(ControlLine::BanIp {
                    ip: ip.clone(),
                    reason: format!(
                        "You got votekicked. You will be able to join back in {}. If you feel like it is being abused, contact administrators.",
                        human_duration(policy.ban_duration)
                    ),
                });
                out.push(ControlLine::UnbanIp(ip));
            }
            Ok(out)
        }
    }
}

fn set(ctx: &ChatContext<'_>, chat: &ChatLine, args: &str) -> Result<Vec<ControlLine>, ChatCommandError> {
    if !ctx.inst.is_admin(&chat.hash) {
        return Err(ChatCommandError::NotAdmin);
    }
    if args.is_empty() {
        let mut out = vec![ControlLine::direct(&chat.pubkey_b64, "Allowed set parameters are:")];
        for s in SETTINGS {
            out.push(ControlLine::direct(
                &chat.pubkey_b64,
                format!("{} {}", s.key, s.description),
            ));
            out.push(ControlLine::direct(
                &chat.pubkey_b64,
                format!("-    argument 1 {} of type bool", s.arg),
            ));
        }
        return Ok(out);
    }

    let (key, rest) = pop_word(args);
    let setting = SETTINGS
        .iter()
        .find(|s| s.key == key)
        .ok_or_else(|| ChatCommandError::UnknownSetting(key.to_string()))?;
    let (raw, _) = pop_word(rest);
    if raw.is_empty() {
        return Err(ChatCommandError::MissingArgument {
            expected: 1,
            found: 0,
        });
    }
    let value = parse_bool(raw).ok_or_else(|| ChatCommandError::BadBool {
        index: 1,
        name: setting.arg,
        value: raw.to_string(),
    })?;
    ctx.inst
        .cfg
        .set_top(&[setting.key], Value::Bool(value))
        .map_err(|err| {
            tracing::warn!(%err, key = setting.key, "room setting update failed");
            ChatCommandError::SetFailed
        })?;
    tracing::info!(instance = %ctx.inst.id, key = setting.key, value, by = %chat.hash, "room setting changed");
    Ok(vec![ControlLine::broadcast(format!(
        "☑ Top configuration layer value '{}' was set to {value}",
        setting.key
    ))])
}

fn poke(ctx: &ChatContext<'_>, args: &str) -> Result<Vec<ControlLine>, ChatCommandError> {
    let slot: usize = args.trim().parse().map_err(|_| ChatCommandError::BadSlot)?;
    if slot > ctx.inst.settings.player_count as usize {
        return Err(ChatCommandError::BadSlot);
    }
    ctx.inst
        .poke_requests
        .try_send(slot)
        .map_err(|_| ChatCommandError::PokeUndelivered)?;
    tracing::info!(slot, "poke requested");
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use serde_json::json;

    use super::*;
    use crate::{
        collaborators::fakes::FakeStorage,
        instance::{Instance, InstanceInbox, testing::spec},
        room_status::identity_hash,
        state::testing::hoster_state_with,
    };
    use autohost_instance::InstanceState;

    fn chat(ip: &str, pk: &str, hash: &str, message: &str) -> ChatLine {
        ChatLine {
            in_game: false,
            ip: ip.into(),
            pubkey: pk.as_bytes().to_vec(),
            pubkey_b64: base64::engine::general_purpose::STANDARD.encode(pk),
            hash: hash.into(),
            name: "someone".into(),
            message: message.into(),
        }
    }

    fn setup(global: serde_json::Value, storage: FakeStorage) -> (HosterState, std::sync::Arc<Instance>, InstanceInbox) {
        let (hs, _fakes) = hoster_state_with(std::path::Path::new("/nonexistent"), global, storage, 0);
        let mut s = spec(1);
        s.cfg = hs.cfg.with_outer(json!({}));
        let (inst, inbox) = Instance::new(s, InstanceState::InLobby);
        let b64 = base64::engine::general_purpose::STANDARD;
        inst.room.replace(json!({"players": [
            {"type": "player", "ip": "10.0.0.1", "pk": b64.encode("alice"), "name": "alice"},
            {"type": "player", "ip": "10.0.0.2", "pk": b64.encode("bob"), "name": "bob"},
        ]}));
        (hs, inst, inbox)
    }

    #[tokio::test]
    async fn chat_cancels_poke_and_spam_mutes() {
        let (hs, inst, mut inbox) = setup(json!({}), FakeStorage::default());
        let ctx = ChatContext { inst: &inst, hs: &hs };
        let mut last = Vec::new();
        for _ in 0..4 {
            last = handle_chat(&ctx, &chat("10.0.0.2", "bob", "h", "lol")).await;
        }
        assert_eq!(last.len(), 3);
        assert!(matches!(last[0], ControlLine::ChatMute(_)));
        assert_eq!(inbox.poke_cancels.try_recv().ok().as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn set_requires_admin_and_writes_top_layer() {
        let (hs, inst, _inbox) = setup(json!({"allow_non_linked_join": true}), FakeStorage::default());
        let ctx = ChatContext { inst: &inst, hs: &hs };
        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "nobody", "/set allow_non_linked_join f")).await;
        assert_eq!(out, vec![ControlLine::broadcast(ChatCommandError::NotAdmin.to_string())]);

        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "adminhash", "/set allow_non_linked_join f")).await;
        assert!(out[0].to_string().contains("was set to false"));
        assert_eq!(inst.cfg.get_bool(&["allow_non_linked_join"]), Some(false));
        assert_eq!(hs.cfg.get_bool(&["allow_non_linked_join"]), Some(true));

        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "adminhash", "/set allow_non_linked_join maybe")).await;
        assert!(out[0].to_string().ends_with("found \"maybe\""));
        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "adminhash", "/set")).await;
        assert_eq!(out.len(), 1 + 2 * SETTINGS.len());
    }

    #[tokio::test]
    async fn poke_validates_slot_and_forwards() {
        let (hs, inst, mut inbox) = setup(json!({}), FakeStorage::default());
        let ctx = ChatContext { inst: &inst, hs: &hs };
        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "h", "/poke x")).await;
        assert_eq!(out, vec![ControlLine::broadcast(ChatCommandError::BadSlot.to_string())]);
        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "h", "/poke 1")).await;
        assert!(out.is_empty());
        assert_eq!(inbox.poke_requests.try_recv().ok(), Some(1));
    }

    #[tokio::test]
    async fn votekick_flow() {
        let (hs, inst, _inbox) = setup(
            json!({"votekick": {"vote_success_threshold": 1, "ban_duration_sec": 600}}),
            FakeStorage {
                has_account: true,
                ..Default::default()
            },
        );
        let ctx = ChatContext { inst: &inst, hs: &hs };
        let bob = identity_hash(b"bob");

        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "h", "/votekick zz")).await;
        assert_eq!(out, vec![ControlLine::broadcast(VoteKickError::PrefixTooShort.to_string())]);

        let cmd = format!("/votekick {}", &bob[..8]);
        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "h", &cmd)).await;
        assert_eq!(out.len(), 3);
        assert!(out[0].to_string().contains("votes 1/1"));
        assert!(matches!(&out[1], ControlLine::BanIp { ip, .. } if ip == "10.0.0.2"));
        assert_eq!(out[2], ControlLine::UnbanIp("10.0.0.2".into()));

        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "h", &cmd)).await;
        assert!(out[0].to_string().contains("Please wait for"));
        assert!(!hs.abuse.votekick.is_restricted("10.0.0.2").is_zero());
    }

    #[tokio::test]
    async fn votekick_refuses_unlinked_and_disabled() {
        let (hs, inst, _inbox) = setup(json!({}), FakeStorage::default());
        let ctx = ChatContext { inst: &inst, hs: &hs };
        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "h", "/votekick abcdef")).await;
        assert_eq!(out, vec![ControlLine::broadcast(VoteKickError::Disabled.to_string())]);

        let (hs, inst, _inbox) = setup(json!({"votekick": {"vote_success_threshold": 2}}), FakeStorage::default());
        let ctx = ChatContext { inst: &inst, hs: &hs };
        let out = handle_chat(&ctx, &chat("10.0.0.1", "alice", "h", "/votekick abcdef")).await;
        assert_eq!(out, vec![ControlLine::broadcast(VoteKickError::NotLinked.to_string())]);
    }
}
