use std::time::{Duration, Instant};

use autohost_instance::{InstanceId, JoinCheckActionLevel};

use crate::{
    abuse::{AbuseStores, SpamPolicy},
    audit::log_action,
    collaborators::{IpReputation, Storage},
    config::LayeredConfig,
};

/// Placeholder names the game ships with, in every translation.
const DEFAULT_NAMES: &[&str] = &[
    "_", "Player", "플레이어", "Giocatore", "Gracz", "Hráč", "Igrač", "Igralec", "Imreoir",
    "Játékos", "Jogador", "Joueur", "Jucător", "Jugador", "Mägija", "Oyuncu", "Pelaaja", "Pemain",
    "Speler", "Spieler", "Spiler", "Spiller", "Žaidėjas", "Παίκτης", "Гравець", "Играч", "Игрок",
    "Уенчы", "اللاعب", "玩家",
];

const DEFAULT_LINK_URL: &str = "https://wz2100-autohost.net/wzlink";
const DEFAULT_CONTACT_URL: &str = "https://wz2100-autohost.net/about#contact";

const NAME_BAN_REASON: &str = "4.1.7. Any manifestations of Nazism, nationalism, incitement of \
interracial, interethnic, interfaith discord and hostility, calls for the overthrow of the \
government by force.";

/// Messages and chat permission delivered once the player is in the room.
#[derive(Debug, Clone)]
pub struct JoinDispatch {
    pub issued: Instant,
    pub messages: Vec<String>,
    pub allow_chat: bool,
}

impl Default for JoinDispatch {
    fn default() -> Self {
        Self {
            issued: Instant::now(),
            messages: Vec::new(),
            allow_chat: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinVerdict {
    pub dispatch: JoinDispatch,
    pub action: JoinCheckActionLevel,
    /// Text shown with a reject or ban.
    pub reason: Option<String>,
    /// How many rules ran before evaluation ended.
    pub evaluated: usize,
}

pub struct JoinAttempt<'a> {
    pub ip: &'a str,
    pub name: &'a str,
    pub pubkey: &'a [u8],
    pub pubkey_b64: &'a str,
}

pub struct AdmissionContext<'a> {
    pub instance: InstanceId,
    pub cfg: &'a LayeredConfig,
    pub storage: &'a dyn Storage,
    pub ip_reputation: &'a dyn IpReputation,
    pub abuse: &'a AbuseStores,
    /// Whether an instance still accepts joins.
    pub is_live: &'a (dyn Fn(InstanceId) -> bool + Send + Sync),
}

impl AdmissionContext<'_> {
    fn link_url(&self) -> String {
        self.cfg
            .get_str(&["link_url"])
            .unwrap_or_else(|| DEFAULT_LINK_URL.into())
    }

    fn contact_url(&self) -> String {
        self.cfg
            .get_str(&["contact_url"])
            .unwrap_or_else(|| DEFAULT_CONTACT_URL.into())
    }

    async fn audit(&self, tag: &str, msg: String) -> String {
        log_action(self.storage, self.instance, tag, &msg).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    NameBlacklist,
    VoteKickRestriction,
    PersistentBan,
    IpReputation,
    LinkedToJoin,
    LinkedToPlay,
    LinkedToChat,
    RateLimit,
    ForcedSpectator,
    IpMute,
    IpNoPlay,
    TerminatedAccount,
    DefaultName,
    SpamMute,
}

pub const RULES: [Rule; 14] = [
    Rule::NameBlacklist,
    Rule::VoteKickRestriction,
    Rule::PersistentBan,
    Rule::IpReputation,
    Rule::LinkedToJoin,
    Rule::LinkedToPlay,
    Rule::LinkedToChat,
    Rule::RateLimit,
    Rule::ForcedSpectator,
    Rule::IpMute,
    Rule::IpNoPlay,
    Rule::TerminatedAccount,
    Rule::DefaultName,
    Rule::SpamMute,
];

enum Flow {
    Continue,
    Stop(JoinCheckActionLevel, String),
}

struct Evaluation {
    dispatch: JoinDispatch,
    action: JoinCheckActionLevel,
    account: Option<i64>,
}

impl Evaluation {
    fn warn(&mut self, msg: impl Into<String>) {
        self.dispatch.messages.push(msg.into());
    }

    /// Spectator demotion that only applies to a plain approve.
    fn demote_from_approve(&mut self) {
        if self.action == JoinCheckActionLevel::Approve {
            self.action = JoinCheckActionLevel::ApproveSpectator;
        }
    }

    fn linked(&self) -> bool {
        self.account.is_some()
    }
}

fn name_blacklisted(name: &str, list: &[String]) -> bool {
    let name = name.to_lowercase();
    list.iter()
        .map(|s| s.to_lowercase())
        .any(|s| !s.is_empty() && name.contains(&s))
}

impl Rule {
    async fn apply(
        self,
        ctx: &AdmissionContext<'_>,
        at: &JoinAttempt<'_>,
        ev: &mut Evaluation,
    ) -> Flow {
        match self {
            Rule::NameBlacklist => {
                let list = ctx.cfg.get_str_list(&["blacklist", "name"]).unwrap_or_default();
                if !name_blacklisted(at.name, &list) {
                    return Flow::Continue;
                }
                let code = ctx
                    .audit(
                        "namefilter",
                        format!("join name {:?} hit the name blacklist, ip was {}", at.name, at.ip),
                    )
                    .await;
                Flow::Stop(
                    JoinCheckActionLevel::Ban,
                    format!(
                        "You were banned from joining Autohoster.\nBan reason: {NAME_BAN_REASON}\n\n{}Event ID: {code}",
                        appeal_text(&ctx.contact_url())
                    ),
                )
            }
            Rule::VoteKickRestriction => {
                let left = ctx.abuse.votekick.is_restricted(at.ip);
                if left.is_zero() {
                    return Flow::Continue;
                }
                Flow::Stop(
                    JoinCheckActionLevel::Reject,
                    format!(
                        "You got votekicked. You will be able to join back in {}. If you feel like it is being abused, contact administrators.",
                        crate::support::human_duration(left)
                    ),
                )
            }
            Rule::PersistentBan => {
                let record = match ctx.storage.lookup_identity(at.pubkey).await {
                    Ok(Some(r)) => r,
                    Ok(None) => return Flow::Continue,
                    Err(err) => {
                        tracing::warn!(instance = %ctx.instance, err = %format!("{err:#}"), "ban lookup failed");
                        return Flow::Continue;
                    }
                };
                ev.account = record.account;
                let Some(ban) = record.ban.filter(|b| b.is_active_at(chrono::Utc::now())) else {
                    return Flow::Continue;
                };
                if ban.forbids_joining {
                    let expires = ban
                        .expires
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "never".into());
                    return Flow::Stop(
                        JoinCheckActionLevel::Reject,
                        format!(
                            "You were banned from joining Autohoster.\nBan reason: {}\n\n{}Ban issued: {}\nBan expires: {expires}\nEvent ID: M-{}",
                            ban.reason,
                            appeal_text(&ctx.contact_url()),
                            ban.issued,
                            ban.id
                        ),
                    );
                }
                if ban.forbids_chatting {
                    ev.warn(format!(
                        "⚠ You are banned from chatting in this room (ban ID: M-{})",
                        ban.id
                    ));
                    ev.dispatch.allow_chat = false;
                }
                if ban.forbids_playing {
                    ev.warn(format!(
                        "⚠ You are banned from participating in this game (ban ID: M-{})",
                        ban.id
                    ));
                    ev.action.escalate(JoinCheckActionLevel::ApproveSpectator);
                }
                Flow::Continue
            }
            Rule::IpReputation => {
                if ev.linked() || ctx.cfg.bool_or(&["allow_non_linked_hide"], false) {
                    return Flow::Continue;
                }
                let info = match ctx.ip_reputation.lookup(at.ip).await {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(instance = %ctx.instance, ip = at.ip, err = %format!("{err:#}"), "ip reputation lookup failed");
                        return Flow::Continue;
                    }
                };
                let asn_banned = !info.asn.is_empty()
                    && ctx
                        .cfg
                        .str_list_all_layers(&["banned_asns"])
                        .iter()
                        .any(|a| *a == info.asn);
                if !info.is_proxy && !asn_banned {
                    return Flow::Continue;
                }
                let code = ctx
                    .audit(
                        "antiproxy",
                        format!(
                            "join attempt from {:?} did not pass isp checks: proxy {} asnban {} (ip was {})",
                            at.name, info.is_proxy, asn_banned, at.ip
                        ),
                    )
                    .await;
                Flow::Stop(
                    JoinCheckActionLevel::Reject,
                    format!(
                        "You were rejected from joining Autohoster.\nReason: 2.1.1. Disruption or other interference with the system with or without defined purpose.\n\n{}",
                        mistake_text(&ctx.contact_url(), &code)
                    ),
                )
            }
            Rule::LinkedToJoin => {
                if ev.linked() || ctx.cfg.bool_or(&["allow_non_linked_join"], true) {
                    return Flow::Continue;
                }
                Flow::Stop(
                    JoinCheckActionLevel::Reject,
                    format!(
                        "You can not join this game.\n\nYou must join with linked player identity. Link one at:\n{}\n\nDo not bother admins/moderators about this.",
                        ctx.link_url()
                    ),
                )
            }
            Rule::LinkedToPlay => {
                if !ev.linked() && !ctx.cfg.bool_or(&["allow_non_linked_play"], true) {
                    ev.warn("⚠ You are not allowed to participate in this game due to being not registered");
                    ev.warn(format!("⚠ Link your identity at {}", ctx.link_url()));
                    ev.action.escalate(JoinCheckActionLevel::ApproveSpectator);
                }
                Flow::Continue
            }
            Rule::LinkedToChat => {
                if !ev.linked() && !ctx.cfg.bool_or(&["allow_non_linked_chat"], true) {
                    ev.warn("⚠ You are not allowed to chat in this room due to being not registered");
                    ev.warn(format!("⚠ Link your identity on {}", ctx.link_url()));
                    ev.dispatch.allow_chat = false;
                }
                Flow::Continue
            }
            Rule::RateLimit => {
                let threshold = ctx.cfg.i64_or(&["anti_spam_threshold_count"], 3);
                if threshold <= 0 {
                    return Flow::Continue;
                }
                let hours = ctx.cfg.i64_or(&["anti_spam_threshold_duration_hours"], 72).max(0) as u64;
                let window = Duration::from_secs(hours * 3600);
                let count = match ctx
                    .storage
                    .count_recent_short_games(at.pubkey, ev.account, window)
                    .await
                {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::warn!(instance = %ctx.instance, err = %format!("{err:#}"), "short game count failed");
                        return Flow::Continue;
                    }
                };
                if count < threshold as u64 {
                    return Flow::Continue;
                }
                ev.warn("⚠ You were automatically rate limited for leaving the game early. Do not contact admins/moderators about this, they will not help you");
                ev.demote_from_approve();
                ctx.audit(
                    "antigamespam",
                    format!("join {:?} spectating for game spam pkey {}", at.name, at.pubkey_b64),
                )
                .await;
                Flow::Continue
            }
            Rule::ForcedSpectator => {
                if !ctx
                    .abuse
                    .moved_out
                    .present(at.pubkey_b64, ctx.instance, ctx.is_live)
                {
                    return Flow::Continue;
                }
                ev.warn("⚠ You are not allowed to participate in the game because moderator moved you out earlier");
                ev.demote_from_approve();
                ctx.audit(
                    "movedout",
                    format!("join {:?} forcespec because moved out pkey {}", at.name, at.pubkey_b64),
                )
                .await;
                Flow::Continue
            }
            Rule::IpMute => {
                if ev.linked() || !ctx.cfg.ip_rule_matches(at.ip, &["ipmute"]) {
                    return Flow::Continue;
                }
                ev.dispatch.allow_chat = false;
                ev.warn(format!(
                    "⚠ You are not allowed to use free chat because you are not linked to an account. Link today at {}",
                    ctx.link_url()
                ));
                ctx.audit(
                    "ipmute",
                    format!("join {:?} muted because no account pkey {}", at.name, at.pubkey_b64),
                )
                .await;
                Flow::Continue
            }
            Rule::IpNoPlay => {
                if ev.linked() || !ctx.cfg.ip_rule_matches(at.ip, &["ipnoplay"]) {
                    return Flow::Continue;
                }
                ev.warn(format!(
                    "⚠ You are not allowed to participate because you are not linked to an account. Link today at {}",
                    ctx.link_url()
                ));
                ev.demote_from_approve();
                ctx.audit(
                    "ipnoplay",
                    format!("join {:?} forcespec because no account pkey {}", at.name, at.pubkey_b64),
                )
                .await;
                Flow::Continue
            }
            Rule::TerminatedAccount => {
                if ev.action != JoinCheckActionLevel::Approve {
                    return Flow::Continue;
                }
                match ctx.storage.is_account_terminated(at.pubkey).await {
                    Ok(true) => {}
                    Ok(false) => return Flow::Continue,
                    Err(err) => {
                        tracing::warn!(instance = %ctx.instance, err = %format!("{err:#}"), "terminated account lookup failed");
                        return Flow::Continue;
                    }
                }
                let code = ctx
                    .audit(
                        "terminated",
                        format!(
                            "join {:?} rejected because account terminated pkey {}",
                            at.name, at.pubkey_b64
                        ),
                    )
                    .await;
                Flow::Stop(
                    JoinCheckActionLevel::Reject,
                    format!(
                        "You were rejected from joining Autohoster.\nYour identity is linked to terminated account. Joining with terminated account is not allowed.\n\n{}",
                        mistake_text(&ctx.contact_url(), &code)
                    ),
                )
            }
            Rule::DefaultName => {
                if !DEFAULT_NAMES.contains(&at.name) {
                    return Flow::Continue;
                }
                ev.warn("⚠ You are not allowed to participate in the game because you are using default name, please change it in top left field and rejoin.");
                ev.action.escalate(JoinCheckActionLevel::ApproveSpectator);
                ctx.audit(
                    "defaultname",
                    format!("join {:?} forcespec because default name pkey {}", at.name, at.pubkey_b64),
                )
                .await;
                Flow::Continue
            }
            Rule::SpamMute => {
                let mute = SpamPolicy::from_config(ctx.cfg).mute;
                if !ev.linked() && ctx.abuse.spam.is_muted(at.ip, mute) {
                    ev.dispatch.allow_chat = false;
                    ev.warn("⚠ You are temporarily not allowed to use free chat because you spammed in chat.");
                }
                Flow::Continue
            }
        }
    }
}

fn appeal_text(contact: &str) -> String {
    format!(
        "You can contact Autohoster administration to appeal or get additional information: {contact}\n\n"
    )
}

fn mistake_text(contact: &str, code: &str) -> String {
    format!(
        "If you believe it is a mistake, feel free to contact us: {contact}\n\nPlease provide event ID: {code} with your request."
    )
}

/// Runs the rule chain over one join attempt. Rules only ever raise the
/// action level, and a rule that rejects or bans stops evaluation. Storage
/// failures are logged and the rule is skipped.
pub async fn join_check(ctx: &AdmissionContext<'_>, attempt: &JoinAttempt<'_>) -> JoinVerdict {
    run_rules(ctx, attempt, &RULES).await
}

async fn run_rules(
    ctx: &AdmissionContext<'_>,
    attempt: &JoinAttempt<'_>,
    rules: &[Rule],
) -> JoinVerdict {
    let mut ev = Evaluation {
        dispatch: JoinDispatch::default(),
        action: JoinCheckActionLevel::Approve,
        account: None,
    };
    let mut reason = None;
    let mut evaluated = 0;
    for rule in rules {
        evaluated += 1;
        if let Flow::Stop(level, text) = rule.apply(ctx, attempt, &mut ev).await {
            tracing::info!(instance = %ctx.instance, ?rule, ?level, ip = attempt.ip, "join refused");
            ev.action.escalate(level);
            reason = Some(text);
            break;
        }
    }
    tracing::debug!(
        instance = %ctx.instance,
        pubkey = attempt.pubkey_b64,
        account = ?ev.account,
        action = ?ev.action,
        allow_chat = ev.dispatch.allow_chat,
        "join check resolved"
    );
    JoinVerdict {
        dispatch: ev.dispatch,
        action: ev.action,
        reason,
        evaluated,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::{Value, json};

    use super::*;
    use crate::{
        abuse::VoteKickPolicy,
        collaborators::{
            BanRecord, IdentityRecord, IpInfo,
            fakes::{FakeReputation, FakeStorage},
        },
        config::layer,
    };

    struct Harness {
        cfg: LayeredConfig,
        storage: FakeStorage,
        reputation: FakeReputation,
        abuse: AbuseStores,
    }

    impl Harness {
        fn new(cfg: Value, storage: FakeStorage) -> Self {
            Self {
                cfg: LayeredConfig::new(vec![layer(cfg)]),
                storage,
                reputation: FakeReputation::default(),
                abuse: AbuseStores::default(),
            }
        }

        async fn check_rules(&self, name: &str, rules: &[Rule]) -> JoinVerdict {
            let live = |_: InstanceId| true;
            let ctx = AdmissionContext {
                instance: InstanceId(100),
                cfg: &self.cfg,
                storage: &self.storage,
                ip_reputation: &self.reputation,
                abuse: &self.abuse,
                is_live: &live,
            };
            let attempt = JoinAttempt {
                ip: "10.1.1.1",
                name,
                pubkey: b"pk",
                pubkey_b64: "cGs=",
            };
            run_rules(&ctx, &attempt, rules).await
        }

        async fn check(&self, name: &str) -> JoinVerdict {
            self.check_rules(name, &RULES).await
        }
    }

    fn ban(joining: bool, playing: bool, chatting: bool) -> IdentityRecord {
        IdentityRecord {
            account: Some(5),
            ban: Some(BanRecord {
                id: 31,
                issued: chrono::Utc::now(),
                expires: None,
                reason: "griefing".into(),
                forbids_joining: joining,
                forbids_playing: playing,
                forbids_chatting: chatting,
            }),
        }
    }

    #[tokio::test]
    async fn plain_join_is_approved() {
        let h = Harness::new(json!({}), FakeStorage::default());
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::Approve);
        assert!(v.dispatch.allow_chat);
        assert!(v.dispatch.messages.is_empty());
        assert_eq!(v.evaluated, RULES.len());
        assert!(h.storage.events().is_empty());
    }

    #[tokio::test]
    async fn default_name_is_sent_to_spectators() {
        let h = Harness::new(json!({}), FakeStorage::default());
        let v = h.check("Player").await;
        assert_eq!(v.action, JoinCheckActionLevel::ApproveSpectator);
        assert_eq!(v.dispatch.messages.len(), 1);
        assert!(v.dispatch.messages[0].contains("default name"));
        assert!(v.dispatch.allow_chat);
        assert!(v.reason.is_none());
        let events = h.storage.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("A-"));
        assert!(events[0].contains("[defaultname]"));
    }

    #[tokio::test]
    async fn blacklisted_name_bans_before_anything_else() {
        let h = Harness::new(json!({"blacklist": {"name": ["badword"]}}), FakeStorage::default());
        let v = h.check("xxBadWordxx").await;
        assert_eq!(v.action, JoinCheckActionLevel::Ban);
        assert_eq!(v.evaluated, 1);
        let reason = v.reason.unwrap_or_default();
        assert!(reason.contains("4.1.7."));
        assert!(reason.contains("Event ID: A-"));
        assert!(h.storage.calls().is_empty());
        assert!(h.reputation.lookups.lock().unwrap().is_empty());
        assert_eq!(h.storage.events().len(), 1);
    }

    #[tokio::test]
    async fn votekicked_ip_is_rejected_with_remaining_time() {
        let h = Harness::new(json!({}), FakeStorage::default());
        let policy = VoteKickPolicy {
            threshold: 1,
            vote_lifetime: Duration::from_secs(600),
            ban_duration: Duration::from_secs(600),
        };
        h.abuse
            .votekick
            .cast_vote_at(Instant::now(), "10.9.9.9", "abc", "10.1.1.1", &policy);
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::Reject);
        assert!(v.reason.unwrap_or_default().contains("votekicked"));
        assert!(h.storage.calls().is_empty());
    }

    #[tokio::test]
    async fn ban_flags_map_to_levels() {
        let h = Harness::new(
            json!({}),
            FakeStorage {
                identity: Some(ban(true, false, false)),
                ..Default::default()
            },
        );
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::Reject);
        assert!(v.reason.unwrap_or_default().contains("Event ID: M-31"));

        let h = Harness::new(
            json!({}),
            FakeStorage {
                identity: Some(ban(false, true, true)),
                ..Default::default()
            },
        );
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::ApproveSpectator);
        assert!(!v.dispatch.allow_chat);
        assert_eq!(v.dispatch.messages.len(), 2);
    }

    #[tokio::test]
    async fn storage_failures_fail_open() {
        let h = Harness::new(
            json!({}),
            FakeStorage {
                fail_queries: true,
                ..Default::default()
            },
        );
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::Approve);
        assert!(v.dispatch.allow_chat);
    }

    #[tokio::test]
    async fn proxy_is_rejected_only_when_unlinked() {
        let mut h = Harness::new(json!({"banned_asns": ["AS666"]}), FakeStorage::default());
        h.reputation.info = IpInfo {
            is_proxy: false,
            asn: "AS666".into(),
        };
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::Reject);
        assert!(v.reason.unwrap_or_default().contains("2.1.1."));

        h.storage.identity = Some(IdentityRecord {
            account: Some(1),
            ban: None,
        });
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::Approve);
    }

    #[tokio::test]
    async fn room_policies_for_unlinked_players() {
        let h = Harness::new(json!({"allow_non_linked_join": false}), FakeStorage::default());
        assert_eq!(h.check("alice").await.action, JoinCheckActionLevel::Reject);

        let h = Harness::new(
            json!({"allow_non_linked_play": false, "allow_non_linked_chat": false}),
            FakeStorage::default(),
        );
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::ApproveSpectator);
        assert!(!v.dispatch.allow_chat);
        assert_eq!(v.dispatch.messages.len(), 4);
    }

    #[tokio::test]
    async fn spectator_rules_do_not_double_escalate() {
        let h = Harness::new(
            json!({}),
            FakeStorage {
                short_games: 5,
                ..Default::default()
            },
        );
        h.abuse.moved_out.add("cGs=", InstanceId(100), |_| true);
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::ApproveSpectator);
        assert_eq!(v.dispatch.messages.len(), 2);
        assert_eq!(h.storage.events().len(), 2);
        assert!(v.reason.is_none());
    }

    #[tokio::test]
    async fn terminated_account_only_rejects_plain_approvals() {
        let storage = FakeStorage {
            terminated: true,
            identity: Some(IdentityRecord {
                account: Some(9),
                ban: None,
            }),
            ..Default::default()
        };
        let h = Harness::new(json!({}), storage);
        assert_eq!(h.check("alice").await.action, JoinCheckActionLevel::Reject);
        assert_eq!(h.check("Player").await.action, JoinCheckActionLevel::Reject);

        let h = Harness::new(
            json!({}),
            FakeStorage {
                terminated: true,
                identity: Some(ban(false, true, false)),
                ..Default::default()
            },
        );
        assert_eq!(h.check("alice").await.action, JoinCheckActionLevel::ApproveSpectator);
    }

    #[tokio::test]
    async fn ip_lists_and_spam_mutes_apply_to_unlinked() {
        let h = Harness::new(
            json!({"ipmute": {"10.0.0.0/8": true}, "ipnoplay": {"10.1.0.0/16": "yes"}}),
            FakeStorage::default(),
        );
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::ApproveSpectator);
        assert!(!v.dispatch.allow_chat);

        let h = Harness::new(json!({}), FakeStorage::default());
        let policy = SpamPolicy::from_config(&h.cfg);
        for _ in 0..policy.hits {
            h.abuse.spam.record_hit("10.1.1.1", "x", &policy);
        }
        let v = h.check("alice").await;
        assert_eq!(v.action, JoinCheckActionLevel::Approve);
        assert!(!v.dispatch.allow_chat);
    }

    #[tokio::test]
    async fn action_level_never_decreases_along_the_chain() {
        let h = Harness::new(
            json!({"allow_non_linked_play": false}),
            FakeStorage {
                short_games: 9,
                terminated: true,
                ..Default::default()
            },
        );
        let mut last = JoinCheckActionLevel::Approve;
        for k in 1..=RULES.len() {
            let v = h.check_rules("Player", &RULES[..k]).await;
            assert!(v.action >= last, "rule {:?} lowered the level", RULES[k - 1]);
            last = v.action;
        }
        assert_eq!(last, JoinCheckActionLevel::ApproveSpectator);
    }
}
