use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::config::LayeredConfig;

#[derive(Debug, Clone)]
struct Vote {
    target_hash: String,
    target_ip: String,
    when: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by voter ip.
    votes: HashMap<String, Vote>,
    /// Target ip to restriction expiry.
    restrictions: HashMap<String, Instant>,
}

#[derive(Debug, Default)]
pub struct VoteKickState {
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteKickPolicy {
    /// Votes needed to kick; 0 disables votekick.
    pub threshold: usize,
    pub vote_lifetime: Duration,
    pub ban_duration: Duration,
}

impl VoteKickPolicy {
    pub fn from_config(cfg: &LayeredConfig) -> Self {
        let secs = |path: &[&str], d: i64| Duration::from_secs(cfg.i64_or(path, d).max(0) as u64);
        Self {
            threshold: cfg.i64_or(&["votekick", "vote_success_threshold"], 0).max(0) as usize,
            vote_lifetime: secs(&["votekick_vote_lifetime_sec"], 600),
            ban_duration: secs(&["votekick", "ban_duration_sec"], 600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The voter already has a live vote.
    Wait(Duration),
    Counted {
        votes: usize,
        /// Set when this vote crossed the threshold and the caller must
        /// issue the ban/unban pair.
        kicked: bool,
    },
}

/// Rejections shown to the voter as a single chat line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteKickError {
    #[error("Votekick is disabled in this room.")]
    Disabled,
    #[error("Votekick avaliable only to registered and linked players.")]
    NotLinked,
    #[error("Votekick player ID prefix must be at least 3 characters long")]
    PrefixTooShort,
    #[error("Votekick provided player ID prefix is invalid")]
    PrefixInvalid,
    #[error("Votekick player not found")]
    NotFound,
    #[error("Provide longer votekick player ID, collision detected")]
    Collision,
}

pub fn validate_prefix(prefix: &str) -> Result<(), VoteKickError> {
    if prefix.chars().count() < 3 {
        return Err(VoteKickError::PrefixTooShort);
    }
    if !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(VoteKickError::PrefixInvalid);
    }
    Ok(())
}

impl VoteKickState {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cast_vote(
        &self,
        voter_ip: &str,
        target_hash: &str,
        target_ip: &str,
        policy: &VoteKickPolicy,
    ) -> VoteOutcome {
        self.cast_vote_at(Instant::now(), voter_ip, target_hash, target_ip, policy)
    }

    pub fn cast_vote_at(
        &self,
        now: Instant,
        voter_ip: &str,
        target_hash: &str,
        target_ip: &str,
        policy: &VoteKickPolicy,
    ) -> VoteOutcome {
        let mut g = self.lock();
        let lifetime = policy.vote_lifetime;
        g.votes.retain(|_, v| now.saturating_duration_since(v.when) < lifetime);

        if let Some(v) = g.votes.get(voter_ip) {
            let wait = lifetime.saturating_sub(now.saturating_duration_since(v.when));
            return VoteOutcome::Wait(wait);
        }
        g.votes.insert(
            voter_ip.to_string(),
            Vote {
                target_hash: target_hash.to_string(),
                target_ip: target_ip.to_string(),
                when: now,
            },
        );

        let votes = count_live(&g.votes, now, target_ip, lifetime);
        g.restrictions.retain(|_, until| *until > now);
        let already_restricted = g.restrictions.contains_key(target_ip);
        let kicked = policy.threshold > 0 && votes >= policy.threshold && !already_restricted;
        if kicked {
            g.restrictions
                .insert(target_ip.to_string(), now + policy.ban_duration);
            tracing::info!(
                ip = target_ip,
                hash = target_hash,
                votes,
                "votekick threshold reached"
            );
        }
        VoteOutcome::Counted { votes, kicked }
    }

    #[cfg(test)]
    fn count_votes_at(&self, now: Instant, target_ip: &str, window: Duration) -> usize {
        count_live(&self.lock().votes, now, target_ip, window)
    }

    /// Remaining restriction for `ip`, zero when there is none.
    pub fn is_restricted(&self, ip: &str) -> Duration {
        self.is_restricted_at(Instant::now(), ip)
    }

    pub fn is_restricted_at(&self, now: Instant, ip: &str) -> Duration {
        let mut g = self.lock();
        g.restrictions.retain(|_, until| *until > now);
        g.restrictions
            .get(ip)
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Hash prefix the voter last voted against, if the vote is still live.
    pub fn current_target(&self, voter_ip: &str) -> Option<String> {
        self.lock().votes.get(voter_ip).map(|v| v.target_hash.clone())
    }
}

fn count_live(votes: &HashMap<String, Vote>, now: Instant, target_ip: &str, window: Duration) -> usize {
    votes
        .values()
        .filter(|v| v.target_ip == target_ip && now.saturating_duration_since(v.when) < window)
        .count()
}
