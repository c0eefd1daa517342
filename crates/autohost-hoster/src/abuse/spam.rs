use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::config::LayeredConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpamPolicy {
    pub window: Duration,
    /// Signatures inside the window that trigger a mute; 0 disables.
    pub hits: usize,
    /// 0 disables muting entirely.
    pub mute: Duration,
}

impl SpamPolicy {
    pub fn from_config(cfg: &LayeredConfig) -> Self {
        let secs = |key: &str, d: i64| Duration::from_secs(cfg.i64_or(&[key], d).max(0) as u64);
        Self {
            window: secs("anti_spam_window_seconds", 3),
            hits: cfg.i64_or(&["anti_spam_window_hits"], 4).max(0) as usize,
            mute: secs("anti_spam_mute_seconds", 30 * 60),
        }
    }

    fn enabled(&self) -> bool {
        !self.window.is_zero() && self.hits > 0
    }
}

/// Short messages and ones made of a single repeated character.
pub fn is_spam_signature(message: &str) -> bool {
    if message.chars().count() <= 3 {
        return true;
    }
    message.chars().collect::<HashSet<_>>().len() == 1
}

/// Recent messages per sender IP.
#[derive(Debug, Default)]
struct Counters {
    by_ip: HashMap<String, Vec<(String, Instant)>>,
    last_sweep: Option<Instant>,
}

impl Counters {
    /// Drops senders whose newest message left the window. Runs at most
    /// once per window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        if self
            .last_sweep
            .is_some_and(|t| now.saturating_duration_since(t) < window)
        {
            return;
        }
        self.last_sweep = Some(now);
        self.by_ip.retain(|_, history| {
            history
                .last()
                .is_some_and(|(_, when)| now.saturating_duration_since(*when) <= window)
        });
    }
}

#[derive(Debug, Default)]
pub struct ChatSpamState {
    counters: Mutex<Counters>,
    mutes: Mutex<HashMap<String, Instant>>,
}

impl ChatSpamState {
    /// Records a free-chat message. Returns true when this message got the
    /// sender muted; the caller then notifies the room.
    pub fn record_hit(&self, ip: &str, message: &str, policy: &SpamPolicy) -> bool {
        self.record_hit_at(Instant::now(), ip, message, policy)
    }

    pub fn record_hit_at(
        &self,
        now: Instant,
        ip: &str,
        message: &str,
        policy: &SpamPolicy,
    ) -> bool {
        if !policy.enabled() {
            return false;
        }
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.sweep(now, policy.window);
        let history = counters.by_ip.entry(ip.to_string()).or_default();
        history.retain(|(_, when)| now.saturating_duration_since(*when) <= policy.window);
        history.push((message.to_string(), now));

        let hits = history.iter().filter(|(m, _)| is_spam_signature(m)).count();
        if hits < policy.hits {
            return false;
        }
        counters.by_ip.remove(ip);
        drop(counters);

        self.mutes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ip.to_string(), now);
        tracing::info!(ip, hits, "chat spam mute applied");
        true
    }

    pub fn is_muted(&self, ip: &str, mute: Duration) -> bool {
        self.is_muted_at(Instant::now(), ip, mute)
    }

    pub fn is_muted_at(&self, now: Instant, ip: &str, mute: Duration) -> bool {
        if mute.is_zero() {
            return false;
        }
        let mut mutes = self.mutes.lock().unwrap_or_else(|e| e.into_inner());
        mutes.retain(|_, since| now.saturating_duration_since(*since) < mute);
        mutes.contains_key(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SpamPolicy {
        SpamPolicy {
            window: Duration::from_secs(3),
            hits: 4,
            mute: Duration::from_secs(1800),
        }
    }

    #[test]
    fn signatures() {
        assert!(is_spam_signature("gg"));
        assert!(is_spam_signature("ааа"));
        assert!(is_spam_signature("!!!!!!!!"));
        assert!(!is_spam_signature("hello all"));
    }

    #[test]
    fn four_short_messages_in_window_mute() {
        let s = ChatSpamState::default();
        let p = policy();
        let t0 = Instant::now();
        let muted: Vec<bool> = (0..4)
            .map(|i| s.record_hit_at(t0 + Duration::from_millis(500 * i), "1.2.3.4", "a", &p))
            .collect();
        assert_eq!(muted, vec![false, false, false, true]);

        assert!(s.is_muted_at(t0 + Duration::from_secs(2), "1.2.3.4", p.mute));
        assert!(s.is_muted_at(t0 + Duration::from_secs(1700), "1.2.3.4", p.mute));
        assert!(!s.is_muted_at(t0 + Duration::from_secs(1802), "1.2.3.4", p.mute));
        assert!(!s.is_muted_at(t0, "5.6.7.8", p.mute));
    }

    #[test]
    fn messages_outside_window_do_not_accumulate() {
        let s = ChatSpamState::default();
        let p = policy();
        let t0 = Instant::now();
        for i in 0..8 {
            assert!(!s.record_hit_at(t0 + Duration::from_secs(2 * i), "1.2.3.4", "k", &p));
        }
    }

    #[test]
    fn quiet_senders_are_forgotten() {
        let s = ChatSpamState::default();
        let p = policy();
        let t0 = Instant::now();
        s.record_hit_at(t0, "1.1.1.1", "a", &p);
        s.record_hit_at(t0 + Duration::from_secs(1), "2.2.2.2", "b", &p);
        assert_eq!(s.counters.lock().unwrap().by_ip.len(), 2);

        s.record_hit_at(t0 + Duration::from_secs(10), "3.3.3.3", "c", &p);
        let counters = s.counters.lock().unwrap();
        let mut left: Vec<&str> = counters.by_ip.keys().map(String::as_str).collect();
        left.sort();
        assert_eq!(left, vec!["3.3.3.3"]);
    }

    #[test]
    fn normal_chat_does_not_count() {
        let s = ChatSpamState::default();
        let p = policy();
        let t0 = Instant::now();
        for _ in 0..10 {
            assert!(!s.record_hit_at(t0, "1.2.3.4", "good game everyone", &p));
        }
    }

    #[test]
    fn zero_mute_duration_reports_unmuted() {
        let s = ChatSpamState::default();
        let p = SpamPolicy {
            mute: Duration::ZERO,
            ..policy()
        };
        let t0 = Instant::now();
        for _ in 0..4 {
            s.record_hit_at(t0, "1.2.3.4", "x", &p);
        }
        assert!(!s.is_muted_at(t0, "1.2.3.4", p.mute));
    }
}
