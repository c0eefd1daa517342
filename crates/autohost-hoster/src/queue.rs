use std::{path::PathBuf, time::Duration};

use serde_json::{Value, json};

use crate::{config::LayeredConfig, instance::InstanceSettings};

/// A room template the scheduler keeps populated, read from `queues.<name>`.
#[derive(Debug, Clone)]
pub struct QueueTemplate {
    pub name: String,
    pub bin_path: PathBuf,
    pub player_count: u32,
    pub time_limit: u32,
    pub frame_interval: u32,
    pub admins: Vec<String>,
    /// Written to `autohost/preset.json` in the instance directory.
    pub preset: Value,
    pub idle_reroll: Option<Duration>,
}

/// The raw `queues.<name>` table, used as the queue's config layer.
pub fn queue_layer(cfg: &LayeredConfig, name: &str) -> Value {
    cfg.get_value(&["queues", name])
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}))
}

/// Enabled queue names in sorted order.
pub fn list_queues(cfg: &LayeredConfig) -> Vec<String> {
    let mut names: Vec<String> = cfg
        .get_keys(&["queues"])
        .unwrap_or_default()
        .into_iter()
        .filter(|n| !cfg.bool_or(&["queues", n.as_str(), "disabled"], false))
        .collect();
    names.sort();
    names
}

fn bounded(cfg: &LayeredConfig, key: &str, default: i64, range: std::ops::RangeInclusive<i64>) -> anyhow::Result<u32> {
    let v = cfg.i64_or(&[key], default);
    if !range.contains(&v) {
        anyhow::bail!("{key} out of range: {v}");
    }
    Ok(v as u32)
}

pub fn find_queue(cfg: &LayeredConfig, name: &str) -> anyhow::Result<QueueTemplate> {
    if cfg.get_keys(&["queues", name]).is_none() {
        anyhow::bail!("queue {name:?} is not configured");
    }
    let q = cfg.with_outer(queue_layer(cfg, name));
    let bin_path = q
        .get_str(&["bin_path"])
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("queue {name:?} has no bin_path"))?;
    let idle = q.i64_or(&["idle_reroll_minutes"], 0);
    Ok(QueueTemplate {
        name: name.to_string(),
        bin_path,
        player_count: bounded(&q, "player_count", 2, 1..=10)?,
        time_limit: bounded(&q, "time_limit", 90, 1..=24 * 60)?,
        frame_interval: bounded(&q, "frame_interval", 5, 1..=600)?,
        admins: q.str_list_all_layers(&["admins"]),
        preset: q.get_value(&["preset"]).unwrap_or_else(|| json!({})),
        idle_reroll: (idle > 0).then(|| Duration::from_secs(idle as u64 * 60)),
    })
}

impl QueueTemplate {
    pub fn settings(&self, game_port: u16) -> InstanceSettings {
        InstanceSettings {
            bin_path: self.bin_path.clone(),
            game_port,
            player_count: self.player_count,
            time_limit: self.time_limit,
            frame_interval: self.frame_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::layer;

    fn cfg() -> LayeredConfig {
        LayeredConfig::new(vec![layer(json!({
            "bin_path": "/opt/wz/warzone2100",
            "admins": ["global"],
            "queues": {
                "duel": {"player_count": 2, "admins": ["duelmod"], "idle_reroll_minutes": 30,
                         "preset": {"locked": {"power": true}}},
                "ffa": {"player_count": 4, "bin_path": "/opt/wz-next/warzone2100"},
                "old": {"disabled": true},
                "broken": {"player_count": 40},
            }
        }))])
    }

    #[test]
    fn queues_are_sorted_and_disabled_ones_skipped() {
        assert_eq!(list_queues(&cfg()), vec!["broken", "duel", "ffa"]);
    }

    #[test]
    fn queue_values_override_globals() {
        let c = cfg();
        let duel = find_queue(&c, "duel").unwrap();
        assert_eq!(duel.bin_path, PathBuf::from("/opt/wz/warzone2100"));
        assert_eq!(duel.admins, vec!["duelmod", "global"]);
        assert_eq!(duel.idle_reroll, Some(Duration::from_secs(1800)));
        assert_eq!(duel.preset, json!({"locked": {"power": true}}));

        let ffa = find_queue(&c, "ffa").unwrap();
        assert_eq!(ffa.bin_path, PathBuf::from("/opt/wz-next/warzone2100"));
        assert_eq!(ffa.settings(2101).player_count, 4);
        assert_eq!(ffa.idle_reroll, None);
    }

    #[test]
    fn bad_queues_are_rejected() {
        let c = cfg();
        assert!(find_queue(&c, "broken").is_err());
        assert!(find_queue(&c, "missing").is_err());
    }
}
