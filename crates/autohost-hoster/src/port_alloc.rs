use std::{io::ErrorKind, net::TcpListener};

use anyhow::Context;

use crate::config::LayeredConfig;

pub fn port_range(cfg: &LayeredConfig) -> (u16, u16) {
    let bounds = cfg
        .get_value(&["game_port_range"])
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    let at = |i: usize, d: u16| {
        bounds
            .get(i)
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(d)
    };
    (at(0, 2100), at(1, 2200))
}

fn is_free(port: u16) -> anyhow::Result<bool> {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(false),
        Err(e) => Err(e).context(format!("bind port {port}")),
    }
}

/// First port in `range` that no instance holds and that binds right now.
pub fn allocate_game_port(range: (u16, u16), taken: &[u16]) -> anyhow::Result<u16> {
    let (lo, hi) = range;
    if lo == 0 || lo > hi {
        anyhow::bail!("invalid game port range {lo}..={hi}");
    }
    for port in lo..=hi {
        if taken.contains(&port) {
            continue;
        }
        if is_free(port)? {
            return Ok(port);
        }
    }
    anyhow::bail!("no free game port in {lo}..={hi}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::layer;

    #[test]
    fn range_defaults_and_overrides() {
        let c = LayeredConfig::new(vec![layer(json!({}))]);
        assert_eq!(port_range(&c), (2100, 2200));
        let c = LayeredConfig::new(vec![layer(json!({"game_port_range": [3000, 3010]}))]);
        assert_eq!(port_range(&c), (3000, 3010));
    }

    #[test]
    fn skips_taken_and_bound_ports() {
        let held = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        assert!(allocate_game_port((busy, busy), &[]).is_err());
        assert!(allocate_game_port((busy, busy), &[busy]).is_err());
        assert!(allocate_game_port((5, 1), &[]).is_err());
    }
}
