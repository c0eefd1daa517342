use std::time::Duration;

const DEFAULT_PID_CHECK_INTERVAL_MS: u64 = 1000;
const DEFAULT_READ_DEADLINE_SEC: u64 = 60;
const DEFAULT_MSG_BACKLOG: usize = 8192;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn pid_check_interval() -> Duration {
    Duration::from_millis(
        env_u64("AUTOHOST_PID_CHECK_INTERVAL_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(DEFAULT_PID_CHECK_INTERVAL_MS),
    )
}

/// How long a stream reader waits for a line before re-arming.
pub(crate) fn read_deadline() -> Duration {
    Duration::from_secs(
        env_u64("AUTOHOST_READ_DEADLINE_SEC")
            .map(|v| v.clamp(1, 3600))
            .unwrap_or(DEFAULT_READ_DEADLINE_SEC),
    )
}

pub(crate) fn msg_backlog() -> usize {
    env_usize("AUTOHOST_MSG_BACKLOG")
        .map(|v| v.clamp(64, 1 << 20))
        .unwrap_or(DEFAULT_MSG_BACKLOG)
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Renders a wait time for chat, rounded to whole seconds and never "0s".
pub(crate) fn human_duration(d: Duration) -> String {
    let total = (d.as_millis() + 500) / 1000;
    let total = total.max(1) as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Process state letter from the contents of `/proc/<pid>/stat`.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so parse from the last `)`.
fn parse_proc_state(stat: &str) -> Option<char> {
    let end = stat.rfind(')')?;
    stat.get((end + 2)..)?.chars().next()
}

/// A zombie still answers `kill(pid, 0)`, so on Linux the process table
/// entry is inspected instead.
#[cfg(target_os = "linux")]
pub(crate) fn is_pid_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(s) => !matches!(parse_proc_state(&s), Some('Z') | Some('X') | None),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn is_pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Collects the exit status of a child we spawned ourselves.
///
/// Returns `Ok(true)` when the child was reaped, `Ok(false)` when it has
/// not exited yet.
#[cfg(unix)]
pub(crate) fn reap_nonblocking(pid: u32) -> std::io::Result<bool> {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    if rc != 0 && rc != pid as libc::pid_t {
        tracing::warn!(pid, got = rc, "waitpid returned a different pid");
    }
    Ok(rc != 0)
}
