use std::{
    collections::HashMap,
    ffi::CString,
    os::unix::{ffi::OsStrExt, process::CommandExt},
    path::Path,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use autohost_instance::{InstanceId, InstanceOrigin, InstanceState, JoinCheckActionLevel};
use base64::Engine;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    net::unix::pipe,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::Instrument;

use crate::{
    admission::{AdmissionContext, JoinAttempt, JoinDispatch, JoinVerdict, join_check},
    archive,
    chat::{ChatContext, handle_chat},
    config::LayeredConfig,
    instance::{Instance, InstanceCommand, InstanceInbox, InstanceSettings},
    poke,
    protocol::{ControlLine, HosterMessage, JoinRequest, parse_line, sanitize_broadcast},
    recovery::save_snapshot,
    state::HosterState,
    support::{is_pid_alive, msg_backlog, pid_check_interval, read_deadline, reap_nonblocking},
};

/// A join dispatch is delivered only if the player shows up this soon.
const DISPATCH_TTL: Duration = Duration::from_secs(30);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(3);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long an ordered shutdown waits for the child to go away before
/// archiving anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Fires once, when the runner drops the sending half.
#[derive(Clone, Debug)]
pub struct ExitSignal(watch::Receiver<()>);

impl ExitSignal {
    pub fn new() -> (watch::Sender<()>, Self) {
        let (tx, rx) = watch::channel(());
        (tx, Self(rx))
    }

    pub async fn wait(&mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

/// Our ends of the child's standard streams.
pub struct Pipes {
    stdin: pipe::Sender,
    stdout: pipe::Receiver,
    stderr: pipe::Receiver,
}

/// Creates a named FIFO at `path`, replacing a stale file. The child's
/// streams are FIFOs in its directory so that a restarted daemon can reopen
/// them and re-attach to a surviving child.
pub(crate) fn make_fifo(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("remove stale {}", path.display())),
    }
    let c = CString::new(path.as_os_str().as_bytes()).context("fifo path contains NUL")?;
    if unsafe { libc::mkfifo(c.as_ptr(), 0o600) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("mkfifo {}", path.display()));
    }
    Ok(())
}

/// Opens the daemon side of existing FIFOs.
pub fn reopen_pipes(dir: &Path) -> anyhow::Result<Pipes> {
    let stdin = pipe::OpenOptions::new()
        .read_write(true)
        .open_sender(dir.join("stdin"))
        .context("open stdin fifo")?;
    let stdout = pipe::OpenOptions::new()
        .open_receiver(dir.join("stdout"))
        .context("open stdout fifo")?;
    let stderr = pipe::OpenOptions::new()
        .open_receiver(dir.join("stderr"))
        .context("open stderr fifo")?;
    Ok(Pipes {
        stdin,
        stdout,
        stderr,
    })
}

pub fn build_args(dir: &Path, settings: &InstanceSettings, cfg: &LayeredConfig) -> Vec<String> {
    let start_players = cfg.i64_or(&["start_players"], i64::from(settings.player_count));
    vec![
        settings.bin_path.display().to_string(),
        format!("--configdir={}", dir.display()),
        "--portmapping=0".into(),
        "--nosound".into(),
        "--autohost=preset.json".into(),
        "--headless".into(),
        format!("--gameport={}", settings.game_port),
        "--enablelobbyslashcmd".into(),
        format!("--startplayers={start_players}"),
        "--gamelog-output=log,cmdinterface".into(),
        "--gamelog-outputkey=playerposition".into(),
        format!("--gamelog-frameinterval={}", settings.frame_interval),
        format!("--gametimelimit={}", settings.time_limit),
        "--host-chat-config=quickchat".into(),
        "--async-join-approve".into(),
        "--enablecmdinterface=stdin".into(),
    ]
}

fn write_process_files(dir: &Path, args: &[String], pid: u32) {
    let mut cmdline = args.join("\0").into_bytes();
    cmdline.push(0);
    if let Err(err) = std::fs::write(dir.join("cmdline"), cmdline) {
        tracing::warn!(%err, "failed to write cmdline file");
    }
    if let Err(err) = std::fs::write(dir.join("pid"), pid.to_string()) {
        tracing::warn!(%err, "failed to write pid file");
    }
}

/// Starts the child detached into its own session, then hands it to a
/// runner task.
pub async fn spawn(
    hs: HosterState,
    inst: Arc<Instance>,
    inbox: InstanceInbox,
) -> anyhow::Result<JoinHandle<()>> {
    let dir = inst.dir.clone();
    let args = build_args(&dir, &inst.settings, &inst.cfg);

    let mut child_ends = Vec::with_capacity(3);
    for name in ["stdin", "stdout", "stderr"] {
        let path = dir.join(name);
        make_fifo(&path)?;
        // Read+write so opening never blocks waiting for the other side.
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        child_ends.push(f);
    }
    let mut ends = child_ends.into_iter();
    let (Some(i), Some(o), Some(e)) = (ends.next(), ends.next(), ends.next()) else {
        anyhow::bail!("fifo setup lost a stream");
    };

    tracing::info!(instance = %inst.id, bin = %inst.settings.bin_path.display(), args = ?&args[1..], "spawning");
    let mut cmd = std::process::Command::new(&inst.settings.bin_path);
    cmd.args(&args[1..])
        .current_dir(&dir)
        .stdin(Stdio::from(i))
        .stdout(Stdio::from(o))
        .stderr(Stdio::from(e));
    unsafe {
        cmd.pre_exec(|| {
            // Own session, so a ctrl-c aimed at the daemon does not reach it.
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", inst.settings.bin_path.display()))?;
    let pid = child.id();
    // Liveness is polled; the handle is not waited on.
    drop(child);
    drop(cmd);
    inst.set_pid(pid);
    write_process_files(&dir, &args, pid);
    tracing::info!(instance = %inst.id, pid, "started");

    let pipes = match reopen_pipes(&dir) {
        Ok(p) => p,
        Err(err) => {
            tracing::error!(instance = %inst.id, pid, "pipes could not be reopened, killing child");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            return Err(err);
        }
    };
    Ok(start(hs, inst, inbox, pipes))
}

/// Runs the supervision loop on a fresh task inside an `instance` span.
pub fn start(hs: HosterState, inst: Arc<Instance>, inbox: InstanceInbox, pipes: Pipes) -> JoinHandle<()> {
    let span = tracing::info_span!("instance", instance = %inst.id);
    tokio::spawn(run(hs, inst, inbox, pipes).instrument(span))
}

/// Longest child output line accepted. A stream that goes past it is
/// dropped rather than buffered without bound.
const MAX_LINE: usize = 64 * 1024 * 1024;

async fn read_stream(
    name: &'static str,
    rx: pipe::Receiver,
    tx: mpsc::Sender<String>,
    exit: ExitSignal,
) {
    read_lines(name, rx, tx, exit, read_deadline(), MAX_LINE).await;
}

/// Forwards newline-terminated lines from `rx` until EOF, a read error, an
/// overlong line or the exit signal.
async fn read_lines<R: AsyncRead + Unpin>(
    name: &'static str,
    rx: R,
    tx: mpsc::Sender<String>,
    mut exit: ExitSignal,
    deadline: Duration,
    max_line: usize,
) {
    let mut reader = BufReader::with_capacity(64 * 1024, rx);
    let mut buf = Vec::new();
    loop {
        // One byte past the limit tells an overlong line from one that fits.
        let mut limited = (&mut reader).take((max_line + 1).saturating_sub(buf.len()) as u64);
        let res = tokio::select! {
            _ = exit.wait() => break,
            r = tokio::time::timeout(deadline, limited.read_until(b'\n', &mut buf)) => r,
        };
        match res {
            // Partial data stays in `buf` for the next round.
            Err(_) => continue,
            Ok(Ok(0)) => {
                tracing::debug!(stream = name, "stream closed");
                if !buf.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&buf).into_owned()).await;
                }
                break;
            }
            Ok(Ok(_)) => {
                if buf.len() > max_line && buf.last() != Some(&b'\n') {
                    tracing::warn!(stream = name, limit = max_line, "line exceeds limit, closing stream");
                    break;
                }
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                buf.clear();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(Err(err)) => {
                tracing::warn!(stream = name, %err, "stream read failed");
                break;
            }
        }
    }
    tracing::debug!(stream = name, "reader exited");
}

async fn watch_pid(pid: u32, died: oneshot::Sender<()>, mut exit: ExitSignal) {
    let interval = pid_check_interval();
    loop {
        tokio::select! {
            _ = exit.wait() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if !is_pid_alive(pid) {
            tracing::info!(pid, "process is gone");
            let _ = died.send(());
            return;
        }
    }
}

/// True once a requested room has gone `grace` seconds without a human
/// in any slot, counting from creation or the last time one was seen.
pub(crate) fn requested_room_expired(now: i64, created: i64, last_human: Option<i64>, grace: i64) -> bool {
    let since = last_human.map_or(created, |t| t.max(created));
    now.saturating_sub(since) >= grace
}

async fn requested_watchdog(hs: HosterState, inst: Arc<Instance>, mut exit: ExitSignal) {
    let grace = inst.cfg.i64_or(&["requested_room_grace_sec"], 600);
    let mut last_human = None;
    loop {
        tokio::select! {
            _ = exit.wait() => return,
            _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
        }
        if inst.state.load() >= InstanceState::InGame {
            tracing::debug!("requested room watchdog stops, game started");
            return;
        }
        let now = InstanceId::from_unix_now().0;
        if inst.room.snapshot().has_human_player() {
            last_human = Some(now);
            continue;
        }
        if requested_room_expired(now, inst.id.0, last_human, grace) {
            tracing::info!("requested room has no players, shutting it down");
            hs.alert(format!("instance {} was killed by request watchdog", inst.id));
            inst.try_command(InstanceCommand::Shutdown);
            return;
        }
    }
}

pub(crate) fn verdict_lines(req: &JoinRequest, verdict: &JoinVerdict) -> Vec<ControlLine> {
    let reason = verdict.reason.clone().unwrap_or_default();
    let reject = ControlLine::JoinReject {
        join_id: req.join_id.clone(),
        text: reason.clone(),
    };
    match verdict.action {
        JoinCheckActionLevel::Approve => vec![ControlLine::JoinApprove(req.join_id.clone())],
        JoinCheckActionLevel::ApproveSpectator => {
            vec![ControlLine::JoinApproveSpectator(req.join_id.clone())]
        }
        JoinCheckActionLevel::Reject => vec![reject],
        JoinCheckActionLevel::Ban => vec![
            ControlLine::BanIp {
                ip: req.ip.clone(),
                reason,
            },
            reject,
        ],
    }
}

/// State owned by the run loop.
struct Session {
    hs: HosterState,
    inst: Arc<Instance>,
    stdin: pipe::Sender,
    pending: HashMap<String, JoinDispatch>,
    graphs: Vec<Value>,
}

impl Session {
    async fn write(&mut self, line: &ControlLine) {
        let wire = line.to_wire();
        match tokio::time::timeout(WRITE_TIMEOUT, self.stdin.write_all(wire.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(%err, %line, "failed to write to child stdin"),
            Err(_) => tracing::warn!(%line, "write to child stdin timed out"),
        }
    }

    async fn write_all(&mut self, lines: Vec<ControlLine>) {
        for line in &lines {
            self.write(line).await;
        }
    }

    async fn persist(&self) {
        if let Err(err) = save_snapshot(&self.inst).await {
            tracing::warn!(err = %format!("{err:#}"), "failed to save recovery snapshot");
        }
    }

    fn is_live(&self) -> impl Fn(InstanceId) -> bool + Send + Sync + 'static {
        let registry = self.hs.registry.clone();
        move |id| registry.accepts_joins(id)
    }

    async fn handle_line(&mut self, raw: &str) {
        match parse_line(raw) {
            Ok(HosterMessage::Unknown) => tracing::debug!(line = raw, "unhandled child output"),
            Ok(msg) => self.handle_message(msg).await,
            Err(err) => tracing::warn!(%err, line = raw, "malformed child output"),
        }
    }

    async fn handle_message(&mut self, msg: HosterMessage) {
        let inst = self.inst.clone();
        match msg {
            HosterMessage::StdinReady => {
                if inst.advance(InstanceState::InLobby) {
                    self.persist().await;
                }
            }
            HosterMessage::RoomStatus(v) => inst.room.replace(v),
            HosterMessage::JoinApprovalNeeded(req) => self.join(req).await,
            HosterMessage::PlayerJoined { slot, pubkey_b64 } => {
                tracing::debug!(slot, pubkey = %pubkey_b64, "player joined");
                self.deliver_dispatch(&pubkey_b64).await;
            }
            HosterMessage::PlayerLeft { ip } => {
                if let Err(err) = inst.poke_cancels.try_send(ip) {
                    tracing::debug!(%err, "poke cancel not delivered");
                }
            }
            HosterMessage::MovedToSpectators { pubkey_b64 } => {
                self.hs.abuse.moved_out.add(&pubkey_b64, inst.id, self.is_live());
            }
            HosterMessage::MovedToPlayers { pubkey_b64 } => {
                self.hs.abuse.moved_out.remove(&pubkey_b64, inst.id, self.is_live());
            }
            HosterMessage::GameStarted => {
                if inst.advance(InstanceState::InGame) {
                    self.persist().await;
                }
            }
            HosterMessage::GameId(id) => {
                tracing::info!(game_id = id, "game record assigned");
                inst.set_game_id(id);
                self.persist().await;
            }
            HosterMessage::Graph(v) => self.graphs.push(v),
            HosterMessage::Chat(chat) => {
                let ctx = ChatContext {
                    inst: &inst,
                    hs: &self.hs,
                };
                let lines = handle_chat(&ctx, &chat).await;
                self.write_all(lines).await;
            }
            HosterMessage::Unknown => {}
        }
    }

    async fn join(&mut self, req: JoinRequest) {
        let is_live = self.is_live();
        let ctx = AdmissionContext {
            instance: self.inst.id,
            cfg: &self.inst.cfg,
            storage: self.hs.storage.as_ref(),
            ip_reputation: self.hs.ip_reputation.as_ref(),
            abuse: &self.hs.abuse,
            is_live: &is_live,
        };
        let attempt = JoinAttempt {
            ip: &req.ip,
            name: &req.name,
            pubkey: &req.pubkey,
            pubkey_b64: &req.pubkey_b64,
        };
        let verdict = join_check(&ctx, &attempt).await;
        tracing::info!(ip = %req.ip, action = ?verdict.action, "join verdict");
        self.write_all(verdict_lines(&req, &verdict)).await;
        if !verdict.action.is_terminal() {
            self.pending
                .retain(|_, d| d.issued.elapsed() < DISPATCH_TTL);
            self.pending.insert(req.pubkey_b64, verdict.dispatch);
        }
    }

    async fn deliver_dispatch(&mut self, pubkey_b64: &str) {
        match base64::engine::general_purpose::STANDARD.decode(pubkey_b64) {
            Ok(pk) => {
                let storage = self.hs.storage.clone();
                tokio::spawn(async move {
                    if let Err(err) = storage.discover_pubkey(&pk).await {
                        tracing::warn!(err = %format!("{err:#}"), "identity discovery failed");
                    }
                });
            }
            Err(err) => tracing::warn!(%err, "joined player has undecodable pubkey"),
        }

        let Some(dispatch) = self.pending.remove(pubkey_b64) else {
            return;
        };
        if dispatch.issued.elapsed() >= DISPATCH_TTL {
            tracing::debug!(pubkey = pubkey_b64, "join dispatch expired");
            return;
        }
        let mut lines: Vec<ControlLine> = dispatch
            .messages
            .iter()
            .map(|m| ControlLine::direct(pubkey_b64, m.as_str()))
            .collect();
        if !dispatch.allow_chat {
            lines.push(ControlLine::ChatMute(pubkey_b64.to_string()));
        }
        self.write_all(lines).await;
    }
}

/// Supervises one child until it exits or the runner is told to stop.
async fn run(hs: HosterState, inst: Arc<Instance>, inbox: InstanceInbox, pipes: Pipes) {
    let InstanceInbox {
        mut commands,
        poke_requests,
        poke_cancels,
    } = inbox;
    let Pipes {
        stdin,
        stdout,
        stderr,
    } = pipes;
    let mut session = Session {
        hs: hs.clone(),
        inst: inst.clone(),
        stdin,
        pending: HashMap::new(),
        graphs: Vec::new(),
    };
    session.persist().await;

    let span = tracing::Span::current();
    let (exit_tx, exit) = ExitSignal::new();
    let (msg_tx, mut msg_rx) = mpsc::channel::<String>(msg_backlog());
    let (died_tx, mut died_rx) = oneshot::channel::<()>();
    let mut helpers: Vec<JoinHandle<()>> = Vec::new();

    match inst.pid() {
        Some(pid) => helpers.push(tokio::spawn(
            watch_pid(pid, died_tx, exit.clone()).instrument(span.clone()),
        )),
        None => {
            tracing::warn!("runner has no pid, treating the process as gone");
            let _ = died_tx.send(());
        }
    }
    helpers.push(tokio::spawn(
        poke::run(inst.clone(), poke_requests, poke_cancels, exit.clone()).instrument(span.clone()),
    ));
    if inst.origin == InstanceOrigin::Requested && inst.state.load() <= InstanceState::InLobby {
        helpers.push(tokio::spawn(
            requested_watchdog(hs.clone(), inst.clone(), exit.clone()).instrument(span.clone()),
        ));
    }
    helpers.push(tokio::spawn(
        read_stream("stdout", stdout, msg_tx.clone(), exit.clone()).instrument(span.clone()),
    ));
    helpers.push(tokio::spawn(
        read_stream("stderr", stderr, msg_tx, exit.clone()).instrument(span.clone()),
    ));

    let mut pid_failed = false;
    let mut shutdown_ordered = false;
    loop {
        if (pid_failed || shutdown_ordered) && msg_rx.is_empty() {
            break;
        }
        tokio::select! {
            _ = &mut died_rx, if !pid_failed => {
                tracing::info!("pid check failed, closing instance runtime");
                pid_failed = true;
            }
            Some(cmd) = commands.recv() => match cmd {
                InstanceCommand::None => {}
                InstanceCommand::Broadcast(text) => {
                    session.write(&ControlLine::broadcast(sanitize_broadcast(&text))).await;
                }
                InstanceCommand::Shutdown => {
                    tracing::info!("shutdown ordered");
                    session.write(&ControlLine::Shutdown).await;
                    shutdown_ordered = true;
                    inst.advance(InstanceState::Exiting);
                    session.persist().await;
                }
                InstanceCommand::RunnerStop => {
                    tracing::info!("runner stopping");
                    inst.advance(InstanceState::Exiting);
                    break;
                }
                InstanceCommand::Control(line) => session.write(&line).await,
            },
            Some(line) = msg_rx.recv() => session.handle_line(&line).await,
            else => break,
        }
    }

    tracing::info!("runner cleaning up");
    if shutdown_ordered && !pid_failed {
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut died_rx).await {
            Ok(_) => pid_failed = true,
            Err(_) => tracing::warn!("child still alive after shutdown grace"),
        }
    }
    drop(exit_tx);
    drop(msg_rx);
    let Session { stdin, graphs, .. } = session;
    drop(stdin);

    if !inst.recovered {
        if let Some(pid) = inst.pid() {
            match reap_nonblocking(pid) {
                Ok(true) => {}
                Ok(false) => tracing::debug!(pid, "child not reaped yet"),
                Err(err) => tracing::warn!(pid, %err, "failed to reap child"),
            }
        }
    }
    for h in helpers {
        if let Err(err) = h.await {
            tracing::warn!(%err, "runner helper failed");
        }
    }

    if !pid_failed && !shutdown_ordered {
        tracing::info!("runner exits without archival");
        inst.advance(InstanceState::Exited);
        hs.registry.remove(inst.id);
        return;
    }
    finish(&hs, &inst, graphs).await;
    inst.advance(InstanceState::Exited);
    hs.registry.remove(inst.id);
    tracing::info!("runner exits");
}

/// Replay, telemetry and directory archival after a normal exit.
pub(crate) async fn finish(hs: &HosterState, inst: &Instance, graphs: Vec<Value>) {
    match inst.game_id() {
        Some(game_id) => {
            match archive::find_replay(&inst.dir) {
                Some(path) => match tokio::fs::read(&path).await {
                    Ok(bytes) => {
                        if let Err(err) = hs.archive.store_replay(game_id, bytes).await {
                            hs.alert(format!("storing replay of game {game_id} failed: {err:#}"));
                        }
                    }
                    Err(err) => tracing::warn!(%err, path = %path.display(), "failed to read replay"),
                },
                None => tracing::warn!(game_id, "no replay found"),
            }
            if !graphs.is_empty() {
                if let Err(err) = hs.archive.store_graphs(game_id, graphs).await {
                    hs.alert(format!("storing graphs of game {game_id} failed: {err:#}"));
                }
            }
        }
        None if !graphs.is_empty() => {
            tracing::warn!(frames = graphs.len(), "graphs buffered without a game id, dropped");
        }
        None => {}
    }
    if let Err(err) = archive::archive_instance(inst.dir.clone(), hs.paths.archive_dir.clone(), inst.id).await {
        hs.alert(format!("instance {} failed to archive: {err:#}", inst.id));
    }
}
