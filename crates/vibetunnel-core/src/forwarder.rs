// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The session forwarder (C4): owns one PTY for the lifetime of the
//! process, serves `ipc.sock`, and runs the exit path. One OS process per
//! session (§10.3.1): the session manager launches this by re-executing
//! the current binary with `consts::FORWARDER_REEXEC_VAR` set, the same
//! self-reinvocation trick used for autodaemonization.

use std::{
    io::{ErrorKind, Read, Write},
    os::{
        fd::AsRawFd,
        unix::{fs::PermissionsExt, net::UnixListener},
    },
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use nix::{sys::signal, unistd::Pid};
use tracing::{error, info, instrument, span, warn, Level};
use vibetunnel_protocol::{
    ControlCmd, ErrorPayload, FrameKind, SessionInfo, SessionMonitorKind, SessionMonitorNotification,
    SessionStatus, StatusUpdate, EXIT_CODE_SPAWN_FAILED,
};

use crate::{
    activity::{ActivityDetector, ActivityEvent},
    cast::{self, CastWriter},
    codec::{read_frame, write_frame, FrameDecoder, OwnedFrame, ProtocolError},
    config::Config,
    consts,
    exit_notify::ExitNotifier,
    fanout::FanOut,
    session,
    tty,
};

/// Everything the manager hands a freshly re-exec'd forwarder process.
#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct ForwarderArgs {
    pub session_id: String,
    pub argv: Vec<String>,
    pub cwd: String,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub display_name: Option<String>,
}

/// Best-effort broadcast of `SESSION_INFO`/control-plane frames to every
/// connected `ipc.sock` client. Unlike the fan-out's ring buffers, these
/// are rare and small, so an unbounded channel per subscriber is fine —
/// a dead connection is pruned the next time its outbound pump notices
/// the send side has nobody left to read it.
struct ControlBus {
    subs: Mutex<Vec<(u64, crossbeam_channel::Sender<OwnedFrame>)>>,
    next_id: AtomicU64,
}

impl ControlBus {
    fn new() -> Self {
        ControlBus { subs: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    fn subscribe(&self) -> (u64, crossbeam_channel::Receiver<OwnedFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subs.lock().unwrap().push((id, tx));
        (id, rx)
    }

    fn unsubscribe(&self, id: u64) {
        self.subs.lock().unwrap().retain(|(sid, _)| *sid != id);
    }

    fn publish(&self, frame: OwnedFrame) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|(_, tx)| tx.send(OwnedFrame::new(frame.kind, frame.payload.clone())).is_ok());
    }
}

struct Forwarder {
    dir: PathBuf,
    session_id: String,
    fanout: FanOut,
    control_bus: ControlBus,
    info: Mutex<SessionInfo>,
    activity: Mutex<ActivityDetector>,
    pty_writer: Mutex<shpool_pty::fork::Master>,
    child_pid: i32,
    exit_notifier: Arc<ExitNotifier>,
    config: Config,
    last_claude_turn: Mutex<Option<Instant>>,
}

impl Forwarder {
    fn publish_info(&self) -> anyhow::Result<()> {
        let info = {
            let mut info = self.info.lock().unwrap();
            info.truncation_epoch = self.fanout.truncation_epoch();
            info.clone()
        };
        session::write_session_json(&self.dir, &info)?;
        let payload = serde_json::to_vec(&info)?;
        self.control_bus.publish(OwnedFrame::new(FrameKind::SessionInfo, payload));
        Ok(())
    }

    /// §4.7: replays `[last_offset..eof)` of the cast file over this
    /// connection if `last_epoch` still matches, then reports the
    /// outcome as a `Resynced` control frame.
    fn handle_resync(
        &self,
        reply_to: &mut std::os::unix::net::UnixStream,
        last_offset: u64,
        last_epoch: u64,
    ) -> anyhow::Result<()> {
        let resynced = self.fanout.resync(last_offset, last_epoch);
        if resynced.from > 0 {
            let tail = cast::read_output_tail(&self.dir.join("stdout"), resynced.from)?;
            if !tail.is_empty() {
                write_frame(reply_to, FrameKind::StdoutData, &tail)?;
            }
        }
        let body = serde_json::to_vec(&resynced)?;
        write_frame(reply_to, FrameKind::ControlCmd, &body)?;
        Ok(())
    }

    fn notify(&self, kind: SessionMonitorKind, message: impl Into<String>) {
        let notif = SessionMonitorNotification {
            kind,
            session_id: self.session_id.clone(),
            message: message.into(),
            metadata: None,
        };
        let cmd = ControlCmd::SessionMonitor(notif);
        if let Ok(payload) = serde_json::to_vec(&cmd) {
            self.control_bus.publish(OwnedFrame::new(FrameKind::ControlCmd, payload));
        }
    }

    /// Fires a `claude-turn` notification, suppressing repeats that land
    /// inside `config.claude_turn_debounce` of the last one (§9).
    fn notify_claude_turn(&self) {
        let mut last = self.last_claude_turn.lock().unwrap();
        let now = Instant::now();
        if last.is_some_and(|t| now.duration_since(t) < self.config.claude_turn_debounce) {
            return;
        }
        *last = Some(now);
        drop(last);
        self.notify(SessionMonitorKind::ClaudeTurn, "prompt detected");
    }

    fn apply_resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let size = tty::Size { rows, cols };
        let raw_fd = self.pty_writer.lock().unwrap().raw_fd().ok_or_else(|| anyhow!("no pty master fd"))?;
        size.set_fd(raw_fd).context("resizing pty")?;
        self.fanout.record_resize(cols, rows)?;
        {
            let mut info = self.info.lock().unwrap();
            info.cols = cols;
            info.rows = rows;
        }
        self.publish_info()
    }

    fn handle_control_cmd(&self, cmd: ControlCmd) -> anyhow::Result<()> {
        match cmd {
            ControlCmd::Resize { cols, rows } => self.apply_resize(cols, rows),
            ControlCmd::Kill { signal } => {
                let sig = parse_signal(signal.as_deref())?;
                signal::kill(Pid::from_raw(self.child_pid), sig).context("sending kill signal")?;
                Ok(())
            }
            ControlCmd::ResetSize => {
                let (cols, rows) = {
                    let info = self.info.lock().unwrap();
                    (info.cols, info.rows)
                };
                self.apply_resize(cols, rows)
            }
            ControlCmd::UpdateTitle { title } => {
                {
                    let mut info = self.info.lock().unwrap();
                    info.title = Some(title);
                }
                self.publish_info()
            }
            ControlCmd::SessionMonitor(_) => {
                Err(anyhow::anyhow!("session-monitor is forwarder-originated, not a client command"))
            }
            ControlCmd::Resync { .. } => {
                Err(anyhow::anyhow!("resync must be dispatched via handle_resync, not handle_control_cmd"))
            }
        }
    }

    fn write_pty_input(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.fanout.record_input(bytes)?;
        let mut master = self.pty_writer.lock().unwrap();
        master.write_all(bytes).context("writing to pty")?;
        Ok(())
    }
}

fn parse_signal(name: Option<&str>) -> anyhow::Result<signal::Signal> {
    match name {
        None => Ok(signal::Signal::SIGTERM),
        Some(s) => {
            let normalized = s.trim_start_matches("SIG").to_uppercase();
            format!("SIG{normalized}")
                .parse::<signal::Signal>()
                .map_err(|_| anyhow!("unknown signal {s:?}"))
        }
    }
}

/// Entry point for a process that was re-exec'd with
/// `consts::FORWARDER_REEXEC_VAR` set to a spec file path: loads the
/// `ForwarderArgs` the manager wrote there, removes the file (it's
/// single-use), then runs the forwarder proper.
pub fn run_from_reexec(config: &Config, spec_path: &Path) -> anyhow::Result<i32> {
    let body = std::fs::read(spec_path).context("reading forwarder spec file")?;
    let args: ForwarderArgs = serde_json::from_slice(&body).context("parsing forwarder spec file")?;
    std::fs::remove_file(spec_path).ok();
    run_forwarder(config, args)
}

/// Runs a forwarder to completion: spawn, serve, exit. Returns the
/// process exit code the caller (`main`) should use (always 0 on a
/// reached exit path, per §4.4 step 7 — failures are recorded in
/// `session.json`, not surfaced as a nonzero forwarder exit).
#[instrument(skip(config, args), fields(session = %args.session_id))]
pub fn run_forwarder(config: &Config, args: ForwarderArgs) -> anyhow::Result<i32> {
    let dir = session::allocate_session_dir(&config.control_dir(), &args.session_id)?;

    let mut info = SessionInfo {
        id: args.session_id.clone(),
        command: args.argv.clone(),
        cwd: args.cwd.clone(),
        env: args.env.clone(),
        cols: args.cols,
        rows: args.rows,
        title: args.display_name.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
        forwarder_pid: process::id() as i32,
        child_pid: 0,
        status: SessionStatus::Starting,
        exit_code: None,
        exited_at: None,
        truncation_epoch: 0,
    };
    session::write_session_json(&dir, &info)?;

    let spawn_result = spawn_pty(&args);
    let (fork, child_pid) = match spawn_result {
        Ok(v) => v,
        Err(e) => {
            warn!("pty spawn failed: {:?}", e);
            info.status = SessionStatus::Exited;
            info.exit_code = Some(EXIT_CODE_SPAWN_FAILED);
            info.exited_at = Some(chrono::Utc::now().to_rfc3339());
            session::write_session_json(&dir, &info)?;
            return Ok(0);
        }
    };
    info.child_pid = child_pid;

    let master = fork.is_parent().context("internal error: forwarder running in pty child branch")?;
    tty::Size { rows: args.rows, cols: args.cols }
        .set_fd(master.raw_fd().ok_or_else(|| anyhow!("no pty master fd"))?)
        .context("setting initial pty size")?;

    let cast_header = vibetunnel_protocol::CastHeader {
        version: 2,
        width: args.cols,
        height: args.rows,
        timestamp: crate::cast::unix_timestamp(),
        command: Some(args.argv.join(" ")),
        title: args.display_name.clone(),
        env: None,
    };
    let cast = CastWriter::create(
        dir.join("stdout"),
        cast_header,
        config.max_cast_size,
        config.cast_check_interval,
        config.trunc_target_pct,
    )
    .context("creating cast writer")?;
    let fanout = FanOut::new(cast);

    let stdin_path = dir.join("stdin");
    nix::unistd::mkfifo(&stdin_path, nix::sys::stat::Mode::from_bits_truncate(0o600))
        .context("creating stdin fifo")?;

    let ipc_path = dir.join("ipc.sock");
    let listener = UnixListener::bind(&ipc_path).context("binding ipc.sock")?;
    std::fs::set_permissions(&ipc_path, std::fs::Permissions::from_mode(0o755))
        .context("setting ipc.sock permissions")?;

    info.status = SessionStatus::Running;
    session::write_session_json(&dir, &info)?;

    let exit_notifier = Arc::new(ExitNotifier::new());
    spawn_child_watcher(child_pid, Arc::clone(&exit_notifier));

    let fwd = Arc::new(Forwarder {
        dir: dir.clone(),
        session_id: args.session_id.clone(),
        fanout,
        control_bus: ControlBus::new(),
        info: Mutex::new(info),
        activity: Mutex::new(ActivityDetector::new(consts::DEFAULT_ACTIVITY_IDLE_THRESHOLD)),
        pty_writer: Mutex::new(master),
        child_pid,
        exit_notifier: Arc::clone(&exit_notifier),
        config: config.clone(),
        last_claude_turn: Mutex::new(None),
    });

    fwd.notify(SessionMonitorKind::SessionStart, "session started");

    let stop = Arc::new(AtomicBool::new(false));

    spawn_pty_reader(Arc::clone(&fwd), master, Arc::clone(&stop));
    spawn_stdin_fifo_reader(Arc::clone(&fwd), stdin_path.clone(), Arc::clone(&stop));
    spawn_accept_loop(Arc::clone(&fwd), listener, Arc::clone(&stop));

    let status = exit_notifier.wait(None);
    stop.store(true, Ordering::SeqCst);

    run_exit_path(&fwd, status)?;
    Ok(0)
}

fn spawn_pty(args: &ForwarderArgs) -> anyhow::Result<(shpool_pty::fork::Fork, i32)> {
    if args.argv.is_empty() {
        return Err(anyhow!("empty argv"));
    }

    let mut cmd = process::Command::new(&args.argv[0]);
    cmd.args(&args.argv[1..]);
    cmd.current_dir(&args.cwd);
    cmd.env_clear();
    cmd.envs(args.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    cmd.stdin(process::Stdio::inherit()).stdout(process::Stdio::inherit()).stderr(process::Stdio::inherit());

    let mut fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty")?;
    if fork.is_child().is_ok() {
        // Safety: basic libc plumbing; the exec below never returns on success.
        use std::os::unix::process::CommandExt;
        let err = cmd.exec();
        eprintln!("forwarder: exec failed: {err:?}");
        process::exit(1);
    }

    let child_pid = fork.child_pid().ok_or_else(|| anyhow!("missing child pid after fork"))?;
    Ok((fork, child_pid))
}

fn spawn_child_watcher(child_pid: i32, exit_notifier: Arc<ExitNotifier>) {
    thread::spawn(move || {
        let _s = span!(Level::INFO, "child_watcher", pid = child_pid).entered();
        let mut status: i32 = 0;
        loop {
            // Safety: `child_pid` is a valid pid owned by this process's fork.
            let rc = unsafe { libc::waitpid(child_pid, &mut status, 0) };
            match rc {
                0 => continue,
                -1 => {
                    warn!("waitpid failed, assuming exit code 1");
                    exit_notifier.notify_exit(1);
                    return;
                }
                _ => break,
            }
        }
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            1
        };
        info!("child exited with code {}", code);
        exit_notifier.notify_exit(code);
    });
}

fn spawn_pty_reader(fwd: Arc<Forwarder>, mut master: shpool_pty::fork::Master, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        let _s = span!(Level::INFO, "pty_reader").entered();
        let mut buf = [0u8; consts::BUF_SIZE];
        let mut last_epoch = fwd.fanout.truncation_epoch();
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            match master.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    let chunk = &buf[..n];
                    if let Err(e) = fwd.fanout.publish(chunk) {
                        error!("fan-out publish failed: {:?}", e);
                    }
                    let events = fwd.activity.lock().unwrap().inspect(chunk);
                    dispatch_activity_events(&fwd, events);

                    // The background truncator runs on its own thread
                    // (cast.rs); notice its epoch bump here so session.json
                    // and session-info subscribers learn about it promptly.
                    let epoch = fwd.fanout.truncation_epoch();
                    if epoch != last_epoch {
                        last_epoch = epoch;
                        if let Err(e) = fwd.publish_info() {
                            error!("publishing session info after truncation failed: {:?}", e);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    });
}

fn dispatch_activity_events(fwd: &Arc<Forwarder>, events: Vec<ActivityEvent>) {
    for event in events {
        match event {
            ActivityEvent::Bell => fwd.notify(SessionMonitorKind::Bell, "bell"),
            ActivityEvent::Prompt => {
                // A prompt reappearing after busy output is this core's
                // heuristic for a completed turn; §9 leaves the exact
                // signal implementation-defined.
                fwd.notify_claude_turn();
            }
            ActivityEvent::Idle | ActivityEvent::Busy => {}
        }
    }
}

fn spawn_stdin_fifo_reader(fwd: Arc<Forwarder>, path: PathBuf, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        let _s = span!(Level::INFO, "stdin_fifo_reader").entered();
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let mut fifo = match std::fs::OpenOptions::new().read(true).open(&path) {
                Ok(f) => f,
                Err(_) => return,
            };
            let mut buf = [0u8; consts::BUF_SIZE];
            loop {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                match fifo.read(&mut buf) {
                    Ok(0) => break, // writer closed; reopen to wait for the next one
                    Ok(n) => {
                        if let Err(e) = fwd.write_pty_input(&buf[..n]) {
                            error!("writing fifo input to pty failed: {:?}", e);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => return,
                }
            }
        }
    });
}

fn spawn_accept_loop(fwd: Arc<Forwarder>, listener: UnixListener, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        let _s = span!(Level::INFO, "ipc_accept_loop").entered();
        let mut backoff = consts::ACCEPT_RETRY_MIN;
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    backoff = consts::ACCEPT_RETRY_MIN;
                    let fwd = Arc::clone(&fwd);
                    let stop = Arc::clone(&stop);
                    thread::spawn(move || serve_ipc_connection(fwd, stream, stop));
                }
                Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::InvalidInput => {
                    warn!("ipc.sock accept unrecoverable: {:?}", e);
                    return;
                }
                Err(e) => {
                    warn!("ipc.sock accept transient error, retrying in {:?}: {:?}", backoff, e);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(consts::ACCEPT_RETRY_MAX);
                }
            }
        }
    });
}

fn serve_ipc_connection(fwd: Arc<Forwarder>, stream: std::os::unix::net::UnixStream, stop: Arc<AtomicBool>) {
    let _s = span!(Level::INFO, "ipc_connection", fd = stream.as_raw_fd()).entered();

    let outbound_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("cloning ipc connection handle failed: {:?}", e);
            return;
        }
    };

    let (control_id, control_rx) = fwd.control_bus.subscribe();
    let subscription = fwd.fanout.subscribe();
    let stop_outbound = Arc::clone(&stop);

    let outbound = thread::spawn(move || {
        run_outbound_pump(outbound_stream, subscription, control_rx, stop_outbound);
    });

    run_inbound_pump(&fwd, stream, &stop);

    fwd.control_bus.unsubscribe(control_id);
    let _ = outbound.join();
}

fn run_inbound_pump(fwd: &Arc<Forwarder>, mut stream: std::os::unix::net::UnixStream, stop: &AtomicBool) {
    let mut decoder = FrameDecoder::default();
    let mut buf = [0u8; consts::BUF_SIZE];

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => decoder.feed(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = handle_inbound_frame(fwd, &mut stream, frame) {
                        warn!("handling inbound frame failed: {:?}", e);
                    }
                }
                Ok(None) => break,
                Err(ProtocolError::UnknownType(code)) => {
                    warn!("ipc.sock: unknown frame type {:#x}, ignoring", code);
                    break;
                }
                Err(e) => {
                    warn!("ipc.sock frame decode error: {:?}", e);
                    return;
                }
            }
        }
    }
}

fn handle_inbound_frame(
    fwd: &Arc<Forwarder>,
    reply_to: &mut std::os::unix::net::UnixStream,
    frame: OwnedFrame,
) -> anyhow::Result<()> {
    match frame.kind {
        FrameKind::StdinData => fwd.write_pty_input(&frame.payload),
        FrameKind::ControlCmd => match serde_json::from_slice::<ControlCmd>(&frame.payload) {
            Ok(ControlCmd::Resync { last_offset, last_epoch }) => {
                fwd.handle_resync(reply_to, last_offset, last_epoch)
            }
            Ok(cmd) => fwd.handle_control_cmd(cmd),
            Err(e) => {
                let err = ErrorPayload::bad_command(e.to_string());
                let body = serde_json::to_vec(&err)?;
                write_frame(reply_to, FrameKind::Error, &body)?;
                Ok(())
            }
        },
        FrameKind::Heartbeat => write_frame(reply_to, FrameKind::Heartbeat, &[]).map_err(Into::into),
        FrameKind::StatusRequest => {
            let status = fwd.info.lock().unwrap().status;
            let update = StatusUpdate { app: "vibetunnel".to_string(), status: status.to_string(), extra: None };
            let body = serde_json::to_vec(&update)?;
            write_frame(reply_to, FrameKind::StatusUpdate, &body).map_err(Into::into)
        }
        FrameKind::GitFollowRequest | FrameKind::GitEventNotify => {
            // Opaque to the core (§6): no action defined here, collaborator-owned.
            Ok(())
        }
        other => {
            warn!("ipc.sock: unexpected frame kind {} from client, ignoring", other);
            Ok(())
        }
    }
}

fn run_outbound_pump(
    mut stream: std::os::unix::net::UnixStream,
    subscription: crate::fanout::Subscription,
    control_rx: crossbeam_channel::Receiver<OwnedFrame>,
    stop: Arc<AtomicBool>,
) {
    // The fan-out subscription blocks on its own condvar rather than a
    // channel, so pump it from a helper thread and fold its output into
    // the same `select!` as the control bus.
    let (tx, rx) = crossbeam_channel::bounded::<(u64, Vec<u8>, bool)>(1);
    let fanout_pump = thread::spawn(move || {
        while let Some(item) = subscription.recv() {
            if tx.send(item).is_err() {
                return;
            }
        }
    });

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        crossbeam_channel::select! {
            recv(rx) -> msg => match msg {
                Ok((_offset, data, _was_lagging)) => {
                    if write_frame(&mut stream, FrameKind::StdoutData, &data).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(control_rx) -> msg => match msg {
                Ok(frame) => {
                    if write_frame(&mut stream, frame.kind, &frame.payload).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            default(Duration::from_millis(500)) => {}
        }
    }

    let _ = fanout_pump.join();
}

/// §4.4's exit path, steps 2 through 6 (step 1, "PTY EOF or child reaped",
/// already happened by the time the exit notifier fires; step 7, process
/// exit, is the caller's job).
fn run_exit_path(fwd: &Arc<Forwarder>, exit_code: Option<i32>) -> anyhow::Result<()> {
    let exit_code = exit_code.unwrap_or(vibetunnel_protocol::EXIT_CODE_UNKNOWN);

    {
        let mut info = fwd.info.lock().unwrap();
        info.status = SessionStatus::Exited;
        info.exit_code = Some(exit_code);
        info.exited_at = Some(chrono::Utc::now().to_rfc3339());
    }
    fwd.publish_info()?;

    let exit_line = serde_json::to_string(&serde_json::json!({
        "exit_code": exit_code,
        "exited_at": fwd.info.lock().unwrap().exited_at,
    }))?;
    fwd.fanout.append_raw_line(exit_line).ok();

    fwd.notify(SessionMonitorKind::SessionExit, format!("exited with code {exit_code}"));

    remove_if_exists(&fwd.dir.join("ipc.sock"));
    remove_if_exists(&fwd.dir.join("stdin"));

    info!("forwarder exit path complete for session {}", fwd.session_id);
    Ok(())
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("removing {}: {:?}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_signal_defaults_to_sigterm() {
        assert_eq!(parse_signal(None).unwrap(), signal::Signal::SIGTERM);
    }

    #[test]
    fn parse_signal_accepts_bare_and_sig_prefixed_names() {
        assert_eq!(parse_signal(Some("KILL")).unwrap(), signal::Signal::SIGKILL);
        assert_eq!(parse_signal(Some("SIGKILL")).unwrap(), signal::Signal::SIGKILL);
    }

    #[test]
    fn parse_signal_rejects_unknown_names() {
        assert!(parse_signal(Some("NOTASIGNAL")).is_err());
    }
}
