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

//! `session.json` persistence (C8): atomic reads/writes of the durable
//! truth for a session, directory allocation, and the startup recovery
//! scan of §4.5.

use std::{
    fs,
    io::Write as _,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use nix::{sys::signal, unistd::Pid};
use tracing::{info, instrument, warn};
use vibetunnel_protocol::{SessionInfo, SessionStatus, EXIT_CODE_UNKNOWN};

/// Creates `<control_dir>/<id>`, failing if it already exists — this
/// directory creation is itself the "lock" of spec §4.4 startup step 2,
/// since `mkdir` is atomic.
pub fn allocate_session_dir(control_dir: &Path, id: &str) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(control_dir).context("creating control directory")?;
    let dir = control_dir.join(id);
    fs::create_dir(&dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            anyhow!("session directory for {id} already exists")
        } else {
            anyhow::Error::new(e).context("creating session directory")
        }
    })?;
    Ok(dir)
}

pub fn session_json_path(dir: &Path) -> PathBuf {
    dir.join("session.json")
}

/// Rewrites `session.json` via a temp file in the same directory plus a
/// rename, per §4.4's exit path and §4.2.1's truncator — the one atomic
/// replace idiom this codebase uses everywhere a file must never be
/// observed half-written.
#[instrument(skip(info))]
pub fn write_session_json(dir: &Path, info: &SessionInfo) -> anyhow::Result<()> {
    let path = session_json_path(dir);
    let mut tmp = tempfile::Builder::new()
        .prefix(".session-")
        .suffix(".json.tmp")
        .tempfile_in(dir)
        .context("creating session.json temp file")?;

    let body = serde_json::to_vec_pretty(info).context("encoding session.json")?;
    tmp.write_all(&body).context("writing session.json temp file")?;
    tmp.flush().ok();

    let perms = fs::Permissions::from_mode(0o644);
    fs::set_permissions(tmp.path(), perms).context("setting session.json permissions")?;

    tmp.persist(&path).map_err(|e| anyhow!("renaming session.json into place: {}", e.error))?;
    Ok(())
}

pub fn read_session_json(dir: &Path) -> anyhow::Result<SessionInfo> {
    let path = session_json_path(dir);
    let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&body).with_context(|| format!("parsing {}", path.display()))
}

/// Existence-only liveness probe (`kill(pid, 0)`): true if the process
/// exists and we may plausibly signal it (ESRCH means dead; EPERM still
/// means it's alive, just owned by someone else).
pub fn pid_is_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub struct RecoveryReport {
    pub kept: Vec<SessionInfo>,
    pub reaped: Vec<String>,
    pub deleted_invalid: Vec<String>,
}

/// §4.5 startup recovery: runs once, before the manager accepts any
/// client. For every directory under `control_dir`: delete it if
/// `session.json` is missing/invalid; otherwise, if its forwarder PID is
/// no longer alive, mark it `exited` with an unknown exit code and strip
/// the now-stale `ipc.sock`/`stdin`.
#[instrument(skip_all)]
pub fn recover_control_dir(control_dir: &Path) -> anyhow::Result<RecoveryReport> {
    let mut report = RecoveryReport { kept: Vec::new(), reaped: Vec::new(), deleted_invalid: Vec::new() };

    let entries = match fs::read_dir(control_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e).context("listing control directory"),
    };

    for entry in entries {
        let entry = entry.context("reading control directory entry")?;
        if !entry.file_type().context("stat'ing control directory entry")?.is_dir() {
            continue;
        }
        let dir = entry.path();
        let id = entry.file_name().to_string_lossy().into_owned();

        let info = match read_session_json(&dir) {
            Ok(info) => info,
            Err(e) => {
                warn!("deleting {}: invalid session.json: {:?}", dir.display(), e);
                fs::remove_dir_all(&dir).ok();
                report.deleted_invalid.push(id);
                continue;
            }
        };

        if info.status == SessionStatus::Exited {
            report.kept.push(info);
            continue;
        }

        if pid_is_alive(info.forwarder_pid) {
            info!("session {} forwarder pid {} still alive", id, info.forwarder_pid);
            report.kept.push(info);
            continue;
        }

        warn!("reaping orphaned session {}: forwarder pid {} is dead", id, info.forwarder_pid);
        let mut info = info;
        info.status = SessionStatus::Exited;
        info.exit_code.get_or_insert(EXIT_CODE_UNKNOWN);
        write_session_json(&dir, &info)?;

        for stale in ["ipc.sock", "stdin"] {
            let p = dir.join(stale);
            if p.exists() {
                fs::remove_file(&p).ok();
            }
        }

        report.reaped.push(id);
        report.kept.push(info);
    }

    Ok(report)
}

/// Removes a top-level socket left behind by a previous, now-dead
/// process, so a fresh `bind` doesn't fail with `AddrInUse`. Callers are
/// expected to have already confirmed no live process owns it (manager
/// startup runs this before recovery binds anything).
pub fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing stale socket {}", path.display())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn sample_info(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            command: vec!["/bin/sh".to_string()],
            cwd: "/tmp".to_string(),
            env: Vec::new(),
            cols: 80,
            rows: 24,
            title: None,
            created_at: "2026-07-27T00:00:00Z".to_string(),
            forwarder_pid: std::process::id() as i32,
            child_pid: 0,
            status: SessionStatus::Running,
            exit_code: None,
            exited_at: None,
            truncation_epoch: 0,
        }
    }

    #[test]
    fn write_then_read_round_trips() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let info = sample_info("abc123");
        write_session_json(dir.path(), &info)?;
        let got = read_session_json(dir.path())?;
        assert_eq!(got.id, info.id);
        assert_eq!(got.status, SessionStatus::Running);
        Ok(())
    }

    #[test]
    fn allocate_session_dir_fails_on_collision() -> anyhow::Result<()> {
        let root = tempdir()?;
        allocate_session_dir(root.path(), "dup")?;
        assert!(allocate_session_dir(root.path(), "dup").is_err());
        Ok(())
    }

    #[test]
    fn recovery_deletes_invalid_and_keeps_exited() -> anyhow::Result<()> {
        let root = tempdir()?;

        fs::create_dir(root.path().join("garbage"))?;

        let mut exited = sample_info("already-exited");
        exited.status = SessionStatus::Exited;
        exited.exit_code = Some(0);
        let exited_dir = root.path().join("already-exited");
        fs::create_dir(&exited_dir)?;
        write_session_json(&exited_dir, &exited)?;

        let mut dead = sample_info("dead-forwarder");
        dead.forwarder_pid = i32::MAX - 1; // implausible pid, assumed dead
        let dead_dir = root.path().join("dead-forwarder");
        fs::create_dir(&dead_dir)?;
        write_session_json(&dead_dir, &dead)?;
        fs::write(dead_dir.join("ipc.sock"), b"")?;

        let report = recover_control_dir(root.path())?;

        assert_eq!(report.deleted_invalid, vec!["garbage".to_string()]);
        assert!(report.reaped.contains(&"dead-forwarder".to_string()));
        assert!(!dead_dir.join("ipc.sock").exists());

        let reread = read_session_json(&dead_dir)?;
        assert_eq!(reread.status, SessionStatus::Exited);
        assert_eq!(reread.exit_code, Some(EXIT_CODE_UNKNOWN));

        Ok(())
    }
}
