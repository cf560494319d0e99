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

//! The session manager (C5): Create/List/Get/Kill/Cleanup plus the
//! startup recovery scan of §4.5. There is no in-process
//! `shells: HashMap<String, Box<Session>>` table, every session is a
//! separate OS process, so the manager's only durable state is the
//! filesystem under `<root>/control/`.

use std::{
    fs,
    os::unix::net::UnixStream,
    path::Path,
    process,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use tracing::{instrument, warn};
use vibetunnel_protocol::{ControlCmd, FrameKind, SessionInfo, SessionSpec, SessionStatus, EXIT_CODE_UNKNOWN};

use crate::{
    codec::write_frame,
    config::Config,
    consts,
    forwarder::ForwarderArgs,
    session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    AlreadyExited,
    NotFound,
}

pub struct SessionManager {
    config: Config,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        SessionManager { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// §4.5 startup recovery, plus removing stale top-level sockets — run
    /// once, before either server starts accepting clients.
    #[instrument(skip(self))]
    pub fn run_startup_recovery(&self) -> anyhow::Result<session::RecoveryReport> {
        fs::create_dir_all(self.config.control_dir()).context("creating control directory")?;
        session::remove_stale_socket(&self.config.api_sock())?;
        session::remove_stale_socket(&self.config.control_sock())?;
        session::recover_control_dir(&self.config.control_dir())
    }

    #[instrument(skip(self, spec))]
    pub fn create(&self, spec: SessionSpec) -> anyhow::Result<SessionInfo> {
        if spec.argv.is_empty() {
            return Err(anyhow!("argv must not be empty"));
        }
        if let Some(cwd) = &spec.cwd {
            if !Path::new(cwd).is_dir() {
                return Err(anyhow!("cwd {cwd:?} does not exist"));
            }
        }

        let id = match &spec.id {
            Some(id) => {
                if self.config.session_dir(id).exists() {
                    return Err(anyhow!("session {id} already exists"));
                }
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let args = ForwarderArgs {
            session_id: id.clone(),
            argv: spec.argv,
            cwd: spec.cwd.unwrap_or_else(|| "/".to_string()),
            env: spec.env,
            cols: spec.cols,
            rows: spec.rows,
            display_name: spec.display_name,
        };

        spawn_forwarder(&self.config, &args)?;
        self.wait_for_startup(&id)
    }

    /// Reads every `<root>/control/*/session.json`, skipping entries that
    /// fail to parse (they're someone else's malformed leftovers, not this
    /// call's problem — `run_startup_recovery` is what cleans those up).
    pub fn list(&self) -> anyhow::Result<Vec<SessionInfo>> {
        let dir = self.config.control_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("listing control directory"),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.context("reading control directory entry")?;
            if !entry.file_type().context("stat'ing control directory entry")?.is_dir() {
                continue;
            }
            match session::read_session_json(&entry.path()) {
                Ok(info) => out.push(info),
                Err(e) => warn!("skipping malformed session at {}: {:?}", entry.path().display(), e),
            }
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<SessionInfo>> {
        let dir = self.config.session_dir(id);
        if !dir.is_dir() {
            return Ok(None);
        }
        match session::read_session_json(&dir) {
            Ok(info) => Ok(Some(info)),
            Err(_) => Ok(None),
        }
    }

    /// Forwards `CONTROL_CMD{kill}` over `ipc.sock`. If the socket is
    /// gone — the forwarder crashed without a chance to clean up and
    /// startup recovery hasn't run since — marks the session `exited`
    /// directly, mirroring §4.5's recovery step. Idempotent per §8: a
    /// second `Kill` on an already-exited session returns `AlreadyExited`
    /// rather than an error.
    #[instrument(skip(self))]
    pub fn kill(&self, id: &str, signal: Option<String>) -> anyhow::Result<KillOutcome> {
        let dir = self.config.session_dir(id);
        let mut info = match session::read_session_json(&dir) {
            Ok(info) => info,
            Err(_) => return Ok(KillOutcome::NotFound),
        };

        if info.status == SessionStatus::Exited {
            return Ok(KillOutcome::AlreadyExited);
        }

        let ipc_path = dir.join("ipc.sock");
        match UnixStream::connect(&ipc_path) {
            Ok(mut stream) => {
                let cmd = ControlCmd::Kill { signal };
                let body = serde_json::to_vec(&cmd).context("encoding kill command")?;
                write_frame(&mut stream, FrameKind::ControlCmd, &body).context("sending kill command")?;
                Ok(KillOutcome::Killed)
            }
            Err(_) => {
                warn!("session {} has no live ipc.sock; marking exited directly", id);
                info.status = SessionStatus::Exited;
                info.exit_code.get_or_insert(EXIT_CODE_UNKNOWN);
                info.exited_at.get_or_insert_with(|| chrono::Utc::now().to_rfc3339());
                session::write_session_json(&dir, &info)?;
                Ok(KillOutcome::AlreadyExited)
            }
        }
    }

    /// Deletes session directories that are `exited` and have been for at
    /// least `retention`. Returns the number removed.
    #[instrument(skip(self))]
    pub fn cleanup(&self, retention: Duration) -> anyhow::Result<usize> {
        let now = chrono::Utc::now();
        let mut removed = 0;

        for info in self.list()? {
            if info.status != SessionStatus::Exited {
                continue;
            }
            let Some(exited_at) = &info.exited_at else { continue };
            let Ok(exited_at) = chrono::DateTime::parse_from_rfc3339(exited_at) else { continue };
            let age = now.signed_duration_since(exited_at.with_timezone(&chrono::Utc));
            if age.to_std().unwrap_or(Duration::ZERO) >= retention {
                let dir = self.config.session_dir(&info.id);
                fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Polls `session.json` until it leaves `starting`, the same
    /// exponential-backoff-until-ready shape used elsewhere to wait for a
    /// freshly autodaemonized process's control socket to come up.
    fn wait_for_startup(&self, id: &str) -> anyhow::Result<SessionInfo> {
        let dir = self.config.session_dir(id);
        let deadline = Instant::now() + consts::SPAWN_READY_TIMEOUT;
        let mut sleep_ms = 10;
        loop {
            if let Ok(info) = session::read_session_json(&dir) {
                if info.status != SessionStatus::Starting {
                    return Ok(info);
                }
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("session {id} did not come up within {:?}", consts::SPAWN_READY_TIMEOUT));
            }
            thread::sleep(Duration::from_millis(sleep_ms));
            sleep_ms = (sleep_ms * 2).min(500);
        }
    }
}

/// Writes the forwarder's args to a one-shot spec file under the session
/// root, then re-execs the current binary with
/// `consts::FORWARDER_REEXEC_VAR` pointing at it — the manager's process
/// never shares memory with the forwarder it spawns.
fn spawn_forwarder(config: &Config, args: &ForwarderArgs) -> anyhow::Result<()> {
    fs::create_dir_all(&config.root).context("creating session root")?;

    let mut spec_file = tempfile::Builder::new()
        .prefix(".forwarder-spec-")
        .suffix(".json")
        .tempfile_in(&config.root)
        .context("creating forwarder spec file")?;
    serde_json::to_writer(&mut spec_file, args).context("encoding forwarder spec")?;
    let (_file, spec_path) =
        spec_file.keep().map_err(|e| anyhow!("persisting forwarder spec file: {}", e.error))?;

    let exe = std::env::current_exe().context("resolving current executable")?;
    let spawn_result = process::Command::new(&exe)
        .env(consts::FORWARDER_REEXEC_VAR, &spec_path)
        .stdin(process::Stdio::null())
        .stdout(process::Stdio::null())
        .stderr(process::Stdio::null())
        .spawn();

    match spawn_result {
        Ok(_child) => Ok(()),
        Err(e) => {
            fs::remove_file(&spec_path).ok();
            Err(e).context("spawning forwarder process")
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn test_config(root: &Path) -> Config {
        Config {
            root: root.to_path_buf(),
            max_cast_size: consts::DEFAULT_MAX_CAST_SIZE,
            cast_check_interval: consts::DEFAULT_CAST_CHECK_INTERVAL,
            trunc_target_pct: consts::DEFAULT_TRUNC_TARGET_PCT,
            heartbeat_interval: consts::DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_misses: consts::DEFAULT_HEARTBEAT_MISSES,
            claude_turn_debounce: consts::DEFAULT_CLAUDE_TURN_DEBOUNCE,
        }
    }

    fn sample_info(id: &str, status: SessionStatus) -> SessionInfo {
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
            status,
            exit_code: None,
            exited_at: None,
            truncation_epoch: 0,
        }
    }

    #[test]
    fn create_rejects_empty_argv() {
        let root = tempdir().unwrap();
        let manager = SessionManager::new(test_config(root.path()));
        let spec = SessionSpec { argv: vec![], cwd: None, env: Vec::new(), cols: 80, rows: 24, display_name: None, id: None };
        assert!(manager.create(spec).is_err());
    }

    #[test]
    fn create_rejects_missing_cwd() {
        let root = tempdir().unwrap();
        let manager = SessionManager::new(test_config(root.path()));
        let spec = SessionSpec {
            argv: vec!["/bin/sh".to_string()],
            cwd: Some("/definitely/not/a/real/path".to_string()),
            env: Vec::new(),
            cols: 80,
            rows: 24,
            display_name: None,
            id: None,
        };
        assert!(manager.create(spec).is_err());
    }

    #[test]
    fn list_and_get_reflect_filesystem_state() {
        let root = tempdir().unwrap();
        let config = test_config(root.path());
        let manager = SessionManager::new(config.clone());

        let dir = config.session_dir("abc");
        fs::create_dir_all(&dir).unwrap();
        session::write_session_json(&dir, &sample_info("abc", SessionStatus::Running)).unwrap();

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "abc");

        assert!(manager.get("abc").unwrap().is_some());
        assert!(manager.get("does-not-exist").unwrap().is_none());
    }

    #[test]
    fn kill_on_dead_forwarder_marks_exited() {
        let root = tempdir().unwrap();
        let config = test_config(root.path());
        let manager = SessionManager::new(config.clone());

        let dir = config.session_dir("dead");
        fs::create_dir_all(&dir).unwrap();
        session::write_session_json(&dir, &sample_info("dead", SessionStatus::Running)).unwrap();

        let outcome = manager.kill("dead", None).unwrap();
        assert_eq!(outcome, KillOutcome::AlreadyExited);

        let info = session::read_session_json(&dir).unwrap();
        assert_eq!(info.status, SessionStatus::Exited);
    }

    #[test]
    fn kill_is_idempotent_on_already_exited() {
        let root = tempdir().unwrap();
        let config = test_config(root.path());
        let manager = SessionManager::new(config.clone());

        let dir = config.session_dir("gone");
        fs::create_dir_all(&dir).unwrap();
        let mut info = sample_info("gone", SessionStatus::Exited);
        info.exit_code = Some(0);
        session::write_session_json(&dir, &info).unwrap();

        assert_eq!(manager.kill("gone", None).unwrap(), KillOutcome::AlreadyExited);
        assert_eq!(manager.kill("gone", None).unwrap(), KillOutcome::AlreadyExited);
    }

    #[test]
    fn kill_reports_not_found() {
        let root = tempdir().unwrap();
        let manager = SessionManager::new(test_config(root.path()));
        assert_eq!(manager.kill("nope", None).unwrap(), KillOutcome::NotFound);
    }

    #[test]
    fn cleanup_removes_old_exited_sessions_only() {
        let root = tempdir().unwrap();
        let config = test_config(root.path());
        let manager = SessionManager::new(config.clone());

        let old_dir = config.session_dir("old");
        fs::create_dir_all(&old_dir).unwrap();
        let mut old = sample_info("old", SessionStatus::Exited);
        old.exited_at = Some("2000-01-01T00:00:00Z".to_string());
        session::write_session_json(&old_dir, &old).unwrap();

        let running_dir = config.session_dir("running");
        fs::create_dir_all(&running_dir).unwrap();
        session::write_session_json(&running_dir, &sample_info("running", SessionStatus::Running)).unwrap();

        let removed = manager.cleanup(Duration::from_secs(60)).unwrap();
        assert_eq!(removed, 1);
        assert!(!old_dir.exists());
        assert!(running_dir.exists());
    }
}
