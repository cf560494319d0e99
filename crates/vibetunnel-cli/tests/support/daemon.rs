use std::{
    default::Default,
    os::unix::net::UnixStream,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;
use tempfile::TempDir;

use super::vibetunnel_bin;

/// Proc is a helper handle for a `vibetunnel daemon` subprocess. It kills
/// the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    subproc_counter: usize,
    log_file: PathBuf,
    local_tmp_dir: Option<TempDir>,
    pub root_dir: PathBuf,
    pub control_sock: PathBuf,
    pub api_sock: PathBuf,
}

impl Proc {
    pub fn new() -> anyhow::Result<Proc> {
        let local_tmp_dir = tempfile::Builder::new()
            .prefix("vibetunnel-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        let root_dir = local_tmp_dir.path().to_path_buf();

        let control_sock = root_dir.join("control.sock");
        let api_sock = root_dir.join("api.sock");
        let log_file = root_dir.join("daemon.log");
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        let proc = Command::new(vibetunnel_bin()?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("daemon")
            .env("VIBETUNNEL_ROOT", &root_dir)
            .spawn()
            .context("spawning daemon process")?;

        // spin until we can dial the control socket
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if UnixStream::connect(&control_sock).is_ok() {
                break;
            } else {
                std::thread::sleep(sleep_dur);
                sleep_dur *= 2;
            }
        }

        Ok(Proc {
            proc,
            local_tmp_dir: Some(local_tmp_dir),
            root_dir,
            log_file,
            subproc_counter: 0,
            control_sock,
            api_sock,
        })
    }

    fn cli(&mut self, sub: &str) -> Command {
        let log_file = self.root_dir.join(format!("{}_{}.log", sub, self.subproc_counter));
        self.subproc_counter += 1;

        let mut cmd = Command::new(vibetunnel_bin().expect("vibetunnel bin"));
        cmd.arg("-vv")
            .arg("--log-file")
            .arg(log_file)
            .env("VIBETUNNEL_ROOT", &self.root_dir)
            .arg(sub);
        cmd
    }

    /// Runs `vibetunnel create` and returns the raw process output.
    pub fn create(&mut self, argv: &[&str]) -> anyhow::Result<process::Output> {
        self.cli("create").args(argv).output().context("spawning create proc")
    }

    /// Runs `vibetunnel list` and returns the raw process output.
    pub fn list(&mut self) -> anyhow::Result<process::Output> {
        self.cli("list").output().context("spawning list proc")
    }

    /// Runs `vibetunnel get <id>` and returns the raw process output.
    pub fn get(&mut self, id: &str) -> anyhow::Result<process::Output> {
        self.cli("get").arg(id).output().context("spawning get proc")
    }

    /// Runs `vibetunnel kill <id>` and returns the raw process output.
    pub fn kill(&mut self, id: &str) -> anyhow::Result<process::Output> {
        self.cli("kill").arg(id).output().context("spawning kill proc")
    }

    /// Runs `vibetunnel cleanup` and returns the raw process output.
    pub fn cleanup(&mut self, retention_secs: u64) -> anyhow::Result<process::Output> {
        self.cli("cleanup")
            .arg("--retention-secs")
            .arg(retention_secs.to_string())
            .output()
            .context("spawning cleanup proc")
    }
}

impl std::ops::Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing daemon proc: {:?}", e);
        }
        let _ = self.proc.wait();
        if std::env::var("VIBETUNNEL_LEAVE_TEST_LOGS").unwrap_or(String::from("")) == "true" {
            self.local_tmp_dir.take().map(|d| d.into_path());
        }
    }
}
