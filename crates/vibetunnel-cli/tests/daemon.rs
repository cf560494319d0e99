use std::{io::Read, path, process::Stdio, time};

use anyhow::Context;
use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn start() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("vibetunnel-test")
        .rand_bytes(20)
        .tempdir()
        .context("creating tmp dir")?;

    let mut child = std::process::Command::new(support::vibetunnel_bin()?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .arg("daemon")
        .env("VIBETUNNEL_ROOT", tmp_dir.path())
        .spawn()
        .context("spawning daemon process")?;

    support::wait_until(|| Ok(tmp_dir.path().join("control.sock").exists()))?;
    assert!(tmp_dir.path().join("api.sock").exists());

    child.kill().context("killing child")?;

    let mut stdout = child.stdout.take().context("missing stdout")?;
    let mut stdout_str = String::new();
    stdout.read_to_string(&mut stdout_str).context("slurping stdout")?;
    assert!(stdout_str.is_empty(), "unexpected stdout output: {stdout_str}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn sockets_cleaned_up_on_sigint() -> anyhow::Result<()> {
    let mut daemon_proc = support::daemon::Proc::new().context("starting daemon proc")?;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(daemon_proc.proc.id() as i32),
        nix::sys::signal::Signal::SIGINT,
    )?;

    daemon_proc.proc.wait().context("waiting for daemon to exit")?;

    assert!(!path::Path::new(&daemon_proc.control_sock).exists());
    assert!(!path::Path::new(&daemon_proc.api_sock).exists());
    Ok(())
}

#[test]
#[timeout(30000)]
fn recovers_stale_session_dir_on_restart() -> anyhow::Result<()> {
    let mut daemon_proc = support::daemon::Proc::new().context("starting daemon proc")?;

    let out = daemon_proc.create(&["--", "/bin/echo", "hi"])?;
    assert!(out.status.success(), "create did not exit successfully: {:?}", out);

    let out = daemon_proc.list()?;
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("echo"), "expected session in list output: {stdout}");

    // Restart the daemon against the same root; recovery should run
    // without the manager holding any in-process session table.
    daemon_proc.proc.kill().context("killing daemon")?;
    daemon_proc.proc.wait().context("waiting for daemon exit")?;

    let root = daemon_proc.root_dir.clone();
    let mut child = std::process::Command::new(support::vibetunnel_bin()?)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .arg("daemon")
        .env("VIBETUNNEL_ROOT", &root)
        .spawn()
        .context("respawning daemon process")?;

    support::wait_until(|| Ok(root.join("control.sock").exists()))?;

    // half a second to let startup recovery (§4.5) complete
    std::thread::sleep(time::Duration::from_millis(500));

    child.kill().context("killing respawned daemon")?;
    let _ = child.wait();

    Ok(())
}
