use std::process::Command;

use anyhow::Context;
use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn empty() -> anyhow::Result<()> {
    let mut daemon_proc = support::daemon::Proc::new().context("starting daemon proc")?;
    let out = daemon_proc.list()?;
    assert!(out.status.success(), "list proc did not exit successfully");

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("ID\tCOMMAND\tSTATUS\tCREATED_AT"));

    Ok(())
}

#[test]
#[timeout(30000)]
fn no_daemon() -> anyhow::Result<()> {
    let out = Command::new(support::vibetunnel_bin()?)
        .arg("list")
        .env("VIBETUNNEL_ROOT", "/fake/does/not/exist")
        .output()
        .context("spawning list proc")?;

    assert!(!out.status.success(), "list proc exited successfully");

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("could not connect"), "unexpected stderr: {stderr}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn one_session() -> anyhow::Result<()> {
    let mut daemon_proc = support::daemon::Proc::new().context("starting daemon proc")?;

    let out = daemon_proc.create(&["--", "/bin/sleep", "30"])?;
    assert!(out.status.success(), "create did not exit successfully: {:?}", out);

    let out = daemon_proc.list()?;
    assert!(out.status.success(), "list proc did not exit successfully");

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("sleep"), "expected sleep session in: {stdout}");

    Ok(())
}

#[test]
#[timeout(30000)]
fn get_and_kill() -> anyhow::Result<()> {
    let mut daemon_proc = support::daemon::Proc::new().context("starting daemon proc")?;

    let out = daemon_proc.create(&["--", "/bin/sleep", "30"])?;
    assert!(out.status.success());
    let created: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    let id = created.get("id").and_then(|v| v.as_str()).expect("created session has an id").to_string();

    let out = daemon_proc.get(&id)?;
    assert!(out.status.success(), "get did not exit successfully: {:?}", out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains(&id));

    let out = daemon_proc.kill(&id)?;
    assert!(out.status.success(), "kill did not exit successfully: {:?}", out);

    let out = daemon_proc.kill("not-a-real-session-id")?;
    assert!(!out.status.success(), "kill of unknown session should fail");

    Ok(())
}
