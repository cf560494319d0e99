// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{env, path::PathBuf, sync::Mutex, time};

use anyhow::anyhow;

pub mod daemon;

static VIBETUNNEL_BIN_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> anyhow::Result<bool>,
{
    let mut sleep_dur = time::Duration::from_millis(5);
    for _ in 0..12 {
        if pred()? {
            return Ok(());
        } else {
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
    }

    Err(anyhow!("pred never became true"))
}

pub fn vibetunnel_bin() -> anyhow::Result<PathBuf> {
    let mut cached = VIBETUNNEL_BIN_PATH.lock().unwrap();
    if let Some(path) = &*cached {
        return Ok(path.to_path_buf());
    }

    let exe = cargo_dir().join("vibetunnel");
    if !exe.exists() {
        return Err(anyhow!("could not find vibetunnel bin at {exe:?}; run `cargo build` first"));
    }

    *cached = Some(exe.clone());
    Ok(exe)
}

pub fn cargo_dir() -> PathBuf {
    env::var_os("CARGO_BIN_PATH")
        .map(PathBuf::from)
        .or_else(|| {
            env::current_exe().ok().map(|mut path| {
                path.pop();
                if path.ends_with("deps") {
                    path.pop();
                }
                path
            })
        })
        .unwrap_or_else(|| panic!("CARGO_BIN_PATH wasn't set. Cannot continue running test"))
}
