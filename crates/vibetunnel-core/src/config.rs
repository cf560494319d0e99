// Copyright 2023 Google LLC
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

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use tracing::{info, instrument};

use crate::{consts, user};

/// Reads the session core's configuration once, from the environment,
/// per spec §9 ("config is read once at manager startup from the
/// environment" — unlike the rest of this codebase's teacher, there is
/// no config file and no hot-reload).
#[instrument(skip_all)]
pub fn read_config() -> anyhow::Result<Config> {
    info!("reading config from environment");

    let root = match env::var("VIBETUNNEL_ROOT") {
        Ok(r) => PathBuf::from(r),
        Err(_) => {
            let home = user::info().context("resolving default root")?.home_dir;
            PathBuf::from(home).join(".vibetunnel")
        }
    };

    Ok(Config {
        root,
        max_cast_size: env_u64("VIBETUNNEL_MAX_CAST_SIZE", consts::DEFAULT_MAX_CAST_SIZE)?,
        cast_check_interval: env_duration_secs(
            "VIBETUNNEL_CAST_CHECK_INTERVAL",
            consts::DEFAULT_CAST_CHECK_INTERVAL,
        )?,
        trunc_target_pct: env_f64("VIBETUNNEL_TRUNC_TARGET_PCT", consts::DEFAULT_TRUNC_TARGET_PCT)?,
        heartbeat_interval: env_duration_secs(
            "VIBETUNNEL_HEARTBEAT_INTERVAL",
            consts::DEFAULT_HEARTBEAT_INTERVAL,
        )?,
        heartbeat_misses: env_u32("VIBETUNNEL_HEARTBEAT_MISSES", consts::DEFAULT_HEARTBEAT_MISSES)?,
        claude_turn_debounce: consts::DEFAULT_CLAUDE_TURN_DEBOUNCE,
    })
}

fn env_parsed<T: FromStr>(var: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(s) => s.parse::<T>().map_err(|e| anyhow::anyhow!("parsing {var}={s:?}: {e}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).context(format!("reading {var}")),
    }
}

fn env_u64(var: &str, default: u64) -> anyhow::Result<u64> {
    env_parsed(var, default)
}

fn env_u32(var: &str, default: u32) -> anyhow::Result<u32> {
    env_parsed(var, default)
}

fn env_f64(var: &str, default: f64) -> anyhow::Result<f64> {
    env_parsed(var, default)
}

fn env_duration_secs(var: &str, default: Duration) -> anyhow::Result<Duration> {
    match env::var(var) {
        Ok(s) => {
            let secs = s.parse::<f64>().map_err(|e| anyhow::anyhow!("parsing {var}={s:?}: {e}"))?;
            Ok(Duration::from_secs_f64(secs))
        }
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).context(format!("reading {var}")),
    }
}

/// The session core's configuration, read once at startup (§9). All
/// fields have documented defaults (§6) and are overridable by the
/// matching `VIBETUNNEL_*` environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    /// Overrides the session root directory. `VIBETUNNEL_ROOT`, default
    /// `~/.vibetunnel`.
    pub root: PathBuf,

    /// §4.2 size bound: truncation fires once the cast file exceeds this
    /// many bytes. `VIBETUNNEL_MAX_CAST_SIZE`.
    pub max_cast_size: u64,

    /// §4.2 background size-check interval. `VIBETUNNEL_CAST_CHECK_INTERVAL`.
    pub cast_check_interval: Duration,

    /// §4.2.1 fraction of `max_cast_size` the truncator targets.
    /// `VIBETUNNEL_TRUNC_TARGET_PCT`.
    pub trunc_target_pct: f64,

    /// §5/§6 heartbeat cadence. `VIBETUNNEL_HEARTBEAT_INTERVAL`.
    pub heartbeat_interval: Duration,

    /// §5/§6: missed heartbeats beyond this multiple of the interval
    /// disconnect the peer. `VIBETUNNEL_HEARTBEAT_MISSES`.
    pub heartbeat_misses: u32,

    /// §9 open question: debounce window for `claude-turn` notifications.
    /// Not independently configurable via environment variable in this
    /// spec; implementation-defined within ±500ms of the 2s default.
    pub claude_turn_debounce: Duration,
}

impl Config {
    pub fn control_dir(&self) -> PathBuf {
        self.root.join("control")
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.control_dir().join(id)
    }

    pub fn api_sock(&self) -> PathBuf {
        self.root.join("api.sock")
    }

    pub fn control_sock(&self) -> PathBuf {
        self.root.join("control.sock")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn defaults_when_unset() {
        for var in [
            "VIBETUNNEL_ROOT",
            "VIBETUNNEL_MAX_CAST_SIZE",
            "VIBETUNNEL_CAST_CHECK_INTERVAL",
            "VIBETUNNEL_TRUNC_TARGET_PCT",
            "VIBETUNNEL_HEARTBEAT_INTERVAL",
            "VIBETUNNEL_HEARTBEAT_MISSES",
        ] {
            env::remove_var(var);
        }

        let config = read_config().expect("reading config with no env overrides set");
        assert_eq!(config.max_cast_size, consts::DEFAULT_MAX_CAST_SIZE);
        assert_eq!(config.heartbeat_misses, consts::DEFAULT_HEARTBEAT_MISSES);
    }

    #[test]
    #[timeout(30000)]
    fn overrides_from_env() {
        env::set_var("VIBETUNNEL_MAX_CAST_SIZE", "4096");
        env::set_var("VIBETUNNEL_TRUNC_TARGET_PCT", "0.5");

        let config = read_config().expect("reading config with overrides set");
        assert_eq!(config.max_cast_size, 4096);
        assert_eq!(config.trunc_target_pct, 0.5);

        env::remove_var("VIBETUNNEL_MAX_CAST_SIZE");
        env::remove_var("VIBETUNNEL_TRUNC_TARGET_PCT");
    }
}
