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

//! Ties the session manager (C5) to its two sockets (C6, C7) and runs
//! the manager process for as long as it's alive. The manager process
//! itself owns no sessions, it just accepts requests and relays
//! forwarder state.

use std::{env, sync::Arc};

use anyhow::Context;
use tracing::{info, instrument};

use crate::{api_server::ApiServer, config::Config, consts, control_server::ControlServer, manager::SessionManager, signals, systemd};

#[instrument(skip_all)]
pub fn run(config: Config) -> anyhow::Result<()> {
    if let Ok(daemonize) = env::var(consts::AUTODAEMONIZE_VAR) {
        if daemonize == "true" {
            env::remove_var(consts::AUTODAEMONIZE_VAR); // avoid looping on re-exec

            let pid_file = config.root.join("vibetunnel.pid");
            info!("daemonizing with pid_file={:?}", pid_file);
            daemonize::Daemonize::new().pid_file(pid_file).start().context("daemonizing")?;
        }
    }

    info!("\n\n======================== STARTING SESSION CORE ============================\n\n");

    let manager = Arc::new(SessionManager::new(config.clone()));
    let report = manager.run_startup_recovery().context("running startup recovery")?;
    info!(
        kept = report.kept.len(),
        reaped = report.reaped.len(),
        deleted_invalid = report.deleted_invalid.len(),
        "startup recovery complete"
    );

    let control = ControlServer::new(config.clone(), Arc::clone(&manager));
    let api = ApiServer::new(config.clone(), Arc::clone(&manager));

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    // systemd can only activate the one socket it's configured for; when
    // present we treat it as control.sock and still bind api.sock directly.
    match systemd::activation_socket() {
        Ok(_listener) => info!("systemd activation socket present (unused: control/api bind their own paths)"),
        Err(e) => info!("no systemd activation socket: {:?}", e),
    }

    signals::Handler::new(vec![config.control_sock(), config.api_sock()]).spawn()?;

    let api_thread = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let _ = stop; // api.sock has no long-lived peers to drain; it exits on accept error
            if let Err(e) = api.serve() {
                tracing::error!("api.sock server exited with error: {:?}", e);
            }
        })
    };

    control.serve(stop)?;

    let _ = api_thread.join();
    Ok(())
}
