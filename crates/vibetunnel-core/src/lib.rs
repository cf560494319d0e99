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

use std::{env, io, sync::Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod activity;
pub mod api_server;
pub mod cast;
pub mod client;
mod cleanup;
pub mod codec;
pub mod config;
pub mod consts;
pub mod control_server;
mod create;
mod daemon;
mod exit_notify;
pub mod fanout;
pub mod forwarder;
mod get;
mod kill;
mod list;
pub mod manager;
mod signals;
pub mod session;
mod systemd;
mod tty;
mod user;

/// The command line arguments the `vibetunnel` binary parses. A
/// re-exec'd forwarder invocation (`consts::FORWARDER_REEXEC_VAR` set)
/// never reaches this parser — `run()` intercepts it first.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "Write logs to this file instead of stderr")]
    pub log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Runs the session manager, serving control.sock and api.sock")]
    Daemon,

    #[clap(about = "Creates a new session")]
    Create {
        #[clap(long, help = "Working directory for the session's command")]
        cwd: Option<String>,
        #[clap(long, default_value_t = 80, help = "Initial terminal width")]
        cols: u16,
        #[clap(long, default_value_t = 24, help = "Initial terminal height")]
        rows: u16,
        #[clap(long, help = "Explicit session id; auto-generated if omitted")]
        id: Option<String>,
        #[clap(long, help = "Human-readable display name")]
        name: Option<String>,
        #[clap(help = "The command (and its arguments) to run in the session", required = true)]
        cmd: Vec<String>,
    },

    #[clap(about = "Lists all known sessions")]
    List,

    #[clap(about = "Prints one session's full info as JSON")]
    Get {
        #[clap(help = "The session id")]
        id: String,
    },

    #[clap(about = "Kills a session")]
    Kill {
        #[clap(help = "The session id")]
        id: String,
        #[clap(long, help = "Signal name to send instead of the default")]
        signal: Option<String>,
    },

    #[clap(about = "Removes exited sessions older than the given retention window")]
    Cleanup {
        #[clap(long, default_value_t = 0, help = "Retention window in seconds")]
        retention_secs: u64,
    },
}

impl Args {
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Runs the `vibetunnel` tool. A process re-exec'd by the session
/// manager with `consts::FORWARDER_REEXEC_VAR` set bypasses CLI parsing
/// entirely and runs as a per-session forwarder instead (§10.3.1): the
/// manager spawns the forwarder with no argv of its own, so parsing
/// `Args` first would fail on the missing subcommand.
pub fn run(args: Args) -> anyhow::Result<()> {
    let config = config::read_config().context("reading configuration")?;

    if let Ok(spec_path) = env::var(consts::FORWARDER_REEXEC_VAR) {
        init_logging(None, 0);
        let code = forwarder::run_from_reexec(&config, std::path::Path::new(&spec_path))
            .context("running session forwarder")?;
        std::process::exit(code);
    }

    init_logging(args.log_file.as_deref(), args.verbose);

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow::anyhow!("wrapper binary must handle version")),
        Commands::Daemon => daemon::run(config),
        Commands::Create { cwd, cols, rows, id, name, cmd } => {
            create::run(config.control_sock(), cmd, cwd, cols, rows, id, name)
        }
        Commands::List => list::run(config.control_sock()),
        Commands::Get { id } => get::run(config.control_sock(), id),
        Commands::Kill { id, signal } => kill::run(config.control_sock(), id, signal),
        Commands::Cleanup { retention_secs } => cleanup::run(config.control_sock(), retention_secs),
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(log_file: Option<&str>, verbose: u8) {
    let trace_level = if verbose == 0 {
        tracing::Level::INFO
    } else if verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(trace_level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    match log_file {
        Some(path) => match std::fs::File::create(path) {
            Ok(file) => {
                builder.with_writer(Mutex::new(file)).init();
            }
            Err(e) => {
                // Fall back to stderr; logging setup failing shouldn't be fatal.
                builder.with_writer(io::stderr).init();
                error!("failed to open log file {path:?}: {e}");
            }
        },
        None => {
            builder.with_writer(io::stderr).init();
        }
    }
}
