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

use std::path::Path;

use anyhow::{anyhow, Context};
use vibetunnel_protocol::{ControlCategory, SessionInfo};

use crate::client;

pub fn run<P: AsRef<Path>>(socket: P) -> anyhow::Result<()> {
    let reply = client::request(socket, ControlCategory::Session, "list", serde_json::json!({}))?;
    if let Some(err) = reply.error {
        return Err(anyhow!("{}: {}", err.code, err.message));
    }

    let sessions: Vec<SessionInfo> = reply
        .data
        .and_then(|d| d.get("sessions").cloned())
        .map(serde_json::from_value)
        .transpose()
        .context("parsing session list")?
        .unwrap_or_default();

    println!("ID\tCOMMAND\tSTATUS\tCREATED_AT");
    for session in sessions.iter() {
        println!(
            "{}\t{}\t{:?}\t{}",
            session.id,
            session.command.join(" "),
            session.status,
            session.created_at
        );
    }

    Ok(())
}
