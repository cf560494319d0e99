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
use vibetunnel_protocol::{ControlCategory, ControlMsgType, SessionSpec};

use crate::client;

#[allow(clippy::too_many_arguments)]
pub fn run<P: AsRef<Path>>(
    socket: P,
    argv: Vec<String>,
    cwd: Option<String>,
    cols: u16,
    rows: u16,
    id: Option<String>,
    display_name: Option<String>,
) -> anyhow::Result<()> {
    let spec = SessionSpec { argv, cwd, env: Vec::new(), cols, rows, display_name, id };
    let data = serde_json::to_value(&spec).context("encoding session spec")?;

    let reply = client::request(socket, ControlCategory::Session, "create", data)?;
    if reply.msg_type == ControlMsgType::Response {
        if let Some(err) = reply.error {
            return Err(anyhow!("{}: {}", err.code, err.message));
        }
    }
    println!("{}", serde_json::to_string_pretty(&reply.data)?);
    Ok(())
}
