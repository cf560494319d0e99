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

use anyhow::anyhow;
use vibetunnel_protocol::ControlCategory;

use crate::client;

pub fn run<P: AsRef<Path>>(socket: P, retention_secs: u64) -> anyhow::Result<()> {
    let reply = client::request(
        socket,
        ControlCategory::Session,
        "cleanup",
        serde_json::json!({ "retention_secs": retention_secs }),
    )?;
    if let Some(err) = reply.error {
        return Err(anyhow!("{}: {}", err.code, err.message));
    }

    let removed = reply.data.and_then(|d| d.get("removed").and_then(|v| v.as_u64())).unwrap_or(0);
    println!("removed {removed} session(s)");
    Ok(())
}
