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

pub fn run<P: AsRef<Path>>(socket: P, id: String) -> anyhow::Result<()> {
    let reply = client::request(socket, ControlCategory::Session, "get", serde_json::json!({ "id": id }))?;
    if let Some(err) = reply.error {
        return Err(anyhow!("{}: {}", err.code, err.message));
    }

    let session = reply.data.and_then(|d| d.get("session").cloned()).unwrap_or(serde_json::Value::Null);
    if session.is_null() {
        return Err(anyhow!("session {id} not found"));
    }
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}
