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

//! A thin blocking client for `control.sock`, used by the CLI's
//! `create`/`list`/`get`/`kill`/`cleanup` subcommands. Grounded on the
//! teacher's own `list.rs`/`kill.rs`: connect, send one request, read one
//! reply, surface `ErrorKind::NotFound` as "could not connect to daemon".

use std::{io, os::unix::net::UnixStream, path::Path};

use anyhow::Context;
use vibetunnel_protocol::{ControlCategory, ControlEnvelope, ControlMsgType, FrameKind};

use crate::codec::{read_frame, write_frame};

/// Sends one `ControlCategory`/action request over `control.sock` and
/// blocks for the matching response, ignoring any `event` envelopes the
/// relay may interleave onto the same connection before the reply lands.
pub fn request(
    sock_path: impl AsRef<Path>,
    category: ControlCategory,
    action: &str,
    data: serde_json::Value,
) -> anyhow::Result<ControlEnvelope> {
    let mut stream = match UnixStream::connect(sock_path.as_ref()) {
        Ok(s) => s,
        Err(err) => {
            if err.kind() == io::ErrorKind::NotFound {
                eprintln!("could not connect to the vibetunnel daemon");
            }
            return Err(err).context("connecting to control.sock");
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    let mut request = ControlEnvelope::request(id.clone(), category, action);
    request.data = Some(data);
    let body = serde_json::to_vec(&request).context("encoding request")?;
    write_frame(&mut stream, FrameKind::ControlCmd, &body).context("sending request")?;

    loop {
        let frame = read_frame(&mut stream, crate::consts::MAX_FRAME_PAYLOAD).context("reading response")?;
        match serde_json::from_slice::<ControlEnvelope>(&frame.payload) {
            Ok(envelope) if envelope.id == id && envelope.msg_type == ControlMsgType::Response => {
                return Ok(envelope);
            }
            Ok(_) => continue, // an unrelated event; keep waiting for our reply
            Err(e) => return Err(e).context("parsing control response"),
        }
    }
}
