// Copyright 2024 Google LLC
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

//! The API socket server (C7): `<root>/api.sock`, one short-lived
//! connection per request. Unlike `control.sock`, there's no per-peer
//! state to keep — each connection reads exactly one `ApiRequest` frame,
//! writes exactly one `ApiResponse` frame, and closes.

use std::{
    os::unix::{
        fs::PermissionsExt,
        net::{UnixListener, UnixStream},
    },
    sync::Arc,
    thread,
};

use anyhow::Context;
use tracing::{instrument, warn};
use vibetunnel_protocol::{ApiCommandName, ApiRequest, ApiResponse, ControlCmd, ErrorPayload, FrameKind};

use crate::{
    codec::{read_frame, write_frame},
    config::Config,
    consts,
    manager::SessionManager,
};

pub struct ApiServer {
    config: Config,
    manager: Arc<SessionManager>,
}

impl ApiServer {
    pub fn new(config: Config, manager: Arc<SessionManager>) -> Self {
        ApiServer { config, manager }
    }

    #[instrument(skip(self))]
    pub fn serve(&self) -> anyhow::Result<()> {
        let sock_path = self.config.api_sock();
        let listener = UnixListener::bind(&sock_path).context("binding api.sock")?;
        std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o755))
            .context("setting api.sock permissions")?;

        let mut backoff = consts::ACCEPT_RETRY_MIN;
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    backoff = consts::ACCEPT_RETRY_MIN;
                    let manager = Arc::clone(&self.manager);
                    thread::spawn(move || serve_connection(stream, manager));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound || e.kind() == std::io::ErrorKind::InvalidInput => {
                    warn!("api.sock accept unrecoverable: {:?}", e);
                    return Ok(());
                }
                Err(e) => {
                    warn!("api.sock accept transient error, retrying in {:?}: {:?}", backoff, e);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(consts::ACCEPT_RETRY_MAX);
                }
            }
        }
    }
}

fn serve_connection(mut stream: UnixStream, manager: Arc<SessionManager>) {
    let frame = match read_frame(&mut stream, consts::MAX_FRAME_PAYLOAD) {
        Ok(f) => f,
        Err(e) => {
            warn!("api.sock: reading request failed: {:?}", e);
            return;
        }
    };

    let response = match serde_json::from_slice::<ApiRequest>(&frame.payload) {
        Ok(request) => handle_request(&manager, request),
        Err(e) => ApiResponse::err(ErrorPayload::bad_command(e.to_string())),
    };

    let body = match serde_json::to_vec(&response) {
        Ok(b) => b,
        Err(e) => {
            warn!("api.sock: encoding response failed: {:?}", e);
            return;
        }
    };

    if let Err(e) = write_frame(&mut stream, FrameKind::ControlCmd, &body) {
        warn!("api.sock: writing response failed: {:?}", e);
    }
}

fn handle_request(manager: &SessionManager, request: ApiRequest) -> ApiResponse {
    let result = match request.command {
        ApiCommandName::Status => Ok(serde_json::json!({
            "version": vibetunnel_protocol::VERSION,
            "sessions": manager.list().map(|s| s.len()).unwrap_or(0),
        })),
        ApiCommandName::Sessions => manager.list().map(|sessions| serde_json::json!({ "sessions": sessions })),
        ApiCommandName::Follow | ApiCommandName::Unfollow => {
            // Opaque to the core (§4.8): following/unfollowing a session is
            // a collaborator-side concern. Just validate the id exists.
            with_session_id(&request, |id| match manager.get(id)? {
                Some(_) => Ok(serde_json::json!({ "id": id })),
                None => Err(anyhow::anyhow!("session {id} not found")),
            })
        }
        ApiCommandName::Title => with_session_id(&request, |id| {
            let title = request
                .args
                .as_ref()
                .and_then(|a| a.get("title"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("missing \"title\" field"))?;
            send_update_title(manager, id, title)?;
            Ok(serde_json::json!({ "id": id, "title": title }))
        }),
    };

    match result {
        Ok(data) => ApiResponse::ok(data),
        Err(e) => ApiResponse::err(ErrorPayload::new("request-failed", e.to_string())),
    }
}

fn with_session_id(
    request: &ApiRequest,
    f: impl FnOnce(&str) -> anyhow::Result<serde_json::Value>,
) -> anyhow::Result<serde_json::Value> {
    let id = request
        .args
        .as_ref()
        .and_then(|a| a.get("id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing \"id\" field"))?;
    f(id)
}

fn send_update_title(manager: &SessionManager, id: &str, title: &str) -> anyhow::Result<()> {
    let dir = manager.config().session_dir(id);
    let mut stream =
        UnixStream::connect(dir.join("ipc.sock")).with_context(|| format!("connecting to session {id}'s ipc.sock"))?;
    let cmd = ControlCmd::UpdateTitle { title: title.to_string() };
    let body = serde_json::to_vec(&cmd)?;
    write_frame(&mut stream, FrameKind::ControlCmd, &body)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn test_config(root: &std::path::Path) -> Config {
        Config {
            root: root.to_path_buf(),
            max_cast_size: consts::DEFAULT_MAX_CAST_SIZE,
            cast_check_interval: consts::DEFAULT_CAST_CHECK_INTERVAL,
            trunc_target_pct: consts::DEFAULT_TRUNC_TARGET_PCT,
            heartbeat_interval: consts::DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_misses: consts::DEFAULT_HEARTBEAT_MISSES,
            claude_turn_debounce: consts::DEFAULT_CLAUDE_TURN_DEBOUNCE,
        }
    }

    #[test]
    fn status_reports_session_count() {
        let root = tempdir().unwrap();
        let manager = SessionManager::new(test_config(root.path()));
        let resp = handle_request(&manager, ApiRequest { command: ApiCommandName::Status, args: None });
        assert!(resp.ok);
        assert_eq!(resp.data.unwrap()["sessions"], 0);
    }

    #[test]
    fn title_without_id_errors() {
        let root = tempdir().unwrap();
        let manager = SessionManager::new(test_config(root.path()));
        let resp = handle_request(&manager, ApiRequest { command: ApiCommandName::Title, args: None });
        assert!(!resp.ok);
    }
}
