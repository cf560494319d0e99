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

use std::fmt;

use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// FrameKind tags the one-byte type field of a frame on any of the three
/// socket classes (api.sock, control.sock, ipc.sock).
///
/// Unknown byte values are rejected by `TryFrom`, but the streaming codec
/// in `vibetunnel-core` drains the frame from its buffer before surfacing
/// that error, so one unrecognized frame never wedges the rest of the
/// stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Raw bytes to feed to the PTY.
    StdinData = 0x01,
    /// UTF-8 JSON `ControlCmd`.
    ControlCmd = 0x02,
    /// UTF-8 JSON `StatusUpdate`.
    StatusUpdate = 0x03,
    /// Raw PTY output bytes.
    StdoutData = 0x04,
    /// UTF-8 JSON mirror of `session.json` (`SessionInfo`).
    SessionInfo = 0x05,
    /// UTF-8 JSON `ErrorPayload`.
    Error = 0x06,
    /// Empty; echoed by the peer on receipt.
    Heartbeat = 0x07,
    /// Empty; requests a `StatusUpdate` reply.
    StatusRequest = 0x08,
    /// UTF-8 JSON, opaque to the core.
    GitFollowRequest = 0x09,
    /// UTF-8 JSON, opaque to the core.
    GitEventNotify = 0x0A,
}

impl FrameKind {
    /// Frames of this kind always carry an empty payload.
    pub fn is_empty_payload(self) -> bool {
        matches!(self, FrameKind::Heartbeat | FrameKind::StatusRequest)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(FrameKind::StdinData),
            0x02 => Ok(FrameKind::ControlCmd),
            0x03 => Ok(FrameKind::StatusUpdate),
            0x04 => Ok(FrameKind::StdoutData),
            0x05 => Ok(FrameKind::SessionInfo),
            0x06 => Ok(FrameKind::Error),
            0x07 => Ok(FrameKind::Heartbeat),
            0x08 => Ok(FrameKind::StatusRequest),
            0x09 => Ok(FrameKind::GitFollowRequest),
            0x0A => Ok(FrameKind::GitEventNotify),
            other => Err(other),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameKind::StdinData => "stdin-data",
            FrameKind::ControlCmd => "control-cmd",
            FrameKind::StatusUpdate => "status-update",
            FrameKind::StdoutData => "stdout-data",
            FrameKind::SessionInfo => "session-info",
            FrameKind::Error => "error",
            FrameKind::Heartbeat => "heartbeat",
            FrameKind::StatusRequest => "status-request",
            FrameKind::GitFollowRequest => "git-follow-request",
            FrameKind::GitEventNotify => "git-event-notify",
        };
        write!(f, "{s}")
    }
}

/// A borrowed view of a decoded frame's payload, paired with its kind.
/// Mirrors the shape of a frame on the wire: one byte of kind, a
/// big-endian four byte length, then `payload.len()` bytes.
#[derive(Debug, PartialEq)]
pub struct Frame<'data> {
    pub kind: FrameKind,
    pub payload: &'data [u8],
}

/// `{cmd:"resize",cols,rows}` | `{cmd:"kill",signal?}` | `{cmd:"reset-size"}` |
/// `{cmd:"update-title",title}` | `{cmd:"resync",last_offset,last_epoch}` |
/// `{cmd:"session-monitor",kind,session_id,message,metadata?}`.
///
/// The first five variants are sent by a client to the forwarder on
/// `ipc.sock`. `SessionMonitor` runs the other way: the forwarder
/// broadcasts it over its `ControlBus` to announce a `SessionMonitorNotification`
/// to anyone subscribed to the session's `ipc.sock`, so that
/// `control_server::relay_one_session` can republish it as a
/// `session-monitor` category event on `control.sock`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlCmd {
    Resize { cols: u16, rows: u16 },
    Kill { signal: Option<String> },
    ResetSize,
    UpdateTitle { title: String },
    /// §4.7: requests replay of `[last_offset..eof)` if `last_epoch`
    /// still matches the session's truncation epoch.
    Resync { last_offset: u64, last_epoch: u64 },
    SessionMonitor(SessionMonitorNotification),
}

/// `{from}`, the forwarder's reply to a `resync` `ControlCmd` (§4.7). A
/// stale `last_epoch` reports `from: 0`, meaning the cast file was
/// rewritten since and the subscriber must replay the whole remaining
/// file itself rather than trust the offset it asked for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resynced {
    pub from: u64,
}

/// `{app,status,extra?}`, the payload of a STATUS_UPDATE frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub app: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// `{code,message}`, the payload of an ERROR frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorPayload { code: code.into(), message: message.into() }
    }

    pub fn bad_command(message: impl Into<String>) -> Self {
        Self::new("bad-command", message)
    }
}

/// `status` of a `Session`, as reported in `session.json` and mirrored to
/// SESSION_INFO frames. Transitions only `starting -> running -> exited`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Starting,
    Running,
    Exited,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Exited => write!(f, "exited"),
        }
    }
}

impl SessionStatus {
    /// True if `next` is a legal transition from `self` (including staying
    /// put, which callers may treat as a no-op write).
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Starting, Starting)
                | (Starting, Running)
                | (Starting, Exited)
                | (Running, Running)
                | (Running, Exited)
                | (Exited, Exited)
        )
    }
}

/// The durable, on-disk representation of a session: `session.json`. Also
/// the payload of a SESSION_INFO frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub command: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: String,
    pub forwarder_pid: i32,
    pub child_pid: i32,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<String>,
    #[serde(default)]
    pub truncation_epoch: u64,
}

/// Spec §4.5 sentinel: `exit_code` used when the manager marks a session
/// `exited` during startup recovery but the true exit code is unknowable
/// (the forwarder that knew it is gone).
pub const EXIT_CODE_UNKNOWN: i32 = i32::MIN;

/// Spec §4.4 failure semantics: `exit_code` used when PTY spawn itself
/// fails, before any child process existed.
pub const EXIT_CODE_SPAWN_FAILED: i32 = -1;

/// The second envelope the control socket (C6) layers on top of every
/// CONTROL_CMD frame it carries: `{id, category, type, action?, data?, error?}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlEnvelope {
    pub id: String,
    pub category: ControlCategory,
    #[serde(rename = "type")]
    pub msg_type: ControlMsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ControlEnvelope {
    pub fn request(id: impl Into<String>, category: ControlCategory, action: impl Into<String>) -> Self {
        ControlEnvelope {
            id: id.into(),
            category,
            msg_type: ControlMsgType::Request,
            action: Some(action.into()),
            data: None,
            error: None,
        }
    }

    pub fn response_ok(id: impl Into<String>, category: ControlCategory, data: serde_json::Value) -> Self {
        ControlEnvelope {
            id: id.into(),
            category,
            msg_type: ControlMsgType::Response,
            action: None,
            data: Some(data),
            error: None,
        }
    }

    pub fn response_err(id: impl Into<String>, category: ControlCategory, error: ErrorPayload) -> Self {
        ControlEnvelope {
            id: id.into(),
            category,
            msg_type: ControlMsgType::Response,
            action: None,
            data: None,
            error: Some(error),
        }
    }

    pub fn event(id: impl Into<String>, category: ControlCategory, action: impl Into<String>, data: serde_json::Value) -> Self {
        ControlEnvelope {
            id: id.into(),
            category,
            msg_type: ControlMsgType::Event,
            action: Some(action.into()),
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlCategory {
    Auth,
    System,
    Session,
    SessionMonitor,
    Input,
    Git,
    Heartbeat,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlMsgType {
    Event,
    Request,
    Response,
}

/// One of the `session-monitor` notification kinds, per spec §4.6/§4.9.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMonitorKind {
    SessionStart,
    SessionExit,
    CommandCompletion,
    CommandError,
    ClaudeTurn,
    Bell,
}

/// `{sessionId, message, metadata?}`, the `data` of a `session-monitor`
/// `notification` event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionMonitorNotification {
    pub kind: SessionMonitorKind,
    pub session_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A request to create a new session, the input to the manager's
/// `Create` operation (§4.5).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionSpec {
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Explicit id; if already taken, `Create` fails with `AlreadyExists`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// `{command, args?}`, the single JSON object a client sends on api.sock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub command: ApiCommandName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiCommandName {
    Status,
    Sessions,
    Follow,
    Unfollow,
    Title,
}

/// The single JSON object response on api.sock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ApiResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        ApiResponse { ok: true, data: Some(data), error: None }
    }

    pub fn err(error: ErrorPayload) -> Self {
        ApiResponse { ok: false, data: None, error: Some(error) }
    }
}

/// asciinema v2 header line: `{version:2, width, height, timestamp, command?, title?, env?}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CastHeader {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<serde_json::Value>,
}

impl CastHeader {
    pub fn new(width: u16, height: u16, timestamp: f64) -> Self {
        CastHeader { version: 2, width, height, timestamp, command: None, title: None, env: None }
    }
}

/// The `kind` discriminant of a cast event line `[t, kind, data]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastEventKind {
    Output,
    Input,
    Resize,
    Marker,
}

impl CastEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CastEventKind::Output => "o",
            CastEventKind::Input => "i",
            CastEventKind::Resize => "r",
            CastEventKind::Marker => "m",
        }
    }
}

impl TryFrom<&str> for CastEventKind {
    type Error = ();

    fn try_from(s: &str) -> Result<Self, ()> {
        match s {
            "o" => Ok(CastEventKind::Output),
            "i" => Ok(CastEventKind::Input),
            "r" => Ok(CastEventKind::Resize),
            "m" => Ok(CastEventKind::Marker),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_kind_round_trip() {
        for code in 0x01u8..=0x0A {
            let kind = FrameKind::try_from(code).expect("known code");
            assert_eq!(kind as u8, code);
        }
        assert_eq!(FrameKind::try_from(0x00), Err(0x00));
        assert_eq!(FrameKind::try_from(0x0B), Err(0x0B));
    }

    #[test]
    fn session_status_transitions() {
        use SessionStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Exited));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Exited.can_transition_to(Running));
    }

    #[test]
    fn control_cmd_json_shape() {
        let cmd = ControlCmd::Resize { cols: 120, rows: 40 };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["cmd"], "resize");
        assert_eq!(v["cols"], 120);

        let parsed: ControlCmd = serde_json::from_str(r#"{"cmd":"kill","signal":"TERM"}"#).unwrap();
        assert_eq!(parsed, ControlCmd::Kill { signal: Some("TERM".to_string()) });
    }
}
