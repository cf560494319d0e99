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

use std::time;

pub const SOCK_STREAM_TIMEOUT: time::Duration = time::Duration::from_millis(200);
pub const JOIN_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

pub const BUF_SIZE: usize = 1024 * 16;

/// §4.1: default maximum frame payload size before ProtocolError.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// §4.3: default per-subscriber ring buffer size.
pub const SUBSCRIBER_RING_SIZE: usize = 64 * 1024;

/// §5: hard bound on the cast writer's pending-write queue.
pub const CAST_QUEUE_CAPACITY: usize = 1024;

/// §4.2: default cast file size cap.
pub const DEFAULT_MAX_CAST_SIZE: u64 = 10 * 1024 * 1024;
/// §4.2: default background size-check interval.
pub const DEFAULT_CAST_CHECK_INTERVAL: time::Duration = time::Duration::from_secs(30);
/// §4.2.1: default fraction of MAX_CAST_SIZE the truncator targets.
pub const DEFAULT_TRUNC_TARGET_PCT: f64 = 0.8;
/// §4.2.1: hard cap above which the synchronous truncator refuses and
/// forces the async path.
pub const SYNC_TRUNCATE_HARD_CAP: u64 = 50 * 1024 * 1024;

/// §5/§6: default heartbeat interval and missed-heartbeat threshold.
pub const DEFAULT_HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_MISSES: u32 = 3;

/// §5: default per-request response deadline.
pub const DEFAULT_REQUEST_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// §5: default graceful-shutdown grace period before SIGKILL.
pub const SHUTDOWN_GRACE_PERIOD: time::Duration = time::Duration::from_secs(5);

/// §4.4: starting backoff for ipc.sock accept retry, capped at 5s.
pub const ACCEPT_RETRY_MIN: time::Duration = time::Duration::from_millis(100);
pub const ACCEPT_RETRY_MAX: time::Duration = time::Duration::from_secs(5);

/// §4.2: writer position re-validates against file size; drift above this
/// many bytes is an InvariantViolation.
pub const POSITION_DRIFT_THRESHOLD: u64 = 100;

/// §9 open question: default claude-turn debounce window.
pub const DEFAULT_CLAUDE_TURN_DEBOUNCE: time::Duration = time::Duration::from_secs(2);

/// §4.9: default idle/busy threshold between PTY output chunks.
pub const DEFAULT_ACTIVITY_IDLE_THRESHOLD: time::Duration = time::Duration::from_millis(200);

pub const STDIN_FD: i32 = 0;

/// A magic env var which tells a re-exec'd `vibetunnel` invocation to run
/// as a forwarder instead of parsing CLI args normally. Its value is the
/// path to a JSON-encoded `ForwarderArgs` file the manager wrote before
/// spawning; the forwarder reads it, deletes it, and allocates its own
/// session directory. The same re-invocation-via-env-var trick used for
/// autodaemonization below.
pub const FORWARDER_REEXEC_VAR: &str = "VIBETUNNEL__INTERNAL__FORWARDER_SPEC_FILE";

/// If set to "true", the daemon will autodaemonize after launch.
pub const AUTODAEMONIZE_VAR: &str = "VIBETUNNEL__INTERNAL__AUTODAEMONIZE";

/// §4.5: how long `SessionManager::create` polls for a freshly spawned
/// forwarder's `session.json` to leave the `starting` status before
/// giving up.
pub const SPAWN_READY_TIMEOUT: time::Duration = time::Duration::from_secs(5);
