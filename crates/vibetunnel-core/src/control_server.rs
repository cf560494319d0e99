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

//! The control socket server (C6): `<root>/control.sock`, a single
//! process-wide bidirectional bus carrying the categorized envelope of
//! §4.6 over the §4.1 framed codec. Structurally this is the same
//! accept-loop-plus-per-connection-thread shape as the forwarder's
//! `ipc.sock`, generalized to many long-lived peers instead of one PTY.

use std::{
    collections::HashMap,
    io::{ErrorKind, Read},
    os::unix::{
        fs::PermissionsExt,
        net::{UnixListener, UnixStream},
    },
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{instrument, span, warn, Level};
use vibetunnel_protocol::{ControlCategory, ControlCmd, ControlEnvelope, ControlMsgType, ErrorPayload, FrameKind};

use crate::{
    codec::{write_frame, FrameDecoder, ProtocolError},
    config::Config,
    consts,
    manager::SessionManager,
};

/// Broadcasts `ControlEnvelope` events to every connected control.sock
/// client, the same pattern as the forwarder's `ControlBus` one level up.
struct Bus {
    subs: Mutex<Vec<(u64, crossbeam_channel::Sender<ControlEnvelope>)>>,
    next_id: AtomicU64,
}

impl Bus {
    fn new() -> Self {
        Bus { subs: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    fn subscribe(&self) -> (u64, crossbeam_channel::Receiver<ControlEnvelope>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subs.lock().unwrap().push((id, tx));
        (id, rx)
    }

    fn unsubscribe(&self, id: u64) {
        self.subs.lock().unwrap().retain(|(sid, _)| *sid != id);
    }

    fn publish(&self, envelope: ControlEnvelope) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
    }
}

pub struct ControlServer {
    config: Config,
    manager: Arc<SessionManager>,
    bus: Arc<Bus>,
}

impl ControlServer {
    pub fn new(config: Config, manager: Arc<SessionManager>) -> Self {
        ControlServer { config, manager, bus: Arc::new(Bus::new()) }
    }

    /// Binds the socket and serves forever. Blocks the calling thread;
    /// callers run this on a dedicated thread, same as the forwarder's
    /// `ipc.sock` accept loop.
    #[instrument(skip(self, stop))]
    pub fn serve(&self, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
        let sock_path = self.config.control_sock();
        let listener = UnixListener::bind(&sock_path).context("binding control.sock")?;
        std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o600))
            .context("setting control.sock permissions")?;

        spawn_session_event_relay(Arc::clone(&self.manager), Arc::clone(&self.bus), Arc::clone(&stop));

        let mut backoff = consts::ACCEPT_RETRY_MIN;
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    backoff = consts::ACCEPT_RETRY_MIN;
                    let manager = Arc::clone(&self.manager);
                    let bus = Arc::clone(&self.bus);
                    let heartbeat_interval = self.config.heartbeat_interval;
                    let heartbeat_misses = self.config.heartbeat_misses;
                    thread::spawn(move || serve_connection(stream, manager, bus, heartbeat_interval, heartbeat_misses));
                }
                Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::InvalidInput => {
                    warn!("control.sock accept unrecoverable: {:?}", e);
                    return Ok(());
                }
                Err(e) => {
                    warn!("control.sock accept transient error, retrying in {:?}: {:?}", backoff, e);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(consts::ACCEPT_RETRY_MAX);
                }
            }
        }
    }
}

fn serve_connection(
    stream: UnixStream,
    manager: Arc<SessionManager>,
    bus: Arc<Bus>,
    heartbeat_interval: Duration,
    heartbeat_misses: u32,
) {
    let _s = span!(Level::INFO, "control_connection").entered();

    let outbound_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("cloning control connection handle failed: {:?}", e);
            return;
        }
    };

    let (sub_id, bus_rx) = bus.subscribe();
    let (resp_tx, resp_rx) = crossbeam_channel::unbounded::<ControlEnvelope>();
    let last_heartbeat = Arc::new(Mutex::new(Instant::now()));
    let last_heartbeat_outbound = Arc::clone(&last_heartbeat);

    let outbound = thread::spawn(move || {
        run_outbound(outbound_stream, bus_rx, resp_rx, heartbeat_interval, heartbeat_misses, last_heartbeat_outbound)
    });

    run_inbound(stream, &manager, &resp_tx, &last_heartbeat);

    bus.unsubscribe(sub_id);
    let _ = outbound.join();
}

fn run_inbound(
    mut stream: UnixStream,
    manager: &SessionManager,
    resp_tx: &crossbeam_channel::Sender<ControlEnvelope>,
    last_heartbeat: &Mutex<Instant>,
) {
    let mut decoder = FrameDecoder::default();
    let mut buf = [0u8; consts::BUF_SIZE];

    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => decoder.feed(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) if frame.kind == FrameKind::Heartbeat => {
                    *last_heartbeat.lock().unwrap() = Instant::now();
                }
                Ok(Some(frame)) if frame.kind == FrameKind::ControlCmd => {
                    match serde_json::from_slice::<ControlEnvelope>(&frame.payload) {
                        Ok(envelope) if envelope.category == ControlCategory::Heartbeat => {
                            *last_heartbeat.lock().unwrap() = Instant::now();
                        }
                        Ok(envelope) if envelope.msg_type == ControlMsgType::Request => {
                            let reply = handle_request(manager, envelope);
                            let _ = resp_tx.send(reply);
                        }
                        Ok(_) => {} // events/responses from a client are ignored
                        Err(e) => warn!("control.sock: malformed envelope: {:?}", e),
                    }
                }
                Ok(Some(frame)) => {
                    warn!("control.sock: unexpected frame kind {} from client, ignoring", frame.kind);
                }
                Ok(None) => break,
                Err(ProtocolError::UnknownType(code)) => {
                    warn!("control.sock: unknown frame type {:#x}, ignoring", code);
                    break;
                }
                Err(e) => {
                    warn!("control.sock frame decode error: {:?}", e);
                    return;
                }
            }
        }
    }
}

fn handle_request(manager: &SessionManager, envelope: ControlEnvelope) -> ControlEnvelope {
    let action = envelope.action.clone().unwrap_or_default();
    let result = match (envelope.category, action.as_str()) {
        (ControlCategory::Session, "list") => manager.list().map(|sessions| serde_json::json!({ "sessions": sessions })),
        (ControlCategory::Session, "get") => {
            let id = envelope.data.as_ref().and_then(|d| d.get("id")).and_then(|v| v.as_str());
            match id {
                Some(id) => manager
                    .get(id)
                    .map(|info| serde_json::json!({ "session": info })),
                None => Err(anyhow::anyhow!("missing \"id\" field")),
            }
        }
        (ControlCategory::Session, "create") => {
            let spec = envelope
                .data
                .clone()
                .ok_or_else(|| anyhow::anyhow!("missing request body"))
                .and_then(|d| serde_json::from_value(d).map_err(Into::into));
            match spec {
                Ok(spec) => manager.create(spec).map(|info| serde_json::json!({ "session": info })),
                Err(e) => Err(e),
            }
        }
        (ControlCategory::Session, "kill") => {
            let id = envelope.data.as_ref().and_then(|d| d.get("id")).and_then(|v| v.as_str());
            let signal = envelope
                .data
                .as_ref()
                .and_then(|d| d.get("signal"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match id {
                Some(id) => manager.kill(id, signal).map(|outcome| serde_json::json!({ "outcome": format!("{outcome:?}") })),
                None => Err(anyhow::anyhow!("missing \"id\" field")),
            }
        }
        (ControlCategory::Session, "cleanup") => {
            let retention_secs =
                envelope.data.as_ref().and_then(|d| d.get("retention_secs")).and_then(|v| v.as_u64()).unwrap_or(0);
            manager
                .cleanup(Duration::from_secs(retention_secs))
                .map(|removed| serde_json::json!({ "removed": removed }))
        }
        (other_category, other_action) => Err(anyhow::anyhow!("unsupported request {other_category:?}/{other_action}")),
    };

    match result {
        Ok(data) => ControlEnvelope::response_ok(envelope.id, envelope.category, data),
        Err(e) => ControlEnvelope::response_err(envelope.id, envelope.category, ErrorPayload::new("request-failed", e.to_string())),
    }
}

fn run_outbound(
    mut stream: UnixStream,
    bus_rx: crossbeam_channel::Receiver<ControlEnvelope>,
    resp_rx: crossbeam_channel::Receiver<ControlEnvelope>,
    heartbeat_interval: Duration,
    heartbeat_misses: u32,
    last_heartbeat: Arc<Mutex<Instant>>,
) {
    let deadline = heartbeat_interval.saturating_mul(heartbeat_misses.max(1));

    loop {
        crossbeam_channel::select! {
            recv(bus_rx) -> msg => match msg {
                Ok(envelope) => {
                    if send_envelope(&mut stream, &envelope).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(resp_rx) -> msg => match msg {
                Ok(envelope) => {
                    if send_envelope(&mut stream, &envelope).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            },
            default(heartbeat_interval) => {
                if write_frame(&mut stream, FrameKind::Heartbeat, &[]).is_err() {
                    return;
                }
                if last_heartbeat.lock().unwrap().elapsed() > deadline {
                    warn!("control.sock peer missed {} heartbeats, disconnecting", heartbeat_misses);
                    return;
                }
            }
        }
    }
}

fn send_envelope(stream: &mut UnixStream, envelope: &ControlEnvelope) -> anyhow::Result<()> {
    let body = serde_json::to_vec(envelope)?;
    write_frame(stream, FrameKind::ControlCmd, &body)?;
    Ok(())
}

/// Bridges session-monitor/session events from every live forwarder's
/// `ipc.sock` onto the control bus: the manager process has no in-memory
/// session state of its own (§9's "no global mutable state"), so it
/// relays by connecting to each forwarder as an ordinary client.
fn spawn_session_event_relay(manager: Arc<SessionManager>, bus: Arc<Bus>, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        let _s = span!(Level::INFO, "session_event_relay").entered();
        let mut relayed: HashMap<String, thread::JoinHandle<()>> = HashMap::new();

        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }

            relayed.retain(|_, handle| !handle.is_finished());

            match manager.list() {
                Ok(sessions) => {
                    for info in sessions {
                        if relayed.contains_key(&info.id) || info.status == vibetunnel_protocol::SessionStatus::Exited {
                            continue;
                        }
                        let dir = manager.config().session_dir(&info.id);
                        let bus = Arc::clone(&bus);
                        let id = info.id.clone();
                        let handle = thread::spawn(move || relay_one_session(dir, id, bus));
                        relayed.insert(info.id, handle);
                    }
                }
                Err(e) => warn!("session event relay: listing sessions failed: {:?}", e),
            }

            thread::sleep(consts::ACCEPT_RETRY_MAX);
        }
    });
}

fn relay_one_session(dir: std::path::PathBuf, id: String, bus: Arc<Bus>) {
    let ipc_path = dir.join("ipc.sock");
    let mut stream = match UnixStream::connect(&ipc_path) {
        Ok(s) => s,
        Err(_) => return, // forwarder not up yet or already gone; next scan retries
    };

    bus.publish(ControlEnvelope::event(
        "relay",
        ControlCategory::Session,
        "created",
        serde_json::json!({ "id": id }),
    ));

    let mut decoder = FrameDecoder::default();
    let mut buf = [0u8; consts::BUF_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => decoder.feed(&buf[..n]),
            Err(_) => break,
        }
        while let Ok(Some(frame)) = decoder.next_frame() {
            match frame.kind {
                FrameKind::SessionInfo => {
                    if let Ok(info) = serde_json::from_slice::<serde_json::Value>(&frame.payload) {
                        bus.publish(ControlEnvelope::event("relay", ControlCategory::Session, "updated", info));
                    }
                }
                FrameKind::ControlCmd => {
                    if let Ok(ControlCmd::SessionMonitor(notif)) = serde_json::from_slice::<ControlCmd>(&frame.payload)
                    {
                        let data = serde_json::to_value(&notif).unwrap_or_default();
                        bus.publish(ControlEnvelope::event("relay", ControlCategory::SessionMonitor, "notification", data));
                    }
                }
                _ => {}
            }
        }
    }

    bus.publish(ControlEnvelope::event(
        "relay",
        ControlCategory::Session,
        "closed",
        serde_json::json!({ "id": id }),
    ));
}

#[cfg(test)]
mod test {
    use super::*;
    use vibetunnel_protocol::ControlMsgType as Ty;

    #[test]
    fn bus_drops_disconnected_subscribers() {
        let bus = Bus::new();
        let (id, rx) = bus.subscribe();
        drop(rx);
        bus.publish(ControlEnvelope::event("x", ControlCategory::Heartbeat, "ping", serde_json::json!({})));
        assert!(bus.subs.lock().unwrap().iter().all(|(sid, _)| *sid != id));
    }

    #[test]
    fn bus_delivers_to_live_subscriber() {
        let bus = Bus::new();
        let (_id, rx) = bus.subscribe();
        let env = ControlEnvelope::event("x", ControlCategory::Heartbeat, "ping", serde_json::json!({}));
        bus.publish(env.clone());
        let got = rx.recv().unwrap();
        assert_eq!(got.msg_type, Ty::Event);
        assert_eq!(got, env);
    }
}
