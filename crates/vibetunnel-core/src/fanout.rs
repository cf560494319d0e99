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

//! The stream fan-out (C3): one PTY-output producer, delivered to the cast
//! writer (mandatory, never dropped) and to zero or more live subscribers
//! (bounded ring buffers, drop-oldest, lagging-and-resync). The session
//! table elsewhere in this crate is an `Arc<Mutex<_>>` of shared state for
//! the same reason this is: several threads touch it, none of them for
//! long.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
};

use tracing::warn;
use vibetunnel_protocol::Resynced;

use crate::{cast::CastWriter, consts};

struct Chunk {
    offset: u64,
    data: Vec<u8>,
}

struct RingState {
    queue: VecDeque<Chunk>,
    queued_bytes: usize,
    closed: bool,
}

struct Ring {
    state: Mutex<RingState>,
    not_empty: Condvar,
    lagging: AtomicBool,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Ring {
            state: Mutex::new(RingState { queue: VecDeque::new(), queued_bytes: 0, closed: false }),
            not_empty: Condvar::new(),
            lagging: AtomicBool::new(false),
            capacity,
        }
    }

    /// Pushes a chunk, dropping the oldest queued chunks if it doesn't
    /// fit. §4.3: bytes are dropped "for that subscriber only"; the
    /// fan-out as a whole never blocks on a slow live subscriber.
    fn push(&self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }

        state.queued_bytes += data.len();
        state.queue.push_back(Chunk { offset, data: data.to_vec() });

        while state.queued_bytes > self.capacity && state.queue.len() > 1 {
            if let Some(dropped) = state.queue.pop_front() {
                state.queued_bytes -= dropped.data.len();
                self.lagging.store(true, Ordering::SeqCst);
            }
        }

        self.not_empty.notify_one();
    }

    fn recv(&self) -> Option<(u64, Vec<u8>, bool)> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(chunk) = state.queue.pop_front() {
                state.queued_bytes -= chunk.data.len();
                let was_lagging = self.lagging.swap(false, Ordering::SeqCst);
                return Some((chunk.offset, chunk.data, was_lagging));
            }
            if state.closed {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.not_empty.notify_all();
    }
}

/// A live subscription against the fan-out. Each subscriber's bytes are
/// independent of every other's; a lagging subscriber never slows down
/// the cast writer or any other subscriber.
pub struct Subscription {
    id: u64,
    ring: Arc<Ring>,
    fanout: Arc<FanOutInner>,
    last_ack_offset: AtomicU64,
}

impl Subscription {
    /// Blocks until the next chunk is available or the fan-out is closed
    /// (session exited). The returned `bool` is true if one or more gaps
    /// were dropped immediately before this chunk — the caller should
    /// treat `offset` as a resync point rather than assuming contiguity
    /// with whatever it last received.
    pub fn recv(&self) -> Option<(u64, Vec<u8>, bool)> {
        let item = self.ring.recv();
        if let Some((offset, ref data, _)) = item {
            self.last_ack_offset.store(offset + data.len() as u64, Ordering::SeqCst);
        }
        item
    }

    pub fn is_lagging(&self) -> bool {
        self.ring.lagging.load(Ordering::SeqCst)
    }

    /// The subscriber's last-ack byte offset into the session's output
    /// stream (§3's Data Model), for resync after a reconnect.
    pub fn last_ack_offset(&self) -> u64 {
        self.last_ack_offset.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.fanout.subscribers.lock().unwrap().retain(|(id, _)| *id != self.id);
    }
}

struct FanOutInner {
    subscribers: Mutex<Vec<(u64, Arc<Ring>)>>,
    next_id: AtomicU64,
    position: AtomicU64,
}

/// Owns the mandatory cast-writer subscriber and distributes PTY output
/// to it plus any number of live subscribers.
pub struct FanOut {
    cast: CastWriter,
    inner: Arc<FanOutInner>,
}

impl FanOut {
    /// `position` is the offset of the first byte this fan-out will
    /// publish, in the PTY output stream's own coordinate space — a
    /// separate counter from the cast file's on-disk byte position,
    /// which also carries JSON framing overhead and resets on
    /// truncation. A freshly spawned forwarder starts this at 0; the
    /// cast file itself remains the durable record.
    pub fn new(cast: CastWriter) -> Self {
        FanOut {
            cast,
            inner: Arc::new(FanOutInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                position: AtomicU64::new(0),
            }),
        }
    }

    /// Publishes a chunk of PTY output. The cast writer is authoritative
    /// (§4.3): this call doesn't return until the cast writer has
    /// durably queued the bytes, which is the backpressure point the PTY
    /// reader blocks on.
    pub fn publish(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        self.cast.append_output(bytes)?;

        let offset = self.inner.position.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        let subs = self.inner.subscribers.lock().unwrap();
        for (_, ring) in subs.iter() {
            ring.push(offset, bytes);
        }
        Ok(())
    }

    /// Also routes client keystrokes into the cast (`i` events) without
    /// fanning them out to other live subscribers — only output is
    /// streamed live.
    pub fn record_input(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.cast.append_input(bytes)
    }

    pub fn record_resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.cast.append_resize(cols, rows)
    }

    pub fn record_marker(&self, message: impl Into<String>) -> anyhow::Result<()> {
        self.cast.append_marker(message)
    }

    pub fn append_raw_line(&self, line: impl Into<String>) -> anyhow::Result<()> {
        self.cast.append_raw_line(line)
    }

    /// The byte offset the next published chunk will start at. Reconnect
    /// logic in the forwarder reads the cast file up to this offset, then
    /// calls `subscribe()` to continue live (§4.7).
    pub fn position(&self) -> u64 {
        self.inner.position.load(Ordering::SeqCst)
    }

    /// The cast writer's own truncation epoch, incremented each time the
    /// background truncator rewrites the file (§4.7).
    pub fn truncation_epoch(&self) -> u64 {
        self.cast.truncation_epoch()
    }

    /// Resolves a `resync` request: if `last_epoch` still matches the
    /// current truncation epoch, the caller's `last_offset` is still
    /// valid and can be replayed from the cast file; otherwise the file
    /// has been rewritten since and the caller must replay from scratch
    /// (§4.7).
    pub fn resync(&self, last_offset: u64, last_epoch: u64) -> Resynced {
        if last_epoch == self.truncation_epoch() {
            Resynced { from: last_offset }
        } else {
            Resynced { from: 0 }
        }
    }

    /// Attaches a new live subscriber starting from the current position.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let ring = Arc::new(Ring::new(consts::SUBSCRIBER_RING_SIZE));
        self.inner.subscribers.lock().unwrap().push((id, Arc::clone(&ring)));
        Subscription {
            id,
            ring,
            fanout: Arc::clone(&self.inner),
            last_ack_offset: AtomicU64::new(self.position()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Flushes the cast writer and detaches every live subscriber
    /// (§4.4's exit path step 2: "subscribers receive a final
    /// SESSION_INFO... drain the fan-out").
    pub fn close(self) -> anyhow::Result<()> {
        for (_, ring) in self.inner.subscribers.lock().unwrap().drain(..) {
            ring.close();
        }
        self.cast.close()
    }
}

impl Drop for FanOutInner {
    fn drop(&mut self) {
        if let Ok(subs) = self.subscribers.lock() {
            if !subs.is_empty() {
                warn!("fan-out dropped with {} live subscribers still attached", subs.len());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{thread, time::Duration};
    use tempfile::tempdir;
    use vibetunnel_protocol::CastHeader;

    fn test_writer() -> CastWriter {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stdout");
        std::mem::forget(dir); // keep the tempdir alive for the test's duration
        CastWriter::create(
            path,
            CastHeader::new(80, 24, 0.0),
            consts::DEFAULT_MAX_CAST_SIZE,
            Duration::from_secs(3600),
            0.8,
        )
        .unwrap()
    }

    #[test]
    fn subscriber_receives_published_bytes_in_order() {
        let fanout = FanOut::new(test_writer());
        let sub = fanout.subscribe();

        fanout.publish(b"hello ").unwrap();
        fanout.publish(b"world").unwrap();

        let (off1, data1, lag1) = sub.recv().unwrap();
        assert_eq!(off1, 0);
        assert_eq!(data1, b"hello ");
        assert!(!lag1);

        let (off2, data2, _) = sub.recv().unwrap();
        assert_eq!(off2, 6);
        assert_eq!(data2, b"world");
    }

    #[test]
    fn lagging_subscriber_drops_oldest_and_keeps_position_accurate() {
        let fanout = FanOut::new(test_writer());
        let sub = fanout.subscribe();

        // Push more than the ring can hold without ever calling recv, so
        // the oldest chunks get evicted.
        let chunk = vec![b'x'; consts::SUBSCRIBER_RING_SIZE / 4];
        for _ in 0..8 {
            fanout.publish(&chunk).unwrap();
        }

        assert!(sub.is_lagging());
        let (offset, data, was_lagging) = sub.recv().unwrap();
        assert!(was_lagging);
        // The surviving chunk's offset must still match where it actually
        // sits in the overall byte stream, not where the subscriber
        // thinks it does.
        assert_eq!(offset % chunk.len() as u64, 0);
        assert_eq!(data.len(), chunk.len());
    }

    #[test]
    fn close_wakes_blocked_subscribers() {
        let fanout = FanOut::new(test_writer());
        let sub = fanout.subscribe();

        let handle = thread::spawn(move || sub.recv());
        thread::sleep(Duration::from_millis(50));
        fanout.close().unwrap();

        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn cast_writer_is_never_dropped_even_with_no_subscribers() {
        let fanout = FanOut::new(test_writer());
        assert_eq!(fanout.subscriber_count(), 0);
        fanout.publish(b"still recorded").unwrap();
        assert_eq!(fanout.position(), "still recorded".len() as u64);
    }

    #[test]
    fn subscription_tracks_last_ack_offset() {
        let fanout = FanOut::new(test_writer());
        let sub = fanout.subscribe();
        assert_eq!(sub.last_ack_offset(), 0);

        fanout.publish(b"hello").unwrap();
        sub.recv().unwrap();
        assert_eq!(sub.last_ack_offset(), 5);
    }

    #[test]
    fn resync_with_current_epoch_trusts_the_offset() {
        let fanout = FanOut::new(test_writer());
        let resynced = fanout.resync(42, fanout.truncation_epoch());
        assert_eq!(resynced.from, 42);
    }

    #[test]
    fn resync_with_stale_epoch_forces_full_replay() {
        let fanout = FanOut::new(test_writer());
        let resynced = fanout.resync(42, fanout.truncation_epoch() + 1);
        assert_eq!(resynced.from, 0);
    }
}
