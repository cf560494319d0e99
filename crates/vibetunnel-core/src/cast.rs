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

//! The cast writer (C2): an append-only asciinema v2 log, chunked so that
//! no event ever splits a UTF-8 code point or an escape sequence, backed
//! by a single writer thread so appends are strictly ordered and the
//! queue itself is the backpressure point described in §5.

use std::{
    collections::VecDeque,
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use thiserror::Error;
use tracing::{error, instrument, warn};
use vibetunnel_protocol::{CastEventKind, CastHeader};

use crate::consts;

#[derive(Debug, Error)]
pub enum TruncateError {
    #[error("cast file is {size} bytes, above the {cap} byte synchronous hard cap")]
    TooLarge { size: u64, cap: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// now() as seconds since the unix epoch, the same clock `CastHeader.timestamp` uses.
pub fn unix_timestamp() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

enum Job {
    Output(Vec<u8>),
    Input(Vec<u8>),
    Resize(u16, u16),
    Marker(String),
    RawLine(String),
    Close,
}

struct JobEnvelope {
    job: Job,
    ack: crossbeam_channel::Sender<Result<(), String>>,
}

pub struct CastWriter {
    tx: crossbeam_channel::Sender<JobEnvelope>,
    worker: Option<thread::JoinHandle<()>>,
    position: Arc<AtomicU64>,
    truncation_epoch: Arc<AtomicU64>,
}

impl CastWriter {
    /// Opens `path` fresh, writes the header line, and spawns the
    /// single-writer background thread.
    #[instrument(skip(header))]
    pub fn create(
        path: impl AsRef<Path>,
        header: CastHeader,
        max_size: u64,
        check_interval: Duration,
        trunc_target_pct: f64,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .context("creating cast file")?;

        let mut header_line = serde_json::to_vec(&header).context("encoding cast header")?;
        header_line.push(b'\n');
        file.write_all(&header_line).context("writing cast header")?;
        file.sync_all().ok();

        let position = Arc::new(AtomicU64::new(header_line.len() as u64));
        let truncation_epoch = Arc::new(AtomicU64::new(0));
        let (tx, rx) = crossbeam_channel::bounded::<JobEnvelope>(consts::CAST_QUEUE_CAPACITY);

        let state = WriterState {
            file,
            path,
            start: Instant::now(),
            header_timestamp: header.timestamp,
            carry: Vec::new(),
            bytes_written: position.load(Ordering::SeqCst),
            max_size,
            check_interval,
            trunc_target_pct,
            last_check: Instant::now(),
            consecutive_open_failures: 0,
            position: Arc::clone(&position),
            truncation_epoch: Arc::clone(&truncation_epoch),
        };

        let worker = thread::Builder::new()
            .name("cast-writer".to_string())
            .spawn(move || run_writer(state, rx))
            .context("spawning cast writer thread")?;

        Ok(CastWriter { tx, worker: Some(worker), position, truncation_epoch })
    }

    pub fn append_output(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.submit(Job::Output(bytes.to_vec()))
    }

    pub fn append_input(&self, bytes: &[u8]) -> anyhow::Result<()> {
        self.submit(Job::Input(bytes.to_vec()))
    }

    pub fn append_resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.submit(Job::Resize(cols, rows))
    }

    pub fn append_marker(&self, message: impl Into<String>) -> anyhow::Result<()> {
        self.submit(Job::Marker(message.into()))
    }

    /// Appends a bare JSON line (e.g. the trailing exit record) outside
    /// the `[t,kind,data]` schema. Never interleaved with a partial event.
    pub fn append_raw_line(&self, line: impl Into<String>) -> anyhow::Result<()> {
        self.submit(Job::RawLine(line.into()))
    }

    /// The writer's current byte position, for exact-offset consumers
    /// (§4.7's resync).
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    /// Incremented each time the background truncator rewrites the file
    /// (§4.7); a resync request against a stale epoch must replay from
    /// scratch rather than trust its `last_byte_offset`.
    pub fn truncation_epoch(&self) -> u64 {
        self.truncation_epoch.load(Ordering::SeqCst)
    }

    pub fn close(mut self) -> anyhow::Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> anyhow::Result<()> {
        if let Err(e) = self.submit(Job::Close) {
            warn!("closing cast writer: {:?}", e);
        }
        if let Some(h) = self.worker.take() {
            h.join().map_err(|_| anyhow!("cast writer thread panicked"))?;
        }
        Ok(())
    }

    fn submit(&self, job: Job) -> anyhow::Result<()> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.tx.send(JobEnvelope { job, ack: ack_tx }).map_err(|_| anyhow!("cast writer closed"))?;
        ack_rx.recv().map_err(|_| anyhow!("cast writer worker gone"))?.map_err(|e| anyhow!(e))
    }
}

impl Drop for CastWriter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.close_mut();
        }
    }
}

struct WriterState {
    file: fs::File,
    path: PathBuf,
    start: Instant,
    header_timestamp: f64,
    carry: Vec<u8>,
    bytes_written: u64,
    max_size: u64,
    check_interval: Duration,
    trunc_target_pct: f64,
    last_check: Instant,
    consecutive_open_failures: u32,
    position: Arc<AtomicU64>,
    truncation_epoch: Arc<AtomicU64>,
}

impl WriterState {
    fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn write_line(&mut self, line: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(line).context("writing cast line")?;
        self.bytes_written += line.len() as u64;
        self.position.store(self.bytes_written, Ordering::SeqCst);

        if let Err(e) = self.file.sync_all() {
            // §4.2: fsync failures are logged but do not fail the write.
            warn!("fsync of cast file failed: {:?}", e);
        }

        self.revalidate_position();
        Ok(())
    }

    fn write_event(&mut self, kind: CastEventKind, data: &str) -> anyhow::Result<()> {
        let t = self.elapsed_secs();
        let line = serde_json::to_string(&(t, kind.as_str(), data)).context("encoding cast event")?;
        let mut line = line.into_bytes();
        line.push(b'\n');
        self.write_line(&line)
    }

    fn append_safe_bytes(&mut self, kind: CastEventKind, mut input: Vec<u8>) -> anyhow::Result<()> {
        if !self.carry.is_empty() {
            let mut combined = std::mem::take(&mut self.carry);
            combined.append(&mut input);
            input = combined;
        }

        let split = safe_split_point(&input);
        let (emit, carry) = input.split_at(split);
        self.carry = carry.to_vec();

        if emit.is_empty() {
            return Ok(());
        }

        // Escape sequences and multi-byte UTF-8 are preserved whole by
        // `safe_split_point`; anything left over is still valid text for
        // display purposes even if it isn't valid UTF-8 (e.g. raw bytes
        // the PTY emitted that don't round-trip through `str`).
        let data = String::from_utf8_lossy(emit).into_owned();
        self.write_event(kind, &data)
    }

    fn flush_carry(&mut self) -> anyhow::Result<()> {
        if self.carry.is_empty() {
            return Ok(());
        }
        let data = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        self.write_event(CastEventKind::Output, &data)
    }

    fn revalidate_position(&mut self) {
        if let Ok(meta) = self.file.metadata() {
            let actual = meta.len();
            let drift = actual.abs_diff(self.bytes_written);
            if drift > consts::POSITION_DRIFT_THRESHOLD {
                error!(
                    "cast writer position drift of {} bytes (tracked={}, actual={}); resyncing",
                    drift, self.bytes_written, actual
                );
                self.bytes_written = actual;
                self.position.store(actual, Ordering::SeqCst);
            }
        }
    }

    fn maybe_truncate(&mut self) -> anyhow::Result<()> {
        if self.last_check.elapsed() < self.check_interval {
            return Ok(());
        }
        self.last_check = Instant::now();

        let size = self.file.metadata().context("stating cast file")?.len();
        if size <= self.max_size {
            return Ok(());
        }

        let target = (self.max_size as f64 * self.trunc_target_pct) as u64;
        self.file.flush().ok();
        let outcome = streaming_truncate(&self.path, target)?;

        match fs::OpenOptions::new().append(true).open(&self.path) {
            Ok(f) => {
                self.file = f;
                self.bytes_written = outcome.new_size;
                self.position.store(outcome.new_size, Ordering::SeqCst);
                self.truncation_epoch.fetch_add(1, Ordering::SeqCst);
                self.consecutive_open_failures = 0;
            }
            Err(e) => {
                self.consecutive_open_failures += 1;
                error!("reopening cast file after truncation failed: {:?}", e);
                if self.consecutive_open_failures >= 3 {
                    return Err(anyhow!("cast-io: failed to reopen cast file 3 times in a row"));
                }
            }
        }

        Ok(())
    }
}

fn run_writer(mut state: WriterState, rx: crossbeam_channel::Receiver<JobEnvelope>) {
    loop {
        match rx.recv_timeout(state.check_interval) {
            Ok(envelope) => {
                let result = handle_job(&mut state, envelope.job);
                let closing = matches!(result, Ok(true));
                let ack_result = result.map(|_| ()).map_err(|e| e.to_string());
                let _ = envelope.ack.send(ack_result);
                if closing {
                    return;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if let Err(e) = state.maybe_truncate() {
                    error!("background cast truncation check failed: {:?}", e);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Returns `Ok(true)` when the job was `Close` and the worker should exit.
fn handle_job(state: &mut WriterState, job: Job) -> anyhow::Result<bool> {
    match job {
        Job::Output(bytes) => {
            state.append_safe_bytes(CastEventKind::Output, bytes)?;
            state.maybe_truncate()?;
            Ok(false)
        }
        Job::Input(bytes) => {
            state.append_safe_bytes(CastEventKind::Input, bytes)?;
            Ok(false)
        }
        Job::Resize(cols, rows) => {
            state.write_event(CastEventKind::Resize, &format!("{cols}x{rows}"))?;
            Ok(false)
        }
        Job::Marker(msg) => {
            state.write_event(CastEventKind::Marker, &msg)?;
            Ok(false)
        }
        Job::RawLine(line) => {
            state.flush_carry()?;
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            state.write_line(&bytes)?;
            Ok(false)
        }
        Job::Close => {
            state.flush_carry()?;
            Ok(true)
        }
    }
}

/// Finds the largest prefix of `buf` that is safe to emit as a cast event
/// right now: it never ends mid-UTF-8-code-point and never ends mid-escape
/// sequence. Anything after the returned index must be carried forward.
fn safe_split_point(buf: &[u8]) -> usize {
    let n = buf.len();
    let mut i = 0;
    let mut last_complete = 0;

    while i < n {
        if buf[i] == 0x1B {
            match scan_escape(&buf[i..]) {
                Some(len) => {
                    i += len;
                    last_complete = i;
                }
                None => return last_complete,
            }
        } else {
            match utf8_char_len(buf[i]) {
                Some(len) => {
                    if i + len <= n {
                        i += len;
                        last_complete = i;
                    } else {
                        return last_complete;
                    }
                }
                None => {
                    // Not a valid UTF-8 lead byte (e.g. a stray continuation
                    // byte); pass it through as a single raw byte rather
                    // than stalling forever.
                    i += 1;
                    last_complete = i;
                }
            }
        }
    }

    last_complete
}

/// Given a slice starting with ESC (0x1B), returns the length of the whole
/// escape sequence if its terminator is present, or `None` if more bytes
/// are needed.
fn scan_escape(seq: &[u8]) -> Option<usize> {
    debug_assert_eq!(seq[0], 0x1B);
    if seq.len() < 2 {
        return None;
    }

    match seq[1] {
        b'[' => {
            // CSI: ESC '[' ... final byte in 0x40..=0x7E.
            for (offset, &b) in seq.iter().enumerate().skip(2) {
                if (0x40..=0x7E).contains(&b) {
                    return Some(offset + 1);
                }
            }
            None
        }
        b']' => {
            // OSC: ESC ']' ... terminated by BEL or ESC '\'.
            let mut j = 2;
            while j < seq.len() {
                if seq[j] == 0x07 {
                    return Some(j + 1);
                }
                if seq[j] == 0x1B {
                    if j + 1 < seq.len() {
                        if seq[j + 1] == b'\\' {
                            return Some(j + 2);
                        }
                        // An ESC that isn't ST inside an OSC is malformed;
                        // treat it as the terminator to avoid stalling.
                        return Some(j);
                    }
                    return None;
                }
                j += 1;
            }
            None
        }
        _ => {
            // Short two-byte escapes (ESC '=' , ESC '>' , ESC 'M', ...).
            Some(2)
        }
    }
}

fn utf8_char_len(lead: u8) -> Option<usize> {
    if lead & 0x80 == 0 {
        Some(1)
    } else if lead & 0xE0 == 0xC0 {
        Some(2)
    } else if lead & 0xF0 == 0xE0 {
        Some(3)
    } else if lead & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}

pub struct TruncateOutcome {
    pub dropped_events: usize,
    pub new_size: u64,
}

/// §4.2.1: reads the cast file line by line into a sliding window whose
/// byte sum stays `<= target`, preserving the header, then atomically
/// replaces the file. Memory use is bounded by `target` plus a constant.
pub fn streaming_truncate(path: &Path, target: u64) -> anyhow::Result<TruncateOutcome> {
    let file = fs::File::open(path).context("opening cast file for truncation")?;
    let mut lines = BufReader::new(file).lines();

    let header_line = lines
        .next()
        .ok_or_else(|| anyhow!("cast file has no header line"))?
        .context("reading cast header line")?;

    let mut window: VecDeque<String> = VecDeque::new();
    let mut window_bytes: u64 = 0;
    let mut dropped = 0usize;

    for line in lines {
        let line = line.context("reading cast event line")?;
        let line_bytes = line.len() as u64 + 1;
        window.push_back(line);
        window_bytes += line_bytes;

        while window_bytes > target && window.len() > 1 {
            if let Some(removed) = window.pop_front() {
                window_bytes -= removed.len() as u64 + 1;
                dropped += 1;
            }
        }
    }

    let header: CastHeader =
        serde_json::from_str(&header_line).context("parsing cast header for truncation")?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".cast-truncate-")
        .tempfile_in(dir)
        .context("creating truncation temp file")?;

    writeln!(tmp, "{}", serde_json::to_string(&header)?)?;
    let mut new_size = header_line.len() as u64 + 1;

    if dropped > 0 {
        let marker_t = unix_timestamp() - header.timestamp;
        let marker_line =
            serde_json::to_string(&(marker_t, "m", format!("[Truncated {dropped} events]")))?;
        writeln!(tmp, "{marker_line}")?;
        new_size += marker_line.len() as u64 + 1;
    }

    for line in &window {
        writeln!(tmp, "{line}")?;
        new_size += line.len() as u64 + 1;
    }

    tmp.flush().context("flushing truncation temp file")?;
    tmp.persist(path).map_err(|e| anyhow!("renaming truncated cast file: {}", e.error))?;

    Ok(TruncateOutcome { dropped_events: dropped, new_size })
}

/// The synchronous variant used at startup recovery: refuses files above
/// `hard_cap` so a huge pre-existing cast file doesn't stall the manager's
/// startup scan; callers should defer truncation to the forwarder's own
/// background check in that case.
pub fn sync_truncate(path: &Path, target: u64, hard_cap: u64) -> Result<TruncateOutcome, TruncateError> {
    let size = fs::metadata(path).map_err(|e| TruncateError::Other(e.into()))?.len();
    if size > hard_cap {
        return Err(TruncateError::TooLarge { size, cap: hard_cap });
    }
    streaming_truncate(path, target).map_err(TruncateError::Other)
}

/// §4.7: reconstructs the output bytes from `from_offset` (in the PTY
/// output stream's own byte coordinates, same as `FanOut::position`) to
/// the end of the cast file's `o` events. Used to replay the gap a
/// resyncing subscriber missed before it switches to the live fan-out.
pub fn read_output_tail(path: &Path, from_offset: u64) -> anyhow::Result<Vec<u8>> {
    let file = fs::File::open(path).context("opening cast file for resync replay")?;
    let mut lines = BufReader::new(file).lines();
    lines.next(); // header line, not an output event

    let mut seen: u64 = 0;
    let mut out = Vec::new();
    for line in lines {
        let line = line.context("reading cast event line for resync replay")?;
        let (_t, kind, data): (f64, String, String) = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue, // a raw (non-event) line, e.g. the exit record
        };
        if CastEventKind::try_from(kind.as_str()) != Ok(CastEventKind::Output) {
            continue;
        }
        let bytes = data.as_bytes();
        let end = seen + bytes.len() as u64;
        if end > from_offset {
            let start_in_event = from_offset.saturating_sub(seen) as usize;
            out.extend_from_slice(&bytes[start_in_event.min(bytes.len())..]);
        }
        seen = end;
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn safe_split_holds_back_incomplete_utf8_lead() {
        // 0xE2 is the lead byte of a 3-byte sequence (e.g. the euro sign).
        let buf = [b'h', b'i', 0xE2];
        assert_eq!(safe_split_point(&buf), 2);
    }

    #[test]
    fn safe_split_emits_complete_utf8() {
        let euro = "€".as_bytes();
        let mut buf = b"ok ".to_vec();
        buf.extend_from_slice(euro);
        assert_eq!(safe_split_point(&buf), buf.len());
    }

    #[test]
    fn safe_split_holds_back_incomplete_csi() {
        let buf = b"abc\x1b[31".to_vec();
        assert_eq!(safe_split_point(&buf), 3);
    }

    #[test]
    fn safe_split_emits_complete_csi() {
        let buf = b"abc\x1b[31mdef".to_vec();
        assert_eq!(safe_split_point(&buf), buf.len());
    }

    #[test]
    fn create_echo_close_round_trips_header_and_event() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("stdout");
        let header = CastHeader::new(80, 24, unix_timestamp());
        let writer = CastWriter::create(&path, header, 10 * 1024 * 1024, Duration::from_secs(30), 0.8)?;

        writer.append_output(b"hello")?;
        writer.append_raw_line(r#"{"exit_code":0,"exited_at":"now"}"#)?;
        writer.close()?;

        let contents = fs::read_to_string(&path)?;
        let mut lines = contents.lines();
        let header_line = lines.next().unwrap();
        assert!(header_line.contains("\"version\":2"));
        let event_line = lines.next().unwrap();
        assert!(event_line.contains("\"o\""));
        assert!(event_line.contains("hello"));
        let exit_line = lines.next().unwrap();
        assert!(exit_line.contains("exit_code"));

        Ok(())
    }

    #[test]
    fn truncation_preserves_header_and_marks_drop() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("stdout");
        let header = CastHeader::new(80, 24, unix_timestamp());
        let writer = CastWriter::create(&path, header, 10 * 1024 * 1024, Duration::from_secs(3600), 0.8)?;
        for i in 0..200 {
            writer.append_output(format!("line {i} {}", "x".repeat(20)).as_bytes())?;
        }
        writer.close()?;

        let size_before = fs::metadata(&path)?.len();
        let target = size_before / 4;
        let outcome = streaming_truncate(&path, target)?;
        assert!(outcome.dropped_events > 0);
        assert!(outcome.new_size <= target + 4096);

        let contents = fs::read_to_string(&path)?;
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().contains("\"version\":2"));
        assert!(lines.any(|l| l.contains("Truncated")));

        Ok(())
    }

    #[test]
    fn writer_bumps_epoch_on_truncation() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("stdout");
        let header = CastHeader::new(80, 24, unix_timestamp());
        let writer = CastWriter::create(&path, header, 512, Duration::from_millis(1), 0.5)?;
        assert_eq!(writer.truncation_epoch(), 0);

        for i in 0..50 {
            writer.append_output(format!("line {i} {}", "x".repeat(20)).as_bytes())?;
        }
        // The background worker's check runs on its own interval; give it
        // a moment past `check_interval` to notice the file is oversize.
        thread::sleep(Duration::from_millis(50));
        writer.append_output(b"nudge")?;
        thread::sleep(Duration::from_millis(50));

        assert!(writer.truncation_epoch() >= 1);
        writer.close()?;
        Ok(())
    }

    #[test]
    fn read_output_tail_reconstructs_bytes_from_offset() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("stdout");
        let header = CastHeader::new(80, 24, unix_timestamp());
        let writer = CastWriter::create(&path, header, 10 * 1024 * 1024, Duration::from_secs(3600), 0.8)?;
        writer.append_output(b"hello ")?;
        writer.append_output(b"world")?;
        writer.close()?;

        let tail = read_output_tail(&path, 6)?;
        assert_eq!(tail, b"world");

        let all = read_output_tail(&path, 0)?;
        assert_eq!(all, b"hello world");

        Ok(())
    }
}
