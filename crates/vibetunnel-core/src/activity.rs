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

//! The activity/exit detector (C9): a small inspector that turns PTY
//! output bytes into `bell`/`prompt`/`idle`/`busy` events. It carries only
//! escape-sequence and idle-timer state of its own; it does not know
//! anything about sessions, notifications, or debouncing — the forwarder
//! maps these onto `session-monitor` notifications (including the
//! `claude-turn` heuristic), per §4.9.

use std::time::{Duration, Instant};

const PROMPT_CHARS: &[u8] = b"$>#%";
const PROMPT_CHAR_UTF8: &str = "\u{276F}"; // '❯'

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityEvent {
    Bell,
    Prompt,
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscState {
    Ground,
    Esc,
    Csi,
    Osc,
    OscEsc,
}

/// One inspector per session forwarder. `inspect` is called with each PTY
/// output chunk; `check_idle` is called on a timer tick (the same shape as
/// the cast writer's background size check) so idle transitions don't
/// require new bytes to arrive.
pub struct ActivityDetector {
    idle_threshold: Duration,
    esc: EscState,
    line_tail: Vec<u8>,
    last_output: Option<Instant>,
    is_idle: bool,
}

impl ActivityDetector {
    pub fn new(idle_threshold: Duration) -> Self {
        ActivityDetector {
            idle_threshold,
            esc: EscState::Ground,
            line_tail: Vec::new(),
            last_output: None,
            is_idle: true,
        }
    }

    /// Processes one chunk of PTY output, returning the events it implies
    /// in the order they're detected. A `Busy` event is emitted first if
    /// the detector had previously gone idle.
    pub fn inspect(&mut self, bytes: &[u8]) -> Vec<ActivityEvent> {
        let mut events = Vec::new();

        if self.is_idle && !bytes.is_empty() {
            self.is_idle = false;
            events.push(ActivityEvent::Busy);
        }
        self.last_output = Some(Instant::now());

        for &b in bytes {
            self.step(b, &mut events);
        }

        events
    }

    /// Call periodically (independent of `inspect`). Emits `Idle` once,
    /// the first time the gap since the last output chunk crosses the
    /// threshold.
    pub fn check_idle(&mut self) -> Option<ActivityEvent> {
        if self.is_idle {
            return None;
        }
        let elapsed = self.last_output.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        if elapsed >= self.idle_threshold {
            self.is_idle = true;
            return Some(ActivityEvent::Idle);
        }
        None
    }

    fn step(&mut self, b: u8, events: &mut Vec<ActivityEvent>) {
        match self.esc {
            EscState::Ground => {
                if b == 0x1B {
                    self.esc = EscState::Esc;
                } else if b == 0x07 {
                    // A bare BEL outside any escape sequence rings the bell.
                    events.push(ActivityEvent::Bell);
                } else if b == b'\n' || b == b'\r' {
                    self.line_tail.clear();
                } else {
                    self.line_tail.push(b);
                    if self.line_tail.len() > 64 {
                        let drop = self.line_tail.len() - 64;
                        self.line_tail.drain(..drop);
                    }
                    self.check_prompt(events);
                }
            }
            EscState::Esc => {
                self.esc = match b {
                    b'[' => EscState::Csi,
                    b']' => EscState::Osc,
                    _ => EscState::Ground,
                };
            }
            EscState::Csi => {
                if (0x40..=0x7E).contains(&b) {
                    self.esc = EscState::Ground;
                }
            }
            EscState::Osc => {
                if b == 0x07 {
                    // BEL in the terminator role: ends the OSC, not a bell.
                    self.esc = EscState::Ground;
                } else if b == 0x1B {
                    self.esc = EscState::OscEsc;
                }
            }
            EscState::OscEsc => {
                // ST is ESC '\\'; anything else reopens ground and lets the
                // byte re-enter the state machine as plain text next call.
                self.esc = EscState::Ground;
                if b != b'\\' {
                    self.step(b, events);
                }
            }
        }
    }

    fn check_prompt(&mut self, events: &mut Vec<ActivityEvent>) {
        let text = String::from_utf8_lossy(&self.line_tail);
        let trimmed = text.trim_end();
        let last_char = trimmed.chars().last();
        let matches = match last_char {
            Some(c) if PROMPT_CHARS.contains(&(c as u8)) => true,
            Some(c) if c.to_string() == PROMPT_CHAR_UTF8 => true,
            _ => false,
        };
        if matches {
            events.push(ActivityEvent::Prompt);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bare_bel_is_a_bell() {
        let mut d = ActivityDetector::new(Duration::from_millis(200));
        let events = d.inspect(b"ready\x07");
        assert!(events.contains(&ActivityEvent::Bell));
    }

    #[test]
    fn osc_terminating_bel_is_not_a_bell() {
        let mut d = ActivityDetector::new(Duration::from_millis(200));
        // OSC 0 ; title BEL — sets the window title, shouldn't ring.
        let events = d.inspect(b"\x1b]0;my title\x07done");
        assert!(!events.contains(&ActivityEvent::Bell));
    }

    #[test]
    fn trailing_dollar_sign_is_a_prompt() {
        let mut d = ActivityDetector::new(Duration::from_millis(200));
        let events = d.inspect(b"user@host:~$ ");
        assert!(events.contains(&ActivityEvent::Prompt));
    }

    #[test]
    fn mid_line_dollar_sign_is_not_a_prompt() {
        let mut d = ActivityDetector::new(Duration::from_millis(200));
        let events = d.inspect(b"echo $HOME is set\n");
        assert!(!events.contains(&ActivityEvent::Prompt));
    }

    #[test]
    fn first_chunk_emits_busy_then_idle_after_threshold() {
        let mut d = ActivityDetector::new(Duration::from_millis(10));
        let events = d.inspect(b"working...");
        assert_eq!(events, vec![ActivityEvent::Busy]);
        assert!(d.check_idle().is_none());

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(d.check_idle(), Some(ActivityEvent::Idle));
        // Only fires once until new output arrives.
        assert_eq!(d.check_idle(), None);
    }

    #[test]
    fn escape_sequence_split_across_chunks_is_still_recognized() {
        let mut d = ActivityDetector::new(Duration::from_millis(200));
        d.inspect(b"\x1b[3");
        let events = d.inspect(b"1mred\x07");
        assert!(events.contains(&ActivityEvent::Bell));
    }
}
