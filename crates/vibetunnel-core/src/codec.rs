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

//! The framed IPC codec (C1): one byte of type, a big-endian four byte
//! length, then `length` bytes of payload, on each of the three socket
//! classes (api.sock, control.sock, ipc.sock).

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};
use thiserror::Error;
use vibetunnel_protocol::FrameKind;

use crate::consts;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    Oversize { size: usize, max: usize },
    #[error("unknown frame type byte {0:#x}")]
    UnknownType(u8),
    #[error("i/o error reading frame: {0}")]
    Io(#[from] io::Error),
}

/// An owned, decoded frame. Unlike `vibetunnel_protocol::Frame`, which
/// borrows its payload, this is what the streaming parser yields since it
/// must own the bytes it has accumulated.
#[derive(Debug, PartialEq)]
pub struct OwnedFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl OwnedFrame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        OwnedFrame { kind, payload }
    }
}

/// Writes one frame: kind byte, big-endian u32 length, payload.
pub fn write_frame<W: Write>(w: &mut W, kind: FrameKind, payload: &[u8]) -> io::Result<()> {
    w.write_u8(kind as u8)?;
    w.write_u32::<BigEndian>(payload.len() as u32)?;
    w.write_all(payload)?;
    Ok(())
}

/// Reads exactly one frame from a blocking reader. Used by the
/// straight-line per-connection pumps (§4.4's inbound/outbound workers)
/// where a dedicated thread already owns the read side of the stream and
/// can afford to block.
pub fn read_frame<R: Read>(r: &mut R, max_payload: usize) -> Result<OwnedFrame, ProtocolError> {
    let kind_byte = r.read_u8()?;
    let kind = FrameKind::try_from(kind_byte).map_err(ProtocolError::UnknownType)?;
    let len = r.read_u32::<BigEndian>()? as usize;
    if len > max_payload {
        return Err(ProtocolError::Oversize { size: len, max: max_payload });
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(OwnedFrame { kind, payload })
}

/// A streaming, partial-read-tolerant frame parser. Feed it arbitrary byte
/// chunks via `feed`; pull out whole frames via `next_frame`. Splitting
/// the same input differently into chunks must yield the same sequence of
/// frames (§8's round-trip property).
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        FrameDecoder { buf: Vec::new(), max_payload }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next whole frame buffered so far, if any. Call
    /// repeatedly until it returns `Ok(None)` to drain everything a single
    /// `feed` may have completed.
    pub fn next_frame(&mut self) -> Result<Option<OwnedFrame>, ProtocolError> {
        const HEADER_LEN: usize = 1 + 4;
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind_byte = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;

        if len > self.max_payload {
            return Err(ProtocolError::Oversize { size: len, max: self.max_payload });
        }

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        // The full frame is buffered; drain it unconditionally before
        // inspecting the type byte so an unknown kind can't wedge the
        // parser into reparsing the same prefix forever (§6: unknown frame
        // types must be tolerated, not fatal to the stream).
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);

        let kind = FrameKind::try_from(kind_byte).map_err(ProtocolError::UnknownType)?;
        Ok(Some(OwnedFrame { kind, payload }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(consts::MAX_FRAME_PAYLOAD)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vibetunnel_protocol::FrameKind;

    fn encoded(frames: &[(FrameKind, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (kind, payload) in frames {
            write_frame(&mut out, *kind, payload).unwrap();
        }
        out
    }

    #[test]
    fn encode_decode_round_trip() {
        let frames = [
            (FrameKind::StdinData, b"hello".as_slice()),
            (FrameKind::Heartbeat, b"".as_slice()),
            (FrameKind::StdoutData, b"world!!".as_slice()),
        ];
        let bytes = encoded(&frames);

        let mut dec = FrameDecoder::default();
        dec.feed(&bytes);

        let mut got = Vec::new();
        while let Some(f) = dec.next_frame().unwrap() {
            got.push(f);
        }

        assert_eq!(got.len(), frames.len());
        for (got, (kind, payload)) in got.iter().zip(frames.iter()) {
            assert_eq!(got.kind, *kind);
            assert_eq!(got.payload, *payload);
        }
    }

    #[test]
    fn arbitrary_chunking_yields_same_frames() {
        let frames = [
            (FrameKind::ControlCmd, br#"{"cmd":"reset-size"}"#.as_slice()),
            (FrameKind::StdoutData, &[0u8; 300][..]),
            (FrameKind::SessionInfo, b"{}".as_slice()),
        ];
        let bytes = encoded(&frames);

        // Feed one byte at a time: the parser must still recover the same
        // three frames.
        let mut dec = FrameDecoder::default();
        let mut got = Vec::new();
        for b in &bytes {
            dec.feed(std::slice::from_ref(b));
            while let Some(f) = dec.next_frame().unwrap() {
                got.push(f);
            }
        }

        assert_eq!(got.len(), frames.len());
        for (got, (kind, payload)) in got.iter().zip(frames.iter()) {
            assert_eq!(got.kind, *kind);
            assert_eq!(got.payload, *payload);
        }
    }

    #[test]
    fn oversize_frame_rejected() {
        let mut out = Vec::new();
        out.write_u8(FrameKind::StdoutData as u8).unwrap();
        out.write_u32::<BigEndian>(10).unwrap();

        let mut dec = FrameDecoder::new(4);
        dec.feed(&out);
        assert!(matches!(dec.next_frame(), Err(ProtocolError::Oversize { size: 10, max: 4 })));
    }

    #[test]
    fn unknown_type_surfaces_as_error_from_blocking_read() {
        let mut buf = Vec::new();
        buf.write_u8(0xFF).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();

        let mut cursor = io::Cursor::new(buf);
        let err = read_frame(&mut cursor, consts::MAX_FRAME_PAYLOAD).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(0xFF)));
    }
}
