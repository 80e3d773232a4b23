//! Wire framing: a length-prefixed, CRC-validated envelope around opaque
//! contents, plus the byte FIFO and streaming deframer that turn a stream of
//! arbitrarily-chopped socket reads back into whole frames.
//!
//! Wire format: `u32 length (LE) ++ i32 crc (LE) ++ contents`. The CRC is the
//! zlib/IEEE CRC-32 of `contents`, reinterpreted as a signed 32-bit integer so
//! its sign bit survives the wire — a compatibility quirk of the protocol
//! this codec implements, not a Rust-side choice.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// Size of the frame header: a 4-byte length followed by a 4-byte signed CRC.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Ceiling on a single frame's content length, guarding against a corrupted
/// or hostile length field triggering an unbounded allocation.
pub const MAX_FRAME_CONTENTS: u32 = 16 * 1024 * 1024;

/// Computes the zlib/IEEE CRC-32 of `contents`, returned as the signed wire
/// representation (the raw `u32` bit pattern reinterpreted as `i32`).
pub fn checksum(contents: &[u8]) -> i32 {
    crc32fast::hash(contents) as i32
}

/// Encodes `contents` into a complete frame: header followed by contents.
pub fn encode_frame(contents: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + contents.len());
    buf.put_u32_le(contents.len() as u32);
    buf.put_i32_le(checksum(contents));
    buf.put_slice(contents);
    buf.freeze()
}

/// A decoded frame header: the declared content length and expected CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub crc: i32,
}

impl FrameHeader {
    /// Decodes a header from exactly `FRAME_HEADER_SIZE` bytes.
    pub fn decode(mut buf: &[u8]) -> FrameHeader {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
        let length = buf.get_u32_le();
        let crc = buf.get_i32_le();
        FrameHeader { length, crc }
    }

    /// Verifies that `contents` matches this header's declared length and CRC.
    pub fn check(&self, contents: &[u8]) -> Result<(), FrameError> {
        let actual = checksum(contents);
        if actual != self.crc {
            return Err(FrameError::Corrupted {
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }
}

/// A growable FIFO of byte chunks that avoids copying on `put`, and lazily
/// coalesces small adjacent chunks on read so callers see fewer, larger
/// slices without every chunk being joined eagerly.
pub struct ByteFifo {
    chunks: VecDeque<Bytes>,
    total_length: usize,
    join_upto: Option<usize>,
}

impl ByteFifo {
    pub fn new(join_upto: Option<usize>) -> Self {
        ByteFifo {
            chunks: VecDeque::new(),
            total_length: 0,
            join_upto,
        }
    }

    /// Appends a chunk without copying.
    pub fn put(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total_length += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn available_bytes(&self) -> usize {
        self.total_length
    }

    pub fn is_empty(&self) -> bool {
        self.total_length == 0
    }

    /// Returns the next chunk to be consumed, joining it with immediately
    /// following small chunks (up to `join_upto` bytes total) if configured.
    fn next_chunk(&mut self) -> Option<Bytes> {
        let join_upto = self.join_upto?;
        let first = self.chunks.front()?;
        if first.len() >= join_upto {
            return self.chunks.pop_front();
        }
        let mut joined = BytesMut::new();
        while let Some(front) = self.chunks.front() {
            if !joined.is_empty() && joined.len() + front.len() > join_upto {
                break;
            }
            let chunk = self.chunks.pop_front().unwrap();
            joined.put_slice(&chunk);
            if joined.len() >= join_upto {
                break;
            }
        }
        Some(joined.freeze())
    }

    /// Removes and returns up to `max_bytes` bytes from the front of the FIFO.
    pub fn get(&mut self, max_bytes: usize) -> Bytes {
        if max_bytes == 0 || self.is_empty() {
            return Bytes::new();
        }
        let chunk = match self.join_upto {
            Some(_) => self.next_chunk(),
            None => self.chunks.pop_front(),
        };
        let Some(chunk) = chunk else {
            return Bytes::new();
        };
        self.total_length -= chunk.len();
        if chunk.len() <= max_bytes {
            chunk
        } else {
            let head = chunk.slice(0..max_bytes);
            let tail = chunk.slice(max_bytes..);
            self.total_length += tail.len();
            self.chunks.push_front(tail);
            head
        }
    }

    /// Drains every byte currently buffered.
    pub fn get_all(&mut self) -> Bytes {
        self.get(self.total_length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeframerState {
    PreHeader,
    PreContents(FrameHeader),
}

/// Turns a stream of arbitrarily-sized reads back into whole frames.
///
/// Feed raw socket bytes via [`Deframer::push`]; each call returns every
/// frame that became fully available as a result, in order. A corrupted CRC
/// or over-length frame surfaces as an error but does not poison the
/// deframer for subsequent frames.
pub struct Deframer {
    fifo: ByteFifo,
    state: DeframerState,
    max_contents: u32,
}

impl Deframer {
    pub fn new() -> Self {
        Deframer::with_max_contents(MAX_FRAME_CONTENTS)
    }

    pub fn with_max_contents(max_contents: u32) -> Self {
        Deframer {
            fifo: ByteFifo::new(Some(4096)),
            state: DeframerState::PreHeader,
            max_contents,
        }
    }

    /// Feeds newly-read bytes in and drains every frame that is now complete.
    pub fn push(&mut self, chunk: Bytes) -> Vec<Result<Bytes, FrameError>> {
        self.fifo.put(chunk);
        let mut out = Vec::new();
        loop {
            match self.state {
                DeframerState::PreHeader => {
                    if self.fifo.available_bytes() < FRAME_HEADER_SIZE {
                        break;
                    }
                    let header_bytes = self.fifo.get(FRAME_HEADER_SIZE);
                    let header = FrameHeader::decode(&header_bytes);
                    if header.length > self.max_contents {
                        out.push(Err(FrameError::TooLong {
                            length: header.length,
                            limit: self.max_contents,
                        }));
                        self.state = DeframerState::PreHeader;
                        continue;
                    }
                    self.state = DeframerState::PreContents(header);
                }
                DeframerState::PreContents(header) => {
                    if self.fifo.available_bytes() < header.length as usize {
                        break;
                    }
                    let contents = self.fifo.get(header.length as usize);
                    self.state = DeframerState::PreHeader;
                    out.push(header.check(&contents).map(|_| contents));
                }
            }
        }
        out
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Deframer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let frame = encode_frame(b"hello");
        let mut d = Deframer::new();
        let out = d.push(frame);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn reassembles_a_frame_delivered_one_byte_at_a_time() {
        let frame = encode_frame(b"multiplexer");
        let mut d = Deframer::new();
        let mut results = Vec::new();
        for byte in frame.iter() {
            results.extend(d.push(Bytes::copy_from_slice(&[*byte])));
        }
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().as_ref(), b"multiplexer");
    }

    #[test]
    fn detects_corrupted_contents() {
        let mut frame = BytesMut::from(encode_frame(b"hello").as_ref());
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let mut d = Deframer::new();
        let out = d.push(frame.freeze());
        assert!(matches!(out[0], Err(FrameError::Corrupted { .. })));
    }

    #[test]
    fn rejects_over_length_frames_without_jamming_the_stream() {
        let mut d = Deframer::with_max_contents(4);
        let oversized = encode_frame(b"too long for this deframer");
        let out = d.push(oversized);
        assert!(matches!(out[0], Err(FrameError::TooLong { .. })));

        let ok = encode_frame(b"ok");
        let out2 = d.push(ok);
        assert_eq!(out2[0].as_ref().unwrap().as_ref(), b"ok");
    }

    #[test]
    fn handles_multiple_frames_in_one_push() {
        let mut combined = BytesMut::new();
        combined.put_slice(&encode_frame(b"one"));
        combined.put_slice(&encode_frame(b"two"));
        let mut d = Deframer::new();
        let out = d.push(combined.freeze());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().as_ref(), b"one");
        assert_eq!(out[1].as_ref().unwrap().as_ref(), b"two");
    }

    #[test]
    fn fifo_get_splits_chunks_across_boundaries() {
        let mut fifo = ByteFifo::new(None);
        fifo.put(Bytes::from_static(b"abc"));
        fifo.put(Bytes::from_static(b"defg"));
        assert_eq!(fifo.get(5).as_ref(), b"abcde");
        assert_eq!(fifo.get(10).as_ref(), b"fg");
        assert!(fifo.is_empty());
    }
}
