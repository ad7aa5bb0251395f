//! Reassembles ODAS JSON frames from an unframed TCP byte stream.
//!
//! ODAS writes each frame as a pretty-printed JSON object followed by a
//! newline and nothing else, so the only marker between two frames is the
//! closing brace of one, a newline, and the opening brace of the next:
//!
//! ```text
//! {
//!     "timeStamp": 1,
//!     "src": [ ... ]
//! }
//! {
//!     "timeStamp": 2,
//! ```
//!
//! The decoder splits on that literal `}\n{` sequence. The split consumes the
//! braces, so they are put back before parsing. The match is byte-level and
//! not JSON-aware: a string value containing `}\n{` is cut in two, and a frame
//! whose last member is an object (`}}\n{`) loses its outer brace and is
//! dropped. Both are properties of the wire format the producer uses.

use bytes::{Buf, BytesMut};
use serde_json::Value;

const BOUNDARY: &[u8] = b"}\n{";

const INITIAL_CAPACITY: usize = 8 * 1024;

/// Per-connection stream decoder. Owns the pending byte buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Offset into `buf` below which no boundary can start.
    scan_from: usize,
    decoded: u64,
    dropped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            scan_from: 0,
            decoded: 0,
            dropped: 0,
        }
    }

    /// Append a chunk and return every frame it completed, in wire order.
    ///
    /// The text after the last boundary is always kept for the next call,
    /// even if it already looks complete: more of it may still be in flight.
    /// Fragments that fail to parse are skipped and counted in [`dropped`].
    ///
    /// [`dropped`]: FrameDecoder::dropped
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        self.decode()
    }

    /// Pending buffer with at least `additional` bytes of spare capacity, for
    /// reading from a socket without an intermediate copy. Only append to it,
    /// then call [`decode`].
    ///
    /// [`decode`]: FrameDecoder::decode
    pub fn read_buffer(&mut self, additional: usize) -> &mut BytesMut {
        self.buf.reserve(additional);
        &mut self.buf
    }

    /// Extract every complete frame from the pending buffer. `feed` is this
    /// plus an append.
    pub fn decode(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        let mut start = 0;
        let mut search_from = self.scan_from.min(self.buf.len());

        while let Some(offset) = find_boundary(&self.buf[search_from..]) {
            let end = search_from + offset;
            match reconstruct(&self.buf[start..end]) {
                Some(frame) => {
                    self.decoded += 1;
                    frames.push(frame);
                }
                None => self.dropped += 1,
            }
            start = end + BOUNDARY.len();
            search_from = start;
        }

        if start > 0 {
            self.buf.advance(start);
        }
        // A boundary may straddle this chunk and the next one.
        self.scan_from = self.buf.len().saturating_sub(BOUNDARY.len() - 1);

        frames
    }

    /// Bytes held back waiting for the next boundary.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Frames successfully parsed since construction.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Fragments discarded because they were not valid JSON.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Discard any buffered bytes. Counters are kept.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scan_from = 0;
    }
}

fn find_boundary(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(BOUNDARY.len())
        .position(|window| window == BOUNDARY)
}

/// Restore the braces eaten by the split and parse.
fn reconstruct(fragment: &[u8]) -> Option<Value> {
    let mut text = Vec::with_capacity(fragment.len() + 2);
    if fragment.first() != Some(&b'{') {
        text.push(b'{');
    }
    text.extend_from_slice(fragment);

    let trimmed = text
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    text.truncate(trimmed);
    if text.last() != Some(&b'}') {
        text.push(b'}');
    }

    serde_json::from_slice(&text).ok()
}
