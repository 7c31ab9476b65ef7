//! Self-describing, checksummed, compressed block of frames.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "RBX1"
//!      4     1  format version
//!      5    16  player id
//!     21     8  start timestamp (ms)
//!     29     8  end timestamp (ms)
//!     37     4  tick rate (samples per second)
//!     41     4  capture radius (f32)
//!     45     4  frame count
//!     49     4  uncompressed payload length
//!     53     4  compressed payload length
//!     57     4  checksum of the compressed payload
//!     61     3  zero padding
//!     64     -  raw-deflate payload: keyframe, then one delta per frame
//! ```
//!
//! Frames are rebuilt by replaying deltas from the keyframe, so random
//! access is O(index). Use a [`SegmentCursor`] when stepping through many
//! frames.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use log::warn;
use uuid::Uuid;

use crate::checksum::rolling_hash;
use crate::codec::ByteReader;
use crate::constants::{SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_MAX_BYTES, SEGMENT_VERSION};
use crate::delta::Delta;
use crate::error::FormatError;
use crate::frame::Frame;

/// Smallest size cap a builder accepts; a keyframe alone must always fit.
const MIN_SEGMENT_BYTES: usize = SEGMENT_HEADER_SIZE + 256;

/// Flags plus a one byte time gap.
const MIN_DELTA_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentHeader {
    pub player_id: Uuid,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub tick_rate: u32,
    pub capture_radius: f32,
    pub frame_count: u32,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    pub checksum: u32,
}

impl SegmentHeader {
    fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&SEGMENT_MAGIC);
        out.push(SEGMENT_VERSION);
        out.extend_from_slice(self.player_id.as_bytes());
        out.extend_from_slice(&self.start_timestamp.to_be_bytes());
        out.extend_from_slice(&self.end_timestamp.to_be_bytes());
        out.extend_from_slice(&self.tick_rate.to_be_bytes());
        out.extend_from_slice(&self.capture_radius.to_be_bytes());
        out.extend_from_slice(&self.frame_count.to_be_bytes());
        out.extend_from_slice(&self.uncompressed_len.to_be_bytes());
        out.extend_from_slice(&self.compressed_len.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.resize(start + SEGMENT_HEADER_SIZE, 0);
    }

    fn read(bytes: &[u8]) -> Result<SegmentHeader, FormatError> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return Err(FormatError::Truncated {
                needed: SEGMENT_HEADER_SIZE,
                found: bytes.len(),
            });
        }
        let mut reader = ByteReader::new(&bytes[..SEGMENT_HEADER_SIZE]);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(reader.take(4)?);
        if magic != SEGMENT_MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }
        let version = reader.u8()?;
        if version != SEGMENT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        Ok(SegmentHeader {
            player_id: Uuid::from_bytes(reader.bytes16()?),
            start_timestamp: reader.i64()?,
            end_timestamp: reader.i64()?,
            tick_rate: reader.u32()?,
            capture_radius: reader.f32()?,
            frame_count: reader.u32()?,
            uncompressed_len: reader.u32()?,
            compressed_len: reader.u32()?,
            checksum: reader.u32()?,
        })
    }
}

/// One keyframe plus a run of deltas, together with its encoded bytes.
#[derive(Debug, Clone)]
pub struct Segment {
    header: SegmentHeader,
    keyframe: Frame,
    deltas: Vec<Delta>,
    encoded: Vec<u8>,
}

/// Encodes runs of frames into [`Segment`]s.
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    player_id: Uuid,
    tick_rate: u32,
    capture_radius: f32,
    max_bytes: usize,
}

impl SegmentBuilder {
    pub fn new(player_id: Uuid) -> Self {
        Self {
            player_id,
            tick_rate: 20,
            capture_radius: 0.0,
            max_bytes: SEGMENT_MAX_BYTES,
        }
    }

    pub fn tick_rate(mut self, tick_rate: u32) -> Self {
        self.tick_rate = tick_rate;
        self
    }

    pub fn capture_radius(mut self, radius: f32) -> Self {
        self.capture_radius = radius;
        self
    }

    /// Lower the size cap. Values above the format's hard cap are clamped
    /// to it.
    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes.clamp(MIN_SEGMENT_BYTES, SEGMENT_MAX_BYTES);
        self
    }

    /// Encode `frames` (oldest first). Trailing frames that would push the
    /// segment past its size cap are dropped.
    pub fn build<'a, I>(&self, frames: I) -> Result<Segment, FormatError>
    where
        I: IntoIterator<Item = &'a Frame>,
    {
        let mut frames = frames.into_iter();
        let mut keyframe = frames.next().ok_or(FormatError::Empty)?.clone();
        keyframe.player_id = self.player_id;

        let payload_budget = self.max_bytes - SEGMENT_HEADER_SIZE;
        let mut payload = Vec::with_capacity(4096);
        keyframe.write_keyframe(&mut payload);

        let mut reconstructed = keyframe.clone();
        let mut deltas = Vec::new();
        // (payload length, timestamp) after each retained delta
        let mut marks: Vec<(usize, i64)> = Vec::new();
        let mut dropped = 0usize;

        for frame in frames.by_ref() {
            let delta = Delta::compute(&reconstructed, frame);
            if payload.len() + delta.encoded_len() > payload_budget {
                dropped = 1;
                break;
            }
            delta.encode(&mut payload);
            delta.apply_in_place(&mut reconstructed);
            marks.push((payload.len(), reconstructed.timestamp));
            deltas.push(delta);
        }
        dropped += frames.count();

        let mut compressed = deflate(&payload)?;
        while SEGMENT_HEADER_SIZE + compressed.len() > self.max_bytes && !deltas.is_empty() {
            let cut = (deltas.len() / 4).max(1);
            let keep = deltas.len() - cut;
            deltas.truncate(keep);
            marks.truncate(keep);
            dropped += cut;
            let payload_len = marks.last().map_or_else(|| keyframe_len(&keyframe), |m| m.0);
            payload.truncate(payload_len);
            compressed = deflate(&payload)?;
        }

        if dropped > 0 {
            warn!(
                "segment for {} hit the {} byte cap, dropped {} trailing frames",
                self.player_id, self.max_bytes, dropped
            );
        }

        let header = SegmentHeader {
            player_id: self.player_id,
            start_timestamp: keyframe.timestamp,
            end_timestamp: marks.last().map_or(keyframe.timestamp, |m| m.1),
            tick_rate: self.tick_rate,
            capture_radius: self.capture_radius,
            frame_count: (deltas.len() + 1) as u32,
            uncompressed_len: payload.len() as u32,
            compressed_len: compressed.len() as u32,
            checksum: rolling_hash(&compressed),
        };

        let mut encoded = Vec::with_capacity(SEGMENT_HEADER_SIZE + compressed.len());
        header.write(&mut encoded);
        encoded.extend_from_slice(&compressed);

        Ok(Segment {
            header,
            keyframe,
            deltas,
            encoded,
        })
    }
}

fn keyframe_len(keyframe: &Frame) -> usize {
    let mut scratch = Vec::with_capacity(128);
    keyframe.write_keyframe(&mut scratch);
    scratch.len()
}

fn deflate(payload: &[u8]) -> Result<Vec<u8>, FormatError> {
    let out = Vec::with_capacity(payload.len() / 2 + 64);
    let mut encoder = DeflateEncoder::new(out, Compression::default());
    encoder
        .write_all(payload)
        .and_then(|_| encoder.finish())
        .map_err(|e| FormatError::Compression(e.to_string()))
}

impl Segment {
    /// Decode a serialized segment, verifying the checksum before touching
    /// the compressed payload.
    pub fn deserialize(bytes: &[u8]) -> Result<Segment, FormatError> {
        let header = SegmentHeader::read(bytes)?;

        let compressed = &bytes[SEGMENT_HEADER_SIZE..];
        if compressed.len() != header.compressed_len as usize {
            return Err(FormatError::CompressedLengthMismatch {
                expected: header.compressed_len as usize,
                found: compressed.len(),
            });
        }

        let computed = rolling_hash(compressed);
        if computed != header.checksum {
            return Err(FormatError::ChecksumMismatch {
                expected: header.checksum,
                computed,
            });
        }

        let expected_len = header.uncompressed_len as usize;
        if expected_len > SEGMENT_MAX_BYTES {
            return Err(FormatError::PayloadTooLarge(expected_len));
        }
        let mut payload = Vec::with_capacity(expected_len);
        DeflateDecoder::new(compressed)
            .take(expected_len as u64 + 1)
            .read_to_end(&mut payload)
            .map_err(|e| FormatError::Decompression(e.to_string()))?;
        if payload.len() != expected_len {
            return Err(FormatError::DecompressedLengthMismatch {
                expected: expected_len,
                found: payload.len(),
            });
        }

        if header.frame_count == 0 {
            return Err(FormatError::Empty);
        }

        let mut reader = ByteReader::new(&payload);
        let keyframe = Frame::read_keyframe(&mut reader, header.player_id)?;
        let frame_count = header.frame_count as usize;
        // Every delta takes at least MIN_DELTA_LEN bytes.
        if frame_count - 1 > reader.remaining() / MIN_DELTA_LEN {
            return Err(FormatError::FrameCountMismatch {
                expected: frame_count,
                found: 1 + reader.remaining() / MIN_DELTA_LEN,
            });
        }
        let mut deltas = Vec::with_capacity(frame_count - 1);
        let mut timestamp = keyframe.timestamp;
        while deltas.len() + 1 < frame_count {
            if reader.remaining() == 0 {
                return Err(FormatError::FrameCountMismatch {
                    expected: frame_count,
                    found: deltas.len() + 1,
                });
            }
            let delta = Delta::decode(&mut reader)?;
            timestamp = timestamp.wrapping_add(delta.time_delta);
            deltas.push(delta);
        }
        if reader.remaining() > 0 {
            return Err(FormatError::TrailingBytes(reader.remaining()));
        }
        if keyframe.timestamp != header.start_timestamp {
            return Err(FormatError::TimestampMismatch {
                field: "start",
                expected: header.start_timestamp,
                found: keyframe.timestamp,
            });
        }
        if timestamp != header.end_timestamp {
            return Err(FormatError::TimestampMismatch {
                field: "end",
                expected: header.end_timestamp,
                found: timestamp,
            });
        }

        Ok(Segment {
            header,
            keyframe,
            deltas,
            encoded: bytes.to_vec(),
        })
    }

    /// The serialized form: header followed by the compressed payload.
    pub fn serialize(&self) -> &[u8] {
        &self.encoded
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded.len()
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn player_id(&self) -> Uuid {
        self.header.player_id
    }

    pub fn start_timestamp(&self) -> i64 {
        self.header.start_timestamp
    }

    pub fn end_timestamp(&self) -> i64 {
        self.header.end_timestamp
    }

    pub fn frame_count(&self) -> usize {
        1 + self.deltas.len()
    }

    pub fn keyframe(&self) -> &Frame {
        &self.keyframe
    }

    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    /// Rebuild frame `index` by replaying deltas from the keyframe.
    pub fn reconstruct_frame(&self, index: usize) -> Option<Frame> {
        self.cursor().seek(index).cloned()
    }

    /// The last frame captured at or before `timestamp`.
    pub fn frame_at(&self, timestamp: i64) -> Option<Frame> {
        self.cursor().seek_timestamp(timestamp).cloned()
    }

    pub fn frames(&self) -> Frames<'_> {
        Frames {
            cursor: self.cursor(),
            next: 0,
        }
    }

    pub fn cursor(&self) -> SegmentCursor<'_> {
        SegmentCursor {
            segment: self,
            index: 0,
            frame: self.keyframe.clone(),
        }
    }
}

/// Remembers the last reconstructed frame so forward seeks only replay the
/// deltas in between. Seeking backwards restarts from the keyframe.
#[derive(Debug, Clone)]
pub struct SegmentCursor<'a> {
    segment: &'a Segment,
    index: usize,
    frame: Frame,
}

impl<'a> SegmentCursor<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &Frame {
        &self.frame
    }

    pub fn seek(&mut self, index: usize) -> Option<&Frame> {
        if index >= self.segment.frame_count() {
            return None;
        }
        if index < self.index {
            self.frame.copy_from(&self.segment.keyframe);
            self.index = 0;
        }
        while self.index < index {
            self.segment.deltas[self.index].apply_in_place(&mut self.frame);
            self.index += 1;
        }
        Some(&self.frame)
    }

    /// Position on the last frame whose timestamp is `<= timestamp`.
    pub fn seek_timestamp(&mut self, timestamp: i64) -> Option<&Frame> {
        if timestamp < self.segment.start_timestamp() {
            return None;
        }
        if self.frame.timestamp > timestamp {
            self.seek(0);
        }
        while self.index + 1 < self.segment.frame_count() {
            let next = &self.segment.deltas[self.index];
            if self.frame.timestamp.wrapping_add(next.time_delta) > timestamp {
                break;
            }
            next.apply_in_place(&mut self.frame);
            self.index += 1;
        }
        Some(&self.frame)
    }
}

/// Iterator over every frame of a segment, in capture order.
pub struct Frames<'a> {
    cursor: SegmentCursor<'a>,
    next: usize,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let frame = self.cursor.seek(self.next)?.clone();
        self.next += 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.cursor.segment.frame_count().saturating_sub(self.next);
        (left, Some(left))
    }
}
