//! Segmentation of oversized backend-dialect bodies and per-uplink
//! reassembly.
//!
//! A body larger than [`MAX_FRAME`] is split into N chunks, each wrapped
//! in its own `Segment` frame carrying `(amount, seq, chunk)` with a
//! constant `amount = N` and `seq` running 0..N.  Chunks are equal-sized
//! except the last, which may be shorter.  Segments of different logical
//! messages never interleave on one uplink, so reassembly is a single
//! buffer per connection.

use bytes::Bytes;

use crate::wire::Writer;
use crate::{ByteOrder, CodecError, MAX_FRAME};

/// Per-segment wire overhead: type tag (1) + amount (2) + seq (2) plus
/// the frame length prefix (2).
pub const SEGMENT_OVERHEAD: usize = 7;

/// Payload bytes one segment frame can carry.
pub const SEGMENT_CAPACITY: usize = MAX_FRAME - SEGMENT_OVERHEAD;

const TAG_SEGMENT: u8 = 1;

/// Splits `body` into a run of length-prefixed `Segment` frames.
///
/// Fails with `MessageTooLarge` when the body would need more than
/// `u16::MAX` segments.
pub fn segment_frames(body: &[u8], order: ByteOrder) -> Result<Bytes, CodecError> {
    let groups = body.len().div_ceil(SEGMENT_CAPACITY);
    if groups > u16::MAX as usize {
        return Err(CodecError::MessageTooLarge);
    }
    let chunk = body.len().div_ceil(groups);
    let amount = body.len().div_ceil(chunk) as u16;

    let mut out = Vec::with_capacity(body.len() + amount as usize * SEGMENT_OVERHEAD);
    for (seq, part) in body.chunks(chunk).enumerate() {
        let mut w = Writer::with_capacity(SEGMENT_OVERHEAD + part.len(), order);
        w.u16((1 + 2 + 2 + part.len()) as u16);
        w.u8(TAG_SEGMENT);
        w.u16(amount);
        w.u16(seq as u16);
        w.bytes(part);
        out.extend_from_slice(&w.into_inner());
    }
    Ok(Bytes::from(out))
}

/// Outcome of feeding one segment to a [`SegmentBuffer`].
#[derive(Debug, PartialEq, Eq)]
pub enum SegmentPush {
    /// More segments expected.
    Pending,
    /// The run completed; here is the reassembled body.
    Complete(Vec<u8>),
    /// The segment was inconsistent with the buffered run; everything
    /// buffered so far was discarded.
    Dropped(SegmentDrop),
}

#[derive(Debug, PartialEq, Eq)]
pub enum SegmentDrop {
    /// `seq == 0` arrived while a previous run was still incomplete.
    /// The new run replaces it; only the old bytes were dropped.
    PreviousIncomplete,
    /// A follow-up segment arrived with no run in progress.
    NoRun,
    /// `amount` did not match the run in progress.
    AmountMismatch { expected: u16, got: u16 },
    /// `seq` skipped ahead or repeated.
    OutOfOrder { expected: u16, got: u16 },
}

/// Reassembles one uplink's segment runs back into logical bodies.
#[derive(Debug, Default)]
pub struct SegmentBuffer {
    buf: Vec<u8>,
    amount: u16,
    next_seq: u16,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.amount = 0;
        self.next_seq = 0;
    }

    pub fn push(&mut self, amount: u16, seq: u16, frame: &[u8]) -> SegmentPush {
        if seq == 0 {
            let stale = !self.buf.is_empty();
            self.reset();
            self.buf.extend_from_slice(frame);
            self.amount = amount;
            self.next_seq = 1;
            if amount <= 1 {
                let body = std::mem::take(&mut self.buf);
                self.reset();
                return SegmentPush::Complete(body);
            }
            if stale {
                return SegmentPush::Dropped(SegmentDrop::PreviousIncomplete);
            }
            return SegmentPush::Pending;
        }
        if self.buf.is_empty() {
            return SegmentPush::Dropped(SegmentDrop::NoRun);
        }
        if amount != self.amount {
            let expected = self.amount;
            self.reset();
            return SegmentPush::Dropped(SegmentDrop::AmountMismatch {
                expected,
                got: amount,
            });
        }
        if seq != self.next_seq {
            let expected = self.next_seq;
            self.reset();
            return SegmentPush::Dropped(SegmentDrop::OutOfOrder { expected, got: seq });
        }
        self.buf.extend_from_slice(frame);
        self.next_seq += 1;
        if seq == self.amount - 1 {
            let body = std::mem::take(&mut self.buf);
            self.reset();
            return SegmentPush::Complete(body);
        }
        SegmentPush::Pending
    }
}
