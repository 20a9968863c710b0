//! Outbound fragmentation.

use bytes::Bytes;

use super::{MAX_FRAGMENT, MIN_FRAGMENT};
use crate::error::{RSocketError, Result};
use crate::frame::{flags, Frame, FrameType, PayloadFrame, HEADER_LEN};
use crate::payload::Payload;

/// Splits oversized payload frames into fragments no larger than the unit.
///
/// Each fragment is filled greedily, metadata bytes first. The first
/// fragment keeps the original type (and initial request-N); continuations
/// are PAYLOAD frames with NEXT. Every fragment but the last carries FOLLOWS,
/// and an original COMPLETE moves to the last fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Splitter {
    unit: usize,
}

impl Splitter {
    /// Create a splitter for the given fragment unit.
    ///
    /// # Errors
    ///
    /// `InvalidFragmentSize` if `unit` is outside `MIN_FRAGMENT..=MAX_FRAGMENT`.
    pub fn new(unit: usize) -> Result<Self> {
        if !(MIN_FRAGMENT..=MAX_FRAGMENT).contains(&unit) {
            return Err(RSocketError::InvalidFragmentSize {
                size: unit,
                min: MIN_FRAGMENT,
                max: MAX_FRAGMENT,
            });
        }
        Ok(Self { unit })
    }

    #[inline]
    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Whether a frame of `total_size` encoded bytes needs splitting.
    #[inline]
    pub fn should_split(&self, total_size: usize) -> bool {
        total_size > self.unit
    }

    /// Split `frame`, calling `on_frame` once per fragment in order.
    ///
    /// A frame that already fits is handed through unchanged.
    pub fn split<F>(&self, frame: PayloadFrame, mut on_frame: F)
    where
        F: FnMut(Frame),
    {
        if !self.should_split(frame.encoded_len()) {
            on_frame(frame.into_frame());
            return;
        }

        let stream_id = frame.header.stream_id;
        let frame_type = frame.header.frame_type;
        let original_flags = frame.header.flags;
        let initial_request_n = frame.initial_request_n;
        let has_metadata = frame.metadata.is_some();
        let metadata = frame.metadata.unwrap_or_default();
        let data = frame.data;

        let mut metadata_cursor = 0;
        let mut data_cursor = 0;
        let mut first = true;

        loop {
            let keep = if first && frame_type.has_initial_request_n() {
                4
            } else {
                0
            };
            let writes_metadata =
                has_metadata && (metadata_cursor < metadata.len() || (first && metadata.is_empty()));
            let overhead = HEADER_LEN + keep + if writes_metadata { 3 } else { 0 };
            // Degenerate units still make progress one byte at a time.
            let mut capacity = self.unit.saturating_sub(overhead).max(1);

            let metadata_chunk = take(&metadata, &mut metadata_cursor, &mut capacity);
            let data_chunk = take(&data, &mut data_cursor, &mut capacity);

            let follows = metadata_cursor < metadata.len() || data_cursor < data.len();

            let (ty, mut fragment_flags, request_n) = if first {
                let base = original_flags & !(flags::FOLLOWS | flags::COMPLETE | flags::METADATA);
                (frame_type, base, initial_request_n)
            } else {
                (FrameType::Payload, flags::NEXT, None)
            };
            if follows {
                fragment_flags |= flags::FOLLOWS;
            } else {
                fragment_flags |= original_flags & flags::COMPLETE;
            }

            let fragment_metadata = if writes_metadata {
                Some(metadata_chunk)
            } else {
                None
            };
            let fragment = PayloadFrame::new(
                stream_id,
                ty,
                fragment_flags,
                request_n,
                Payload::new(data_chunk, fragment_metadata),
            );
            on_frame(fragment.into_frame());

            if !follows {
                break;
            }
            first = false;
        }
    }

    /// Split into a vector of fragments.
    pub fn split_to_vec(&self, frame: PayloadFrame) -> Vec<Frame> {
        let mut out = Vec::new();
        self.split(frame, |f| out.push(f));
        out
    }
}

/// Take up to `capacity` bytes from `src` starting at `cursor`.
fn take(src: &Bytes, cursor: &mut usize, capacity: &mut usize) -> Bytes {
    let n = (*capacity).min(src.len() - *cursor);
    let chunk = src.slice(*cursor..*cursor + n);
    *cursor += n;
    *capacity -= n;
    chunk
}
