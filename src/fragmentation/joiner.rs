//! Inbound reassembly.

use bytes::{Bytes, BytesMut};

use crate::frame::{flags, FrameHeader, PayloadFrame};
use crate::payload::Payload;

/// Ordered fragments of one payload sharing a stream id.
///
/// Fragments are owned by the joiner; dropping it releases each of them
/// exactly once.
#[derive(Debug)]
pub struct Joiner {
    fragments: Vec<PayloadFrame>,
}

impl Joiner {
    /// Start a joiner from the first fragment.
    pub fn new(first: PayloadFrame) -> Self {
        Self {
            fragments: vec![first],
        }
    }

    /// Append a fragment. Returns true once a fragment without FOLLOWS arrives.
    pub fn push(&mut self, fragment: PayloadFrame) -> bool {
        let done = !fragment.header.has_follows();
        self.fragments.push(fragment);
        done
    }

    /// Header of the first fragment.
    pub fn header(&self) -> &FrameHeader {
        &self.fragments[0].header
    }

    pub fn stream_id(&self) -> u32 {
        self.header().stream_id
    }

    /// Number of fragments received so far.
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Concatenated data in arrival order.
    pub fn data(&self) -> Bytes {
        if self.fragments.len() == 1 {
            return self.fragments[0].data.clone();
        }
        let total = self.fragments.iter().map(|f| f.data.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for f in &self.fragments {
            buf.extend_from_slice(&f.data);
        }
        buf.freeze()
    }

    /// Concatenated metadata, stopping at the first fragment without METADATA.
    pub fn metadata(&self) -> Option<Bytes> {
        let mut buf: Option<BytesMut> = None;
        for f in &self.fragments {
            if !f.header.has_metadata() {
                break;
            }
            if let Some(m) = &f.metadata {
                buf.get_or_insert_with(BytesMut::new).extend_from_slice(m);
            }
        }
        buf.map(BytesMut::freeze)
    }

    /// Reassembled payload.
    pub fn payload(&self) -> Payload {
        Payload::new(self.data(), self.metadata())
    }

    /// Collapse into a single frame with the first fragment's type and
    /// initial request-N. COMPLETE is taken from the last fragment.
    pub fn into_frame(self) -> PayloadFrame {
        let payload = self.payload();
        let first = &self.fragments[0];
        let mut frame_flags = first.header.flags & !(flags::FOLLOWS | flags::COMPLETE);
        if let Some(last) = self.fragments.last() {
            frame_flags |= last.header.flags & flags::COMPLETE;
        }
        PayloadFrame::new(
            first.header.stream_id,
            first.header.frame_type,
            frame_flags,
            first.initial_request_n,
            payload,
        )
    }
}
