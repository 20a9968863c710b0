//! Fragmentation engine - splitting oversized frames and reassembling them.
//!
//! - [`Splitter`] turns one payload frame into fragments of at most `unit` bytes
//! - [`Joiner`] accumulates fragments until one arrives without FOLLOWS
//! - [`Reassembler`] keeps at most one joiner per stream id for the read loop

mod joiner;
mod splitter;

pub use joiner::Joiner;
pub use splitter::Splitter;

use crate::frame::{PayloadFrame, HEADER_LEN, MAX_U24};
use crate::stream::StreamTable;

/// Smallest valid fragment unit.
pub const MIN_FRAGMENT: usize = HEADER_LEN + 4;

/// Largest valid fragment unit.
pub const MAX_FRAGMENT: usize = MAX_U24;

/// Per-connection joiners keyed by stream id.
#[derive(Default)]
pub struct Reassembler {
    joiners: StreamTable<Joiner>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound payload-carrying frame.
    ///
    /// Returns the complete frame once reassembly finishes, or `None` while
    /// fragments are still outstanding. A frame without FOLLOWS on a stream
    /// with no pending joiner passes straight through.
    pub fn accept(&self, frame: PayloadFrame) -> Option<PayloadFrame> {
        let stream_id = frame.stream_id();

        let mut pending = Some(frame);
        let pushed = self.joiners.update_or_take(stream_id, |joiner| match pending.take() {
            Some(fragment) => joiner.push(fragment),
            None => false,
        });

        match pushed {
            Some(Some(joiner)) => {
                tracing::debug!(
                    "stream {}: reassembled {} fragments",
                    stream_id,
                    joiner.len()
                );
                Some(joiner.into_frame())
            }
            Some(None) => None,
            None => {
                let frame = pending?;
                if !frame.header.has_follows() {
                    return Some(frame);
                }
                self.joiners.insert(stream_id, Joiner::new(frame));
                None
            }
        }
    }

    /// Drop any joiner for the stream. No-op if there is none.
    pub fn discard(&self, stream_id: u32) -> bool {
        self.joiners.remove(stream_id).is_some()
    }

    /// Drop every joiner (connection close).
    pub fn clear(&self) -> usize {
        self.joiners.drain().len()
    }

    /// Number of streams with a reassembly in progress.
    pub fn in_progress(&self) -> usize {
        self.joiners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{flags, Frame, FrameType};
    use crate::payload::Payload;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn split(frame: PayloadFrame, unit: usize) -> Vec<PayloadFrame> {
        Splitter::new(unit)
            .unwrap()
            .split_to_vec(frame)
            .into_iter()
            .map(|f| f.as_payload_frame().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_unfragmented_passes_through() {
        let reassembler = Reassembler::new();
        let frame = PayloadFrame::new(1, FrameType::Payload, flags::NEXT, None, Payload::from("x"));
        assert_eq!(reassembler.accept(frame.clone()), Some(frame));
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_interleaved_streams() {
        let reassembler = Reassembler::new();
        let a = PayloadFrame::new(1, FrameType::RequestResponse, 0, None, Payload::from_data(vec![1u8; 40]));
        let b = PayloadFrame::new(3, FrameType::RequestFnf, 0, None, Payload::from_data(vec![2u8; 40]));
        let mut parts_a = split(a.clone(), 16).into_iter();
        let mut parts_b = split(b.clone(), 16).into_iter();

        let mut done = Vec::new();
        loop {
            let (x, y) = (parts_a.next(), parts_b.next());
            if x.is_none() && y.is_none() {
                break;
            }
            for part in x.into_iter().chain(y) {
                if let Some(frame) = reassembler.accept(part) {
                    done.push(frame);
                }
            }
        }

        assert_eq!(done, vec![a, b]);
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_discard_drops_joiner() {
        let reassembler = Reassembler::new();
        let frame = PayloadFrame::new(5, FrameType::RequestStream, 0, Some(4), Payload::from_data(vec![0u8; 64]));
        let mut parts = split(frame, 16).into_iter();
        assert!(reassembler.accept(parts.next().unwrap()).is_none());
        assert_eq!(reassembler.in_progress(), 1);

        assert!(reassembler.discard(5));
        assert!(!reassembler.discard(5));
        assert_eq!(reassembler.clear(), 0);
    }

    proptest! {
        #[test]
        fn prop_split_join_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            metadata in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..512)),
            unit in MIN_FRAGMENT..600usize,
            request_stream in any::<bool>(),
        ) {
            let (ty, n) = if request_stream {
                (FrameType::RequestStream, Some(7))
            } else {
                (FrameType::RequestResponse, None)
            };
            let payload = Payload::new(Bytes::from(data), metadata.map(Bytes::from));
            let original = PayloadFrame::new(11, ty, 0, n, payload);

            let out = Splitter::new(unit).unwrap().split_to_vec(original.clone());
            let last = out.len() - 1;
            for (i, f) in out.iter().enumerate() {
                let pf = f.as_payload_frame().unwrap();
                prop_assert_eq!(pf.header.has_follows(), i != last);
                if i > 0 {
                    prop_assert!(matches!(f, Frame::Payload(_)));
                }
            }

            let reassembler = Reassembler::new();
            let mut joined = None;
            for f in out {
                let pf = f.as_payload_frame().unwrap().clone();
                if let Some(done) = reassembler.accept(pf) {
                    joined = Some(done);
                }
            }
            let joined = joined.unwrap();
            prop_assert_eq!(joined.data, original.data);
            prop_assert_eq!(joined.metadata, original.metadata);
            prop_assert_eq!(joined.initial_request_n, original.initial_request_n);
        }
    }
}
