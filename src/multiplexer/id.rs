//! Stream id allocation.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::frame::MAX_STREAM_ID;

/// Hands out locally initiated stream ids.
///
/// Clients use odd ids starting at 1, servers even ids starting at 2. Ids
/// advance by 2 and wrap within 31 bits; 0 and ids still in use are skipped.
#[derive(Debug)]
pub struct StreamIdGenerator {
    next: AtomicU32,
    server: bool,
}

impl StreamIdGenerator {
    pub fn client() -> Self {
        Self::starting_at(1, false)
    }

    pub fn server() -> Self {
        Self::starting_at(2, true)
    }

    fn starting_at(first: u32, server: bool) -> Self {
        Self {
            next: AtomicU32::new(first),
            server,
        }
    }

    /// Next id for which `in_use` returns false.
    pub fn next(&self, in_use: impl Fn(u32) -> bool) -> u32 {
        loop {
            let id = self.next.fetch_add(2, Ordering::Relaxed) & MAX_STREAM_ID;
            if id == 0 || in_use(id) {
                continue;
            }
            return id;
        }
    }

    /// Whether `stream_id` has this side's parity.
    pub fn is_local(&self, stream_id: u32) -> bool {
        (stream_id % 2 == 0) == self.server
    }
}
