//! Request-N flow control for outbound producers.
//!
//! A [`Credit`] counts how many items the peer currently permits on one
//! stream. The producer calls [`Credit::acquire`] before emitting each item;
//! REQUEST_N frames from the peer call [`Credit::grant`]. A grant at or above
//! `MAX_REQUEST_N` makes the credit unbounded.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{RSocketError, Result};
use crate::frame::MAX_REQUEST_N;

#[derive(Debug)]
struct State {
    available: u64,
    unbounded: bool,
    cancelled: bool,
}

/// Outstanding demand for one outbound producer.
#[derive(Debug)]
pub struct Credit {
    state: Mutex<State>,
    notify: Notify,
}

impl Credit {
    /// Create a credit with an initial grant.
    pub fn new(initial: u32) -> Self {
        let credit = Self {
            state: Mutex::new(State {
                available: 0,
                unbounded: false,
                cancelled: false,
            }),
            notify: Notify::new(),
        };
        credit.grant(initial);
        credit
    }

    /// Credit that never runs out.
    pub fn unbounded() -> Self {
        Self::new(MAX_REQUEST_N)
    }

    /// Add `n` to the outstanding demand.
    pub fn grant(&self, n: u32) {
        if n == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            if n >= MAX_REQUEST_N {
                state.unbounded = true;
            } else {
                state.available = state.available.saturating_add(n as u64);
            }
        }
        self.notify.notify_one();
    }

    /// Take one unit of credit if available.
    pub fn try_acquire(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(RSocketError::Cancelled);
        }
        if state.unbounded {
            return Ok(true);
        }
        if state.available > 0 {
            state.available -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Wait for one unit of credit.
    ///
    /// # Errors
    ///
    /// `Cancelled` once [`Credit::cancel`] has been called.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            if self.try_acquire()? {
                return Ok(());
            }
            self.notify.notified().await;
        }
    }

    /// Fail current and future `acquire` calls.
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Remaining credit, `None` when unbounded.
    pub fn available(&self) -> Option<u64> {
        let state = self.state.lock();
        if state.unbounded {
            None
        } else {
            Some(state.available)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_grant_and_try_acquire() {
        let credit = Credit::new(2);
        assert!(credit.try_acquire().unwrap());
        assert!(credit.try_acquire().unwrap());
        assert!(!credit.try_acquire().unwrap());
        credit.grant(1);
        assert_eq!(credit.available(), Some(1));
    }

    #[test]
    fn test_max_request_n_is_unbounded() {
        let credit = Credit::new(0);
        credit.grant(MAX_REQUEST_N);
        assert_eq!(credit.available(), None);
        for _ in 0..10_000 {
            assert!(credit.try_acquire().unwrap());
        }
        assert_eq!(Credit::unbounded().available(), None);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_grant() {
        let credit = Arc::new(Credit::new(0));
        let waiter = {
            let credit = credit.clone();
            tokio::spawn(async move { credit.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        credit.grant(1);
        waiter.await.unwrap().unwrap();
        assert_eq!(credit.available(), Some(0));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let credit = Arc::new(Credit::new(0));
        let waiter = {
            let credit = credit.clone();
            tokio::spawn(async move { credit.acquire().await })
        };

        credit.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RSocketError::Cancelled)));
        assert!(credit.is_cancelled());
    }
}
