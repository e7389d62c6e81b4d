//! At-most-one-in-flight sync coordination.
//!
//! A node that rejects a peer block opens a sync with that peer. Without a
//! guard, a burst of rejected blocks would fan out into many concurrent
//! syncs, each holding a candidate block batch. The coordinator is a single
//! slot with a wall-clock deadline: one outstanding sync, released on reply
//! or expiry.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::SYNC_TIMEOUT;

pub struct SyncCoordinator {
    deadline: Mutex<Option<Instant>>,
    timeout: Duration,
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(SYNC_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        SyncCoordinator {
            deadline: Mutex::new(None),
            timeout,
        }
    }

    /// Reserves the slot. Returns false while a sync is pending and its
    /// deadline has not passed; an expired slot is taken over.
    pub fn try_begin(&self) -> bool {
        let mut slot = self.deadline.lock();
        match *slot {
            Some(deadline) if Instant::now() < deadline => false,
            _ => {
                *slot = Some(Instant::now() + self.timeout);
                true
            }
        }
    }

    /// Releases the slot once a reply arrived or the sync was abandoned.
    pub fn complete(&self) {
        *self.deadline.lock() = None;
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.deadline.lock(), Some(deadline) if Instant::now() < deadline)
    }
}
