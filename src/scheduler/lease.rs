//! Checked-out box handle

use std::fmt;
use std::ops::Deref;

use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use super::BoxScheduler;
use crate::sandbox::Sandbox;

/// A sandbox checked out of a [`BoxScheduler`].
///
/// Holds the slot and memory reservation for as long as it lives. Call
/// [`BoxLease::release`] to tear the box down; dropping a lease without it
/// still gives the slot back, but leaves the box for the next init to repair.
pub struct BoxLease {
    sandbox: Box<dyn Sandbox>,
    box_id: u32,
    memory_quota: u32,
    scheduler: BoxScheduler,
    released: bool,
    // Dropped after `Drop::drop` has returned the box ID
    _memory: Option<OwnedSemaphorePermit>,
    _slot: OwnedSemaphorePermit,
}

impl BoxLease {
    pub(super) fn new(
        sandbox: Box<dyn Sandbox>,
        scheduler: BoxScheduler,
        memory_quota: u32,
        slot: OwnedSemaphorePermit,
        memory: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            box_id: sandbox.box_id(),
            memory_quota,
            sandbox,
            scheduler,
            released: false,
            _memory: memory,
            _slot: slot,
        }
    }

    /// Destroy the box and hand its slot and memory back to the scheduler.
    ///
    /// Cleanup failures are logged; the slot is recovered regardless.
    pub async fn release(mut self) {
        if let Err(e) = self.sandbox.close().await {
            warn!("Could not release sandbox {}: {}", self.box_id, e);
        }
        self.released = true;
    }
}

impl Deref for BoxLease {
    type Target = dyn Sandbox;

    fn deref(&self) -> &Self::Target {
        self.sandbox.as_ref()
    }
}

impl fmt::Debug for BoxLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxLease")
            .field("box_id", &self.box_id)
            .field("memory_quota", &self.memory_quota)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        if !self.released {
            warn!("Box {} was dropped without being released", self.box_id);
        }
        self.scheduler.return_id(self.box_id);
        self.scheduler.unreserve(self.memory_quota);
        debug!("Yielded back box {}", self.box_id);
    }
}
