//! Serialized GATT Client Operation Queue
//!
//! The stack forbids overlapping GATT transactions on one link, so client
//! writes (CCCD subscriptions included) go through this queue: requests are
//! started in arrival order, at most one in flight per connection, and the
//! next one is released only by [`GattOpQueue::on_write_complete`].

use defmt::{debug, warn, Format};
use heapless::Vec;

/// Queued-but-not-started requests the queue can hold.
pub const MAX_QUEUED_OPS: usize = 4;

/// Connections tracked for the one-in-flight rule.
pub const MAX_LINKS: usize = 2;

/// Largest write payload a queued request carries.
pub const MAX_WRITE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWriteRequest {
    pub conn_handle: u16,
    pub att_handle: u16,
    pub value: Vec<u8, MAX_WRITE_LEN>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum QueueError {
    Full,
}

pub struct GattOpQueue {
    pending: Vec<GattWriteRequest, MAX_QUEUED_OPS>,
    /// Connections with an operation currently in flight.
    busy: Vec<u16, MAX_LINKS>,
}

impl GattOpQueue {
    pub const fn new() -> Self {
        Self { pending: Vec::new(), busy: Vec::new() }
    }

    /// Queue a write request behind any already-pending work.
    pub fn enqueue(&mut self, request: GattWriteRequest) -> Result<(), QueueError> {
        self.pending.push(request).map_err(|_| {
            warn!("gatt queue: full, request dropped");
            QueueError::Full
        })
    }

    /// Release the next startable request: the oldest pending write whose
    /// connection has nothing in flight. The caller issues it against the
    /// stack and reports back via [`Self::on_write_complete`].
    pub fn start_next(&mut self) -> Option<GattWriteRequest> {
        let at = self
            .pending
            .iter()
            .position(|request| !self.busy.contains(&request.conn_handle))?;

        let request = self.pending.remove(at);
        // MAX_LINKS bounds distinct in-flight connections, so this cannot fail
        let _ = self.busy.push(request.conn_handle);

        debug!(
            "gatt queue: starting write to handle {} on conn {}",
            request.att_handle, request.conn_handle
        );
        Some(request)
    }

    /// The stack finished the in-flight operation on `conn_handle`.
    pub fn on_write_complete(&mut self, conn_handle: u16) {
        self.busy.retain(|&handle| handle != conn_handle);
    }

    /// Drop all state tied to a closed connection, queued and in flight.
    pub fn on_disconnect(&mut self, conn_handle: u16) {
        self.pending.retain(|request| request.conn_handle != conn_handle);
        self.busy.retain(|&handle| handle != conn_handle);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.busy.is_empty()
    }
}

impl Default for GattOpQueue {
    fn default() -> Self {
        Self::new()
    }
}
