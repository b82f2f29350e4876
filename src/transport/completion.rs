//! Single-Slot Completion Rendezvous
//!
//! Replaces the classic spin-until-interrupt-sets-a-flag pattern: the
//! interrupt context calls [`Completion::signal`], the task context awaits
//! [`Completion::wait`]. The slot latches, so a completion that lands just
//! before the waiter arrives is not lost.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

/// One-shot completion slot shared between an interrupt handler and a task.
///
/// `signal` is safe from interrupt context: it never blocks and never
/// allocates. Repeated signals before a wait collapse into one.
pub struct Completion {
    inner: Signal<CriticalSectionRawMutex, ()>,
}

impl Completion {
    pub const fn new() -> Self {
        Self { inner: Signal::new() }
    }

    /// Mark the operation complete. Callable from interrupt context.
    pub fn signal(&self) {
        self.inner.signal(());
    }

    /// Wait until the operation completes. Returns immediately if a
    /// completion is already latched, consuming it.
    pub async fn wait(&self) {
        self.inner.wait().await;
    }

    /// Drop any latched completion, e.g. when the producing context went
    /// away (disconnect) and a stale completion must not release the next
    /// waiter early.
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// True if a completion is latched and the next `wait` would not block.
    pub fn is_signaled(&self) -> bool {
        self.inner.signaled()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
