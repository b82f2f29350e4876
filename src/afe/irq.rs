//! Data-Ready Interrupt Dispatch
//!
//! Maps the INTB line of each AFE instance to a registered completion slot.
//! The GPIO interrupt handler calls [`dispatch`] with the triggering pin;
//! dispatch does a linear scan over the registered instances and signals
//! the matching slot. Nothing here blocks or allocates, so the whole module
//! is safe to drive from interrupt context.

use defmt::{debug, warn, Format};

use crate::transport::Completion;

/// Number of AFE instances the registry can track.
pub const MAX_DEVICES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum RegistryError {
    /// Device index outside `0..MAX_DEVICES`.
    InvalidInstance,
    /// The slot for this instance is already taken; unregister first.
    AlreadyRegistered,
}

#[derive(Clone, Copy)]
struct Entry {
    pin: u8,
    slot: &'static Completion,
}

/// Registry from device instance to data-ready completion slot.
pub struct DataReadyRegistry {
    entries: [Option<Entry>; MAX_DEVICES],
}

impl DataReadyRegistry {
    pub const fn new() -> Self {
        Self { entries: [None; MAX_DEVICES] }
    }

    /// Wire `pin` to `slot` for the given device instance.
    pub fn register(
        &mut self,
        device: usize,
        pin: u8,
        slot: &'static Completion,
    ) -> Result<(), RegistryError> {
        let entry = self.entries.get_mut(device).ok_or(RegistryError::InvalidInstance)?;
        if entry.is_some() {
            return Err(RegistryError::AlreadyRegistered);
        }
        *entry = Some(Entry { pin, slot });
        debug!("IRQ: device {} registered on pin {}", device, pin);
        Ok(())
    }

    /// Remove the registration for a device instance. Idempotent.
    pub fn unregister(&mut self, device: usize) {
        if let Some(entry) = self.entries.get_mut(device) {
            *entry = None;
        }
    }

    /// Signal the slot of every instance wired to `pin`.
    /// O(number of instances); interrupt-context safe.
    pub fn dispatch(&self, pin: u8) -> bool {
        let mut matched = false;
        for entry in self.entries.iter().flatten() {
            if entry.pin == pin {
                entry.slot.signal();
                matched = true;
            }
        }
        matched
    }

    pub fn registered_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}

static mut REGISTRY: DataReadyRegistry = DataReadyRegistry::new();

/// Access the global registry.
///
/// Runs with interrupts masked so registration from task context cannot
/// race a dispatch from interrupt context.
pub fn with_registry<F, R>(f: F) -> R
where
    F: FnOnce(&mut DataReadyRegistry) -> R,
{
    cortex_m::interrupt::free(|_cs| unsafe { f(&mut *core::ptr::addr_of_mut!(REGISTRY)) })
}

/// Entry point for the GPIO interrupt handler.
pub fn dispatch(pin: u8) {
    let matched = with_registry(|registry| registry.dispatch(pin));
    if !matched {
        warn!("IRQ: no handler registered for pin {}", pin);
    }
}
