//! Link-Stack Event Model
//!
//! The connection-event notifier contract: connect/disconnect, attribute
//! writes, MTU updates, notification TX completion and incoming
//! handle-value notifications, plus the discovery-complete result consumed
//! by the central role. Whatever dispatches stack events (firmware glue or
//! a test harness) translates them into these types.

use defmt::Format;
use heapless::Vec;

/// Default ATT MTU before negotiation.
pub const ATT_MTU_DEFAULT: u16 = 23;

/// Largest ATT MTU the stack is configured for.
pub const ATT_MTU_MAX: u16 = 247;

/// Notification overhead: one opcode byte plus a two-byte attribute handle.
pub const ATT_NOTIFICATION_OVERHEAD: usize = 3;

/// Sentinel for an attribute handle that has not been resolved.
pub const ATT_HANDLE_INVALID: u16 = 0x0000;

/// Largest attribute payload carried inside an event.
pub const MAX_EVENT_DATA: usize = (ATT_MTU_MAX as usize) - ATT_NOTIFICATION_OVERHEAD;

/// Characteristics a discovery pass can report for one service.
pub const MAX_DISCOVERED_CHARS: usize = 8;

/// Events of interest dispatched from the link stack.
// No Format derive: the payload Vecs are not defmt-printable.
#[derive(Debug, Clone)]
pub enum BleEvent {
    Connected {
        conn_handle: u16,
    },
    Disconnected {
        conn_handle: u16,
    },
    /// A peer wrote one of our attributes (characteristic value or CCCD).
    GattsWrite {
        conn_handle: u16,
        handle: u16,
        data: Vec<u8, MAX_EVENT_DATA>,
    },
    /// ATT MTU negotiation finished; `effective_mtu` is the agreed value.
    MtuUpdated {
        conn_handle: u16,
        effective_mtu: u16,
    },
    /// Previously queued notifications left the stack's transmit buffer.
    HvnTxComplete {
        conn_handle: u16,
        count: u8,
    },
    /// Incoming handle-value notification (central role).
    Hvx {
        conn_handle: u16,
        handle: u16,
        data: Vec<u8, MAX_EVENT_DATA>,
    },
}

/// One characteristic found during service discovery.
#[derive(Debug, Clone, Copy, Format)]
pub struct DiscoveredCharacteristic {
    pub uuid16: u16,
    pub value_handle: u16,
    /// `ATT_HANDLE_INVALID` when the characteristic has no CCCD.
    pub cccd_handle: u16,
}

/// Result of a completed GATT discovery pass over one service.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub conn_handle: u16,
    pub service_uuid16: u16,
    pub characteristics: Vec<DiscoveredCharacteristic, MAX_DISCOVERED_CHARS>,
}
