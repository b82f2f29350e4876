//! BLE Protocol Implementation
//!
//! Contains the GATT biosignal measurement service (peripheral role), the
//! heart-rate variant, and the central-role client with its serialized
//! GATT operation queue. The link stack itself is consumed through the
//! primitives in [`stack`].

pub mod biosig_service;
pub mod client;
pub mod events;
pub mod gatt_queue;
pub mod heart_rate;
pub mod measurement;
pub mod stack;

use defmt::Format;

use self::stack::{HvxError, RegisterError};

/// Service-level failures shared by the measurement services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum ServiceError {
    /// Service or characteristic registration failed. Fatal at init; the
    /// first failure aborts the sequence with no compensating teardown.
    Register(RegisterError),
    /// No active connection. Non-fatal; retry after the next connect.
    InvalidState,
    /// The stack accepted fewer bytes than requested. Non-fatal; the
    /// caller logs and counts it.
    DataSizeMismatch,
    /// Notification-send failure other than the flow-controlled cases.
    Hvx(HvxError),
}

/// Successful send outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum SendStatus {
    Sent,
    /// The stack ran out of transmit buffers; the send went through after
    /// one bounded retry, but the producer must flush its sensor backlog
    /// instead of falling further behind.
    FlushNeeded,
}
