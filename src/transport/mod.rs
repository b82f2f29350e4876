//! Sensor-Bus Transport Layer
//!
//! Byte-exchange primitives for the AFE register protocol. Exactly one
//! transaction is ever in flight per bus; callers are released by the
//! peripheral's completion interrupt, not by polling.

pub mod completion;
pub mod spi;

pub use completion::Completion;
pub use spi::{SensorBus, SpimBus, TransportError};
