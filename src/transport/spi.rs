//! SPI Byte-Exchange Primitive
//!
//! The AFE register protocol runs over a shared SPI bus with one
//! chip-select line per device instance. The [`SensorBus`] trait is the
//! seam the register driver consumes; [`SpimBus`] is the on-target
//! implementation over the nRF SPIM peripheral.

use defmt::Format;
use embassy_nrf::gpio::Output;
use embassy_nrf::spim::{self, Spim};

/// Transport failures. These are propagated unchanged through the register
/// driver layer; retry policy, if any, lives at this layer and not above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum TransportError {
    /// The peripheral reported a transfer failure.
    Bus,
    /// The addressed chip-select index is not wired on this bus.
    UnknownDevice,
}

/// Full-duplex byte exchange with one device on the sensor bus.
///
/// The call returns once the peripheral's completion interrupt has fired.
/// Exactly one transaction is in flight per bus: `&mut self` makes a second
/// request wait for the first to finish. In-flight transfers cannot be
/// cancelled.
pub trait SensorBus {
    async fn transfer(
        &mut self,
        device: usize,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), TransportError>;
}

/// SPIM-backed sensor bus with one chip-select output per device.
///
/// The select line is asserted (low) around each transaction, mirroring the
/// per-instance slave-select handling of the board wiring.
pub struct SpimBus<'d, T: spim::Instance, const DEVICES: usize> {
    spim: Spim<'d, T>,
    cs: [Output<'d>; DEVICES],
}

impl<'d, T: spim::Instance, const DEVICES: usize> SpimBus<'d, T, DEVICES> {
    /// Wrap a configured SPIM instance. Chip-select outputs must be
    /// initialized high (deselected).
    pub fn new(spim: Spim<'d, T>, cs: [Output<'d>; DEVICES]) -> Self {
        Self { spim, cs }
    }
}

impl<'d, T: spim::Instance, const DEVICES: usize> SensorBus for SpimBus<'d, T, DEVICES> {
    async fn transfer(
        &mut self,
        device: usize,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), TransportError> {
        let cs = self.cs.get_mut(device).ok_or(TransportError::UnknownDevice)?;

        cs.set_low();
        let result = self.spim.transfer(rx, tx).await;
        cs.set_high();

        result.map_err(|_| TransportError::Bus)
    }
}
